//! In-memory repository, used when no storage path is configured and in tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{DocumentRepository, SaveOutcome, StoreError, StoredDocument};
use crate::protocol::Attachment;

#[derive(Default)]
pub struct MemoryRepository {
    documents: Mutex<HashMap<String, StoredDocument>>,
    text_writes: AtomicU64,
    fail_writes: AtomicBool,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, short_id: &str, document: StoredDocument) {
        self.documents
            .lock()
            .await
            .insert(short_id.to_string(), document);
    }

    pub async fn get(&self, short_id: &str) -> Option<StoredDocument> {
        self.documents.lock().await.get(short_id).cloned()
    }

    /// Delete a document, as the CRUD API would.
    pub async fn remove(&self, short_id: &str) -> Option<StoredDocument> {
        self.documents.lock().await.remove(short_id)
    }

    /// Number of successful text saves.
    pub fn text_writes(&self) -> u64 {
        self.text_writes.load(Ordering::SeqCst)
    }

    /// Make every save fail with an I/O error until switched off.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::IoError("storage unavailable".into()));
        }
        Ok(())
    }

    async fn update<F>(&self, short_id: &str, apply: F) -> Result<SaveOutcome, StoreError>
    where
        F: FnOnce(&mut StoredDocument) + Send,
    {
        self.check_writable()?;
        let mut documents = self.documents.lock().await;
        match documents.get_mut(short_id) {
            Some(document) => {
                apply(document);
                Ok(SaveOutcome::Saved)
            }
            None => Ok(SaveOutcome::NotFound),
        }
    }
}

#[async_trait]
impl DocumentRepository for MemoryRepository {
    async fn load_document(&self, short_id: &str) -> Result<Option<StoredDocument>, StoreError> {
        Ok(self.get(short_id).await)
    }

    async fn create_document(&self, short_id: &str, title: &str) -> Result<StoredDocument, StoreError> {
        self.check_writable()?;
        let mut documents = self.documents.lock().await;
        let document = documents
            .entry(short_id.to_string())
            .or_insert_with(|| StoredDocument {
                title: title.to_string(),
                ..StoredDocument::default()
            });
        Ok(document.clone())
    }

    async fn save_document_text(&self, short_id: &str, text: &str) -> Result<SaveOutcome, StoreError> {
        let outcome = self
            .update(short_id, |document| document.text = text.to_string())
            .await?;
        if outcome == SaveOutcome::Saved {
            self.text_writes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(outcome)
    }

    async fn save_title(&self, short_id: &str, title: &str) -> Result<SaveOutcome, StoreError> {
        self.update(short_id, |document| document.title = title.to_string())
            .await
    }

    async fn save_attachments(
        &self,
        short_id: &str,
        attachments: &[Attachment],
    ) -> Result<SaveOutcome, StoreError> {
        let attachments = attachments.to_vec();
        self.update(short_id, move |document| document.attachments = attachments)
            .await
    }
}
