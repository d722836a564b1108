//! RocksDB-backed document repository.
//!
//! Column families:
//! - `documents` — materialized text (LZ4 compressed), keyed by short id
//! - `metadata`  — title, attachment list and sizes (bincode), keyed by short id
//!
//! A document exists iff it has a `metadata` record. Text and metadata
//! for one save are written in a single atomic batch.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};

use super::{DocumentRepository, SaveOutcome, StoreError, StoredDocument};
use crate::protocol::Attachment;

const CF_DOCUMENTS: &str = "documents";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("inkpad_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches for tests.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Per-document record in the `metadata` column family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub title: String,
    pub attachments: Vec<Attachment>,
    /// Uncompressed text size in bytes
    pub text_size: u64,
    /// Compressed text size in bytes
    pub compressed_size: u64,
    /// Seconds since epoch
    pub created_at: u64,
    pub updated_at: u64,
}

impl DocumentMetadata {
    fn new(title: &str) -> Self {
        let now = now_secs();
        Self {
            title: title.to_string(),
            attachments: Vec::new(),
            text_size: 0,
            compressed_size: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(meta)
    }
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// RocksDB-backed repository.
///
/// Calls are made inline from async code; each is a point lookup or a
/// small batch write.
pub struct RocksRepository {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksRepository {
    /// Open (or create) the database at the configured path.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);
        opts.set_max_write_buffer_number(2);

        match name {
            // Values are already LZ4 framed.
            CF_DOCUMENTS => opts.set_compression_type(DBCompressionType::None),
            _ => opts.set_compression_type(DBCompressionType::Lz4),
        }
        opts.optimize_for_point_lookup(config.block_cache_size as u64);
        opts
    }

    // ─── Documents ────────────────────────────────────────────────────

    pub fn load(&self, short_id: &str) -> Result<Option<StoredDocument>, StoreError> {
        let Some(meta) = self.metadata(short_id)? else {
            return Ok(None);
        };
        let text = match self.db.get_cf(self.cf(CF_DOCUMENTS)?, short_id.as_bytes())? {
            Some(compressed) => decompress_text(&compressed)?,
            None => String::new(),
        };
        Ok(Some(StoredDocument {
            text,
            title: meta.title,
            attachments: meta.attachments,
        }))
    }

    pub fn create(&self, short_id: &str, title: &str) -> Result<StoredDocument, StoreError> {
        if let Some(existing) = self.load(short_id)? {
            return Ok(existing);
        }
        let meta = DocumentMetadata::new(title);
        self.db
            .put_cf_opt(self.cf(CF_METADATA)?, short_id.as_bytes(), meta.encode()?, &self.write_opts())?;
        log::debug!("Created document {short_id}");
        Ok(StoredDocument {
            text: String::new(),
            title: meta.title,
            attachments: meta.attachments,
        })
    }

    pub fn save_text(&self, short_id: &str, text: &str) -> Result<SaveOutcome, StoreError> {
        let Some(mut meta) = self.metadata(short_id)? else {
            return Ok(SaveOutcome::NotFound);
        };
        let compressed = lz4_flex::compress_prepend_size(text.as_bytes());
        meta.text_size = text.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.updated_at = now_secs();

        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_DOCUMENTS)?, short_id.as_bytes(), &compressed);
        batch.put_cf(self.cf(CF_METADATA)?, short_id.as_bytes(), meta.encode()?);
        self.db.write_opt(batch, &self.write_opts())?;
        Ok(SaveOutcome::Saved)
    }

    pub fn save_title(&self, short_id: &str, title: &str) -> Result<SaveOutcome, StoreError> {
        self.update_metadata(short_id, |meta| meta.title = title.to_string())
    }

    pub fn save_attachments(&self, short_id: &str, attachments: &[Attachment]) -> Result<SaveOutcome, StoreError> {
        self.update_metadata(short_id, |meta| meta.attachments = attachments.to_vec())
    }

    /// Remove a document entirely. Returns whether it existed.
    pub fn delete_document(&self, short_id: &str) -> Result<bool, StoreError> {
        if self.metadata(short_id)?.is_none() {
            return Ok(false);
        }
        let mut batch = WriteBatch::default();
        batch.delete_cf(self.cf(CF_DOCUMENTS)?, short_id.as_bytes());
        batch.delete_cf(self.cf(CF_METADATA)?, short_id.as_bytes());
        self.db.write_opt(batch, &self.write_opts())?;
        Ok(true)
    }

    pub fn metadata(&self, short_id: &str) -> Result<Option<DocumentMetadata>, StoreError> {
        match self.db.get_cf(self.cf(CF_METADATA)?, short_id.as_bytes())? {
            Some(bytes) => DocumentMetadata::decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Short ids of every stored document.
    pub fn list_documents(&self) -> Result<Vec<String>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut ids = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            match String::from_utf8(key.to_vec()) {
                Ok(id) => ids.push(id),
                Err(_) => log::warn!("Skipping non-UTF-8 document key"),
            }
        }
        Ok(ids)
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn update_metadata<F>(&self, short_id: &str, apply: F) -> Result<SaveOutcome, StoreError>
    where
        F: FnOnce(&mut DocumentMetadata),
    {
        let Some(mut meta) = self.metadata(short_id)? else {
            return Ok(SaveOutcome::NotFound);
        };
        apply(&mut meta);
        meta.updated_at = now_secs();
        self.db
            .put_cf_opt(self.cf(CF_METADATA)?, short_id.as_bytes(), meta.encode()?, &self.write_opts())?;
        Ok(SaveOutcome::Saved)
    }

    fn write_opts(&self) -> WriteOptions {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        write_opts
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }
}

fn decompress_text(compressed: &[u8]) -> Result<String, StoreError> {
    let bytes = lz4_flex::decompress_size_prepended(compressed)
        .map_err(|e| StoreError::CompressionError(e.to_string()))?;
    String::from_utf8(bytes).map_err(|e| StoreError::DeserializationError(e.to_string()))
}

/// Number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[async_trait]
impl DocumentRepository for RocksRepository {
    async fn load_document(&self, short_id: &str) -> Result<Option<StoredDocument>, StoreError> {
        self.load(short_id)
    }

    async fn create_document(&self, short_id: &str, title: &str) -> Result<StoredDocument, StoreError> {
        self.create(short_id, title)
    }

    async fn save_document_text(&self, short_id: &str, text: &str) -> Result<SaveOutcome, StoreError> {
        self.save_text(short_id, text)
    }

    async fn save_title(&self, short_id: &str, title: &str) -> Result<SaveOutcome, StoreError> {
        RocksRepository::save_title(self, short_id, title)
    }

    async fn save_attachments(
        &self,
        short_id: &str,
        attachments: &[Attachment],
    ) -> Result<SaveOutcome, StoreError> {
        RocksRepository::save_attachments(self, short_id, attachments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, RocksRepository) {
        let dir = tempfile::tempdir().unwrap();
        let repo = RocksRepository::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
        (dir, repo)
    }

    #[test]
    fn test_open_creates_directory() {
        let (_dir, repo) = open_temp();
        assert!(repo.path().exists());
        assert!(repo.list_documents().unwrap().is_empty());
    }

    #[test]
    fn test_create_then_load() {
        let (_dir, repo) = open_temp();
        assert!(repo.load("abc").unwrap().is_none());

        let created = repo.create("abc", "Untitled").unwrap();
        assert_eq!(created.title, "Untitled");
        assert_eq!(created.text, "");

        let loaded = repo.load("abc").unwrap().unwrap();
        assert_eq!(loaded, created);
    }

    #[test]
    fn test_save_text_roundtrip() {
        let (_dir, repo) = open_temp();
        repo.create("abc", "Notes").unwrap();
        let text = "héllo wörld\n".repeat(500);
        assert_eq!(repo.save_text("abc", &text).unwrap(), SaveOutcome::Saved);

        let loaded = repo.load("abc").unwrap().unwrap();
        assert_eq!(loaded.text, text);
        assert_eq!(loaded.title, "Notes");

        let meta = repo.metadata("abc").unwrap().unwrap();
        assert_eq!(meta.text_size, text.len() as u64);
        assert!(meta.compressed_size < meta.text_size);
        assert!(meta.updated_at >= meta.created_at);
    }

    #[test]
    fn test_save_missing_is_not_found() {
        let (_dir, repo) = open_temp();
        assert_eq!(repo.save_text("nope", "x").unwrap(), SaveOutcome::NotFound);
        assert_eq!(repo.save_title("nope", "x").unwrap(), SaveOutcome::NotFound);
        assert_eq!(repo.save_attachments("nope", &[]).unwrap(), SaveOutcome::NotFound);
        assert!(repo.load("nope").unwrap().is_none());
    }

    #[test]
    fn test_title_and_attachments() {
        let (_dir, repo) = open_temp();
        repo.create("abc", "Untitled").unwrap();
        repo.save_text("abc", "body").unwrap();
        repo.save_title("abc", "Renamed").unwrap();
        let image = Attachment {
            id: "img1".into(),
            url: "/uploads/img1.png".into(),
            x: 12.5,
            y: 40.0,
            width: 320.0,
            height: 240.0,
        };
        repo.save_attachments("abc", &[image.clone()]).unwrap();

        let loaded = repo.load("abc").unwrap().unwrap();
        assert_eq!(loaded.title, "Renamed");
        assert_eq!(loaded.text, "body");
        assert_eq!(loaded.attachments, vec![image]);
    }

    #[test]
    fn test_delete_document() {
        let (_dir, repo) = open_temp();
        repo.create("abc", "t").unwrap();
        repo.save_text("abc", "body").unwrap();

        assert!(repo.delete_document("abc").unwrap());
        assert!(!repo.delete_document("abc").unwrap());
        assert!(repo.load("abc").unwrap().is_none());
        assert_eq!(repo.save_text("abc", "late").unwrap(), SaveOutcome::NotFound);
    }

    #[test]
    fn test_reopen_persists() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::for_testing(dir.path().join("db"));
        {
            let repo = RocksRepository::open(config.clone()).unwrap();
            repo.create("one", "First").unwrap();
            repo.save_text("one", "persisted").unwrap();
            repo.create("two", "Second").unwrap();
        }
        let repo = RocksRepository::open(config).unwrap();
        assert_eq!(repo.load("one").unwrap().unwrap().text, "persisted");
        let mut ids = repo.list_documents().unwrap();
        ids.sort();
        assert_eq!(ids, vec!["one".to_string(), "two".to_string()]);
    }

    #[test]
    fn test_store_config_default() {
        let config = StoreConfig::default();
        assert_eq!(config.bloom_filter_bits, 10);
        assert!(!config.sync_writes);
        assert_eq!(config.path, PathBuf::from("inkpad_data"));
    }
}
