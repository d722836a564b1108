use std::hint::black_box;
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion};
use inkpad_collab::broadcast::BroadcastGroup;
use inkpad_collab::client::OfflineQueue;
use inkpad_collab::presence::{color_for, PresenceRoom};
use inkpad_collab::protocol::{ParticipantInfo, RelayMessage};
use inkpad_collab::storage::{RocksRepository, StoreConfig};
use inkpad_core::{ReplicaId, SelectionAnchors, TextEngine};
use uuid::Uuid;

fn typical_update() -> Vec<u8> {
    let mut engine = TextEngine::from_text(ReplicaId::from_u64(1), "hello world");
    engine.insert(5, ",").encode().unwrap()
}

fn bench_update_encode(c: &mut Criterion) {
    let from = Some(Uuid::new_v4());
    let update = typical_update();

    c.bench_function("sync_update_encode", |b| {
        b.iter(|| {
            let msg = RelayMessage::SyncUpdate {
                from: black_box(from),
                update: black_box(update.clone()),
            };
            black_box(msg.encode().unwrap());
        })
    });
}

fn bench_update_decode(c: &mut Criterion) {
    let encoded = RelayMessage::SyncUpdate {
        from: Some(Uuid::new_v4()),
        update: typical_update(),
    }
    .encode()
    .unwrap();

    c.bench_function("sync_update_decode", |b| {
        b.iter(|| {
            black_box(RelayMessage::decode(black_box(&encoded)).unwrap());
        })
    });
}

fn bench_cursor_encode(c: &mut Criterion) {
    let engine = TextEngine::from_text(ReplicaId::from_u64(1), "some text to point into");
    let selection = SelectionAnchors::capture(&engine, 5, 9);
    let from = Some(Uuid::new_v4());

    c.bench_function("cursor_move_encode", |b| {
        b.iter(|| {
            let msg = RelayMessage::CursorMove {
                from,
                selection: black_box(selection),
            };
            black_box(msg.encode().unwrap());
        })
    });
}

fn bench_broadcast_100_receivers(c: &mut Criterion) {
    let group = BroadcastGroup::new(1024);
    let receivers: Vec<_> = (0..100).map(|_| group.subscribe()).collect();
    let frame = Arc::new(vec![0u8; 64]);

    c.bench_function("broadcast_raw_100_receivers", |b| {
        b.iter(|| {
            black_box(group.broadcast_raw(None, black_box(frame.clone())));
        })
    });
    drop(receivers);
}

fn bench_broadcast_drain_1000(c: &mut Criterion) {
    c.bench_function("broadcast_1000_msgs_10_receivers", |b| {
        b.iter(|| {
            let group = BroadcastGroup::new(2048);
            let mut receivers: Vec<_> = (0..10).map(|_| group.subscribe()).collect();
            let frame = Arc::new(vec![0u8; 64]);
            for _ in 0..1000 {
                group.broadcast_raw(None, frame.clone());
            }
            for rx in &mut receivers {
                while let Ok(out) = rx.try_recv() {
                    black_box(out);
                }
            }
        })
    });
}

fn bench_offline_queue(c: &mut Criterion) {
    c.bench_function("offline_queue_1000_updates", |b| {
        b.iter(|| {
            let mut queue = OfflineQueue::new(1000);
            for _ in 0..1000 {
                queue.enqueue(vec![0u8; 32]);
            }
            black_box(queue.drain());
        })
    });
}

fn bench_resolve_cursors(c: &mut Criterion) {
    let mut engine = TextEngine::new(ReplicaId::from_u64(1));
    for _ in 0..100 {
        let end = engine.len();
        engine.insert(end, "lorem ipsum dolor sit amet ");
    }
    let mut room = PresenceRoom::new();
    let participants: Vec<_> = (0..50).map(|_| ParticipantInfo::new(Uuid::new_v4(), None, None)).collect();
    for (i, p) in participants.iter().enumerate() {
        room.set_cursor(p.participant_id, SelectionAnchors::capture(&engine, i * 40, i * 40 + 5));
    }
    room.set_participants(participants);

    c.bench_function("resolve_50_cursors_2700_chars", |b| {
        b.iter(|| {
            black_box(room.resolve_all(black_box(&engine)));
        })
    });
}

fn bench_color_for(c: &mut Criterion) {
    let id = Uuid::new_v4().to_string();
    c.bench_function("color_for_uuid", |b| {
        b.iter(|| {
            black_box(color_for(black_box(&id)));
        })
    });
}

fn bench_save_text(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let repo = RocksRepository::open(StoreConfig::for_testing(dir.path())).unwrap();
    repo.create("bench", "Bench").unwrap();
    let text = "the quick brown fox jumps over the lazy dog\n".repeat(100);

    c.bench_function("rocks_save_text_4kb", |b| {
        b.iter(|| {
            black_box(repo.save_text("bench", black_box(&text)).unwrap());
        })
    });
}

fn bench_load_document(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let repo = RocksRepository::open(StoreConfig::for_testing(dir.path())).unwrap();
    repo.create("bench", "Bench").unwrap();
    repo.save_text("bench", &"lorem ipsum ".repeat(400)).unwrap();

    c.bench_function("rocks_load_document_4kb", |b| {
        b.iter(|| {
            black_box(repo.load(black_box("bench")).unwrap());
        })
    });
}

criterion_group!(
    benches,
    bench_update_encode,
    bench_update_decode,
    bench_cursor_encode,
    bench_broadcast_100_receivers,
    bench_broadcast_drain_1000,
    bench_offline_queue,
    bench_resolve_cursors,
    bench_color_for,
    bench_save_text,
    bench_load_document,
);
criterion_main!(benches);
