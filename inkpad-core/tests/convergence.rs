//! Multi-replica convergence tests.
//!
//! Replicas exchange encoded updates in different orders (with duplicates)
//! and must always end up with identical text.

use inkpad_core::{from_anchor, to_anchor, ReplicaId, TextEngine};

fn replica(id: u64) -> TextEngine {
    TextEngine::new(ReplicaId::from_u64(id))
}

/// Deterministic xorshift so the interleavings are reproducible.
struct Rng(u64);

impl Rng {
    fn next(&mut self) -> u64 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        self.0
    }

    fn below(&mut self, n: usize) -> usize {
        if n == 0 {
            0
        } else {
            (self.next() % n as u64) as usize
        }
    }
}

#[test]
fn test_concurrent_inserts_converge_in_any_order() {
    let mut a = replica(1);
    let mut b = replica(2);
    let ua = a.insert(0, "a").encode().unwrap();
    let ub = b.insert(0, "b").encode().unwrap();

    let mut x = replica(3);
    x.apply_remote_update(&ua).unwrap();
    x.apply_remote_update(&ub).unwrap();

    let mut y = replica(4);
    y.apply_remote_update(&ub).unwrap();
    y.apply_remote_update(&ua).unwrap();
    y.apply_remote_update(&ua).unwrap();

    assert_eq!(x.materialize(), y.materialize());
    assert_eq!(x.materialize().len(), 2);
}

#[test]
fn test_three_way_concurrent_editing() {
    let mut replicas = vec![replica(1), replica(2), replica(3)];
    let base = replicas[0].insert(0, "The fox").encode().unwrap();
    for r in replicas.iter_mut().skip(1) {
        r.apply_remote_update(&base).unwrap();
    }

    let u0 = replicas[0].insert(4, "quick ").encode().unwrap();
    let u1 = replicas[1].insert(4, "brown ").encode().unwrap();
    let u2 = replicas[2].delete(0, 4).encode().unwrap();
    let updates = [u0, u1, u2];

    for (i, r) in replicas.iter_mut().enumerate() {
        for (j, u) in updates.iter().enumerate().rev() {
            if i != j {
                r.apply_remote_update(u).unwrap();
            }
        }
    }

    let text = replicas[0].materialize();
    assert!(replicas.iter().all(|r| r.materialize() == text));
    assert!(text.contains("quick "));
    assert!(text.contains("brown "));
    assert!(text.ends_with("fox"));
    assert!(!text.starts_with("The"));
}

#[test]
fn test_randomized_interleaving_converges() {
    let mut rng = Rng(0x9E37_79B9_7F4A_7C15);
    let mut replicas: Vec<TextEngine> = (1..=3).map(replica).collect();
    let mut log: Vec<Vec<u8>> = Vec::new();
    let mut delivered = vec![0usize; replicas.len()];

    for _ in 0..500 {
        let who = rng.below(replicas.len());
        let r = &mut replicas[who];

        let update = if r.len() > 0 && rng.below(3) == 0 {
            let offset = rng.below(r.len());
            r.delete(offset, 1 + rng.below(3))
        } else {
            let offset = rng.below(r.len() + 1);
            let ch = (b'a' + rng.below(26) as u8) as char;
            r.insert(offset, &ch.to_string())
        };
        if !update.is_empty() {
            log.push(update.encode().unwrap());
        }

        // Each replica catches up on a random prefix of the log.
        let catch_up = rng.below(replicas.len());
        let upto = log.len();
        for u in &log[delivered[catch_up]..upto] {
            replicas[catch_up].apply_remote_update(u).unwrap();
        }
        delivered[catch_up] = upto;
    }

    for (i, r) in replicas.iter_mut().enumerate() {
        for u in &log[delivered[i]..] {
            r.apply_remote_update(u).unwrap();
        }
    }

    let text = replicas[0].materialize();
    for r in &replicas {
        assert_eq!(r.materialize(), text);
        assert_eq!(r.pending_len(), 0);
    }

    // A late joiner rebuilt from a snapshot matches too.
    let snapshot = replicas[1].encode_full_state().unwrap();
    let joiner = TextEngine::decode_full_state(ReplicaId::from_u64(99), &snapshot).unwrap();
    assert_eq!(joiner.materialize(), text);
}

#[test]
fn test_reverse_delivery_converges() {
    let mut author = replica(1);
    let mut updates = Vec::new();
    for word in ["alpha ", "beta ", "gamma "] {
        let end = author.len();
        updates.push(author.insert(end, word).encode().unwrap());
    }
    updates.push(author.delete(0, 6).encode().unwrap());

    let mut reader = replica(2);
    for u in updates.iter().rev() {
        reader.apply_remote_update(u).unwrap();
    }
    assert_eq!(reader.materialize(), "beta gamma ");
    assert_eq!(reader.pending_len(), 0);
}

#[test]
fn test_anchor_tracks_concurrent_edits() {
    let mut local = replica(1);
    let seed = local.insert(0, "abcdef").encode().unwrap();
    let mut remote = replica(2);
    remote.apply_remote_update(&seed).unwrap();

    let caret = to_anchor(&local, 3);
    let edit = remote.insert(0, "XYZ").encode().unwrap();
    local.apply_remote_update(&edit).unwrap();
    assert_eq!(from_anchor(&local, &caret), Some(6));
}

#[test]
fn test_malformed_update_does_not_corrupt_replica() {
    let mut doc = replica(1);
    doc.insert(0, "stable");
    let before = doc.encode_full_state().unwrap();

    let mut valid = replica(2).insert(0, "x").encode().unwrap();
    valid.truncate(valid.len() - 1);
    assert!(doc.apply_remote_update(&valid).is_err());
    assert!(doc.apply_remote_update(&[]).is_err());

    assert_eq!(doc.materialize(), "stable");
    assert_eq!(doc.encode_full_state().unwrap(), before);
}
