//! Chunked item storage for [`TextEngine`](crate::TextEngine).
//!
//! ```text
//!   order:  [ blk 0 ][ blk 3 ][ blk 1 ][ blk 2 ]      document order of block keys
//!   tree:   Fenwick sums of visible items per rank    offset  -> block
//!   index:  replica -> counter -> block key           item id -> block
//! ```
//!
//! Items live in blocks of at most [`MAX_BLOCK`] entries, so inserting one
//! shifts at most a block's worth of items. Locating an item by id or by
//! visible offset costs O(log n) plus a scan of one block.

use std::collections::{BTreeMap, HashMap};

use crate::id::{ItemId, ReplicaId};

/// A block is split in half once it grows past this many items.
const MAX_BLOCK: usize = 128;

#[derive(Debug, Clone)]
pub(crate) struct Item {
    pub id: ItemId,
    pub origin: Option<ItemId>,
    pub ch: char,
    pub deleted: bool,
}

/// A slot in the sequence: block rank in document order, then index in the
/// block. `slot == block length` addresses the end of that block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Pos {
    pub rank: usize,
    pub slot: usize,
}

#[derive(Debug, Clone, Default)]
struct Block {
    items: Vec<Item>,
    visible: usize,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct Sequence {
    /// Blocks by key; a key never changes once assigned
    blocks: Vec<Block>,
    /// Block keys in document order
    order: Vec<usize>,
    /// Rank in `order` of each block key
    rank: Vec<usize>,
    /// 1-based Fenwick tree over per-rank visible counts
    tree: Vec<usize>,
    index: HashMap<ReplicaId, BTreeMap<u64, usize>>,
    visible: usize,
}

impl Sequence {
    /// Number of visible items.
    pub fn visible(&self) -> usize {
        self.visible
    }

    pub fn contains(&self, id: ItemId) -> bool {
        self.index
            .get(&id.replica)
            .is_some_and(|counters| counters.contains_key(&id.counter))
    }

    /// Known counters of `replica` in `[start, end)`, ascending.
    pub fn counters_in(&self, replica: ReplicaId, start: u64, end: u64) -> Vec<u64> {
        match self.index.get(&replica) {
            Some(counters) if start < end => counters.range(start..end).map(|(c, _)| *c).collect(),
            _ => Vec::new(),
        }
    }

    /// All items in document order, tombstones included.
    pub fn iter(&self) -> impl Iterator<Item = &Item> {
        self.order
            .iter()
            .flat_map(move |&key| self.blocks[key].items.iter())
    }

    pub fn get(&self, pos: Pos) -> Option<&Item> {
        self.order
            .get(pos.rank)
            .and_then(|&key| self.blocks[key].items.get(pos.slot))
    }

    pub fn find(&self, id: ItemId) -> Option<Pos> {
        let key = *self.index.get(&id.replica)?.get(&id.counter)?;
        let slot = self.blocks[key].items.iter().position(|item| item.id == id)?;
        Some(Pos {
            rank: self.rank[key],
            slot,
        })
    }

    /// Position of the visible item at `offset`.
    pub fn nth_visible(&self, offset: usize) -> Option<Pos> {
        if offset >= self.visible {
            return None;
        }
        let (rank, mut remaining) = self.tree_find(offset);
        let block = &self.blocks[self.order[rank]];
        for (slot, item) in block.items.iter().enumerate() {
            if item.deleted {
                continue;
            }
            if remaining == 0 {
                return Some(Pos { rank, slot });
            }
            remaining -= 1;
        }
        None
    }

    /// Number of visible items before `pos`.
    pub fn visible_before(&self, pos: Pos) -> usize {
        let Some(&key) = self.order.get(pos.rank) else {
            return self.visible;
        };
        let items = &self.blocks[key].items;
        let in_block = items[..pos.slot.min(items.len())]
            .iter()
            .filter(|item| !item.deleted)
            .count();
        self.tree_prefix(pos.rank) + in_block
    }

    /// First slot of the document.
    pub fn start(&self) -> Pos {
        self.normalize(Pos { rank: 0, slot: 0 })
    }

    /// Slot past the last item.
    pub fn end(&self) -> Pos {
        match self.order.last() {
            Some(&key) => Pos {
                rank: self.order.len() - 1,
                slot: self.blocks[key].items.len(),
            },
            None => Pos { rank: 0, slot: 0 },
        }
    }

    /// The slot right after `pos`.
    pub fn after(&self, pos: Pos) -> Pos {
        self.normalize(Pos {
            rank: pos.rank,
            slot: pos.slot + 1,
        })
    }

    /// Move an end-of-block slot onto the start of the next block.
    fn normalize(&self, mut pos: Pos) -> Pos {
        while pos.rank + 1 < self.order.len() && pos.slot >= self.blocks[self.order[pos.rank]].items.len() {
            pos = Pos {
                rank: pos.rank + 1,
                slot: 0,
            };
        }
        pos
    }

    /// Insert `item` at `pos`; returns where it ended up.
    pub fn insert(&mut self, pos: Pos, item: Item) -> Pos {
        if self.order.is_empty() {
            self.blocks.push(Block::default());
            self.order.push(self.blocks.len() - 1);
            self.rebuild();
        }
        let rank = pos.rank.min(self.order.len() - 1);
        let key = self.order[rank];
        let visible = !item.deleted;
        self.index
            .entry(item.id.replica)
            .or_default()
            .insert(item.id.counter, key);

        let block = &mut self.blocks[key];
        let slot = pos.slot.min(block.items.len());
        block.items.insert(slot, item);
        if visible {
            block.visible += 1;
            self.visible += 1;
            self.tree_add(rank, 1);
        }

        if self.blocks[key].items.len() > MAX_BLOCK {
            self.split(rank, slot)
        } else {
            Pos { rank, slot }
        }
    }

    /// Tombstone the item at `pos`. Returns `false` if it already was.
    pub fn delete(&mut self, pos: Pos) -> bool {
        let Some(&key) = self.order.get(pos.rank) else {
            return false;
        };
        let block = &mut self.blocks[key];
        match block.items.get_mut(pos.slot) {
            Some(item) if !item.deleted => item.deleted = true,
            _ => return false,
        }
        block.visible -= 1;
        self.visible -= 1;
        self.tree_add(pos.rank, -1);
        true
    }

    /// Split the block at `rank` in half, keeping track of `slot`.
    fn split(&mut self, rank: usize, slot: usize) -> Pos {
        let key = self.order[rank];
        let mid = self.blocks[key].items.len() / 2;
        let tail = self.blocks[key].items.split_off(mid);
        let moved = tail.iter().filter(|item| !item.deleted).count();
        self.blocks[key].visible -= moved;

        let new_key = self.blocks.len();
        for item in &tail {
            if let Some(entry) = self
                .index
                .get_mut(&item.id.replica)
                .and_then(|counters| counters.get_mut(&item.id.counter))
            {
                *entry = new_key;
            }
        }
        self.blocks.push(Block {
            items: tail,
            visible: moved,
        });
        self.order.insert(rank + 1, new_key);
        self.rebuild();

        if slot < mid {
            Pos { rank, slot }
        } else {
            Pos {
                rank: rank + 1,
                slot: slot - mid,
            }
        }
    }

    /// Recompute ranks and the Fenwick tree after the block order changed.
    fn rebuild(&mut self) {
        self.rank.resize(self.blocks.len(), 0);
        for (rank, &key) in self.order.iter().enumerate() {
            self.rank[key] = rank;
        }

        let n = self.order.len();
        self.tree = vec![0; n + 1];
        for i in 1..=n {
            self.tree[i] += self.blocks[self.order[i - 1]].visible;
            let parent = i + (i & i.wrapping_neg());
            if parent <= n {
                self.tree[parent] += self.tree[i];
            }
        }
    }

    fn tree_add(&mut self, rank: usize, delta: isize) {
        let mut i = rank + 1;
        while i < self.tree.len() {
            self.tree[i] = self.tree[i].wrapping_add_signed(delta);
            i += i & i.wrapping_neg();
        }
    }

    /// Visible items in ranks `[0, rank)`.
    fn tree_prefix(&self, rank: usize) -> usize {
        let mut i = rank.min(self.tree.len().saturating_sub(1));
        let mut sum = 0;
        while i > 0 {
            sum += self.tree[i];
            i -= i & i.wrapping_neg();
        }
        sum
    }

    /// Rank of the block holding visible item `offset`, and the offset
    /// within that block. `offset` must be below `visible()`.
    fn tree_find(&self, mut offset: usize) -> (usize, usize) {
        let n = self.tree.len().saturating_sub(1);
        let mut pos = 0;
        let mut step = n.next_power_of_two();
        while step > 0 {
            let next = pos + step;
            if next <= n && self.tree[next] <= offset {
                pos = next;
                offset -= self.tree[next];
            }
            step >>= 1;
        }
        (pos, offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(counter: u64, ch: char) -> Item {
        Item {
            id: ItemId::new(ReplicaId::from_u64(1), counter),
            origin: None,
            ch,
            deleted: false,
        }
    }

    fn text(seq: &Sequence) -> String {
        seq.iter().filter(|item| !item.deleted).map(|item| item.ch).collect()
    }

    #[test]
    fn test_append_splits_blocks() {
        let mut seq = Sequence::default();
        for counter in 1..=1000u64 {
            let end = seq.end();
            seq.insert(end, item(counter, 'a'));
        }
        assert_eq!(seq.visible(), 1000);
        assert!(seq.order.len() > 1);
        for offset in [0, 1, 127, 128, 129, 500, 999] {
            let pos = seq.nth_visible(offset).unwrap();
            assert_eq!(seq.get(pos).unwrap().id.counter, offset as u64 + 1);
            assert_eq!(seq.visible_before(pos), offset);
        }
        assert_eq!(seq.nth_visible(1000), None);
    }

    #[test]
    fn test_front_inserts_keep_order() {
        let mut seq = Sequence::default();
        let mut expected = String::new();
        for counter in 1..=300u64 {
            let ch = char::from(b'a' + (counter % 26) as u8);
            let start = seq.start();
            seq.insert(start, item(counter, ch));
            expected.insert(0, ch);
        }
        assert_eq!(text(&seq), expected);

        let id = ItemId::new(ReplicaId::from_u64(1), 150);
        let pos = seq.find(id).unwrap();
        assert_eq!(seq.visible_before(pos), 150);
    }

    #[test]
    fn test_delete_updates_offsets() {
        let mut seq = Sequence::default();
        for counter in 1..=400u64 {
            let end = seq.end();
            seq.insert(end, item(counter, 'x'));
        }
        for counter in 1..=200u64 {
            let pos = seq.find(ItemId::new(ReplicaId::from_u64(1), counter)).unwrap();
            assert!(seq.delete(pos));
            assert!(!seq.delete(pos));
        }
        assert_eq!(seq.visible(), 200);
        let first = seq.nth_visible(0).unwrap();
        assert_eq!(seq.get(first).unwrap().id.counter, 201);
        assert_eq!(seq.counters_in(ReplicaId::from_u64(1), 395, 1_000), vec![395, 396, 397, 398, 399, 400]);
    }

    #[test]
    fn test_empty_sequence() {
        let seq = Sequence::default();
        assert_eq!(seq.visible(), 0);
        assert_eq!(seq.nth_visible(0), None);
        assert!(seq.get(seq.start()).is_none());
        assert!(seq.counters_in(ReplicaId::from_u64(1), 0, 10).is_empty());
    }
}
