//! Block storage and the bounded, swapping block pool (C1).
//!
//! A [`Block`] is a reference-counted handle to a fixed-capacity byte
//! region managed by a [`BlockPool`]. The pool keeps total resident
//! bytes under a configured hard limit by swapping cold, unpinned
//! blocks to a per-pool swap file.

mod pool;
mod swap_file;

pub use pool::{BlockPool, PinnedBlock};

use std::sync::Arc;

use slotmap::new_key_type;

new_key_type! {
    /// Identifies a block's slot inside its owning [`BlockPool`].
    pub struct BlockId;
}

/// Self-describing type tag used for debug-only serialization checks
/// (§3.1 `typecode_verify`).
pub type TypeTag = u32;

/// A contiguous byte region of fixed capacity `B`, shared through
/// reference counting. Cloning a `Block` is cheap (an `Arc` clone); the
/// last clone to drop releases the pool's bookkeeping for it.
#[derive(Clone)]
pub struct Block {
    pub(crate) handle: Arc<pool::BlockHandle>,
}

impl Block {
    pub fn id(&self) -> BlockId {
        self.handle.id
    }

    /// Byte offset of valid data's start.
    pub fn begin(&self) -> usize {
        self.handle.pool.meta(self.handle.id, |m| m.begin)
    }

    /// Byte offset one past valid data's end.
    pub fn end(&self) -> usize {
        self.handle.pool.meta(self.handle.id, |m| m.end)
    }

    /// Byte offset of the first complete item starting in this block.
    pub fn first_item(&self) -> usize {
        self.handle.pool.meta(self.handle.id, |m| m.first_item)
    }

    /// Count of complete items starting in this block.
    pub fn num_items(&self) -> usize {
        self.handle.pool.meta(self.handle.id, |m| m.num_items)
    }

    pub fn typecode_verify(&self) -> Option<TypeTag> {
        self.handle.pool.meta(self.handle.id, |m| m.typecode_verify)
    }

    /// `true` iff this block holds only a continuation of an item begun
    /// in an earlier block (§3.1 invariant).
    pub fn is_pure_continuation(&self) -> bool {
        self.num_items() == 0
    }

    /// Number of bytes of valid data, independent of residency.
    pub fn len(&self) -> usize {
        self.end() - self.begin()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends bytes to the block's resident tail, extending `end` and
    /// advancing `num_items`/`first_item` bookkeeping. Only valid while
    /// the caller holds a [`PinnedBlock`] for this block (the writer
    /// pins the block it is currently filling).
    pub(crate) fn append(&self, data: &[u8], completes_items: usize, marks_first_item: Option<usize>) {
        self.handle
            .pool
            .append_bytes(self.handle.id, data, completes_items, marks_first_item);
    }

    /// Public counterpart of [`Block::append`] for writers in other
    /// crates (`dfcore_data::Writer`, `dfcore_reduce`'s spill paths).
    /// `pin` proves the caller holds this block resident; `completes_items`
    /// is the number of items whose last byte this call writes;
    /// `first_item_offset` carries the byte offset (within this block) of
    /// the first such item, and is only meaningful on the call that
    /// completes this block's first item.
    pub fn write_item_bytes(
        &self,
        pin: &PinnedBlock,
        data: &[u8],
        completes_items: usize,
        first_item_offset: Option<usize>,
    ) {
        debug_assert_eq!(pin.block().id(), self.id(), "write through foreign pin");
        self.append(data, completes_items, first_item_offset);
    }

    /// Remaining capacity in bytes before `capacity` (the pool's configured
    /// block size) is reached.
    pub fn remaining_capacity(&self, capacity: usize) -> usize {
        capacity.saturating_sub(self.end())
    }
}

/// Metadata tracked per block, independent of residency.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct BlockMeta {
    pub begin: usize,
    pub end: usize,
    pub first_item: usize,
    pub num_items: usize,
    pub typecode_verify: Option<TypeTag>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use dfcore_config::Configuration;

    fn pool(ram_limit: usize, block_size: usize) -> BlockPool {
        let cfg = Configuration {
            ram_limit,
            block_size,
            workdir: std::env::temp_dir(),
            ..Configuration::default()
        };
        BlockPool::new(cfg)
    }

    #[tokio::test]
    async fn allocate_gives_zero_length_block() {
        let pool = pool(1 << 20, 4096);
        let block = pool.allocate_block().await.unwrap();
        assert_eq!(block.len(), 0);
        assert_eq!(block.num_items(), 0);
        assert!(block.is_pure_continuation());
    }
}
