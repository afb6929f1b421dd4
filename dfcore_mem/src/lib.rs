//! Slab allocator for small, fixed-size metadata (block headers,
//! dispatcher callbacks, log records) that must remain allocatable even
//! when the main heap is under pressure.
//!
//! Arenas are fixed-size byte regions; each arena's free space is
//! tracked by an explicit free-list of `(offset, len)` runs rather than
//! writing free-list links into the freed bytes themselves — this keeps
//! the allocator entirely in safe Rust while preserving the spec's
//! merge-adjacent-runs and first-fit-scan behavior.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
struct ArenaId(u64);

const DEFAULT_ARENA_SIZE: usize = 1 << 20; // 1 MiB
const SLOT_SIZE: usize = 8;

fn round_to_slot(n: usize) -> usize {
    n.div_ceil(SLOT_SIZE) * SLOT_SIZE
}

struct Arena {
    bytes: Vec<u8>,
    /// Sorted, non-overlapping, non-adjacent free runs `(offset, len)`.
    free: Vec<(usize, usize)>,
}

impl Arena {
    fn new(size: usize) -> Self {
        Arena {
            bytes: vec![0u8; size],
            free: vec![(0, size)],
        }
    }

    fn try_allocate(&mut self, len: usize) -> Option<usize> {
        let idx = self.free.iter().position(|&(_, run_len)| run_len >= len)?;
        let (offset, run_len) = self.free[idx];
        if run_len == len {
            self.free.remove(idx);
        } else {
            self.free[idx] = (offset + len, run_len - len);
        }
        Some(offset)
    }

    fn deallocate(&mut self, offset: usize, len: usize) {
        let insert_at = self
            .free
            .partition_point(|&(run_offset, _)| run_offset < offset);
        self.free.insert(insert_at, (offset, len));
        self.merge_adjacent(insert_at);
    }

    /// Merges the run at `idx` with its immediate neighbors if they are
    /// byte-adjacent, per the spec's "merges adjacent free runs."
    fn merge_adjacent(&mut self, idx: usize) {
        if idx + 1 < self.free.len() {
            let (offset, len) = self.free[idx];
            let (next_offset, next_len) = self.free[idx + 1];
            if offset + len == next_offset {
                self.free[idx] = (offset, len + next_len);
                self.free.remove(idx + 1);
            }
        }
        if idx > 0 {
            let (prev_offset, prev_len) = self.free[idx - 1];
            let (offset, len) = self.free[idx];
            if prev_offset + prev_len == offset {
                self.free[idx - 1] = (prev_offset, prev_len + len);
                self.free.remove(idx);
            }
        }
    }

    fn free_bytes(&self) -> usize {
        self.free.iter().map(|&(_, len)| len).sum()
    }
}

/// A handle to an allocated run of bytes. Opaque outside this crate
/// except for its size; pass it back to [`MemoryPool::deallocate`].
#[derive(Debug, Clone, Copy)]
pub struct SlabPtr {
    arena: ArenaId,
    offset: usize,
    len: usize,
}

impl SlabPtr {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

struct Inner {
    arena_size: usize,
    /// Keyed by `ArenaId`, which every `SlabPtr` carries directly, so
    /// the owning arena is always a sublinear `BTreeMap` lookup away.
    arenas: BTreeMap<ArenaId, Arena>,
    next_arena_id: u64,
}

/// The out-of-heap slab allocator (C7). A single instance is shared
/// process-wide as an explicit dependency, not a global.
pub struct MemoryPool {
    inner: Mutex<Inner>,
}

impl MemoryPool {
    pub fn new() -> Self {
        Self::with_arena_size(DEFAULT_ARENA_SIZE)
    }

    pub fn with_arena_size(arena_size: usize) -> Self {
        MemoryPool {
            inner: Mutex::new(Inner {
                arena_size,
                arenas: BTreeMap::new(),
                next_arena_id: 0,
            }),
        }
    }

    /// Allocates at least `n` bytes, rounded up to a slot multiple.
    /// Scans existing arenas for a fitting free run before growing a
    /// new arena.
    pub fn allocate(&self, n: usize) -> SlabPtr {
        let len = round_to_slot(n);
        let mut inner = self.inner.lock();

        for (&id, arena) in inner.arenas.iter_mut() {
            if let Some(offset) = arena.try_allocate(len) {
                return SlabPtr {
                    arena: id,
                    offset,
                    len,
                };
            }
        }

        let arena_size = inner.arena_size.max(len);
        let id = ArenaId(inner.next_arena_id);
        inner.next_arena_id += 1;

        let mut arena = Arena::new(arena_size);
        let offset = arena
            .try_allocate(len)
            .expect("freshly created arena must fit the requested run");
        inner.arenas.insert(id, arena);
        trace!(arena = id.0, size = arena_size, "grew new slab arena");

        SlabPtr {
            arena: id,
            offset,
            len,
        }
    }

    /// Frees a previously allocated run, merging it into adjacent free
    /// space within its arena.
    pub fn deallocate(&self, ptr: SlabPtr) {
        let mut inner = self.inner.lock();
        if let Some(arena) = inner.arenas.get_mut(&ptr.arena) {
            arena.deallocate(ptr.offset, ptr.len);
        }
    }

    /// Writes `data` into the slot referenced by `ptr`. Panics if `data`
    /// does not fit; callers allocate with the intended size.
    pub fn write(&self, ptr: SlabPtr, data: &[u8]) {
        assert!(data.len() <= ptr.len, "write exceeds allocated slot");
        let mut inner = self.inner.lock();
        let arena = inner
            .arenas
            .get_mut(&ptr.arena)
            .expect("slot's arena must still exist");
        arena.bytes[ptr.offset..ptr.offset + data.len()].copy_from_slice(data);
    }

    pub fn read(&self, ptr: SlabPtr) -> Vec<u8> {
        let inner = self.inner.lock();
        let arena = inner
            .arenas
            .get(&ptr.arena)
            .expect("slot's arena must still exist");
        arena.bytes[ptr.offset..ptr.offset + ptr.len].to_vec()
    }

    /// Total bytes currently free across all arenas. Mostly useful for
    /// tests and diagnostics.
    pub fn free_bytes(&self) -> usize {
        self.inner.lock().arenas.values().map(Arena::free_bytes).sum()
    }

    pub fn arena_count(&self) -> usize {
        self.inner.lock().arenas.len()
    }
}

impl Default for MemoryPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_rounds_to_slot_multiple() {
        let pool = MemoryPool::with_arena_size(4096);
        let p = pool.allocate(3);
        assert_eq!(p.len(), SLOT_SIZE);
    }

    #[test]
    fn deallocate_merges_adjacent_runs() {
        let pool = MemoryPool::with_arena_size(4096);
        let a = pool.allocate(64);
        let b = pool.allocate(64);
        let c = pool.allocate(64);
        let free_before = pool.free_bytes();
        pool.deallocate(a);
        pool.deallocate(b);
        pool.deallocate(c);
        assert_eq!(pool.free_bytes(), free_before + 3 * 64);
        // A fresh allocation the size of all three merged runs must now succeed
        // without creating a new arena.
        let count_before = pool.arena_count();
        let big = pool.allocate(190);
        assert_eq!(pool.arena_count(), count_before);
        pool.deallocate(big);
    }

    #[test]
    fn write_then_read_round_trips() {
        let pool = MemoryPool::new();
        let ptr = pool.allocate(16);
        pool.write(ptr, b"hello");
        let back = pool.read(ptr);
        assert_eq!(&back[..5], b"hello");
    }

    #[test]
    fn grows_new_arena_when_full() {
        let pool = MemoryPool::with_arena_size(64);
        let _a = pool.allocate(64);
        assert_eq!(pool.arena_count(), 1);
        let _b = pool.allocate(8);
        assert_eq!(pool.arena_count(), 2);
    }
}
