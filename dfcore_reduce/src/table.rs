//! The common bucket-chain structure shared by the pre- and post-reduce
//! tables (§4.4.1): `Q` partitions, each an array of bucket-chain heads,
//! each chain a linked list of fixed-capacity [`BucketBlock`]s.

use std::hash::{Hash, Hasher};
use std::sync::Arc;

use dfcore_config::Configuration;
use rustc_hash::FxHasher;

/// A reduce function shared between a table and any secondary tables it
/// spawns on overflow (§4.4.3); `Arc` so recursion can hand the same
/// closure down without re-boxing it each level.
pub type ReduceFn<V> = Arc<dyn Fn(V, V) -> V + Send + Sync>;

pub fn hash_with_seed<K: Hash>(key: &K, seed: u64) -> u64 {
    let mut hasher = FxHasher::default();
    seed.hash(&mut hasher);
    key.hash(&mut hasher);
    hasher.finish()
}

/// Target bytes per block (§4.4.1: "about 1 MiB, or at least 8 items").
const TARGET_BLOCK_BYTES: usize = 1 << 20;
const MIN_BLOCK_ENTRIES: usize = 8;

pub(crate) fn block_capacity<K, V>() -> usize {
    let entry_size = std::mem::size_of::<(K, V)>().max(1);
    (TARGET_BLOCK_BYTES / entry_size).max(MIN_BLOCK_ENTRIES)
}

struct BucketBlock<K, V> {
    entries: Vec<(K, V)>,
    next: Option<Box<BucketBlock<K, V>>>,
}

impl<K, V> BucketBlock<K, V> {
    fn new(capacity: usize) -> Self {
        BucketBlock {
            entries: Vec::with_capacity(capacity),
            next: None,
        }
    }
}

enum InsertOutcome {
    Replaced,
    Appended { allocated_block: bool },
}

/// Finds `key` anywhere in the chain and reduces its value in place;
/// otherwise appends a new entry to the head block, allocating a fresh
/// head if the current one is full (§4.4.1 insert contract).
fn insert_into_chain<K, V>(
    head: &mut Option<Box<BucketBlock<K, V>>>,
    key: K,
    value: V,
    reduce: &dyn Fn(V, V) -> V,
    capacity: usize,
) -> InsertOutcome
where
    K: Eq,
    V: Clone,
{
    let mut node = head.as_deref_mut();
    while let Some(block) = node {
        if let Some(entry) = block.entries.iter_mut().find(|(k, _)| *k == key) {
            let old = entry.1.clone();
            entry.1 = reduce(old, value);
            return InsertOutcome::Replaced;
        }
        node = block.next.as_deref_mut();
    }

    let needs_new_block = match head {
        Some(b) => b.entries.len() >= capacity,
        None => true,
    };
    if needs_new_block {
        let mut new_block = Box::new(BucketBlock::new(capacity));
        new_block.entries.push((key, value));
        new_block.next = head.take();
        *head = Some(new_block);
        InsertOutcome::Appended {
            allocated_block: true,
        }
    } else {
        head.as_mut().expect("checked above").entries.push((key, value));
        InsertOutcome::Appended {
            allocated_block: false,
        }
    }
}

struct Partition<K, V> {
    buckets: Vec<Option<Box<BucketBlock<K, V>>>>,
    items: usize,
    blocks: usize,
}

impl<K, V> Partition<K, V> {
    fn new(buckets_per_partition: usize) -> Self {
        Partition {
            buckets: (0..buckets_per_partition).map(|_| None).collect(),
            items: 0,
            blocks: 0,
        }
    }
}

/// The bucket-chained reduce table (§4.4.1), parameterized by key type
/// `K`, value type `V`, and an associative-commutative `reduce`.
/// Partitioning and spill policy are shared; pre- and post-reduce
/// differ only in what they do with a partition once it must give up
/// entries ([`crate::pre_reduce::PreReduceTable`],
/// [`crate::post_reduce::PostReduceTable`]).
pub struct BucketChainTable<K, V> {
    reduce: ReduceFn<V>,
    partitions: Vec<Partition<K, V>>,
    buckets_per_partition: usize,
    block_capacity: usize,
    hash_seed: u64,
    spill_threshold: usize,
    total_blocks: u64,
    spilled_blocks: u64,
}

impl<K, V> BucketChainTable<K, V>
where
    K: Hash + Eq,
    V: Clone,
{
    pub fn new(reduce: ReduceFn<V>, config: &Configuration, num_partitions: usize, hash_seed: u64) -> Self {
        let buckets_per_partition = config.bucket_rate.max(1);
        let block_capacity = block_capacity::<K, V>();
        let spill_threshold = config
            .limit_items_per_partition(buckets_per_partition * block_capacity)
            .max(1);
        Self::with_threshold(
            reduce,
            buckets_per_partition,
            block_capacity,
            hash_seed,
            num_partitions,
            spill_threshold,
        )
    }

    /// Builds a table with an explicit spill threshold instead of one
    /// derived from [`Configuration`]; used for secondary tables, whose
    /// effective budget grows with recursion depth (§4.4.3, DESIGN.md).
    pub fn with_threshold(
        reduce: ReduceFn<V>,
        buckets_per_partition: usize,
        block_capacity: usize,
        hash_seed: u64,
        num_partitions: usize,
        spill_threshold: usize,
    ) -> Self {
        assert!(num_partitions > 0, "a reduce table needs at least one partition");
        BucketChainTable {
            reduce,
            partitions: (0..num_partitions).map(|_| Partition::new(buckets_per_partition)).collect(),
            buckets_per_partition,
            block_capacity,
            hash_seed,
            spill_threshold: spill_threshold.max(1),
            total_blocks: 0,
            spilled_blocks: 0,
        }
    }

    pub fn num_partitions(&self) -> usize {
        self.partitions.len()
    }

    pub fn spill_threshold(&self) -> usize {
        self.spill_threshold
    }

    fn locate(&self, key: &K) -> (usize, usize) {
        let h = hash_with_seed(key, self.hash_seed);
        let q = self.partitions.len() as u64;
        let partition_id = (h % q) as usize;
        let local_slot = ((h / q) % self.buckets_per_partition as u64) as usize;
        (partition_id, local_slot)
    }

    /// Inserts (or reduces into) one `(key, value)`. Returns the
    /// partition id the caller must spill if that partition's resident
    /// item count just exceeded the configured fill-rate threshold.
    pub fn insert(&mut self, key: K, value: V) -> Option<usize> {
        let (partition_id, local_slot) = self.locate(&key);
        let partition = &mut self.partitions[partition_id];
        let outcome = insert_into_chain(
            &mut partition.buckets[local_slot],
            key,
            value,
            self.reduce.as_ref(),
            self.block_capacity,
        );
        match outcome {
            InsertOutcome::Replaced => {}
            InsertOutcome::Appended { allocated_block } => {
                partition.items += 1;
                if allocated_block {
                    partition.blocks += 1;
                    self.total_blocks += 1;
                }
            }
        }
        if partition.items > self.spill_threshold {
            Some(partition_id)
        } else {
            None
        }
    }

    pub fn partition_items(&self, partition_id: usize) -> usize {
        self.partitions[partition_id].items
    }

    /// Removes and returns every entry resident in one partition,
    /// resetting its counters (§4.4.1 "Spill"/"Flush").
    pub fn drain_partition(&mut self, partition_id: usize) -> Vec<(K, V)> {
        let partition = &mut self.partitions[partition_id];
        let mut out = Vec::with_capacity(partition.items);
        for bucket in partition.buckets.iter_mut() {
            let mut node = bucket.take();
            while let Some(mut block) = node {
                out.extend(block.entries.drain(..));
                node = block.next.take();
            }
        }
        self.spilled_blocks += partition.blocks as u64;
        partition.items = 0;
        partition.blocks = 0;
        out
    }

    pub fn total_blocks(&self) -> u64 {
        self.total_blocks
    }

    pub fn spilled_blocks(&self) -> u64 {
        self.spilled_blocks
    }
}
