//! Post-reduce table (§4.4.3): the receiver of a shuffle. Guarantees
//! every key appears at most once in its output, even when a single
//! partition's resident items plus its spilled file exceed the memory
//! budget, by recursing into secondary tables with a fresh hash seed.

use std::hash::Hash;

use async_trait::async_trait;
use dfcore_block::BlockPool;
use dfcore_config::Configuration;
use dfcore_data::{File, Reader, Writer};
use dfcore_error::{Error, Result};
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{error, warn};

use crate::table::{block_capacity, BucketChainTable, ReduceFn};

/// Where a post-reduce table's final, deduplicated entries go.
#[async_trait]
pub trait ReduceSink<K, V>: Send {
    async fn emit(&mut self, key: K, value: V) -> Result<()>;
}

/// A sink that simply collects every entry; handy for tests and for
/// operators that materialize their post-reduce output into memory.
#[derive(Default)]
pub struct VecSink<K, V> {
    pub items: Vec<(K, V)>,
}

#[async_trait]
impl<K: Send, V: Send> ReduceSink<K, V> for VecSink<K, V> {
    async fn emit(&mut self, key: K, value: V) -> Result<()> {
        self.items.push((key, value));
        Ok(())
    }
}

pub struct PostReduceTable<K, V> {
    table: BucketChainTable<K, V>,
    spill_writers: Vec<Option<Writer<(K, V)>>>,
    pool: BlockPool,
    config: Configuration,
    reduce: ReduceFn<V>,
}

impl<K, V> PostReduceTable<K, V>
where
    K: Hash + Eq + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(reduce: ReduceFn<V>, config: Configuration, pool: BlockPool, num_partitions: usize) -> Self {
        let table = BucketChainTable::new(reduce.clone(), &config, num_partitions, 0);
        PostReduceTable {
            table,
            spill_writers: (0..num_partitions).map(|_| None).collect(),
            pool,
            config,
            reduce,
        }
    }

    /// Inserts one shuffled item, reducing it against any resident
    /// match. Spills its partition to a spill file if the fill-rate
    /// threshold was just exceeded.
    pub async fn insert(&mut self, key: K, value: V) -> Result<()> {
        if let Some(partition_id) = self.table.insert(key, value) {
            self.spill(partition_id).await?;
        }
        Ok(())
    }

    async fn spill(&mut self, partition_id: usize) -> Result<()> {
        let entries = self.table.drain_partition(partition_id);
        if self.spill_writers[partition_id].is_none() {
            self.spill_writers[partition_id] = Some(Writer::new(File::new(), self.pool.clone()));
        }
        let writer = self.spill_writers[partition_id].as_mut().expect("just ensured");
        for (k, v) in entries {
            writer.push(&(k, v)).await?;
        }
        Ok(())
    }

    /// Drains every partition into `sink`, resolving any overflowed
    /// (spilled) partition through the secondary-table procedure
    /// (§4.4.3 items 1-5) before emitting it.
    pub async fn finish<S>(mut self, sink: &mut S) -> Result<()>
    where
        S: ReduceSink<K, V> + Send,
    {
        for partition_id in 0..self.spill_writers.len() {
            let resident = self.table.drain_partition(partition_id);
            let spill_file = match self.spill_writers[partition_id].take() {
                Some(writer) => Some(writer.close().await?),
                None => None,
            };
            drain_overflow(&self.config, self.reduce.clone(), resident, spill_file, self.pool.clone(), sink, 0).await?;
        }
        Ok(())
    }
}

fn secondary_seed(depth: u32) -> u64 {
    const MIX: u64 = 0x9E37_79B9_7F4A_7C15;
    MIX.wrapping_mul(depth as u64 + 1)
}

async fn materialize_spill_file<K, V>(pool: &BlockPool, entries: Vec<(K, V)>) -> Result<File>
where
    K: Serialize,
    V: Serialize,
{
    let mut writer: Writer<(K, V)> = Writer::new(File::new(), pool.clone());
    for (k, v) in entries {
        writer.push(&(k, v)).await?;
    }
    writer.close().await
}

/// Emits `resident` directly if the partition never spilled; otherwise
/// builds a secondary table (new hash seed) from the spilled file plus
/// `resident`, and recurses if even the secondary table overflows,
/// bounded by `config.max_secondary_recursion`.
fn drain_overflow<'a, K, V, S>(
    config: &'a Configuration,
    reduce: ReduceFn<V>,
    resident: Vec<(K, V)>,
    spill_file: Option<File>,
    pool: BlockPool,
    sink: &'a mut S,
    depth: u32,
) -> BoxFuture<'a, Result<()>>
where
    K: Hash + Eq + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    S: ReduceSink<K, V> + Send,
{
    Box::pin(async move {
        let Some(spill_file) = spill_file else {
            for (k, v) in resident {
                sink.emit(k, v).await?;
            }
            return Ok(());
        };

        if depth >= config.max_secondary_recursion {
            let err = Error::out_of_memory(
                true,
                format!(
                    "post-reduce secondary-table recursion exceeded max_secondary_recursion={}",
                    config.max_secondary_recursion
                ),
            );
            error!(%err, depth, "post-reduce table gave up");
            return Err(err);
        }
        warn!(depth, "post-reduce partition overflowed; building secondary table");

        // Each recursion level gets double the previous level's budget:
        // whatever didn't fit was already set aside as a disk-resident
        // file, so the next attempt can afford more resident entries.
        // The base itself is `max_frame_fill_rate` (§6.3), a fill-rate
        // distinct from the primary partitions' `limit_partition_fill_rate`.
        let buckets_per_partition = config.bucket_rate.max(1);
        let capacity = block_capacity::<K, V>();
        let base_threshold = config.limit_items_per_frame(buckets_per_partition * capacity).max(1);
        let threshold = base_threshold.saturating_mul(1usize << (depth + 1).min(20));
        let mut secondary: BucketChainTable<K, V> = BucketChainTable::with_threshold(
            reduce.clone(),
            buckets_per_partition,
            capacity,
            secondary_seed(depth),
            1,
            threshold,
        );

        let mut reader: Reader<(K, V)> = spill_file.open_consume_reader(pool.clone());
        while let Some((k, v)) = reader.next().await? {
            secondary.insert(k, v);
        }
        for (k, v) in resident {
            secondary.insert(k, v);
        }

        if secondary.partition_items(0) > secondary.spill_threshold() {
            let entries = secondary.drain_partition(0);
            let overflow_file = materialize_spill_file(&pool, entries).await?;
            return drain_overflow(config, reduce, Vec::new(), Some(overflow_file), pool, sink, depth + 1).await;
        }

        for (k, v) in secondary.drain_partition(0) {
            sink.emit(k, v).await?;
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn test_pool() -> BlockPool {
        let cfg = Configuration {
            block_size: 4096,
            ram_limit: 64 * 1024 * 1024,
            workdir: std::env::temp_dir(),
            ..Configuration::default()
        };
        BlockPool::new(cfg)
    }

    #[tokio::test]
    async fn every_key_appears_once_when_no_spill_occurs() {
        let cfg = Configuration::default();
        let reduce: ReduceFn<i64> = Arc::new(|a, b| a + b);
        let mut table = PostReduceTable::new(reduce, cfg, test_pool(), 1);
        for k in 0..20 {
            table.insert(k % 5, 1).await.unwrap();
        }
        let mut sink = VecSink::default();
        table.finish(&mut sink).await.unwrap();
        sink.items.sort();
        assert_eq!(sink.items, vec![(0, 4), (1, 4), (2, 4), (3, 4), (4, 4)]);
    }

    #[tokio::test]
    async fn overflowing_partition_recurses_through_a_secondary_table_without_duplicates() {
        // A tiny fill-rate forces the partition to spill well before it
        // has seen every distinct key, so the secondary table must
        // combine the spilled file with the final resident entries.
        let cfg = Configuration {
            bucket_rate: 1,
            limit_partition_fill_rate: 0.001,
            max_secondary_recursion: 5,
            ..Configuration::default()
        };
        const DISTINCT: i64 = 500;
        let reduce: ReduceFn<i64> = Arc::new(|a, b| a + b);
        let mut table = PostReduceTable::new(reduce, cfg, test_pool(), 1);
        for k in 0..(DISTINCT * 10) {
            table.insert(k % DISTINCT, 1).await.unwrap();
        }
        let mut sink = VecSink::default();
        table.finish(&mut sink).await.unwrap();
        sink.items.sort();

        assert_eq!(sink.items.len(), DISTINCT as usize);
        let total: i64 = sink.items.iter().map(|(_, v)| v).sum();
        assert_eq!(total, DISTINCT * 10);
        let mut keys: Vec<_> = sink.items.iter().map(|(k, _)| *k).collect();
        keys.dedup();
        assert_eq!(keys.len(), DISTINCT as usize);
    }
}
