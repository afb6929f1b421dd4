//! Pre-reduce table (§4.4.2): folds items locally before a shuffle,
//! writing each partition to the `Stream` bound for that partition's
//! destination worker. On spill, excess items are forwarded verbatim —
//! reduction for them finishes at the receiver.

use std::hash::Hash;

use dfcore_config::Configuration;
use dfcore_error::Result;
use dfcore_net::StreamWriter;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::table::{BucketChainTable, ReduceFn};

/// One partition per destination worker: `partition_id == writers[partition_id].destination()`.
pub struct PreReduceTable<K, V> {
    table: BucketChainTable<K, V>,
    writers: Vec<StreamWriter<(K, V)>>,
}

impl<K, V> PreReduceTable<K, V>
where
    K: Hash + Eq + Clone + Serialize + DeserializeOwned + Send + 'static,
    V: Clone + Serialize + DeserializeOwned + Send + 'static,
{
    pub fn new(reduce: ReduceFn<V>, config: &Configuration, writers: Vec<StreamWriter<(K, V)>>, hash_seed: u64) -> Self {
        let num_partitions = writers.len();
        PreReduceTable {
            table: BucketChainTable::new(reduce, config, num_partitions, hash_seed),
            writers,
        }
    }

    /// Computes the destination partition for `key` without mutating
    /// the table, so callers that want location-detection routing can
    /// override it (see [`crate::location`]).
    pub fn num_partitions(&self) -> usize {
        self.table.num_partitions()
    }

    /// Folds one item in. Spills its partition to the network if the
    /// fill-rate threshold was just exceeded.
    pub async fn insert(&mut self, key: K, value: V) -> Result<()> {
        if let Some(partition_id) = self.table.insert(key, value) {
            self.spill(partition_id).await?;
        }
        Ok(())
    }

    async fn spill(&mut self, partition_id: usize) -> Result<()> {
        let entries = self.table.drain_partition(partition_id);
        let writer = &mut self.writers[partition_id];
        for (k, v) in entries {
            writer.push(&(k, v)).await?;
        }
        Ok(())
    }

    /// Forwards every partition's remaining resident entries to its
    /// destination worker and closes every writer (§4.4.1 "Flush").
    pub async fn finish(mut self) -> Result<()> {
        for partition_id in 0..self.writers.len() {
            self.spill(partition_id).await?;
        }
        for writer in self.writers {
            writer.close().await?;
        }
        Ok(())
    }
}
