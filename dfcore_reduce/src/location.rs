//! Location detection (§4.4.4): an optional pre-pass for binary
//! operators (e.g. join) that counts key occurrences across workers
//! using a compact sketch, then broadcasts a routing table so that keys
//! present on only one worker can be sent directly there instead of
//! going through the full shuffle. A strict optimization: disabling it
//! must not change join/reduce semantics, only their network cost.
//!
//! Built entirely out of existing C3/C4 primitives: the sketch travels
//! through a [`PreReduceTable`]/[`PostReduceTable`] pair exactly like
//! any other pre-reduce shuffle, and the resulting routes are broadcast
//! back over a second stream.

use std::collections::HashMap;
use std::sync::Arc;

use dfcore_config::Configuration;
use dfcore_error::Result;
use dfcore_net::{StreamKind, StreamMultiplexer};
use serde::{Deserialize, Serialize};

use crate::post_reduce::{PostReduceTable, VecSink};
use crate::pre_reduce::PreReduceTable;
use crate::table::ReduceFn;

/// One sketch entry: a key's hash, how many distinct workers reported
/// it, which DIA(s) it was seen in locally (a bitmask so a binary
/// operator's two inputs fit in bits 0/1), and — while `count == 1` —
/// the sole worker that reported it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashCount {
    pub count: u32,
    pub dia_mask: u8,
    pub sole_worker: Option<u32>,
}

impl HashCount {
    pub fn one(dia_id: u8, worker: u32) -> Self {
        HashCount {
            count: 1,
            dia_mask: 1 << dia_id,
            sole_worker: Some(worker),
        }
    }

    fn reduce(a: HashCount, b: HashCount) -> HashCount {
        let sole_worker = match (a.sole_worker, b.sole_worker) {
            (Some(x), Some(y)) if x == y => Some(x),
            _ => None,
        };
        HashCount {
            count: a.count + b.count,
            dia_mask: a.dia_mask | b.dia_mask,
            sole_worker,
        }
    }
}

/// Whether a key's destination is already known (`Local`) or must go
/// through the ordinary shuffle (`Shuffle`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Route {
    Local(u32),
    Shuffle,
}

/// The routing table every worker ends up holding after the pre-pass:
/// a decision per key hash it has a local opinion about.
#[derive(Debug, Default)]
pub struct RoutingTable {
    routes: HashMap<u64, Route>,
}

impl RoutingTable {
    pub fn route_for(&self, hash: u64) -> Route {
        self.routes.get(&hash).copied().unwrap_or(Route::Shuffle)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

fn hash_count_reduce() -> ReduceFn<HashCount> {
    Arc::new(HashCount::reduce)
}

/// Runs the full location-detection pre-pass collectively: every worker
/// must call this with its locally deduplicated `(hash, dia_mask)`
/// pairs, in the same call sequence as every peer (stream ids are
/// allocated collectively, per §4.3).
pub async fn run_location_detection(
    mux: &StreamMultiplexer,
    config: &Configuration,
    local_hashes: impl IntoIterator<Item = (u64, u8)>,
) -> Result<RoutingTable> {
    let sketch_id = mux.allocate_cat_stream()?;
    let num_workers = mux.num_workers();
    let rank = mux.rank() as u32;

    let writers = mux.open_writers::<(u64, HashCount)>(sketch_id, StreamKind::Cat)?;
    let mut sketch = PreReduceTable::new(hash_count_reduce(), config, writers, 0);
    for (hash, dia_mask) in local_hashes {
        sketch.insert(hash, HashCount::one(dia_mask, rank)).await?;
    }
    sketch.finish().await?;

    let reader = mux.open_cat_reader::<(u64, HashCount)>(sketch_id, true)?;
    let mut post = PostReduceTable::new(hash_count_reduce(), config.clone(), mux.pool().clone(), 1);
    drain_into(reader, &mut post).await?;
    let mut sink = VecSink::default();
    post.finish(&mut sink).await?;

    let owned_routes: Vec<(u64, Route)> = sink
        .items
        .into_iter()
        .map(|(hash, hc)| {
            let route = if hc.count <= 1 {
                Route::Local(hc.sole_worker.expect("count==1 implies a sole worker"))
            } else {
                Route::Shuffle
            };
            (hash, route)
        })
        .collect();

    // Broadcast every owner's routing decisions to all P workers.
    let broadcast_id = mux.allocate_mix_stream()?;
    let mut writers = mux.open_writers::<(u64, Route)>(broadcast_id, StreamKind::Mix)?;
    for dst in 0..num_workers {
        for entry in &owned_routes {
            writers[dst].push(entry).await?;
        }
    }
    for writer in writers {
        writer.close().await?;
    }

    let mut reader = mux.open_mix_reader::<(u64, Route)>(broadcast_id, true)?;
    let mut table = RoutingTable::default();
    while let Some((hash, route)) = reader.next().await? {
        table.routes.insert(hash, route);
    }
    Ok(table)
}

async fn drain_into(
    mut reader: dfcore_net::StreamReader<(u64, HashCount)>,
    post: &mut PostReduceTable<u64, HashCount>,
) -> Result<()> {
    while let Some((hash, hc)) = reader.next().await? {
        post.insert(hash, hc).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use dfcore_block::BlockPool;
    use dfcore_net::MockTransport;

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
    async fn keys_on_one_worker_route_locally_keys_on_many_route_to_shuffle() {
        let cfg = Configuration {
            workers_per_host: 3,
            ..Configuration::default()
        };
        let muxes: Vec<StreamMultiplexer> = MockTransport::cluster(3)
            .into_iter()
            .map(|t| StreamMultiplexer::new(t, cfg.clone(), test_pool()))
            .collect();

        // hash 100 only ever reported by worker 0 -> should route Local(0).
        // hash 200 reported by both worker 0 and worker 1 -> should route Shuffle.
        let local_sets = [vec![(100u64, 0u8), (200u64, 0u8)], vec![(200u64, 1u8)], vec![]];

        let mut handles = Vec::new();
        for (mux, hashes) in muxes.iter().cloned().zip(local_sets.into_iter()) {
            let cfg = cfg.clone();
            handles.push(tokio::spawn(async move { run_location_detection(&mux, &cfg, hashes).await }));
        }

        let mut tables = Vec::new();
        for h in handles {
            tables.push(h.await.unwrap().unwrap());
        }

        for table in &tables {
            assert_eq!(table.route_for(100), Route::Local(0));
            assert_eq!(table.route_for(200), Route::Shuffle);
        }
    }
}
