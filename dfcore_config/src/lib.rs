//! The enumerated configuration surface from the spec's external
//! interfaces section: one plain, `serde`-deserializable struct with
//! documented defaults. A CLI layer outside the core can wrap this in
//! `#[derive(clap::Parser)]` without restructuring it.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Transport backend selection. Only `Mock` and `Tcp` are implemented by
/// this core; `Mpi` is kept as a recognized value so configuration files
/// written against a future MPI transport still parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    Tcp,
    Mpi,
    Mock,
}

impl Default for Transport {
    fn default() -> Self {
        Transport::Mock
    }
}

/// Job-wide configuration, constructed once at start-up and threaded
/// explicitly into the block pool, memory pool, and scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    /// `W`: local workers per process.
    pub workers_per_host: usize,
    /// `B`: transport + file block size, in bytes.
    pub block_size: usize,
    /// `M_pool`: hard RAM cap on resident blocks, in bytes.
    pub ram_limit: usize,
    /// `M_stage`: per-stage compute memory budget, in bytes.
    pub stage_mem: usize,
    /// Bucket-pointer count per slab target, per hash-table partition.
    pub bucket_rate: usize,
    /// Fill-rate in `(0,1]` that triggers a pre/post-reduce partition spill.
    pub limit_partition_fill_rate: f64,
    /// Fill-rate in `(0,1]` that triggers a post-reduce secondary-table spill.
    pub max_frame_fill_rate: f64,
    /// Whether operators default to destructive (consuming) reads.
    pub consume_default: bool,
    /// Enables the join/reduce location-detection pre-pass.
    pub enable_location_detection: bool,
    /// Bound on secondary-table overflow recursion depth (§4.4.3).
    pub max_secondary_recursion: u32,
    /// Directory for swap and spill files.
    pub workdir: PathBuf,
    /// Transport backend.
    pub transport: Transport,
}

impl Default for Configuration {
    fn default() -> Self {
        Configuration {
            workers_per_host: 1,
            block_size: 2 * 1024 * 1024,
            ram_limit: 1024 * 1024 * 1024,
            stage_mem: 512 * 1024 * 1024,
            bucket_rate: 16,
            limit_partition_fill_rate: 0.9,
            max_frame_fill_rate: 0.6,
            consume_default: false,
            enable_location_detection: false,
            max_secondary_recursion: 8,
            workdir: PathBuf::from("."),
            transport: Transport::default(),
        }
    }
}

impl Configuration {
    /// Total number of workers across the job, `P = H * W`, given a host count.
    pub fn total_workers(&self, hosts: usize) -> usize {
        hosts * self.workers_per_host
    }

    /// Number of items per partition that triggers a pre/post-reduce spill,
    /// given a chosen bucket/slot capacity for that partition.
    pub fn limit_items_per_partition(&self, capacity: usize) -> usize {
        ((capacity as f64) * self.limit_partition_fill_rate).floor() as usize
    }

    /// Number of items a post-reduce secondary (overflow) table may hold
    /// before it, too, must spill (§4.4.3 item 4). A separate fill-rate
    /// from `limit_partition_fill_rate` because a secondary table's
    /// budget is "the remaining budget" after its parent partition
    /// already gave up some memory to a spill file, not the same
    /// per-partition share every primary partition gets.
    pub fn limit_items_per_frame(&self, capacity: usize) -> usize {
        ((capacity as f64) * self.max_frame_fill_rate).floor() as usize
    }

    pub fn swap_file_name(&self, host: usize, pid: u32, seq: u64) -> PathBuf {
        self.workdir.join(format!("swap-{host}-{pid}-{seq}.dat"))
    }

    pub fn spill_file_name(&self, dia_id: u64, partition: usize, seq: u64) -> PathBuf {
        self.workdir
            .join(format!("spill-{dia_id}-{partition}-{seq}.dat"))
    }
}
