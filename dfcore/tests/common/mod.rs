use std::sync::Arc;

use dfcore::{Configuration, MockTransport, StreamMultiplexer};

pub fn test_pool(config: &Configuration) -> dfcore::BlockPool {
    dfcore::BlockPool::new(config.clone())
}

/// Builds one `StreamMultiplexer` per worker over an in-process
/// `MockTransport` cluster, each with its own `BlockPool` (pools are
/// not shared across workers, matching one-pool-per-process per §5).
pub fn cluster(num_workers: usize, config: &Configuration) -> Vec<StreamMultiplexer> {
    MockTransport::cluster(num_workers)
        .into_iter()
        .map(|t: Arc<MockTransport>| StreamMultiplexer::new(t, config.clone(), test_pool(config)))
        .collect()
}

pub fn tiny_config() -> Configuration {
    Configuration {
        block_size: 4096,
        ram_limit: 64 * 1024 * 1024,
        workdir: std::env::temp_dir(),
        ..Configuration::default()
    }
}
