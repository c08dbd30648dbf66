#![allow(dead_code)]

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use penumbra::config::GraphConfig;
use penumbra::primitives::kcv::InMemoryStoreManager;
use penumbra::{Graph, Result};

/// Backend shared by every simulated process of a test.
pub fn backend() -> Arc<InMemoryStoreManager> {
    Arc::new(InMemoryStoreManager::new())
}

/// Config of a simulated process: own instance id and mediator group, fast
/// log polling and short lock waits.
pub fn config(instance: &str) -> GraphConfig {
    let mut cfg = GraphConfig::default()
        .instance_id(instance)
        .mediator_group(format!("process{instance}"))
        .log_timing(10, 10)
        .max_partitions(8);
    cfg.locking.wait_ms = 5;
    cfg.ids.block_size = 100;
    cfg
}

pub fn open(backend: &Arc<InMemoryStoreManager>, instance: &str) -> Result<Graph> {
    Graph::open(backend.clone(), config(instance))
}

/// Polls `check` until it holds or `timeout` passes.
pub fn eventually(timeout: Duration, mut check: impl FnMut() -> Result<bool>) -> Result<bool> {
    let start = Instant::now();
    loop {
        if check()? {
            return Ok(true);
        }
        if start.elapsed() >= timeout {
            return Ok(false);
        }
        thread::sleep(Duration::from_millis(5));
    }
}
