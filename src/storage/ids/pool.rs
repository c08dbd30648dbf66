//! Per-partition id pools backed by the block authority.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tracing::{debug, trace};

use super::authority::{IdAuthority, IdBlock, IdNamespace};
use crate::types::{PartitionId, PenumbraError, Result};

/// Hands out counts from leased blocks of one `(partition, namespace)`.
///
/// When the unused part of the current block drops to the renew fraction, the
/// next block is leased on a background thread. Unused counts are dropped on
/// [`IdPool::flush`].
pub struct IdPool {
    authority: Arc<IdAuthority>,
    partition: PartitionId,
    namespace: IdNamespace,
    upper_bound: u64,
    renew_fraction: f64,
    state: Mutex<PoolState>,
}

#[derive(Default)]
struct PoolState {
    current: Option<IdBlock>,
    next: u64,
    prefetch: Option<JoinHandle<Result<IdBlock>>>,
    closed: bool,
}

impl IdPool {
    /// Creates an empty pool; the first block is leased lazily.
    pub fn new(
        authority: Arc<IdAuthority>,
        partition: PartitionId,
        namespace: IdNamespace,
        upper_bound: u64,
        renew_fraction: f64,
    ) -> Self {
        Self {
            authority,
            partition,
            namespace,
            upper_bound,
            renew_fraction,
            state: Mutex::new(PoolState::default()),
        }
    }

    /// Next unused count.
    pub fn next_id(&self) -> Result<u64> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(PenumbraError::Closed("id pool"));
        }
        loop {
            if let Some(block) = state.current {
                if state.next < block.end {
                    let id = state.next;
                    state.next += 1;
                    self.maybe_prefetch(&mut state, block);
                    trace!(partition = self.partition.0, id, "ids.pool.next");
                    return Ok(id);
                }
            }
            let block = match state.prefetch.take() {
                Some(handle) => handle
                    .join()
                    .map_err(|_| PenumbraError::Backend("id block prefetch panicked".into()))??,
                None => self
                    .authority
                    .get_block(self.partition, self.namespace, self.upper_bound)?,
            };
            debug!(
                partition = self.partition.0,
                namespace = ?self.namespace,
                start = block.start,
                end = block.end,
                "ids.pool.renewed"
            );
            state.current = Some(block);
            state.next = block.start;
        }
    }

    /// Drops the rest of the current block and any prefetched block.
    pub fn flush(&self) {
        let mut state = self.state.lock();
        state.current = None;
        if let Some(handle) = state.prefetch.take() {
            let _ = handle.join();
        }
    }

    /// Flushes and refuses further allocation.
    pub fn close(&self) {
        self.flush();
        self.state.lock().closed = true;
    }

    fn maybe_prefetch(&self, state: &mut PoolState, block: IdBlock) {
        if state.prefetch.is_some() || block.end >= self.upper_bound {
            return;
        }
        let remaining = block.end - state.next;
        let threshold = (block.len() as f64 * self.renew_fraction).ceil() as u64;
        if remaining > threshold {
            return;
        }
        let authority = Arc::clone(&self.authority);
        let (partition, namespace, bound) = (self.partition, self.namespace, self.upper_bound);
        state.prefetch = Some(thread::spawn(move || {
            authority.get_block(partition, namespace, bound)
        }));
    }
}
