//! Backend-persisted id block authority.
//!
//! Each `(partition, namespace)` row holds block claims. A claim column is
//! `block end | timestamp | instance id`. An instance claims the block after the
//! highest recorded end, waits, then reads back every claim for that end; the
//! oldest claim wins and losers withdraw and retry.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, warn};

use crate::config::IdsConfig;
use crate::primitives::bytes::ord::{get_u64_be, put_u64_be};
use crate::primitives::kcv::{Entry, KeyColumnValueStore, SliceQuery};
use crate::storage::clock;
use crate::types::{PartitionId, PenumbraError, Result};

/// Counter namespaces; each has its own blocks per partition.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum IdNamespace {
    /// Normal and unmodifiable vertices.
    Vertex,
    /// Edges and properties.
    Relation,
    /// Schema elements (partition 0 only).
    Schema,
    /// Partitioned vertices (partition 0 only).
    PartitionedVertex,
}

impl IdNamespace {
    const fn tag(self) -> u8 {
        match self {
            IdNamespace::Vertex => 0,
            IdNamespace::Relation => 1,
            IdNamespace::Schema => 2,
            IdNamespace::PartitionedVertex => 3,
        }
    }
}

/// First count handed out in every namespace; zero is never a valid count.
pub const FIRST_COUNT: u64 = 1;

/// A leased range of counts `[start, end)`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct IdBlock {
    /// First count of the block.
    pub start: u64,
    /// One past the last count.
    pub end: u64,
}

impl IdBlock {
    /// Counts in the block.
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    /// Whether the block is empty.
    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

/// Leases id blocks from the shared id store.
pub struct IdAuthority {
    store: Arc<dyn KeyColumnValueStore>,
    instance_id: String,
    block_size: u64,
    wait: Duration,
    retries: u32,
}

impl IdAuthority {
    /// Creates an authority writing claims as `instance_id`.
    pub fn new(store: Arc<dyn KeyColumnValueStore>, instance_id: &str, cfg: &IdsConfig) -> Self {
        Self {
            store,
            instance_id: instance_id.to_owned(),
            block_size: cfg.block_size,
            wait: Duration::from_millis(cfg.authority_wait_ms),
            retries: cfg.authority_retries.max(1),
        }
    }

    /// Leases the next block of `namespace` in `partition`, never reaching `upper_bound`.
    pub fn get_block(
        &self,
        partition: PartitionId,
        namespace: IdNamespace,
        upper_bound: u64,
    ) -> Result<IdBlock> {
        let key = row_key(partition, namespace);
        for attempt in 0..self.retries {
            let latest = self.latest_end(&key)?;
            if latest >= upper_bound {
                return Err(PenumbraError::IdPoolExhausted(format!(
                    "partition {partition} namespace {namespace:?} reached its upper bound {upper_bound}"
                )));
            }
            let end = latest.saturating_add(self.block_size).min(upper_bound);
            let started = Instant::now();
            let ts = clock::now_nanos();
            let column = claim_column(end, ts, &self.instance_id);
            self.store
                .mutate(&key, vec![Entry::new(column.clone(), Vec::new())], &[])?;
            if started.elapsed() > self.wait {
                warn!(
                    partition = partition.0,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "ids.block.claim_too_slow"
                );
                self.withdraw(&key, column)?;
                continue;
            }
            thread::sleep(self.wait);
            let claims = self.store.get_slice(&key, &SliceQuery::prefix(&end.to_be_bytes()))?;
            let winner = claims.first().map(|e| e.column.as_slice());
            if winner == Some(column.as_slice()) {
                debug!(
                    partition = partition.0,
                    namespace = ?namespace,
                    start = latest,
                    end,
                    attempt,
                    "ids.block.acquired"
                );
                return Ok(IdBlock { start: latest, end });
            }
            debug!(partition = partition.0, end, attempt, "ids.block.claim_lost");
            self.withdraw(&key, column)?;
            let backoff = rand::thread_rng().gen_range(1..=self.wait.as_millis().max(1) as u64);
            thread::sleep(Duration::from_millis(backoff));
        }
        Err(PenumbraError::Backend(format!(
            "could not claim an id block for partition {partition} after {} attempts",
            self.retries
        )))
    }

    fn latest_end(&self, key: &[u8]) -> Result<u64> {
        let claims = self.store.get_slice(key, &SliceQuery::all())?;
        match claims.last() {
            Some(entry) => get_u64_be(&entry.column),
            None => Ok(FIRST_COUNT),
        }
    }

    fn withdraw(&self, key: &[u8], column: Vec<u8>) -> Result<()> {
        self.store.mutate(key, Vec::new(), &[column])
    }
}

fn row_key(partition: PartitionId, namespace: IdNamespace) -> Vec<u8> {
    let mut key = Vec::with_capacity(5);
    key.extend_from_slice(&partition.0.to_be_bytes());
    key.push(namespace.tag());
    key
}

fn claim_column(end: u64, ts: u64, instance: &str) -> Vec<u8> {
    let mut column = Vec::with_capacity(16 + instance.len());
    put_u64_be(&mut column, end);
    put_u64_be(&mut column, ts);
    column.extend_from_slice(instance.as_bytes());
    column
}
