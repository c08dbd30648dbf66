//! Partition placement strategies for new vertices.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;
use xxhash_rust::xxh64::xxh64;

use super::manager::IdManager;
use crate::config::{IdsConfig, PlacementKind};
use crate::types::{PartitionId, PropertyValue};

/// Inputs a strategy may route on.
#[derive(Clone, Copy, Debug, Default)]
pub struct PlacementHint<'a> {
    /// Partition forced by the caller.
    pub explicit: Option<PartitionId>,
    /// Properties the new element is created with.
    pub properties: &'a [(String, PropertyValue)],
}

impl<'a> PlacementHint<'a> {
    /// Hint forcing `partition`.
    pub fn partition(partition: PartitionId) -> Self {
        Self {
            explicit: Some(partition),
            properties: &[],
        }
    }

    /// Hint carrying the element's initial properties.
    pub fn with_properties(properties: &'a [(String, PropertyValue)]) -> Self {
        Self {
            explicit: None,
            properties,
        }
    }
}

/// Picks the partition of a new vertex.
pub trait PartitionPlacement: Send + Sync {
    /// Partition for an element described by `hint`.
    fn partition_for(&self, hint: &PlacementHint<'_>) -> PartitionId;

    /// Reports that `partition` has no ids left.
    fn exhausted(&self, _partition: PartitionId) {}

    /// Strategy name for diagnostics.
    fn name(&self) -> &'static str;
}

/// Cycles through every partition starting at a random offset.
pub struct RoundRobinPlacement {
    bound: u32,
    next: AtomicU32,
}

impl RoundRobinPlacement {
    /// Creates a strategy over `bound` partitions.
    pub fn new(bound: u32) -> Self {
        let start = if bound > 1 {
            rand::thread_rng().gen_range(0..bound)
        } else {
            0
        };
        Self {
            bound: bound.max(1),
            next: AtomicU32::new(start),
        }
    }
}

impl PartitionPlacement for RoundRobinPlacement {
    fn partition_for(&self, hint: &PlacementHint<'_>) -> PartitionId {
        if let Some(p) = hint.explicit {
            return p;
        }
        PartitionId(self.next.fetch_add(1, Ordering::Relaxed) % self.bound)
    }

    fn name(&self) -> &'static str {
        "default"
    }
}

/// Fills a small rotating set of hot partitions.
pub struct BulkPlacement {
    bound: u32,
    rotate_after: u64,
    allocations: AtomicU64,
    state: Mutex<BulkState>,
}

struct BulkState {
    hot: Vec<u32>,
    rng: StdRng,
}

impl BulkPlacement {
    /// Creates a strategy keeping `concurrent` partitions hot.
    pub fn new(bound: u32, concurrent: usize, rotate_after: u64) -> Self {
        Self::with_rng(bound, concurrent, rotate_after, StdRng::from_entropy())
    }

    /// Same as [`BulkPlacement::new`] with a caller-provided random source.
    pub fn with_rng(bound: u32, concurrent: usize, rotate_after: u64, mut rng: StdRng) -> Self {
        let bound = bound.max(1);
        let want = concurrent.clamp(1, bound as usize);
        let mut hot = Vec::with_capacity(want);
        while hot.len() < want {
            let p = rng.gen_range(0..bound);
            if !hot.contains(&p) {
                hot.push(p);
            }
        }
        Self {
            bound,
            rotate_after,
            allocations: AtomicU64::new(0),
            state: Mutex::new(BulkState { hot, rng }),
        }
    }

    /// Currently hot partitions.
    pub fn hot_partitions(&self) -> Vec<PartitionId> {
        self.state.lock().hot.iter().map(|p| PartitionId(*p)).collect()
    }

    fn replace(&self, state: &mut BulkState, slot: usize) {
        if state.hot.len() as u32 >= self.bound {
            return;
        }
        loop {
            let candidate = state.rng.gen_range(0..self.bound);
            if !state.hot.contains(&candidate) {
                debug!(old = state.hot[slot], new = candidate, "ids.placement.rotate");
                state.hot[slot] = candidate;
                return;
            }
        }
    }
}

impl PartitionPlacement for BulkPlacement {
    fn partition_for(&self, hint: &PlacementHint<'_>) -> PartitionId {
        if let Some(p) = hint.explicit {
            return p;
        }
        let n = self.allocations.fetch_add(1, Ordering::Relaxed) + 1;
        let mut state = self.state.lock();
        let len = state.hot.len();
        let slot = state.rng.gen_range(0..len);
        let partition = state.hot[slot];
        if self.rotate_after > 0 && n % self.rotate_after == 0 {
            self.replace(&mut state, slot);
        }
        PartitionId(partition)
    }

    fn exhausted(&self, partition: PartitionId) {
        let mut state = self.state.lock();
        if let Some(slot) = state.hot.iter().position(|p| *p == partition.0) {
            self.replace(&mut state, slot);
        }
    }

    fn name(&self) -> &'static str {
        "bulk"
    }
}

/// Routes elements sharing a property value to the same partition.
pub struct PropertyPlacement {
    key: String,
    ids: IdManager,
    fallback: RoundRobinPlacement,
}

impl PropertyPlacement {
    /// Creates a strategy routing on `key`.
    pub fn new(key: impl Into<String>, ids: IdManager) -> Self {
        Self {
            key: key.into(),
            ids,
            fallback: RoundRobinPlacement::new(ids.partition_bound()),
        }
    }
}

impl PartitionPlacement for PropertyPlacement {
    fn partition_for(&self, hint: &PlacementHint<'_>) -> PartitionId {
        if let Some(p) = hint.explicit {
            return p;
        }
        match hint.properties.iter().find(|(k, _)| *k == self.key) {
            Some((_, value)) => PartitionId(self.ids.partition_hash(xxh64(&value.encode(), 0))),
            None => self.fallback.partition_for(hint),
        }
    }

    fn name(&self) -> &'static str {
        "property"
    }
}

/// Builds the configured strategy.
pub fn from_config(cfg: &IdsConfig, ids: IdManager) -> Box<dyn PartitionPlacement> {
    let bound = ids.partition_bound();
    match cfg.placement {
        PlacementKind::Default => Box::new(RoundRobinPlacement::new(bound)),
        PlacementKind::Bulk => Box::new(BulkPlacement::new(
            bound,
            cfg.concurrent_partitions,
            cfg.bulk_rotate_after,
        )),
        PlacementKind::Property => Box::new(PropertyPlacement::new(
            cfg.placement_property_key.clone().unwrap_or_default(),
            ids,
        )),
    }
}
