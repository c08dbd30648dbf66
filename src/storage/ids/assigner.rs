//! Element id assignment.

use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use super::authority::{IdAuthority, IdNamespace};
use super::custom::validate_string_id;
use super::manager::{IdKind, IdManager};
use super::placement::{self, PartitionPlacement, PlacementHint};
use super::pool::IdPool;
use crate::config::IdsConfig;
use crate::primitives::kcv::KeyColumnValueStore;
use crate::types::{ElementId, PartitionId, PenumbraError, Result, VertexId};

/// What an id is being allocated for.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum IdCategory {
    /// Ordinary vertex.
    Vertex,
    /// Vertex of a partitioned label.
    PartitionedVertex,
    /// Vertex of a static label.
    UnmodifiableVertex,
    /// Edge or property.
    Relation,
    /// Property key.
    PropertyKey,
    /// Edge label.
    EdgeLabel,
    /// Vertex label.
    VertexLabel,
    /// Index or other schema element.
    GenericSchema,
}

/// Custom vertex id policy.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct CustomIdPolicy {
    /// Vertices must carry caller-supplied ids.
    pub allow_ids: bool,
    /// String ids are accepted too.
    pub allow_types: bool,
}

/// Allocates unique element ids from per-partition pools.
pub struct IdAssigner {
    ids: IdManager,
    authority: Arc<IdAuthority>,
    renew_fraction: f64,
    pools: Mutex<FxHashMap<(u32, IdNamespace), Arc<IdPool>>>,
    placement: Box<dyn PartitionPlacement>,
    policy: CustomIdPolicy,
}

impl IdAssigner {
    /// Creates an assigner leasing blocks from `store` as `instance_id`.
    pub fn new(
        ids: IdManager,
        store: Arc<dyn KeyColumnValueStore>,
        instance_id: &str,
        cfg: &IdsConfig,
        policy: CustomIdPolicy,
    ) -> Self {
        Self::with_placement(ids, store, instance_id, cfg, policy, placement::from_config(cfg, ids))
    }

    /// Creates an assigner with an explicit placement strategy.
    pub fn with_placement(
        ids: IdManager,
        store: Arc<dyn KeyColumnValueStore>,
        instance_id: &str,
        cfg: &IdsConfig,
        policy: CustomIdPolicy,
        placement: Box<dyn PartitionPlacement>,
    ) -> Self {
        Self {
            ids,
            authority: Arc::new(IdAuthority::new(store, instance_id, cfg)),
            renew_fraction: cfg.renew_percentage,
            pools: Mutex::new(FxHashMap::default()),
            placement,
            policy,
        }
    }

    /// Id layout in use.
    pub fn id_manager(&self) -> &IdManager {
        &self.ids
    }

    /// Custom id policy in use.
    pub fn policy(&self) -> CustomIdPolicy {
        self.policy
    }

    /// Allocates a fresh id for `category`.
    ///
    /// Vertices are placed by the configured strategy unless the hint forces a
    /// partition; relations should be placed in their vertex's partition.
    pub fn allocate(&self, category: IdCategory, hint: &PlacementHint<'_>) -> Result<ElementId> {
        let id = match category {
            IdCategory::Vertex => self.allocate_vertex(IdKind::NormalVertex, hint)?,
            IdCategory::UnmodifiableVertex => {
                self.allocate_vertex(IdKind::UnmodifiableVertex, hint)?
            }
            IdCategory::PartitionedVertex => {
                let count = self
                    .pool(PartitionId(0), IdNamespace::PartitionedVertex)
                    .next_id()?;
                self.ids.partitioned_vertex_id(count)?
            }
            IdCategory::Relation => {
                let partition = self.placement.partition_for(hint);
                let count = self.pool(partition, IdNamespace::Relation).next_id()?;
                self.ids.relation_id(count, partition)?
            }
            IdCategory::PropertyKey => self.allocate_schema(IdKind::PropertyKey)?,
            IdCategory::EdgeLabel => self.allocate_schema(IdKind::EdgeLabel)?,
            IdCategory::VertexLabel => self.allocate_schema(IdKind::VertexLabel)?,
            IdCategory::GenericSchema => self.allocate_schema(IdKind::GenericSchema)?,
        };
        Ok(ElementId(id))
    }

    /// Checks a caller-supplied vertex id against the custom id policy.
    pub fn validate_custom(&self, id: &VertexId) -> Result<VertexId> {
        if !self.policy.allow_ids {
            return Err(PenumbraError::InvalidId(
                "Vertex does not support user supplied identifiers".into(),
            ));
        }
        match id {
            VertexId::Long(raw) => {
                if self.ids.from_vertex_id(*raw).is_err() {
                    return Err(PenumbraError::InvalidId(format!("Not a valid vertex id: {raw}")));
                }
                Ok(id.clone())
            }
            VertexId::Str(s) => {
                if !self.policy.allow_types {
                    return Err(PenumbraError::InvalidId(
                        "Vertex does not support user supplied identifiers of this type".into(),
                    ));
                }
                validate_string_id(s)?;
                Ok(id.clone())
            }
        }
    }

    /// Drops every leased block.
    pub fn flush(&self) {
        for pool in self.pools.lock().values() {
            pool.flush();
        }
    }

    /// Flushes and closes every pool.
    pub fn close(&self) {
        let pools: Vec<_> = self.pools.lock().drain().map(|(_, p)| p).collect();
        for pool in pools {
            pool.close();
        }
    }

    fn allocate_vertex(&self, kind: IdKind, hint: &PlacementHint<'_>) -> Result<u64> {
        let attempts = self.ids.partition_bound().max(1);
        for _ in 0..attempts {
            let partition = self.placement.partition_for(hint);
            match self.pool(partition, IdNamespace::Vertex).next_id() {
                Ok(count) => return self.ids.vertex_id(kind, count, partition),
                Err(PenumbraError::IdPoolExhausted(msg)) => {
                    warn!(partition = partition.0, strategy = self.placement.name(), "ids.partition.exhausted");
                    self.placement.exhausted(partition);
                    if hint.explicit.is_some() {
                        return Err(PenumbraError::IdPoolExhausted(msg));
                    }
                }
                Err(err) => return Err(err),
            }
        }
        Err(PenumbraError::IdPoolExhausted(
            "no partition with free vertex ids".into(),
        ))
    }

    fn allocate_schema(&self, kind: IdKind) -> Result<u64> {
        let count = self.pool(PartitionId(0), IdNamespace::Schema).next_id()?;
        let id = self.ids.schema_id(kind, count)?;
        debug!(kind = ?kind, id, "ids.schema.allocated");
        Ok(id)
    }

    fn pool(&self, partition: PartitionId, namespace: IdNamespace) -> Arc<IdPool> {
        let bound = match namespace {
            IdNamespace::Vertex | IdNamespace::PartitionedVertex => self.ids.vertex_count_bound(),
            IdNamespace::Relation => self.ids.relation_count_bound(),
            IdNamespace::Schema => self.ids.schema_count_bound(IdKind::PropertyKey),
        };
        let mut pools = self.pools.lock();
        Arc::clone(pools.entry((partition.0, namespace)).or_insert_with(|| {
            Arc::new(IdPool::new(
                Arc::clone(&self.authority),
                partition,
                namespace,
                bound,
                self.renew_fraction,
            ))
        }))
    }
}
