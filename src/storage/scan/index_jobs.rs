//! Jobs that rebuild or delete the records of one index.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, warn};

use super::{ScanJob, ScanMetrics};
use crate::primitives::kcv::{Entry, KeyColumnValueStore, SliceQuery};
use crate::storage::indexing::{index_records, IndexStore, VertexView};
use crate::storage::layout::{composite_prefix, mixed_prefix, relation_index_prefix};
use crate::storage::schema::{IndexDef, SchemaStatus};
use crate::types::Result;

/// Stores an index job reads and writes.
#[derive(Clone)]
pub struct IndexStores {
    pub edgestore: Arc<dyn KeyColumnValueStore>,
    pub graphindex: Arc<dyn KeyColumnValueStore>,
    pub mixedindex: Arc<dyn KeyColumnValueStore>,
}

impl IndexStores {
    fn get(&self, store: IndexStore) -> &Arc<dyn KeyColumnValueStore> {
        match store {
            IndexStore::Graph => &self.graphindex,
            IndexStore::Mixed => &self.mixedindex,
            IndexStore::Edge => &self.edgestore,
        }
    }
}

/// Writes the records of every existing element into an index.
pub struct IndexRepairJob {
    def: IndexDef,
    stores: IndexStores,
}

impl IndexRepairJob {
    /// Repairs `def` from the vertex rows of `stores`.
    pub fn new(def: IndexDef, stores: IndexStores) -> Self {
        Self { def, stores }
    }
}

impl ScanJob for IndexRepairJob {
    fn describe(&self) -> String {
        format!("reindex {}", self.def.name())
    }

    fn run(&mut self, metrics: &ScanMetrics) -> Result<()> {
        for key in self.stores.edgestore.keys()? {
            let entries = self.stores.edgestore.get_slice(&key, &SliceQuery::all())?;
            let view = match VertexView::decode(&key, &entries, |l| l.is_live()) {
                Ok(view) => view,
                Err(err) => {
                    warn!(key = %hex::encode(&key), error = %err, "scan.reindex.row_undecodable");
                    metrics.failure();
                    continue;
                }
            };
            let records = index_records(&self.def, &view, SchemaStatus::is_maintained)?;
            let mut by_row: BTreeMap<(IndexStore, Vec<u8>), Vec<Entry>> = BTreeMap::new();
            for record in records {
                by_row
                    .entry((record.store, record.row))
                    .or_default()
                    .push(Entry::new(record.column, record.value));
            }
            for ((store, row), additions) in by_row {
                let n = additions.len() as u64;
                self.stores.get(store).mutate(&row, additions, &[])?;
                metrics.added(n);
            }
            metrics.row();
        }
        debug!(index = self.def.name(), "scan.reindex.complete");
        Ok(())
    }
}

/// Deletes every record of an index.
pub struct IndexRemoveJob {
    def: IndexDef,
    stores: IndexStores,
}

impl IndexRemoveJob {
    /// Removes the records of `def` from `stores`.
    pub fn new(def: IndexDef, stores: IndexStores) -> Self {
        Self { def, stores }
    }

    fn clear_rows(
        store: &Arc<dyn KeyColumnValueStore>,
        prefix: &[u8],
        metrics: &ScanMetrics,
    ) -> Result<()> {
        for key in store.keys()?.into_iter().filter(|k| k.starts_with(prefix)) {
            let columns: Vec<Vec<u8>> = store
                .get_slice(&key, &SliceQuery::all())?
                .into_iter()
                .map(|e| e.column)
                .collect();
            let n = columns.len() as u64;
            store.mutate(&key, Vec::new(), &columns)?;
            metrics.deleted(n);
            metrics.row();
        }
        Ok(())
    }
}

impl ScanJob for IndexRemoveJob {
    fn describe(&self) -> String {
        format!("remove {}", self.def.name())
    }

    fn run(&mut self, metrics: &ScanMetrics) -> Result<()> {
        match &self.def {
            IndexDef::Composite(d) => {
                Self::clear_rows(&self.stores.graphindex, &composite_prefix(d.id), metrics)?
            }
            IndexDef::Mixed(d) => Self::clear_rows(
                &self.stores.mixedindex,
                &mixed_prefix(&d.backing, d.id),
                metrics,
            )?,
            IndexDef::Relation(d) => {
                let query = SliceQuery::prefix(&relation_index_prefix(d.id, None, &[]));
                for key in self.stores.edgestore.keys()? {
                    let columns: Vec<Vec<u8>> = self
                        .stores
                        .edgestore
                        .get_slice(&key, &query)?
                        .into_iter()
                        .map(|e| e.column)
                        .collect();
                    if !columns.is_empty() {
                        let n = columns.len() as u64;
                        self.stores.edgestore.mutate(&key, Vec::new(), &columns)?;
                        metrics.deleted(n);
                    }
                    metrics.row();
                }
            }
        }
        debug!(index = self.def.name(), "scan.remove.complete");
        Ok(())
    }
}
