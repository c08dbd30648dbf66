//! Graph transactions.
//!
//! Writes are staged in a per-transaction overlay of vertex rows and reach the
//! backend only at commit. Reads merge the overlay over the stored rows, so a
//! transaction sees its own changes. Relation types with the LOCK modifier take
//! expected-value locks on the cells they touch; FORK types replace a relation
//! by a new one instead of mutating it, and the replaced relation stays
//! readable for transactions that started earlier.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use super::query::{GraphQuery, VertexEdgeQuery};
use super::Graph;
use crate::primitives::concurrency::KeyColumn;
use crate::primitives::kcv::{Entry, KeyColumnValueStore, SliceQuery};
use crate::storage::clock;
use crate::storage::ids::{
    vertex_from_row_key, vertex_partition, vertex_row_key, IdCategory, PlacementHint,
};
use crate::storage::indexing::{diff_records, index_records, IndexStore, VertexView};
use crate::storage::layout::{
    edge_column, edge_prefix, is_edge_column, is_property_column, property_column,
    property_prefix, sort_value, vertex_marker, EdgeCell, EdgeColumn, Lineage, PropertyCell,
    VertexCell,
};
use crate::storage::locking::{ConsistentKeyLocker, LockState};
use crate::storage::mgmt::{KcvLog, LogId};
use crate::storage::schema::{
    Cardinality, ConsistencyModifier, DataType, EdgeLabelDef, ElementCategory, IndexDef,
    Multiplicity, PropertyKeyDef, SchemaElement, SchemaStatus, VertexLabelDef,
};
use crate::types::{Direction, PenumbraError, PropertyValue, RelationId, Result, SchemaId, VertexId};

/// A vertex property as read by a transaction.
#[derive(Clone, Debug, PartialEq)]
pub struct Property {
    pub id: RelationId,
    pub key: String,
    pub value: PropertyValue,
}

/// An edge as read by a transaction.
#[derive(Clone, Debug, PartialEq)]
pub struct Edge {
    pub id: RelationId,
    pub label: String,
    pub out: VertexId,
    pub inv: VertexId,
    pub properties: Vec<(String, PropertyValue)>,
}

impl Edge {
    /// Value of `key`, if set.
    pub fn property(&self, key: &str) -> Option<&PropertyValue> {
        self.properties.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }
}

/// A secondary write that failed after the primary commit succeeded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SecondaryFailure {
    pub log: String,
    pub error: String,
}

/// Outcome of a successful commit.
#[derive(Clone, Debug, Default)]
pub struct CommitReport {
    pub commit_ts: u64,
    /// Rows written across all stores.
    pub mutated_rows: usize,
    /// Transaction and user log appends that failed.
    pub secondary_failures: Vec<SecondaryFailure>,
}

impl CommitReport {
    /// Whether every secondary write succeeded too.
    pub fn is_clean(&self) -> bool {
        self.secondary_failures.is_empty()
    }
}

/// Change record appended to the transaction log and user logs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxLogEntry {
    pub instance_id: String,
    pub transaction: String,
    pub commit_ts: u64,
    pub vertices: Vec<VertexId>,
    pub mutated_rows: usize,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum TxState {
    Open,
    Committed,
    RolledBack,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Stamp {
    Forked,
    Superseded,
}

#[derive(Copy, Clone)]
enum LockedStore {
    Edges,
    Index,
}

type Overlay = BTreeMap<Vec<u8>, BTreeMap<Vec<u8>, Option<Entry>>>;
type RowMutation = (Vec<Entry>, Vec<Vec<u8>>);

/// A unit of work against one graph instance.
pub struct GraphTx {
    graph: Graph,
    seq: u64,
    start_ts: u64,
    log: Option<String>,
    locks: LockState,
    overlay: Overlay,
    stamps: FxHashMap<(Vec<u8>, Vec<u8>), Stamp>,
    created: FxHashSet<RelationId>,
    superseded: FxHashSet<RelationId>,
    forks: FxHashMap<RelationId, RelationId>,
    new_vertices: FxHashSet<Vec<u8>>,
    unique_claims: FxHashMap<Vec<u8>, Vec<u8>>,
    released: FxHashSet<Vec<u8>>,
    state: TxState,
}

impl GraphTx {
    pub(super) fn begin(graph: Graph, log: Option<String>) -> Self {
        let seq = graph.inner.tracker.begin();
        let holder = format!("{}:{}", graph.inner.instance_id, seq);
        trace!(holder = %holder, "tx.begin");
        Self {
            graph,
            seq,
            start_ts: clock::now_nanos(),
            log,
            locks: LockState::new(holder),
            overlay: BTreeMap::new(),
            stamps: FxHashMap::default(),
            created: FxHashSet::default(),
            superseded: FxHashSet::default(),
            forks: FxHashMap::default(),
            new_vertices: FxHashSet::default(),
            unique_claims: FxHashMap::default(),
            released: FxHashSet::default(),
            state: TxState::Open,
        }
    }

    /// Graph the transaction belongs to.
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Timestamp the transaction reads forked relations at.
    pub fn start_ts(&self) -> u64 {
        self.start_ts
    }

    /// Whether neither commit nor rollback happened yet.
    pub fn is_open(&self) -> bool {
        self.state == TxState::Open
    }

    /// Number of cells this transaction holds locks on.
    pub fn lock_count(&self) -> usize {
        self.locks.len()
    }

    /// Starts a graph-wide query.
    pub fn query(&self) -> GraphQuery<'_> {
        GraphQuery::new(self)
    }

    /// Starts a query over the edges of `vertex`.
    pub fn vertex_query(&self, vertex: &VertexId) -> VertexEdgeQuery<'_> {
        VertexEdgeQuery::new(self, vertex.clone())
    }

    // ---------------------------------------------------------------------
    // vertices

    /// Creates a vertex without a label.
    pub fn add_vertex(&mut self) -> Result<VertexId> {
        self.create_vertex(None, None, &[])
    }

    /// Creates a vertex with `label`.
    pub fn add_labeled_vertex(&mut self, label: &str) -> Result<VertexId> {
        self.create_vertex(None, Some(label), &[])
    }

    /// Creates a vertex and its initial properties; the properties also guide
    /// partition placement.
    pub fn add_vertex_with(
        &mut self,
        label: Option<&str>,
        properties: &[(&str, PropertyValue)],
    ) -> Result<VertexId> {
        let owned: Vec<(String, PropertyValue)> = properties
            .iter()
            .map(|(k, v)| ((*k).to_owned(), v.clone()))
            .collect();
        self.create_vertex(None, label, &owned)
    }

    /// Creates a vertex under a caller-supplied id.
    pub fn add_vertex_with_id(
        &mut self,
        id: impl Into<VertexId>,
        label: Option<&str>,
    ) -> Result<VertexId> {
        self.create_vertex(Some(id.into()), label, &[])
    }

    /// Whether `vertex` exists for this transaction.
    pub fn vertex_exists(&self, vertex: &VertexId) -> Result<bool> {
        let key = self.row_key(vertex)?;
        Ok(self.view(&key)?.exists)
    }

    /// Label name of `vertex`.
    pub fn vertex_label(&self, vertex: &VertexId) -> Result<Option<String>> {
        let key = self.row_key(vertex)?;
        let view = self.existing_view(vertex, &key)?;
        match view.label {
            Some(label) => Ok(Some(self.schema_name(label)?)),
            None => Ok(None),
        }
    }

    /// Deletes `vertex` with its properties and incident edges.
    pub fn remove_vertex(&mut self, vertex: &VertexId) -> Result<()> {
        self.ensure_open()?;
        let key = self.row_key(vertex)?;
        let view = self.existing_view(vertex, &key)?;
        self.check_writable(&view)?;
        for (col, cell) in &view.edges {
            let def = self.edge_label_def(cell.label)?;
            let (okey, ikey) = match col.direction {
                Direction::In => (col.other.clone(), key.clone()),
                _ => (key.clone(), col.other.clone()),
            };
            if def.consistency == ConsistencyModifier::Lock {
                let (out_col, _) = self.edge_columns(&def, cell, &okey, &ikey);
                self.lock_cell(LockedStore::Edges, &okey, &out_col)?;
            }
            let (out_col, in_col) = self.edge_columns(&def, cell, &okey, &ikey);
            self.stage_delete(&okey, out_col);
            self.stage_delete(&ikey, in_col);
        }
        for entry in self.merged(&key, &SliceQuery::all())? {
            self.stage_delete(&key, entry.column);
        }
        self.release_claims(&view, &VertexView {
            key: key.clone(),
            ..VertexView::default()
        })?;
        debug!(vertex = %vertex, "tx.vertex.removed");
        Ok(())
    }

    fn create_vertex(
        &mut self,
        id: Option<VertexId>,
        label: Option<&str>,
        properties: &[(String, PropertyValue)],
    ) -> Result<VertexId> {
        self.ensure_open()?;
        let label = match label {
            Some(name) => Some(self.vertex_label_named(name)?),
            None => None,
        };
        let assigner = &self.graph.inner.assigner;
        let vertex = match id {
            Some(id) => {
                let id = assigner.validate_custom(&id)?;
                if label.as_ref().map_or(false, |l| l.partitioned) {
                    return Err(PenumbraError::InvalidId(
                        "Custom vertex ids are not supported for partitioned vertex labels".into(),
                    ));
                }
                id
            }
            None if assigner.policy().allow_ids => {
                return Err(PenumbraError::InvalidId("Must provide vertex id".into()))
            }
            None => {
                let category = match &label {
                    Some(l) if l.partitioned => IdCategory::PartitionedVertex,
                    Some(l) if l.is_static => IdCategory::UnmodifiableVertex,
                    _ => IdCategory::Vertex,
                };
                VertexId::Long(assigner.allocate(category, &PlacementHint::with_properties(properties))?.0)
            }
        };
        let key = self.row_key(&vertex)?;
        if self.view(&key)?.exists {
            return Err(PenumbraError::SchemaViolation(format!("vertex {vertex} already exists")));
        }
        let cell = VertexCell {
            label: label.as_ref().map(|l| l.id),
            created_at: self.start_ts,
        };
        let ttl = label
            .as_ref()
            .and_then(|l| SchemaElement::VertexLabel(l.clone()).ttl());
        self.stage(&key, Entry::new(vertex_marker(), encode(&cell)?).with_ttl(ttl));
        self.new_vertices.insert(key);
        for (name, value) in properties {
            self.set_property(&vertex, name, value.clone())?;
        }
        trace!(vertex = %vertex, "tx.vertex.added");
        Ok(vertex)
    }

    // ---------------------------------------------------------------------
    // properties

    /// Sets `key` on `vertex` following the key's cardinality: SINGLE replaces,
    /// SET ignores duplicates, LIST appends.
    pub fn set_property(
        &mut self,
        vertex: &VertexId,
        key: &str,
        value: impl Into<PropertyValue>,
    ) -> Result<RelationId> {
        self.ensure_open()?;
        let value = value.into();
        let vkey = self.row_key(vertex)?;
        let view = self.existing_view(vertex, &vkey)?;
        self.check_writable(&view)?;
        let def = self.property_key_named(key, &value)?;
        check_data_type(&def, &value)?;
        if def.cardinality == Cardinality::Set {
            if let Some((_, existing)) = view
                .properties
                .iter()
                .find(|(_, p)| p.key == def.id && p.value == value)
            {
                return Ok(existing.id);
            }
        }
        if def.consistency == ConsistencyModifier::Lock {
            self.lock_cell(LockedStore::Edges, &vkey, &property_prefix(Some(def.id)))?;
        }
        let id = self.relation_id(vertex)?;
        let column = property_column(def.id, def.cardinality, id);
        let cell = PropertyCell {
            id,
            key: def.id,
            value,
            lineage: Lineage::root(id),
        };
        let mut after = view.clone();
        if def.cardinality == Cardinality::Single {
            after.properties.retain(|(_, p)| p.key != def.id);
        }
        after.properties.push((column.clone(), cell.clone()));
        self.check_unique(&view, &after, def.id)?;
        let ttl = SchemaElement::PropertyKey(def.clone()).ttl();
        self.stage(&vkey, Entry::new(column, encode(&cell)?).with_ttl(ttl));
        self.created.insert(id);
        Ok(id)
    }

    /// Values of `key` on `vertex`.
    pub fn properties(&self, vertex: &VertexId, key: &str) -> Result<Vec<Property>> {
        let vkey = self.row_key(vertex)?;
        let view = self.existing_view(vertex, &vkey)?;
        let Some(element) = self.graph.inner.schema.get_by_name(key)? else {
            return Ok(Vec::new());
        };
        Ok(view
            .properties
            .iter()
            .filter(|(_, p)| p.key == element.id())
            .map(|(_, p)| Property {
                id: p.id,
                key: key.to_owned(),
                value: p.value.clone(),
            })
            .collect())
    }

    /// First value of `key` on `vertex`.
    pub fn value(&self, vertex: &VertexId, key: &str) -> Result<Option<PropertyValue>> {
        Ok(self.properties(vertex, key)?.into_iter().next().map(|p| p.value))
    }

    /// Changes the value of one property.
    ///
    /// Keys with the FORK modifier get a new property that replaces the old
    /// one; repeated updates in one transaction keep changing that new property.
    pub fn update_property(
        &mut self,
        vertex: &VertexId,
        property: RelationId,
        value: impl Into<PropertyValue>,
    ) -> Result<RelationId> {
        self.ensure_open()?;
        let value = value.into();
        let vkey = self.row_key(vertex)?;
        let view = self.existing_view(vertex, &vkey)?;
        self.check_writable(&view)?;
        let latest = self.latest(property);
        let (column, cell) = view
            .properties
            .iter()
            .find(|(_, p)| p.id == latest)
            .cloned()
            .ok_or_else(|| PenumbraError::NotFound(format!("property {property}")))?;
        let def = self.property_key_def(cell.key)?;
        check_data_type(&def, &value)?;
        if def.consistency == ConsistencyModifier::Lock {
            self.lock_cell(LockedStore::Edges, &vkey, &property_prefix(Some(def.id)))?;
        }
        let ttl = SchemaElement::PropertyKey(def.clone()).ttl();
        let mut after = view.clone();
        after.properties.retain(|(_, p)| p.id != latest);
        if def.consistency == ConsistencyModifier::Fork && !self.created.contains(&latest) {
            let id = self.relation_id(vertex)?;
            let new_column = property_column(def.id, def.cardinality, id);
            let forked = PropertyCell {
                id,
                key: def.id,
                value,
                lineage: cell.lineage.fork(),
            };
            after.properties.push((new_column.clone(), forked.clone()));
            self.check_unique(&view, &after, def.id)?;
            self.stage(&vkey, Entry::new(column.clone(), encode(&cell)?).with_ttl(ttl));
            self.stamps.insert((vkey.clone(), column), Stamp::Superseded);
            self.stage(&vkey, Entry::new(new_column.clone(), encode(&forked)?).with_ttl(ttl));
            self.stamps.insert((vkey, new_column), Stamp::Forked);
            self.superseded.insert(latest);
            self.created.insert(id);
            self.forks.insert(latest, id);
            debug!(from = latest.0, to = id.0, "tx.property.forked");
            return Ok(id);
        }
        let updated = PropertyCell { value, ..cell };
        after.properties.push((column.clone(), updated.clone()));
        self.check_unique(&view, &after, def.id)?;
        self.stage(&vkey, Entry::new(column, encode(&updated)?).with_ttl(ttl));
        Ok(latest)
    }

    /// Deletes one property.
    pub fn remove_property(&mut self, vertex: &VertexId, property: RelationId) -> Result<()> {
        self.ensure_open()?;
        let vkey = self.row_key(vertex)?;
        let view = self.existing_view(vertex, &vkey)?;
        self.check_writable(&view)?;
        let latest = self.latest(property);
        let (column, cell) = view
            .properties
            .iter()
            .find(|(_, p)| p.id == latest)
            .cloned()
            .ok_or_else(|| PenumbraError::NotFound(format!("property {property}")))?;
        let def = self.property_key_def(cell.key)?;
        if def.consistency == ConsistencyModifier::Lock {
            self.lock_cell(LockedStore::Edges, &vkey, &property_prefix(Some(def.id)))?;
        }
        let mut after = view.clone();
        after.properties.retain(|(_, p)| p.id != latest);
        self.release_claims(&view, &after)?;
        self.stamps.remove(&(vkey.clone(), column.clone()));
        self.stage_delete(&vkey, column);
        Ok(())
    }

    // ---------------------------------------------------------------------
    // edges

    /// Creates an edge `out -label-> inv`.
    pub fn add_edge(&mut self, out: &VertexId, label: &str, inv: &VertexId) -> Result<Edge> {
        self.add_edge_with(out, label, inv, &[])
    }

    /// Creates an edge with initial properties.
    pub fn add_edge_with(
        &mut self,
        out: &VertexId,
        label: &str,
        inv: &VertexId,
        properties: &[(&str, PropertyValue)],
    ) -> Result<Edge> {
        self.ensure_open()?;
        let okey = self.row_key(out)?;
        let ikey = self.row_key(inv)?;
        let out_view = self.existing_view(out, &okey)?;
        let in_view = self.existing_view(inv, &ikey)?;
        self.check_writable(&out_view)?;
        self.check_writable(&in_view)?;
        let def = self.edge_label_named(label)?;
        let mut props = Vec::with_capacity(properties.len());
        for (name, value) in properties {
            let key = self.property_key_named(name, value)?;
            check_data_type(&key, value)?;
            props.push((key.id, value.clone()));
        }
        self.check_multiplicity(&def, &out_view, &in_view)?;
        let id = self.relation_id(out)?;
        let cell = EdgeCell {
            id,
            label: def.id,
            properties: props,
            lineage: Lineage::root(id),
        };
        let (out_col, in_col) = self.edge_columns(&def, &cell, &okey, &ikey);
        if def.consistency == ConsistencyModifier::Lock && !def.multiplicity.is_constrained() {
            self.lock_cell(LockedStore::Edges, &okey, &out_col)?;
        }
        let ttl = SchemaElement::EdgeLabel(def.clone()).ttl();
        let raw = encode(&cell)?;
        self.stage(&okey, Entry::new(out_col, raw.clone()).with_ttl(ttl));
        self.stage(&ikey, Entry::new(in_col, raw).with_ttl(ttl));
        self.created.insert(id);
        trace!(edge = id.0, label = %def.name, "tx.edge.added");
        self.to_edge(&def, &cell, out.clone(), inv.clone())
    }

    /// Edges of `vertex` in `direction`, optionally limited to one label.
    pub fn edges(
        &self,
        vertex: &VertexId,
        direction: Direction,
        label: Option<&str>,
    ) -> Result<Vec<Edge>> {
        let key = self.row_key(vertex)?;
        let view = self.existing_view(vertex, &key)?;
        let label_id = match label {
            Some(name) => match self.graph.inner.schema.get_by_name(name)? {
                Some(element) => Some(element.id()),
                None => return Ok(Vec::new()),
            },
            None => None,
        };
        let mut out = Vec::new();
        for (col, cell) in &view.edges {
            if direction != Direction::Both && col.direction != direction {
                continue;
            }
            if label_id.map_or(false, |l| l != cell.label) {
                continue;
            }
            out.push(self.edge_at(vertex, col, cell)?);
        }
        Ok(out)
    }

    /// Sets a property on `edge`.
    ///
    /// Labels with the FORK modifier replace the edge by a new one carrying the
    /// change; the returned edge has the new id.
    pub fn set_edge_property(
        &mut self,
        edge: &Edge,
        key: &str,
        value: impl Into<PropertyValue>,
    ) -> Result<Edge> {
        self.ensure_open()?;
        let value = value.into();
        let (def, okey, ikey, cell) = self.find_edge(edge)?;
        let key_def = self.property_key_named(key, &value)?;
        check_data_type(&key_def, &value)?;
        let ttl = SchemaElement::EdgeLabel(def.clone()).ttl();
        let (old_out, old_in) = self.edge_columns(&def, &cell, &okey, &ikey);
        let mut updated = cell.clone();
        updated.set_property(key_def.id, value);
        if def.consistency == ConsistencyModifier::Fork && !self.created.contains(&cell.id) {
            let id = self.relation_id(&edge.out)?;
            updated.id = id;
            updated.lineage = cell.lineage.fork();
            let old_raw = encode(&cell)?;
            let new_raw = encode(&updated)?;
            let (new_out, new_in) = self.edge_columns(&def, &updated, &okey, &ikey);
            for (row, column, raw, stamp) in [
                (&okey, old_out, &old_raw, Stamp::Superseded),
                (&ikey, old_in, &old_raw, Stamp::Superseded),
                (&okey, new_out, &new_raw, Stamp::Forked),
                (&ikey, new_in, &new_raw, Stamp::Forked),
            ] {
                self.stage(row, Entry::new(column.clone(), raw.clone()).with_ttl(ttl));
                self.stamps.insert((row.clone(), column), stamp);
            }
            self.superseded.insert(cell.id);
            self.created.insert(id);
            self.forks.insert(cell.id, id);
            debug!(from = cell.id.0, to = id.0, "tx.edge.forked");
        } else {
            if def.consistency == ConsistencyModifier::Lock {
                self.lock_cell(LockedStore::Edges, &okey, &old_out)?;
            }
            let (new_out, new_in) = self.edge_columns(&def, &updated, &okey, &ikey);
            let raw = encode(&updated)?;
            for (row, old, new) in [(&okey, old_out, new_out), (&ikey, old_in, new_in)] {
                let stamp = self.stamps.remove(&(row.clone(), old.clone()));
                if old != new {
                    self.stage_delete(row, old);
                }
                if let Some(stamp) = stamp {
                    self.stamps.insert((row.clone(), new.clone()), stamp);
                }
                self.stage(row, Entry::new(new, raw.clone()).with_ttl(ttl));
            }
        }
        self.to_edge(&def, &updated, edge.out.clone(), edge.inv.clone())
    }

    /// Deletes `edge`.
    pub fn remove_edge(&mut self, edge: &Edge) -> Result<()> {
        self.ensure_open()?;
        let (def, okey, ikey, cell) = self.find_edge(edge)?;
        let (out_col, in_col) = self.edge_columns(&def, &cell, &okey, &ikey);
        if def.consistency == ConsistencyModifier::Lock {
            self.lock_cell(LockedStore::Edges, &okey, &out_col)?;
        }
        for (row, column) in [(okey, out_col), (ikey, in_col)] {
            self.stamps.remove(&(row.clone(), column.clone()));
            self.stage_delete(&row, column);
        }
        Ok(())
    }

    fn find_edge(&self, edge: &Edge) -> Result<(EdgeLabelDef, Vec<u8>, Vec<u8>, EdgeCell)> {
        let okey = self.row_key(&edge.out)?;
        let ikey = self.row_key(&edge.inv)?;
        let out_view = self.existing_view(&edge.out, &okey)?;
        let in_view = self.existing_view(&edge.inv, &ikey)?;
        self.check_writable(&out_view)?;
        self.check_writable(&in_view)?;
        let latest = self.latest(edge.id);
        let cell = out_view
            .out_edges()
            .find(|(col, _)| col.relation == latest)
            .map(|(_, cell)| cell.clone())
            .ok_or_else(|| PenumbraError::NotFound(format!("edge {}", edge.id)))?;
        let def = self.edge_label_def(cell.label)?;
        Ok((def, okey, ikey, cell))
    }

    fn check_multiplicity(
        &mut self,
        def: &EdgeLabelDef,
        out_view: &VertexView,
        in_view: &VertexView,
    ) -> Result<()> {
        let lock = def.consistency == ConsistencyModifier::Lock;
        let has = |view: &VertexView, dir: Direction, other: Option<&[u8]>| {
            view.edges.iter().any(|(c, e)| {
                c.direction == dir
                    && e.label == def.id
                    && other.map_or(true, |o| c.other.as_slice() == o)
            })
        };
        let violated = match def.multiplicity {
            Multiplicity::Multi => false,
            Multiplicity::Simple => has(out_view, Direction::Out, Some(&in_view.key)),
            m => {
                (m.is_unique(Direction::Out) && has(out_view, Direction::Out, None))
                    || (m.is_unique(Direction::In) && has(in_view, Direction::In, None))
            }
        };
        if violated {
            return Err(PenumbraError::SchemaViolation(format!(
                "multiplicity {:?} of edge label {} does not allow another edge",
                def.multiplicity, def.name
            )));
        }
        if lock && def.multiplicity.is_constrained() {
            if def.multiplicity == Multiplicity::Simple
                || def.multiplicity.is_unique(Direction::Out)
            {
                let column = edge_prefix(Some(def.id), Some(Direction::Out));
                self.lock_cell(LockedStore::Edges, &out_view.key, &column)?;
            }
            if def.multiplicity.is_unique(Direction::In) {
                let column = edge_prefix(Some(def.id), Some(Direction::In));
                self.lock_cell(LockedStore::Edges, &in_view.key, &column)?;
            }
        }
        Ok(())
    }

    fn edge_columns(
        &self,
        def: &EdgeLabelDef,
        cell: &EdgeCell,
        okey: &[u8],
        ikey: &[u8],
    ) -> (Vec<u8>, Vec<u8>) {
        let sort: Vec<Vec<u8>> = def
            .sort_key
            .iter()
            .map(|k| {
                cell.property(*k)
                    .map(|v| sort_value(v, def.sort_order))
                    .unwrap_or_default()
            })
            .collect();
        (
            edge_column(def.id, Direction::Out, &sort, ikey, cell.id),
            edge_column(def.id, Direction::In, &sort, okey, cell.id),
        )
    }

    pub(crate) fn edge_at(&self, vertex: &VertexId, col: &EdgeColumn, cell: &EdgeCell) -> Result<Edge> {
        let other = vertex_from_row_key(&self.graph.inner.ids, &col.other)?;
        let (out, inv) = match col.direction {
            Direction::In => (other, vertex.clone()),
            _ => (vertex.clone(), other),
        };
        let def = self.edge_label_def(cell.label)?;
        self.to_edge(&def, cell, out, inv)
    }

    fn to_edge(&self, def: &EdgeLabelDef, cell: &EdgeCell, out: VertexId, inv: VertexId) -> Result<Edge> {
        let mut properties = Vec::with_capacity(cell.properties.len());
        for (key, value) in &cell.properties {
            properties.push((self.schema_name(*key)?, value.clone()));
        }
        Ok(Edge {
            id: cell.id,
            label: def.name.clone(),
            out,
            inv,
            properties,
        })
    }

    // ---------------------------------------------------------------------
    // commit

    /// Verifies locks, writes every staged change with its index records and
    /// appends the change record to the configured logs.
    ///
    /// Log append failures do not undo the commit; they are reported in
    /// [`CommitReport::secondary_failures`].
    pub fn commit(mut self) -> Result<CommitReport> {
        self.ensure_open()?;
        if let Err(err) = self.graph.ensure_usable() {
            self.close(TxState::RolledBack);
            return Err(err);
        }
        if let Err(err) = self.locks.check_all() {
            debug!(holder = %self.locks.holder(), error = %err, "tx.commit.lock_check_failed");
            self.close(TxState::RolledBack);
            return Err(err);
        }
        let commit_ts = clock::now_nanos();
        let primary = self.write_primary(commit_ts);
        self.locks.release_all();
        let (mutated_rows, vertices) = match primary {
            Ok(written) => written,
            Err(err) => {
                warn!(holder = %self.locks.holder(), error = %err, "tx.commit.failed");
                self.close(TxState::RolledBack);
                return Err(err);
            }
        };
        let entry = TxLogEntry {
            instance_id: self.graph.inner.instance_id.clone(),
            transaction: self.locks.holder().to_owned(),
            commit_ts,
            vertices,
            mutated_rows,
        };
        let secondary_failures = self.write_logs(&entry);
        self.close(TxState::Committed);
        debug!(rows = mutated_rows, failures = secondary_failures.len(), "tx.committed");
        Ok(CommitReport {
            commit_ts,
            mutated_rows,
            secondary_failures,
        })
    }

    /// Discards staged changes and releases locks.
    pub fn rollback(mut self) -> Result<()> {
        self.ensure_open()?;
        self.close(TxState::RolledBack);
        Ok(())
    }

    fn close(&mut self, state: TxState) {
        self.locks.release_all();
        self.graph.inner.tracker.finish(self.seq);
        self.state = state;
    }

    fn write_primary(&mut self, commit_ts: u64) -> Result<(usize, Vec<VertexId>)> {
        let inner = Arc::clone(&self.graph.inner);
        let mut rows: BTreeMap<Vec<u8>, RowMutation> = BTreeMap::new();
        for (row, cells) in &self.overlay {
            let slot = rows.entry(row.clone()).or_default();
            for (column, staged) in cells {
                match staged {
                    Some(entry) => slot.0.push(self.stamped(row, entry, commit_ts)?),
                    None => slot.1.push(column.clone()),
                }
            }
        }
        let maintained: Vec<IndexDef> = inner
            .schema
            .indexes()?
            .iter()
            .filter_map(|e| e.as_index())
            .filter(|d| d.statuses().iter().any(|(_, s)| s.is_maintained()))
            .cloned()
            .collect();
        let mut index_rows: BTreeMap<(IndexStore, Vec<u8>), RowMutation> = BTreeMap::new();
        if !maintained.is_empty() {
            for (row, (additions, deletions)) in &rows {
                let stored = inner.stores.edgestore.get_slice(row, &SliceQuery::all())?;
                let before = VertexView::decode(row, &stored, |l| l.is_live())?;
                let after = VertexView::decode(row, &apply(stored, additions, deletions), |l| l.is_live())?;
                for def in &maintained {
                    let (removed, added) = diff_records(
                        index_records(def, &before, SchemaStatus::is_maintained)?,
                        index_records(def, &after, SchemaStatus::is_maintained)?,
                    );
                    for record in removed {
                        index_rows
                            .entry((record.store, record.row))
                            .or_default()
                            .1
                            .push(record.column);
                    }
                    for record in added {
                        index_rows
                            .entry((record.store, record.row))
                            .or_default()
                            .0
                            .push(Entry::new(record.column, record.value));
                    }
                }
            }
        }
        for ((store, row), (additions, deletions)) in index_rows {
            if store == IndexStore::Edge {
                let slot = rows.entry(row).or_default();
                slot.0.extend(additions);
                slot.1.extend(deletions);
            } else {
                let target = match store {
                    IndexStore::Graph => &inner.stores.graphindex,
                    _ => &inner.stores.mixedindex,
                };
                target.mutate(&row, additions, &deletions)?;
            }
        }
        let mut vertices = Vec::new();
        let mut written = 0;
        for (row, (additions, deletions)) in rows {
            inner.stores.edgestore.mutate(&row, additions, &deletions)?;
            vertices.push(vertex_from_row_key(&inner.ids, &row)?);
            written += 1;
        }
        Ok((written, vertices))
    }

    fn stamped(&self, row: &[u8], entry: &Entry, commit_ts: u64) -> Result<Entry> {
        let Some(stamp) = self.stamps.get(&(row.to_vec(), entry.column.clone())) else {
            return Ok(entry.clone());
        };
        let set = |lineage: &mut Lineage| match stamp {
            Stamp::Forked => lineage.forked_at = Some(commit_ts),
            Stamp::Superseded => lineage.superseded_at = Some(commit_ts),
        };
        let value = if is_property_column(&entry.column) {
            let mut cell: PropertyCell = serde_json::from_slice(&entry.value)?;
            set(&mut cell.lineage);
            encode(&cell)?
        } else if is_edge_column(&entry.column) {
            let mut cell: EdgeCell = serde_json::from_slice(&entry.value)?;
            set(&mut cell.lineage);
            encode(&cell)?
        } else {
            entry.value.clone()
        };
        Ok(Entry {
            column: entry.column.clone(),
            value,
            ttl: entry.ttl,
        })
    }

    fn write_logs(&self, entry: &TxLogEntry) -> Vec<SecondaryFailure> {
        let inner = &self.graph.inner;
        let mut targets = Vec::new();
        if inner.cfg.log.transaction_log {
            targets.push(LogId::Transaction);
        }
        if let Some(name) = &self.log {
            targets.push(LogId::User(name.clone()));
        }
        let mut failures = Vec::new();
        if targets.is_empty() {
            return failures;
        }
        let payload = match encode(entry) {
            Ok(payload) => payload,
            Err(err) => {
                return targets
                    .iter()
                    .map(|log| SecondaryFailure {
                        log: log.to_string(),
                        error: err.to_string(),
                    })
                    .collect()
            }
        };
        for log in targets {
            let name = log.to_string();
            let kcv = KcvLog::new(Arc::clone(&inner.system_log), log, inner.instance_id.clone());
            if let Err(err) = kcv.append(payload.clone()) {
                warn!(log = %name, error = %err, "tx.commit.log_append_failed");
                failures.push(SecondaryFailure {
                    log: name,
                    error: err.to_string(),
                });
            }
        }
        failures
    }

    // ---------------------------------------------------------------------
    // reads

    pub(crate) fn row_key(&self, vertex: &VertexId) -> Result<Vec<u8>> {
        vertex_row_key(&self.graph.inner.ids, vertex)
    }

    /// Stored cells of `key` in `query` with this transaction's changes applied.
    pub(crate) fn merged(&self, key: &[u8], query: &SliceQuery) -> Result<Vec<Entry>> {
        let stored = self.graph.inner.stores.edgestore.get_slice(key, query)?;
        let Some(staged) = self.overlay.get(key) else {
            return Ok(stored);
        };
        let mut cells: BTreeMap<Vec<u8>, Entry> =
            stored.into_iter().map(|e| (e.column.clone(), e)).collect();
        for (column, entry) in staged.iter().filter(|(c, _)| query.contains(c)) {
            match entry {
                Some(entry) => {
                    cells.insert(column.clone(), entry.clone());
                }
                None => {
                    cells.remove(column);
                }
            }
        }
        Ok(cells.into_values().collect())
    }

    /// Vertex row as this transaction sees it.
    pub(crate) fn view(&self, key: &[u8]) -> Result<VertexView> {
        let entries = self.merged(key, &SliceQuery::all())?;
        let start = self.start_ts;
        let mut view = VertexView::decode(key, &entries, |l| l.visible_at(start))?;
        if !self.superseded.is_empty() {
            view.properties.retain(|(_, p)| !self.superseded.contains(&p.id));
            view.edges.retain(|(_, e)| !self.superseded.contains(&e.id));
        }
        Ok(view)
    }

    fn existing_view(&self, vertex: &VertexId, key: &[u8]) -> Result<VertexView> {
        let view = self.view(key)?;
        if !view.exists {
            return Err(PenumbraError::NotFound(format!("vertex {vertex}")));
        }
        Ok(view)
    }

    /// Rows this transaction changed.
    pub(crate) fn touched_rows(&self) -> impl Iterator<Item = &Vec<u8>> {
        self.overlay.keys()
    }

    fn latest(&self, mut id: RelationId) -> RelationId {
        while let Some(next) = self.forks.get(&id) {
            id = *next;
        }
        id
    }

    // ---------------------------------------------------------------------
    // staging and locking

    fn stage(&mut self, row: &[u8], entry: Entry) {
        self.overlay
            .entry(row.to_vec())
            .or_default()
            .insert(entry.column.clone(), Some(entry));
    }

    fn stage_delete(&mut self, row: &[u8], column: Vec<u8>) {
        self.overlay.entry(row.to_vec()).or_default().insert(column, None);
    }

    fn lock_cell(&mut self, store: LockedStore, key: &[u8], column: &[u8]) -> Result<()> {
        let inner = Arc::clone(&self.graph.inner);
        let (locker, kcv): (&Arc<ConsistentKeyLocker>, &Arc<dyn KeyColumnValueStore>) = match store {
            LockedStore::Edges => (&inner.lockers.edgestore, &inner.stores.edgestore),
            LockedStore::Index => (&inner.lockers.graphindex, &inner.stores.graphindex),
        };
        let expected = kcv.get(key, column)?;
        locker.write_lock(&mut self.locks, KeyColumn::new(key, column), expected)
    }

    /// Checks unique composite indexes over `key` for the records `after`
    /// adds, and claims them for this transaction.
    fn check_unique(&mut self, before: &VertexView, after: &VertexView, key: SchemaId) -> Result<()> {
        let inner = Arc::clone(&self.graph.inner);
        for element in inner.schema.indexes_on(key)? {
            let Some(IndexDef::Composite(d)) = element.as_index() else {
                continue;
            };
            if !d.unique
                || d.element != ElementCategory::Vertex
                || !d.fields.iter().all(|f| f.status.is_maintained())
            {
                continue;
            }
            let def = IndexDef::Composite(d.clone());
            let old: BTreeSet<Vec<u8>> = index_records(&def, before, SchemaStatus::is_maintained)?
                .into_iter()
                .map(|r| r.row)
                .collect();
            let new = index_records(&def, after, SchemaStatus::is_maintained)?;
            let kept: BTreeSet<&Vec<u8>> = new.iter().map(|r| &r.row).collect();
            for row in old.iter().filter(|r| !kept.contains(r)) {
                self.unique_claims.remove(row);
                self.released.insert(row.clone());
            }
            for record in new.into_iter().filter(|r| !old.contains(&r.row)) {
                if self
                    .unique_claims
                    .get(&record.row)
                    .map_or(false, |owner| owner != &record.value)
                {
                    return Err(unique_violation(&d.name));
                }
                let stored = inner.stores.graphindex.get(&record.row, &[])?;
                if stored.as_ref().map_or(false, |owner| owner != &record.value)
                    && !self.released.contains(&record.row)
                {
                    return Err(unique_violation(&d.name));
                }
                if d.consistency == ConsistencyModifier::Lock {
                    self.lock_cell(LockedStore::Index, &record.row, &[])?;
                }
                self.released.remove(&record.row);
                self.unique_claims.insert(record.row, record.value);
            }
        }
        Ok(())
    }

    fn release_claims(&mut self, before: &VertexView, after: &VertexView) -> Result<()> {
        let keys: BTreeSet<SchemaId> = before.properties.iter().map(|(_, p)| p.key).collect();
        for key in keys {
            self.check_unique(before, after, key)?;
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // schema

    fn check_writable(&self, view: &VertexView) -> Result<()> {
        let Some(label) = view.label else {
            return Ok(());
        };
        let element = self.graph.inner.schema.require(label)?;
        if let Some(def) = element.as_vertex_label() {
            if def.is_static && !self.new_vertices.contains(&view.key) {
                return Err(PenumbraError::SchemaViolation(format!(
                    "vertices with static label {} cannot be modified after creation",
                    def.name
                )));
            }
        }
        Ok(())
    }

    fn relation_id(&self, vertex: &VertexId) -> Result<RelationId> {
        let hint = match vertex_partition(&self.graph.inner.ids, vertex) {
            Ok(partition) => PlacementHint::partition(partition),
            Err(_) => PlacementHint::default(),
        };
        Ok(RelationId(
            self.graph.inner.assigner.allocate(IdCategory::Relation, &hint)?.0,
        ))
    }

    fn schema_name(&self, id: SchemaId) -> Result<String> {
        Ok(self.graph.inner.schema.require(id)?.name().to_owned())
    }

    fn resolve(&self, name: &str, kind: DefaultType) -> Result<Arc<SchemaElement>> {
        if let Some(element) = self.graph.inner.schema.get_by_name(name)? {
            return Ok(element);
        }
        if self.graph.strict_schema() {
            return Err(PenumbraError::SchemaViolation(format!(
                "{} {name} is not defined",
                kind.kind_name()
            )));
        }
        crate::admin::make_default_type(&self.graph, name, kind)
    }

    fn property_key_named(&self, name: &str, sample: &PropertyValue) -> Result<PropertyKeyDef> {
        let element = self.resolve(name, DefaultType::PropertyKey(DataType::of(sample)))?;
        element.as_property_key().cloned().ok_or_else(|| wrong_kind(&element, "property key"))
    }

    fn edge_label_named(&self, name: &str) -> Result<EdgeLabelDef> {
        let element = self.resolve(name, DefaultType::EdgeLabel)?;
        element.as_edge_label().cloned().ok_or_else(|| wrong_kind(&element, "edge label"))
    }

    fn vertex_label_named(&self, name: &str) -> Result<VertexLabelDef> {
        let element = self.resolve(name, DefaultType::VertexLabel)?;
        element.as_vertex_label().cloned().ok_or_else(|| wrong_kind(&element, "vertex label"))
    }

    fn property_key_def(&self, id: SchemaId) -> Result<PropertyKeyDef> {
        let element = self.graph.inner.schema.require(id)?;
        element.as_property_key().cloned().ok_or_else(|| wrong_kind(&element, "property key"))
    }

    pub(crate) fn edge_label_def(&self, id: SchemaId) -> Result<EdgeLabelDef> {
        let element = self.graph.inner.schema.require(id)?;
        element.as_edge_label().cloned().ok_or_else(|| wrong_kind(&element, "edge label"))
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state != TxState::Open {
            return Err(PenumbraError::Closed("transaction"));
        }
        Ok(())
    }
}

impl Drop for GraphTx {
    fn drop(&mut self) {
        if self.state == TxState::Open {
            trace!(holder = %self.locks.holder(), "tx.dropped_open");
            self.close(TxState::RolledBack);
        }
    }
}

/// Type created on first use when the schema maker allows it.
#[derive(Copy, Clone, Debug)]
pub(crate) enum DefaultType {
    PropertyKey(DataType),
    EdgeLabel,
    VertexLabel,
}

impl DefaultType {
    pub(crate) fn kind_name(self) -> &'static str {
        match self {
            DefaultType::PropertyKey(_) => "property key",
            DefaultType::EdgeLabel => "edge label",
            DefaultType::VertexLabel => "vertex label",
        }
    }
}

fn apply(stored: Vec<Entry>, additions: &[Entry], deletions: &[Vec<u8>]) -> Vec<Entry> {
    let mut cells: BTreeMap<Vec<u8>, Entry> =
        stored.into_iter().map(|e| (e.column.clone(), e)).collect();
    for column in deletions {
        cells.remove(column);
    }
    for entry in additions {
        cells.insert(entry.column.clone(), entry.clone());
    }
    cells.into_values().collect()
}

fn check_data_type(def: &PropertyKeyDef, value: &PropertyValue) -> Result<()> {
    if def.data_type.accepts(value) {
        return Ok(());
    }
    Err(PenumbraError::SchemaViolation(format!(
        "property key {} expects {:?} values, got {:?}",
        def.name,
        def.data_type,
        DataType::of(value)
    )))
}

fn unique_violation(index: &str) -> PenumbraError {
    PenumbraError::SchemaViolation(format!("uniqueness constraint of index {index} violated"))
}

fn wrong_kind(element: &SchemaElement, expected: &str) -> PenumbraError {
    PenumbraError::SchemaViolation(format!(
        "{} is a {}, not a {expected}",
        element.name(),
        element.kind_name()
    ))
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}
