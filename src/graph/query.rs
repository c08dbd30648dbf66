//! Equality queries answered from ENABLED indexes or by scanning.
//!
//! Index hits are only candidates: every candidate is re-read through the
//! transaction and checked against all conditions, so stale index records and
//! uncommitted changes never leak into results.

use std::collections::BTreeSet;

use super::tx::{Edge, GraphTx};
use crate::primitives::kcv::SliceQuery;
use crate::storage::ids::vertex_from_row_key;
use crate::storage::layout::{
    composite_row, mixed_row, mixed_value_prefix, parse_typed_column, relation_index_prefix,
    sort_value, EdgeCell, ElementRef,
};
use crate::storage::schema::{
    CompositeIndexDef, ElementCategory, IndexDef, MixedIndexDef, RelationIndexDef,
};
use crate::types::{Direction, PropertyValue, Result, SchemaId, VertexId};

/// How a graph query is answered.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QueryPlan {
    /// Candidates come from the named index.
    IndexFitted { index: String },
    /// Every vertex row is read.
    FullScan,
}

/// How a vertex edge query is answered.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EdgePlan {
    /// Edges come from the named relation index, in its sort order.
    RelationIndex { index: String },
    /// Every edge of the vertex is read.
    Scan,
}

struct Resolved {
    conditions: Vec<(SchemaId, PropertyValue)>,
    label: Option<SchemaId>,
}

enum Lookup {
    Composite(CompositeIndexDef, Vec<PropertyValue>),
    Mixed(MixedIndexDef, SchemaId, PropertyValue),
}

impl Lookup {
    fn name(&self) -> &str {
        match self {
            Lookup::Composite(d, _) => &d.name,
            Lookup::Mixed(d, _, _) => &d.name,
        }
    }
}

/// Query over all vertices or edges of the graph.
pub struct GraphQuery<'a> {
    tx: &'a GraphTx,
    conditions: Vec<(String, PropertyValue)>,
    label: Option<String>,
}

impl<'a> GraphQuery<'a> {
    pub(super) fn new(tx: &'a GraphTx) -> Self {
        Self {
            tx,
            conditions: Vec::new(),
            label: None,
        }
    }

    /// Requires `key` to equal `value`.
    pub fn has(mut self, key: &str, value: impl Into<PropertyValue>) -> Self {
        self.conditions.push((key.to_owned(), value.into()));
        self
    }

    /// Requires the vertex label, or the edge label for edge queries.
    pub fn has_label(mut self, label: &str) -> Self {
        self.label = Some(label.to_owned());
        self
    }

    /// Plan of [`GraphQuery::vertices`].
    pub fn plan(&self) -> Result<QueryPlan> {
        self.plan_for(ElementCategory::Vertex)
    }

    /// Plan of [`GraphQuery::edges`].
    pub fn edge_plan(&self) -> Result<QueryPlan> {
        self.plan_for(ElementCategory::Edge)
    }

    /// Matching vertices.
    pub fn vertices(&self) -> Result<Vec<VertexId>> {
        let Some(resolved) = self.resolve()? else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        for key in self.candidates(&resolved, ElementCategory::Vertex)? {
            let view = self.tx.view(&key)?;
            if !view.exists || resolved.label.map_or(false, |l| view.label != Some(l)) {
                continue;
            }
            if resolved
                .conditions
                .iter()
                .all(|(k, v)| view.values(*k).contains(&v))
            {
                out.push(vertex_from_row_key(&self.tx.graph().inner.ids, &key)?);
            }
        }
        Ok(out)
    }

    /// Matching edges.
    pub fn edges(&self) -> Result<Vec<Edge>> {
        let Some(resolved) = self.resolve()? else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        for key in self.candidates(&resolved, ElementCategory::Edge)? {
            let view = self.tx.view(&key)?;
            if !view.exists {
                continue;
            }
            let vertex = vertex_from_row_key(&self.tx.graph().inner.ids, &key)?;
            for (col, cell) in view.out_edges() {
                if resolved.label.map_or(false, |l| cell.label != l) {
                    continue;
                }
                if resolved
                    .conditions
                    .iter()
                    .all(|(k, v)| cell.property(*k) == Some(v))
                {
                    out.push(self.tx.edge_at(&vertex, col, cell)?);
                }
            }
        }
        Ok(out)
    }

    fn plan_for(&self, category: ElementCategory) -> Result<QueryPlan> {
        let Some(resolved) = self.resolve()? else {
            return Ok(QueryPlan::FullScan);
        };
        Ok(match self.choose(&resolved, category)? {
            Some(lookup) => QueryPlan::IndexFitted {
                index: lookup.name().to_owned(),
            },
            None => QueryPlan::FullScan,
        })
    }

    /// Names resolved to ids; `None` when some name is undefined and nothing
    /// can match.
    fn resolve(&self) -> Result<Option<Resolved>> {
        let schema = &self.tx.graph().inner.schema;
        let mut conditions = Vec::with_capacity(self.conditions.len());
        for (name, value) in &self.conditions {
            match schema.get_by_name(name)? {
                Some(element) if element.as_property_key().is_some() => {
                    conditions.push((element.id(), value.clone()))
                }
                _ => return Ok(None),
            }
        }
        let label = match &self.label {
            Some(name) => match schema.get_by_name(name)? {
                Some(element) => Some(element.id()),
                None => return Ok(None),
            },
            None => None,
        };
        Ok(Some(Resolved { conditions, label }))
    }

    fn choose(&self, resolved: &Resolved, category: ElementCategory) -> Result<Option<Lookup>> {
        let value_of = |key: SchemaId| {
            resolved
                .conditions
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.clone())
        };
        let mut best: Option<(usize, Lookup)> = None;
        for element in self.tx.graph().inner.schema.indexes()? {
            let Some(def) = element.as_index() else {
                continue;
            };
            if def.element() != category
                || def
                    .label_constraint()
                    .map_or(false, |l| resolved.label != Some(l))
            {
                continue;
            }
            let candidate = match def {
                IndexDef::Composite(d) => {
                    if !d.fields.iter().all(|f| f.status.is_queryable()) {
                        continue;
                    }
                    let values: Option<Vec<PropertyValue>> =
                        d.fields.iter().map(|f| value_of(f.key)).collect();
                    let Some(values) = values else { continue };
                    (d.fields.len() * 2 + usize::from(d.unique), Lookup::Composite(d.clone(), values))
                }
                IndexDef::Mixed(d) => {
                    let hit = d
                        .fields
                        .iter()
                        .filter(|f| f.status.is_queryable())
                        .find_map(|f| value_of(f.key).map(|v| (f.key, v)));
                    let Some((field, value)) = hit else { continue };
                    (1, Lookup::Mixed(d.clone(), field, value))
                }
                IndexDef::Relation(_) => continue,
            };
            if best.as_ref().map_or(true, |(score, _)| candidate.0 > *score) {
                best = Some(candidate);
            }
        }
        Ok(best.map(|(_, lookup)| lookup))
    }

    fn candidates(&self, resolved: &Resolved, category: ElementCategory) -> Result<BTreeSet<Vec<u8>>> {
        let stores = &self.tx.graph().inner.stores;
        let mut keys: BTreeSet<Vec<u8>> = self.tx.touched_rows().cloned().collect();
        match self.choose(resolved, category)? {
            Some(Lookup::Composite(d, values)) => {
                for entry in stores
                    .graphindex
                    .get_slice(&composite_row(d.id, &values), &SliceQuery::all())?
                {
                    keys.insert(ElementRef::decode(&entry.value)?.vertex_key().to_vec());
                }
            }
            Some(Lookup::Mixed(d, field, value)) => {
                let query = SliceQuery::prefix(&mixed_value_prefix(&value));
                for entry in stores
                    .mixedindex
                    .get_slice(&mixed_row(&d.backing, d.id, field), &query)?
                {
                    keys.insert(ElementRef::decode(&entry.value)?.vertex_key().to_vec());
                }
            }
            None => keys.extend(stores.edgestore.keys()?),
        }
        Ok(keys)
    }
}

/// Query over the edges of one vertex.
pub struct VertexEdgeQuery<'a> {
    tx: &'a GraphTx,
    vertex: VertexId,
    direction: Direction,
    label: Option<String>,
    conditions: Vec<(String, PropertyValue)>,
}

impl<'a> VertexEdgeQuery<'a> {
    pub(super) fn new(tx: &'a GraphTx, vertex: VertexId) -> Self {
        Self {
            tx,
            vertex,
            direction: Direction::Both,
            label: None,
            conditions: Vec::new(),
        }
    }

    /// Restricts the direction; both by default.
    pub fn direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    /// Restricts to one edge label.
    pub fn label(mut self, label: &str) -> Self {
        self.label = Some(label.to_owned());
        self
    }

    /// Requires edge property `key` to equal `value`.
    pub fn has(mut self, key: &str, value: impl Into<PropertyValue>) -> Self {
        self.conditions.push((key.to_owned(), value.into()));
        self
    }

    /// How [`VertexEdgeQuery::edges`] is answered.
    pub fn plan(&self) -> Result<EdgePlan> {
        Ok(match self.choose()? {
            Some((def, _)) => EdgePlan::RelationIndex { index: def.name },
            None => EdgePlan::Scan,
        })
    }

    /// Matching edges.
    pub fn edges(&self) -> Result<Vec<Edge>> {
        let key = self.tx.row_key(&self.vertex)?;
        let touched = self.tx.touched_rows().any(|r| *r == key);
        let found = match self.choose()? {
            Some((def, value)) if !touched => self.from_index(&key, &def, &value)?,
            _ => self
                .tx
                .edges(&self.vertex, self.direction, self.label.as_deref())?,
        };
        Ok(found.into_iter().filter(|e| self.matches(e)).collect())
    }

    fn matches(&self, edge: &Edge) -> bool {
        self.label.as_ref().map_or(true, |l| &edge.label == l)
            && self
                .conditions
                .iter()
                .all(|(k, v)| edge.property(k) == Some(v))
    }

    fn choose(&self) -> Result<Option<(RelationIndexDef, PropertyValue)>> {
        let Some(label) = &self.label else {
            return Ok(None);
        };
        let schema = &self.tx.graph().inner.schema;
        let Some(label) = schema.get_by_name(label)? else {
            return Ok(None);
        };
        for element in schema.indexes()? {
            let Some(IndexDef::Relation(d)) = element.as_index() else {
                continue;
            };
            let direction_fits = d.direction == Direction::Both || d.direction == self.direction;
            if d.base_type != label.id() || !d.status.is_queryable() || !direction_fits {
                continue;
            }
            let Some(first) = d.sort_key.first() else {
                continue;
            };
            let first_name = schema.require(*first)?.name().to_owned();
            if let Some((_, value)) = self.conditions.iter().find(|(k, _)| *k == first_name) {
                return Ok(Some((d.clone(), value.clone())));
            }
        }
        Ok(None)
    }

    fn from_index(&self, key: &[u8], def: &RelationIndexDef, value: &PropertyValue) -> Result<Vec<Edge>> {
        let directions = match self.direction {
            Direction::Both => vec![Direction::Out, Direction::In],
            dir => vec![dir],
        };
        let sort = if def.sort_key.len() == 1 {
            vec![sort_value(value, def.order)]
        } else {
            Vec::new()
        };
        let start = self.tx.start_ts();
        let mut out = Vec::new();
        for dir in directions {
            let query = SliceQuery::prefix(&relation_index_prefix(def.id, Some(dir), &sort));
            for entry in self.tx.graph().inner.stores.edgestore.get_slice(key, &query)? {
                let col = parse_typed_column(&entry.column)?;
                let cell: EdgeCell = serde_json::from_slice(&entry.value)?;
                if !cell.lineage.visible_at(start) {
                    continue;
                }
                out.push(self.tx.edge_at(&self.vertex, &col, &cell)?);
            }
        }
        Ok(out)
    }
}
