//! Index records derived from vertex rows.
//!
//! Transactions diff the records of a vertex before and after their changes;
//! repair jobs write the records of every existing vertex.

use rustc_hash::FxHashSet;

use super::layout::{
    composite_column, composite_row, edge_prefix, is_edge_column, is_property_column,
    mixed_column, mixed_row, parse_typed_column, relation_index_column, sort_value, vertex_marker,
    EdgeCell, EdgeColumn, ElementRef, Lineage, PropertyCell, VertexCell,
};
use super::schema::{ElementCategory, IndexDef, SchemaStatus};
use crate::primitives::kcv::Entry;
use crate::types::{Direction, PropertyValue, Result, SchemaId};

/// Store an index record lives in.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IndexStore {
    /// Composite index records.
    Graph,
    /// Mixed index records.
    Mixed,
    /// Relation index columns inside vertex rows.
    Edge,
}

/// One physical index record.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IndexRecord {
    pub store: IndexStore,
    pub row: Vec<u8>,
    pub column: Vec<u8>,
    pub value: Vec<u8>,
}

/// Decoded vertex row.
#[derive(Clone, Debug, Default)]
pub struct VertexView {
    pub key: Vec<u8>,
    pub exists: bool,
    pub label: Option<SchemaId>,
    pub properties: Vec<(Vec<u8>, PropertyCell)>,
    pub edges: Vec<(EdgeColumn, EdgeCell)>,
}

impl VertexView {
    /// Decodes the cells of one row, keeping relations `visible` accepts.
    pub fn decode(
        key: &[u8],
        entries: &[Entry],
        visible: impl Fn(&Lineage) -> bool,
    ) -> Result<Self> {
        let marker = vertex_marker();
        let mut view = VertexView {
            key: key.to_vec(),
            ..VertexView::default()
        };
        for entry in entries {
            if entry.column == marker {
                let cell: VertexCell = serde_json::from_slice(&entry.value)?;
                view.exists = true;
                view.label = cell.label;
            } else if is_property_column(&entry.column) {
                let cell: PropertyCell = serde_json::from_slice(&entry.value)?;
                if visible(&cell.lineage) {
                    view.properties.push((entry.column.clone(), cell));
                }
            } else if is_edge_column(&entry.column) {
                let cell: EdgeCell = serde_json::from_slice(&entry.value)?;
                if visible(&cell.lineage) {
                    view.edges.push((parse_typed_column(&entry.column)?, cell));
                }
            }
        }
        Ok(view)
    }

    /// Values of `key`.
    pub fn values(&self, key: SchemaId) -> Vec<&PropertyValue> {
        self.properties
            .iter()
            .filter(|(_, p)| p.key == key)
            .map(|(_, p)| &p.value)
            .collect()
    }

    /// Outgoing edges (each edge once).
    pub fn out_edges(&self) -> impl Iterator<Item = &(EdgeColumn, EdgeCell)> {
        self.edges
            .iter()
            .filter(|(c, _)| c.direction == Direction::Out)
    }
}

/// Records `def` holds for the vertex in `view`, restricted to fields whose
/// status `include` accepts.
pub fn index_records(
    def: &IndexDef,
    view: &VertexView,
    include: impl Fn(SchemaStatus) -> bool,
) -> Result<Vec<IndexRecord>> {
    if !view.exists {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    match def {
        IndexDef::Composite(d) => {
            if !d.fields.iter().all(|f| include(f.status)) {
                return Ok(out);
            }
            let keys: Vec<SchemaId> = d.fields.iter().map(|f| f.key).collect();
            match d.element {
                ElementCategory::Vertex => {
                    if d.label_constraint.map_or(false, |l| view.label != Some(l)) {
                        return Ok(out);
                    }
                    let columns: Vec<Vec<PropertyValue>> = keys
                        .iter()
                        .map(|k| view.values(*k).into_iter().cloned().collect())
                        .collect();
                    let element = ElementRef::Vertex(view.key.clone());
                    for combo in cartesian(&columns) {
                        out.push(IndexRecord {
                            store: IndexStore::Graph,
                            row: composite_row(d.id, &combo),
                            column: composite_column(d.unique, &element),
                            value: element.encode(),
                        });
                    }
                }
                ElementCategory::Property => {
                    for (_, prop) in view.properties.iter().filter(|(_, p)| keys == [p.key]) {
                        let element = ElementRef::Property {
                            vertex: view.key.clone(),
                            id: prop.id,
                        };
                        out.push(IndexRecord {
                            store: IndexStore::Graph,
                            row: composite_row(d.id, std::slice::from_ref(&prop.value)),
                            column: composite_column(d.unique, &element),
                            value: element.encode(),
                        });
                    }
                }
                ElementCategory::Edge => {
                    for (col, edge) in view.out_edges() {
                        if d.label_constraint.map_or(false, |l| edge.label != l) {
                            continue;
                        }
                        let values: Option<Vec<PropertyValue>> =
                            keys.iter().map(|k| edge.property(*k).cloned()).collect();
                        let Some(values) = values else { continue };
                        let element = ElementRef::Edge {
                            out: view.key.clone(),
                            id: col.relation,
                        };
                        out.push(IndexRecord {
                            store: IndexStore::Graph,
                            row: composite_row(d.id, &values),
                            column: composite_column(d.unique, &element),
                            value: element.encode(),
                        });
                    }
                }
            }
        }
        IndexDef::Mixed(d) => {
            let fields: Vec<SchemaId> = d
                .fields
                .iter()
                .filter(|f| include(f.status))
                .map(|f| f.key)
                .collect();
            for field in fields {
                match d.element {
                    ElementCategory::Vertex | ElementCategory::Property => {
                        if d.element == ElementCategory::Vertex
                            && d.label_constraint.map_or(false, |l| view.label != Some(l))
                        {
                            continue;
                        }
                        for (_, prop) in view.properties.iter().filter(|(_, p)| p.key == field) {
                            let element = if d.element == ElementCategory::Vertex {
                                ElementRef::Vertex(view.key.clone())
                            } else {
                                ElementRef::Property {
                                    vertex: view.key.clone(),
                                    id: prop.id,
                                }
                            };
                            out.push(IndexRecord {
                                store: IndexStore::Mixed,
                                row: mixed_row(&d.backing, d.id, field),
                                column: mixed_column(&prop.value, &element),
                                value: element.encode(),
                            });
                        }
                    }
                    ElementCategory::Edge => {
                        for (col, edge) in view.out_edges() {
                            if d.label_constraint.map_or(false, |l| edge.label != l) {
                                continue;
                            }
                            let Some(value) = edge.property(field) else { continue };
                            let element = ElementRef::Edge {
                                out: view.key.clone(),
                                id: col.relation,
                            };
                            out.push(IndexRecord {
                                store: IndexStore::Mixed,
                                row: mixed_row(&d.backing, d.id, field),
                                column: mixed_column(value, &element),
                                value: element.encode(),
                            });
                        }
                    }
                }
            }
        }
        IndexDef::Relation(d) => {
            if !include(d.status) {
                return Ok(out);
            }
            for (col, edge) in &view.edges {
                if col.type_id != d.base_type
                    || (d.direction != Direction::Both && col.direction != d.direction)
                {
                    continue;
                }
                let sort: Vec<Vec<u8>> = d
                    .sort_key
                    .iter()
                    .map(|k| {
                        edge.property(*k)
                            .map(|v| sort_value(v, d.order))
                            .unwrap_or_default()
                    })
                    .collect();
                out.push(IndexRecord {
                    store: IndexStore::Edge,
                    row: view.key.clone(),
                    column: relation_index_column(d.id, col.direction, &sort, &col.other, col.relation),
                    value: serde_json::to_vec(edge)?,
                });
            }
        }
    }
    Ok(out)
}

/// Records in `before` but not `after`, and records in `after` but not `before`.
pub fn diff_records(
    before: Vec<IndexRecord>,
    after: Vec<IndexRecord>,
) -> (Vec<IndexRecord>, Vec<IndexRecord>) {
    let kept: FxHashSet<(IndexStore, Vec<u8>, Vec<u8>)> = after
        .iter()
        .map(|r| (r.store, r.row.clone(), r.column.clone()))
        .collect();
    let old: FxHashSet<(IndexStore, Vec<u8>, Vec<u8>)> = before
        .iter()
        .map(|r| (r.store, r.row.clone(), r.column.clone()))
        .collect();
    let removed = before
        .into_iter()
        .filter(|r| !kept.contains(&(r.store, r.row.clone(), r.column.clone())))
        .collect();
    let added = after
        .into_iter()
        .filter(|r| {
            r.store == IndexStore::Edge || !old.contains(&(r.store, r.row.clone(), r.column.clone()))
        })
        .collect();
    (removed, added)
}

/// Prefix of the edges a relation index covers.
pub fn relation_index_scan_prefix(base_type: SchemaId) -> Vec<u8> {
    edge_prefix(Some(base_type), None)
}

fn cartesian(columns: &[Vec<PropertyValue>]) -> Vec<Vec<PropertyValue>> {
    let mut combos: Vec<Vec<PropertyValue>> = vec![Vec::new()];
    for values in columns {
        if values.is_empty() {
            return Vec::new();
        }
        combos = combos
            .into_iter()
            .flat_map(|prefix| {
                values.iter().map(move |v| {
                    let mut next = prefix.clone();
                    next.push(v.clone());
                    next
                })
            })
            .collect();
    }
    combos
}
