//! Row and column layout of graph data.
//!
//! ```text
//! edgestore   row = vertex row key
//!             [0x00]                                   vertex marker   VertexCell
//!             [0x01] key                               SINGLE property PropertyCell
//!             [0x01] key rel                           LIST/SET value  PropertyCell
//!             [0x02] label dir n sort.. other rel      edge            EdgeCell
//!             [0x03] index dir n sort.. other rel      relation index  EdgeCell
//! graphindex  row = index value..   column = [] (unique) | element     value = element
//! mixedindex  row = backing index field   column = value element       value = element
//! ```
//!
//! Relation cells carry their [`Lineage`] so forked relations stay readable by
//! transactions that started before the fork committed.

use serde::{Deserialize, Serialize};

use super::schema::{Cardinality, Order};
use crate::primitives::bytes::ord::{get_u64_be, put_bytes_key, put_u64_be, split_bytes_key};
use crate::types::{Direction, PenumbraError, PropertyValue, RelationId, Result, SchemaId};

/// Store holding vertex rows.
pub const EDGESTORE: &str = "edgestore";
/// Store holding composite index records.
pub const GRAPHINDEX: &str = "graphindex";
/// Store holding mixed index records.
pub const MIXEDINDEX: &str = "mixedindex";
/// Store holding schema definitions.
pub const SCHEMA: &str = "schema";
/// Store holding id block claims.
pub const IDS: &str = "ids";
/// Store holding instance records and global options.
pub const SYSTEM_PROPERTIES: &str = "system_properties";
/// Store holding the management, transaction and user logs.
pub const SYSTEMLOG: &str = "systemlog";

const VERTEX_MARKER: u8 = 0x00;
const PROPERTY: u8 = 0x01;
const EDGE: u8 = 0x02;
const RELATION_INDEX: u8 = 0x03;

/// Fork history of a relation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lineage {
    /// Relation the chain started from.
    pub origin: RelationId,
    /// Number of forks since the origin.
    pub generation: u32,
    /// Commit timestamp of the fork that created this relation.
    pub forked_at: Option<u64>,
    /// Commit timestamp of the fork that replaced this relation.
    pub superseded_at: Option<u64>,
}

impl Lineage {
    /// Lineage of a freshly created relation.
    pub fn root(id: RelationId) -> Self {
        Self {
            origin: id,
            generation: 0,
            forked_at: None,
            superseded_at: None,
        }
    }

    /// Lineage of the relation forked from `self`.
    pub fn fork(&self) -> Self {
        Self {
            origin: self.origin,
            generation: self.generation + 1,
            forked_at: None,
            superseded_at: None,
        }
    }

    /// Whether a reader that started at `ts` sees the relation.
    pub fn visible_at(&self, ts: u64) -> bool {
        self.forked_at.map_or(true, |f| f <= ts) && self.superseded_at.map_or(true, |s| s > ts)
    }

    /// Whether the relation is the current version.
    pub fn is_live(&self) -> bool {
        self.superseded_at.is_none()
    }
}

/// Value of the vertex marker column.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VertexCell {
    pub label: Option<SchemaId>,
    pub created_at: u64,
}

/// Value of a property column.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PropertyCell {
    pub id: RelationId,
    pub key: SchemaId,
    pub value: PropertyValue,
    pub lineage: Lineage,
}

/// Value of an edge column; stored identically on both endpoints.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EdgeCell {
    pub id: RelationId,
    pub label: SchemaId,
    pub properties: Vec<(SchemaId, PropertyValue)>,
    pub lineage: Lineage,
}

impl EdgeCell {
    /// Value of `key`, if set.
    pub fn property(&self, key: SchemaId) -> Option<&PropertyValue> {
        self.properties.iter().find(|(k, _)| *k == key).map(|(_, v)| v)
    }

    /// Sets or replaces `key`.
    pub fn set_property(&mut self, key: SchemaId, value: PropertyValue) {
        match self.properties.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.properties.push((key, value)),
        }
    }
}

/// Decoded edge or relation index column.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EdgeColumn {
    /// Edge label, or the relation index id for relation index columns.
    pub type_id: SchemaId,
    pub direction: Direction,
    pub other: Vec<u8>,
    pub relation: RelationId,
}

/// Column of the vertex marker.
pub fn vertex_marker() -> Vec<u8> {
    vec![VERTEX_MARKER]
}

/// Column of a property value.
pub fn property_column(key: SchemaId, cardinality: Cardinality, rel: RelationId) -> Vec<u8> {
    let mut col = property_prefix(Some(key));
    if cardinality != Cardinality::Single {
        put_u64_be(&mut col, rel.0);
    }
    col
}

/// Prefix of every value of `key`, or of every property when `None`.
pub fn property_prefix(key: Option<SchemaId>) -> Vec<u8> {
    let mut col = vec![PROPERTY];
    if let Some(key) = key {
        put_u64_be(&mut col, key.0);
    }
    col
}

/// Column of an edge as seen from one endpoint.
pub fn edge_column(
    label: SchemaId,
    direction: Direction,
    sort: &[Vec<u8>],
    other: &[u8],
    rel: RelationId,
) -> Vec<u8> {
    typed_column(EDGE, label, direction, sort, other, rel)
}

/// Prefix of edges, optionally narrowed to a label and direction.
pub fn edge_prefix(label: Option<SchemaId>, direction: Option<Direction>) -> Vec<u8> {
    typed_prefix(EDGE, label, direction)
}

/// Column of a relation index entry.
pub fn relation_index_column(
    index: SchemaId,
    direction: Direction,
    sort: &[Vec<u8>],
    other: &[u8],
    rel: RelationId,
) -> Vec<u8> {
    typed_column(RELATION_INDEX, index, direction, sort, other, rel)
}

/// Prefix of a relation index, optionally narrowed to a direction and leading sort values.
pub fn relation_index_prefix(
    index: SchemaId,
    direction: Option<Direction>,
    sort: &[Vec<u8>],
) -> Vec<u8> {
    let mut col = typed_prefix(RELATION_INDEX, Some(index), direction);
    if direction.is_some() && !sort.is_empty() {
        col.push(sort.len() as u8);
        for value in sort {
            put_bytes_key(&mut col, value);
        }
    }
    col
}

/// Whether `column` is an edge column.
pub fn is_edge_column(column: &[u8]) -> bool {
    column.first() == Some(&EDGE)
}

/// Whether `column` is a property column.
pub fn is_property_column(column: &[u8]) -> bool {
    column.first() == Some(&PROPERTY)
}

/// Decodes an edge or relation index column.
pub fn parse_typed_column(column: &[u8]) -> Result<EdgeColumn> {
    let malformed = || PenumbraError::Serialization("malformed edge column".into());
    if column.len() < 11 || !matches!(column[0], EDGE | RELATION_INDEX) {
        return Err(malformed());
    }
    let type_id = SchemaId(get_u64_be(&column[1..])?);
    let direction = match column[9] {
        0 => Direction::Out,
        1 => Direction::In,
        _ => return Err(malformed()),
    };
    let sort_count = column[10] as usize;
    let mut at = 11;
    for _ in 0..sort_count {
        let (_, used) = split_bytes_key(&column[at..])?;
        at += used;
    }
    let (other, used) = split_bytes_key(&column[at..])?;
    at += used;
    let relation = RelationId(get_u64_be(column.get(at..).ok_or_else(malformed)?)?);
    Ok(EdgeColumn {
        type_id,
        direction,
        other: other.to_vec(),
        relation,
    })
}

fn typed_column(
    tag: u8,
    type_id: SchemaId,
    direction: Direction,
    sort: &[Vec<u8>],
    other: &[u8],
    rel: RelationId,
) -> Vec<u8> {
    let mut col = typed_prefix(tag, Some(type_id), Some(direction));
    col.push(sort.len() as u8);
    for value in sort {
        put_bytes_key(&mut col, value);
    }
    put_bytes_key(&mut col, other);
    put_u64_be(&mut col, rel.0);
    col
}

fn typed_prefix(tag: u8, type_id: Option<SchemaId>, direction: Option<Direction>) -> Vec<u8> {
    let mut col = vec![tag];
    if let Some(id) = type_id {
        put_u64_be(&mut col, id.0);
        if let Some(dir) = direction {
            col.push(dir.as_u8());
        }
    }
    col
}

/// Byte encoding of `value` whose order matches value order.
pub fn sort_value(value: &PropertyValue, order: Order) -> Vec<u8> {
    let mut out = Vec::with_capacity(9);
    match value {
        PropertyValue::Str(s) => {
            out.push(1);
            out.extend_from_slice(s.as_bytes());
        }
        PropertyValue::Long(v) => {
            out.push(2);
            out.extend_from_slice(&((*v as u64) ^ (1 << 63)).to_be_bytes());
        }
        PropertyValue::Double(v) => {
            let bits = v.to_bits();
            let flipped = if bits >> 63 == 1 { !bits } else { bits ^ (1 << 63) };
            out.push(3);
            out.extend_from_slice(&flipped.to_be_bytes());
        }
        PropertyValue::Bool(v) => {
            out.push(4);
            out.push(u8::from(*v));
        }
    }
    if order == Order::Desc {
        for byte in &mut out {
            *byte = !*byte;
        }
    }
    out
}

/// Element an index record points at.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ElementRef {
    /// Vertex by row key.
    Vertex(Vec<u8>),
    /// Edge by out-vertex row key and relation id.
    Edge { out: Vec<u8>, id: RelationId },
    /// Vertex property by vertex row key and relation id.
    Property { vertex: Vec<u8>, id: RelationId },
}

impl ElementRef {
    /// Self-delimiting encoding.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            ElementRef::Vertex(key) => {
                out.push(0);
                put_bytes_key(&mut out, key);
            }
            ElementRef::Edge { out: vertex, id } => {
                out.push(1);
                put_bytes_key(&mut out, vertex);
                put_u64_be(&mut out, id.0);
            }
            ElementRef::Property { vertex, id } => {
                out.push(2);
                put_bytes_key(&mut out, vertex);
                put_u64_be(&mut out, id.0);
            }
        }
        out
    }

    /// Inverse of [`ElementRef::encode`].
    pub fn decode(src: &[u8]) -> Result<Self> {
        let (&tag, rest) = src
            .split_first()
            .ok_or_else(|| PenumbraError::Serialization("empty element reference".into()))?;
        let (key, used) = split_bytes_key(rest)?;
        let key = key.to_vec();
        match tag {
            0 => Ok(ElementRef::Vertex(key)),
            1 => Ok(ElementRef::Edge {
                out: key,
                id: RelationId(get_u64_be(&rest[used..])?),
            }),
            2 => Ok(ElementRef::Property {
                vertex: key,
                id: RelationId(get_u64_be(&rest[used..])?),
            }),
            other => Err(PenumbraError::Serialization(format!(
                "unknown element reference tag {other}"
            ))),
        }
    }

    /// Row key of the vertex owning the element.
    pub fn vertex_key(&self) -> &[u8] {
        match self {
            ElementRef::Vertex(key) => key,
            ElementRef::Edge { out, .. } => out,
            ElementRef::Property { vertex, .. } => vertex,
        }
    }
}

/// Row key of a composite index record.
pub fn composite_row(index: SchemaId, values: &[PropertyValue]) -> Vec<u8> {
    let mut key = composite_prefix(index);
    for value in values {
        put_bytes_key(&mut key, &value.encode());
    }
    key
}

/// Prefix shared by every record of a composite index.
pub fn composite_prefix(index: SchemaId) -> Vec<u8> {
    let mut key = Vec::with_capacity(8);
    put_u64_be(&mut key, index.0);
    key
}

/// Column of a composite index record.
pub fn composite_column(unique: bool, element: &ElementRef) -> Vec<u8> {
    if unique {
        Vec::new()
    } else {
        element.encode()
    }
}

/// Row key of one field of a mixed index.
pub fn mixed_row(backing: &str, index: SchemaId, field: SchemaId) -> Vec<u8> {
    let mut key = mixed_prefix(backing, index);
    put_u64_be(&mut key, field.0);
    key
}

/// Prefix shared by every row of a mixed index.
pub fn mixed_prefix(backing: &str, index: SchemaId) -> Vec<u8> {
    let mut key = Vec::new();
    put_bytes_key(&mut key, backing.as_bytes());
    put_u64_be(&mut key, index.0);
    key
}

/// Column of a mixed index record.
pub fn mixed_column(value: &PropertyValue, element: &ElementRef) -> Vec<u8> {
    let mut col = mixed_value_prefix(value);
    col.extend_from_slice(&element.encode());
    col
}

/// Prefix of every record of `value` in a mixed index row.
pub fn mixed_value_prefix(value: &PropertyValue) -> Vec<u8> {
    let mut col = Vec::new();
    put_bytes_key(&mut col, &value.encode());
    col
}
