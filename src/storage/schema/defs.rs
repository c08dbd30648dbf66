//! Persisted schema definitions.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::types::{
    Cardinality, ConsistencyModifier, DataType, ElementCategory, Multiplicity, Order,
    SchemaStatus,
};
use crate::types::{Direction, SchemaId};

/// Property key definition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PropertyKeyDef {
    pub id: SchemaId,
    pub name: String,
    pub data_type: DataType,
    pub cardinality: Cardinality,
    pub consistency: ConsistencyModifier,
    /// Seconds; zero means no expiry.
    pub ttl_secs: u64,
}

/// Edge label definition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EdgeLabelDef {
    pub id: SchemaId,
    pub name: String,
    pub multiplicity: Multiplicity,
    pub consistency: ConsistencyModifier,
    pub ttl_secs: u64,
    /// Property keys stored with the edge for fast retrieval.
    pub signature: Vec<SchemaId>,
    /// Property keys incident edges are sorted by.
    pub sort_key: Vec<SchemaId>,
    pub sort_order: Order,
}

/// Vertex label definition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VertexLabelDef {
    pub id: SchemaId,
    pub name: String,
    /// Vertices are spread over all partitions.
    pub partitioned: bool,
    /// Vertices cannot be modified after the creating transaction.
    pub is_static: bool,
    pub ttl_secs: u64,
}

/// One indexed key and its lifecycle stage.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexField {
    pub key: SchemaId,
    pub status: SchemaStatus,
}

/// Exact-match index stored in the graph index store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CompositeIndexDef {
    pub id: SchemaId,
    pub name: String,
    pub element: ElementCategory,
    /// All fields share one status; they move together.
    pub fields: Vec<IndexField>,
    pub unique: bool,
    pub consistency: ConsistencyModifier,
    pub label_constraint: Option<SchemaId>,
}

/// Per-key index backed by an external indexing provider.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MixedIndexDef {
    pub id: SchemaId,
    pub name: String,
    pub element: ElementCategory,
    pub backing: String,
    /// Fields may be added later; each has its own status.
    pub fields: Vec<IndexField>,
    pub label_constraint: Option<SchemaId>,
}

/// Vertex-centric index over the edges of one label.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RelationIndexDef {
    pub id: SchemaId,
    pub name: String,
    pub base_type: SchemaId,
    pub direction: Direction,
    pub sort_key: Vec<SchemaId>,
    pub order: Order,
    pub status: SchemaStatus,
}

/// Closed set of index kinds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum IndexDef {
    Composite(CompositeIndexDef),
    Mixed(MixedIndexDef),
    Relation(RelationIndexDef),
}

impl IndexDef {
    pub fn id(&self) -> SchemaId {
        match self {
            IndexDef::Composite(d) => d.id,
            IndexDef::Mixed(d) => d.id,
            IndexDef::Relation(d) => d.id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            IndexDef::Composite(d) => &d.name,
            IndexDef::Mixed(d) => &d.name,
            IndexDef::Relation(d) => &d.name,
        }
    }

    /// Indexed keys (the base type for relation indexes).
    pub fn field_keys(&self) -> Vec<SchemaId> {
        match self {
            IndexDef::Composite(d) => d.fields.iter().map(|f| f.key).collect(),
            IndexDef::Mixed(d) => d.fields.iter().map(|f| f.key).collect(),
            IndexDef::Relation(d) => vec![d.base_type],
        }
    }

    /// Status of `field`, or `None` when the index does not cover it.
    pub fn status(&self, field: SchemaId) -> Option<SchemaStatus> {
        match self {
            IndexDef::Composite(d) => d.fields.iter().find(|f| f.key == field).map(|f| f.status),
            IndexDef::Mixed(d) => d.fields.iter().find(|f| f.key == field).map(|f| f.status),
            IndexDef::Relation(d) => (d.base_type == field).then_some(d.status),
        }
    }

    /// Status of every field.
    pub fn statuses(&self) -> Vec<(SchemaId, SchemaStatus)> {
        match self {
            IndexDef::Composite(d) => d.fields.iter().map(|f| (f.key, f.status)).collect(),
            IndexDef::Mixed(d) => d.fields.iter().map(|f| (f.key, f.status)).collect(),
            IndexDef::Relation(d) => vec![(d.base_type, d.status)],
        }
    }

    /// Sets the status of `field`, or of every field when `field` is `None`.
    pub fn set_status(&mut self, field: Option<SchemaId>, status: SchemaStatus) {
        let apply = |fields: &mut Vec<IndexField>| {
            for f in fields.iter_mut().filter(|f| field.map_or(true, |k| k == f.key)) {
                f.status = status;
            }
        };
        match self {
            IndexDef::Composite(d) => apply(&mut d.fields),
            IndexDef::Mixed(d) => apply(&mut d.fields),
            IndexDef::Relation(d) => d.status = status,
        }
    }

    /// Whether every field is REMOVED.
    pub fn is_removed(&self) -> bool {
        self.statuses()
            .iter()
            .all(|(_, s)| *s == SchemaStatus::Removed)
    }

    pub fn label_constraint(&self) -> Option<SchemaId> {
        match self {
            IndexDef::Composite(d) => d.label_constraint,
            IndexDef::Mixed(d) => d.label_constraint,
            IndexDef::Relation(_) => None,
        }
    }

    pub fn element(&self) -> ElementCategory {
        match self {
            IndexDef::Composite(d) => d.element,
            IndexDef::Mixed(d) => d.element,
            IndexDef::Relation(_) => ElementCategory::Edge,
        }
    }
}

/// Any persisted schema element.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum SchemaElement {
    PropertyKey(PropertyKeyDef),
    EdgeLabel(EdgeLabelDef),
    VertexLabel(VertexLabelDef),
    Index(IndexDef),
}

impl SchemaElement {
    pub fn id(&self) -> SchemaId {
        match self {
            SchemaElement::PropertyKey(d) => d.id,
            SchemaElement::EdgeLabel(d) => d.id,
            SchemaElement::VertexLabel(d) => d.id,
            SchemaElement::Index(d) => d.id(),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            SchemaElement::PropertyKey(d) => &d.name,
            SchemaElement::EdgeLabel(d) => &d.name,
            SchemaElement::VertexLabel(d) => &d.name,
            SchemaElement::Index(d) => d.name(),
        }
    }

    pub fn set_name(&mut self, name: String) {
        match self {
            SchemaElement::PropertyKey(d) => d.name = name,
            SchemaElement::EdgeLabel(d) => d.name = name,
            SchemaElement::VertexLabel(d) => d.name = name,
            SchemaElement::Index(IndexDef::Composite(d)) => d.name = name,
            SchemaElement::Index(IndexDef::Mixed(d)) => d.name = name,
            SchemaElement::Index(IndexDef::Relation(d)) => d.name = name,
        }
    }

    /// Short kind label for messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            SchemaElement::PropertyKey(_) => "property key",
            SchemaElement::EdgeLabel(_) => "edge label",
            SchemaElement::VertexLabel(_) => "vertex label",
            SchemaElement::Index(_) => "index",
        }
    }

    pub fn as_property_key(&self) -> Option<&PropertyKeyDef> {
        match self {
            SchemaElement::PropertyKey(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_edge_label(&self) -> Option<&EdgeLabelDef> {
        match self {
            SchemaElement::EdgeLabel(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_vertex_label(&self) -> Option<&VertexLabelDef> {
        match self {
            SchemaElement::VertexLabel(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_index(&self) -> Option<&IndexDef> {
        match self {
            SchemaElement::Index(d) => Some(d),
            _ => None,
        }
    }

    /// Consistency modifier of relation types and composite indexes.
    pub fn consistency(&self) -> ConsistencyModifier {
        match self {
            SchemaElement::PropertyKey(d) => d.consistency,
            SchemaElement::EdgeLabel(d) => d.consistency,
            SchemaElement::Index(IndexDef::Composite(d)) => d.consistency,
            _ => ConsistencyModifier::Default,
        }
    }

    /// Time-to-live of data written under this type.
    pub fn ttl(&self) -> Option<Duration> {
        let secs = match self {
            SchemaElement::PropertyKey(d) => d.ttl_secs,
            SchemaElement::EdgeLabel(d) => d.ttl_secs,
            SchemaElement::VertexLabel(d) => d.ttl_secs,
            SchemaElement::Index(_) => 0,
        };
        (secs > 0).then(|| Duration::from_secs(secs))
    }
}
