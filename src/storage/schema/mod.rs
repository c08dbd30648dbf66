#![forbid(unsafe_code)]

//! Schema definitions, the persisted catalog and index lifecycle rules.

mod defs;
mod lifecycle;
mod registry;
mod types;

/// Persisted definitions of relation types, vertex labels and indexes.
pub use defs::{
    CompositeIndexDef, EdgeLabelDef, IndexDef, IndexField, MixedIndexDef, PropertyKeyDef,
    RelationIndexDef, SchemaElement, VertexLabelDef,
};
/// Index status transitions.
pub use lifecycle::{is_legal_transition, plan, ActionPlan};
/// Catalog shared by the transactions of one instance.
pub use registry::{expect_index, ElementGuard, SchemaRegistry, SchemaWrite};
/// Schema enums.
pub use types::{
    Cardinality, ConsistencyModifier, DataType, ElementCategory, Multiplicity, Order,
    SchemaAction, SchemaStatus,
};
