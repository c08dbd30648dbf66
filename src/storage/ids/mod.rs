#![forbid(unsafe_code)]

//! Identifier and partition allocation.

mod assigner;
mod authority;
mod custom;
mod manager;
mod placement;
mod pool;

/// Id assignment for vertices, relations and schema elements.
pub use assigner::{CustomIdPolicy, IdAssigner, IdCategory};
/// Block leasing from the shared id store.
pub use authority::{IdAuthority, IdBlock, IdNamespace, FIRST_COUNT};
/// String ids and vertex row keys.
pub use custom::{
    encode_string_key, string_partition, validate_string_id, vertex_from_row_key,
    vertex_partition, vertex_row_key, LONG_KEY_LEN, RESERVED_SEPARATOR,
};
/// Id bit layout.
pub use manager::{IdInfo, IdKind, IdManager, MAX_PARTITION_BITS, TOTAL_BITS, VERTEX_TYPE_BITS};
/// Placement strategies.
pub use placement::{
    from_config as placement_from_config, BulkPlacement, PartitionPlacement, PlacementHint,
    PropertyPlacement, RoundRobinPlacement,
};
/// Per-partition pools.
pub use pool::IdPool;
