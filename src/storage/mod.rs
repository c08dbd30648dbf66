//! Coordination engine over the key-column-value backend.
//!
//! Allocates ids, keeps the schema catalog and its index lifecycle, propagates
//! schema changes between instances through the management log, and locks the
//! cells that consistency-checked writes touch.

/// Process-wide timestamps.
pub mod clock;

/// Identifier and partition allocation.
///
/// Id bit layout, block leasing from the backend and partition placement.
pub mod ids;

/// Index records derived from vertex rows.
pub mod indexing;

/// Row and column layout of graph data.
pub mod layout;

/// Expected-value locking.
pub mod locking;

/// Instance registry and the management log protocol.
pub mod mgmt;

/// Background scan jobs.
///
/// Index repair and removal run here and report through job handles.
pub mod scan;

/// Schema definitions, catalog and lifecycle rules.
pub mod schema;

/// Id assignment for new elements.
pub use ids::{IdAssigner, IdCategory, IdManager};
/// Schema catalog.
pub use schema::{SchemaRegistry, SchemaStatus};
