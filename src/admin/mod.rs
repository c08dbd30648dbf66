#![forbid(unsafe_code)]

//! Schema management and cluster administration.
//!
//! A [`ManagementSystem`] is a transaction over the schema: types and indexes
//! created or changed through it become visible at commit, when the changed
//! elements are evicted from every instance's cache through the management
//! log. Index lifecycle actions run here too, together with the scan jobs that
//! rebuild or delete index records.

mod lifecycle;
mod makers;
mod management;

/// Index lifecycle helpers that act on an open graph.
pub use lifecycle::{apply_status_updates, IndexStatusReport};

/// Builders for relation types, vertex labels and indexes.
pub use makers::{EdgeLabelMaker, IndexBuilder, PropertyKeyMaker, VertexLabelMaker};

/// Schema transaction and its commit report.
pub use management::{ManagementSystem, MgmtCommitReport};

pub(crate) use lifecycle::make_default_type;
