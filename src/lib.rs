//! Penumbra: schema and cluster coordination for a graph store shared by many
//! independent instances.
//!
//! Instances coordinate only through a key-column-value backend: ids are
//! leased in blocks, schema changes propagate through an eviction and
//! acknowledgement log, and consistency-checked writes take expected-value
//! locks on the cells they touch.

#![warn(missing_docs)]

pub mod admin;
pub mod config;
pub mod graph;
pub mod logging;
pub mod primitives;
pub mod storage;
pub mod types;

/// Management surface.
pub use admin::{IndexStatusReport, ManagementSystem, MgmtCommitReport};
/// Configuration.
pub use config::GraphConfig;
/// Graph instances and transactions.
pub use graph::{CommitReport, Edge, Graph, GraphTx, Property};
/// Storage backends.
pub use primitives::kcv::{InMemoryStoreManager, KeyColumnValueStore, StoreManager};
/// Ids, values and errors.
pub use types::{Direction, ErrorKind, PenumbraError, PropertyValue, Result, VertexId};
