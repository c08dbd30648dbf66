//! Low-level primitives the coordination layers are built on.
//!
//! Includes key encoders, the key-column-value storage collaborator and the
//! in-process lock mediator.

/// Order-preserving key encoders.
pub mod bytes;

/// In-process lock mediation.
///
/// Arbitrates cell locks between transactions of one process.
pub mod concurrency;

/// Key-column-value storage interface and the in-memory backend.
pub mod kcv;
