#![forbid(unsafe_code)]

//! Instance registry, backend logs and the eviction/acknowledgement protocol.

mod instances;
mod log;
mod logger;

/// Registered instances and persisted global options.
pub use instances::{
    GlobalOptions, InstanceRecord, InstanceRegistry, ALLOW_CUSTOM_VERTEX_IDS,
    ALLOW_CUSTOM_VERTEX_ID_TYPES,
};
/// Append-only logs.
pub use log::{KcvLog, LogId, LogMessage};
/// Schema change propagation.
pub use logger::{ManagementLogger, PollOutcome, StatusUpdate, TransactionTracker};
