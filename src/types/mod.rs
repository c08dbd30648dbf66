#![forbid(unsafe_code)]

//! Identifier newtypes, property values and the crate-wide error type.

use std::fmt;
use std::io;

use serde::{Deserialize, Serialize};

/// Numeric identifier of a vertex, relation or schema element.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct ElementId(pub u64);

/// Identifier of a relation (edge or property).
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct RelationId(pub u64);

/// Identifier of a schema element (relation type, vertex label or index).
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct SchemaId(pub u64);

/// Partition number, always below the configured maximum partition count.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct PartitionId(pub u32);

/// Vertex identity: either an allocated numeric id or a user-supplied string.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub enum VertexId {
    /// Numeric vertex id in the internal id space.
    Long(u64),
    /// User-supplied printable ASCII identifier.
    Str(String),
}

/// Edge direction relative to a vertex.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub enum Direction {
    /// Outgoing edges.
    Out,
    /// Incoming edges.
    In,
    /// Both directions.
    Both,
}

impl Direction {
    /// Byte tag used in column encodings.
    pub const fn as_u8(self) -> u8 {
        match self {
            Direction::Out => 0,
            Direction::In => 1,
            Direction::Both => 2,
        }
    }

    /// Returns the opposite direction.
    pub const fn reverse(self) -> Self {
        match self {
            Direction::Out => Direction::In,
            Direction::In => Direction::Out,
            Direction::Both => Direction::Both,
        }
    }
}

/// Property value stored on vertices and edges.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum PropertyValue {
    /// UTF-8 string.
    Str(String),
    /// Signed 64-bit integer.
    Long(i64),
    /// 64-bit float.
    Double(f64),
    /// Boolean flag.
    Bool(bool),
}

impl PropertyValue {
    /// Stable byte encoding used for index keys and expected-value comparisons.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            PropertyValue::Str(s) => {
                out.push(1);
                out.extend_from_slice(s.as_bytes());
            }
            PropertyValue::Long(v) => {
                out.push(2);
                out.extend_from_slice(&v.to_be_bytes());
            }
            PropertyValue::Double(v) => {
                out.push(3);
                out.extend_from_slice(&v.to_bits().to_be_bytes());
            }
            PropertyValue::Bool(v) => {
                out.push(4);
                out.push(u8::from(*v));
            }
        }
        out
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::Str(value.to_owned())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        PropertyValue::Str(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        PropertyValue::Long(value)
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        PropertyValue::Double(value)
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        PropertyValue::Bool(value)
    }
}

/// Errors surfaced by every layer of the crate.
#[derive(thiserror::Error, Debug)]
pub enum PenumbraError {
    /// Underlying I/O failure (configuration files).
    #[error("IO: {0}")]
    Io(#[from] io::Error),
    /// Invalid or conflicting configuration; never partially applied.
    #[error("configuration error: {0}")]
    Config(String),
    /// Multiplicity, uniqueness, type or data-type violation.
    #[error("schema violation: {0}")]
    SchemaViolation(String),
    /// Another transaction of this process holds the lock.
    #[error("local lock contention on {resource}: held by {holder}")]
    LocalLockContention {
        /// Locked resource, rendered for diagnostics.
        resource: String,
        /// Holder of the conflicting lock.
        holder: String,
    },
    /// The distributed expected-value check failed; retry with a fresh read.
    #[error("expected value mismatch on {resource}: {detail}")]
    ExpectedValueMismatch {
        /// Locked resource, rendered for diagnostics.
        resource: String,
        /// What did not match.
        detail: String,
    },
    /// Lifecycle transition not yet permitted.
    #[error("lifecycle precondition failed: {0}")]
    LifecyclePrecondition(String),
    /// Caller-supplied deadline elapsed.
    #[error("timed out after {waited_ms} ms waiting for {what}")]
    Timeout {
        /// Awaited condition.
        what: String,
        /// Elapsed wait.
        waited_ms: u64,
    },
    /// No more ids can be handed out for a partition/namespace.
    #[error("id pool exhausted: {0}")]
    IdPoolExhausted(String),
    /// Malformed or disallowed identifier.
    #[error("invalid id: {0}")]
    InvalidId(String),
    /// Missing element, type, index or instance.
    #[error("{0} not found")]
    NotFound(String),
    /// This instance was force-closed by a peer.
    #[error("instance {0} was force-closed by another instance; reopen the graph to register again")]
    InstanceEvicted(String),
    /// Operation on a closed handle.
    #[error("{0} is closed")]
    Closed(&'static str),
    /// Storage backend failure.
    #[error("backend failure: {0}")]
    Backend(String),
    /// Scan job aborted; rows already processed stay applied.
    #[error("scan job failed after {rows_scanned} rows: {reason}")]
    ScanFailed {
        /// Rows processed before the failure.
        rows_scanned: u64,
        /// Failure cause.
        reason: String,
    },
    /// Encoding or decoding failure.
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Coarse error classes callers match on.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    /// Configuration error.
    Config,
    /// Schema violation.
    SchemaViolation,
    /// Local lock contention.
    LocalLockContention,
    /// Distributed expected-value mismatch.
    ExpectedValueMismatch,
    /// Lifecycle precondition.
    LifecyclePrecondition,
    /// Timeout.
    Timeout,
    /// Id allocation failure.
    Ids,
    /// Missing object.
    NotFound,
    /// Handle no longer usable.
    Closed,
    /// Backend, I/O or encoding failure.
    Backend,
    /// Scan job failure.
    ScanFailed,
}

impl PenumbraError {
    /// Classifies the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            PenumbraError::Config(_) => ErrorKind::Config,
            PenumbraError::SchemaViolation(_) => ErrorKind::SchemaViolation,
            PenumbraError::LocalLockContention { .. } => ErrorKind::LocalLockContention,
            PenumbraError::ExpectedValueMismatch { .. } => ErrorKind::ExpectedValueMismatch,
            PenumbraError::LifecyclePrecondition(_) => ErrorKind::LifecyclePrecondition,
            PenumbraError::Timeout { .. } => ErrorKind::Timeout,
            PenumbraError::IdPoolExhausted(_) | PenumbraError::InvalidId(_) => ErrorKind::Ids,
            PenumbraError::NotFound(_) => ErrorKind::NotFound,
            PenumbraError::InstanceEvicted(_) | PenumbraError::Closed(_) => ErrorKind::Closed,
            PenumbraError::Io(_) | PenumbraError::Backend(_) | PenumbraError::Serialization(_) => {
                ErrorKind::Backend
            }
            PenumbraError::ScanFailed { .. } => ErrorKind::ScanFailed,
        }
    }

    /// Whether retrying after a fresh read (or after the precondition changes) can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::LocalLockContention
                | ErrorKind::ExpectedValueMismatch
                | ErrorKind::LifecyclePrecondition
        )
    }
}

impl From<serde_json::Error> for PenumbraError {
    fn from(err: serde_json::Error) -> Self {
        PenumbraError::Serialization(err.to_string())
    }
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, PenumbraError>;

pub(crate) fn clone_error(err: &PenumbraError) -> PenumbraError {
    match err {
        PenumbraError::Io(io_err) => {
            PenumbraError::Io(io::Error::new(io_err.kind(), io_err.to_string()))
        }
        PenumbraError::Config(msg) => PenumbraError::Config(msg.clone()),
        PenumbraError::SchemaViolation(msg) => PenumbraError::SchemaViolation(msg.clone()),
        PenumbraError::LocalLockContention { resource, holder } => {
            PenumbraError::LocalLockContention {
                resource: resource.clone(),
                holder: holder.clone(),
            }
        }
        PenumbraError::ExpectedValueMismatch { resource, detail } => {
            PenumbraError::ExpectedValueMismatch {
                resource: resource.clone(),
                detail: detail.clone(),
            }
        }
        PenumbraError::LifecyclePrecondition(msg) => {
            PenumbraError::LifecyclePrecondition(msg.clone())
        }
        PenumbraError::Timeout { what, waited_ms } => PenumbraError::Timeout {
            what: what.clone(),
            waited_ms: *waited_ms,
        },
        PenumbraError::IdPoolExhausted(msg) => PenumbraError::IdPoolExhausted(msg.clone()),
        PenumbraError::InvalidId(msg) => PenumbraError::InvalidId(msg.clone()),
        PenumbraError::NotFound(msg) => PenumbraError::NotFound(msg.clone()),
        PenumbraError::InstanceEvicted(id) => PenumbraError::InstanceEvicted(id.clone()),
        PenumbraError::Closed(what) => PenumbraError::Closed(what),
        PenumbraError::Backend(msg) => PenumbraError::Backend(msg.clone()),
        PenumbraError::ScanFailed {
            rows_scanned,
            reason,
        } => PenumbraError::ScanFailed {
            rows_scanned: *rows_scanned,
            reason: reason.clone(),
        },
        PenumbraError::Serialization(msg) => PenumbraError::Serialization(msg.clone()),
    }
}

impl fmt::Display for ElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for RelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for SchemaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for VertexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VertexId::Long(id) => write!(f, "{id}"),
            VertexId::Str(s) => write!(f, "{s:?}"),
        }
    }
}

impl From<u64> for VertexId {
    fn from(value: u64) -> Self {
        VertexId::Long(value)
    }
}

impl From<&str> for VertexId {
    fn from(value: &str) -> Self {
        VertexId::Str(value.to_owned())
    }
}

impl From<u32> for PartitionId {
    fn from(value: u32) -> Self {
        PartitionId(value)
    }
}

impl From<PartitionId> for u32 {
    fn from(value: PartitionId) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_conflicts_are_retryable_but_violations_are_not() {
        let local = PenumbraError::LocalLockContention {
            resource: "k".into(),
            holder: "tx-1".into(),
        };
        let remote = PenumbraError::ExpectedValueMismatch {
            resource: "k".into(),
            detail: "value changed".into(),
        };
        assert!(local.is_retryable());
        assert!(remote.is_retryable());
        assert_ne!(local.kind(), remote.kind());
        assert!(!PenumbraError::SchemaViolation("dup".into()).is_retryable());
        assert!(!PenumbraError::Config("bad".into()).is_retryable());
    }

    #[test]
    fn clone_error_preserves_kind_and_message() {
        let err = PenumbraError::ScanFailed {
            rows_scanned: 7,
            reason: "backend down".into(),
        };
        let copy = clone_error(&err);
        assert_eq!(copy.kind(), ErrorKind::ScanFailed);
        assert_eq!(copy.to_string(), err.to_string());
    }

    #[test]
    fn property_value_encoding_distinguishes_types() {
        assert_ne!(
            PropertyValue::Long(1).encode(),
            PropertyValue::Str("1".into()).encode()
        );
        assert_eq!(PropertyValue::from(5i64).encode()[0], 2);
    }
}
