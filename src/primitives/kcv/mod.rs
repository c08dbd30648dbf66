#![forbid(unsafe_code)]
//! Key-column-value storage collaborator.
//!
//! Every persistent structure in the crate (graph rows, index records, schema
//! definitions, the management log, lock claims and id blocks) is expressed as
//! ordered columns under a row key. Backends only have to provide slices,
//! per-row mutations and, for pessimistic backends, conditional locks.

mod memory;

use std::sync::Arc;
use std::time::Duration;

use crate::primitives::bytes::ord::prefix_end;
use crate::types::Result;

pub use memory::{InMemoryStore, InMemoryStoreManager};

/// A single column/value cell.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    /// Column name; rows are ordered by column bytes.
    pub column: Vec<u8>,
    /// Stored value.
    pub value: Vec<u8>,
    /// Optional time-to-live applied when the cell is written.
    pub ttl: Option<Duration>,
}

impl Entry {
    /// Cell without expiry.
    pub fn new(column: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            column: column.into(),
            value: value.into(),
            ttl: None,
        }
    }

    /// Sets the time-to-live; zero means no expiry.
    pub fn with_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.ttl = ttl.filter(|d| !d.is_zero());
        self
    }
}

/// Half-open column range `[start, end)` with an optional limit.
#[derive(Clone, Debug, Default)]
pub struct SliceQuery {
    /// Inclusive lower bound.
    pub start: Vec<u8>,
    /// Exclusive upper bound; `None` is unbounded.
    pub end: Option<Vec<u8>>,
    /// Maximum number of entries returned.
    pub limit: Option<usize>,
}

impl SliceQuery {
    /// Every column of the row.
    pub fn all() -> Self {
        Self::default()
    }

    /// Columns starting with `prefix`.
    pub fn prefix(prefix: &[u8]) -> Self {
        Self {
            start: prefix.to_vec(),
            end: prefix_end(prefix),
            limit: None,
        }
    }

    /// Exactly one column.
    pub fn exact(column: &[u8]) -> Self {
        let mut end = column.to_vec();
        end.push(0);
        Self {
            start: column.to_vec(),
            end: Some(end),
            limit: Some(1),
        }
    }

    /// Caps the number of returned entries.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether `column` falls inside the range.
    pub fn contains(&self, column: &[u8]) -> bool {
        column >= self.start.as_slice()
            && self.end.as_deref().map_or(true, |end| column < end)
    }
}

/// How the backend resolves concurrent writers.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LockingMode {
    /// No native locks; conflicts surface at commit through lock claims.
    Optimistic,
    /// Native locks held from acquisition until release.
    Pessimistic,
}

/// Capabilities advertised by a [`StoreManager`].
#[derive(Copy, Clone, Debug)]
pub struct StoreFeatures {
    /// Locking discipline.
    pub locking: LockingMode,
}

/// Ordered key-column-value store.
pub trait KeyColumnValueStore: Send + Sync {
    /// Store name.
    fn name(&self) -> &str;

    /// Returns the live cells of `key` inside `query`, ordered by column.
    fn get_slice(&self, key: &[u8], query: &SliceQuery) -> Result<Vec<Entry>>;

    /// Applies deletions and then additions to one row atomically.
    fn mutate(&self, key: &[u8], additions: Vec<Entry>, deletions: &[Vec<u8>]) -> Result<()>;

    /// Takes a native lock on `(key, column)` for `holder` and verifies that the
    /// stored value equals `expected` (`None` meaning absent).
    fn acquire_lock(
        &self,
        key: &[u8],
        column: &[u8],
        expected: Option<&[u8]>,
        holder: &str,
    ) -> Result<()>;

    /// Releases every native lock held by `holder`.
    fn release_locks(&self, holder: &str) -> Result<()>;

    /// Returns every row key in order.
    fn keys(&self) -> Result<Vec<Vec<u8>>>;

    /// Reads a single cell.
    fn get(&self, key: &[u8], column: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self
            .get_slice(key, &SliceQuery::exact(column))?
            .into_iter()
            .find(|e| e.column == column)
            .map(|e| e.value))
    }
}

/// Opens named stores on one shared backend.
pub trait StoreManager: Send + Sync {
    /// Opens (creating if needed) the store called `name`.
    fn open_store(&self, name: &str) -> Result<Arc<dyn KeyColumnValueStore>>;

    /// Backend capabilities.
    fn features(&self) -> StoreFeatures;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_slice_contains_only_the_column() {
        let q = SliceQuery::exact(b"ab");
        assert!(q.contains(b"ab"));
        assert!(!q.contains(b"ab\x01"));
        assert!(!q.contains(b"aa"));
    }

    #[test]
    fn zero_ttl_means_no_expiry() {
        let entry = Entry::new(b"c".to_vec(), b"v".to_vec()).with_ttl(Some(Duration::ZERO));
        assert!(entry.ttl.is_none());
    }
}
