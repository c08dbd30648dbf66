//! Append-only logs over the key-column-value store.
//!
//! Each log is one row of the log store. Messages are columns keyed by
//! `timestamp | sender`, so a reader scanning a timestamp window sees every
//! sender's messages in append order. Readers stay `read-lag` behind the wall
//! clock to give in-flight appends time to land.

use std::fmt;
use std::sync::Arc;

use tracing::trace;

use crate::primitives::bytes::ord::{get_u64_be, put_u64_be};
use crate::primitives::kcv::{Entry, KeyColumnValueStore, SliceQuery};
use crate::storage::clock;
use crate::types::{PenumbraError, Result};

/// Which log a message belongs to.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum LogId {
    /// Schema change propagation between instances.
    Management,
    /// Change records of every transaction, when enabled.
    Transaction,
    /// Change records of transactions opened with this log identifier.
    User(String),
}

impl LogId {
    fn row_key(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }
}

impl fmt::Display for LogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogId::Management => f.write_str("mgmt"),
            LogId::Transaction => f.write_str("txlog"),
            LogId::User(name) => write!(f, "ulog_{name}"),
        }
    }
}

/// A message read back from a log.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogMessage {
    /// Append timestamp; also the reader offset.
    pub ts: u64,
    /// Instance that appended the message.
    pub sender: String,
    /// Opaque payload.
    pub payload: Vec<u8>,
}

/// One log, written as one instance.
pub struct KcvLog {
    id: LogId,
    store: Arc<dyn KeyColumnValueStore>,
    sender: String,
}

impl KcvLog {
    /// Opens log `id` in `store`; appends are attributed to `sender`.
    pub fn new(store: Arc<dyn KeyColumnValueStore>, id: LogId, sender: impl Into<String>) -> Self {
        Self {
            id,
            store,
            sender: sender.into(),
        }
    }

    /// Log identifier.
    pub fn id(&self) -> &LogId {
        &self.id
    }

    /// Appends `payload`, returning its timestamp.
    pub fn append(&self, payload: Vec<u8>) -> Result<u64> {
        let ts = clock::now_nanos();
        let mut column = Vec::with_capacity(8 + self.sender.len());
        put_u64_be(&mut column, ts);
        column.extend_from_slice(self.sender.as_bytes());
        self.store
            .mutate(&self.id.row_key(), vec![Entry::new(column, payload)], &[])?;
        trace!(log = %self.id, ts, "log.appended");
        Ok(ts)
    }

    /// Messages with `after < ts <= until`, ordered by timestamp.
    pub fn read(&self, after: u64, until: u64) -> Result<Vec<LogMessage>> {
        if until <= after {
            return Ok(Vec::new());
        }
        let mut start = Vec::with_capacity(8);
        put_u64_be(&mut start, after.saturating_add(1));
        let end = until.checked_add(1).map(|bound| {
            let mut end = Vec::with_capacity(8);
            put_u64_be(&mut end, bound);
            end
        });
        let query = SliceQuery {
            start,
            end,
            limit: None,
        };
        self.store
            .get_slice(&self.id.row_key(), &query)?
            .into_iter()
            .map(|entry| {
                let ts = get_u64_be(&entry.column)?;
                let sender = std::str::from_utf8(&entry.column[8..])
                    .map_err(|e| PenumbraError::Serialization(format!("log sender: {e}")))?
                    .to_owned();
                Ok(LogMessage {
                    ts,
                    sender,
                    payload: entry.value,
                })
            })
            .collect()
    }

    /// Upper bound of the read window at this moment.
    pub fn read_horizon(lag: std::time::Duration) -> u64 {
        clock::minus(clock::wall_nanos(), lag)
    }
}
