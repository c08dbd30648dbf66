#![forbid(unsafe_code)]

//! In-process lock mediation.
//!
//! Transactions of one process that target the same `(key, column)` cell are
//! arbitrated here before any lock claim reaches the backend, so local
//! contention fails fast and never costs a backend round-trip.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::trace;

use crate::types::{PenumbraError, Result};

/// A lockable cell of a store.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct KeyColumn {
    /// Row key.
    pub key: Vec<u8>,
    /// Column within the row.
    pub column: Vec<u8>,
}

impl KeyColumn {
    /// Creates a key/column pair.
    pub fn new(key: impl Into<Vec<u8>>, column: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            column: column.into(),
        }
    }
}

impl fmt::Display for KeyColumn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", hex::encode(&self.key), hex::encode(&self.column))
    }
}

#[derive(Clone, Debug)]
struct AuditRecord {
    holder: String,
    expires: Instant,
}

/// Arbitrates cell locks between transactions of the same process.
pub struct LocalLockMediator {
    name: String,
    locks: Mutex<FxHashMap<KeyColumn, AuditRecord>>,
}

impl LocalLockMediator {
    /// Creates an empty mediator.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            locks: Mutex::new(FxHashMap::default()),
        }
    }

    /// Mediator name (`group:store`).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Locks `kc` for `holder` until `expires`.
    ///
    /// Succeeds when the cell is free, already held by `holder` (the expiry is
    /// refreshed) or held by an expired record.
    pub fn lock(&self, kc: &KeyColumn, holder: &str, expires: Instant) -> Result<()> {
        let mut locks = self.locks.lock();
        let now = Instant::now();
        if let Some(existing) = locks.get(kc) {
            if existing.holder != holder && existing.expires > now {
                trace!(
                    mediator = %self.name,
                    target = %kc,
                    holder = %existing.holder,
                    "lock.local.contention"
                );
                return Err(PenumbraError::LocalLockContention {
                    resource: format!("{}:{kc}", self.name),
                    holder: existing.holder.clone(),
                });
            }
        }
        locks.insert(
            kc.clone(),
            AuditRecord {
                holder: holder.to_owned(),
                expires,
            },
        );
        trace!(mediator = %self.name, target = %kc, holder, "lock.local.acquired");
        Ok(())
    }

    /// Releases `kc` if `holder` owns it; returns whether anything was released.
    pub fn unlock(&self, kc: &KeyColumn, holder: &str) -> bool {
        let mut locks = self.locks.lock();
        match locks.get(kc) {
            Some(record) if record.holder == holder => {
                locks.remove(kc);
                true
            }
            _ => false,
        }
    }

    /// Current unexpired holder of `kc`.
    pub fn holder(&self, kc: &KeyColumn) -> Option<String> {
        let now = Instant::now();
        self.locks
            .lock()
            .get(kc)
            .filter(|r| r.expires > now)
            .map(|r| r.holder.clone())
    }
}

/// Process-wide mediator for the `group`/`store` pair.
///
/// Graph handles configured with the same mediator group share mediators and
/// therefore see each other's transactions as local.
pub fn mediator(group: &str, store: &str) -> Arc<LocalLockMediator> {
    static MEDIATORS: OnceLock<Mutex<HashMap<String, Arc<LocalLockMediator>>>> = OnceLock::new();
    let name = format!("{group}:{store}");
    let mut registry = MEDIATORS.get_or_init(|| Mutex::new(HashMap::new())).lock();
    Arc::clone(
        registry
            .entry(name.clone())
            .or_insert_with(|| Arc::new(LocalLockMediator::new(name))),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    fn far() -> Instant {
        Instant::now() + Duration::from_secs(60)
    }

    #[test]
    fn second_holder_is_rejected_until_unlock() {
        let m = LocalLockMediator::new("t");
        let kc = KeyColumn::new(b"k".to_vec(), b"c".to_vec());
        m.lock(&kc, "tx-1", far()).unwrap();
        let err = m.lock(&kc, "tx-2", far()).unwrap_err();
        assert!(matches!(err, PenumbraError::LocalLockContention { ref holder, .. } if holder == "tx-1"));
        assert!(!m.unlock(&kc, "tx-2"));
        assert!(m.unlock(&kc, "tx-1"));
        m.lock(&kc, "tx-2", far()).unwrap();
        assert_eq!(m.holder(&kc).as_deref(), Some("tx-2"));
    }

    #[test]
    fn relock_by_holder_and_expired_records() {
        let m = LocalLockMediator::new("t");
        let kc = KeyColumn::new(b"k".to_vec(), b"c".to_vec());
        m.lock(&kc, "tx-1", Instant::now()).unwrap();
        m.lock(&kc, "tx-2", far()).unwrap();
        m.lock(&kc, "tx-2", far()).unwrap();
        assert_eq!(m.holder(&kc).as_deref(), Some("tx-2"));
    }

    #[test]
    fn exactly_one_concurrent_locker_wins() {
        let m = Arc::new(LocalLockMediator::new("t"));
        let barrier = Arc::new(Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let m = Arc::clone(&m);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    let kc = KeyColumn::new(b"k".to_vec(), b"c".to_vec());
                    m.lock(&kc, &format!("tx-{i}"), far()).is_ok()
                })
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn registry_shares_mediators_per_group() {
        let a = mediator("group-a", "edgestore");
        let b = mediator("group-a", "edgestore");
        let c = mediator("group-b", "edgestore");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
