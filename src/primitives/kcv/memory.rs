use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

use super::{Entry, KeyColumnValueStore, LockingMode, SliceQuery, StoreFeatures, StoreManager};
use crate::types::{PenumbraError, Result};

#[derive(Clone, Debug)]
struct Cell {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Cell {
    fn live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// Remaining successful writes before a store starts failing.
#[derive(Default)]
struct FailurePlan {
    stores: HashMap<String, u64>,
}

impl FailurePlan {
    fn check_write(&mut self, store: &str) -> Result<()> {
        match self.stores.get_mut(store) {
            Some(0) => Err(PenumbraError::Backend(format!(
                "injected write failure on store {store}"
            ))),
            Some(remaining) => {
                *remaining -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }
}

/// Shared in-process backend; every simulated instance opens the same stores.
#[derive(Clone)]
pub struct InMemoryStoreManager {
    stores: Arc<Mutex<HashMap<String, Arc<InMemoryStore>>>>,
    failures: Arc<Mutex<FailurePlan>>,
    features: StoreFeatures,
}

impl InMemoryStoreManager {
    /// Optimistic backend (distributed lock claims decide conflicts).
    pub fn new() -> Self {
        Self::with_locking(LockingMode::Optimistic)
    }

    /// Backend with the given locking discipline.
    pub fn with_locking(locking: LockingMode) -> Self {
        Self {
            stores: Arc::new(Mutex::new(HashMap::new())),
            failures: Arc::new(Mutex::new(FailurePlan::default())),
            features: StoreFeatures { locking },
        }
    }

    /// Makes writes to `store` fail once `after` more writes have succeeded.
    pub fn fail_writes(&self, store: &str, after: u64) {
        debug!(store, after, "kcv.memory.inject_failure");
        self.failures.lock().stores.insert(store.to_owned(), after);
    }

    /// Removes any injected failure for `store`.
    pub fn heal(&self, store: &str) {
        self.failures.lock().stores.remove(store);
    }

    /// Typed handle to a store, opening it if needed.
    pub fn store(&self, name: &str) -> Arc<InMemoryStore> {
        let mut stores = self.stores.lock();
        Arc::clone(stores.entry(name.to_owned()).or_insert_with(|| {
            Arc::new(InMemoryStore {
                name: name.to_owned(),
                rows: RwLock::new(BTreeMap::new()),
                locks: Mutex::new(HashMap::new()),
                failures: Arc::clone(&self.failures),
            })
        }))
    }
}

impl Default for InMemoryStoreManager {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreManager for InMemoryStoreManager {
    fn open_store(&self, name: &str) -> Result<Arc<dyn KeyColumnValueStore>> {
        let store: Arc<dyn KeyColumnValueStore> = self.store(name);
        Ok(store)
    }

    fn features(&self) -> StoreFeatures {
        self.features
    }
}

type Row = BTreeMap<Vec<u8>, Cell>;

/// Ordered in-memory store.
pub struct InMemoryStore {
    name: String,
    rows: RwLock<BTreeMap<Vec<u8>, Row>>,
    locks: Mutex<HashMap<(Vec<u8>, Vec<u8>), String>>,
    failures: Arc<Mutex<FailurePlan>>,
}

impl InMemoryStore {
    /// Number of live cells across all rows.
    pub fn cell_count(&self) -> usize {
        let now = Instant::now();
        self.rows
            .read()
            .values()
            .map(|row| row.values().filter(|c| c.live(now)).count())
            .sum()
    }

    fn current_value(&self, key: &[u8], column: &[u8]) -> Option<Vec<u8>> {
        let now = Instant::now();
        self.rows
            .read()
            .get(key)
            .and_then(|row| row.get(column))
            .filter(|c| c.live(now))
            .map(|c| c.value.clone())
    }
}

impl KeyColumnValueStore for InMemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn get_slice(&self, key: &[u8], query: &SliceQuery) -> Result<Vec<Entry>> {
        let now = Instant::now();
        let rows = self.rows.read();
        let Some(row) = rows.get(key) else {
            return Ok(Vec::new());
        };
        let upper = match &query.end {
            Some(end) if *end <= query.start => return Ok(Vec::new()),
            Some(end) => Bound::Excluded(end.clone()),
            None => Bound::Unbounded,
        };
        let limit = query.limit.unwrap_or(usize::MAX);
        let out: Vec<Entry> = row
            .range((Bound::Included(query.start.clone()), upper))
            .filter(|(_, cell)| cell.live(now))
            .take(limit)
            .map(|(column, cell)| Entry::new(column.clone(), cell.value.clone()))
            .collect();
        Ok(out)
    }

    fn mutate(&self, key: &[u8], additions: Vec<Entry>, deletions: &[Vec<u8>]) -> Result<()> {
        self.failures.lock().check_write(&self.name)?;
        let now = Instant::now();
        let mut rows = self.rows.write();
        let row = rows.entry(key.to_vec()).or_default();
        for column in deletions {
            row.remove(column);
        }
        for entry in additions {
            row.insert(
                entry.column,
                Cell {
                    value: entry.value,
                    expires_at: entry.ttl.map(|ttl| now + ttl),
                },
            );
        }
        if row.is_empty() {
            rows.remove(key);
        }
        trace!(store = %self.name, key = %hex::encode(key), "kcv.memory.mutate");
        Ok(())
    }

    fn acquire_lock(
        &self,
        key: &[u8],
        column: &[u8],
        expected: Option<&[u8]>,
        holder: &str,
    ) -> Result<()> {
        let resource = format!("{}:{}:{}", self.name, hex::encode(key), hex::encode(column));
        let mut locks = self.locks.lock();
        let slot = (key.to_vec(), column.to_vec());
        if let Some(current) = locks.get(&slot) {
            if current != holder {
                return Err(PenumbraError::ExpectedValueMismatch {
                    resource,
                    detail: format!("backend lock held by {current}"),
                });
            }
        }
        let actual = self.current_value(key, column);
        if actual.as_deref() != expected {
            return Err(PenumbraError::ExpectedValueMismatch {
                resource,
                detail: "stored value differs from expected value".into(),
            });
        }
        locks.insert(slot, holder.to_owned());
        Ok(())
    }

    fn release_locks(&self, holder: &str) -> Result<()> {
        self.locks.lock().retain(|_, owner| owner != holder);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<Vec<u8>>> {
        Ok(self.rows.read().keys().cloned().collect())
    }
}
