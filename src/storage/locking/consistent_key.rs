//! Expected-value locks built from lock claims in a companion store.
//!
//! A writer first takes the cell in the process-local mediator, then appends a
//! claim `timestamp | holder` under the cell's claim row. Before commit it
//! waits out the claim wait, ignores expired claims and must find its own claim
//! oldest. Only then is the stored value compared with the value the writer
//! originally read. Pessimistic backends skip the claims and hold a native lock
//! instead.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::primitives::bytes::ord::{get_u64_be, put_bytes_key, put_u64_be};
use crate::primitives::concurrency::{KeyColumn, LocalLockMediator};
use crate::primitives::kcv::{Entry, KeyColumnValueStore, LockingMode, SliceQuery};
use crate::storage::clock;
use crate::types::{PenumbraError, Result};

/// Claim timing.
#[derive(Copy, Clone, Debug)]
pub struct LockerConfig {
    /// Delay between writing a claim and checking seniority.
    pub wait: Duration,
    /// Age after which claims are ignored.
    pub expire: Duration,
    /// Attempts at writing a claim.
    pub retries: u32,
}

/// Locks cells of one store.
pub struct ConsistentKeyLocker {
    store: Arc<dyn KeyColumnValueStore>,
    lock_store: Arc<dyn KeyColumnValueStore>,
    mediator: Arc<LocalLockMediator>,
    mode: LockingMode,
    cfg: LockerConfig,
}

struct HeldLock {
    locker: Arc<ConsistentKeyLocker>,
    target: KeyColumn,
    expected: Option<Vec<u8>>,
    claim_ts: u64,
}

/// Locks taken by one transaction.
pub struct LockState {
    holder: String,
    held: Vec<HeldLock>,
}

impl LockState {
    /// Empty lock set for `holder`.
    pub fn new(holder: impl Into<String>) -> Self {
        Self {
            holder: holder.into(),
            held: Vec::new(),
        }
    }

    /// Holder id used in claims and mediators.
    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Number of locked cells.
    pub fn len(&self) -> usize {
        self.held.len()
    }

    /// Whether nothing is locked.
    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }

    /// Whether `target` of `store` is already locked by this holder.
    pub fn holds(&self, store: &str, target: &KeyColumn) -> bool {
        self.held
            .iter()
            .any(|h| h.locker.store.name() == store && &h.target == target)
    }

    /// Verifies every lock; fails on the first lost seniority or changed value.
    pub fn check_all(&self) -> Result<()> {
        for held in &self.held {
            held.locker.check(held, &self.holder)?;
        }
        Ok(())
    }

    /// Deletes claims and releases mediator and backend locks.
    pub fn release_all(&mut self) {
        let mut native: Vec<Arc<ConsistentKeyLocker>> = Vec::new();
        for held in self.held.drain(..) {
            held.locker.release(&held, &self.holder);
            if held.locker.mode == LockingMode::Pessimistic
                && !native.iter().any(|l| Arc::ptr_eq(l, &held.locker))
            {
                native.push(Arc::clone(&held.locker));
            }
        }
        for locker in native {
            if let Err(err) = locker.store.release_locks(&self.holder) {
                warn!(holder = %self.holder, error = %err, "lock.native.release_failed");
            }
        }
    }
}

impl Drop for LockState {
    fn drop(&mut self) {
        if !self.held.is_empty() {
            self.release_all();
        }
    }
}

impl ConsistentKeyLocker {
    /// Locker for `store` with claims in `lock_store`.
    pub fn new(
        store: Arc<dyn KeyColumnValueStore>,
        lock_store: Arc<dyn KeyColumnValueStore>,
        mediator: Arc<LocalLockMediator>,
        mode: LockingMode,
        cfg: LockerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            lock_store,
            mediator,
            mode,
            cfg,
        })
    }

    /// Name of the locked store.
    pub fn store_name(&self) -> &str {
        self.store.name()
    }

    /// Locks `target` for the holder of `state`, remembering `expected` as the
    /// value the holder read.
    ///
    /// Same-process contention fails with
    /// [`PenumbraError::LocalLockContention`] before the backend is touched.
    pub fn write_lock(
        self: &Arc<Self>,
        state: &mut LockState,
        target: KeyColumn,
        expected: Option<Vec<u8>>,
    ) -> Result<()> {
        if state.holds(self.store.name(), &target) {
            return Ok(());
        }
        let expires = Instant::now() + self.cfg.expire;
        self.mediator.lock(&target, &state.holder, expires)?;
        let claim_ts = match self.mode {
            LockingMode::Optimistic => match self.write_claim(&target, &state.holder) {
                Ok(ts) => ts,
                Err(err) => {
                    self.mediator.unlock(&target, &state.holder);
                    return Err(err);
                }
            },
            LockingMode::Pessimistic => {
                if let Err(err) = self.store.acquire_lock(
                    &target.key,
                    &target.column,
                    expected.as_deref(),
                    &state.holder,
                ) {
                    self.mediator.unlock(&target, &state.holder);
                    debug!(store = self.store.name(), target = %target, "lock.native.rejected");
                    return Err(err);
                }
                0
            }
        };
        debug!(store = self.store.name(), target = %target, holder = %state.holder, "lock.claim.written");
        state.held.push(HeldLock {
            locker: Arc::clone(self),
            target,
            expected,
            claim_ts,
        });
        Ok(())
    }

    fn write_claim(&self, target: &KeyColumn, holder: &str) -> Result<u64> {
        let row = claim_row(target);
        let mut last_err = None;
        for attempt in 0..self.cfg.retries.max(1) {
            let ts = clock::now_nanos();
            let column = claim_column(ts, holder);
            match self.lock_store.mutate(&row, vec![Entry::new(column.clone(), Vec::new())], &[]) {
                Ok(()) => return Ok(ts),
                Err(err) => {
                    warn!(attempt, target = %target, error = %err, "lock.claim.write_failed");
                    if let Err(err) = self.lock_store.mutate(&row, Vec::new(), &[column]) {
                        warn!(target = %target, error = %err, "lock.claim.delete_failed");
                    }
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| PenumbraError::Backend("lock claim not written".into())))
    }

    fn check(&self, held: &HeldLock, holder: &str) -> Result<()> {
        let resource = format!("{}:{}", self.store.name(), held.target);
        if self.mode == LockingMode::Optimistic {
            let ready = held.claim_ts + self.cfg.wait.as_nanos() as u64;
            let now = clock::wall_nanos();
            if now < ready {
                thread::sleep(Duration::from_nanos(ready - now));
            }
            let cutoff = clock::minus(clock::wall_nanos(), self.cfg.expire);
            let claims = self
                .lock_store
                .get_slice(&claim_row(&held.target), &SliceQuery::all())?;
            let senior = claims
                .iter()
                .filter_map(|e| parse_claim(&e.column))
                .find(|(ts, _)| *ts >= cutoff);
            match senior {
                Some((ts, owner)) if owner == holder && ts == held.claim_ts => {}
                Some((_, owner)) if owner != holder => {
                    debug!(resource = %resource, senior = %owner, "lock.claim.rejected");
                    return Err(PenumbraError::ExpectedValueMismatch {
                        resource,
                        detail: format!("lock claim of {owner} is senior"),
                    });
                }
                _ => {
                    return Err(PenumbraError::ExpectedValueMismatch {
                        resource,
                        detail: "lock claim expired before commit".into(),
                    })
                }
            }
        }
        let actual = self.store.get(&held.target.key, &held.target.column)?;
        if actual != held.expected {
            debug!(resource = %resource, "lock.expected_value.mismatch");
            return Err(PenumbraError::ExpectedValueMismatch {
                resource,
                detail: "stored value changed since it was read".into(),
            });
        }
        trace!(resource = %resource, "lock.checked");
        Ok(())
    }

    fn release(&self, held: &HeldLock, holder: &str) {
        if self.mode == LockingMode::Optimistic {
            let column = claim_column(held.claim_ts, holder);
            if let Err(err) = self
                .lock_store
                .mutate(&claim_row(&held.target), Vec::new(), &[column])
            {
                warn!(target = %held.target, error = %err, "lock.claim.delete_failed");
            }
        }
        self.mediator.unlock(&held.target, holder);
    }
}

fn claim_row(target: &KeyColumn) -> Vec<u8> {
    let mut row = Vec::with_capacity(4 + target.key.len() + target.column.len());
    put_bytes_key(&mut row, &target.key);
    row.extend_from_slice(&target.column);
    row
}

fn claim_column(ts: u64, holder: &str) -> Vec<u8> {
    let mut col = Vec::with_capacity(8 + holder.len());
    put_u64_be(&mut col, ts);
    col.extend_from_slice(holder.as_bytes());
    col
}

fn parse_claim(column: &[u8]) -> Option<(u64, String)> {
    let ts = get_u64_be(column).ok()?;
    let holder = std::str::from_utf8(column.get(8..)?).ok()?;
    Some((ts, holder.to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::kcv::{InMemoryStoreManager, StoreManager};
    use std::sync::Barrier;

    fn cfg() -> LockerConfig {
        LockerConfig {
            wait: Duration::from_millis(5),
            expire: Duration::from_secs(60),
            retries: 3,
        }
    }

    fn locker(mgr: &InMemoryStoreManager, group: &str) -> Result<Arc<ConsistentKeyLocker>> {
        Ok(ConsistentKeyLocker::new(
            mgr.open_store("edgestore")?,
            mgr.open_store("edgestore_lock_")?,
            Arc::new(LocalLockMediator::new(format!("{group}:edgestore"))),
            mgr.features().locking,
            cfg(),
        ))
    }

    fn target() -> KeyColumn {
        KeyColumn::new(b"row".to_vec(), b"col".to_vec())
    }

    #[test]
    fn same_process_contention_fails_fast() -> Result<()> {
        let mgr = InMemoryStoreManager::new();
        let l = locker(&mgr, "p")?;
        let mut a = LockState::new("tx-a");
        let mut b = LockState::new("tx-b");
        l.write_lock(&mut a, target(), None)?;
        let err = l.write_lock(&mut b, target(), None).unwrap_err();
        assert!(matches!(err, PenumbraError::LocalLockContention { .. }));
        assert_eq!(mgr.store("edgestore_lock_").cell_count(), 1);
        a.release_all();
        assert_eq!(mgr.store("edgestore_lock_").cell_count(), 0);
        l.write_lock(&mut b, target(), None)?;
        b.check_all()?;
        Ok(())
    }

    #[test]
    fn failed_claim_write_releases_the_mediator() -> Result<()> {
        let mgr = InMemoryStoreManager::new();
        let l = locker(&mgr, "p")?;
        mgr.fail_writes("edgestore_lock_", 0);
        let mut a = LockState::new("tx-a");
        let err = l.write_lock(&mut a, target(), None).unwrap_err();
        assert!(matches!(err, PenumbraError::Backend(_)));
        mgr.heal("edgestore_lock_");
        assert_eq!(mgr.store("edgestore_lock_").cell_count(), 0);
        let mut b = LockState::new("tx-b");
        l.write_lock(&mut b, target(), None)?;
        b.check_all()?;
        Ok(())
    }

    #[test]
    fn junior_claim_loses_across_processes() -> Result<()> {
        let mgr = InMemoryStoreManager::new();
        let first = locker(&mgr, "p1")?;
        let second = locker(&mgr, "p2")?;
        let mut a = LockState::new("p1:1");
        let mut b = LockState::new("p2:1");
        first.write_lock(&mut a, target(), None)?;
        second.write_lock(&mut b, target(), None)?;
        a.check_all()?;
        let err = b.check_all().unwrap_err();
        assert!(matches!(err, PenumbraError::ExpectedValueMismatch { .. }));
        assert!(err.is_retryable());
        Ok(())
    }

    #[test]
    fn changed_value_is_detected_after_seniority() -> Result<()> {
        let mgr = InMemoryStoreManager::new();
        let l = locker(&mgr, "p")?;
        let mut a = LockState::new("tx-a");
        l.write_lock(&mut a, target(), None)?;
        mgr.store("edgestore")
            .mutate(b"row", vec![Entry::new(b"col".to_vec(), b"v".to_vec())], &[])?;
        let err = a.check_all().unwrap_err();
        assert!(
            matches!(err, PenumbraError::ExpectedValueMismatch { ref detail, .. } if detail.contains("changed"))
        );
        Ok(())
    }

    #[test]
    fn pessimistic_second_acquirer_fails_immediately() -> Result<()> {
        let mgr = InMemoryStoreManager::with_locking(LockingMode::Pessimistic);
        let first = locker(&mgr, "p1")?;
        let second = locker(&mgr, "p2")?;
        let mut a = LockState::new("p1:1");
        let mut b = LockState::new("p2:1");
        first.write_lock(&mut a, target(), None)?;
        let err = second.write_lock(&mut b, target(), None).unwrap_err();
        assert!(matches!(err, PenumbraError::ExpectedValueMismatch { .. }));
        drop(a);
        second.write_lock(&mut b, target(), None)?;
        Ok(())
    }

    #[test]
    fn concurrent_processes_elect_one_winner() -> Result<()> {
        let mgr = InMemoryStoreManager::new();
        let barrier = Arc::new(Barrier::new(4));
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let l = locker(&mgr, &format!("p{i}")).unwrap();
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    let mut state = LockState::new(format!("p{i}:1"));
                    barrier.wait();
                    l.write_lock(&mut state, target(), None).unwrap();
                    let won = state.check_all().is_ok();
                    if won {
                        thread::sleep(Duration::from_millis(20));
                    }
                    won
                })
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|w| *w)
            .count();
        assert_eq!(winners, 1);
        Ok(())
    }
}
