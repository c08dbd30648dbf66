//! Schema change propagation between instances.
//!
//! A management commit broadcasts an eviction naming the changed schema
//! elements. Every reader, the sender included, drops those elements from its
//! cache and acknowledges once the transactions it had open at receipt have
//! closed. The sender keeps a trigger with the instances registered at commit
//! time; when each of them has acknowledged or is gone, the trigger's status
//! updates become ready to apply.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::instances::InstanceRegistry;
use super::log::KcvLog;
use crate::storage::clock;
use crate::storage::schema::{SchemaRegistry, SchemaStatus};
use crate::types::{Result, SchemaId};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
enum MgmtMessage {
    Eviction {
        eviction_id: u64,
        schema_ids: Vec<SchemaId>,
    },
    Ack {
        origin: String,
        eviction_id: u64,
    },
}

/// Status change applied once an eviction has been acknowledged everywhere.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusUpdate {
    /// Index to update.
    pub index: SchemaId,
    /// Fields to update; empty means every field.
    pub fields: Vec<SchemaId>,
    /// Status the fields must still have.
    pub from: SchemaStatus,
    /// New status.
    pub to: SchemaStatus,
}

struct EvictionTrigger {
    snapshot: BTreeSet<String>,
    acked: BTreeSet<String>,
    updates: Vec<StatusUpdate>,
}

struct PendingAck {
    origin: String,
    eviction_id: u64,
    waiting_on: Vec<u64>,
    deadline: Instant,
}

/// Open transactions of one instance.
#[derive(Default)]
pub struct TransactionTracker {
    next: AtomicU64,
    open: Mutex<FxHashSet<u64>>,
}

impl TransactionTracker {
    /// Registers a new transaction and returns its sequence number.
    pub fn begin(&self) -> u64 {
        let seq = self.next.fetch_add(1, Ordering::Relaxed) + 1;
        self.open.lock().insert(seq);
        seq
    }

    /// Marks `seq` closed.
    pub fn finish(&self, seq: u64) {
        self.open.lock().remove(&seq);
    }

    /// Currently open transactions.
    pub fn snapshot(&self) -> Vec<u64> {
        self.open.lock().iter().copied().collect()
    }

    /// Number of open transactions.
    pub fn open_count(&self) -> usize {
        self.open.lock().len()
    }

    fn any_open(&self, seqs: &[u64]) -> bool {
        let open = self.open.lock();
        seqs.iter().any(|s| open.contains(s))
    }
}

/// Result of one management log poll.
#[derive(Debug, Default)]
pub struct PollOutcome {
    /// Evictions read.
    pub evictions: usize,
    /// Acknowledgements sent.
    pub acks_sent: usize,
    /// Status updates whose triggers fired, plus earlier ones that failed to
    /// apply.
    pub ready: Vec<StatusUpdate>,
}

/// Sends and consumes management log messages for one instance.
pub struct ManagementLogger {
    instance_id: String,
    log: KcvLog,
    instances: Arc<InstanceRegistry>,
    schema: Arc<SchemaRegistry>,
    tracker: Arc<TransactionTracker>,
    read_lag: Duration,
    ack_max_wait: Duration,
    position: Mutex<u64>,
    triggers: Mutex<FxHashMap<u64, EvictionTrigger>>,
    unapplied: Mutex<Vec<StatusUpdate>>,
    pending: Mutex<Vec<PendingAck>>,
}

impl ManagementLogger {
    /// Creates a logger reading from `start` onwards.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        instance_id: impl Into<String>,
        log: KcvLog,
        instances: Arc<InstanceRegistry>,
        schema: Arc<SchemaRegistry>,
        tracker: Arc<TransactionTracker>,
        read_lag: Duration,
        ack_max_wait: Duration,
        start: u64,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            log,
            instances,
            schema,
            tracker,
            read_lag,
            ack_max_wait,
            position: Mutex::new(start),
            triggers: Mutex::new(FxHashMap::default()),
            unapplied: Mutex::new(Vec::new()),
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Broadcasts an eviction of `schema_ids`.
    ///
    /// When `updates` is non-empty they are held until every instance open now
    /// has acknowledged. A failed append drops the trigger and is returned to
    /// the caller; the schema change itself is already durable.
    pub fn send_eviction(&self, schema_ids: Vec<SchemaId>, updates: Vec<StatusUpdate>) -> Result<u64> {
        let eviction_id = clock::now_nanos();
        if !updates.is_empty() {
            let snapshot: BTreeSet<String> = self.instances.open_ids()?.into_iter().collect();
            debug!(eviction_id, instances = snapshot.len(), "mgmt.log.trigger.registered");
            self.triggers.lock().insert(
                eviction_id,
                EvictionTrigger {
                    snapshot,
                    acked: BTreeSet::new(),
                    updates,
                },
            );
        }
        let message = MgmtMessage::Eviction {
            eviction_id,
            schema_ids: schema_ids.clone(),
        };
        if let Err(err) = serde_json::to_vec(&message)
            .map_err(Into::into)
            .and_then(|payload| self.log.append(payload))
        {
            self.triggers.lock().remove(&eviction_id);
            warn!(eviction_id, error = %err, "mgmt.log.eviction.send_failed");
            return Err(err);
        }
        info!(eviction_id, elements = schema_ids.len(), "mgmt.log.eviction.sent");
        Ok(eviction_id)
    }

    /// Heartbeats, reads new messages, sends due acknowledgements and
    /// collects fired triggers.
    pub fn poll(&self) -> Result<PollOutcome> {
        let mut outcome = PollOutcome::default();
        let mut position = self.position.lock();
        self.instances.heartbeat(&self.instance_id, *position)?;
        let horizon = KcvLog::read_horizon(self.read_lag).max(*position);
        for message in self.log.read(*position, horizon)? {
            match serde_json::from_slice::<MgmtMessage>(&message.payload) {
                Ok(MgmtMessage::Eviction {
                    eviction_id,
                    schema_ids,
                }) => {
                    self.schema.expire(&schema_ids);
                    outcome.evictions += 1;
                    debug!(
                        eviction_id,
                        origin = %message.sender,
                        elements = schema_ids.len(),
                        "mgmt.log.eviction.received"
                    );
                    self.pending.lock().push(PendingAck {
                        origin: message.sender,
                        eviction_id,
                        waiting_on: self.tracker.snapshot(),
                        deadline: Instant::now() + self.ack_max_wait,
                    });
                }
                Ok(MgmtMessage::Ack {
                    origin,
                    eviction_id,
                }) => {
                    if origin == self.instance_id {
                        if let Some(trigger) = self.triggers.lock().get_mut(&eviction_id) {
                            trigger.acked.insert(message.sender.clone());
                        }
                        debug!(eviction_id, from = %message.sender, "mgmt.log.ack.received");
                    }
                }
                Err(err) => warn!(ts = message.ts, error = %err, "mgmt.log.message.undecodable"),
            }
        }
        *position = horizon;
        drop(position);
        outcome.acks_sent = self.send_due_acks()?;
        outcome.ready = self.fire_triggers()?;
        Ok(outcome)
    }

    /// Hands back fired updates that could not be applied; the next poll
    /// returns them again.
    pub fn requeue(&self, updates: Vec<StatusUpdate>) {
        if updates.is_empty() {
            return;
        }
        warn!(updates = updates.len(), "mgmt.log.trigger.requeued");
        self.unapplied.lock().extend(updates);
    }

    /// Triggers still waiting for acknowledgements.
    pub fn pending_triggers(&self) -> usize {
        self.triggers.lock().len()
    }

    /// Acknowledgements waiting for local transactions to close.
    pub fn pending_acks(&self) -> usize {
        self.pending.lock().len()
    }

    fn send_due_acks(&self) -> Result<usize> {
        let due: Vec<PendingAck> = {
            let mut pending = self.pending.lock();
            let now = Instant::now();
            let (due, waiting): (Vec<_>, Vec<_>) = pending.drain(..).partition(|p| {
                !self.tracker.any_open(&p.waiting_on) || p.deadline <= now
            });
            *pending = waiting;
            due
        };
        let mut sent = 0;
        let mut failed = Vec::new();
        for ack in due {
            if self.tracker.any_open(&ack.waiting_on) {
                warn!(
                    eviction_id = ack.eviction_id,
                    open = ack.waiting_on.len(),
                    "mgmt.log.ack.stale_transactions"
                );
            }
            let message = MgmtMessage::Ack {
                origin: ack.origin.clone(),
                eviction_id: ack.eviction_id,
            };
            match self.log.append(serde_json::to_vec(&message)?) {
                Ok(_) => {
                    sent += 1;
                    debug!(eviction_id = ack.eviction_id, origin = %ack.origin, "mgmt.log.ack.sent");
                }
                Err(err) => {
                    warn!(eviction_id = ack.eviction_id, error = %err, "mgmt.log.ack.send_failed");
                    failed.push(ack);
                }
            }
        }
        self.pending.lock().extend(failed);
        Ok(sent)
    }

    fn fire_triggers(&self) -> Result<Vec<StatusUpdate>> {
        let mut triggers = self.triggers.lock();
        if triggers.is_empty() {
            return Ok(std::mem::take(&mut *self.unapplied.lock()));
        }
        let open: BTreeSet<String> = self.instances.open_ids()?.into_iter().collect();
        let fired: Vec<u64> = triggers
            .iter()
            .filter(|(_, t)| {
                t.snapshot
                    .iter()
                    .all(|i| t.acked.contains(i) || !open.contains(i))
            })
            .map(|(id, _)| *id)
            .collect();
        let mut ready = std::mem::take(&mut *self.unapplied.lock());
        for id in fired {
            if let Some(trigger) = triggers.remove(&id) {
                info!(eviction_id = id, updates = trigger.updates.len(), "mgmt.log.trigger.fired");
                ready.extend(trigger.updates);
            }
        }
        Ok(ready)
    }
}
