#![forbid(unsafe_code)]

//! Graph instances and their transactions.
//!
//! A [`Graph`] is one open instance against a shared backend. Opening it
//! registers the instance, starts the management log poller and wires the id
//! assigner, schema cache and lockers. Several instances may share a backend;
//! they coordinate only through the backend itself.

mod query;
mod tx;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::admin::ManagementSystem;
use crate::config::{GraphConfig, SchemaMaker};
use crate::primitives::concurrency::mediator;
use crate::primitives::kcv::{KeyColumnValueStore, StoreManager};
use crate::storage::ids::{CustomIdPolicy, IdAssigner, IdManager};
use crate::storage::layout::{
    EDGESTORE, GRAPHINDEX, IDS, MIXEDINDEX, SCHEMA, SYSTEMLOG, SYSTEM_PROPERTIES,
};
use crate::storage::locking::{lock_store_name, ConsistentKeyLocker, LockerConfig};
use crate::storage::mgmt::{
    GlobalOptions, InstanceRegistry, KcvLog, LogId, LogMessage, ManagementLogger, PollOutcome,
    TransactionTracker,
};
use crate::storage::scan::{IndexStores, ScanExecutor};
use crate::storage::schema::SchemaRegistry;
use crate::types::{PenumbraError, Result};

/// Queries over the graph and over one vertex's edges.
pub use query::{EdgePlan, GraphQuery, QueryPlan, VertexEdgeQuery};
/// Transactions and the elements they return.
pub use tx::{CommitReport, Edge, GraphTx, Property, SecondaryFailure, TxLogEntry};

pub(crate) use tx::DefaultType;

pub(crate) struct Lockers {
    pub(crate) edgestore: Arc<ConsistentKeyLocker>,
    pub(crate) graphindex: Arc<ConsistentKeyLocker>,
    pub(crate) schema: Arc<ConsistentKeyLocker>,
}

pub(crate) struct GraphInner {
    pub(crate) cfg: GraphConfig,
    pub(crate) instance_id: String,
    pub(crate) ids: IdManager,
    pub(crate) options: GlobalOptions,
    pub(crate) assigner: IdAssigner,
    pub(crate) stores: IndexStores,
    pub(crate) system_log: Arc<dyn KeyColumnValueStore>,
    pub(crate) schema: Arc<SchemaRegistry>,
    pub(crate) instances: Arc<InstanceRegistry>,
    pub(crate) logger: ManagementLogger,
    pub(crate) tracker: Arc<TransactionTracker>,
    pub(crate) lockers: Lockers,
    pub(crate) scans: ScanExecutor,
    pub(crate) mgmt_lock: Mutex<()>,
    evicted: AtomicBool,
    closed: AtomicBool,
    poller: Mutex<Option<Poller>>,
}

struct Poller {
    stop: Arc<(Mutex<bool>, Condvar)>,
    handle: JoinHandle<()>,
}

/// One open instance.
#[derive(Clone)]
pub struct Graph {
    pub(crate) inner: Arc<GraphInner>,
}

impl Graph {
    /// Validates `cfg`, registers a new instance against `manager` and starts
    /// polling the management log.
    ///
    /// Global options already persisted in the backend take precedence over
    /// the ones in `cfg`.
    pub fn open(manager: Arc<dyn StoreManager>, cfg: GraphConfig) -> Result<Self> {
        cfg.validate()?;
        let instance_id = cfg
            .graph
            .unique_instance_id
            .clone()
            .unwrap_or_else(|| format!("{:016x}", rand::random::<u64>()));
        let instances = Arc::new(InstanceRegistry::new(manager.open_store(SYSTEM_PROPERTIES)?));
        let options = instances.load_or_init_options(&cfg)?;
        let ids = IdManager::new(cfg.partition_bits(), options.allow_custom_vertex_ids)?;
        let policy = CustomIdPolicy {
            allow_ids: options.allow_custom_vertex_ids,
            allow_types: options.allow_custom_vertex_id_types,
        };
        let assigner = IdAssigner::new(ids, manager.open_store(IDS)?, &instance_id, &cfg.ids, policy);
        let stores = IndexStores {
            edgestore: manager.open_store(EDGESTORE)?,
            graphindex: manager.open_store(GRAPHINDEX)?,
            mixedindex: manager.open_store(MIXEDINDEX)?,
        };
        let schema_store = manager.open_store(SCHEMA)?;
        let schema = Arc::new(SchemaRegistry::new(Arc::clone(&schema_store)));
        let system_log = manager.open_store(SYSTEMLOG)?;
        let group = cfg
            .locking
            .local_mediator_group
            .clone()
            .unwrap_or_else(|| instance_id.clone());
        let locker_cfg = LockerConfig {
            wait: cfg.lock_wait(),
            expire: cfg.lock_expire(),
            retries: cfg.locking.retries,
        };
        let mode = manager.features().locking;
        let locker = |store: &Arc<dyn KeyColumnValueStore>| -> Result<Arc<ConsistentKeyLocker>> {
            Ok(ConsistentKeyLocker::new(
                Arc::clone(store),
                manager.open_store(&lock_store_name(store.name()))?,
                mediator(&group, store.name()),
                mode,
                locker_cfg,
            ))
        };
        let lockers = Lockers {
            edgestore: locker(&stores.edgestore)?,
            graphindex: locker(&stores.graphindex)?,
            schema: locker(&schema_store)?,
        };
        let record = instances.register(&instance_id, cfg.graph.replace_instance_if_exists)?;
        let tracker = Arc::new(TransactionTracker::default());
        let logger = ManagementLogger::new(
            instance_id.clone(),
            KcvLog::new(Arc::clone(&system_log), LogId::Management, instance_id.clone()),
            Arc::clone(&instances),
            Arc::clone(&schema),
            Arc::clone(&tracker),
            cfg.read_lag(),
            Duration::from_millis(cfg.log.ack_max_wait_ms),
            record.registered_at,
        );
        let interval = cfg.read_interval();
        let inner = Arc::new(GraphInner {
            cfg,
            instance_id,
            ids,
            options,
            assigner,
            stores,
            system_log,
            schema,
            instances,
            logger,
            tracker,
            lockers,
            scans: ScanExecutor::new(),
            mgmt_lock: Mutex::new(()),
            evicted: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            poller: Mutex::new(None),
        });
        let poller = spawn_poller(Arc::downgrade(&inner), interval);
        *inner.poller.lock() = Some(poller);
        info!(
            instance = %inner.instance_id,
            partitions = inner.ids.partition_bound(),
            custom_ids = inner.options.allow_custom_vertex_ids,
            "graph.opened"
        );
        Ok(Self { inner })
    }

    /// Id of this instance.
    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }

    /// Configuration the graph was opened with.
    pub fn config(&self) -> &GraphConfig {
        &self.inner.cfg
    }

    /// Id layout in use.
    pub fn id_manager(&self) -> &IdManager {
        &self.inner.ids
    }

    /// Global options in effect for this instance.
    pub fn options(&self) -> GlobalOptions {
        self.inner.options
    }

    /// Whether undefined types are rejected instead of created.
    pub fn strict_schema(&self) -> bool {
        self.inner.cfg.schema.default == SchemaMaker::None
    }

    /// Number of open transactions.
    pub fn open_transactions(&self) -> usize {
        self.inner.tracker.open_count()
    }

    /// Starts a transaction.
    pub fn new_transaction(&self) -> Result<GraphTx> {
        self.ensure_usable()?;
        Ok(GraphTx::begin(self.clone(), None))
    }

    /// Starts a transaction whose changes are also appended to the user log `log`.
    pub fn new_transaction_with_log(&self, log: &str) -> Result<GraphTx> {
        self.ensure_usable()?;
        Ok(GraphTx::begin(self.clone(), Some(log.to_owned())))
    }

    /// Starts a management transaction over the schema and cluster settings.
    pub fn open_management(&self) -> Result<ManagementSystem> {
        ManagementSystem::open(self.clone())
    }

    /// Reads messages of `log` appended after `after`.
    pub fn read_log(&self, log: &LogId, after: u64) -> Result<Vec<LogMessage>> {
        KcvLog::new(Arc::clone(&self.inner.system_log), log.clone(), self.inner.instance_id.clone())
            .read(after, u64::MAX)
    }

    /// Runs one management log poll now and applies fired status updates.
    pub fn poll_management_log(&self) -> Result<PollOutcome> {
        self.ensure_usable()?;
        let outcome = match self.inner.logger.poll() {
            Ok(outcome) => outcome,
            Err(PenumbraError::InstanceEvicted(id)) => {
                self.mark_evicted();
                return Err(PenumbraError::InstanceEvicted(id));
            }
            Err(err) => return Err(err),
        };
        if !outcome.ready.is_empty() {
            if let Err(err) = crate::admin::apply_status_updates(self, &outcome.ready) {
                self.inner.logger.requeue(outcome.ready);
                return Err(err);
            }
        }
        Ok(outcome)
    }

    /// Whether a peer force-closed this instance.
    pub fn is_evicted(&self) -> bool {
        self.inner.evicted.load(Ordering::Acquire)
    }

    /// Whether the graph is still open.
    pub fn is_open(&self) -> bool {
        !self.inner.closed.load(Ordering::Acquire)
    }

    /// Stops polling, releases leased ids and deregisters the instance.
    pub fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(poller) = self.inner.poller.lock().take() {
            {
                let (stop, cv) = &*poller.stop;
                *stop.lock() = true;
                cv.notify_all();
            }
            if poller.handle.join().is_err() {
                warn!(instance = %self.inner.instance_id, "graph.poller.panicked");
            }
        }
        let open = self.inner.tracker.open_count();
        if open > 0 {
            warn!(instance = %self.inner.instance_id, open, "graph.close.open_transactions");
        }
        self.inner.assigner.close();
        if !self.is_evicted() {
            self.inner.instances.remove(&self.inner.instance_id)?;
        }
        info!(instance = %self.inner.instance_id, "graph.closed");
        Ok(())
    }

    pub(crate) fn ensure_usable(&self) -> Result<()> {
        if self.is_evicted() {
            return Err(PenumbraError::InstanceEvicted(self.inner.instance_id.clone()));
        }
        if !self.is_open() {
            return Err(PenumbraError::Closed("graph"));
        }
        Ok(())
    }

    pub(crate) fn mark_evicted(&self) {
        if !self.inner.evicted.swap(true, Ordering::AcqRel) {
            warn!(instance = %self.inner.instance_id, "graph.instance.evicted");
        }
    }
}

fn spawn_poller(inner: Weak<GraphInner>, interval: Duration) -> Poller {
    let stop = Arc::new((Mutex::new(false), Condvar::new()));
    let signal = Arc::clone(&stop);
    let handle = thread::spawn(move || loop {
        {
            let (stopped, cv) = &*signal;
            let mut stopped = stopped.lock();
            if !*stopped {
                cv.wait_for(&mut stopped, interval);
            }
            if *stopped {
                debug!("graph.poller.stopped");
                return;
            }
        }
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let graph = Graph { inner };
        match graph.poll_management_log() {
            Ok(_) => {}
            Err(PenumbraError::InstanceEvicted(_)) | Err(PenumbraError::Closed(_)) => return,
            Err(err) => warn!(instance = %graph.instance_id(), error = %err, "graph.poller.poll_failed"),
        }
    });
    Poller { stop, handle }
}
