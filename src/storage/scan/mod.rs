#![forbid(unsafe_code)]

//! Background scan jobs with progress counters and completion handles.

mod index_jobs;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashSet;
use tracing::{debug, info, warn};

use crate::types::{clone_error, PenumbraError, Result};

/// Index repair and removal jobs.
pub use index_jobs::{IndexRemoveJob, IndexRepairJob, IndexStores};

/// Live counters of a running job.
#[derive(Debug, Default)]
pub struct ScanMetrics {
    rows_scanned: AtomicU64,
    records_added: AtomicU64,
    records_deleted: AtomicU64,
    failures: AtomicU64,
}

impl ScanMetrics {
    /// Counts a processed row.
    pub fn row(&self) {
        self.rows_scanned.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts written records.
    pub fn added(&self, n: u64) {
        self.records_added.fetch_add(n, Ordering::Relaxed);
    }

    /// Counts deleted records.
    pub fn deleted(&self, n: u64) {
        self.records_deleted.fetch_add(n, Ordering::Relaxed);
    }

    /// Counts a row that could not be processed.
    pub fn failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Current values.
    pub fn snapshot(&self) -> ScanProgress {
        ScanProgress {
            rows_scanned: self.rows_scanned.load(Ordering::Relaxed),
            records_added: self.records_added.load(Ordering::Relaxed),
            records_deleted: self.records_deleted.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

/// Counter values at one point in time.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ScanProgress {
    pub rows_scanned: u64,
    pub records_added: u64,
    pub records_deleted: u64,
    pub failures: u64,
}

/// Work performed by a scan thread.
pub trait ScanJob: Send {
    /// Human-readable description for logs.
    fn describe(&self) -> String;

    /// Runs the scan to completion, updating `metrics` as it goes.
    fn run(&mut self, metrics: &ScanMetrics) -> Result<()>;
}

/// Runs after a successful scan, before the handle completes.
pub type Finisher = Box<dyn FnOnce(&ScanProgress) -> Result<()> + Send>;

#[derive(Debug)]
struct JobShared {
    metrics: Arc<ScanMetrics>,
    result: Mutex<Option<Result<ScanProgress>>>,
    cv: Condvar,
}

impl JobShared {
    fn finish(&self, outcome: Result<ScanProgress>) {
        let mut result = self.result.lock();
        if result.is_none() {
            *result = Some(outcome);
            self.cv.notify_all();
        }
    }
}

/// Handle to an asynchronous scan job.
#[derive(Clone, Debug)]
pub struct JobFuture {
    shared: Arc<JobShared>,
}

impl JobFuture {
    fn pending(metrics: Arc<ScanMetrics>) -> Self {
        Self {
            shared: Arc::new(JobShared {
                metrics,
                result: Mutex::new(None),
                cv: Condvar::new(),
            }),
        }
    }

    /// Handle of an action that needed no scan.
    pub fn completed() -> Self {
        let future = Self::pending(Arc::new(ScanMetrics::default()));
        future.shared.finish(Ok(ScanProgress::default()));
        future
    }

    /// Whether the job has finished, successfully or not.
    pub fn is_done(&self) -> bool {
        self.shared.result.lock().is_some()
    }

    /// Counters so far.
    pub fn progress(&self) -> ScanProgress {
        self.shared.metrics.snapshot()
    }

    /// Waits up to `timeout` for the outcome.
    ///
    /// Fails with [`PenumbraError::Timeout`] when the job is still running, and
    /// with [`PenumbraError::ScanFailed`] when it aborted.
    pub fn get(&self, timeout: Duration) -> Result<ScanProgress> {
        let start = Instant::now();
        let deadline = start + timeout;
        let mut guard = self.shared.result.lock();
        loop {
            if let Some(result) = guard.as_ref() {
                return match result {
                    Ok(progress) => Ok(*progress),
                    Err(err) => Err(clone_error(err)),
                };
            }
            if self.shared.cv.wait_until(&mut guard, deadline).timed_out() && guard.is_none() {
                return Err(PenumbraError::Timeout {
                    what: "scan job".into(),
                    waited_ms: start.elapsed().as_millis() as u64,
                });
            }
        }
    }

    /// Waits for the outcome without a deadline.
    pub fn wait(&self) -> Result<ScanProgress> {
        let mut guard = self.shared.result.lock();
        loop {
            if let Some(result) = guard.as_ref() {
                return match result {
                    Ok(progress) => Ok(*progress),
                    Err(err) => Err(clone_error(err)),
                };
            }
            self.shared.cv.wait(&mut guard);
        }
    }
}

/// Starts scan jobs on dedicated threads, one job per id at a time.
#[derive(Clone, Default)]
pub struct ScanExecutor {
    running: Arc<Mutex<FxHashSet<String>>>,
}

impl ScanExecutor {
    /// Creates an idle executor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a job with `job_id` is running.
    pub fn is_running(&self, job_id: &str) -> bool {
        self.running.lock().contains(job_id)
    }

    /// Starts `job`; `finisher` runs once it succeeds.
    ///
    /// A second job with the same id is refused while the first runs.
    pub fn submit(
        &self,
        job_id: impl Into<String>,
        mut job: Box<dyn ScanJob>,
        finisher: Finisher,
    ) -> Result<JobFuture> {
        let job_id = job_id.into();
        if !self.running.lock().insert(job_id.clone()) {
            return Err(PenumbraError::LifecyclePrecondition(format!(
                "scan job {job_id} is already running"
            )));
        }
        let metrics = Arc::new(ScanMetrics::default());
        let future = JobFuture::pending(Arc::clone(&metrics));
        let shared = Arc::clone(&future.shared);
        let running = Arc::clone(&self.running);
        info!(job = %job_id, description = %job.describe(), "scan.job.started");
        thread::spawn(move || {
            let outcome = match job.run(&metrics) {
                Ok(()) => {
                    let progress = metrics.snapshot();
                    finisher(&progress).map(|()| progress)
                }
                Err(err) => {
                    let progress = metrics.snapshot();
                    warn!(job = %job_id, rows = progress.rows_scanned, error = %err, "scan.job.failed");
                    Err(PenumbraError::ScanFailed {
                        rows_scanned: progress.rows_scanned,
                        reason: err.to_string(),
                    })
                }
            };
            if let Ok(progress) = &outcome {
                debug!(
                    job = %job_id,
                    rows = progress.rows_scanned,
                    added = progress.records_added,
                    deleted = progress.records_deleted,
                    "scan.job.finished"
                );
            }
            running.lock().remove(&job_id);
            shared.finish(outcome);
        });
        Ok(future)
    }
}
