//! Index lifecycle actions and automatic schema creation.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::management::ManagementSystem;
use crate::graph::{DefaultType, Graph};
use crate::storage::mgmt::StatusUpdate;
use crate::storage::scan::{Finisher, IndexRemoveJob, IndexRepairJob, JobFuture, ScanJob};
use crate::storage::schema::{
    expect_index, is_legal_transition, plan, ActionPlan, SchemaAction, SchemaElement, SchemaStatus,
};
use crate::types::{PenumbraError, Result, SchemaId};

/// Statuses of the fields of one index.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexStatusReport {
    /// Index name.
    pub index: String,
    /// Field name and status; the edge label for vertex-centric indexes.
    pub fields: Vec<(String, SchemaStatus)>,
}

impl IndexStatusReport {
    /// Whether every field is in `status`.
    pub fn all(&self, status: SchemaStatus) -> bool {
        self.fields.iter().all(|(_, s)| *s == status)
    }
}

impl ManagementSystem {
    /// Applies `action` to index `name`.
    ///
    /// Status changes that need no coordination are staged and take effect at
    /// commit. Registration is broadcast at commit and completes once every
    /// open instance acknowledged it. Reindex and removal start their scan job
    /// right away; the returned future completes when the job and its status
    /// change are done.
    pub fn update_index(&mut self, name: &str, action: SchemaAction) -> Result<JobFuture> {
        self.ensure_open()?;
        let element = self.require(name)?;
        let mut def = expect_index(&element, name)?.clone();
        let mut staged = false;
        let mut acked = Vec::new();
        let mut scanned = Vec::new();
        let mut scan_to = None;
        for (field, status) in def.statuses() {
            match plan(action, status, name)? {
                ActionPlan::NoOp => {}
                ActionPlan::Immediate(to) => {
                    def.set_status(Some(field), to);
                    staged = true;
                }
                ActionPlan::AfterAcks(_) => acked.push(field),
                ActionPlan::AfterScan(to) => {
                    scanned.push(field);
                    scan_to = Some(to);
                }
            }
        }
        info!(index = name, %action, "mgmt.index.update");
        if staged {
            self.stage(SchemaElement::Index(def.clone()))?;
        }
        if !acked.is_empty() {
            self.triggers.push(StatusUpdate {
                index: def.id(),
                fields: acked,
                from: SchemaStatus::Installed,
                to: SchemaStatus::Registered,
            });
        }
        let Some(to) = scan_to else {
            return Ok(JobFuture::completed());
        };
        let stores = self.graph.inner.stores.clone();
        let job: Box<dyn ScanJob> = match action {
            SchemaAction::RemoveIndex => Box::new(IndexRemoveJob::new(def.clone(), stores)),
            _ => Box::new(IndexRepairJob::new(def.clone(), stores)),
        };
        let graph = self.graph.clone();
        let index = def.id();
        let finisher: Finisher = Box::new(move |progress| {
            debug!(
                index = index.0,
                rows = progress.rows_scanned,
                added = progress.records_added,
                deleted = progress.records_deleted,
                "mgmt.index.scan_done"
            );
            transition(&graph, index, &scanned, to, |current| {
                is_legal_transition(current, to)
            })
            .map(|_| ())
        });
        self.graph
            .inner
            .scans
            .submit(format!("index:{name}"), job, finisher)
    }

    /// Statuses of index `name` as last committed.
    pub fn get_index_status(&mut self, name: &str) -> Result<IndexStatusReport> {
        let element = self.require(name)?;
        let def = expect_index(&element, name)?.clone();
        let mut fields = Vec::new();
        for (field, status) in def.statuses() {
            fields.push((self.lookup_id(field)?.name().to_owned(), status));
        }
        Ok(IndexStatusReport {
            index: def.name().to_owned(),
            fields,
        })
    }

    /// Polls until every field of index `name` is in `status`.
    pub fn await_index_status(
        graph: &Graph,
        name: &str,
        status: SchemaStatus,
        timeout: Duration,
    ) -> Result<IndexStatusReport> {
        let start = Instant::now();
        let pause = graph.config().read_interval().min(Duration::from_millis(50));
        loop {
            let mut mgmt = graph.open_management()?;
            let report = mgmt.get_index_status(name)?;
            mgmt.rollback()?;
            if report.all(status) {
                return Ok(report);
            }
            if start.elapsed() >= timeout {
                return Err(PenumbraError::Timeout {
                    what: format!("index {name} to reach {status}"),
                    waited_ms: start.elapsed().as_millis() as u64,
                });
            }
            thread::sleep(pause);
        }
    }
}

/// Applies status updates whose eviction every instance acknowledged.
///
/// A field moves only while it still has the expected `from` status, so an
/// update that raced with another lifecycle action is dropped.
pub fn apply_status_updates(graph: &Graph, updates: &[StatusUpdate]) -> Result<()> {
    for update in updates {
        let changed = transition(graph, update.index, &update.fields, update.to, |current| {
            current == update.from
        })?;
        if changed {
            info!(index = update.index.0, from = %update.from, to = %update.to, "mgmt.index.status_applied");
        } else {
            debug!(index = update.index.0, to = %update.to, "mgmt.index.status_skipped");
        }
    }
    Ok(())
}

/// Moves `fields` of `index` (all when empty) to `to` where `guard` accepts
/// the current status, in a management transaction of its own.
fn transition(
    graph: &Graph,
    index: SchemaId,
    fields: &[SchemaId],
    to: SchemaStatus,
    guard: impl Fn(SchemaStatus) -> bool,
) -> Result<bool> {
    let mut mgmt = graph.open_management()?;
    let element = mgmt.lookup_id(index)?;
    let Some(mut def) = element.as_index().cloned() else {
        return Err(PenumbraError::SchemaViolation(format!(
            "{} {} is not an index",
            element.kind_name(),
            element.name()
        )));
    };
    let mut changed = false;
    for (field, status) in def.statuses() {
        if (fields.is_empty() || fields.contains(&field)) && status != to && guard(status) {
            def.set_status(Some(field), to);
            changed = true;
        }
    }
    if !changed {
        mgmt.rollback()?;
        return Ok(false);
    }
    mgmt.stage(SchemaElement::Index(def))?;
    let report = mgmt.commit()?;
    if let Some(failure) = report.secondary_failure {
        warn!(index = index.0, %to, error = %failure, "mgmt.index.eviction_failed");
    }
    Ok(true)
}

/// Creates `name` with default settings on first use.
///
/// When a concurrent creation wins the race, its definition is returned.
pub(crate) fn make_default_type(
    graph: &Graph,
    name: &str,
    kind: DefaultType,
) -> Result<Arc<SchemaElement>> {
    let created = (|| {
        let mut mgmt = graph.open_management()?;
        match kind {
            DefaultType::PropertyKey(data_type) => {
                mgmt.make_property_key(name).data_type(data_type).make()?;
            }
            DefaultType::EdgeLabel => {
                mgmt.make_edge_label(name).make()?;
            }
            DefaultType::VertexLabel => {
                mgmt.make_vertex_label(name).make()?;
            }
        }
        mgmt.commit()
    })();
    if let Err(err) = created {
        if graph.inner.schema.get_by_name(name)?.is_none() {
            return Err(err);
        }
        debug!(name, error = %err, "schema.default.create_raced");
    } else {
        debug!(name, kind = kind.kind_name(), "schema.default.created");
    }
    graph.inner.schema.get_by_name(name)?.ok_or_else(|| {
        PenumbraError::NotFound(format!("{} {name}", kind.kind_name()))
    })
}
