//! Schema transactions.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use rustc_hash::FxHashMap;
use tracing::{debug, info};

use crate::config::validate_custom_id_policy;
use crate::graph::Graph;
use crate::primitives::concurrency::KeyColumn;
use crate::storage::clock;
use crate::storage::ids::IdCategory;
use crate::storage::locking::LockState;
use crate::storage::mgmt::{
    GlobalOptions, StatusUpdate, ALLOW_CUSTOM_VERTEX_IDS, ALLOW_CUSTOM_VERTEX_ID_TYPES,
};
use crate::storage::schema::{
    Cardinality, ConsistencyModifier, EdgeLabelDef, IndexDef, Multiplicity, PropertyKeyDef,
    SchemaElement, SchemaRegistry, SchemaWrite, VertexLabelDef,
};
use crate::types::{PenumbraError, Result, SchemaId};

pub(super) struct Staged {
    pub(super) element: SchemaElement,
    pub(super) previous_name: Option<String>,
    pub(super) is_new: bool,
}

/// Outcome of a management commit.
#[derive(Clone, Debug, Default)]
pub struct MgmtCommitReport {
    /// Schema elements written.
    pub changed: Vec<SchemaId>,
    /// Id of the eviction broadcast for the change.
    pub eviction_id: Option<u64>,
    /// Set when the change is durable but the eviction could not be sent;
    /// peers then keep stale definitions until their caches are expired.
    pub secondary_failure: Option<String>,
}

/// Transaction over the schema and cluster settings.
///
/// Reads go to the backend rather than the instance cache, so a management
/// transaction always sees the latest durable schema.
pub struct ManagementSystem {
    pub(super) graph: Graph,
    pub(super) start_ts: u64,
    originals: FxHashMap<SchemaId, Option<Vec<u8>>>,
    pub(super) staged: BTreeMap<SchemaId, Staged>,
    pub(super) triggers: Vec<StatusUpdate>,
    options: Option<GlobalOptions>,
    closing: BTreeSet<String>,
    open: bool,
}

impl ManagementSystem {
    pub(crate) fn open(graph: Graph) -> Result<Self> {
        graph.ensure_usable()?;
        Ok(Self {
            graph,
            start_ts: clock::now_nanos(),
            originals: FxHashMap::default(),
            staged: BTreeMap::new(),
            triggers: Vec::new(),
            options: None,
            closing: BTreeSet::new(),
            open: true,
        })
    }

    /// Graph this transaction manages.
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Whether a type or index called `name` exists.
    pub fn contains_type(&mut self, name: &str) -> Result<bool> {
        Ok(self.lookup(name)?.is_some())
    }

    /// Property key called `name`.
    pub fn get_property_key(&mut self, name: &str) -> Result<Option<PropertyKeyDef>> {
        Ok(self.lookup(name)?.and_then(|e| e.as_property_key().cloned()))
    }

    /// Edge label called `name`.
    pub fn get_edge_label(&mut self, name: &str) -> Result<Option<EdgeLabelDef>> {
        Ok(self.lookup(name)?.and_then(|e| e.as_edge_label().cloned()))
    }

    /// Vertex label called `name`.
    pub fn get_vertex_label(&mut self, name: &str) -> Result<Option<VertexLabelDef>> {
        Ok(self.lookup(name)?.and_then(|e| e.as_vertex_label().cloned()))
    }

    /// Index called `name`.
    pub fn get_index(&mut self, name: &str) -> Result<Option<IndexDef>> {
        Ok(self.lookup(name)?.and_then(|e| e.as_index().cloned()))
    }

    /// Sets the consistency modifier of a relation type or composite index.
    ///
    /// FORK applies to MULTI edge labels and LIST property keys only, and not
    /// to keys covered by a unique index with the LOCK modifier.
    pub fn set_consistency(&mut self, name: &str, modifier: ConsistencyModifier) -> Result<()> {
        self.ensure_open()?;
        let mut element = self.require(name)?;
        match &mut element {
            SchemaElement::PropertyKey(d) => {
                if modifier == ConsistencyModifier::Fork {
                    if d.cardinality != Cardinality::List {
                        return Err(violation(format!(
                            "FORK on property key {name} requires LIST cardinality"
                        )));
                    }
                    if let Some(index) = self.unique_locked_index_on(d.id)? {
                        return Err(violation(format!(
                            "property key {name} is covered by unique LOCK index {index} and cannot FORK"
                        )));
                    }
                }
                d.consistency = modifier;
            }
            SchemaElement::EdgeLabel(d) => {
                if modifier == ConsistencyModifier::Fork && d.multiplicity != Multiplicity::Multi {
                    return Err(violation(format!(
                        "FORK on edge label {name} requires MULTI multiplicity"
                    )));
                }
                d.consistency = modifier;
            }
            SchemaElement::Index(IndexDef::Composite(d)) => {
                if modifier == ConsistencyModifier::Fork {
                    return Err(violation(format!("index {name} supports DEFAULT or LOCK only")));
                }
                if modifier == ConsistencyModifier::Lock && d.unique {
                    for field in d.fields.clone() {
                        if self.lookup_id(field.key)?.consistency() == ConsistencyModifier::Fork {
                            return Err(violation(format!(
                                "unique LOCK index {name} cannot cover a FORK property key"
                            )));
                        }
                    }
                }
                d.consistency = modifier;
            }
            other => {
                return Err(violation(format!(
                    "consistency cannot be set on {} {name}",
                    other.kind_name()
                )))
            }
        }
        self.stage(element)
    }

    /// Sets the time-to-live of data written under a type.
    ///
    /// Vertex labels accept a TTL only when static. Zero clears it.
    pub fn set_ttl(&mut self, name: &str, ttl: Duration) -> Result<()> {
        self.ensure_open()?;
        let secs = ttl_secs(name, ttl)?;
        let mut element = self.require(name)?;
        match &mut element {
            SchemaElement::PropertyKey(d) => d.ttl_secs = secs,
            SchemaElement::EdgeLabel(d) => d.ttl_secs = secs,
            SchemaElement::VertexLabel(d) => {
                if secs > 0 && !d.is_static {
                    return Err(violation(format!(
                        "TTL on vertex label {name} requires a static label"
                    )));
                }
                d.ttl_secs = secs;
            }
            SchemaElement::Index(_) => {
                return Err(violation(format!("index {name} cannot have a TTL")));
            }
        }
        self.stage(element)
    }

    /// Renames a type or index; the id is kept.
    pub fn change_name(&mut self, old: &str, new: &str) -> Result<()> {
        self.ensure_open()?;
        let mut element = self.require(old)?;
        self.ensure_name_free(new)?;
        element.set_name(new.to_owned());
        self.stage(element)
    }

    /// Stages a global option; it is validated and written at commit and takes
    /// effect for instances opened afterwards.
    pub fn set_option(&mut self, option: &str, value: bool) -> Result<()> {
        self.ensure_open()?;
        let mut options = match self.options {
            Some(options) => options,
            None => self.graph.inner.instances.options()?,
        };
        match option {
            ALLOW_CUSTOM_VERTEX_IDS => options.allow_custom_vertex_ids = value,
            ALLOW_CUSTOM_VERTEX_ID_TYPES => options.allow_custom_vertex_id_types = value,
            other => return Err(PenumbraError::Config(format!("unknown global option {other}"))),
        }
        self.options = Some(options);
        Ok(())
    }

    /// Current value of a global option, including staged changes.
    pub fn get_option(&mut self, option: &str) -> Result<bool> {
        let options = match self.options {
            Some(options) => options,
            None => self.graph.inner.instances.options()?,
        };
        match option {
            ALLOW_CUSTOM_VERTEX_IDS => Ok(options.allow_custom_vertex_ids),
            ALLOW_CUSTOM_VERTEX_ID_TYPES => Ok(options.allow_custom_vertex_id_types),
            other => Err(PenumbraError::Config(format!("unknown global option {other}"))),
        }
    }

    /// Registered instances minus those force-closed in this transaction;
    /// this instance is suffixed with `(current)`.
    pub fn get_open_instances(&self) -> Result<Vec<String>> {
        let me = &self.graph.inner.instance_id;
        Ok(self
            .graph
            .inner
            .instances
            .open_ids()?
            .into_iter()
            .filter(|id| !self.closing.contains(id))
            .map(|id| if &id == me { format!("{id}(current)") } else { id })
            .collect())
    }

    /// Removes the registration of a crashed or stuck instance.
    ///
    /// The removal is applied at commit and dropped by rollback. The instance
    /// learns about it on its next heartbeat and refuses further work.
    pub fn force_close_instance(&mut self, instance_id: &str) -> Result<()> {
        self.ensure_open()?;
        if instance_id == self.graph.inner.instance_id {
            return Err(PenumbraError::LifecyclePrecondition(
                "cannot force-close the current instance; close the graph instead".into(),
            ));
        }
        if self.closing.contains(instance_id) {
            return Ok(());
        }
        if !self.check_closable(instance_id)? {
            return Err(PenumbraError::NotFound(format!("instance {instance_id}")));
        }
        debug!(instance = instance_id, "mgmt.instance.close_staged");
        self.closing.insert(instance_id.to_owned());
        Ok(())
    }

    /// Whether `instance_id` is still registered; fails when it registered
    /// again after this transaction started.
    fn check_closable(&self, instance_id: &str) -> Result<bool> {
        let Some(record) = self.graph.inner.instances.get(instance_id)? else {
            return Ok(false);
        };
        if record.registered_at > self.start_ts {
            return Err(PenumbraError::LifecyclePrecondition(format!(
                "instance {instance_id} registered after this management transaction started"
            )));
        }
        Ok(true)
    }

    /// Writes every staged change under schema locks and broadcasts an
    /// eviction of the changed elements.
    ///
    /// Failing to broadcast does not undo the change; it is reported in
    /// [`MgmtCommitReport::secondary_failure`].
    pub fn commit(mut self) -> Result<MgmtCommitReport> {
        self.ensure_open()?;
        self.open = false;
        self.graph.ensure_usable()?;
        let inner = Arc::clone(&self.graph.inner);
        if let Some(options) = &self.options {
            validate_custom_id_policy(
                options.allow_custom_vertex_ids,
                options.allow_custom_vertex_id_types,
            )?;
        }
        let _serial = inner.mgmt_lock.lock();
        for instance_id in &self.closing {
            self.check_closable(instance_id)?;
        }
        let ids: BTreeSet<SchemaId> = self.staged.keys().copied().collect();
        let _guards = inner.schema.lock_elements(&ids);
        let mut locks = LockState::new(format!("{}:mgmt:{}", inner.instance_id, self.start_ts));
        for (id, staged) in &self.staged {
            let expected = self.originals.get(id).cloned().flatten();
            inner.lockers.schema.write_lock(
                &mut locks,
                KeyColumn::new(SchemaRegistry::element_key(*id), SchemaRegistry::definition_column()),
                expected,
            )?;
            let name = staged.element.name();
            if staged.previous_name.as_deref() != Some(name) {
                inner.lockers.schema.write_lock(
                    &mut locks,
                    KeyColumn::new(SchemaRegistry::name_key(name), SchemaRegistry::name_column()),
                    None,
                )?;
            }
        }
        locks.check_all()?;
        let writes: Vec<SchemaWrite> = self
            .staged
            .values()
            .map(|s| SchemaWrite {
                element: s.element.clone(),
                previous_name: s.previous_name.clone(),
            })
            .collect();
        inner.schema.write(&writes)?;
        if let Some(options) = &self.options {
            inner.instances.write_options(options)?;
        }
        locks.release_all();
        for instance_id in &self.closing {
            if inner.instances.remove(instance_id)? {
                info!(instance = %instance_id, by = %inner.instance_id, "mgmt.instance.force_closed");
            }
        }
        let mut evicted = ids.clone();
        evicted.extend(self.triggers.iter().map(|t| t.index));
        let mut report = MgmtCommitReport {
            changed: ids.into_iter().collect(),
            ..MgmtCommitReport::default()
        };
        if !evicted.is_empty() {
            let updates = std::mem::take(&mut self.triggers);
            match inner.logger.send_eviction(evicted.into_iter().collect(), updates) {
                Ok(eviction_id) => report.eviction_id = Some(eviction_id),
                Err(err) => report.secondary_failure = Some(err.to_string()),
            }
        }
        info!(
            instance = %inner.instance_id,
            changed = report.changed.len(),
            evicted = report.eviction_id.is_some(),
            "mgmt.committed"
        );
        Ok(report)
    }

    /// Discards staged changes.
    pub fn rollback(mut self) -> Result<()> {
        self.ensure_open()?;
        self.open = false;
        debug!(
            staged = self.staged.len(),
            closing = self.closing.len(),
            "mgmt.rolled_back"
        );
        Ok(())
    }

    pub(super) fn ensure_open(&self) -> Result<()> {
        if !self.open {
            return Err(PenumbraError::Closed("management transaction"));
        }
        Ok(())
    }

    /// Element called `name` as this transaction sees it.
    pub(super) fn lookup(&mut self, name: &str) -> Result<Option<SchemaElement>> {
        if let Some(staged) = self.staged.values().find(|s| s.element.name() == name) {
            return Ok(Some(staged.element.clone()));
        }
        let Some((element, raw)) = self.graph.inner.schema.load_by_name(name)? else {
            return Ok(None);
        };
        if self.staged.contains_key(&element.id()) {
            return Ok(None);
        }
        self.originals.entry(element.id()).or_insert(Some(raw));
        Ok(Some(element))
    }

    pub(super) fn lookup_id(&mut self, id: SchemaId) -> Result<SchemaElement> {
        if let Some(staged) = self.staged.get(&id) {
            return Ok(staged.element.clone());
        }
        let raw = self
            .graph
            .inner
            .schema
            .read_raw(id)?
            .ok_or_else(|| PenumbraError::NotFound(format!("schema element {id}")))?;
        let element: SchemaElement = serde_json::from_slice(&raw)?;
        self.originals.entry(id).or_insert(Some(raw));
        Ok(element)
    }

    pub(super) fn require(&mut self, name: &str) -> Result<SchemaElement> {
        self.lookup(name)?
            .ok_or_else(|| PenumbraError::NotFound(format!("schema element {name}")))
    }

    pub(super) fn is_new(&self, id: SchemaId) -> bool {
        self.staged.get(&id).map_or(false, |s| s.is_new)
    }

    pub(super) fn ensure_name_free(&mut self, name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(violation("schema names must not be empty".into()));
        }
        if self.lookup(name)?.is_some() {
            return Err(violation(format!("name {name} is already in use")));
        }
        Ok(())
    }

    pub(super) fn allocate(&self, category: IdCategory) -> Result<SchemaId> {
        let id = self
            .graph
            .inner
            .assigner
            .allocate(category, &Default::default())?;
        Ok(SchemaId(id.0))
    }

    pub(super) fn create(&mut self, element: SchemaElement) {
        let id = element.id();
        self.originals.insert(id, None);
        debug!(id = id.0, name = element.name(), kind = element.kind_name(), "mgmt.schema.created");
        self.staged.insert(
            id,
            Staged {
                element,
                previous_name: None,
                is_new: true,
            },
        );
    }

    pub(super) fn stage(&mut self, element: SchemaElement) -> Result<()> {
        let id = element.id();
        if let Some(staged) = self.staged.get_mut(&id) {
            staged.element = element;
            return Ok(());
        }
        let previous_name = match self.originals.get(&id) {
            Some(Some(raw)) => Some(serde_json::from_slice::<SchemaElement>(raw)?.name().to_owned()),
            _ => None,
        };
        self.staged.insert(
            id,
            Staged {
                element,
                previous_name,
                is_new: false,
            },
        );
        Ok(())
    }

    /// Name of a unique composite index with the LOCK modifier covering `key`.
    pub(super) fn unique_locked_index_on(&mut self, key: SchemaId) -> Result<Option<String>> {
        let mut candidates: Vec<IndexDef> = self
            .graph
            .inner
            .schema
            .indexes_on(key)?
            .iter()
            .filter_map(|e| e.as_index().cloned())
            .filter(|d| !self.staged.contains_key(&d.id()))
            .collect();
        candidates.extend(
            self.staged
                .values()
                .filter_map(|s| s.element.as_index().cloned())
                .filter(|d| d.field_keys().contains(&key)),
        );
        Ok(candidates.into_iter().find_map(|d| match d {
            IndexDef::Composite(c) if c.unique && c.consistency == ConsistencyModifier::Lock => {
                Some(c.name)
            }
            _ => None,
        }))
    }
}

pub(super) fn violation(message: String) -> PenumbraError {
    PenumbraError::SchemaViolation(message)
}

pub(super) fn ttl_secs(name: &str, ttl: Duration) -> Result<u64> {
    if !ttl.is_zero() && ttl.as_secs() == 0 {
        return Err(violation(format!("TTL of {name} must be at least one second")));
    }
    Ok(ttl.as_secs())
}
