//! Registry of open instances and cluster-wide options.
//!
//! Registrations and heartbeats live in separate rows so a heartbeat racing a
//! force-close can never resurrect the removed registration.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::{validate_custom_id_policy, GraphConfig};
use crate::primitives::bytes::ord::get_u64_be;
use crate::primitives::kcv::{Entry, KeyColumnValueStore, SliceQuery};
use crate::storage::clock;
use crate::types::{PenumbraError, Result};

const REGISTRATIONS: &[u8] = b"instances";
const HEARTBEATS: &[u8] = b"heartbeats";
const OPTIONS: &[u8] = b"options";

/// Option name of the custom vertex id flag.
pub const ALLOW_CUSTOM_VERTEX_IDS: &str = "graph.allow-custom-vertex-ids";
/// Option name of the custom vertex id type flag.
pub const ALLOW_CUSTOM_VERTEX_ID_TYPES: &str = "graph.allow-custom-vertex-id-types";

/// An instance holding, or recently holding, an open graph.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    /// Instance id.
    pub instance_id: String,
    /// Registration timestamp.
    pub registered_at: u64,
    /// Last heartbeat timestamp.
    pub last_heartbeat: u64,
    /// Management log offset reached at the last heartbeat.
    pub log_position: u64,
}

/// Cluster-wide options persisted in the backend.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalOptions {
    /// Vertices must carry caller-supplied ids.
    pub allow_custom_vertex_ids: bool,
    /// String ids are accepted too.
    pub allow_custom_vertex_id_types: bool,
}

/// Instance registry in the system properties store.
pub struct InstanceRegistry {
    store: Arc<dyn KeyColumnValueStore>,
}

impl InstanceRegistry {
    /// Opens the registry over `store`.
    pub fn new(store: Arc<dyn KeyColumnValueStore>) -> Self {
        Self { store }
    }

    /// Registers `instance_id`.
    ///
    /// An id that is still registered is rejected unless `replace` is set.
    pub fn register(&self, instance_id: &str, replace: bool) -> Result<InstanceRecord> {
        if self.get(instance_id)?.is_some() && !replace {
            return Err(PenumbraError::Config(format!(
                "instance id {instance_id} is already registered; close it, force-close it or set graph.replace-instance-if-exists"
            )));
        }
        let now = clock::now_nanos();
        let record = InstanceRecord {
            instance_id: instance_id.to_owned(),
            registered_at: now,
            last_heartbeat: now,
            log_position: now,
        };
        self.store.mutate(
            REGISTRATIONS,
            vec![Entry::new(instance_id.as_bytes(), serde_json::to_vec(&record)?)],
            &[],
        )?;
        self.write_heartbeat(instance_id, now, now)?;
        info!(instance = instance_id, replace, "mgmt.instance.registered");
        Ok(record)
    }

    /// Records that `instance_id` is alive and has read the log up to `position`.
    ///
    /// Fails with [`PenumbraError::InstanceEvicted`] once the registration is gone.
    pub fn heartbeat(&self, instance_id: &str, position: u64) -> Result<()> {
        if self.store.get(REGISTRATIONS, instance_id.as_bytes())?.is_none() {
            return Err(PenumbraError::InstanceEvicted(instance_id.to_owned()));
        }
        self.write_heartbeat(instance_id, clock::now_nanos(), position)
    }

    /// Removes the registration of `instance_id`; returns whether it existed.
    pub fn remove(&self, instance_id: &str) -> Result<bool> {
        let existed = self.get(instance_id)?.is_some();
        let column = vec![instance_id.as_bytes().to_vec()];
        self.store.mutate(REGISTRATIONS, Vec::new(), &column)?;
        self.store.mutate(HEARTBEATS, Vec::new(), &column)?;
        debug!(instance = instance_id, existed, "mgmt.instance.removed");
        Ok(existed)
    }

    /// Registration of `instance_id` with its latest heartbeat.
    pub fn get(&self, instance_id: &str) -> Result<Option<InstanceRecord>> {
        let Some(raw) = self.store.get(REGISTRATIONS, instance_id.as_bytes())? else {
            return Ok(None);
        };
        let mut record: InstanceRecord = serde_json::from_slice(&raw)?;
        self.merge_heartbeat(&mut record)?;
        Ok(Some(record))
    }

    /// Every registered instance, ordered by id.
    pub fn list(&self) -> Result<Vec<InstanceRecord>> {
        let mut out = Vec::new();
        for entry in self.store.get_slice(REGISTRATIONS, &SliceQuery::all())? {
            let mut record: InstanceRecord = serde_json::from_slice(&entry.value)?;
            self.merge_heartbeat(&mut record)?;
            out.push(record);
        }
        Ok(out)
    }

    /// Ids of every registered instance.
    pub fn open_ids(&self) -> Result<Vec<String>> {
        Ok(self.list()?.into_iter().map(|r| r.instance_id).collect())
    }

    /// Reads the persisted options, seeding them from `cfg` on first use.
    pub fn load_or_init_options(&self, cfg: &GraphConfig) -> Result<GlobalOptions> {
        let stored_ids = self.read_flag(ALLOW_CUSTOM_VERTEX_IDS)?;
        let stored_types = self.read_flag(ALLOW_CUSTOM_VERTEX_ID_TYPES)?;
        if let (Some(allow_ids), Some(allow_types)) = (stored_ids, stored_types) {
            return Ok(GlobalOptions {
                allow_custom_vertex_ids: allow_ids,
                allow_custom_vertex_id_types: allow_types,
            });
        }
        let options = GlobalOptions {
            allow_custom_vertex_ids: cfg.graph.allow_custom_vertex_ids,
            allow_custom_vertex_id_types: cfg.graph.allow_custom_vertex_id_types,
        };
        self.write_options(&options)?;
        debug!(?options, "mgmt.options.initialized");
        Ok(options)
    }

    /// Current persisted options; defaults when never initialized.
    pub fn options(&self) -> Result<GlobalOptions> {
        Ok(GlobalOptions {
            allow_custom_vertex_ids: self.read_flag(ALLOW_CUSTOM_VERTEX_IDS)?.unwrap_or(false),
            allow_custom_vertex_id_types: self
                .read_flag(ALLOW_CUSTOM_VERTEX_ID_TYPES)?
                .unwrap_or(false),
        })
    }

    /// Validates and persists `options`.
    pub fn write_options(&self, options: &GlobalOptions) -> Result<()> {
        validate_custom_id_policy(
            options.allow_custom_vertex_ids,
            options.allow_custom_vertex_id_types,
        )?;
        self.store.mutate(
            OPTIONS,
            vec![
                Entry::new(
                    ALLOW_CUSTOM_VERTEX_IDS.as_bytes(),
                    serde_json::to_vec(&options.allow_custom_vertex_ids)?,
                ),
                Entry::new(
                    ALLOW_CUSTOM_VERTEX_ID_TYPES.as_bytes(),
                    serde_json::to_vec(&options.allow_custom_vertex_id_types)?,
                ),
            ],
            &[],
        )
    }

    fn read_flag(&self, name: &str) -> Result<Option<bool>> {
        match self.store.get(OPTIONS, name.as_bytes())? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    fn write_heartbeat(&self, instance_id: &str, at: u64, position: u64) -> Result<()> {
        let mut value = Vec::with_capacity(16);
        value.extend_from_slice(&at.to_be_bytes());
        value.extend_from_slice(&position.to_be_bytes());
        self.store
            .mutate(HEARTBEATS, vec![Entry::new(instance_id.as_bytes(), value)], &[])
    }

    fn merge_heartbeat(&self, record: &mut InstanceRecord) -> Result<()> {
        if let Some(raw) = self.store.get(HEARTBEATS, record.instance_id.as_bytes())? {
            record.last_heartbeat = get_u64_be(&raw)?;
            record.log_position = get_u64_be(raw.get(8..).unwrap_or_default())?;
        }
        Ok(())
    }
}
