//! Graph configuration.
//!
//! Every field has a default so partial TOML files are accepted. Global options
//! (`graph.allow-custom-vertex-ids`, `graph.allow-custom-vertex-id-types`) are
//! only read from here on the first open of a backend; afterwards the values
//! persisted in the backend win and are changed through the management surface.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{PenumbraError, Result};

/// Upper bound on `cluster.max-partitions`.
pub const MAX_PARTITIONS_LIMIT: u32 = 1 << 16;

/// Top-level configuration of a graph handle.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct GraphConfig {
    /// Cluster-wide partitioning.
    pub cluster: ClusterConfig,
    /// Id allocation.
    pub ids: IdsConfig,
    /// Instance identity and custom id policy.
    pub graph: InstanceConfig,
    /// Lock mediation and distributed lock claims.
    pub locking: LockingConfig,
    /// Management log polling.
    pub log: LogConfig,
    /// Schema maker behavior.
    pub schema: SchemaConfig,
}

/// Partitioning of the id space.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ClusterConfig {
    /// Number of partitions; a power of two.
    pub max_partitions: u32,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self { max_partitions: 32 }
    }
}

/// Partition placement policy for new vertices.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PlacementKind {
    /// Round-robin over all partitions (single partition when unpartitioned).
    #[default]
    Default,
    /// Random choice among a rotating set of hot partitions.
    Bulk,
    /// Hash of a designated property value.
    Property,
}

/// Id block leasing and placement.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct IdsConfig {
    /// Ids leased per block.
    pub block_size: u64,
    /// Remaining fraction of a block at which the next block is prefetched.
    pub renew_percentage: f64,
    /// Time a block claim waits before it is read back.
    pub authority_wait_ms: u64,
    /// Claim attempts before giving up on a block.
    pub authority_retries: u32,
    /// Placement policy.
    pub placement: PlacementKind,
    /// Hot partitions kept by bulk placement.
    pub concurrent_partitions: usize,
    /// Allocations before bulk placement rotates one hot partition; zero disables rotation.
    pub bulk_rotate_after: u64,
    /// Property routed on by property placement.
    pub placement_property_key: Option<String>,
}

impl Default for IdsConfig {
    fn default() -> Self {
        Self {
            block_size: 10_000,
            renew_percentage: 0.3,
            authority_wait_ms: 2,
            authority_retries: 20,
            placement: PlacementKind::Default,
            concurrent_partitions: 4,
            bulk_rotate_after: 0,
            placement_property_key: None,
        }
    }
}

/// Instance identity and custom vertex id policy.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct InstanceConfig {
    /// Explicit instance id; generated when absent.
    pub unique_instance_id: Option<String>,
    /// Vertices must be created with caller-supplied ids.
    pub allow_custom_vertex_ids: bool,
    /// Caller-supplied ids may be strings as well as numbers.
    pub allow_custom_vertex_id_types: bool,
    /// Take over a registration left behind under the same instance id.
    pub replace_instance_if_exists: bool,
}

/// Lock mediation and claim timing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct LockingConfig {
    /// Mediator group; handles sharing a group arbitrate locks in-process.
    /// Defaults to the instance id.
    pub local_mediator_group: Option<String>,
    /// Delay between writing a lock claim and checking it.
    pub wait_ms: u64,
    /// Age after which claims and local locks are ignored.
    pub expire_ms: u64,
    /// Attempts at writing a lock claim.
    pub retries: u32,
}

impl Default for LockingConfig {
    fn default() -> Self {
        Self {
            local_mediator_group: None,
            wait_ms: 10,
            expire_ms: 300_000,
            retries: 3,
        }
    }
}

/// Management log polling.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct LogConfig {
    /// Interval between management log polls.
    pub read_interval_ms: u64,
    /// Messages younger than this are left for the next poll. Must be positive:
    /// an append picks its timestamp before the write lands, so a reader with
    /// no lag can move past it and never see the message.
    pub read_lag_ms: u64,
    /// Longest wait for local transactions before an eviction ack is abandoned.
    pub ack_max_wait_ms: u64,
    /// Append committed change records to the transaction log.
    pub transaction_log: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            read_interval_ms: 500,
            read_lag_ms: 20,
            ack_max_wait_ms: 60_000,
            transaction_log: false,
        }
    }
}

/// What happens when a transaction uses an undefined type.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SchemaMaker {
    /// Create the type with inferred defaults.
    #[default]
    Default,
    /// Reject the write.
    None,
}

/// Schema behavior.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct SchemaConfig {
    /// Schema maker.
    pub default: SchemaMaker,
}

impl GraphConfig {
    /// Parses a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| PenumbraError::Config(format!("invalid config: {e}")))
    }

    /// Loads and validates a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path.as_ref())?;
        let cfg = Self::from_toml_str(&text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Renders the configuration as TOML.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| PenumbraError::Serialization(format!("render config: {e}")))
    }

    /// Rejects invalid or contradictory settings.
    pub fn validate(&self) -> Result<()> {
        let parts = self.cluster.max_partitions;
        if parts == 0 || parts > MAX_PARTITIONS_LIMIT || !parts.is_power_of_two() {
            return Err(PenumbraError::Config(format!(
                "cluster.max-partitions must be a power of two between 1 and {MAX_PARTITIONS_LIMIT}, got {parts}"
            )));
        }
        validate_custom_id_policy(
            self.graph.allow_custom_vertex_ids,
            self.graph.allow_custom_vertex_id_types,
        )?;
        if self.ids.block_size == 0 {
            return Err(PenumbraError::Config("ids.block-size must be positive".into()));
        }
        if !(self.ids.renew_percentage > 0.0 && self.ids.renew_percentage <= 1.0) {
            return Err(PenumbraError::Config(
                "ids.renew-percentage must be in (0, 1]".into(),
            ));
        }
        if self.ids.placement == PlacementKind::Bulk && self.ids.concurrent_partitions == 0 {
            return Err(PenumbraError::Config(
                "ids.concurrent-partitions must be positive for bulk placement".into(),
            ));
        }
        if self.ids.placement == PlacementKind::Property
            && self.ids.placement_property_key.as_deref().map_or(true, str::is_empty)
        {
            return Err(PenumbraError::Config(
                "property placement requires ids.placement-property-key".into(),
            ));
        }
        if let Some(id) = &self.graph.unique_instance_id {
            if id.is_empty() || id.contains('-') {
                return Err(PenumbraError::Config(format!(
                    "graph.unique-instance-id must be non-empty and must not contain '-': {id:?}"
                )));
            }
        }
        if self.log.read_interval_ms == 0 {
            return Err(PenumbraError::Config("log.read-interval-ms must be positive".into()));
        }
        if self.log.read_lag_ms == 0 {
            return Err(PenumbraError::Config("log.read-lag-ms must be positive".into()));
        }
        Ok(())
    }

    /// Number of bits the partition occupies in an id.
    pub fn partition_bits(&self) -> u32 {
        self.cluster.max_partitions.trailing_zeros()
    }

    /// Sets the instance id.
    pub fn instance_id(mut self, id: impl Into<String>) -> Self {
        self.graph.unique_instance_id = Some(id.into());
        self
    }

    /// Sets the partition count.
    pub fn max_partitions(mut self, parts: u32) -> Self {
        self.cluster.max_partitions = parts;
        self
    }

    /// Sets the custom vertex id policy.
    pub fn custom_vertex_ids(mut self, allow: bool, allow_types: bool) -> Self {
        self.graph.allow_custom_vertex_ids = allow;
        self.graph.allow_custom_vertex_id_types = allow_types;
        self
    }

    /// Sets the management log poll interval and read lag.
    pub fn log_timing(mut self, read_interval_ms: u64, read_lag_ms: u64) -> Self {
        self.log.read_interval_ms = read_interval_ms;
        self.log.read_lag_ms = read_lag_ms;
        self
    }

    /// Sets the placement policy.
    pub fn placement(mut self, kind: PlacementKind) -> Self {
        self.ids.placement = kind;
        self
    }

    /// Sets the id block size.
    pub fn block_size(mut self, size: u64) -> Self {
        self.ids.block_size = size;
        self
    }

    /// Sets the schema maker.
    pub fn schema_maker(mut self, maker: SchemaMaker) -> Self {
        self.schema.default = maker;
        self
    }

    /// Sets the local lock mediator group.
    pub fn mediator_group(mut self, group: impl Into<String>) -> Self {
        self.locking.local_mediator_group = Some(group.into());
        self
    }

    pub(crate) fn read_interval(&self) -> Duration {
        Duration::from_millis(self.log.read_interval_ms)
    }

    pub(crate) fn read_lag(&self) -> Duration {
        Duration::from_millis(self.log.read_lag_ms)
    }

    pub(crate) fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.locking.wait_ms)
    }

    pub(crate) fn lock_expire(&self) -> Duration {
        Duration::from_millis(self.locking.expire_ms)
    }
}

/// Checks the custom vertex id flags against each other.
pub fn validate_custom_id_policy(allow_ids: bool, allow_types: bool) -> Result<()> {
    if allow_types && !allow_ids {
        return Err(PenumbraError::Config(
            "allow-custom-vertex-id-types is enabled but allow-custom-vertex-ids is disabled"
                .into(),
        ));
    }
    Ok(())
}
