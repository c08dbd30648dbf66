//! Schema enums shared by definitions, the registry and transactions.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::{Direction, PropertyValue};

/// Edge multiplicity.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum Multiplicity {
    /// Any number of edges between any vertices.
    #[default]
    Multi,
    /// At most one edge of the label between a pair of vertices.
    Simple,
    /// At most one outgoing edge per vertex.
    Many2One,
    /// At most one incoming edge per vertex.
    One2Many,
    /// At most one edge in each direction per vertex.
    One2One,
}

impl Multiplicity {
    /// Whether the multiplicity restricts edges at all.
    pub fn is_constrained(self) -> bool {
        self != Multiplicity::Multi
    }

    /// Whether a vertex may have at most one edge of this label in `dir`.
    pub fn is_unique(self, dir: Direction) -> bool {
        match dir {
            Direction::Out => matches!(self, Multiplicity::Many2One | Multiplicity::One2One),
            Direction::In => matches!(self, Multiplicity::One2Many | Multiplicity::One2One),
            Direction::Both => {
                matches!(
                    self,
                    Multiplicity::Many2One | Multiplicity::One2Many | Multiplicity::One2One
                )
            }
        }
    }
}

/// Property cardinality.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum Cardinality {
    /// One value per vertex.
    #[default]
    Single,
    /// Ordered values, duplicates allowed.
    List,
    /// Distinct values.
    Set,
}

/// Write-conflict policy of a relation type or composite index.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum ConsistencyModifier {
    /// Last write wins at the storage layer.
    #[default]
    Default,
    /// Expected-value locking on every mutated cell.
    Lock,
    /// Updates create a new relation instead of mutating in place.
    Fork,
}

/// Lifecycle stage of an index field.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum SchemaStatus {
    /// Created; peers may not know about it yet.
    Installed,
    /// Every instance has acknowledged the index; writes maintain it.
    Registered,
    /// Writes maintain it and queries may use it.
    Enabled,
    /// Queries ignore it; its records still exist.
    Disabled,
    /// Records deleted; the identity is retired.
    Removed,
}

impl SchemaStatus {
    /// Whether writes must maintain index records.
    pub fn is_maintained(self) -> bool {
        matches!(self, SchemaStatus::Registered | SchemaStatus::Enabled)
    }

    /// Whether queries may answer from the index.
    pub fn is_queryable(self) -> bool {
        self == SchemaStatus::Enabled
    }
}

impl fmt::Display for SchemaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SchemaStatus::Installed => "INSTALLED",
            SchemaStatus::Registered => "REGISTERED",
            SchemaStatus::Enabled => "ENABLED",
            SchemaStatus::Disabled => "DISABLED",
            SchemaStatus::Removed => "REMOVED",
        };
        f.write_str(s)
    }
}

/// Lifecycle action requested through the management surface.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum SchemaAction {
    /// INSTALLED → REGISTERED once every open instance acknowledged.
    RegisterIndex,
    /// Rebuild records for existing data, then enable.
    Reindex,
    /// REGISTERED → ENABLED without touching existing data.
    EnableIndex,
    /// ENABLED → DISABLED.
    DisableIndex,
    /// Delete records and retire the index.
    RemoveIndex,
}

impl SchemaAction {
    /// Whether the action runs a scan job.
    pub fn requires_scan(self) -> bool {
        matches!(self, SchemaAction::Reindex | SchemaAction::RemoveIndex)
    }
}

impl fmt::Display for SchemaAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SchemaAction::RegisterIndex => "REGISTER_INDEX",
            SchemaAction::Reindex => "REINDEX",
            SchemaAction::EnableIndex => "ENABLE_INDEX",
            SchemaAction::DisableIndex => "DISABLE_INDEX",
            SchemaAction::RemoveIndex => "REMOVE_INDEX",
        };
        f.write_str(s)
    }
}

/// Element category an index covers.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum ElementCategory {
    /// Vertices.
    Vertex,
    /// Edges.
    Edge,
    /// Vertex properties.
    Property,
}

/// Data type of a property key.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum DataType {
    /// UTF-8 strings.
    String,
    /// 64-bit integers.
    Long,
    /// 64-bit floats.
    Double,
    /// Booleans.
    Boolean,
}

impl DataType {
    /// Whether `value` has this type.
    pub fn accepts(self, value: &PropertyValue) -> bool {
        matches!(
            (self, value),
            (DataType::String, PropertyValue::Str(_))
                | (DataType::Long, PropertyValue::Long(_))
                | (DataType::Double, PropertyValue::Double(_))
                | (DataType::Boolean, PropertyValue::Bool(_))
        )
    }

    /// Type of `value`.
    pub fn of(value: &PropertyValue) -> Self {
        match value {
            PropertyValue::Str(_) => DataType::String,
            PropertyValue::Long(_) => DataType::Long,
            PropertyValue::Double(_) => DataType::Double,
            PropertyValue::Bool(_) => DataType::Boolean,
        }
    }
}

/// Sort order of a relation index.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum Order {
    /// Ascending.
    #[default]
    Asc,
    /// Descending.
    Desc,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multiplicity_uniqueness_by_direction() {
        assert!(Multiplicity::Many2One.is_unique(Direction::Out));
        assert!(!Multiplicity::Many2One.is_unique(Direction::In));
        assert!(Multiplicity::One2Many.is_unique(Direction::In));
        assert!(Multiplicity::One2One.is_unique(Direction::Out));
        assert!(!Multiplicity::Simple.is_unique(Direction::Out));
        assert!(Multiplicity::Simple.is_constrained());
        assert!(!Multiplicity::Multi.is_constrained());
    }

    #[test]
    fn only_registered_and_enabled_are_maintained() {
        assert!(SchemaStatus::Registered.is_maintained());
        assert!(SchemaStatus::Enabled.is_maintained());
        assert!(!SchemaStatus::Installed.is_maintained());
        assert!(!SchemaStatus::Disabled.is_maintained());
        assert!(SchemaStatus::Enabled.is_queryable());
        assert!(!SchemaStatus::Registered.is_queryable());
    }
}
