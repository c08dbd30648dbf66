//! Legal index status transitions.
//!
//! ```text
//! INSTALLED ──register──▶ REGISTERED ──enable/reindex──▶ ENABLED ──disable──▶ DISABLED
//!     │                       │                                                 │
//!     └──────────remove───────┴────────────────────remove───────────────────────┴──▶ REMOVED
//! ```
//!
//! Enabling a REGISTERED index without a reindex leaves data written before
//! registration out of the index.

use super::types::{SchemaAction, SchemaStatus};
use crate::types::{PenumbraError, Result};

/// What an action does to a field in a given status.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ActionPlan {
    /// Nothing to do; the field is already where the action leads.
    NoOp,
    /// Status changes at management commit.
    Immediate(SchemaStatus),
    /// Status changes once every open instance acknowledged the commit.
    AfterAcks(SchemaStatus),
    /// Status changes when the scan job finishes.
    AfterScan(SchemaStatus),
}

/// Whether `from → to` is an edge of the lifecycle graph.
pub fn is_legal_transition(from: SchemaStatus, to: SchemaStatus) -> bool {
    use SchemaStatus::*;
    matches!(
        (from, to),
        (Installed, Registered)
            | (Registered, Enabled)
            | (Enabled, Disabled)
            | (Disabled, Removed)
            | (Installed, Removed)
            | (Registered, Removed)
    )
}

/// Plans `action` for a field currently in `status`.
///
/// Fails with a lifecycle precondition error when the action does not apply yet
/// (for example enabling an INSTALLED index) and with a schema violation when it
/// can never apply (anything but removal on a REMOVED index).
pub fn plan(action: SchemaAction, status: SchemaStatus, index: &str) -> Result<ActionPlan> {
    use SchemaAction::*;
    use SchemaStatus::*;
    let plan = match (action, status) {
        (RemoveIndex, Removed) => ActionPlan::NoOp,
        (_, Removed) => {
            return Err(PenumbraError::SchemaViolation(format!(
                "index {index} was removed and cannot be changed; create a new index"
            )))
        }
        (RegisterIndex, Installed) => ActionPlan::AfterAcks(Registered),
        (RegisterIndex, Registered | Enabled) => ActionPlan::NoOp,
        (Reindex, Registered | Enabled) => ActionPlan::AfterScan(Enabled),
        (EnableIndex, Registered) => ActionPlan::Immediate(Enabled),
        (EnableIndex, Enabled) => ActionPlan::NoOp,
        (DisableIndex, Enabled) => ActionPlan::Immediate(Disabled),
        (DisableIndex, Disabled) => ActionPlan::NoOp,
        (RemoveIndex, Installed | Registered | Disabled) => ActionPlan::AfterScan(Removed),
        (action, status) => {
            return Err(PenumbraError::LifecyclePrecondition(format!(
                "{action} is not applicable to index {index} in status {status}"
            )))
        }
    };
    Ok(plan)
}
