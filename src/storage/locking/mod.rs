#![forbid(unsafe_code)]

//! Two-tier write locks: the process-local mediator, then expected-value
//! claims in the backend.

mod consistent_key;

/// Expected-value lock over one store.
pub use consistent_key::{ConsistentKeyLocker, LockState, LockerConfig};

/// Name of the claim store paired with `store`.
pub fn lock_store_name(store: &str) -> String {
    format!("{store}_lock_")
}
