//! Typed error type for the store crate.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The backing store failed (poisoned lock, I/O, ...).
    #[error("backing store failure: {0}")]
    Backend(String),

    /// No value is stored under the handle.
    #[error("no value stored under handle {handle}")]
    NotFound { handle: i64 },

    /// The handle is being created by another live transaction.
    #[error("handle {handle} is pending creation in another transaction")]
    PendingCreate { handle: i64 },

    /// Another transaction committed a change to the handle after this
    /// transaction observed it. The caller should retry the operation.
    #[error("concurrent modification of handle {handle}")]
    Conflict { handle: i64 },

    /// `Handle::invalid()` was passed where a stored handle is required.
    #[error("invalid handle")]
    InvalidHandle,

    /// The transaction belongs to a different registry than the map.
    #[error("transaction {tx} is not known to this store")]
    ForeignTransaction { tx: u64 },
}

impl StoreError {
    /// Whether re-running the whole logical operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::PendingCreate { .. })
    }
}
