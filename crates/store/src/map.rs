//! The handle-map contract shared by every backing store.

use std::sync::Arc;

use crate::transaction::{MapId, Transaction, TxRegistry};
use crate::{Handle, StoreError};

/// A value that can live in a handle map.
///
/// Values are immutable snapshots. When a value is stored under a fresh
/// handle the map re-stamps it through [`Storable::with_handle`], so values
/// that embed their own handle get a new snapshot carrying it.
pub trait Storable: Clone + PartialEq + Send + Sync + 'static {
    /// Produce the snapshot to store under `handle`.
    fn with_handle(self, _handle: Handle<Self>) -> Self {
        self
    }

    /// Whether two snapshots would be stored identically. `set` is a no-op
    /// when the new value is storage-equal to the current one.
    fn storage_eq(&self, other: &Self) -> bool {
        self == other
    }
}

/// A committed value together with its version.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub version: u64,
    pub value: T,
}

/// A resource that takes part in the two-phase commit driven by
/// [`TxRegistry::commit`].
pub trait TransactionParticipant: Send + Sync {
    fn map_id(&self) -> MapId;

    /// Check that the transaction's staged writes can be applied.
    fn validate(&self, tx: &Transaction) -> Result<(), StoreError>;

    /// Make the transaction's staged writes visible. Only called after every
    /// participant validated.
    fn apply(&self, tx: &mut Transaction) -> Result<(), StoreError>;

    /// Release anything held for the transaction without applying it.
    fn abandon(&self, tx: &Transaction);
}

/// A transactional map from handles to values.
pub trait HandleMap<T: Storable>: TransactionParticipant {
    /// Store `value` under a freshly allocated handle.
    fn put(&self, tx: &mut Transaction, value: T) -> Result<Handle<T>, StoreError>;

    /// Read the value under `handle` as seen by `tx`.
    fn get(&self, tx: &mut Transaction, handle: Handle<T>) -> Result<Option<T>, StoreError>;

    /// Replace the value under `handle`, returning the previous one.
    fn set(&self, tx: &mut Transaction, handle: Handle<T>, value: T) -> Result<Option<T>, StoreError>;

    /// Remove the value under `handle`. Returns whether anything was removed.
    fn remove(&self, tx: &mut Transaction, handle: Handle<T>) -> Result<bool, StoreError>;

    fn contains(&self, tx: &Transaction, handle: Handle<T>) -> Result<bool, StoreError>;

    /// Visit every value visible to `tx` in handle order.
    fn for_each(&self, tx: &Transaction, f: &mut dyn FnMut(Handle<T>, &T)) -> Result<(), StoreError>;

    /// Committed state of `handle`, ignoring any transaction.
    fn load(&self, handle: Handle<T>) -> Result<Option<Versioned<T>>, StoreError>;

    /// Apply the staged writes of `tx` and report what was committed:
    /// `Some` for written handles, `None` for removed ones.
    fn apply_changes(
        &self,
        tx: &mut Transaction,
    ) -> Result<Vec<(Handle<T>, Option<Versioned<T>>)>, StoreError>;

    fn tx_registry(&self) -> &Arc<TxRegistry>;

    /// Collect every visible value.
    fn values(&self, tx: &Transaction) -> Result<Vec<(Handle<T>, T)>, StoreError> {
        let mut out = Vec::new();
        self.for_each(tx, &mut |handle, value| out.push((handle, value.clone())))?;
        Ok(out)
    }
}
