//! Transactions and the registry that issues them.
//!
//! A [`Transaction`] carries everything a unit of work has done so far:
//! the staged writes of every map it touched and the versions it observed.
//! Staged writes are type-erased per [`MapId`] so a single transaction can
//! span maps of different value types. Dropping a transaction without
//! committing discards all of its writes.

use std::any::Any;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::map::TransactionParticipant;
use crate::StoreError;

/// Identity of a transaction within its registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TxId(u64);

impl TxId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx-{}", self.0)
    }
}

/// Identity of a handle map within its registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MapId(u64);

impl fmt::Display for MapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "map-{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Staging
// ---------------------------------------------------------------------------

/// A write staged inside a transaction for one handle.
#[derive(Debug, Clone)]
pub struct Staged<T> {
    /// Committed version this write was based on; `None` for handles
    /// created by the same transaction.
    pub base: Option<u64>,
    /// New value, or `None` when the handle was removed.
    pub value: Option<T>,
}

impl<T> Staged<T> {
    pub fn is_create(&self) -> bool {
        self.base.is_none()
    }
}

/// All writes a transaction has staged against one map, keyed by raw handle.
#[derive(Debug, Clone)]
pub struct Staging<T> {
    pub entries: BTreeMap<i64, Staged<T>>,
}

impl<T> Default for Staging<T> {
    fn default() -> Self {
        Self { entries: BTreeMap::new() }
    }
}

// ---------------------------------------------------------------------------
// TxRegistry
// ---------------------------------------------------------------------------

/// Issues transaction and map identities and serialises commits.
///
/// One registry is shared by all maps that take part in the same
/// transactions. It replaces process-wide counters: tests and hosts create
/// their own.
pub struct TxRegistry {
    next_tx: AtomicU64,
    next_map: AtomicU64,
    live: Mutex<HashSet<TxId>>,
    commit_lock: Mutex<()>,
}

impl fmt::Debug for TxRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxRegistry")
            .field("next_tx", &self.next_tx.load(Ordering::Relaxed))
            .field("next_map", &self.next_map.load(Ordering::Relaxed))
            .finish()
    }
}

impl TxRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_tx: AtomicU64::new(1),
            next_map: AtomicU64::new(1),
            live: Mutex::new(HashSet::new()),
            commit_lock: Mutex::new(()),
        })
    }

    /// Open a new transaction.
    pub fn begin(self: &Arc<Self>) -> Transaction {
        let id = TxId(self.next_tx.fetch_add(1, Ordering::SeqCst));
        match self.live.lock() {
            Ok(mut live) => {
                live.insert(id);
            }
            Err(poisoned) => {
                poisoned.into_inner().insert(id);
            }
        }
        debug!(%id, "transaction started");
        Transaction {
            id,
            registry: Arc::clone(self),
            observed: HashMap::new(),
            staging: HashMap::new(),
        }
    }

    /// Allocate the identity of a new map.
    pub fn register_map(&self) -> MapId {
        MapId(self.next_map.fetch_add(1, Ordering::SeqCst))
    }

    /// Whether the transaction is still open (neither committed, rolled back
    /// nor dropped).
    pub fn is_live(&self, id: TxId) -> bool {
        match self.live.lock() {
            Ok(live) => live.contains(&id),
            Err(poisoned) => poisoned.into_inner().contains(&id),
        }
    }

    /// Commit `tx` across `participants`.
    ///
    /// Every participant validates first; only if all of them accept are the
    /// staged writes applied. On failure nothing is applied and the
    /// transaction is rolled back.
    ///
    /// # Errors
    /// - [`StoreError::ForeignTransaction`] if `tx` came from another registry.
    /// - [`StoreError::Backend`] if `tx` staged writes on a map that is not
    ///   among `participants` (those writes would otherwise be lost).
    /// - Whatever a participant's validation reports, typically
    ///   [`StoreError::Conflict`].
    pub fn commit(
        &self,
        mut tx: Transaction,
        participants: &[&dyn TransactionParticipant],
    ) -> Result<(), StoreError> {
        if !std::ptr::eq(Arc::as_ptr(&tx.registry), self) {
            return Err(StoreError::ForeignTransaction { tx: tx.id.as_u64() });
        }

        let listed: HashSet<MapId> = participants.iter().map(|p| p.map_id()).collect();
        if let Some(unlisted) = tx.staging.keys().find(|id| !listed.contains(id)) {
            let err = StoreError::Backend(format!(
                "{} has staged writes for {unlisted}, which is not a commit participant",
                tx.id
            ));
            self.abandon(&tx, participants);
            return Err(err);
        }

        let _guard = self
            .commit_lock
            .lock()
            .map_err(|_| StoreError::Backend("commit lock poisoned".into()))?;

        for participant in participants {
            if let Err(err) = participant.validate(&tx) {
                warn!(tx = %tx.id, map = %participant.map_id(), error = %err, "commit rejected");
                self.abandon(&tx, participants);
                return Err(err);
            }
        }

        for participant in participants {
            participant.apply(&mut tx)?;
        }

        debug!(tx = %tx.id, "transaction committed");
        Ok(())
    }

    /// Discard every write staged by `tx`.
    pub fn rollback(&self, tx: Transaction, participants: &[&dyn TransactionParticipant]) {
        self.abandon(&tx, participants);
        debug!(tx = %tx.id, "transaction rolled back");
    }

    fn abandon(&self, tx: &Transaction, participants: &[&dyn TransactionParticipant]) {
        for participant in participants {
            participant.abandon(tx);
        }
    }

    fn finish(&self, id: TxId) {
        match self.live.lock() {
            Ok(mut live) => {
                live.remove(&id);
            }
            Err(poisoned) => {
                poisoned.into_inner().remove(&id);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Transaction
// ---------------------------------------------------------------------------

/// An open unit of work against one [`TxRegistry`].
pub struct Transaction {
    id: TxId,
    registry: Arc<TxRegistry>,
    observed: HashMap<(MapId, i64), u64>,
    staging: HashMap<MapId, Box<dyn Any + Send + Sync>>,
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("observed", &self.observed.len())
            .field("staged_maps", &self.staging.len())
            .finish()
    }
}

impl Transaction {
    pub fn id(&self) -> TxId {
        self.id
    }

    pub fn registry(&self) -> &Arc<TxRegistry> {
        &self.registry
    }

    /// Whether this transaction was issued by `registry`.
    pub fn belongs_to(&self, registry: &Arc<TxRegistry>) -> bool {
        Arc::ptr_eq(&self.registry, registry)
    }

    /// Whether any map has staged writes in this transaction.
    pub fn is_dirty(&self) -> bool {
        !self.staging.is_empty()
    }

    /// Record the committed version of `handle` this transaction has seen.
    /// The first observation wins.
    pub fn observe(&mut self, map: MapId, handle: i64, version: u64) {
        self.observed.entry((map, handle)).or_insert(version);
    }

    pub fn observed(&self, map: MapId, handle: i64) -> Option<u64> {
        self.observed.get(&(map, handle)).copied()
    }

    /// Staged writes of `map`, if any.
    pub fn staging<T: Send + Sync + 'static>(&self, map: MapId) -> Option<&Staging<T>> {
        self.staging.get(&map).and_then(|s| s.downcast_ref::<Staging<T>>())
    }

    /// The staged write for one handle, if any.
    pub fn staged<T: Send + Sync + 'static>(&self, map: MapId, handle: i64) -> Option<&Staged<T>> {
        self.staging::<T>(map).and_then(|s| s.entries.get(&handle))
    }

    /// Mutable staging area of `map`, created on first use.
    pub fn staging_mut<T: Send + Sync + 'static>(
        &mut self,
        map: MapId,
    ) -> Result<&mut Staging<T>, StoreError> {
        self.staging
            .entry(map)
            .or_insert_with(|| Box::new(Staging::<T>::default()))
            .downcast_mut::<Staging<T>>()
            .ok_or_else(|| StoreError::Backend(format!("{map} staged with a different value type")))
    }

    /// Remove and return the staged writes of `map`.
    pub fn take_staging<T: Send + Sync + 'static>(&mut self, map: MapId) -> Option<Staging<T>> {
        let boxed = self.staging.remove(&map)?;
        boxed.downcast::<Staging<T>>().ok().map(|b| *b)
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        self.registry.finish(self.id);
    }
}
