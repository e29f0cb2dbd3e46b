//! In-memory [`HandleMap`] implementation.
//!
//! Committed values live in a `BTreeMap` behind an `RwLock`, each tagged with
//! a version that is bumped on every committed write. Uncommitted writes live
//! in the transaction; handles a transaction is still creating are tracked in
//! a pending-create table so other transactions fail fast instead of seeing
//! half-built values.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, trace};

use crate::map::{HandleMap, Storable, TransactionParticipant, Versioned};
use crate::transaction::{MapId, Staged, Transaction, TxId, TxRegistry};
use crate::{Handle, StoreError};

pub struct MemoryHandleMap<T> {
    id: MapId,
    name: String,
    registry: Arc<TxRegistry>,
    next_handle: AtomicI64,
    committed: RwLock<BTreeMap<i64, Versioned<T>>>,
    pending: Mutex<HashMap<i64, TxId>>,
}

impl<T> fmt::Debug for MemoryHandleMap<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryHandleMap")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("next_handle", &self.next_handle.load(Ordering::Relaxed))
            .finish()
    }
}

impl<T: Storable> MemoryHandleMap<T> {
    /// Create an empty map taking part in `registry`'s transactions.
    pub fn new(registry: &Arc<TxRegistry>, name: impl Into<String>) -> Self {
        Self {
            id: registry.register_map(),
            name: name.into(),
            registry: Arc::clone(registry),
            next_handle: AtomicI64::new(0),
            committed: RwLock::new(BTreeMap::new()),
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of committed values.
    pub fn len(&self) -> Result<usize, StoreError> {
        Ok(self.read()?.len())
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.read()?.is_empty())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, BTreeMap<i64, Versioned<T>>>, StoreError> {
        self.committed
            .read()
            .map_err(|_| StoreError::Backend(format!("{} lock poisoned", self.name)))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, BTreeMap<i64, Versioned<T>>>, StoreError> {
        self.committed
            .write()
            .map_err(|_| StoreError::Backend(format!("{} lock poisoned", self.name)))
    }

    fn pending(&self) -> Result<std::sync::MutexGuard<'_, HashMap<i64, TxId>>, StoreError> {
        self.pending
            .lock()
            .map_err(|_| StoreError::Backend(format!("{} pending table poisoned", self.name)))
    }

    fn check_tx(&self, tx: &Transaction) -> Result<(), StoreError> {
        if tx.belongs_to(&self.registry) {
            Ok(())
        } else {
            Err(StoreError::ForeignTransaction { tx: tx.id().as_u64() })
        }
    }

    /// Fail if `handle` is being created by another live transaction.
    fn check_pending(&self, tx: &Transaction, handle: i64) -> Result<(), StoreError> {
        let mut pending = self.pending()?;
        if let Some(owner) = pending.get(&handle).copied() {
            if owner == tx.id() {
                return Ok(());
            }
            if self.registry.is_live(owner) {
                return Err(StoreError::PendingCreate { handle });
            }
            // Owner went away without commit or rollback.
            pending.remove(&handle);
        }
        Ok(())
    }

    /// The version `tx` bases a write on, failing if someone else committed
    /// since `tx` first looked at the handle.
    fn write_base(&self, tx: &mut Transaction, handle: i64, current: u64) -> Result<u64, StoreError> {
        match tx.observed(self.id, handle) {
            Some(seen) if seen != current => Err(StoreError::Conflict { handle }),
            Some(seen) => Ok(seen),
            None => {
                tx.observe(self.id, handle, current);
                Ok(current)
            }
        }
    }
}

impl<T: Storable> TransactionParticipant for MemoryHandleMap<T> {
    fn map_id(&self) -> MapId {
        self.id
    }

    fn validate(&self, tx: &Transaction) -> Result<(), StoreError> {
        self.check_tx(tx)?;
        let Some(staging) = tx.staging::<T>(self.id) else {
            return Ok(());
        };
        let committed = self.read()?;
        for (&handle, staged) in &staging.entries {
            if let Some(base) = staged.base {
                let current = committed.get(&handle).map(|v| v.version);
                if current != Some(base) {
                    return Err(StoreError::Conflict { handle });
                }
            }
        }
        Ok(())
    }

    fn apply(&self, tx: &mut Transaction) -> Result<(), StoreError> {
        self.apply_changes(tx).map(|_| ())
    }

    fn abandon(&self, tx: &Transaction) {
        if let Ok(mut pending) = self.pending() {
            pending.retain(|_, owner| *owner != tx.id());
        }
    }
}

impl<T: Storable> HandleMap<T> for MemoryHandleMap<T> {
    fn put(&self, tx: &mut Transaction, value: T) -> Result<Handle<T>, StoreError> {
        self.check_tx(tx)?;
        let raw = self.next_handle.fetch_add(1, Ordering::SeqCst);
        let handle = Handle::new(raw);
        let value = value.with_handle(handle);

        self.pending()?.insert(raw, tx.id());
        tx.staging_mut::<T>(self.id)?
            .entries
            .insert(raw, Staged { base: None, value: Some(value) });

        trace!(map = %self.name, %handle, tx = %tx.id(), "put");
        Ok(handle)
    }

    fn get(&self, tx: &mut Transaction, handle: Handle<T>) -> Result<Option<T>, StoreError> {
        self.check_tx(tx)?;
        if !handle.is_valid() {
            return Ok(None);
        }
        let raw = handle.value();
        if let Some(staged) = tx.staged::<T>(self.id, raw) {
            return Ok(staged.value.clone());
        }
        self.check_pending(tx, raw)?;

        let found = self.read()?.get(&raw).cloned();
        Ok(found.map(|v| {
            tx.observe(self.id, raw, v.version);
            v.value
        }))
    }

    fn set(&self, tx: &mut Transaction, handle: Handle<T>, value: T) -> Result<Option<T>, StoreError> {
        self.check_tx(tx)?;
        if !handle.is_valid() {
            return Err(StoreError::InvalidHandle);
        }
        let raw = handle.value();
        let value = value.with_handle(handle);

        if let Some(staged) = tx.staged::<T>(self.id, raw) {
            let Some(old) = staged.value.clone() else {
                return Err(StoreError::NotFound { handle: raw });
            };
            if !old.storage_eq(&value) {
                if let Some(entry) = tx.staging_mut::<T>(self.id)?.entries.get_mut(&raw) {
                    entry.value = Some(value);
                }
            }
            return Ok(Some(old));
        }
        self.check_pending(tx, raw)?;

        let current = self
            .read()?
            .get(&raw)
            .cloned()
            .ok_or(StoreError::NotFound { handle: raw })?;
        let base = self.write_base(tx, raw, current.version)?;

        if current.value.storage_eq(&value) {
            trace!(map = %self.name, %handle, "set is a no-op");
        } else {
            tx.staging_mut::<T>(self.id)?
                .entries
                .insert(raw, Staged { base: Some(base), value: Some(value) });
            trace!(map = %self.name, %handle, tx = %tx.id(), "set");
        }
        Ok(Some(current.value))
    }

    fn remove(&self, tx: &mut Transaction, handle: Handle<T>) -> Result<bool, StoreError> {
        self.check_tx(tx)?;
        if !handle.is_valid() {
            return Ok(false);
        }
        let raw = handle.value();

        if let Some(staged) = tx.staged::<T>(self.id, raw) {
            if staged.value.is_none() {
                return Ok(false);
            }
            if staged.is_create() {
                tx.staging_mut::<T>(self.id)?.entries.remove(&raw);
                self.pending()?.remove(&raw);
            } else if let Some(entry) = tx.staging_mut::<T>(self.id)?.entries.get_mut(&raw) {
                entry.value = None;
            }
            return Ok(true);
        }
        self.check_pending(tx, raw)?;

        let Some(version) = self.read()?.get(&raw).map(|v| v.version) else {
            return Ok(false);
        };
        let base = self.write_base(tx, raw, version)?;
        tx.staging_mut::<T>(self.id)?
            .entries
            .insert(raw, Staged { base: Some(base), value: None });
        trace!(map = %self.name, %handle, tx = %tx.id(), "remove");
        Ok(true)
    }

    fn contains(&self, tx: &Transaction, handle: Handle<T>) -> Result<bool, StoreError> {
        self.check_tx(tx)?;
        if !handle.is_valid() {
            return Ok(false);
        }
        let raw = handle.value();
        if let Some(staged) = tx.staged::<T>(self.id, raw) {
            return Ok(staged.value.is_some());
        }
        self.check_pending(tx, raw)?;
        Ok(self.read()?.contains_key(&raw))
    }

    fn for_each(&self, tx: &Transaction, f: &mut dyn FnMut(Handle<T>, &T)) -> Result<(), StoreError> {
        self.check_tx(tx)?;
        let mut visible: BTreeMap<i64, T> = self
            .read()?
            .iter()
            .map(|(&h, v)| (h, v.value.clone()))
            .collect();
        if let Some(staging) = tx.staging::<T>(self.id) {
            for (&h, staged) in &staging.entries {
                match &staged.value {
                    Some(value) => {
                        visible.insert(h, value.clone());
                    }
                    None => {
                        visible.remove(&h);
                    }
                }
            }
        }
        for (h, value) in &visible {
            f(Handle::new(*h), value);
        }
        Ok(())
    }

    fn load(&self, handle: Handle<T>) -> Result<Option<Versioned<T>>, StoreError> {
        Ok(self.read()?.get(&handle.value()).cloned())
    }

    fn apply_changes(
        &self,
        tx: &mut Transaction,
    ) -> Result<Vec<(Handle<T>, Option<Versioned<T>>)>, StoreError> {
        self.check_tx(tx)?;
        let tx_id = tx.id();
        let Some(staging) = tx.take_staging::<T>(self.id) else {
            return Ok(Vec::new());
        };

        let mut committed = self.write()?;
        let mut changes = Vec::with_capacity(staging.entries.len());
        for (raw, staged) in staging.entries {
            let handle = Handle::new(raw);
            match staged.value {
                Some(value) => {
                    let version = committed.get(&raw).map_or(1, |v| v.version + 1);
                    let entry = Versioned { version, value };
                    committed.insert(raw, entry.clone());
                    changes.push((handle, Some(entry)));
                }
                None => {
                    committed.remove(&raw);
                    changes.push((handle, None));
                }
            }
        }
        drop(committed);

        self.pending()?.retain(|_, owner| *owner != tx_id);
        debug!(map = %self.name, tx = %tx_id, changes = changes.len(), "applied");
        Ok(changes)
    }

    fn tx_registry(&self) -> &Arc<TxRegistry> {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Doc {
        handle: Handle<Doc>,
        title: String,
        views: u32,
    }

    impl Doc {
        fn new(title: &str) -> Self {
            Self { handle: Handle::invalid(), title: title.into(), views: 0 }
        }
    }

    impl Storable for Doc {
        fn with_handle(self, handle: Handle<Self>) -> Self {
            Self { handle, ..self }
        }

        // `views` is not persisted.
        fn storage_eq(&self, other: &Self) -> bool {
            self.handle == other.handle && self.title == other.title
        }
    }

    fn setup() -> (Arc<TxRegistry>, MemoryHandleMap<Doc>) {
        let registry = TxRegistry::new();
        let map = MemoryHandleMap::new(&registry, "docs");
        (registry, map)
    }

    fn commit(registry: &Arc<TxRegistry>, map: &MemoryHandleMap<Doc>, tx: Transaction) {
        registry.commit(tx, &[map]).expect("commit");
    }

    #[test]
    fn put_then_get_reads_own_write_before_commit() {
        let (_registry, map) = setup();
        let mut tx = _registry.begin();
        let h = map.put(&mut tx, Doc::new("a")).unwrap();
        let doc = map.get(&mut tx, h).unwrap().expect("visible in tx");
        assert_eq!(doc.title, "a");
        assert_eq!(doc.handle, h, "value is re-stamped with its handle");
        assert!(map.is_empty().unwrap(), "nothing committed yet");
    }

    #[test]
    fn handles_are_not_reused_after_remove() {
        let (registry, map) = setup();
        let mut tx = registry.begin();
        let a = map.put(&mut tx, Doc::new("a")).unwrap();
        commit(&registry, &map, tx);

        let mut tx = registry.begin();
        assert!(map.remove(&mut tx, a).unwrap());
        let b = map.put(&mut tx, Doc::new("b")).unwrap();
        commit(&registry, &map, tx);
        assert_ne!(a, b);
        assert!(b > a);
    }

    #[test]
    fn pending_create_is_invisible_and_fails_fast_elsewhere() {
        let (registry, map) = setup();
        let mut writer = registry.begin();
        let h = map.put(&mut writer, Doc::new("draft")).unwrap();

        let mut reader = registry.begin();
        assert_eq!(map.get(&mut reader, h), Err(StoreError::PendingCreate { handle: h.value() }));
        assert!(map.contains(&reader, h).is_err());

        commit(&registry, &map, writer);
        assert_eq!(map.get(&mut reader, h).unwrap().unwrap().title, "draft");
    }

    #[test]
    fn pending_entry_of_dropped_transaction_is_ignored() {
        let (registry, map) = setup();
        let mut abandoned = registry.begin();
        let h = map.put(&mut abandoned, Doc::new("lost")).unwrap();
        drop(abandoned);

        let mut tx = registry.begin();
        assert_eq!(map.get(&mut tx, h).unwrap(), None);
    }

    #[test]
    fn storage_equal_set_is_a_no_op() {
        let (registry, map) = setup();
        let mut tx = registry.begin();
        let h = map.put(&mut tx, Doc::new("a")).unwrap();
        commit(&registry, &map, tx);

        let mut tx = registry.begin();
        let mut doc = map.get(&mut tx, h).unwrap().unwrap();
        doc.views = 99;
        let old = map.set(&mut tx, h, doc).unwrap();
        assert_eq!(old.unwrap().views, 0);
        assert!(!tx.is_dirty(), "field churn outside storage equality is not written");
    }

    #[test]
    fn racing_set_is_detected() {
        let (registry, map) = setup();
        let mut tx = registry.begin();
        let h = map.put(&mut tx, Doc::new("v0")).unwrap();
        commit(&registry, &map, tx);

        let mut first = registry.begin();
        let mut second = registry.begin();
        let a = map.get(&mut first, h).unwrap().unwrap();
        let b = map.get(&mut second, h).unwrap().unwrap();

        map.set(&mut first, h, Doc { title: "v1".into(), ..a }).unwrap();
        commit(&registry, &map, first);

        // Second saw v0; its write must not silently overwrite v1.
        assert_eq!(
            map.set(&mut second, h, Doc { title: "v2".into(), ..b }),
            Err(StoreError::Conflict { handle: h.value() })
        );
    }

    #[test]
    fn conflict_is_also_caught_at_commit() {
        let (registry, map) = setup();
        let mut tx = registry.begin();
        let h = map.put(&mut tx, Doc::new("v0")).unwrap();
        commit(&registry, &map, tx);

        let mut first = registry.begin();
        let mut second = registry.begin();
        map.set(&mut first, h, Doc { handle: h, ..Doc::new("v1") }).unwrap();
        map.set(&mut second, h, Doc { handle: h, ..Doc::new("v2") }).unwrap();

        commit(&registry, &map, first);
        assert_eq!(
            registry.commit(second, &[&map]),
            Err(StoreError::Conflict { handle: h.value() })
        );

        let mut tx = registry.begin();
        assert_eq!(map.get(&mut tx, h).unwrap().unwrap().title, "v1");
    }

    #[test]
    fn remove_hides_value_and_rollback_restores_it() {
        let (registry, map) = setup();
        let mut tx = registry.begin();
        let h = map.put(&mut tx, Doc::new("keep")).unwrap();
        commit(&registry, &map, tx);

        let mut tx = registry.begin();
        assert!(map.remove(&mut tx, h).unwrap());
        assert!(!map.contains(&tx, h).unwrap());
        assert!(!map.remove(&mut tx, h).unwrap());
        registry.rollback(tx, &[&map]);

        let tx = registry.begin();
        assert!(map.contains(&tx, h).unwrap());
    }

    #[test]
    fn set_on_missing_handle_fails() {
        let (registry, map) = setup();
        let mut tx = registry.begin();
        assert_eq!(
            map.set(&mut tx, Handle::new(12), Doc::new("x")),
            Err(StoreError::NotFound { handle: 12 })
        );
        assert_eq!(map.set(&mut tx, Handle::invalid(), Doc::new("x")), Err(StoreError::InvalidHandle));
    }

    #[test]
    fn for_each_overlays_staged_writes() {
        let (registry, map) = setup();
        let mut tx = registry.begin();
        let a = map.put(&mut tx, Doc::new("a")).unwrap();
        let b = map.put(&mut tx, Doc::new("b")).unwrap();
        commit(&registry, &map, tx);

        let mut tx = registry.begin();
        map.remove(&mut tx, a).unwrap();
        map.set(&mut tx, b, Doc { handle: b, ..Doc::new("b2") }).unwrap();
        let c = map.put(&mut tx, Doc::new("c")).unwrap();

        let titles: Vec<_> = map.values(&tx).unwrap().into_iter().map(|(h, d)| (h, d.title)).collect();
        assert_eq!(titles, vec![(b, "b2".to_string()), (c, "c".to_string())]);
    }

    #[test]
    fn unlisted_participant_is_refused() {
        let (registry, map) = setup();
        let mut tx = registry.begin();
        map.put(&mut tx, Doc::new("a")).unwrap();
        assert!(matches!(registry.commit(tx, &[]), Err(StoreError::Backend(_))));
        assert!(map.is_empty().unwrap());
    }
}
