//! Bounded read cache in front of another [`HandleMap`].
//!
//! The cache only ever holds committed values together with their version,
//! so it can be shared by every transaction running against the wrapped map.
//! Writes go through to the backing map and reach the cache when they are
//! committed. Invalidation is explicit.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use sieve_cache::SieveCache;
use tracing::debug;

use crate::map::{HandleMap, Storable, TransactionParticipant, Versioned};
use crate::transaction::{MapId, Transaction, TxRegistry};
use crate::{Handle, StoreError};

/// Hit/miss counters of a [`CachingHandleMap`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

pub struct CachingHandleMap<T, M> {
    backing: M,
    capacity: usize,
    cache: Mutex<SieveCache<i64, Versioned<T>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<T, M: fmt::Debug> fmt::Debug for CachingHandleMap<T, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachingHandleMap")
            .field("backing", &self.backing)
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl<T, M> CachingHandleMap<T, M>
where
    T: Storable,
    M: HandleMap<T>,
{
    /// Wrap `backing` with a cache holding at most `capacity` values.
    pub fn new(backing: M, capacity: usize) -> Result<Self, StoreError> {
        let cache = SieveCache::new(capacity)
            .map_err(|error| StoreError::Backend(format!("could not initialize cache: {error}")))?;
        Ok(Self {
            backing,
            capacity,
            cache: Mutex::new(cache),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        })
    }

    pub fn backing(&self) -> &M {
        &self.backing
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    /// Drop the cached copy of `handle`.
    pub fn invalidate_cache(&self, handle: Handle<T>) -> Result<(), StoreError> {
        self.cache()?.remove(&handle.value());
        Ok(())
    }

    /// Drop every cached value.
    pub fn invalidate_cache_all(&self) -> Result<(), StoreError> {
        let fresh = SieveCache::new(self.capacity)
            .map_err(|error| StoreError::Backend(format!("could not reset cache: {error}")))?;
        *self.cache()? = fresh;
        debug!(capacity = self.capacity, "cache invalidated");
        Ok(())
    }

    fn cache(&self) -> Result<MutexGuard<'_, SieveCache<i64, Versioned<T>>>, StoreError> {
        self.cache
            .lock()
            .map_err(|_| StoreError::Backend("cache lock poisoned".into()))
    }

    fn cached(&self, raw: i64) -> Result<Option<Versioned<T>>, StoreError> {
        Ok(self.cache()?.get(&raw).cloned())
    }

    /// Cache `entry` after a miss, unless a commit has moved past it since it
    /// was read.
    fn fill(&self, handle: Handle<T>, entry: Versioned<T>) -> Result<(), StoreError> {
        match self.backing.load(handle)? {
            Some(current) if current.version == entry.version => {}
            _ => return Ok(()),
        }
        let raw = handle.value();
        let mut cache = self.cache()?;
        if cache.get(&raw).is_some_and(|cached| cached.version >= entry.version) {
            return Ok(());
        }
        cache.insert(raw, entry);
        Ok(())
    }

    fn is_staged(&self, tx: &Transaction, raw: i64) -> bool {
        tx.staged::<T>(self.backing.map_id(), raw).is_some()
    }
}

impl<T, M> TransactionParticipant for CachingHandleMap<T, M>
where
    T: Storable,
    M: HandleMap<T>,
{
    fn map_id(&self) -> MapId {
        self.backing.map_id()
    }

    fn validate(&self, tx: &Transaction) -> Result<(), StoreError> {
        self.backing.validate(tx)
    }

    fn apply(&self, tx: &mut Transaction) -> Result<(), StoreError> {
        self.apply_changes(tx).map(|_| ())
    }

    fn abandon(&self, tx: &Transaction) {
        self.backing.abandon(tx)
    }
}

impl<T, M> HandleMap<T> for CachingHandleMap<T, M>
where
    T: Storable,
    M: HandleMap<T>,
{
    fn put(&self, tx: &mut Transaction, value: T) -> Result<Handle<T>, StoreError> {
        self.backing.put(tx, value)
    }

    fn get(&self, tx: &mut Transaction, handle: Handle<T>) -> Result<Option<T>, StoreError> {
        let raw = handle.value();
        if !handle.is_valid() || self.is_staged(tx, raw) {
            return self.backing.get(tx, handle);
        }

        let map = self.backing.map_id();
        if let Some(hit) = self.cached(raw)? {
            self.hits.fetch_add(1, Ordering::Relaxed);
            tx.observe(map, raw, hit.version);
            return Ok(Some(hit.value));
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let seen_before = tx.observed(map, raw);
        let value = self.backing.get(tx, handle)?;
        if let (None, Some(value), Some(version)) = (seen_before, &value, tx.observed(map, raw)) {
            self.fill(handle, Versioned { version, value: value.clone() })?;
        }
        Ok(value)
    }

    fn set(&self, tx: &mut Transaction, handle: Handle<T>, value: T) -> Result<Option<T>, StoreError> {
        let raw = handle.value();
        if handle.is_valid() && !self.is_staged(tx, raw) {
            let map = self.backing.map_id();
            if let Some(hit) = self.cached(raw)? {
                let consistent = tx.observed(map, raw).map_or(true, |seen| seen == hit.version);
                if consistent && hit.value.storage_eq(&value.clone().with_handle(handle)) {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    tx.observe(map, raw, hit.version);
                    return Ok(Some(hit.value));
                }
            }
        }
        self.backing.set(tx, handle, value)
    }

    fn remove(&self, tx: &mut Transaction, handle: Handle<T>) -> Result<bool, StoreError> {
        self.backing.remove(tx, handle)
    }

    fn contains(&self, tx: &Transaction, handle: Handle<T>) -> Result<bool, StoreError> {
        let raw = handle.value();
        if handle.is_valid() && !self.is_staged(tx, raw) && self.cached(raw)?.is_some() {
            return Ok(true);
        }
        self.backing.contains(tx, handle)
    }

    fn for_each(&self, tx: &Transaction, f: &mut dyn FnMut(Handle<T>, &T)) -> Result<(), StoreError> {
        self.backing.for_each(tx, f)
    }

    fn load(&self, handle: Handle<T>) -> Result<Option<Versioned<T>>, StoreError> {
        if let Some(hit) = self.cached(handle.value())? {
            return Ok(Some(hit));
        }
        self.backing.load(handle)
    }

    fn apply_changes(
        &self,
        tx: &mut Transaction,
    ) -> Result<Vec<(Handle<T>, Option<Versioned<T>>)>, StoreError> {
        let changes = self.backing.apply_changes(tx)?;
        let mut cache = self.cache()?;
        for (handle, committed) in &changes {
            match committed {
                Some(entry) => {
                    cache.insert(handle.value(), entry.clone());
                }
                None => {
                    cache.remove(&handle.value());
                }
            }
        }
        Ok(changes)
    }

    fn tx_registry(&self) -> &Arc<TxRegistry> {
        self.backing.tx_registry()
    }
}
