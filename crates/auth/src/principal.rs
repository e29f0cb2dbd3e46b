//! Principals, service identities and the registry that names services.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::AuthError;

/// The user or agent on whose behalf a token acts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Principal(String);

impl Principal {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Principal {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Identity of a service tokens can be issued for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceId(String);

impl ServiceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ServiceId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Hands out human-readable service ids (`"tasklist-1"`, `"tasklist-2"`, ...)
/// and remembers which ids exist.
///
/// Create one per process run or test; ids are only unique within a registry.
#[derive(Debug, Default)]
pub struct ServiceRegistry {
    counters: RwLock<HashMap<String, u64>>,
    services: RwLock<BTreeMap<ServiceId, String>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new service whose id is derived from `name`.
    pub fn register(&self, name: &str) -> Result<ServiceId, AuthError> {
        let n = {
            let mut counters = self.counters.write().map_err(poisoned)?;
            let counter = counters.entry(name.to_string()).or_insert(0);
            *counter += 1;
            *counter
        };
        let id = ServiceId::new(format!("{name}-{n}"));
        self.services
            .write()
            .map_err(poisoned)?
            .insert(id.clone(), name.to_string());
        debug!(service = %id, "service registered");
        Ok(id)
    }

    /// Register a service under an externally chosen id.
    pub fn register_id(&self, id: ServiceId) -> Result<ServiceId, AuthError> {
        self.services
            .write()
            .map_err(poisoned)?
            .insert(id.clone(), id.as_str().to_string());
        Ok(id)
    }

    pub fn contains(&self, id: &ServiceId) -> bool {
        self.services
            .read()
            .map(|services| services.contains_key(id))
            .unwrap_or(false)
    }

    /// Fail with [`AuthError::UnknownService`] unless `id` is registered.
    pub fn require(&self, id: &ServiceId) -> Result<(), AuthError> {
        if self.contains(id) {
            Ok(())
        } else {
            Err(AuthError::UnknownService(id.clone()))
        }
    }

    /// The name a service was registered under.
    pub fn name_of(&self, id: &ServiceId) -> Option<String> {
        self.services.read().ok()?.get(id).cloned()
    }

    pub fn ids(&self) -> Vec<ServiceId> {
        self.services
            .read()
            .map(|services| services.keys().cloned().collect())
            .unwrap_or_default()
    }
}

fn poisoned<T>(_: T) -> AuthError {
    AuthError::Internal("service registry lock poisoned".into())
}
