//! Client-side cache of tokens minted for users.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::debug;

use crate::{AuthError, AuthService, AuthToken, Principal, ServiceId};

/// What a cached token was minted for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TokenKey {
    pub subject: Principal,
    pub service: ServiceId,
    pub node_instance: Option<i64>,
}

/// Tokens an intermediary has minted, reused while the authorization service
/// still considers them valid.
#[derive(Debug, Default)]
pub struct TokenCache {
    tokens: Mutex<HashMap<TokenKey, AuthToken>>,
}

impl TokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached token for `key` if it is still valid, otherwise
    /// evict it and cache a fresh one from `mint`.
    pub fn get_or_mint<F>(&self, auth: &AuthService, key: TokenKey, mint: F) -> Result<AuthToken, AuthError>
    where
        F: FnOnce() -> Result<AuthToken, AuthError>,
    {
        let mut tokens = self
            .tokens
            .lock()
            .map_err(|_| AuthError::Internal("token cache lock poisoned".into()))?;
        if let Some(cached) = tokens.get(&key) {
            if auth.is_valid(cached) {
                return Ok(cached.clone());
            }
            debug!(subject = %key.subject, service = %key.service, "evicting invalid cached token");
            tokens.remove(&key);
        }
        let token = mint()?;
        tokens.insert(key, token.clone());
        Ok(token)
    }

    /// Drop every cached token the authorization service no longer accepts.
    pub fn evict_invalid(&self, auth: &AuthService) -> usize {
        let Ok(mut tokens) = self.tokens.lock() else {
            return 0;
        };
        let before = tokens.len();
        tokens.retain(|_, token| auth.is_valid(token));
        before - tokens.len()
    }

    pub fn len(&self) -> usize {
        self.tokens.lock().map(|t| t.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Duration;

    use super::*;
    use crate::{AuthConfig, PermissionScope, ServiceRegistry};

    fn setup(config: AuthConfig) -> (AuthService, ServiceId) {
        let services = Arc::new(ServiceRegistry::new());
        let engine = services.register("engine").unwrap();
        (AuthService::new(config, services), engine)
    }

    fn key(engine: &ServiceId) -> TokenKey {
        TokenKey { subject: Principal::new("dave"), service: engine.clone(), node_instance: Some(1) }
    }

    #[test]
    fn valid_token_is_reused() {
        let (auth, engine) = setup(AuthConfig::default());
        let cache = TokenCache::new();
        let mint = || auth.grant(Principal::new("dave"), engine.clone(), engine.clone(), PermissionScope::accept_task(1), Some(1));

        let first = cache.get_or_mint(&auth, key(&engine), mint).unwrap();
        let second = cache
            .get_or_mint(&auth, key(&engine), || panic!("should not mint again"))
            .unwrap();
        assert_eq!(first.key, second.key);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn invalidated_token_is_replaced() {
        let (auth, engine) = setup(AuthConfig::default());
        let cache = TokenCache::new();
        let mint = || auth.grant(Principal::new("dave"), engine.clone(), engine.clone(), PermissionScope::accept_task(1), Some(1));

        let first = cache.get_or_mint(&auth, key(&engine), mint).unwrap();
        auth.invalidate_token(&first).unwrap();
        let second = cache.get_or_mint(&auth, key(&engine), mint).unwrap();
        assert_ne!(first.key, second.key);
    }

    #[test]
    fn expired_tokens_are_evicted() {
        let (auth, engine) = setup(AuthConfig { token_lifetime: Duration::seconds(-1), ..AuthConfig::default() });
        let cache = TokenCache::new();
        let mint = || auth.grant(Principal::new("dave"), engine.clone(), engine.clone(), PermissionScope::identify(), None);
        cache.get_or_mint(&auth, key(&engine), mint).unwrap();
        assert_eq!(cache.evict_invalid(&auth), 1);
        assert!(cache.is_empty());
    }
}
