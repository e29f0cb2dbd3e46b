//! The authorization service: issues codes and tokens and checks every
//! inbound use of a token.
//!
//! Validation fails closed. Anything the service cannot positively confirm
//! (unknown key, a token that differs from the issued copy, an expired token,
//! a token for another service, a scope that does not include the use) is an
//! [`AuthError`].

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockWriteGuard};

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::{
    AuthError, AuthToken, AuthorizationCode, CodeRequest, DelegationRequest, PendingPermission,
    PermissionScope, Principal, ServiceId, ServiceRegistry,
};

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Lifetime of tokens minted by `grant` and code exchange.
    pub token_lifetime: Duration,
    /// How long an authorization code may wait before it is exchanged.
    pub code_lifetime: Duration,
}

impl AuthConfig {
    pub fn with_token_lifetime_secs(secs: i64) -> Self {
        Self { token_lifetime: Duration::seconds(secs), ..Self::default() }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_lifetime: Duration::hours(1),
            code_lifetime: Duration::minutes(5),
        }
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct IssuedCode {
    code: AuthorizationCode,
    request: CodeRequest,
}

#[derive(Debug, Default)]
struct AuthState {
    codes: HashMap<String, IssuedCode>,
    /// Redeemed codes with their expiry; kept until then to catch replays.
    redeemed: HashMap<String, DateTime<Utc>>,
    tokens: HashMap<String, AuthToken>,
    /// Pending permissions handed over with a code, keyed by the token the
    /// code was exchanged for.
    delegable: HashMap<String, Vec<PendingPermission>>,
}

impl AuthState {
    fn drop_token(&mut self, key: &str) -> bool {
        self.delegable.remove(key);
        self.tokens.remove(key).is_some()
    }

    /// Confirm `token` is exactly what was issued and still alive.
    fn check_issued(&mut self, token: &AuthToken, now: DateTime<Utc>) -> Result<(), AuthError> {
        let stored = self.tokens.get(&token.key).ok_or(AuthError::UnknownToken)?;
        if stored != token {
            return Err(AuthError::TokenMismatch);
        }
        if stored.is_expired_at(now) {
            self.drop_token(&token.key);
            return Err(AuthError::TokenExpired);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// AuthService
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct AuthService {
    config: AuthConfig,
    services: Arc<ServiceRegistry>,
    state: RwLock<AuthState>,
}

impl AuthService {
    pub fn new(config: AuthConfig, services: Arc<ServiceRegistry>) -> Self {
        Self { config, services, state: RwLock::new(AuthState::default()) }
    }

    pub fn services(&self) -> &Arc<ServiceRegistry> {
        &self.services
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    fn state(&self) -> Result<RwLockWriteGuard<'_, AuthState>, AuthError> {
        self.state
            .write()
            .map_err(|_| AuthError::Internal("authorization state lock poisoned".into()))
    }

    #[allow(clippy::too_many_arguments)]
    fn mint(
        &self,
        state: &mut AuthState,
        subject: Principal,
        client_id: ServiceId,
        target_service: ServiceId,
        scope: PermissionScope,
        node_instance: Option<i64>,
        expires_at: Option<DateTime<Utc>>,
    ) -> AuthToken {
        let token = AuthToken {
            key: Uuid::new_v4().to_string(),
            subject,
            client_id,
            target_service,
            scope,
            node_instance,
            issued_at: Utc::now(),
            expires_at,
        };
        state.tokens.insert(token.key.clone(), token.clone());
        token
    }

    /// Issue a token directly, without the code round trip. Used for
    /// principals the host already trusts.
    #[instrument(skip(self, scope), fields(scope = %scope))]
    pub fn grant(
        &self,
        subject: Principal,
        client_id: ServiceId,
        target_service: ServiceId,
        scope: PermissionScope,
        node_instance: Option<i64>,
    ) -> Result<AuthToken, AuthError> {
        self.services.require(&target_service)?;
        let expires_at = Some(Utc::now() + self.config.token_lifetime);
        let mut state = self.state()?;
        let token = self.mint(&mut state, subject, client_id, target_service, scope, node_instance, expires_at);
        debug!(key = %token.key, "token granted");
        Ok(token)
    }

    /// Issue a single-use code the client can exchange for a token carrying
    /// `request.scope`, remembering the pending permissions to hand over.
    #[instrument(skip(self, request), fields(client = %request.client_id, node_instance = ?request.node_instance))]
    pub fn request_authorization_code(&self, request: CodeRequest) -> Result<AuthorizationCode, AuthError> {
        if request.scope.is_any() {
            return Err(AuthError::AnyScopeUsed);
        }
        self.services.require(&request.client_id)?;
        self.services.require(&request.target_service)?;
        for pending in &request.pending {
            self.services.require(&pending.service)?;
        }

        let code = AuthorizationCode {
            code: Uuid::new_v4().to_string(),
            client_id: request.client_id.clone(),
            node_instance: request.node_instance,
            expires_at: Utc::now() + self.config.code_lifetime,
        };
        self.state()?
            .codes
            .insert(code.code.clone(), IssuedCode { code: code.clone(), request });
        debug!(code = %code.code, "authorization code issued");
        Ok(code)
    }

    /// Exchange `code` for its token. Each code is redeemed at most once.
    #[instrument(skip(self, code), fields(client = %client_id))]
    pub fn exchange_authorization_code(
        &self,
        client_id: &ServiceId,
        code: &AuthorizationCode,
    ) -> Result<AuthToken, AuthError> {
        let mut state = self.state()?;
        if state.redeemed.contains_key(&code.code) {
            warn!(code = %code.code, "authorization code replayed");
            return Err(AuthError::CodeAlreadyUsed);
        }
        let issued = state.codes.get(&code.code).ok_or(AuthError::UnknownCode)?;
        if &issued.code.client_id != client_id {
            return Err(AuthError::ClientMismatch {
                expected: issued.code.client_id.clone(),
                actual: client_id.clone(),
            });
        }
        if issued.code != *code {
            return Err(AuthError::UnknownCode);
        }

        let now = Utc::now();
        let expired = issued.code.expires_at <= now;
        let IssuedCode { request, .. } = state
            .codes
            .remove(&code.code)
            .ok_or(AuthError::UnknownCode)?;
        if expired {
            warn!(code = %code.code, "authorization code expired");
            return Err(AuthError::CodeExpired);
        }
        state.redeemed.insert(code.code.clone(), code.expires_at);

        let expires_at = Some(now + self.config.token_lifetime);
        let token = self.mint(
            &mut state,
            request.subject,
            request.client_id,
            request.target_service,
            request.scope,
            request.node_instance,
            expires_at,
        );
        if !request.pending.is_empty() {
            state.delegable.insert(token.key.clone(), request.pending);
        }
        info!(key = %token.key, "authorization code exchanged");
        Ok(token)
    }

    /// The scope `holder` may delegate: its own scope plus the pending
    /// permissions it received with its code.
    pub fn delegation_envelope(&self, holder: &AuthToken) -> Result<PermissionScope, AuthError> {
        let mut state = self.state()?;
        state.check_issued(holder, Utc::now())?;
        Ok(Self::envelope_of(&state, holder))
    }

    fn envelope_of(state: &AuthState, holder: &AuthToken) -> PermissionScope {
        let pending = state.delegable.get(&holder.key).into_iter().flatten();
        PermissionScope::union_of(
            std::iter::once(holder.scope.clone()).chain(pending.map(PendingPermission::as_delegation)),
        )
    }

    /// Mint a token for `request.subject` usable at `request.target_service`,
    /// provided `holder` is allowed to delegate every part of
    /// `request.scope` there. The new token never outlives `holder`.
    #[instrument(skip(self, holder, request), fields(holder = %holder.key, subject = %request.subject, target = %request.target_service))]
    pub fn exchange_delegate_token(
        &self,
        holder: &AuthToken,
        request: DelegationRequest,
    ) -> Result<AuthToken, AuthError> {
        if request.scope.is_any() {
            return Err(AuthError::AnyScopeUsed);
        }
        self.services.require(&request.target_service)?;

        let now = Utc::now();
        let mut state = self.state()?;
        state.check_issued(holder, now)?;

        let envelope = Self::envelope_of(&state, holder);
        let general = PermissionScope::delegated_permission();
        for part in request.scope.members() {
            let wanted = general.restrict_to(request.client_id.clone(), request.target_service.clone(), part.clone());
            if !envelope.includes(&wanted) {
                warn!(wanted = %wanted, envelope = %envelope, "delegation refused");
                return Err(AuthError::InsufficientScope {
                    required: wanted.to_string(),
                    granted: envelope.to_string(),
                });
            }
        }

        let own_expiry = now + self.config.token_lifetime;
        let expires_at = Some(holder.expires_at.map_or(own_expiry, |h| h.min(own_expiry)));
        let token = self.mint(
            &mut state,
            request.subject,
            request.client_id,
            request.target_service,
            request.scope,
            holder.node_instance,
            expires_at,
        );
        info!(key = %token.key, "delegated token minted");
        Ok(token)
    }

    /// Check that `token` may use `required` at `expected_service`.
    ///
    /// An expired token is invalidated as a side effect.
    pub fn validate_auth_info(
        &self,
        token: &AuthToken,
        expected_service: &ServiceId,
        required: &PermissionScope,
    ) -> Result<(), AuthError> {
        let result = self.check(token, expected_service, required);
        if let Err(err) = &result {
            warn!(key = %token.key, service = %expected_service, required = %required, error = %err, "authorization denied");
        }
        result
    }

    fn check(
        &self,
        token: &AuthToken,
        expected_service: &ServiceId,
        required: &PermissionScope,
    ) -> Result<(), AuthError> {
        if required.is_any() {
            return Err(AuthError::AnyScopeUsed);
        }
        self.state()?.check_issued(token, Utc::now())?;
        if &token.target_service != expected_service {
            return Err(AuthError::WrongService {
                expected: expected_service.clone(),
                actual: token.target_service.clone(),
            });
        }
        if !token.scope.includes(required) {
            return Err(AuthError::InsufficientScope {
                required: required.to_string(),
                granted: token.scope.to_string(),
            });
        }
        Ok(())
    }

    /// Whether `token` is issued, unchanged and unexpired.
    pub fn is_valid(&self, token: &AuthToken) -> bool {
        self.state()
            .and_then(|mut state| state.check_issued(token, Utc::now()))
            .is_ok()
    }

    /// Revoke `token`. Returns whether it was known.
    pub fn invalidate_token(&self, token: &AuthToken) -> Result<bool, AuthError> {
        let removed = self.state()?.drop_token(&token.key);
        if removed {
            debug!(key = %token.key, "token invalidated");
        }
        Ok(removed)
    }

    /// Drop every expired token and code. Returns how many tokens were
    /// removed.
    pub fn purge_expired(&self) -> Result<usize, AuthError> {
        self.purge_expired_at(Utc::now())
    }

    fn purge_expired_at(&self, now: DateTime<Utc>) -> Result<usize, AuthError> {
        let mut state = self.state()?;
        let expired: Vec<String> = state
            .tokens
            .values()
            .filter(|t| t.is_expired_at(now))
            .map(|t| t.key.clone())
            .collect();
        for key in &expired {
            state.drop_token(key);
        }
        state.codes.retain(|_, issued| issued.code.expires_at > now);
        state.redeemed.retain(|_, expires_at| *expires_at > now);
        if !expired.is_empty() {
            debug!(count = expired.len(), "expired tokens purged");
        }
        Ok(expired.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        auth: AuthService,
        engine: ServiceId,
        tasklist: ServiceId,
    }

    fn fixture(config: AuthConfig) -> Fixture {
        let services = Arc::new(ServiceRegistry::new());
        let engine = services.register("engine").unwrap();
        let tasklist = services.register("tasklist").unwrap();
        Fixture { auth: AuthService::new(config, services), engine, tasklist }
    }

    fn code_request(f: &Fixture, node_instance: i64) -> CodeRequest {
        CodeRequest {
            subject: Principal::new("alice"),
            client_id: f.tasklist.clone(),
            target_service: f.engine.clone(),
            scope: PermissionScope::identify(),
            node_instance: Some(node_instance),
            pending: vec![
                PendingPermission { service: f.engine.clone(), scope: PermissionScope::accept_task(node_instance) },
                PendingPermission {
                    service: f.engine.clone(),
                    scope: PermissionScope::update_activity_state(node_instance),
                },
            ],
        }
    }

    #[test]
    fn granted_scope_validates() {
        let f = fixture(AuthConfig::default());
        let scope = PermissionScope::accept_task(3);
        let token = f
            .auth
            .grant(Principal::new("bob"), f.tasklist.clone(), f.engine.clone(), scope.clone(), Some(3))
            .unwrap();
        assert_eq!(f.auth.validate_auth_info(&token, &f.engine, &scope), Ok(()));
        assert!(matches!(
            f.auth.validate_auth_info(&token, &f.engine, &PermissionScope::accept_task(4)),
            Err(AuthError::InsufficientScope { .. })
        ));
        assert_eq!(
            f.auth.validate_auth_info(&token, &f.engine, &PermissionScope::Any),
            Err(AuthError::AnyScopeUsed)
        );
    }

    #[test]
    fn token_for_other_service_is_rejected() {
        let f = fixture(AuthConfig::default());
        let token = f
            .auth
            .grant(Principal::new("bob"), f.engine.clone(), f.tasklist.clone(), PermissionScope::identify(), None)
            .unwrap();
        assert!(matches!(
            f.auth.validate_auth_info(&token, &f.engine, &PermissionScope::identify()),
            Err(AuthError::WrongService { .. })
        ));
    }

    #[test]
    fn tampered_and_revoked_tokens_fail_closed() {
        let f = fixture(AuthConfig::default());
        let token = f
            .auth
            .grant(Principal::new("bob"), f.tasklist.clone(), f.engine.clone(), PermissionScope::accept_task(1), None)
            .unwrap();

        let mut forged = token.clone();
        forged.scope = PermissionScope::capability("accept_task");
        assert_eq!(
            f.auth.validate_auth_info(&forged, &f.engine, &PermissionScope::accept_task(2)),
            Err(AuthError::TokenMismatch)
        );

        assert_eq!(f.auth.invalidate_token(&token), Ok(true));
        assert_eq!(
            f.auth.validate_auth_info(&token, &f.engine, &PermissionScope::accept_task(1)),
            Err(AuthError::UnknownToken)
        );
    }

    #[test]
    fn codes_are_single_use() {
        let f = fixture(AuthConfig::default());
        let code = f.auth.request_authorization_code(code_request(&f, 9)).unwrap();

        let token = f.auth.exchange_authorization_code(&f.tasklist, &code).unwrap();
        assert_eq!(token.node_instance, Some(9));
        assert_eq!(token.client_id, f.tasklist);
        assert_eq!(
            f.auth.exchange_authorization_code(&f.tasklist, &code),
            Err(AuthError::CodeAlreadyUsed)
        );
    }

    #[test]
    fn codes_are_bound_to_their_client() {
        let f = fixture(AuthConfig::default());
        let code = f.auth.request_authorization_code(code_request(&f, 9)).unwrap();
        assert!(matches!(
            f.auth.exchange_authorization_code(&f.engine, &code),
            Err(AuthError::ClientMismatch { .. })
        ));
        assert!(f.auth.exchange_authorization_code(&f.tasklist, &code).is_ok());
    }

    #[test]
    fn code_requests_are_checked() {
        let f = fixture(AuthConfig::default());
        let mut any = code_request(&f, 1);
        any.scope = PermissionScope::Any;
        assert_eq!(f.auth.request_authorization_code(any), Err(AuthError::AnyScopeUsed));

        let mut unknown = code_request(&f, 1);
        unknown.client_id = ServiceId::new("ghost-1");
        assert!(matches!(
            f.auth.request_authorization_code(unknown),
            Err(AuthError::UnknownService(_))
        ));
    }

    #[test]
    fn expired_code_cannot_be_exchanged() {
        let f = fixture(AuthConfig { code_lifetime: Duration::seconds(-1), ..AuthConfig::default() });
        let code = f.auth.request_authorization_code(code_request(&f, 1)).unwrap();
        assert_eq!(f.auth.exchange_authorization_code(&f.tasklist, &code), Err(AuthError::CodeExpired));
        assert_eq!(f.auth.exchange_authorization_code(&f.tasklist, &code), Err(AuthError::UnknownCode));
    }

    #[test]
    fn delegation_stays_within_pending_permissions() {
        let f = fixture(AuthConfig::default());
        let code = f.auth.request_authorization_code(code_request(&f, 5)).unwrap();
        let holder = f.auth.exchange_authorization_code(&f.tasklist, &code).unwrap();

        let scope = PermissionScope::accept_task(5).union(&PermissionScope::update_activity_state(5));
        let user_token = f
            .auth
            .exchange_delegate_token(
                &holder,
                DelegationRequest {
                    subject: Principal::new("carol"),
                    client_id: f.tasklist.clone(),
                    target_service: f.engine.clone(),
                    scope: scope.clone(),
                },
            )
            .unwrap();
        assert_eq!(user_token.subject, Principal::new("carol"));
        assert!(user_token.expires_at <= holder.expires_at);
        assert_eq!(f.auth.validate_auth_info(&user_token, &f.engine, &PermissionScope::accept_task(5)), Ok(()));

        let too_wide = f.auth.exchange_delegate_token(
            &holder,
            DelegationRequest {
                subject: Principal::new("carol"),
                client_id: f.tasklist.clone(),
                target_service: f.engine.clone(),
                scope: PermissionScope::accept_task(6),
            },
        );
        assert!(matches!(too_wide, Err(AuthError::InsufficientScope { .. })));
    }

    #[test]
    fn expired_tokens_are_invalidated_on_use() {
        let f = fixture(AuthConfig { token_lifetime: Duration::seconds(-1), ..AuthConfig::default() });
        let token = f
            .auth
            .grant(Principal::new("bob"), f.tasklist.clone(), f.engine.clone(), PermissionScope::identify(), None)
            .unwrap();
        assert_eq!(
            f.auth.validate_auth_info(&token, &f.engine, &PermissionScope::identify()),
            Err(AuthError::TokenExpired)
        );
        assert_eq!(
            f.auth.validate_auth_info(&token, &f.engine, &PermissionScope::identify()),
            Err(AuthError::UnknownToken)
        );
    }

    #[test]
    fn purge_removes_expired_tokens() {
        let f = fixture(AuthConfig { token_lifetime: Duration::seconds(-1), ..AuthConfig::default() });
        for _ in 0..3 {
            f.auth
                .grant(Principal::new("bob"), f.tasklist.clone(), f.engine.clone(), PermissionScope::identify(), None)
                .unwrap();
        }
        assert_eq!(f.auth.purge_expired(), Ok(3));
        assert_eq!(f.auth.purge_expired(), Ok(0));
    }

    #[test]
    fn purge_forgets_redeemed_codes_once_expired() {
        let f = fixture(AuthConfig::default());
        let code = f.auth.request_authorization_code(code_request(&f, 4)).unwrap();
        f.auth.exchange_authorization_code(&f.tasklist, &code).unwrap();

        f.auth.purge_expired().unwrap();
        assert_eq!(f.auth.state().unwrap().redeemed.len(), 1);

        let later = code.expires_at + Duration::seconds(1);
        assert_eq!(f.auth.purge_expired_at(later), Ok(0), "token outlives the code");
        assert!(f.auth.state().unwrap().redeemed.is_empty());
        assert!(f.auth.exchange_authorization_code(&f.tasklist, &code).is_err());
    }
}
