//! Tokens, authorization codes and the requests that produce them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{PermissionScope, Principal, ServiceId};

/// A bearer credential: `subject` may use `scope` at `target_service`,
/// presented by `client_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthToken {
    /// Opaque lookup key issued by the authorization service.
    pub key: String,
    pub subject: Principal,
    pub client_id: ServiceId,
    pub target_service: ServiceId,
    pub scope: PermissionScope,
    /// Node instance the token was issued for, if any.
    pub node_instance: Option<i64>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl AuthToken {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(false, |at| at <= now)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

/// A single-use code that can be exchanged for exactly one token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationCode {
    pub code: String,
    /// The only client allowed to exchange the code.
    pub client_id: ServiceId,
    pub node_instance: Option<i64>,
    pub expires_at: DateTime<Utc>,
}

/// A scope usable at one service, handed to the receiver of a message so it
/// can later delegate it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingPermission {
    pub service: ServiceId,
    pub scope: PermissionScope,
}

impl PendingPermission {
    /// This permission as a delegation scope: any client may receive `scope`
    /// at `service`.
    pub fn as_delegation(&self) -> PermissionScope {
        PermissionScope::Delegated(crate::DelegatedScope {
            client_id: None,
            service: Some(self.service.clone()),
            scope: Box::new(self.scope.clone()),
        })
    }
}

/// Parameters of [`AuthService::request_authorization_code`](crate::AuthService::request_authorization_code).
#[derive(Debug, Clone)]
pub struct CodeRequest {
    pub subject: Principal,
    /// The service that will exchange the code.
    pub client_id: ServiceId,
    /// The service the resulting token is usable at.
    pub target_service: ServiceId,
    pub scope: PermissionScope,
    pub node_instance: Option<i64>,
    pub pending: Vec<PendingPermission>,
}

/// Parameters of [`AuthService::exchange_delegate_token`](crate::AuthService::exchange_delegate_token).
#[derive(Debug, Clone)]
pub struct DelegationRequest {
    /// User the new token acts for.
    pub subject: Principal,
    /// Service that will present the new token.
    pub client_id: ServiceId,
    pub target_service: ServiceId,
    pub scope: PermissionScope,
}
