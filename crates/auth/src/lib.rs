//! `auth` crate — permission scopes and the token-exchange protocol.
//!
//! * [`PermissionScope`] is the closed algebra of grantable capabilities
//!   (`includes`, `intersect`, `union`).
//! * [`ScopeTemplate`]s are instantiated against a running activity to
//!   produce [`PendingPermission`]s.
//! * [`AuthService`] issues single-use authorization codes, exchanges them for
//!   tokens, mints narrower delegated tokens and validates every inbound call.

pub mod error;
pub mod principal;
pub mod scope;
pub mod template;
pub mod token;
pub mod service;
pub mod cache;

pub use error::AuthError;
pub use principal::{Principal, ServiceId, ServiceRegistry};
pub use scope::{CapabilityScope, DelegatedScope, PermissionScope, RestrictedScope};
pub use template::{instantiate_all, AuthorizationTemplate, ScopeTemplate, TemplateContext};
pub use token::{AuthToken, AuthorizationCode, CodeRequest, DelegationRequest, PendingPermission};
pub use service::{AuthConfig, AuthService};
pub use cache::{TokenCache, TokenKey};
