//! Authorization error type.
//!
//! Every variant is a denial: callers must never downgrade one of these into
//! a successful outcome.

use thiserror::Error;

use crate::ServiceId;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// The token was never issued by this service, or has been invalidated.
    #[error("unknown or revoked token")]
    UnknownToken,

    /// The presented token does not match what was issued under its key.
    #[error("token does not match the issued token")]
    TokenMismatch,

    #[error("token expired")]
    TokenExpired,

    /// The token was issued for another service.
    #[error("token is for service '{actual}', expected '{expected}'")]
    WrongService { expected: ServiceId, actual: ServiceId },

    /// The token's scope does not include the required use-scope.
    #[error("scope '{granted}' does not include '{required}'")]
    InsufficientScope { required: String, granted: String },

    /// `PermissionScope::Any` was presented as a concrete use-scope.
    #[error("the any-scope cannot be used directly")]
    AnyScopeUsed,

    #[error("unknown authorization code")]
    UnknownCode,

    /// Authorization codes are single-use.
    #[error("authorization code was already exchanged")]
    CodeAlreadyUsed,

    #[error("authorization code expired")]
    CodeExpired,

    /// The code or token is bound to a different client.
    #[error("bound to client '{expected}', presented by '{actual}'")]
    ClientMismatch { expected: ServiceId, actual: ServiceId },

    #[error("service '{0}' is not registered")]
    UnknownService(ServiceId),

    #[error("authorization state unavailable: {0}")]
    Internal(String),
}
