//! Transport error type.

use auth::AuthError;
use thiserror::Error;

/// Errors returned by a [`MessageTransport`](crate::MessageTransport) or by
/// the task list.
///
/// A transport that reached the receiver but got a refusal should report
/// `MessageSendingResult::Failed` instead; these errors mean the message
/// could not be handled at all.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The receiver could not be reached.
    #[error("service unreachable: {0}")]
    Unreachable(String),

    /// The authorization attached to the message was not accepted.
    #[error("authorization failed: {0}")]
    Unauthorized(#[from] AuthError),

    /// No task is posted for the node instance.
    #[error("no task for node instance {0}")]
    UnknownTask(i64),

    #[error("transport state unavailable: {0}")]
    Internal(String),
}
