//! Engine-level error types.

use thiserror::Error;

use auth::AuthError;
use messaging::TransportError;
use store::StoreError;

use crate::state::NodeInstanceState;

/// Errors produced by the process engine (validation + execution).
///
/// Business outcomes (a skipped branch, a failed task, a send that needs a
/// retry) are node states, not errors. These variants mean the caller misused
/// the engine, lacks permission, or the store refused the operation.
#[derive(Debug, Error)]
pub enum EngineError {
    // ------ Validation errors ------

    /// Two or more nodes share the same ID.
    #[error("duplicate node ID: '{0}'")]
    DuplicateNodeId(String),

    /// An edge references a node ID that doesn't exist in the model.
    #[error("edge references unknown node '{node_id}' ({side} side)")]
    UnknownNodeReference {
        node_id: String,
        side: &'static str,
    },

    /// Topological sort detected a cycle.
    #[error("process model graph contains a cycle")]
    CycleDetected,

    #[error("process model has no start node")]
    MissingStartNode,

    #[error("process model has more than one start node: {0:?}")]
    MultipleStartNodes(Vec<String>),

    /// No end node can be reached from the start node.
    #[error("no end node is reachable from the start node")]
    NoReachableEnd,

    /// A node is in a shape the engine cannot run.
    #[error("invalid node '{node_id}': {reason}")]
    InvalidNode {
        node_id: String,
        reason: String,
    },

    // ------ Execution errors ------

    /// The requested state change is not in the transition table.
    #[error("node instance {node_instance} cannot move from {from} to {to}")]
    IllegalTransition {
        node_instance: i64,
        from: NodeInstanceState,
        to: NodeInstanceState,
    },

    /// The operation needs an activity but the node instance runs a control
    /// node.
    #[error("node instance {0} is not an activity")]
    NotAnActivity(i64),

    /// The process instance no longer accepts changes.
    #[error("process instance {0} is already {1}")]
    InstanceClosed(i64, crate::state::InstanceState),

    #[error("{kind} {handle} not found")]
    NotFound {
        kind: &'static str,
        handle: i64,
    },

    /// The caller's token does not authorize the operation.
    #[error("unauthorized: {0}")]
    Unauthorized(#[from] AuthError),

    /// Persistence error from the store crate.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The message transport could not handle an activity's message.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

impl EngineError {
    /// Whether re-running the whole operation in a fresh transaction may
    /// succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Store(err) if err.is_retryable())
    }
}
