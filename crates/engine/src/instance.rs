//! Process instances and node instances.
//!
//! Both are immutable snapshots. Changes go through a builder created from
//! the current snapshot; `build()` yields the next snapshot, which the engine
//! writes back through the store.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use auth::Principal;
use messaging::ProcessData;
use store::{Handle, Storable};

use crate::models::{NodeId, ProcessModel};
use crate::state::{InstanceState, NodeInstanceState};
use crate::EngineError;

// ---------------------------------------------------------------------------
// ProcessInstance
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessInstance {
    pub handle: Handle<ProcessInstance>,
    pub process_model: Handle<ProcessModel>,
    pub owner: Principal,
    pub uuid: Uuid,
    pub name: String,
    pub state: InstanceState,
    pub child_nodes: BTreeSet<Handle<NodeInstance>>,
    /// The activity that started this instance as a sub-process.
    pub parent_activity: Option<Handle<NodeInstance>>,
    pub inputs: Vec<ProcessData>,
}

impl ProcessInstance {
    pub fn builder(&self) -> ProcessInstanceBuilder {
        ProcessInstanceBuilder { inner: self.clone() }
    }
}

impl Storable for ProcessInstance {
    fn with_handle(mut self, handle: Handle<Self>) -> Self {
        self.handle = handle;
        self
    }
}

#[derive(Debug, Clone)]
pub struct ProcessInstanceBuilder {
    inner: ProcessInstance,
}

impl ProcessInstanceBuilder {
    pub fn new(process_model: Handle<ProcessModel>, owner: Principal, name: impl Into<String>) -> Self {
        Self {
            inner: ProcessInstance {
                handle: Handle::invalid(),
                process_model,
                owner,
                uuid: Uuid::new_v4(),
                name: name.into(),
                state: InstanceState::Initialized,
                child_nodes: BTreeSet::new(),
                parent_activity: None,
                inputs: Vec::new(),
            },
        }
    }

    pub fn inputs(mut self, inputs: Vec<ProcessData>) -> Self {
        self.inner.inputs = inputs;
        self
    }

    pub fn parent_activity(mut self, parent: Handle<NodeInstance>) -> Self {
        self.inner.parent_activity = Some(parent);
        self
    }

    pub fn state(mut self, state: InstanceState) -> Self {
        self.inner.state = state;
        self
    }

    pub fn add_child(mut self, child: Handle<NodeInstance>) -> Self {
        self.inner.child_nodes.insert(child);
        self
    }

    pub fn build(self) -> ProcessInstance {
        self.inner
    }
}

// ---------------------------------------------------------------------------
// NodeInstance
// ---------------------------------------------------------------------------

/// One occurrence of a model node within a process instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInstance {
    pub handle: Handle<NodeInstance>,
    pub process_instance: Handle<ProcessInstance>,
    pub node: NodeId,
    /// Distinguishes repeated occurrences of the same node.
    pub entry_no: u32,
    pub state: NodeInstanceState,
    pub predecessors: BTreeSet<Handle<NodeInstance>>,
    pub assigned_user: Option<Principal>,
    /// Only set once the state is final.
    pub results: Vec<ProcessData>,
    /// Why the last attempt failed, for `Failed` and `FailRetry`.
    pub failure: Option<String>,
}

impl NodeInstance {
    pub fn builder(&self) -> NodeInstanceBuilder {
        NodeInstanceBuilder { inner: self.clone() }
    }
}

impl Storable for NodeInstance {
    fn with_handle(mut self, handle: Handle<Self>) -> Self {
        self.handle = handle;
        self
    }
}

/// Builder for the next [`NodeInstance`] snapshot. Every state change is
/// checked against the transition table.
#[derive(Debug, Clone)]
pub struct NodeInstanceBuilder {
    inner: NodeInstance,
}

impl NodeInstanceBuilder {
    pub fn new(process_instance: Handle<ProcessInstance>, node: impl Into<NodeId>, entry_no: u32) -> Self {
        Self {
            inner: NodeInstance {
                handle: Handle::invalid(),
                process_instance,
                node: node.into(),
                entry_no,
                state: NodeInstanceState::Pending,
                predecessors: BTreeSet::new(),
                assigned_user: None,
                results: Vec::new(),
                failure: None,
            },
        }
    }

    pub fn state(&self) -> NodeInstanceState {
        self.inner.state
    }

    pub fn add_predecessor(mut self, predecessor: Handle<NodeInstance>) -> Self {
        self.inner.predecessors.insert(predecessor);
        self
    }

    pub fn assigned_user(mut self, user: Principal) -> Self {
        self.inner.assigned_user = Some(user);
        self
    }

    /// Move to `next`.
    ///
    /// # Errors
    /// [`EngineError::IllegalTransition`] if the table does not allow it.
    pub fn transition(mut self, next: NodeInstanceState) -> Result<Self, EngineError> {
        if !self.inner.state.can_transition_to(next) {
            return Err(EngineError::IllegalTransition {
                node_instance: self.inner.handle.value(),
                from: self.inner.state,
                to: next,
            });
        }
        if next == NodeInstanceState::Sent {
            // A new attempt.
            self.inner.failure = None;
        }
        self.inner.state = next;
        Ok(self)
    }

    /// Walk `states` in order.
    pub fn walk(self, states: &[NodeInstanceState]) -> Result<Self, EngineError> {
        states.iter().try_fold(self, |builder, &next| builder.transition(next))
    }

    /// Move to `Complete` with `results`.
    pub fn complete(self, results: Vec<ProcessData>) -> Result<Self, EngineError> {
        let mut builder = self.transition(NodeInstanceState::Complete)?;
        builder.inner.results = results;
        Ok(builder)
    }

    /// Move to `Failed` or `FailRetry`, recording why.
    pub fn fail(self, next: NodeInstanceState, reason: impl Into<String>) -> Result<Self, EngineError> {
        let mut builder = self.transition(next)?;
        builder.inner.failure = Some(reason.into());
        Ok(builder)
    }

    pub fn build(self) -> NodeInstance {
        self.inner
    }
}
