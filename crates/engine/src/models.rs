//! Process models: the immutable graphs instances are run against.
//!
//! Models are built with [`ModelBuilder`], or loaded from a JSON
//! [`ModelDefinition`], and are validated before they can be stored.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use auth::{AuthorizationTemplate, Principal, ServiceId};
use messaging::ProcessData;
use store::{Handle, Storable};

use crate::dag::validate_model;
use crate::EngineError;

pub type NodeId = String;

// ---------------------------------------------------------------------------
// Condition
// ---------------------------------------------------------------------------

/// Guard on a node, checked when its predecessor completes (or, for joins,
/// once all predecessors are final).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    /// A boolean expression over instance inputs and predecessor results.
    Expression(String),
    /// Holds only when no sibling branch's condition holds.
    Otherwise,
}

impl Condition {
    pub fn expression(expr: impl Into<String>) -> Self {
        Self::Expression(expr.into())
    }
}

// ---------------------------------------------------------------------------
// Node kinds
// ---------------------------------------------------------------------------

/// What an activity sends when it runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityDefinition {
    /// The service that receives the message.
    pub service: ServiceId,
    pub operation: String,
    #[serde(default)]
    pub message: Vec<ProcessData>,
    /// Permissions handed to the receiver. Empty means
    /// [`AuthorizationTemplate::default_templates`].
    #[serde(default)]
    pub templates: Vec<AuthorizationTemplate>,
}

impl ActivityDefinition {
    pub fn new(service: ServiceId, operation: impl Into<String>) -> Self {
        Self { service, operation: operation.into(), message: Vec::new(), templates: Vec::new() }
    }

    pub fn effective_templates(&self) -> Vec<AuthorizationTemplate> {
        if self.templates.is_empty() {
            AuthorizationTemplate::default_templates()
        } else {
            self.templates.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    Start,
    End,
    Activity(ActivityDefinition),
    /// Fan out to between `min` and `max` enabled successors.
    Split { min: usize, max: usize },
    /// Proceed when between `min` and `max` predecessors completed.
    Join { min: usize, max: usize },
}

impl NodeKind {
    pub fn is_control(&self) -> bool {
        !matches!(self, Self::Activity(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::End => "end",
            Self::Activity(_) => "activity",
            Self::Split { .. } => "split",
            Self::Join { .. } => "join",
        }
    }
}

// ---------------------------------------------------------------------------
// ProcessNode
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessNode {
    pub id: NodeId,
    pub kind: NodeKind,
    pub predecessors: BTreeSet<NodeId>,
    pub successors: BTreeSet<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
}

impl ProcessNode {
    pub fn is_join(&self) -> bool {
        matches!(self.kind, NodeKind::Join { .. })
    }

    pub fn activity(&self) -> Option<&ActivityDefinition> {
        match &self.kind {
            NodeKind::Activity(def) => Some(def),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// ProcessModel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessModel {
    pub handle: Handle<ProcessModel>,
    pub uuid: Uuid,
    pub name: String,
    pub owner: Principal,
    /// The model this one was derived from, if any.
    pub root_model: Option<Handle<ProcessModel>>,
    pub nodes: BTreeMap<NodeId, ProcessNode>,
    pub created_at: DateTime<Utc>,
}

impl ProcessModel {
    pub fn node(&self, id: &str) -> Option<&ProcessNode> {
        self.nodes.get(id)
    }

    pub fn require_node(&self, id: &str) -> Result<&ProcessNode, EngineError> {
        self.node(id).ok_or_else(|| EngineError::UnknownNodeReference {
            node_id: id.to_string(),
            side: "model",
        })
    }

    pub fn start_node(&self) -> Option<&ProcessNode> {
        self.nodes.values().find(|n| n.kind == NodeKind::Start)
    }

    pub fn end_nodes(&self) -> impl Iterator<Item = &ProcessNode> {
        self.nodes.values().filter(|n| n.kind == NodeKind::End)
    }
}

impl Storable for ProcessModel {
    fn with_handle(mut self, handle: Handle<Self>) -> Self {
        self.handle = handle;
        self
    }
}

// ---------------------------------------------------------------------------
// Definitions and builder
// ---------------------------------------------------------------------------

/// A node as written in a model file; predecessors are derived.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDefinition {
    pub id: NodeId,
    pub kind: NodeKind,
    #[serde(default)]
    pub successors: Vec<NodeId>,
    #[serde(default)]
    pub condition: Option<Condition>,
}

/// A complete model file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDefinition {
    pub name: String,
    pub owner: Principal,
    pub nodes: Vec<NodeDefinition>,
}

impl ModelDefinition {
    pub fn build(self) -> Result<ProcessModel, EngineError> {
        let mut builder = ModelBuilder::new(self.name, self.owner);
        builder.definitions = self.nodes;
        builder.build()
    }
}

/// Assembles a [`ProcessModel`], deriving predecessor sets from the declared
/// successors.
///
/// ```
/// use engine::models::ModelBuilder;
///
/// let model = ModelBuilder::new("minimal", "alice".into())
///     .start("start", ["end"])
///     .end("end")
///     .build()
///     .unwrap();
/// assert_eq!(model.nodes["end"].predecessors.len(), 1);
/// ```
#[derive(Debug, Clone)]
pub struct ModelBuilder {
    name: String,
    owner: Principal,
    root_model: Option<Handle<ProcessModel>>,
    definitions: Vec<NodeDefinition>,
}

impl ModelBuilder {
    pub fn new(name: impl Into<String>, owner: Principal) -> Self {
        Self { name: name.into(), owner, root_model: None, definitions: Vec::new() }
    }

    pub fn root_model(mut self, root: Handle<ProcessModel>) -> Self {
        self.root_model = Some(root);
        self
    }

    pub fn node<I, S>(mut self, id: &str, kind: NodeKind, successors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<NodeId>,
    {
        self.definitions.push(NodeDefinition {
            id: id.to_string(),
            kind,
            successors: successors.into_iter().map(Into::into).collect(),
            condition: None,
        });
        self
    }

    pub fn start<I: IntoIterator<Item = &'static str>>(self, id: &str, successors: I) -> Self {
        self.node(id, NodeKind::Start, successors)
    }

    pub fn end(self, id: &str) -> Self {
        self.node(id, NodeKind::End, std::iter::empty::<NodeId>())
    }

    pub fn activity<I: IntoIterator<Item = &'static str>>(
        self,
        id: &str,
        definition: ActivityDefinition,
        successors: I,
    ) -> Self {
        self.node(id, NodeKind::Activity(definition), successors)
    }

    pub fn split<I: IntoIterator<Item = &'static str>>(self, id: &str, min: usize, max: usize, successors: I) -> Self {
        self.node(id, NodeKind::Split { min, max }, successors)
    }

    pub fn join<I: IntoIterator<Item = &'static str>>(self, id: &str, min: usize, max: usize, successors: I) -> Self {
        self.node(id, NodeKind::Join { min, max }, successors)
    }

    /// Guard the most recently added node with `condition`.
    pub fn when(mut self, condition: Condition) -> Self {
        if let Some(last) = self.definitions.last_mut() {
            last.condition = Some(condition);
        }
        self
    }

    /// Assemble and validate the model.
    ///
    /// # Errors
    /// - [`EngineError::DuplicateNodeId`] if two nodes share an id.
    /// - [`EngineError::UnknownNodeReference`] if a successor does not exist.
    /// - Any structural error reported by [`validate_model`].
    pub fn build(self) -> Result<ProcessModel, EngineError> {
        let mut nodes: BTreeMap<NodeId, ProcessNode> = BTreeMap::new();
        for def in &self.definitions {
            if nodes.contains_key(&def.id) {
                return Err(EngineError::DuplicateNodeId(def.id.clone()));
            }
            nodes.insert(
                def.id.clone(),
                ProcessNode {
                    id: def.id.clone(),
                    kind: def.kind.clone(),
                    predecessors: BTreeSet::new(),
                    successors: def.successors.iter().cloned().collect(),
                    condition: def.condition.clone(),
                },
            );
        }

        for def in &self.definitions {
            for succ in &def.successors {
                let target = nodes.get_mut(succ).ok_or_else(|| EngineError::UnknownNodeReference {
                    node_id: succ.clone(),
                    side: "successor",
                })?;
                target.predecessors.insert(def.id.clone());
            }
        }

        let model = ProcessModel {
            handle: Handle::invalid(),
            uuid: Uuid::new_v4(),
            name: self.name,
            owner: self.owner,
            root_model: self.root_model,
            nodes,
            created_at: Utc::now(),
        };
        validate_model(&model)?;
        Ok(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn predecessors_are_derived() {
        let model = ModelBuilder::new("diamond", "alice".into())
            .start("start", ["split"])
            .split("split", 2, 2, ["a", "b"])
            .node("a", NodeKind::End, std::iter::empty::<NodeId>())
            .node("b", NodeKind::End, std::iter::empty::<NodeId>())
            .build()
            .unwrap();
        assert_eq!(model.nodes["a"].predecessors, BTreeSet::from(["split".to_string()]));
        assert_eq!(model.nodes["split"].successors.len(), 2);
        assert!(!model.handle.is_valid());
        assert_eq!(model.end_nodes().count(), 2);
    }

    #[test]
    fn definition_loads_from_json() {
        let json = r#"{
            "name": "review",
            "owner": "alice",
            "nodes": [
                { "id": "start", "kind": { "type": "start" }, "successors": ["review"] },
                { "id": "review",
                  "kind": { "type": "activity", "service": "tasklist-1", "operation": "review",
                            "message": [ { "name": "subject", "content": "expense 42" } ] },
                  "successors": ["end"],
                  "condition": { "expression": "amount > 10" } },
                { "id": "end", "kind": { "type": "end" } }
            ]
        }"#;
        let def: ModelDefinition = serde_json::from_str(json).unwrap();
        let model = def.build().unwrap();
        let review = model.node("review").unwrap();
        assert_eq!(review.activity().map(|a| a.operation.as_str()), Some("review"));
        assert_eq!(review.condition, Some(Condition::expression("amount > 10")));
        assert_eq!(review.activity().unwrap().effective_templates().len(), 2);
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let result = ModelBuilder::new("dup", "alice".into())
            .start("a", ["b"])
            .end("b")
            .end("b")
            .build();
        assert!(matches!(result, Err(EngineError::DuplicateNodeId(id)) if id == "b"));
    }

    #[test]
    fn unknown_successor_is_rejected() {
        let result = ModelBuilder::new("ghost", "alice".into()).start("a", ["ghost"]).build();
        assert!(matches!(
            result,
            Err(EngineError::UnknownNodeReference { node_id, .. }) if node_id == "ghost"
        ));
    }

    #[test]
    fn stored_model_carries_its_handle() {
        let model = ModelBuilder::new("m", "alice".into()).start("s", ["e"]).end("e").build().unwrap();
        let stored = model.with_handle(Handle::new(4));
        assert_eq!(stored.handle.value(), 4);
    }
}
