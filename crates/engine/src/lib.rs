//! `engine` crate — process models, validation, node state machine and the
//! execution engine that drives process instances.

pub mod models;
pub mod error;
pub mod dag;
pub mod state;
pub mod instance;
pub mod condition;
pub mod store;
pub mod executor;

pub use models::{ActivityDefinition, Condition, ModelBuilder, ModelDefinition, NodeDefinition, NodeId, NodeKind, ProcessModel, ProcessNode};
pub use error::EngineError;
pub use dag::validate_model;
pub use state::{InstanceState, NodeInstanceState};
pub use instance::{NodeInstance, NodeInstanceBuilder, ProcessInstance, ProcessInstanceBuilder};
pub use condition::{ConditionContext, ConditionError, ConditionEvaluator, ConditionResult, ExpressionConditionEvaluator};
pub use self::store::ProcessStore;
pub use executor::{EngineConfig, ProcessEngine};
