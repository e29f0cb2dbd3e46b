//! Process execution engine.
//!
//! `ProcessEngine` is the central orchestrator:
//! 1. Stores validated process models and starts instances of them.
//! 2. Drives node instances through the state machine, automatically
//!    running control nodes and evaluating branch conditions.
//! 3. Sends each activity's message through the `MessageTransport` together
//!    with an authorization code for the receiver.
//! 4. Checks the caller's token on every externally triggered transition.
//! 5. Settles the process instance once none of its nodes can move anymore.
//!
//! Every operation works inside a caller-supplied [`Transaction`]; nothing is
//! visible to other transactions until [`ProcessEngine::commit`].

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;

use chrono::Duration;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use auth::{instantiate_all, AuthConfig, AuthService, AuthToken, CodeRequest, PermissionScope, ServiceId, TemplateContext};
use messaging::{ActivityContext, MessageSendingResult, MessageTransport, OutboundMessage, ProcessData, TransportError};
use store::{Handle, HandleMap, Transaction};

use crate::condition::{ConditionContext, ConditionEvaluator, ConditionResult, ExpressionConditionEvaluator};
use crate::dag::validate_model;
use crate::instance::{NodeInstance, NodeInstanceBuilder, ProcessInstance, ProcessInstanceBuilder};
use crate::models::{ActivityDefinition, NodeId, NodeKind, ProcessModel, ProcessNode};
use crate::state::{InstanceState, NodeInstanceState};
use crate::store::ProcessStore;
use crate::EngineError;

use NodeInstanceState::*;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Tuning knobs for the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Values each store map keeps cached.
    pub cache_capacity: usize,
    /// Lifetime of tokens issued by the authorization service.
    pub token_lifetime_secs: i64,
    /// How long an activity's authorization code stays exchangeable.
    pub code_lifetime_secs: i64,
    /// Principal used by hosts that act on behalf of nobody in particular.
    pub default_user: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_capacity: 1024,
            token_lifetime_secs: 3600,
            code_lifetime_secs: 300,
            default_user: "operator".into(),
        }
    }
}

impl EngineConfig {
    pub fn auth_config(&self) -> AuthConfig {
        AuthConfig {
            token_lifetime: Duration::seconds(self.token_lifetime_secs),
            code_lifetime: Duration::seconds(self.code_lifetime_secs),
        }
    }
}

// ---------------------------------------------------------------------------
// Work items
// ---------------------------------------------------------------------------

/// Control nodes run through these states before completing.
const CONTROL_WALK: [NodeInstanceState; 4] = [Sent, Acknowledged, Taken, Started];

/// What happens next to a node instance during auto-progression.
#[derive(Debug, Clone, Copy)]
enum Step {
    /// A pending node whose predecessors allow it to run.
    Activate(Handle<NodeInstance>),
    /// A node that just became final; its successors must react.
    Settled(Handle<NodeInstance>),
}

/// How a completed node affects one successor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Enabled,
    Skip(NodeInstanceState),
}

// ---------------------------------------------------------------------------
// ProcessEngine
// ---------------------------------------------------------------------------

pub struct ProcessEngine {
    store: ProcessStore,
    auth: Arc<AuthService>,
    transport: Arc<dyn MessageTransport>,
    conditions: Arc<dyn ConditionEvaluator>,
    service_id: ServiceId,
    config: EngineConfig,
}

impl ProcessEngine {
    /// Create an engine with an in-memory store, registered with `auth` as a
    /// new `engine-N` service.
    pub fn new(
        config: EngineConfig,
        auth: Arc<AuthService>,
        transport: Arc<dyn MessageTransport>,
    ) -> Result<Self, EngineError> {
        let store = ProcessStore::in_memory(config.cache_capacity)?;
        let service_id = auth.services().register("engine")?;
        info!(service = %service_id, "process engine created");
        Ok(Self {
            store,
            auth,
            transport,
            conditions: Arc::new(ExpressionConditionEvaluator),
            service_id,
            config,
        })
    }

    /// Replace the condition evaluator.
    pub fn with_condition_evaluator(mut self, conditions: Arc<dyn ConditionEvaluator>) -> Self {
        self.conditions = conditions;
        self
    }

    pub fn service_id(&self) -> &ServiceId {
        &self.service_id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn auth(&self) -> &Arc<AuthService> {
        &self.auth
    }

    pub fn store(&self) -> &ProcessStore {
        &self.store
    }

    // -----------------------------------------------------------------------
    // Transactions
    // -----------------------------------------------------------------------

    pub fn begin(&self) -> Transaction {
        self.store.begin()
    }

    pub fn commit(&self, tx: Transaction) -> Result<(), EngineError> {
        Ok(self.store.commit(tx)?)
    }

    pub fn rollback(&self, tx: Transaction) {
        self.store.rollback(tx)
    }

    fn authorize(&self, token: &AuthToken, required: PermissionScope) -> Result<(), EngineError> {
        self.auth.validate_auth_info(token, &self.service_id, &required)?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Models
    // -----------------------------------------------------------------------

    /// Validate and store `model`.
    #[instrument(skip(self, tx, model), fields(model = %model.name))]
    pub fn add_process_model(&self, tx: &mut Transaction, model: ProcessModel) -> Result<Handle<ProcessModel>, EngineError> {
        let order = validate_model(&model)?;
        let handle = self.store.models().put(tx, model)?;
        info!(%handle, nodes = order.len(), "process model added");
        Ok(handle)
    }

    pub fn process_model(&self, tx: &mut Transaction, handle: Handle<ProcessModel>) -> Result<ProcessModel, EngineError> {
        self.store.model(tx, handle)
    }

    // -----------------------------------------------------------------------
    // Instances
    // -----------------------------------------------------------------------

    /// Start an instance of `model` owned by the token's subject and run it
    /// until it waits for outside input.
    #[instrument(skip(self, tx, token, model, inputs), fields(subject = %token.subject, model = %model))]
    pub async fn start_process(
        &self,
        tx: &mut Transaction,
        token: &AuthToken,
        model: Handle<ProcessModel>,
        name: &str,
        inputs: Vec<ProcessData>,
    ) -> Result<Handle<ProcessInstance>, EngineError> {
        self.authorize(token, PermissionScope::start_process(Some(model.value())))?;
        let process_model = self.store.model(tx, model)?;
        let start = process_model.start_node().ok_or(EngineError::MissingStartNode)?;

        let instance = ProcessInstanceBuilder::new(model, token.subject.clone(), name)
            .inputs(inputs)
            .build();
        let instance_h = self.store.instances().put(tx, instance)?;
        let start_h = self.add_node(tx, instance_h, NodeInstanceBuilder::new(instance_h, start.id.clone(), 1).build())?;

        let started = self.store.instance(tx, instance_h)?.builder().state(InstanceState::Started).build();
        self.store.instances().set(tx, instance_h, started)?;
        info!(instance = %instance_h, "process instance started");

        self.drive(tx, instance_h, vec![Step::Activate(start_h)]).await?;
        Ok(instance_h)
    }

    pub fn process_instance(
        &self,
        tx: &mut Transaction,
        handle: Handle<ProcessInstance>,
    ) -> Result<ProcessInstance, EngineError> {
        self.store.instance(tx, handle)
    }

    pub fn node_instance(&self, tx: &mut Transaction, handle: Handle<NodeInstance>) -> Result<NodeInstance, EngineError> {
        self.store.node(tx, handle)
    }

    /// Every node instance of `instance`, in creation order.
    pub fn node_instances(
        &self,
        tx: &mut Transaction,
        instance: Handle<ProcessInstance>,
    ) -> Result<Vec<NodeInstance>, EngineError> {
        let instance = self.store.instance(tx, instance)?;
        self.store.nodes_of(tx, &instance)
    }

    /// The most recent node instance of model node `node_id`, if any.
    pub fn node_instance_by_id(
        &self,
        tx: &mut Transaction,
        instance: Handle<ProcessInstance>,
        node_id: &str,
    ) -> Result<Option<NodeInstance>, EngineError> {
        Ok(self
            .node_instances(tx, instance)?
            .into_iter()
            .filter(|n| n.node == node_id)
            .max_by_key(|n| n.entry_no))
    }

    // -----------------------------------------------------------------------
    // Task operations
    // -----------------------------------------------------------------------

    /// Load a node instance whose process instance still accepts changes.
    fn open_node(&self, tx: &mut Transaction, handle: Handle<NodeInstance>) -> Result<(NodeInstance, ProcessInstance), EngineError> {
        let node = self.store.node(tx, handle)?;
        let instance = self.store.instance(tx, node.process_instance)?;
        if instance.state.is_final() {
            return Err(EngineError::InstanceClosed(instance.handle.value(), instance.state));
        }
        Ok((node, instance))
    }

    fn require_activity(&self, tx: &mut Transaction, node: &NodeInstance, instance: &ProcessInstance) -> Result<(), EngineError> {
        let model = self.store.model(tx, instance.process_model)?;
        match model.require_node(&node.node)?.kind {
            NodeKind::Activity(_) => Ok(()),
            _ => Err(EngineError::NotAnActivity(node.handle.value())),
        }
    }

    fn save(&self, tx: &mut Transaction, node: NodeInstance) -> Result<(), EngineError> {
        self.store.nodes().set(tx, node.handle, node)?;
        Ok(())
    }

    /// The receiver confirms it got the activity's message.
    #[instrument(skip(self, tx, token, node), fields(node_instance = %node))]
    pub fn message_acknowledged(&self, tx: &mut Transaction, token: &AuthToken, node: Handle<NodeInstance>) -> Result<(), EngineError> {
        self.authorize(token, PermissionScope::update_activity_state(node.value()))?;
        let (current, _) = self.open_node(tx, node)?;
        self.save(tx, current.builder().transition(Acknowledged)?.build())?;
        debug!("message acknowledged");
        Ok(())
    }

    /// Claim the task for the token's subject.
    #[instrument(skip(self, tx, token, node), fields(node_instance = %node, user = %token.subject))]
    pub fn accept_task(&self, tx: &mut Transaction, token: &AuthToken, node: Handle<NodeInstance>) -> Result<(), EngineError> {
        self.authorize(token, PermissionScope::accept_task(node.value()))?;
        let (current, instance) = self.open_node(tx, node)?;
        self.require_activity(tx, &current, &instance)?;

        let mut builder = current.builder();
        if builder.state() == Sent {
            builder = builder.transition(Acknowledged)?;
        }
        let taken = builder.transition(Taken)?.assigned_user(token.subject.clone()).build();
        self.save(tx, taken)?;
        info!("task taken");
        Ok(())
    }

    #[instrument(skip(self, tx, token, node), fields(node_instance = %node))]
    pub fn start_task(&self, tx: &mut Transaction, token: &AuthToken, node: Handle<NodeInstance>) -> Result<(), EngineError> {
        self.authorize(token, PermissionScope::update_activity_state(node.value()))?;
        let (current, _) = self.open_node(tx, node)?;
        self.save(tx, current.builder().transition(Started)?.build())?;
        debug!("task started");
        Ok(())
    }

    /// Complete a started task with `results` and advance the instance.
    #[instrument(skip(self, tx, token, node, results), fields(node_instance = %node))]
    pub async fn finish_task(
        &self,
        tx: &mut Transaction,
        token: &AuthToken,
        node: Handle<NodeInstance>,
        results: Vec<ProcessData>,
    ) -> Result<(), EngineError> {
        self.authorize(token, PermissionScope::update_activity_state(node.value()))?;
        let (current, instance) = self.open_node(tx, node)?;
        self.save(tx, current.builder().complete(results)?.build())?;
        info!("task finished");
        self.drive(tx, instance.handle, vec![Step::Settled(node)]).await
    }

    /// Fail a task; its successors are skipped.
    #[instrument(skip(self, tx, token, node), fields(node_instance = %node))]
    pub async fn fail_task(
        &self,
        tx: &mut Transaction,
        token: &AuthToken,
        node: Handle<NodeInstance>,
        reason: &str,
    ) -> Result<(), EngineError> {
        self.authorize(token, PermissionScope::update_activity_state(node.value()))?;
        let (current, instance) = self.open_node(tx, node)?;
        self.save(tx, current.builder().fail(Failed, reason)?.build())?;
        warn!(reason, "task failed");
        self.drive(tx, instance.handle, vec![Step::Settled(node)]).await
    }

    /// Send a `FailRetry` (or still pending) activity's message again.
    #[instrument(skip(self, tx, token, node), fields(node_instance = %node))]
    pub async fn retry_node(&self, tx: &mut Transaction, token: &AuthToken, node: Handle<NodeInstance>) -> Result<(), EngineError> {
        self.authorize(token, PermissionScope::update_activity_state(node.value()))?;
        let (current, instance) = self.open_node(tx, node)?;
        self.require_activity(tx, &current, &instance)?;
        if !current.state.can_restart() {
            return Err(EngineError::IllegalTransition { node_instance: node.value(), from: current.state, to: Sent });
        }
        info!("retrying activity");
        self.drive(tx, instance.handle, vec![Step::Activate(node)]).await
    }

    /// The state a node moves to when cancelled directly.
    fn cancelled(node: NodeInstance) -> Result<NodeInstance, EngineError> {
        let target = if node.state.can_restart() { SkippedCancel } else { Cancelled };
        Ok(node.builder().transition(target)?.build())
    }

    /// Cancel one node instance. Nodes that depend on it are skipped within
    /// the same transaction.
    #[instrument(skip(self, tx, token, node), fields(node_instance = %node))]
    pub async fn cancel_node(&self, tx: &mut Transaction, token: &AuthToken, node: Handle<NodeInstance>) -> Result<(), EngineError> {
        let current = self.store.node(tx, node)?;
        self.authorize(token, PermissionScope::cancel_process(Some(current.process_instance.value())))?;
        let (current, instance) = self.open_node(tx, node)?;
        self.save(tx, Self::cancelled(current)?)?;
        info!("node cancelled");
        self.drive(tx, instance.handle, vec![Step::Settled(node)]).await
    }

    /// Cancel every open node instance and close the instance as cancelled.
    #[instrument(skip(self, tx, token, instance), fields(instance = %instance))]
    pub async fn cancel_instance(
        &self,
        tx: &mut Transaction,
        token: &AuthToken,
        instance: Handle<ProcessInstance>,
    ) -> Result<(), EngineError> {
        self.authorize(token, PermissionScope::cancel_process(Some(instance.value())))?;
        let current = self.store.instance(tx, instance)?;
        if current.state.is_final() {
            return Err(EngineError::InstanceClosed(instance.value(), current.state));
        }
        let nodes = self.store.nodes_of(tx, &current)?;
        self.store
            .instances()
            .set(tx, instance, current.builder().state(InstanceState::Cancelled).build())?;

        let mut steps = Vec::new();
        for node in nodes.into_iter().filter(|n| !n.state.is_final()) {
            let handle = node.handle;
            self.save(tx, Self::cancelled(node)?)?;
            steps.push(Step::Settled(handle));
        }
        info!(cancelled = steps.len(), "process instance cancelled");
        self.drive(tx, instance, steps).await
    }

    // -----------------------------------------------------------------------
    // Auto-progression
    // -----------------------------------------------------------------------

    /// Run `initial` and everything it enables until no node can move
    /// without outside input, then settle the instance state.
    async fn drive(&self, tx: &mut Transaction, instance: Handle<ProcessInstance>, initial: Vec<Step>) -> Result<(), EngineError> {
        let mut work: VecDeque<Step> = initial.into();
        while let Some(step) = work.pop_front() {
            match step {
                Step::Activate(node) => {
                    if let Some(next) = self.activate(tx, node).await? {
                        work.push_back(next);
                    }
                }
                Step::Settled(node) => work.extend(self.propagate(tx, node)?),
            }
        }
        self.settle_instance(tx, instance)
    }

    /// Run a pending node: control nodes walk to a final state at once,
    /// activities send their message.
    async fn activate(&self, tx: &mut Transaction, handle: Handle<NodeInstance>) -> Result<Option<Step>, EngineError> {
        let node = self.store.node(tx, handle)?;
        let instance = self.store.instance(tx, node.process_instance)?;
        let model = self.store.model(tx, instance.process_model)?;
        let model_node = model.require_node(&node.node)?;

        match &model_node.kind {
            NodeKind::Activity(definition) => {
                self.send_activity(tx, &instance, &model, node, definition).await?;
                Ok(None)
            }
            NodeKind::Split { min, .. } => {
                let data = self.accumulated_data(tx, &instance, &node)?;
                let enabled = self
                    .branch_outcomes(&model, model_node, &data)?
                    .iter()
                    .filter(|(_, outcome)| *outcome == Outcome::Enabled)
                    .count();
                let walked = node.builder().walk(&CONTROL_WALK)?;
                let done = if enabled < *min {
                    warn!(split = %model_node.id, enabled, min, "split has too few enabled branches");
                    walked.fail(Failed, format!("{enabled} branches enabled, at least {min} required"))?
                } else {
                    walked.complete(Vec::new())?
                };
                self.save(tx, done.build())?;
                Ok(Some(Step::Settled(handle)))
            }
            _ => {
                let done = node.builder().walk(&CONTROL_WALK)?.complete(Vec::new())?;
                self.save(tx, done.build())?;
                debug!(node = %model_node.id, kind = model_node.kind.label(), "control node completed");
                Ok(Some(Step::Settled(handle)))
            }
        }
    }

    async fn send_activity(
        &self,
        tx: &mut Transaction,
        instance: &ProcessInstance,
        model: &ProcessModel,
        node: NodeInstance,
        definition: &ActivityDefinition,
    ) -> Result<(), EngineError> {
        let template_ctx = TemplateContext {
            engine_service: self.service_id.clone(),
            node_instance: node.handle.value(),
            process_instance: instance.handle.value(),
            owner: instance.owner.clone(),
            assigned_user: node.assigned_user.clone(),
        };
        let pending = instantiate_all(&definition.effective_templates(), &template_ctx);
        let code = self.auth.request_authorization_code(CodeRequest {
            subject: instance.owner.clone(),
            client_id: definition.service.clone(),
            target_service: self.service_id.clone(),
            scope: PermissionScope::identify(),
            node_instance: Some(node.handle.value()),
            pending,
        })?;

        let context = ActivityContext {
            process_instance: instance.handle.value(),
            node_instance: node.handle.value(),
            node_id: node.node.clone(),
            process_name: instance.name.clone(),
            owner: instance.owner.clone(),
            data: self.accumulated_data(tx, instance, &node)?,
        };
        let message = OutboundMessage {
            service: definition.service.clone(),
            operation: definition.operation.clone(),
            content: definition.message.clone(),
        };

        let result = self
            .transport
            .send_message(&self.service_id, &message, &context, Some(&code))
            .await;
        let builder = node.builder();
        let next = match result {
            Ok(MessageSendingResult::Sent) => builder.transition(Sent)?,
            Ok(MessageSendingResult::Acknowledged) => builder.walk(&[Sent, Acknowledged])?,
            Ok(MessageSendingResult::Failed(reason)) | Err(TransportError::Unreachable(reason)) => {
                warn!(node = %context.node_id, model = %model.name, %reason, "activity message not delivered");
                builder.fail(FailRetry, reason)?
            }
            Err(other) => return Err(other.into()),
        };
        let next = next.build();
        info!(node = %context.node_id, state = %next.state, "activity message sent");
        self.save(tx, next)
    }

    /// Decide which successors of `node` run.
    ///
    /// Successors without a condition and joins are enabled. `Otherwise`
    /// holds only if no sibling evaluated true. A split enables at most `max`
    /// successors, in id order; the surplus is skipped.
    fn branch_outcomes(
        &self,
        model: &ProcessModel,
        node: &ProcessNode,
        data: &[ProcessData],
    ) -> Result<Vec<(NodeId, Outcome)>, EngineError> {
        let ctx = ConditionContext { data };
        let mut raw = Vec::with_capacity(node.successors.len());
        for succ_id in &node.successors {
            let succ = model.require_node(succ_id)?;
            let result = match (&succ.condition, succ.is_join()) {
                (Some(condition), false) => self.conditions.evaluate(condition, &ctx),
                _ => Ok(ConditionResult::True),
            };
            raw.push((succ_id.clone(), result));
        }

        let any_true = raw.iter().any(|(_, r)| *r == Ok(ConditionResult::True));
        let limit = match node.kind {
            NodeKind::Split { max, .. } => max,
            _ => usize::MAX,
        };
        let mut enabled = 0usize;
        Ok(raw
            .into_iter()
            .map(|(id, result)| {
                let outcome = match result {
                    Ok(ConditionResult::True) => Outcome::Enabled,
                    Ok(ConditionResult::Otherwise) if !any_true => Outcome::Enabled,
                    Ok(_) => Outcome::Skip(Skipped),
                    Err(err) => {
                        warn!(node = %id, error = %err, "condition could not be evaluated");
                        Outcome::Skip(SkippedInvalidated)
                    }
                };
                let outcome = match outcome {
                    Outcome::Enabled if enabled >= limit => Outcome::Skip(Skipped),
                    Outcome::Enabled => {
                        enabled += 1;
                        Outcome::Enabled
                    }
                    skip => skip,
                };
                (id, outcome)
            })
            .collect())
    }

    /// React to `handle` having become final: create, enable or skip its
    /// successors.
    fn propagate(&self, tx: &mut Transaction, handle: Handle<NodeInstance>) -> Result<Vec<Step>, EngineError> {
        let node = self.store.node(tx, handle)?;
        if !node.state.is_final() {
            return Ok(Vec::new());
        }
        let instance = self.store.instance(tx, node.process_instance)?;
        let model = self.store.model(tx, instance.process_model)?;
        let model_node = model.require_node(&node.node)?;

        let outcomes = if node.state == Complete {
            let data = self.accumulated_data(tx, &instance, &node)?;
            self.branch_outcomes(&model, model_node, &data)?
        } else {
            let cause = NodeInstanceState::dominant_skip([node.state]);
            model_node.successors.iter().map(|s| (s.clone(), Outcome::Skip(cause))).collect()
        };

        let mut steps = Vec::new();
        for (succ_id, outcome) in outcomes {
            let succ = model.require_node(&succ_id)?;
            if succ.is_join() {
                steps.extend(self.arrive_at_join(tx, instance.handle, &model, succ, handle)?);
                continue;
            }
            let entry_no = self.next_entry_no(tx, instance.handle, &succ_id)?;
            let builder = NodeInstanceBuilder::new(instance.handle, succ_id.clone(), entry_no).add_predecessor(handle);
            match outcome {
                Outcome::Enabled => {
                    let child = self.add_node(tx, instance.handle, builder.build())?;
                    steps.push(Step::Activate(child));
                }
                Outcome::Skip(cause) => {
                    let child = self.add_node(tx, instance.handle, builder.transition(cause)?.build())?;
                    debug!(node = %succ_id, state = %cause, "successor skipped");
                    steps.push(Step::Settled(child));
                }
            }
        }
        Ok(steps)
    }

    /// Record that predecessor `from` reached `join`, and fire or skip the
    /// join once every model predecessor has reported.
    fn arrive_at_join(
        &self,
        tx: &mut Transaction,
        instance: Handle<ProcessInstance>,
        model: &ProcessModel,
        join: &ProcessNode,
        from: Handle<NodeInstance>,
    ) -> Result<Option<Step>, EngineError> {
        let existing = self
            .node_instances(tx, instance)?
            .into_iter()
            .filter(|n| n.node == join.id)
            .max_by_key(|n| n.entry_no);

        let join_h = match existing {
            // Already decided, e.g. cancelled while waiting.
            Some(n) if n.state.is_final() => return Ok(None),
            Some(n) => {
                let handle = n.handle;
                self.save(tx, n.builder().add_predecessor(from).build())?;
                handle
            }
            None => {
                let node = NodeInstanceBuilder::new(instance, join.id.clone(), 1).add_predecessor(from).build();
                self.add_node(tx, instance, node)?
            }
        };
        self.evaluate_join(tx, model, join, join_h)
    }

    fn evaluate_join(
        &self,
        tx: &mut Transaction,
        model: &ProcessModel,
        join: &ProcessNode,
        handle: Handle<NodeInstance>,
    ) -> Result<Option<Step>, EngineError> {
        let node = self.store.node(tx, handle)?;
        if node.state != Pending {
            return Ok(None);
        }
        let preds = node
            .predecessors
            .iter()
            .map(|&h| self.store.node(tx, h))
            .collect::<Result<Vec<_>, _>>()?;
        let reported: BTreeSet<&str> = preds.iter().filter(|p| p.state.is_final()).map(|p| p.node.as_str()).collect();
        if !join.predecessors.iter().all(|p| reported.contains(p.as_str())) {
            debug!(join = %join.id, reported = reported.len(), expected = join.predecessors.len(), "join waiting");
            return Ok(None);
        }

        let (min, max) = match join.kind {
            NodeKind::Join { min, max } => (min, max),
            _ => (1, usize::MAX),
        };
        let completed = preds.iter().filter(|p| p.state == Complete).count();
        let outcome = if (min..=max).contains(&completed) {
            match &join.condition {
                None => Outcome::Enabled,
                Some(condition) => {
                    let instance = self.store.instance(tx, node.process_instance)?;
                    let data = self.accumulated_data(tx, &instance, &node)?;
                    match self.conditions.evaluate(condition, &ConditionContext { data: &data }) {
                        Ok(ConditionResult::True | ConditionResult::Otherwise) => Outcome::Enabled,
                        Ok(ConditionResult::False) => Outcome::Skip(Skipped),
                        Err(err) => {
                            warn!(join = %join.id, error = %err, "join condition could not be evaluated");
                            Outcome::Skip(SkippedInvalidated)
                        }
                    }
                }
            }
        } else {
            Outcome::Skip(NodeInstanceState::dominant_skip(preds.iter().map(|p| p.state)))
        };
        debug!(join = %join.id, completed, min, max, model = %model.name, ?outcome, "join decided");

        match outcome {
            Outcome::Enabled => Ok(Some(Step::Activate(handle))),
            Outcome::Skip(cause) => {
                self.save(tx, node.builder().transition(cause)?.build())?;
                Ok(Some(Step::Settled(handle)))
            }
        }
    }

    /// Close the instance once every node instance is final: finished if an
    /// end node completed, failed if any node failed, cancelled otherwise.
    fn settle_instance(&self, tx: &mut Transaction, handle: Handle<ProcessInstance>) -> Result<(), EngineError> {
        let instance = self.store.instance(tx, handle)?;
        if instance.state != InstanceState::Started {
            return Ok(());
        }
        let nodes = self.store.nodes_of(tx, &instance)?;
        if nodes.iter().any(|n| !n.state.is_final()) {
            return Ok(());
        }
        let model = self.store.model(tx, instance.process_model)?;
        let end_completed = nodes
            .iter()
            .any(|n| n.state == Complete && model.node(&n.node).is_some_and(|m| m.kind == NodeKind::End));
        let state = if end_completed {
            InstanceState::Finished
        } else if nodes.iter().any(|n| n.state == Failed) {
            InstanceState::Failed
        } else {
            InstanceState::Cancelled
        };
        self.store.instances().set(tx, handle, instance.builder().state(state).build())?;
        info!(instance = %handle, %state, "process instance settled");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn add_node(
        &self,
        tx: &mut Transaction,
        instance: Handle<ProcessInstance>,
        node: NodeInstance,
    ) -> Result<Handle<NodeInstance>, EngineError> {
        let handle = self.store.nodes().put(tx, node)?;
        let current = self.store.instance(tx, instance)?;
        self.store.instances().set(tx, instance, current.builder().add_child(handle).build())?;
        Ok(handle)
    }

    fn next_entry_no(&self, tx: &mut Transaction, instance: Handle<ProcessInstance>, node_id: &str) -> Result<u32, EngineError> {
        let count = self.node_instances(tx, instance)?.iter().filter(|n| n.node == node_id).count();
        Ok(count as u32 + 1)
    }

    /// Results of `node` and its transitive predecessors, nearest first,
    /// followed by the instance inputs.
    fn accumulated_data(
        &self,
        tx: &mut Transaction,
        instance: &ProcessInstance,
        node: &NodeInstance,
    ) -> Result<Vec<ProcessData>, EngineError> {
        let mut data = Vec::new();
        let mut seen = BTreeSet::from([node.handle]);
        let mut queue: VecDeque<NodeInstance> = VecDeque::from([node.clone()]);
        while let Some(current) = queue.pop_front() {
            if current.state == Complete {
                data.extend(current.results.iter().cloned());
            }
            for &pred in &current.predecessors {
                if seen.insert(pred) {
                    queue.push_back(self.store.node(tx, pred)?);
                }
            }
        }
        data.extend(instance.inputs.iter().cloned());
        Ok(data)
    }
}
