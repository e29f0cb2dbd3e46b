//! The task list: a trusted intermediary that receives activity messages as
//! tasks and lets users take them.
//!
//! When a message arrives the task list exchanges the attached authorization
//! code for its own token. When a user accepts a task, it uses that token to
//! mint a narrower token bound to the user, which the user then presents to
//! the engine.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use auth::{
    AuthService, AuthToken, AuthorizationCode, DelegationRequest, PermissionScope, Principal, ServiceId,
    TokenCache, TokenKey,
};

use crate::{ActivityContext, MessageSendingResult, MessageTransport, OutboundMessage, ProcessData, TransportError};

/// A task waiting to be taken.
#[derive(Debug, Clone)]
pub struct PostedTask {
    pub engine: ServiceId,
    pub process_instance: i64,
    pub node_instance: i64,
    pub node_id: String,
    pub process_name: String,
    pub operation: String,
    pub content: Vec<ProcessData>,
    /// The task list's own token, obtained from the message's code.
    pub token: AuthToken,
}

pub struct TaskList {
    service_id: ServiceId,
    auth: Arc<AuthService>,
    tokens: TokenCache,
    tasks: Mutex<BTreeMap<i64, PostedTask>>,
}

impl TaskList {
    pub fn new(service_id: ServiceId, auth: Arc<AuthService>) -> Self {
        Self { service_id, auth, tokens: TokenCache::new(), tasks: Mutex::new(BTreeMap::new()) }
    }

    /// Register a fresh task list service with `auth`.
    pub fn register(auth: Arc<AuthService>) -> Result<Self, TransportError> {
        let service_id = auth.services().register("tasklist")?;
        Ok(Self::new(service_id, auth))
    }

    pub fn service_id(&self) -> &ServiceId {
        &self.service_id
    }

    fn tasks(&self) -> Result<MutexGuard<'_, BTreeMap<i64, PostedTask>>, TransportError> {
        self.tasks
            .lock()
            .map_err(|_| TransportError::Internal("task table lock poisoned".into()))
    }

    /// All open tasks, ordered by node instance.
    pub fn open_tasks(&self) -> Result<Vec<PostedTask>, TransportError> {
        Ok(self.tasks()?.values().cloned().collect())
    }

    pub fn task(&self, node_instance: i64) -> Result<Option<PostedTask>, TransportError> {
        Ok(self.tasks()?.get(&node_instance).cloned())
    }

    /// Take the task of `node_instance` for `user`: returns a token bound to
    /// the user that may accept the task and update its state at the engine.
    #[instrument(skip(self), fields(tasklist = %self.service_id))]
    pub fn accept_task(&self, user: &Principal, node_instance: i64) -> Result<AuthToken, TransportError> {
        let task = self.task(node_instance)?.ok_or(TransportError::UnknownTask(node_instance))?;
        let key = TokenKey {
            subject: user.clone(),
            service: task.engine.clone(),
            node_instance: Some(node_instance),
        };
        let token = self.tokens.get_or_mint(&self.auth, key, || {
            self.auth.exchange_delegate_token(
                &task.token,
                DelegationRequest {
                    subject: user.clone(),
                    client_id: self.service_id.clone(),
                    target_service: task.engine.clone(),
                    scope: PermissionScope::accept_task(node_instance)
                        .union(&PermissionScope::update_activity_state(node_instance)),
                },
            )
        })?;
        info!(user = %user, node_instance, "task accepted");
        Ok(token)
    }

    /// Forget the task of `node_instance` and revoke the task list's token
    /// for it.
    pub fn close_task(&self, node_instance: i64) -> Result<bool, TransportError> {
        let Some(task) = self.tasks()?.remove(&node_instance) else {
            return Ok(false);
        };
        self.auth.invalidate_token(&task.token)?;
        self.tokens.evict_invalid(&self.auth);
        debug!(node_instance, "task closed");
        Ok(true)
    }
}

#[async_trait]
impl MessageTransport for TaskList {
    async fn send_message(
        &self,
        engine: &ServiceId,
        message: &OutboundMessage,
        context: &ActivityContext,
        auth: Option<&AuthorizationCode>,
    ) -> Result<MessageSendingResult, TransportError> {
        let Some(code) = auth else {
            warn!(node_instance = context.node_instance, "task message without authorization code");
            return Ok(MessageSendingResult::Failed("missing authorization code".into()));
        };
        let token = self.auth.exchange_authorization_code(&self.service_id, code)?;

        let task = PostedTask {
            engine: engine.clone(),
            process_instance: context.process_instance,
            node_instance: context.node_instance,
            node_id: context.node_id.clone(),
            process_name: context.process_name.clone(),
            operation: message.operation.clone(),
            content: message.content.clone(),
            token,
        };
        self.tasks()?.insert(context.node_instance, task);
        debug!(node_instance = context.node_instance, operation = %message.operation, "task posted");
        Ok(MessageSendingResult::Acknowledged)
    }
}

#[cfg(test)]
mod tests {
    use auth::{AuthConfig, AuthError, CodeRequest, PendingPermission, ServiceRegistry};

    use super::*;

    struct Fixture {
        auth: Arc<AuthService>,
        engine: ServiceId,
        tasklist: TaskList,
    }

    fn fixture() -> Fixture {
        let services = Arc::new(ServiceRegistry::new());
        let engine = services.register("engine").unwrap();
        let auth = Arc::new(AuthService::new(AuthConfig::default(), services));
        let tasklist = TaskList::register(Arc::clone(&auth)).unwrap();
        Fixture { auth, engine, tasklist }
    }

    fn context(node_instance: i64) -> ActivityContext {
        ActivityContext {
            process_instance: 1,
            node_instance,
            node_id: "review".into(),
            process_name: "expenses".into(),
            owner: Principal::new("alice"),
            data: Vec::new(),
        }
    }

    fn message(f: &Fixture) -> OutboundMessage {
        OutboundMessage {
            service: f.tasklist.service_id().clone(),
            operation: "review".into(),
            content: vec![ProcessData::text("amount", "40")],
        }
    }

    fn code(f: &Fixture, node_instance: i64) -> AuthorizationCode {
        f.auth
            .request_authorization_code(CodeRequest {
                subject: Principal::new("alice"),
                client_id: f.tasklist.service_id().clone(),
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
            })
            .unwrap()
    }

    #[tokio::test]
    async fn message_becomes_task_and_user_token_validates() {
        let f = fixture();
        let code = code(&f, 3);
        let result = f.tasklist.send_message(&f.engine, &message(&f), &context(3), Some(&code)).await;
        assert_eq!(result, Ok(MessageSendingResult::Acknowledged));
        assert_eq!(f.tasklist.open_tasks().unwrap().len(), 1);

        let user = Principal::new("bob");
        let token = f.tasklist.accept_task(&user, 3).unwrap();
        assert_eq!(token.subject, user);
        assert_eq!(f.auth.validate_auth_info(&token, &f.engine, &PermissionScope::accept_task(3)), Ok(()));
        assert_eq!(
            f.auth.validate_auth_info(&token, &f.engine, &PermissionScope::update_activity_state(3)),
            Ok(())
        );

        let again = f.tasklist.accept_task(&user, 3).unwrap();
        assert_eq!(again.key, token.key, "cached token reused");
    }

    #[tokio::test]
    async fn replayed_code_is_refused() {
        let f = fixture();
        let code = code(&f, 3);
        f.tasklist.send_message(&f.engine, &message(&f), &context(3), Some(&code)).await.unwrap();
        let replay = f.tasklist.send_message(&f.engine, &message(&f), &context(3), Some(&code)).await;
        assert_eq!(replay, Err(TransportError::Unauthorized(AuthError::CodeAlreadyUsed)));
    }

    #[tokio::test]
    async fn message_without_code_fails() {
        let f = fixture();
        let result = f.tasklist.send_message(&f.engine, &message(&f), &context(3), None).await.unwrap();
        assert!(matches!(result, MessageSendingResult::Failed(_)));
        assert!(f.tasklist.open_tasks().unwrap().is_empty());
    }

    #[tokio::test]
    async fn closed_task_cannot_be_accepted() {
        let f = fixture();
        let code = code(&f, 4);
        f.tasklist.send_message(&f.engine, &message(&f), &context(4), Some(&code)).await.unwrap();
        assert!(f.tasklist.close_task(4).unwrap());
        assert_eq!(f.tasklist.accept_task(&Principal::new("bob"), 4), Err(TransportError::UnknownTask(4)));
    }
}
