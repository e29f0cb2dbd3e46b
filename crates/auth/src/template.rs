//! Authorization templates declared on activities.
//!
//! A template describes the permission an activity hands to the service it
//! messages, in terms of values only known once the activity runs (its node
//! instance, the engine's service id, ...). [`AuthorizationTemplate::instantiate`]
//! turns it into a concrete [`PendingPermission`].

use serde::{Deserialize, Serialize};

use crate::{DelegatedScope, PendingPermission, PermissionScope, Principal, ServiceId};

/// Everything a template may refer to when it is instantiated.
#[derive(Debug, Clone)]
pub struct TemplateContext {
    /// Service id of the engine running the activity.
    pub engine_service: ServiceId,
    pub node_instance: i64,
    pub process_instance: i64,
    pub owner: Principal,
    pub assigned_user: Option<Principal>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScopeTemplate {
    /// A scope that does not depend on the activity.
    Fixed { scope: PermissionScope },
    /// Accept the activity's own task.
    AcceptTask,
    /// Start, finish or fail the activity's own node instance.
    UpdateActivityState,
    Identify,
    /// Allow the receiver to delegate the inner scope to `client_id` at
    /// `service`.
    Delegate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_id: Option<ServiceId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        service: Option<ServiceId>,
        scope: Box<ScopeTemplate>,
    },
}

impl ScopeTemplate {
    pub fn instantiate(&self, ctx: &TemplateContext) -> PermissionScope {
        match self {
            Self::Fixed { scope } => scope.clone(),
            Self::AcceptTask => PermissionScope::accept_task(ctx.node_instance),
            Self::UpdateActivityState => PermissionScope::update_activity_state(ctx.node_instance),
            Self::Identify => PermissionScope::identify(),
            Self::Delegate { client_id, service, scope } => {
                PermissionScope::delegated_permission().intersect(&PermissionScope::Delegated(DelegatedScope {
                    client_id: client_id.clone(),
                    service: service.clone(),
                    scope: Box::new(scope.instantiate(ctx)),
                }))
            }
        }
    }
}

/// A scope template together with the service it will be usable at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationTemplate {
    /// Target service; `None` means the engine running the activity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<ServiceId>,
    pub scope: ScopeTemplate,
}

impl AuthorizationTemplate {
    pub fn at_engine(scope: ScopeTemplate) -> Self {
        Self { service: None, scope }
    }

    pub fn instantiate(&self, ctx: &TemplateContext) -> PendingPermission {
        PendingPermission {
            service: self.service.clone().unwrap_or_else(|| ctx.engine_service.clone()),
            scope: self.scope.instantiate(ctx),
        }
    }

    /// Templates used by activities that declare none: the receiver may
    /// accept the task and update its state at the engine.
    pub fn default_templates() -> Vec<AuthorizationTemplate> {
        vec![
            Self::at_engine(ScopeTemplate::AcceptTask),
            Self::at_engine(ScopeTemplate::UpdateActivityState),
        ]
    }
}

/// Instantiate `templates`, dropping those that produce an empty scope.
pub fn instantiate_all(templates: &[AuthorizationTemplate], ctx: &TemplateContext) -> Vec<PendingPermission> {
    templates
        .iter()
        .map(|t| t.instantiate(ctx))
        .filter(|p| !p.scope.is_empty())
        .collect()
}
