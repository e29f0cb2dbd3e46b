//! The permission-scope algebra.
//!
//! A [`PermissionScope`] is an immutable value describing what a token holder
//! may do. Scopes are compared structurally and combined with
//! [`PermissionScope::union`] and [`PermissionScope::intersect`]. Whether a
//! grant authorizes a concrete use is answered by
//! [`PermissionScope::includes`].
//!
//! Laws kept by the implementation:
//! - `a.union(&Empty) == a` and `a.intersect(&Any) == a`
//! - `a.intersect(&Empty) == Empty` and `a.union(&Any) == Any`
//! - `a.union(&a) == a`
//! - `a.intersect(b).includes(x)` implies `a.includes(x) && b.includes(x)`

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ServiceId;

pub const IDENTIFY: &str = "identify";
pub const ACCEPT_TASK: &str = "accept_task";
pub const UPDATE_ACTIVITY_STATE: &str = "update_activity_state";
pub const START_PROCESS: &str = "start_process";
pub const CANCEL_PROCESS: &str = "cancel_process";

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PermissionScope {
    /// Grants nothing. Absorbing under intersect, neutral under union.
    #[default]
    Empty,
    /// Grants everything. Neutral under intersect, absorbing under union.
    /// Never valid as a use-scope.
    Any,
    /// A named capability, optionally bound to one target.
    Capability(CapabilityScope),
    /// Any of the member scopes. Always flat, de-duplicated and with at least
    /// two members when produced by the algebra.
    Union { members: Vec<PermissionScope> },
    /// An action limited by counterparty and amount.
    Restricted(RestrictedScope),
    /// The right to hand `scope` at `service` on to `client_id`.
    Delegated(DelegatedScope),
}

// ---------------------------------------------------------------------------
// Scope kinds
// ---------------------------------------------------------------------------

/// A named capability. `target: None` covers every target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CapabilityScope {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

impl CapabilityScope {
    fn includes(&self, used: &CapabilityScope) -> bool {
        self.name == used.name && covers(&self.target, &used.target)
    }

    fn intersect(&self, other: &CapabilityScope) -> PermissionScope {
        if self.name != other.name {
            return PermissionScope::Empty;
        }
        match narrow(&self.target, &other.target) {
            Some(target) => PermissionScope::Capability(CapabilityScope {
                name: self.name.clone(),
                target,
            }),
            None => PermissionScope::Empty,
        }
    }
}

/// An action restricted to one counterparty and/or a maximum amount.
/// Absent attributes are unrestricted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RestrictedScope {
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_amount: Option<u64>,
}

impl RestrictedScope {
    fn includes(&self, used: &RestrictedScope) -> bool {
        let amount_ok = match (self.max_amount, used.max_amount) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(limit), Some(wanted)) => wanted <= limit,
        };
        self.action == used.action && covers(&self.customer_id, &used.customer_id) && amount_ok
    }

    /// The envelope both restrictions allow: matching or absent customer,
    /// lowest amount.
    fn intersect(&self, other: &RestrictedScope) -> PermissionScope {
        if self.action != other.action {
            return PermissionScope::Empty;
        }
        let Some(customer_id) = narrow(&self.customer_id, &other.customer_id) else {
            return PermissionScope::Empty;
        };
        let max_amount = match (self.max_amount, other.max_amount) {
            (None, limit) | (limit, None) => limit,
            (Some(a), Some(b)) => Some(a.min(b)),
        };
        PermissionScope::Restricted(RestrictedScope {
            action: self.action.clone(),
            customer_id,
            max_amount,
        })
    }

    /// Exact union of two restrictions on the same action and customer.
    fn merge(&self, other: &RestrictedScope) -> Option<RestrictedScope> {
        if self.action != other.action || self.customer_id != other.customer_id {
            return None;
        }
        let max_amount = match (self.max_amount, other.max_amount) {
            (Some(a), Some(b)) => Some(a.max(b)),
            _ => None,
        };
        Some(RestrictedScope { max_amount, ..self.clone() })
    }
}

/// Permission to delegate `scope` at `service` to `client_id`.
/// `None` fields cover every client or service; `scope: Any` covers every
/// scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DelegatedScope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<ServiceId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<ServiceId>,
    pub scope: Box<PermissionScope>,
}

impl DelegatedScope {
    fn includes(&self, used: &DelegatedScope) -> bool {
        let scope_ok = match (&*self.scope, &*used.scope) {
            (PermissionScope::Any, _) => true,
            (granted, wanted) => granted.includes(wanted),
        };
        covers(&self.client_id, &used.client_id) && covers(&self.service, &used.service) && scope_ok
    }

    fn intersect(&self, other: &DelegatedScope) -> PermissionScope {
        let (Some(client_id), Some(service)) = (
            narrow(&self.client_id, &other.client_id),
            narrow(&self.service, &other.service),
        ) else {
            return PermissionScope::Empty;
        };
        let scope = self.scope.intersect(&other.scope);
        if scope == PermissionScope::Empty {
            return PermissionScope::Empty;
        }
        PermissionScope::Delegated(DelegatedScope { client_id, service, scope: Box::new(scope) })
    }
}

/// `None` grants every value; `Some(x)` grants only `x`.
fn covers<T: PartialEq>(granted: &Option<T>, used: &Option<T>) -> bool {
    match (granted, used) {
        (None, _) => true,
        (Some(g), Some(u)) => g == u,
        (Some(_), None) => false,
    }
}

/// Narrowest attribute both sides allow; `None` when incompatible.
fn narrow<T: PartialEq + Clone>(a: &Option<T>, b: &Option<T>) -> Option<Option<T>> {
    match (a, b) {
        (None, other) | (other, None) => Some(other.clone()),
        (Some(x), Some(y)) if x == y => Some(Some(x.clone())),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Constructors
// ---------------------------------------------------------------------------

impl PermissionScope {
    pub fn capability(name: impl Into<String>) -> Self {
        Self::Capability(CapabilityScope { name: name.into(), target: None })
    }

    pub fn capability_on(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::Capability(CapabilityScope { name: name.into(), target: Some(target.into()) })
    }

    pub fn restricted(
        action: impl Into<String>,
        customer_id: Option<String>,
        max_amount: Option<u64>,
    ) -> Self {
        Self::Restricted(RestrictedScope { action: action.into(), customer_id, max_amount })
    }

    /// Lets a holder prove who it acts for.
    pub fn identify() -> Self {
        Self::capability(IDENTIFY)
    }

    /// Take (claim) the task of one node instance.
    pub fn accept_task(node_instance: i64) -> Self {
        Self::capability_on(ACCEPT_TASK, node_instance.to_string())
    }

    /// Start, finish, fail or cancel one node instance.
    pub fn update_activity_state(node_instance: i64) -> Self {
        Self::capability_on(UPDATE_ACTIVITY_STATE, node_instance.to_string())
    }

    /// Start instances of one process model, or of any model.
    pub fn start_process(model: Option<i64>) -> Self {
        match model {
            Some(model) => Self::capability_on(START_PROCESS, model.to_string()),
            None => Self::capability(START_PROCESS),
        }
    }

    /// Cancel one process instance, or any instance.
    pub fn cancel_process(instance: Option<i64>) -> Self {
        match instance {
            Some(instance) => Self::capability_on(CANCEL_PROCESS, instance.to_string()),
            None => Self::capability(CANCEL_PROCESS),
        }
    }

    /// The unrestricted delegation permission: any client, any service, any
    /// scope. Narrow it with [`PermissionScope::restrict_to`].
    pub fn delegated_permission() -> Self {
        Self::Delegated(DelegatedScope {
            client_id: None,
            service: None,
            scope: Box::new(Self::Any),
        })
    }

    /// Narrow this scope to delegating `scope` at `service` to `client_id`.
    /// Scopes that are not delegation permissions narrow to `Empty`.
    pub fn restrict_to(&self, client_id: ServiceId, service: ServiceId, scope: PermissionScope) -> Self {
        self.intersect(&Self::Delegated(DelegatedScope {
            client_id: Some(client_id),
            service: Some(service),
            scope: Box::new(scope),
        }))
    }

    /// Build a normalized union of `scopes`.
    pub fn union_of<I: IntoIterator<Item = PermissionScope>>(scopes: I) -> Self {
        let mut members = Vec::new();
        for scope in scopes {
            push_member(&mut members, scope);
        }
        if members.iter().any(|m| matches!(m, Self::Any)) {
            return Self::Any;
        }
        match members.len() {
            0 => Self::Empty,
            1 => members.pop().unwrap_or_default(),
            _ => Self::Union { members },
        }
    }
}

fn push_member(members: &mut Vec<PermissionScope>, scope: PermissionScope) {
    match scope {
        PermissionScope::Empty => {}
        PermissionScope::Union { members: inner } => {
            for member in inner {
                push_member(members, member);
            }
        }
        PermissionScope::Restricted(restricted) => {
            let merged = members.iter().enumerate().find_map(|(i, existing)| match existing {
                PermissionScope::Restricted(e) => e.merge(&restricted).map(|m| (i, m)),
                _ => None,
            });
            match merged {
                Some((i, m)) => members[i] = PermissionScope::Restricted(m),
                None => members.push(PermissionScope::Restricted(restricted)),
            }
        }
        other => {
            if !members.contains(&other) {
                members.push(other);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Algebra
// ---------------------------------------------------------------------------

impl PermissionScope {
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    pub fn is_any(&self) -> bool {
        matches!(self, Self::Any)
    }

    /// Whether holding `self` authorizes the use-scope `used`.
    ///
    /// `Any` is never authorized as a use-scope, `Empty` always is. A union
    /// use-scope needs every member authorized; a union grant authorizes what
    /// any of its members does.
    pub fn includes(&self, used: &PermissionScope) -> bool {
        use PermissionScope::*;
        match (self, used) {
            (_, Any) => false,
            (_, Empty) => true,
            (granted, Union { members }) => members.iter().all(|m| granted.includes(m)),
            (Empty, _) => false,
            (Any, _) => true,
            (Union { members }, wanted) => members.iter().any(|m| m.includes(wanted)),
            (Capability(g), Capability(u)) => g.includes(u),
            (Restricted(g), Restricted(u)) => g.includes(u),
            (Delegated(g), Delegated(u)) => g.includes(u),
            _ => false,
        }
    }

    /// The scope satisfying the demands of both `self` and `other`.
    pub fn intersect(&self, other: &PermissionScope) -> PermissionScope {
        use PermissionScope::*;
        match (self, other) {
            (Empty, _) | (_, Empty) => Empty,
            (Any, x) | (x, Any) => x.clone(),
            (Union { members }, x) => Self::union_of(members.iter().map(|m| m.intersect(x))),
            (x, Union { members }) => Self::union_of(members.iter().map(|m| x.intersect(m))),
            (Capability(a), Capability(b)) => a.intersect(b),
            (Restricted(a), Restricted(b)) => a.intersect(b),
            (Delegated(a), Delegated(b)) => a.intersect(b),
            _ => Empty,
        }
    }

    /// The combined grant of `self` and `other`.
    pub fn union(&self, other: &PermissionScope) -> PermissionScope {
        use PermissionScope::*;
        match (self, other) {
            (Any, _) | (_, Any) => Any,
            (Empty, x) | (x, Empty) => x.clone(),
            _ => Self::union_of([self.clone(), other.clone()]),
        }
    }

    /// Members of a union, or the scope itself.
    pub fn members(&self) -> Vec<&PermissionScope> {
        match self {
            Self::Union { members } => members.iter().collect(),
            Self::Empty => Vec::new(),
            other => vec![other],
        }
    }
}

impl fmt::Display for PermissionScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("<empty>"),
            Self::Any => f.write_str("<any>"),
            Self::Capability(c) => match &c.target {
                Some(target) => write!(f, "{}({})", c.name, target),
                None => f.write_str(&c.name),
            },
            Self::Union { members } => {
                f.write_str("{")?;
                for (i, member) in members.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{member}")?;
                }
                f.write_str("}")
            }
            Self::Restricted(r) => {
                write!(f, "{}[", r.action)?;
                match &r.customer_id {
                    Some(customer) => write!(f, "customer={customer}")?,
                    None => f.write_str("customer=*")?,
                }
                match r.max_amount {
                    Some(max) => write!(f, ", max={max}]"),
                    None => f.write_str(", max=*]"),
                }
            }
            Self::Delegated(d) => {
                let client = d.client_id.as_ref().map_or("*", |c| c.as_str());
                let service = d.service.as_ref().map_or("*", |s| s.as_str());
                write!(f, "delegate({client} -> {service}: {})", d.scope)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use PermissionScope::{Any, Empty};

    fn pay(customer: Option<&str>, max: Option<u64>) -> PermissionScope {
        PermissionScope::restricted("pay", customer.map(str::to_string), max)
    }

    #[test]
    fn any_is_never_a_use_scope() {
        assert!(!Any.includes(&Any));
        assert!(!PermissionScope::identify().includes(&Any));
        assert!(Any.includes(&PermissionScope::identify()));
    }

    #[test]
    fn untargeted_capability_covers_targets() {
        let all = PermissionScope::capability(ACCEPT_TASK);
        assert!(all.includes(&PermissionScope::accept_task(7)));
        assert!(!PermissionScope::accept_task(7).includes(&all));
        assert!(!PermissionScope::accept_task(7).includes(&PermissionScope::accept_task(8)));
        assert_eq!(all.intersect(&PermissionScope::accept_task(7)), PermissionScope::accept_task(7));
        assert_eq!(PermissionScope::accept_task(7).intersect(&PermissionScope::accept_task(8)), Empty);
    }

    #[test]
    fn union_flattens_and_keeps_first_occurrence_order() {
        let a = PermissionScope::identify();
        let b = PermissionScope::accept_task(1);
        let c = PermissionScope::update_activity_state(1);
        let ab = a.union(&b);
        let bc = b.union(&c);
        assert_eq!(
            ab.union(&bc),
            PermissionScope::Union { members: vec![a.clone(), b.clone(), c.clone()] }
        );
        assert_eq!(ab.union(&a), ab);
    }

    #[test]
    fn intersect_distributes_over_union_and_unwraps() {
        let u = PermissionScope::union_of([PermissionScope::identify(), PermissionScope::accept_task(1)]);
        assert_eq!(u.intersect(&PermissionScope::identify()), PermissionScope::identify());
        assert_eq!(u.intersect(&PermissionScope::accept_task(2)), Empty);
        assert_eq!(PermissionScope::capability(ACCEPT_TASK).intersect(&u), PermissionScope::accept_task(1));
    }

    #[test]
    fn restricted_intersect_narrows_envelope() {
        let broad = pay(None, Some(1_000));
        let acme = pay(Some("acme"), Some(250));
        assert_eq!(broad.intersect(&acme), pay(Some("acme"), Some(250)));
        assert_eq!(pay(Some("acme"), None).intersect(&pay(None, Some(40))), pay(Some("acme"), Some(40)));
        assert_eq!(acme.intersect(&pay(Some("globex"), None)), Empty);
        assert_eq!(acme.intersect(&PermissionScope::restricted("refund", None, None)), Empty);
    }

    #[test]
    fn restricted_includes_checks_amount_and_customer() {
        let grant = pay(Some("acme"), Some(100));
        assert!(grant.includes(&pay(Some("acme"), Some(99))));
        assert!(!grant.includes(&pay(Some("acme"), Some(101))));
        assert!(!grant.includes(&pay(Some("acme"), None)), "unbounded use exceeds a bounded grant");
        assert!(!grant.includes(&pay(None, Some(1))), "any-customer use exceeds a single-customer grant");
        assert!(pay(None, None).includes(&pay(Some("globex"), Some(1_000_000))));
    }

    #[test]
    fn restricted_union_merges_same_counterparty() {
        let merged = pay(Some("acme"), Some(100)).union(&pay(Some("acme"), Some(300)));
        assert_eq!(merged, pay(Some("acme"), Some(300)));
        let separate = pay(Some("acme"), Some(100)).union(&pay(Some("globex"), Some(300)));
        assert_eq!(separate.members().len(), 2);
    }

    #[test]
    fn delegation_narrows_with_restrict_to() {
        let general = PermissionScope::delegated_permission();
        let narrow = general.restrict_to("tasklist-1".into(), "engine-1".into(), PermissionScope::accept_task(3));
        assert!(general.includes(&narrow));
        assert!(!narrow.includes(&general.restrict_to(
            "tasklist-1".into(),
            "engine-1".into(),
            PermissionScope::accept_task(4),
        )));
        assert!(!narrow.includes(&general.restrict_to(
            "other-1".into(),
            "engine-1".into(),
            PermissionScope::accept_task(3),
        )));
        assert_eq!(
            PermissionScope::identify().restrict_to("c".into(), "s".into(), PermissionScope::identify()),
            Empty,
            "only delegation permissions can be restricted"
        );
    }

    #[test]
    fn scopes_round_trip_through_json() {
        let scope = PermissionScope::union_of([
            pay(Some("acme"), Some(10)),
            PermissionScope::delegated_permission(),
        ]);
        let json = serde_json::to_string(&scope).unwrap();
        let back: PermissionScope = serde_json::from_str(&json).unwrap();
        assert_eq!(back, scope);
    }

    #[test]
    fn display_is_readable() {
        assert_eq!(PermissionScope::accept_task(4).to_string(), "accept_task(4)");
        assert_eq!(pay(Some("acme"), None).to_string(), "pay[customer=acme, max=*]");
    }

    // =========================================================================
    // Algebra laws over generated scopes
    // =========================================================================

    mod proptest_algebra {
        use proptest::prelude::*;

        use super::*;

        fn arb_capability() -> impl Strategy<Value = PermissionScope> {
            let name = prop_oneof![Just(IDENTIFY), Just(ACCEPT_TASK), Just(UPDATE_ACTIVITY_STATE)];
            let target = prop::option::of(prop_oneof![Just("1"), Just("2")]);
            (name, target).prop_map(|(name, target)| {
                PermissionScope::Capability(CapabilityScope {
                    name: name.to_string(),
                    target: target.map(str::to_string),
                })
            })
        }

        fn arb_restricted() -> impl Strategy<Value = PermissionScope> {
            let action = prop_oneof![Just("pay"), Just("refund")];
            let customer = prop::option::of(prop_oneof![Just("acme"), Just("globex")]);
            let amount = prop::option::of(0..500u64);
            (action, customer, amount)
                .prop_map(|(action, customer, amount)| pay_like(action, customer, amount))
        }

        fn pay_like(action: &str, customer: Option<&str>, amount: Option<u64>) -> PermissionScope {
            PermissionScope::restricted(action, customer.map(str::to_string), amount)
        }

        fn arb_service() -> impl Strategy<Value = Option<ServiceId>> {
            prop::option::of(prop_oneof![Just("engine-1"), Just("tasklist-1")].prop_map(|id| ServiceId::new(id)))
        }

        /// Every scope kind except a top-level `Any`, with delegations and
        /// unions nested up to three levels.
        fn arb_scope() -> impl Strategy<Value = PermissionScope> {
            let leaf = prop_oneof![Just(Empty), arb_capability(), arb_restricted()];
            leaf.prop_recursive(3, 24, 4, |inner| {
                prop_oneof![
                    (arb_service(), arb_service(), prop_oneof![Just(Any), inner.clone()]).prop_map(
                        |(client_id, service, scope)| {
                            PermissionScope::Delegated(DelegatedScope { client_id, service, scope: Box::new(scope) })
                        }
                    ),
                    prop::collection::vec(inner, 2..5).prop_map(PermissionScope::union_of),
                ]
            })
        }

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(512))]

            #[test]
            fn prop_identity_and_absorption(a in arb_scope()) {
                prop_assert_eq!(a.union(&Empty), a.clone());
                prop_assert_eq!(a.intersect(&Any), a.clone());
                prop_assert_eq!(a.intersect(&Empty), Empty);
                prop_assert_eq!(a.union(&Any), Any);
            }

            #[test]
            fn prop_union_idempotent(a in arb_scope()) {
                prop_assert_eq!(a.union(&a), a);
            }

            #[test]
            fn prop_scopes_include_themselves(a in arb_scope()) {
                prop_assert!(a.includes(&a), "{} is not reflexive", a);
            }

            #[test]
            fn prop_intersection_is_sound(a in arb_scope(), b in arb_scope(), x in arb_scope()) {
                let both = a.intersect(&b);
                if both.includes(&x) {
                    prop_assert!(a.includes(&x), "{} ∩ {} = {} includes {} but {} does not", a, b, both, x, a);
                    prop_assert!(b.includes(&x), "{} ∩ {} = {} includes {} but {} does not", a, b, both, x, b);
                }
            }

            #[test]
            fn prop_union_grants_what_either_grants(a in arb_scope(), b in arb_scope(), x in arb_scope()) {
                let either = a.union(&b);
                if a.includes(&x) || b.includes(&x) {
                    prop_assert!(either.includes(&x), "{} ∪ {} = {} misses {}", a, b, either, x);
                }
            }
        }
    }
}
