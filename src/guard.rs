//! Read/write policy over service requests and the records nested in them.
//!
//! Rules are evaluated in a fixed order and the first match wins:
//!
//! 1. system administrators may do anything
//! 2. a request is visible to its customer, its assigned mechanic, every
//!    active mechanic of its garage, and the garage's administrator
//! 3. status updates and ledger items follow the request rule, except that a
//!    mechanic may only *write* them when assigned to the request
//! 4. everything else is denied
use crate::actor::{Actor, Role};
use crate::directory::Garage;
use crate::error::{CoreError, CoreResult};
use crate::lifecycle::ServiceRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Read,
    Write,
}

/// A request together with the garage it was filed against.
#[derive(Debug, Clone, Copy)]
pub struct Scope<'a> {
    pub request: &'a ServiceRequest,
    pub garage: &'a Garage,
}

#[derive(Debug, Clone, Copy)]
pub enum Resource<'a> {
    ServiceRequest(Scope<'a>),
    StatusUpdate(Scope<'a>),
    LedgerItem(Scope<'a>),
}

impl<'a> Scope<'a> {
    pub fn new(request: &'a ServiceRequest, garage: &'a Garage) -> Self {
        Self { request, garage }
    }
}

impl Resource<'_> {
    fn name(&self) -> &'static str {
        match self {
            Resource::ServiceRequest(_) => "service request",
            Resource::StatusUpdate(_) => "status update",
            Resource::LedgerItem(_) => "ledger item",
        }
    }
}

pub fn can_access(actor: &Actor, resource: Resource<'_>, intent: Intent) -> bool {
    if actor.is(Role::SystemAdmin) {
        return true;
    }

    match resource {
        Resource::ServiceRequest(scope) => request_rule(actor, scope),
        Resource::StatusUpdate(scope) | Resource::LedgerItem(scope) => {
            if intent == Intent::Write && actor.is(Role::Mechanic) {
                return scope.request.is_assigned_to(&actor.id);
            }
            request_rule(actor, scope)
        }
    }
}

fn request_rule(actor: &Actor, scope: Scope<'_>) -> bool {
    let Scope { request, garage } = scope;
    if garage.id != request.garage_id {
        return false;
    }

    match actor.role {
        Role::Customer => actor.id == request.customer_id,
        Role::Mechanic => {
            request.is_assigned_to(&actor.id) || garage.has_active_mechanic(&actor.id)
        }
        Role::GarageAdmin => actor.id == garage.admin_id,
        Role::SystemAdmin => true,
    }
}

/// [`can_access`] for call sites that surface a denial as an error.
pub fn ensure(actor: &Actor, resource: Resource<'_>, intent: Intent) -> CoreResult<()> {
    if can_access(actor, resource, intent) {
        return Ok(());
    }
    log::debug!(
        "denied {:?} on {} to {} ({:?})",
        intent,
        resource.name(),
        actor.id,
        actor.role
    );
    Err(CoreError::forbidden(format!(
        "{} may not {} this {}",
        actor.id,
        match intent {
            Intent::Read => "read",
            Intent::Write => "modify",
        },
        resource.name()
    )))
}
