//! Service request aggregate and its state machine.
//!
//! ```text
//! Pending ──accept──▶ Accepted ──begin──▶ InProgress ──complete──▶ Completed
//!    │                   │
//!    └──────cancel───────┴──────────▶ Cancelled
//! ```
//!
//! [`RequestStatus::apply`] is the only place that decides whether a status
//! change is legal. Status updates and ledger items are stored inside the
//! aggregate, so one record write covers a whole mutation.
use std::fmt;

use chrono::Utc;

use crate::actor::{Actor, Role};
use crate::directory::{Garage, Vehicle};
use crate::error::{CoreError, CoreResult};
use crate::fanout::{Notice, NotificationKind, Outcome};
use crate::guard::{self, Intent, Resource, Scope};
use crate::types::{Location, TimeStamp};
use crate::utils::{self, prefix};
use crate::workflow::StatusUpdate;

pub const DEFAULT_CANCEL_REASON: &str = "No reason provided";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, minicbor::Encode, minicbor::Decode)]
pub enum RequestStatus {
    #[n(0)]
    Pending,
    #[n(1)]
    Accepted,
    #[n(2)]
    InProgress,
    #[n(3)]
    Completed,
    #[n(4)]
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transition {
    Accept,
    Begin,
    Cancel,
    Complete,
}

impl RequestStatus {
    pub const ALL: [RequestStatus; 5] = [
        RequestStatus::Pending,
        RequestStatus::Accepted,
        RequestStatus::InProgress,
        RequestStatus::Completed,
        RequestStatus::Cancelled,
    ];

    /// The transition table.
    pub fn apply(self, transition: Transition) -> CoreResult<RequestStatus> {
        use RequestStatus::*;
        use Transition::*;

        match (self, transition) {
            (Pending, Accept) => Ok(Accepted),
            (Accepted, Begin) => Ok(InProgress),
            (Pending | Accepted, Cancel) => Ok(Cancelled),
            (InProgress, Complete) => Ok(Completed),
            (_, Accept) => Err(CoreError::conflict("request has already been claimed")),
            (InProgress, Cancel) => Err(CoreError::conflict(
                "work has started, the request can no longer be cancelled",
            )),
            (Completed, Complete) => Err(CoreError::conflict("already completed")),
            (from, transition) => Err(CoreError::conflict(format!(
                "cannot {transition} a request that is {from}"
            ))),
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RequestStatus::Completed | RequestStatus::Cancelled)
    }

    /// Statuses in which a mechanic must be assigned.
    pub fn requires_mechanic(self) -> bool {
        matches!(
            self,
            RequestStatus::Accepted | RequestStatus::InProgress | RequestStatus::Completed
        )
    }

    /// Statuses in which status updates and ledger items may change.
    pub fn is_workable(self) -> bool {
        matches!(self, RequestStatus::Accepted | RequestStatus::InProgress)
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Accepted => "accepted",
            RequestStatus::InProgress => "in progress",
            RequestStatus::Completed => "completed",
            RequestStatus::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Transition::Accept => "accept",
            Transition::Begin => "begin",
            Transition::Cancel => "cancel",
            Transition::Complete => "complete",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, minicbor::Encode, minicbor::Decode)]
pub struct ServiceRequest {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub customer_id: String,
    #[n(2)]
    pub garage_id: String,
    #[n(3)]
    pub vehicle_id: String,
    #[n(4)]
    pub mechanic_id: Option<String>,
    #[n(5)]
    pub location: Location,
    #[n(6)]
    pub status: RequestStatus,
    #[n(7)]
    pub created_at: TimeStamp<Utc>,
    #[n(8)]
    pub cancel_reason: Option<String>,
    #[n(9)]
    pub updates: Vec<StatusUpdate>,
}

impl ServiceRequest {
    /// Files a new request on behalf of a customer.
    pub fn open(
        actor: &Actor,
        garage: &Garage,
        vehicle: &Vehicle,
        location: Location,
    ) -> CoreResult<Outcome<ServiceRequest>> {
        if !actor.is(Role::Customer) {
            return Err(CoreError::forbidden("only customers can request service"));
        }
        // Another customer's vehicle is reported the same way as a missing one.
        if vehicle.owner_id != actor.id {
            return Err(CoreError::not_found(format!("vehicle {}", vehicle.id)));
        }
        if !garage.is_open() {
            return Err(CoreError::not_found(format!("garage {}", garage.id)));
        }

        let request = ServiceRequest {
            id: utils::new_id(prefix::REQUEST)?,
            customer_id: actor.id.clone(),
            garage_id: garage.id.clone(),
            vehicle_id: vehicle.id.clone(),
            mechanic_id: None,
            location,
            status: RequestStatus::Pending,
            created_at: TimeStamp::new(),
            cancel_reason: None,
            updates: vec![],
        };

        let message = format!(
            "New service request {} for {} {} ({})",
            request.id, vehicle.make, vehicle.model, vehicle.plate
        );
        let notices = std::iter::once(garage.admin_id.as_str())
            .chain(garage.active_mechanics())
            .map(|receiver| {
                Notice::new(
                    &actor.id,
                    receiver,
                    NotificationKind::RequestCreated,
                    message.clone(),
                )
            })
            .collect();

        Ok(Outcome::new(request, notices))
    }

    pub fn is_assigned_to(&self, mechanic_id: &str) -> bool {
        self.mechanic_id.as_deref() == Some(mechanic_id)
    }

    /// True when `actor` is the mechanic currently assigned to the request.
    pub fn is_assigned_mechanic(&self, actor: &Actor) -> bool {
        actor.is(Role::Mechanic) && self.is_assigned_to(&actor.id)
    }

    /// A mechanic is assigned exactly while the status requires one.
    pub fn is_consistent(&self) -> bool {
        self.status.requires_mechanic() == self.mechanic_id.is_some()
    }

    pub(crate) fn transition(&mut self, transition: Transition) -> CoreResult<RequestStatus> {
        let from = self.status;
        self.status = from.apply(transition)?;
        log::debug!("request {} {} -> {}", self.id, from, self.status);
        Ok(self.status)
    }

    /// A mechanic of the request's garage claims it.
    pub fn accept(&mut self, actor: &Actor, garage: &Garage) -> CoreResult<Vec<Notice>> {
        guard::ensure(actor, Resource::ServiceRequest(Scope::new(self, garage)), Intent::Read)?;
        if !actor.is(Role::Mechanic) || !garage.has_active_mechanic(&actor.id) {
            return Err(CoreError::forbidden(
                "only mechanics of the garage can accept requests",
            ));
        }

        self.transition(Transition::Accept)?;
        self.mechanic_id = Some(actor.id.clone());

        Ok(vec![Notice::new(
            &actor.id,
            &self.customer_id,
            NotificationKind::RequestAccepted,
            format!("Mechanic {} accepted request {}", actor.id, self.id),
        )])
    }

    /// The assigned mechanic starts work.
    pub fn begin(&mut self, actor: &Actor, garage: &Garage) -> CoreResult<Vec<Notice>> {
        guard::ensure(actor, Resource::ServiceRequest(Scope::new(self, garage)), Intent::Write)?;
        if !self.is_assigned_mechanic(actor) {
            return Err(CoreError::forbidden(
                "only the assigned mechanic can start work",
            ));
        }

        self.transition(Transition::Begin)?;

        Ok(vec![Notice::new(
            &actor.id,
            &self.customer_id,
            NotificationKind::RequestStarted,
            format!("Work on request {} has started", self.id),
        )])
    }

    /// Cancels a request that has not started yet.
    pub fn cancel(
        &mut self,
        actor: &Actor,
        garage: &Garage,
        reason: Option<&str>,
    ) -> CoreResult<Vec<Notice>> {
        guard::ensure(actor, Resource::ServiceRequest(Scope::new(self, garage)), Intent::Write)?;
        if actor.is(Role::Mechanic) {
            return Err(CoreError::forbidden(
                "only the customer or the garage can cancel a request",
            ));
        }

        self.transition(Transition::Cancel)?;
        let reason = reason
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .unwrap_or(DEFAULT_CANCEL_REASON)
            .to_string();
        let mechanic = self.mechanic_id.take();
        self.cancel_reason = Some(reason.clone());

        let mut receivers: Vec<&str> = if actor.id == self.customer_id {
            vec![garage.admin_id.as_str()]
        } else {
            vec![self.customer_id.as_str()]
        };
        if let Some(mechanic) = mechanic.as_deref() {
            receivers.push(mechanic);
        }

        let message = format!("Request {} was cancelled: {}", self.id, reason);
        Ok(receivers
            .into_iter()
            .filter(|receiver| *receiver != actor.id)
            .map(|receiver| {
                Notice::new(
                    &actor.id,
                    receiver,
                    NotificationKind::RequestCancelled,
                    message.clone(),
                )
            })
            .collect())
    }

    /// Flips the request to completed once every ledger item is finished.
    /// Billing runs alongside in the same store transaction.
    pub fn complete(&mut self, actor: &Actor, garage: &Garage) -> CoreResult<()> {
        guard::ensure(actor, Resource::ServiceRequest(Scope::new(self, garage)), Intent::Write)?;
        let allowed = match actor.role {
            Role::Mechanic => self.is_assigned_to(&actor.id),
            Role::GarageAdmin | Role::SystemAdmin => true,
            Role::Customer => false,
        };
        if !allowed {
            return Err(CoreError::forbidden(
                "only the assigned mechanic or an administrator can complete a request",
            ));
        }

        let next = self.status.apply(Transition::Complete)?;
        if self.updates.is_empty() {
            return Err(CoreError::conflict("no status updates"));
        }
        if !self.all_items_finished() {
            return Err(CoreError::conflict("not all items finished"));
        }
        self.status = next;

        Ok(())
    }

    /// Hard delete is only possible once the request reached a terminal status.
    pub fn ensure_deletable(&self, actor: &Actor) -> CoreResult<()> {
        let allowed = match actor.role {
            Role::SystemAdmin => true,
            Role::Customer => actor.id == self.customer_id,
            _ => false,
        };
        if !allowed {
            return Err(CoreError::forbidden(
                "only the customer or a system administrator can delete a request",
            ));
        }
        if !self.status.is_terminal() {
            return Err(CoreError::conflict(format!(
                "a {} request cannot be deleted",
                self.status
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn garage() -> Garage {
        Garage::new("g1", "Northside", "admin1")
            .with_mechanic("m1")
            .with_mechanic("m2")
    }

    fn vehicle() -> Vehicle {
        Vehicle {
            id: "v1".into(),
            owner_id: "c1".into(),
            make: "Skoda".into(),
            model: "Octavia".into(),
            plate: "AB-123".into(),
        }
    }

    fn pending() -> ServiceRequest {
        ServiceRequest::open(
            &Actor::customer("c1"),
            &garage(),
            &vehicle(),
            Location::new(50.1, 14.4).unwrap(),
        )
        .unwrap()
        .value
    }

    #[test]
    fn transition_table_edges() {
        use RequestStatus::*;
        use Transition::*;

        assert_eq!(Pending.apply(Accept), Ok(Accepted));
        assert_eq!(Pending.apply(Cancel), Ok(Cancelled));
        assert_eq!(Accepted.apply(Begin), Ok(InProgress));
        assert_eq!(Accepted.apply(Cancel), Ok(Cancelled));
        assert_eq!(InProgress.apply(Complete), Ok(Completed));

        assert!(InProgress.apply(Cancel).is_err());
        assert!(Pending.apply(Complete).is_err());
        assert_eq!(
            Completed.apply(Complete),
            Err(CoreError::conflict("already completed"))
        );
        for status in RequestStatus::ALL.into_iter().filter(|s| s.is_terminal()) {
            for t in [Accept, Begin, Cancel, Complete] {
                assert!(status.apply(t).is_err(), "{status} accepted {t}");
            }
        }
    }

    #[test]
    fn open_notifies_admin_and_active_mechanics() {
        let outcome = ServiceRequest::open(
            &Actor::customer("c1"),
            &garage(),
            &vehicle(),
            Location::new(50.1, 14.4).unwrap(),
        )
        .unwrap();

        assert_eq!(outcome.value.status, RequestStatus::Pending);
        assert!(outcome.value.mechanic_id.is_none());
        let receivers: Vec<_> = outcome.notices.iter().map(|n| n.receiver_id.as_str()).collect();
        assert_eq!(receivers, vec!["admin1", "m1", "m2"]);
    }

    #[test]
    fn open_rejects_foreign_vehicle_and_closed_garage() {
        let err = ServiceRequest::open(
            &Actor::customer("c2"),
            &garage(),
            &vehicle(),
            Location::new(0.0, 0.0).unwrap(),
        )
        .unwrap_err();
        assert_eq!(err.code(), "not_found");

        let mut closed = garage();
        closed.approved = false;
        let err = ServiceRequest::open(
            &Actor::customer("c1"),
            &closed,
            &vehicle(),
            Location::new(0.0, 0.0).unwrap(),
        )
        .unwrap_err();
        assert_eq!(err, CoreError::not_found("garage g1"));
    }

    #[test]
    fn accept_assigns_mechanic() {
        let mut request = pending();
        request.accept(&Actor::mechanic("m1"), &garage()).unwrap();

        assert_eq!(request.status, RequestStatus::Accepted);
        assert_eq!(request.mechanic_id.as_deref(), Some("m1"));

        let err = request.accept(&Actor::mechanic("m2"), &garage()).unwrap_err();
        assert_eq!(err.code(), "conflict");
        assert_eq!(request.mechanic_id.as_deref(), Some("m1"));
    }

    #[test]
    fn outsider_mechanic_cannot_accept() {
        let mut request = pending();
        let err = request.accept(&Actor::mechanic("m9"), &garage()).unwrap_err();
        assert_eq!(err.code(), "forbidden");
    }

    #[test]
    fn only_assigned_mechanic_begins() {
        let mut request = pending();
        request.accept(&Actor::mechanic("m1"), &garage()).unwrap();

        assert_eq!(
            request.begin(&Actor::mechanic("m2"), &garage()).unwrap_err().code(),
            "forbidden"
        );
        request.begin(&Actor::mechanic("m1"), &garage()).unwrap();
        assert_eq!(request.status, RequestStatus::InProgress);
    }

    #[test]
    fn cancel_clears_mechanic_and_uses_default_reason() {
        let mut request = pending();
        request.accept(&Actor::mechanic("m1"), &garage()).unwrap();

        let notices = request.cancel(&Actor::customer("c1"), &garage(), None).unwrap();

        assert_eq!(request.status, RequestStatus::Cancelled);
        assert!(request.mechanic_id.is_none());
        assert_eq!(request.cancel_reason.as_deref(), Some(DEFAULT_CANCEL_REASON));
        let receivers: Vec<_> = notices.iter().map(|n| n.receiver_id.as_str()).collect();
        assert_eq!(receivers, vec!["admin1", "m1"]);
    }

    #[test]
    fn garage_admin_cancel_notifies_customer() {
        let mut request = pending();
        let notices = request
            .cancel(&Actor::garage_admin("admin1"), &garage(), Some("no tow truck"))
            .unwrap();

        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].receiver_id, "c1");
        assert!(notices[0].message.contains("no tow truck"));
    }

    #[test]
    fn in_progress_cannot_be_cancelled() {
        let mut request = pending();
        request.accept(&Actor::mechanic("m1"), &garage()).unwrap();
        request.begin(&Actor::mechanic("m1"), &garage()).unwrap();

        let err = request.cancel(&Actor::customer("c1"), &garage(), None).unwrap_err();
        assert_eq!(err.code(), "conflict");
        assert_eq!(request.status, RequestStatus::InProgress);
        assert_eq!(request.mechanic_id.as_deref(), Some("m1"));
    }

    #[test]
    fn mechanic_cannot_cancel() {
        let mut request = pending();
        let err = request.cancel(&Actor::mechanic("m1"), &garage(), None).unwrap_err();
        assert_eq!(err.code(), "forbidden");
    }

    #[test]
    fn complete_requires_status_updates() {
        let mut request = pending();
        request.accept(&Actor::mechanic("m1"), &garage()).unwrap();
        request.begin(&Actor::mechanic("m1"), &garage()).unwrap();

        let err = request.complete(&Actor::mechanic("m1"), &garage()).unwrap_err();
        assert_eq!(err, CoreError::conflict("no status updates"));
        assert_eq!(request.status, RequestStatus::InProgress);
    }

    #[test]
    fn deletion_only_in_terminal_status() {
        let mut request = pending();
        let customer = Actor::customer("c1");

        assert_eq!(
            request.ensure_deletable(&customer).unwrap_err().code(),
            "conflict"
        );
        request.cancel(&customer, &garage(), None).unwrap();
        assert!(request.ensure_deletable(&customer).is_ok());
        assert_eq!(
            request
                .ensure_deletable(&Actor::customer("c2"))
                .unwrap_err()
                .code(),
            "forbidden"
        );
    }
}
