//! Mechanic progress updates and the customer's approval of them.
//!
//! Updates are append-only: the description never changes and an update is
//! never deleted, corrections are posted as a new update. Approval is an audit
//! signal for the customer and does not gate ledger changes.
use chrono::Utc;

use crate::actor::{Actor, Role};
use crate::directory::Garage;
use crate::error::{CoreError, CoreResult};
use crate::fanout::{Notice, NotificationKind, Outcome};
use crate::guard::{self, Intent, Resource, Scope};
use crate::ledger::LedgerItem;
use crate::lifecycle::ServiceRequest;
use crate::types::TimeStamp;
use crate::utils::{self, prefix};

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct StatusUpdate {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub service_request_id: String,
    #[n(2)]
    pub mechanic_id: String,
    #[n(3)]
    pub description: String,
    #[n(4)]
    pub approved: bool,
    #[n(5)]
    pub created_at: TimeStamp<Utc>,
    #[n(6)]
    pub items: Vec<LedgerItem>,
}

impl ServiceRequest {
    pub fn update(&self, update_id: &str) -> Option<&StatusUpdate> {
        self.updates.iter().find(|u| u.id == update_id)
    }

    /// The assigned mechanic reports progress.
    pub fn post_update(
        &mut self,
        actor: &Actor,
        garage: &Garage,
        description: &str,
    ) -> CoreResult<Outcome<String>> {
        guard::ensure(actor, Resource::StatusUpdate(Scope::new(self, garage)), Intent::Write)?;
        if !self.is_assigned_mechanic(actor) {
            return Err(CoreError::forbidden(
                "only the assigned mechanic can post status updates",
            ));
        }
        if !self.status.is_workable() {
            return Err(CoreError::conflict(format!(
                "cannot post updates on a {} request",
                self.status
            )));
        }
        let description = description.trim();
        if description.is_empty() {
            return Err(CoreError::invalid("description is empty"));
        }

        let update = StatusUpdate {
            id: utils::new_id(prefix::UPDATE)?,
            service_request_id: self.id.clone(),
            mechanic_id: actor.id.clone(),
            description: description.to_string(),
            approved: false,
            created_at: TimeStamp::new(),
            items: vec![],
        };
        let update_id = update.id.clone();
        self.updates.push(update);

        let notice = Notice::new(
            &actor.id,
            &self.customer_id,
            NotificationKind::StatusUpdatePosted,
            format!("Request {}: {}", self.id, description),
        );
        Ok(Outcome::new(update_id, vec![notice]))
    }

    /// The customer (or an administrator) accepts or rejects an update.
    pub fn set_approval(
        &mut self,
        actor: &Actor,
        garage: &Garage,
        update_id: &str,
        approved: bool,
    ) -> CoreResult<Vec<Notice>> {
        guard::ensure(actor, Resource::StatusUpdate(Scope::new(self, garage)), Intent::Write)?;
        if actor.is(Role::Mechanic) {
            return Err(CoreError::forbidden(
                "only the customer can approve status updates",
            ));
        }

        let update = self
            .updates
            .iter_mut()
            .find(|u| u.id == update_id)
            .ok_or_else(|| CoreError::not_found(format!("status update {update_id}")))?;
        update.approved = approved;

        let (kind, verdict) = if approved {
            (NotificationKind::StatusUpdateApproved, "approved")
        } else {
            (NotificationKind::StatusUpdateRejected, "rejected")
        };
        Ok(vec![Notice::new(
            &actor.id,
            &update.mechanic_id,
            kind,
            format!("Status update {} was {}", update.id, verdict),
        )])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::RequestStatus;
    use crate::types::Location;

    fn garage() -> Garage {
        Garage::new("g1", "Northside", "admin1")
            .with_mechanic("m1")
            .with_mechanic("m2")
    }

    fn request(status: RequestStatus) -> ServiceRequest {
        ServiceRequest {
            id: "req_1".into(),
            customer_id: "c1".into(),
            garage_id: "g1".into(),
            vehicle_id: "v1".into(),
            mechanic_id: status.requires_mechanic().then(|| "m1".to_string()),
            location: Location { lat: 0.0, lon: 0.0 },
            status,
            created_at: TimeStamp::new(),
            cancel_reason: None,
            updates: vec![],
        }
    }

    #[test]
    fn post_update_notifies_customer() {
        let mut r = request(RequestStatus::Accepted);
        let outcome = r
            .post_update(&Actor::mechanic("m1"), &garage(), "  brake pads worn ")
            .unwrap();

        let update = r.update(&outcome.value).unwrap();
        assert_eq!(update.description, "brake pads worn");
        assert!(!update.approved);
        assert_eq!(outcome.notices[0].receiver_id, "c1");
        assert_eq!(outcome.notices[0].kind, NotificationKind::StatusUpdatePosted);
    }

    #[test]
    fn post_update_requires_assignment_and_workable_status() {
        let mut r = request(RequestStatus::InProgress);
        assert_eq!(
            r.post_update(&Actor::mechanic("m2"), &garage(), "x").unwrap_err().code(),
            "forbidden"
        );
        assert_eq!(
            r.post_update(&Actor::customer("c1"), &garage(), "x").unwrap_err().code(),
            "forbidden"
        );
        assert_eq!(
            r.post_update(&Actor::mechanic("m1"), &garage(), "   ").unwrap_err().code(),
            "invalid"
        );

        let mut done = request(RequestStatus::Completed);
        assert_eq!(
            done.post_update(&Actor::mechanic("m1"), &garage(), "late note")
                .unwrap_err()
                .code(),
            "conflict"
        );
    }

    #[test]
    fn approval_by_owner_notifies_mechanic() {
        let mut r = request(RequestStatus::InProgress);
        let id = r
            .post_update(&Actor::mechanic("m1"), &garage(), "replaced filter")
            .unwrap()
            .value;

        let notices = r.set_approval(&Actor::customer("c1"), &garage(), &id, true).unwrap();
        assert!(r.update(&id).unwrap().approved);
        assert_eq!(notices[0].receiver_id, "m1");
        assert_eq!(notices[0].kind, NotificationKind::StatusUpdateApproved);

        let notices = r.set_approval(&Actor::customer("c1"), &garage(), &id, false).unwrap();
        assert!(!r.update(&id).unwrap().approved);
        assert_eq!(notices[0].kind, NotificationKind::StatusUpdateRejected);
    }

    #[test]
    fn approval_by_others_is_forbidden() {
        let mut r = request(RequestStatus::InProgress);
        let id = r
            .post_update(&Actor::mechanic("m1"), &garage(), "replaced filter")
            .unwrap()
            .value;

        for actor in [Actor::customer("c2"), Actor::mechanic("m1")] {
            let err = r.set_approval(&actor, &garage(), &id, true).unwrap_err();
            assert_eq!(err.code(), "forbidden");
        }
        assert!(r.set_approval(&Actor::system_admin("root"), &garage(), &id, true).is_ok());
    }

    #[test]
    fn approval_of_unknown_update() {
        let mut r = request(RequestStatus::InProgress);
        let err = r
            .set_approval(&Actor::customer("c1"), &garage(), "upd_missing", true)
            .unwrap_err();
        assert_eq!(err.code(), "not_found");
    }
}
