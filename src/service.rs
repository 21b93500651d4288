//! Service layer API for service request operations
//!
//! Every operation loads what it needs, applies the workflow step inside a
//! store transaction and, once that committed, hands the emitted notices to
//! the fan-out.
use std::collections::HashMap;

use chrono::Utc;

use crate::actor::{Actor, Role};
use crate::billing::{self, BillingPolicy, Invoice, Payment, PaymentMethod, PaymentStatus};
use crate::config::Config;
use crate::directory::Garage;
use crate::error::{CoreError, CoreResult};
use crate::fanout::{Notice, Notification, NotificationFanout, NotificationKind, Outcome, Selection};
use crate::guard::{self, Intent, Resource, Scope};
use crate::ledger::LedgerSummary;
use crate::lifecycle::ServiceRequest;
use crate::store::Store;
use crate::types::{Location, ServiceId, TimeStamp};

/// Ids of the billing records written by a completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub invoice_id: String,
    pub payment_id: String,
}

#[derive(Clone)]
pub struct GarageService {
    store: Store,
    fanout: NotificationFanout,
    billing: BillingPolicy,
}

impl GarageService {
    pub fn new(store: Store, billing: BillingPolicy) -> Self {
        Self {
            fanout: NotificationFanout::new(store.clone()),
            store,
            billing,
        }
    }

    pub fn from_config(config: &Config) -> CoreResult<Self> {
        let store = Store::open(&config.storage)?;
        Ok(Self::new(store, BillingPolicy::from(&config.billing)))
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn fanout(&self) -> &NotificationFanout {
        &self.fanout
    }

    fn publish<T>(&self, outcome: Outcome<T>) -> T {
        self.fanout.dispatch(outcome.notices);
        outcome.value
    }

    fn garage(&self, garage_id: &str) -> CoreResult<Garage> {
        self.store
            .garage(garage_id)?
            .ok_or_else(|| CoreError::not_found(format!("garage {garage_id}")))
    }

    /// Loads the request and its garage outside of any transaction. Both the
    /// garage id of a request and the garage roster are owned elsewhere, so
    /// they are safe to read up front.
    fn load(&self, request_id: &str) -> CoreResult<(ServiceRequest, Garage)> {
        let request = self
            .store
            .request(request_id)?
            .ok_or_else(|| CoreError::not_found(format!("service request {request_id}")))?;
        let garage = self.garage(&request.garage_id)?;
        Ok((request, garage))
    }

    fn request_of_update(&self, update_id: &str) -> CoreResult<String> {
        self.store
            .request_id_for_update(update_id)?
            .ok_or_else(|| CoreError::not_found(format!("status update {update_id}")))
    }

    fn request_of_item(&self, item_id: &str) -> CoreResult<String> {
        self.store
            .request_id_for_item(item_id)?
            .ok_or_else(|| CoreError::not_found(format!("ledger item {item_id}")))
    }

    /// Runs a workflow step against the stored aggregate and publishes its notices.
    fn apply<T, F>(&self, request_id: &str, step: F) -> CoreResult<T>
    where
        F: Fn(&mut ServiceRequest, &Garage) -> CoreResult<Outcome<T>>,
    {
        let (_, garage) = self.load(request_id)?;
        let outcome = self
            .store
            .mutate_request(request_id, |request| step(request, &garage))?;
        Ok(self.publish(outcome))
    }

    // request lifecycle

    pub fn create_request(
        &self,
        actor: &Actor,
        garage_id: &str,
        vehicle_id: &str,
        lat: f64,
        lon: f64,
    ) -> CoreResult<String> {
        let garage = self.garage(garage_id)?;
        let vehicle = self
            .store
            .vehicle(vehicle_id)?
            .ok_or_else(|| CoreError::not_found(format!("vehicle {vehicle_id}")))?;
        let location = Location::new(lat, lon)?;

        let outcome = ServiceRequest::open(actor, &garage, &vehicle, location)?;
        self.store.insert_request(&outcome.value)?;
        log::info!(
            "request {} opened by {} at garage {}",
            outcome.value.id,
            actor.id,
            garage.id
        );

        Ok(self.publish(outcome).id)
    }

    pub fn accept_request(&self, actor: &Actor, request_id: &str) -> CoreResult<()> {
        self.apply(request_id, |request, garage| {
            Ok(Outcome::new((), request.accept(actor, garage)?))
        })?;
        log::info!("request {request_id} accepted by {}", actor.id);
        Ok(())
    }

    pub fn begin_request(&self, actor: &Actor, request_id: &str) -> CoreResult<()> {
        self.apply(request_id, |request, garage| {
            Ok(Outcome::new((), request.begin(actor, garage)?))
        })?;
        log::info!("request {request_id} in progress");
        Ok(())
    }

    pub fn cancel_request(
        &self,
        actor: &Actor,
        request_id: &str,
        reason: Option<&str>,
    ) -> CoreResult<()> {
        self.apply(request_id, |request, garage| {
            Ok(Outcome::new((), request.cancel(actor, garage, reason)?))
        })?;
        log::info!("request {request_id} cancelled by {}", actor.id);
        Ok(())
    }

    /// Completes the request and writes its invoice and payment in the same
    /// transaction.
    pub fn complete_request(
        &self,
        actor: &Actor,
        request_id: &str,
        method: Option<PaymentMethod>,
    ) -> CoreResult<Completion> {
        let (_, garage) = self.load(request_id)?;
        let outcome = self.store.complete_request(request_id, |request| {
            self.billing.complete(request, actor, &garage, method)
        })?;
        let settlement = self.publish(outcome);
        log::info!(
            "request {request_id} completed, invoice {} for {}",
            settlement.invoice.id,
            settlement.invoice.total_amount
        );

        Ok(Completion {
            invoice_id: settlement.invoice.id,
            payment_id: settlement.payment.id,
        })
    }

    pub fn delete_request(&self, actor: &Actor, request_id: &str) -> CoreResult<()> {
        self.store
            .delete_request(request_id, |request| request.ensure_deletable(actor))?;
        log::info!("request {request_id} deleted by {}", actor.id);
        Ok(())
    }

    // status updates

    pub fn post_status_update(
        &self,
        actor: &Actor,
        request_id: &str,
        description: &str,
    ) -> CoreResult<String> {
        let update_id = self.apply(request_id, |request, garage| {
            request.post_update(actor, garage, description)
        })?;
        log::info!("status update {update_id} posted on {request_id}");
        Ok(update_id)
    }

    pub fn set_update_approval(
        &self,
        actor: &Actor,
        update_id: &str,
        approved: bool,
    ) -> CoreResult<()> {
        let request_id = self.request_of_update(update_id)?;
        self.apply(&request_id, |request, garage| {
            Ok(Outcome::new(
                (),
                request.set_approval(actor, garage, update_id, approved)?,
            ))
        })?;
        log::info!("status update {update_id} approved={approved} by {}", actor.id);
        Ok(())
    }

    // ledger

    pub fn add_ledger_item(
        &self,
        actor: &Actor,
        update_id: &str,
        service_id: ServiceId,
        expected_date: TimeStamp<Utc>,
        price: i64,
    ) -> CoreResult<String> {
        let request_id = self.request_of_update(update_id)?;
        let service = self
            .store
            .catalog_service(service_id)?
            .ok_or_else(|| CoreError::not_found(format!("service {service_id}")))?;

        let item_id = self.apply(&request_id, |request, garage| {
            request.add_item(actor, garage, update_id, &service, expected_date.clone(), price)
        })?;
        log::info!("ledger item {item_id} (service {service_id}) booked on {request_id}");
        Ok(item_id)
    }

    pub fn finish_ledger_item(
        &self,
        actor: &Actor,
        item_id: &str,
        finished: bool,
        price: Option<i64>,
    ) -> CoreResult<()> {
        let request_id = self.request_of_item(item_id)?;
        self.apply(&request_id, |request, garage| {
            Ok(Outcome::new(
                (),
                request.finish_item(actor, garage, item_id, finished, price)?,
            ))
        })?;
        log::info!("ledger item {item_id} finished={finished}");
        Ok(())
    }

    pub fn remove_ledger_item(&self, actor: &Actor, item_id: &str) -> CoreResult<()> {
        let request_id = self.request_of_item(item_id)?;
        self.apply(&request_id, |request, garage| {
            Ok(Outcome::new((), request.remove_item(actor, garage, item_id)?))
        })?;
        log::info!("ledger item {item_id} removed from {request_id}");
        Ok(())
    }

    // reads

    pub fn get_request(&self, actor: &Actor, request_id: &str) -> CoreResult<ServiceRequest> {
        let (request, garage) = self.load(request_id)?;
        guard::ensure(actor, Resource::ServiceRequest(Scope::new(&request, &garage)), Intent::Read)?;
        Ok(request)
    }

    /// Every request the actor is allowed to see.
    pub fn requests_for(&self, actor: &Actor) -> CoreResult<Vec<ServiceRequest>> {
        let mut garages: HashMap<String, Option<Garage>> = HashMap::new();
        let mut visible = vec![];
        for request in self.store.requests()? {
            if !garages.contains_key(&request.garage_id) {
                let garage = self.store.garage(&request.garage_id)?;
                garages.insert(request.garage_id.clone(), garage);
            }
            let Some(Some(garage)) = garages.get(&request.garage_id) else {
                continue;
            };
            if guard::can_access(actor, Resource::ServiceRequest(Scope::new(&request, garage)), Intent::Read) {
                visible.push(request);
            }
        }
        log::debug!("{} sees {} requests", actor.id, visible.len());
        Ok(visible)
    }

    pub fn ledger_summary(&self, actor: &Actor, request_id: &str) -> CoreResult<LedgerSummary> {
        self.get_request(actor, request_id)?.ledger_summary()
    }

    // billing

    /// Checks that `actor` may see the billing records of `request_id`.
    /// Billing outlives the request, so once it is deleted only system
    /// administrators can still read it.
    fn ensure_billing_access(&self, actor: &Actor, request_id: &str, intent: Intent) -> CoreResult<()> {
        if actor.is(Role::SystemAdmin) {
            return Ok(());
        }
        let (request, garage) = match self.load(request_id) {
            Ok(found) => found,
            Err(CoreError::NotFound(_)) => {
                return Err(CoreError::forbidden("billing records of a deleted request"));
            }
            Err(e) => return Err(e),
        };
        guard::ensure(actor, Resource::ServiceRequest(Scope::new(&request, &garage)), intent)
    }

    pub fn invoice_for(&self, actor: &Actor, request_id: &str) -> CoreResult<Invoice> {
        let invoice = self
            .store
            .invoice_for_request(request_id)?
            .ok_or_else(|| CoreError::not_found(format!("invoice for {request_id}")))?;
        self.ensure_billing_access(actor, request_id, Intent::Read)?;
        Ok(invoice)
    }

    pub fn payment(&self, actor: &Actor, payment_id: &str) -> CoreResult<Payment> {
        let payment = self
            .store
            .payment(payment_id)?
            .ok_or_else(|| CoreError::not_found(format!("payment {payment_id}")))?;
        self.ensure_billing_access(actor, &payment.service_request_id, Intent::Read)?;
        Ok(payment)
    }

    /// Records the outcome of a payment. Garage and system administrators keep
    /// the books.
    pub fn record_payment(
        &self,
        actor: &Actor,
        payment_id: &str,
        status: PaymentStatus,
    ) -> CoreResult<Invoice> {
        if !matches!(actor.role, Role::GarageAdmin | Role::SystemAdmin) {
            return Err(CoreError::forbidden("only administrators record payments"));
        }
        let payment = self
            .store
            .payment(payment_id)?
            .ok_or_else(|| CoreError::not_found(format!("payment {payment_id}")))?;
        self.ensure_billing_access(actor, &payment.service_request_id, Intent::Write)?;

        let (payment, invoice) = self.store.settle_payment(payment_id, |payment, invoice| {
            billing::record_payment(payment, invoice, status)
        })?;
        log::info!("payment {payment_id} is now {}", payment.status);

        if let Some(request) = self.store.request(&payment.service_request_id)? {
            self.fanout.dispatch(vec![Notice::new(
                &actor.id,
                &request.customer_id,
                NotificationKind::PaymentRecorded,
                format!("Payment {} for request {} is {}", payment.id, request.id, payment.status),
            )]);
        }
        Ok(invoice)
    }

    // notifications of the calling actor

    pub fn notifications(&self, actor: &Actor) -> CoreResult<Vec<Notification>> {
        self.fanout.list(&actor.id)
    }

    pub fn unread_notifications(&self, actor: &Actor) -> CoreResult<usize> {
        self.fanout.unread_count(&actor.id)
    }

    pub fn mark_notifications_read(&self, actor: &Actor, selection: &Selection) -> CoreResult<usize> {
        self.fanout.mark_read(&actor.id, selection)
    }

    pub fn delete_notifications(&self, actor: &Actor, selection: &Selection) -> CoreResult<usize> {
        self.fanout.delete(&actor.id, selection)
    }
}
