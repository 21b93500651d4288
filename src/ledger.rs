//! Billable work booked under status updates.
//!
//! Only finished items count towards the billable total. A finished item can
//! no longer be removed, and a catalog service can be booked at most once per
//! status update.
use chrono::Utc;

use crate::actor::Actor;
use crate::directory::{CatalogService, Garage};
use crate::error::{CoreError, CoreResult};
use crate::fanout::{Notice, NotificationKind, Outcome};
use crate::guard::{self, Intent, Resource, Scope};
use crate::lifecycle::ServiceRequest;
use crate::types::{Amount, ServiceId, TimeStamp, price_from};
use crate::utils::{self, prefix};

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct LedgerItem {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub status_update_id: String,
    #[n(2)]
    pub service_id: ServiceId,
    #[n(3)]
    pub expected_date: TimeStamp<Utc>,
    // catalog price at booking time
    #[n(4)]
    pub unit_price: Amount,
    #[n(5)]
    pub total_price: Amount,
    #[n(6)]
    pub finished: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LedgerSummary {
    pub finished_total: Amount,
    pub open_total: Amount,
    pub finished_items: usize,
    pub open_items: usize,
}

fn ledger_overflow() -> CoreError {
    CoreError::invalid("ledger total overflows")
}

/// Sum of `total_price` over finished items.
pub fn ledger_total<'a>(items: impl IntoIterator<Item = &'a LedgerItem>) -> CoreResult<Amount> {
    items
        .into_iter()
        .filter(|item| item.finished)
        .try_fold(0, |acc: Amount, item| {
            acc.checked_add(item.total_price).ok_or_else(ledger_overflow)
        })
}

impl ServiceRequest {
    pub fn items(&self) -> impl Iterator<Item = &LedgerItem> {
        self.updates.iter().flat_map(|u| u.items.iter())
    }

    pub fn item(&self, item_id: &str) -> Option<&LedgerItem> {
        self.items().find(|i| i.id == item_id)
    }

    pub fn ledger_total(&self) -> CoreResult<Amount> {
        ledger_total(self.items())
    }

    pub fn ledger_summary(&self) -> CoreResult<LedgerSummary> {
        self.items()
            .try_fold(LedgerSummary::default(), |mut summary, item| {
                if item.finished {
                    summary.finished_total = summary.finished_total.checked_add(item.total_price)?;
                    summary.finished_items += 1;
                } else {
                    summary.open_total = summary.open_total.checked_add(item.total_price)?;
                    summary.open_items += 1;
                }
                Some(summary)
            })
            .ok_or_else(ledger_overflow)
    }

    /// Every item, finished or not, must fit into one billable total, with
    /// `price` standing in for the item `replacing` when given.
    fn ensure_ledger_room(&self, replacing: Option<&str>, price: Amount) -> CoreResult<()> {
        self.items()
            .filter(|item| Some(item.id.as_str()) != replacing)
            .try_fold(price, |acc: Amount, item| acc.checked_add(item.total_price))
            .map(|_| ())
            .ok_or_else(ledger_overflow)
    }

    pub fn all_items_finished(&self) -> bool {
        self.items().all(|i| i.finished)
    }

    /// Locates an item as (update index, item index).
    fn locate_item(&self, item_id: &str) -> Option<(usize, usize)> {
        self.updates.iter().enumerate().find_map(|(u, update)| {
            update
                .items
                .iter()
                .position(|i| i.id == item_id)
                .map(|i| (u, i))
        })
    }

    fn ensure_ledger_writer(&self, actor: &Actor, garage: &Garage) -> CoreResult<()> {
        guard::ensure(actor, Resource::LedgerItem(Scope::new(self, garage)), Intent::Write)?;
        if !self.is_assigned_mechanic(actor) {
            return Err(CoreError::forbidden(
                "only the assigned mechanic can change the ledger",
            ));
        }
        if !self.status.is_workable() {
            return Err(CoreError::conflict(format!(
                "the ledger of a {} request is closed",
                self.status
            )));
        }
        Ok(())
    }

    /// Books a catalog service under a status update.
    pub fn add_item(
        &mut self,
        actor: &Actor,
        garage: &Garage,
        update_id: &str,
        service: &CatalogService,
        expected_date: TimeStamp<Utc>,
        price: i64,
    ) -> CoreResult<Outcome<String>> {
        let position = self
            .updates
            .iter()
            .position(|u| u.id == update_id)
            .ok_or_else(|| CoreError::not_found(format!("status update {update_id}")))?;
        self.ensure_ledger_writer(actor, garage)?;
        if service.removed {
            return Err(CoreError::not_found(format!("service {}", service.id)));
        }
        let total_price = price_from(price)?;
        self.ensure_ledger_room(None, total_price)?;
        if expected_date < self.created_at {
            return Err(CoreError::invalid(
                "expected date lies before the request was filed",
            ));
        }

        let update = &mut self.updates[position];
        if update.items.iter().any(|i| i.service_id == service.id) {
            return Err(CoreError::conflict(format!(
                "service {} is already booked under update {}",
                service.id, update_id
            )));
        }

        let item = LedgerItem {
            id: utils::new_id(prefix::ITEM)?,
            status_update_id: update.id.clone(),
            service_id: service.id,
            expected_date,
            unit_price: service.price,
            total_price,
            finished: false,
        };
        let item_id = item.id.clone();
        update.items.push(item);

        let notice = Notice::new(
            &actor.id,
            &self.customer_id,
            NotificationKind::ServiceAdded,
            format!("{} added to request {} for {}", service.name, self.id, total_price),
        );
        Ok(Outcome::new(item_id, vec![notice]))
    }

    /// Marks an item finished or reopens it. A corrected price is only
    /// accepted together with the transition to finished. Finishing and
    /// reopening both notify the customer.
    pub fn finish_item(
        &mut self,
        actor: &Actor,
        garage: &Garage,
        item_id: &str,
        finished: bool,
        price: Option<i64>,
    ) -> CoreResult<Vec<Notice>> {
        let (u, i) = self
            .locate_item(item_id)
            .ok_or_else(|| CoreError::not_found(format!("ledger item {item_id}")))?;
        self.ensure_ledger_writer(actor, garage)?;

        let was_finished = self.updates[u].items[i].finished;
        let finishing = finished && !was_finished;
        let reopening = was_finished && !finished;
        let corrected = match price {
            Some(_) if !finishing => {
                return Err(CoreError::invalid(
                    "price can only be corrected when finishing an item",
                ));
            }
            Some(raw) => Some(price_from(raw)?),
            None => None,
        };
        if let Some(total) = corrected {
            self.ensure_ledger_room(Some(item_id), total)?;
        }

        let item = &mut self.updates[u].items[i];
        item.finished = finished;
        if let Some(total) = corrected {
            item.total_price = total;
        }

        let (kind, message) = if finishing {
            (
                NotificationKind::ServiceFinished,
                format!(
                    "Service {} on request {} is finished ({})",
                    item.service_id, self.id, item.total_price
                ),
            )
        } else if reopening {
            (
                NotificationKind::ServiceReopened,
                format!("Service {} on request {} was reopened", item.service_id, self.id),
            )
        } else {
            return Ok(vec![]);
        };
        Ok(vec![Notice::new(&actor.id, &self.customer_id, kind, message)])
    }

    /// Drops an unfinished item.
    pub fn remove_item(
        &mut self,
        actor: &Actor,
        garage: &Garage,
        item_id: &str,
    ) -> CoreResult<Vec<Notice>> {
        let (u, i) = self
            .locate_item(item_id)
            .ok_or_else(|| CoreError::not_found(format!("ledger item {item_id}")))?;
        self.ensure_ledger_writer(actor, garage)?;

        if self.updates[u].items[i].finished {
            return Err(CoreError::conflict("a finished item cannot be removed"));
        }
        let item = self.updates[u].items.remove(i);

        Ok(vec![Notice::new(
            &actor.id,
            &self.customer_id,
            NotificationKind::ServiceRemoved,
            format!("Service {} was removed from request {}", item.service_id, self.id),
        )])
    }
}
