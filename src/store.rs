//! sled backed persistence.
//!
//! Every coordination decision (claiming a request, booking a ledger line,
//! completing and billing) is taken inside a sled transaction over the
//! aggregate record, so concurrent callers are serialized by the store and the
//! loser observes the winner's write. Records are CBOR encoded.
use std::collections::HashSet;

use sled::transaction::{
    ConflictableTransactionResult, TransactionResult, TransactionalTree,
};
use sled::{Db, Transactional, Tree};

use crate::billing::{Invoice, Payment, Settlement};
use crate::config::StorageConfig;
use crate::directory::{CatalogService, Garage, Vehicle};
use crate::error::{CoreError, CoreResult};
use crate::fanout::{Notification, Outcome};
use crate::lifecycle::ServiceRequest;
use crate::types::ServiceId;

#[derive(Clone)]
pub struct Store {
    db: Db,
    requests: Tree,
    update_index: Tree,
    item_index: Tree,
    // keyed by service request id, which makes the invoice unique per request
    invoices: Tree,
    invoice_index: Tree,
    payments: Tree,
    notifications: Tree,
    garages: Tree,
    vehicles: Tree,
    catalog: Tree,
}

fn decode<T: for<'b> minicbor::Decode<'b, ()>>(bytes: &[u8]) -> CoreResult<T> {
    Ok(minicbor::decode(bytes)?)
}

fn encode<T: minicbor::Encode<()>>(value: &T) -> CoreResult<Vec<u8>> {
    Ok(minicbor::to_vec(value)?)
}

fn read<T: for<'b> minicbor::Decode<'b, ()>>(tree: &Tree, key: &[u8]) -> CoreResult<Option<T>> {
    tree.get(key)?.map(|bytes| decode(&bytes)).transpose()
}

fn tx_read<T: for<'b> minicbor::Decode<'b, ()>>(
    tree: &TransactionalTree,
    key: &[u8],
) -> ConflictableTransactionResult<Option<T>, CoreError> {
    Ok(tree.get(key)?.map(|bytes| decode(&bytes)).transpose()?)
}

fn tx_write<T: minicbor::Encode<()>>(
    tree: &TransactionalTree,
    key: &[u8],
    value: &T,
) -> ConflictableTransactionResult<(), CoreError> {
    tree.insert(key, encode(value)?)?;
    Ok(())
}

fn missing_request(request_id: &str) -> CoreError {
    CoreError::not_found(format!("service request {request_id}"))
}

/// Keeps the update and item lookup trees in step with an aggregate write.
fn sync_indexes(
    before: Option<&ServiceRequest>,
    after: Option<&ServiceRequest>,
    updates: &TransactionalTree,
    items: &TransactionalTree,
) -> ConflictableTransactionResult<(), CoreError> {
    let update_ids = |r: Option<&ServiceRequest>| -> HashSet<String> {
        r.map(|r| r.updates.iter().map(|u| u.id.clone()).collect())
            .unwrap_or_default()
    };
    let item_ids = |r: Option<&ServiceRequest>| -> HashSet<String> {
        r.map(|r| r.items().map(|i| i.id.clone()).collect())
            .unwrap_or_default()
    };
    let owner = after.or(before).map(|r| r.id.clone()).unwrap_or_default();

    for (tree, old, new) in [
        (updates, update_ids(before), update_ids(after)),
        (items, item_ids(before), item_ids(after)),
    ] {
        for id in new.difference(&old) {
            tree.insert(id.as_bytes(), owner.as_bytes())?;
        }
        for id in old.difference(&new) {
            tree.remove(id.as_bytes())?;
        }
    }
    Ok(())
}

impl Store {
    /// Opens the database described by the storage configuration.
    pub fn open(config: &StorageConfig) -> CoreResult<Self> {
        let db = sled::Config::new()
            .path(&config.path)
            .temporary(config.temporary)
            .open()?;
        Self::from_db(db)
    }

    /// A throwaway database, removed when dropped.
    pub fn temporary() -> CoreResult<Self> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    pub fn from_db(db: Db) -> CoreResult<Self> {
        Ok(Self {
            requests: db.open_tree("requests")?,
            update_index: db.open_tree("update_index")?,
            item_index: db.open_tree("item_index")?,
            invoices: db.open_tree("invoices")?,
            invoice_index: db.open_tree("invoice_index")?,
            payments: db.open_tree("payments")?,
            notifications: db.open_tree("notifications")?,
            garages: db.open_tree("garages")?,
            vehicles: db.open_tree("vehicles")?,
            catalog: db.open_tree("catalog")?,
            db,
        })
    }

    pub fn flush(&self) -> CoreResult<()> {
        self.db.flush()?;
        Ok(())
    }

    // directory records

    pub fn put_garage(&self, garage: &Garage) -> CoreResult<()> {
        self.garages.insert(garage.id.as_bytes(), encode(garage)?)?;
        Ok(())
    }

    pub fn garage(&self, garage_id: &str) -> CoreResult<Option<Garage>> {
        read(&self.garages, garage_id.as_bytes())
    }

    pub fn put_vehicle(&self, vehicle: &Vehicle) -> CoreResult<()> {
        self.vehicles.insert(vehicle.id.as_bytes(), encode(vehicle)?)?;
        Ok(())
    }

    pub fn vehicle(&self, vehicle_id: &str) -> CoreResult<Option<Vehicle>> {
        read(&self.vehicles, vehicle_id.as_bytes())
    }

    pub fn put_catalog_service(&self, service: &CatalogService) -> CoreResult<()> {
        self.catalog
            .insert(&service.id.to_be_bytes()[..], encode(service)?)?;
        Ok(())
    }

    pub fn catalog_service(&self, service_id: ServiceId) -> CoreResult<Option<CatalogService>> {
        read(&self.catalog, &service_id.to_be_bytes())
    }

    // service requests

    /// Stores a freshly opened request. Fails if the id is already taken.
    pub fn insert_request(&self, request: &ServiceRequest) -> CoreResult<()> {
        self.requests
            .compare_and_swap(request.id.as_bytes(), None::<&[u8]>, Some(encode(request)?))?
            .map_err(|_| CoreError::conflict(format!("request id {} is taken", request.id)))
    }

    pub fn request(&self, request_id: &str) -> CoreResult<Option<ServiceRequest>> {
        read(&self.requests, request_id.as_bytes())
    }

    pub fn requests(&self) -> CoreResult<Vec<ServiceRequest>> {
        self.requests
            .iter()
            .values()
            .map(|bytes| decode(&bytes?))
            .collect()
    }

    pub fn request_id_for_update(&self, update_id: &str) -> CoreResult<Option<String>> {
        Ok(self
            .update_index
            .get(update_id.as_bytes())?
            .map(|v| String::from_utf8_lossy(&v).into_owned()))
    }

    pub fn request_id_for_item(&self, item_id: &str) -> CoreResult<Option<String>> {
        Ok(self
            .item_index
            .get(item_id.as_bytes())?
            .map(|v| String::from_utf8_lossy(&v).into_owned()))
    }

    /// Runs `f` against the current aggregate and writes the result back
    /// atomically. `f` may run more than once when sled retries the
    /// transaction, so it must not have side effects.
    pub fn mutate_request<T, F>(&self, request_id: &str, f: F) -> CoreResult<T>
    where
        F: Fn(&mut ServiceRequest) -> CoreResult<T>,
    {
        let key = request_id.as_bytes();
        let result: TransactionResult<T, CoreError> =
            (&self.requests, &self.update_index, &self.item_index).transaction(
                |(requests, updates, items)| {
                    let before: ServiceRequest =
                        tx_read(requests, key)?.ok_or_else(|| missing_request(request_id))?;
                    let mut after = before.clone();
                    let value = f(&mut after)?;

                    sync_indexes(Some(&before), Some(&after), updates, items)?;
                    tx_write(requests, key, &after)?;
                    Ok(value)
                },
            );
        Ok(result?)
    }

    /// Removes the aggregate and its lookup entries if `check` allows it.
    pub fn delete_request<F>(&self, request_id: &str, check: F) -> CoreResult<ServiceRequest>
    where
        F: Fn(&ServiceRequest) -> CoreResult<()>,
    {
        let key = request_id.as_bytes();
        let result: TransactionResult<ServiceRequest, CoreError> =
            (&self.requests, &self.update_index, &self.item_index).transaction(
                |(requests, updates, items)| {
                    let request: ServiceRequest =
                        tx_read(requests, key)?.ok_or_else(|| missing_request(request_id))?;
                    check(&request)?;

                    sync_indexes(Some(&request), None, updates, items)?;
                    requests.remove(key)?;
                    Ok(request)
                },
            );
        Ok(result?)
    }

    /// Completion and billing in one transaction. `f` flips the aggregate and
    /// produces the billing records; the invoice slot of the request must
    /// still be empty for anything to be written.
    pub fn complete_request<F>(&self, request_id: &str, f: F) -> CoreResult<Outcome<Settlement>>
    where
        F: Fn(&mut ServiceRequest) -> CoreResult<Outcome<Settlement>>,
    {
        let key = request_id.as_bytes();
        let result: TransactionResult<Outcome<Settlement>, CoreError> = (
            &self.requests,
            &self.invoices,
            &self.invoice_index,
            &self.payments,
        )
            .transaction(|(requests, invoices, invoice_index, payments)| {
                let mut request: ServiceRequest =
                    tx_read(requests, key)?.ok_or_else(|| missing_request(request_id))?;
                let outcome = f(&mut request)?;

                if invoices.get(key)?.is_some() {
                    return Err(CoreError::conflict("already completed").into());
                }
                let Settlement { invoice, payment } = &outcome.value;
                tx_write(requests, key, &request)?;
                tx_write(invoices, key, invoice)?;
                invoice_index.insert(invoice.id.as_bytes(), key)?;
                tx_write(payments, payment.id.as_bytes(), payment)?;
                Ok(outcome)
            });
        Ok(result?)
    }

    // billing records

    pub fn invoice_for_request(&self, request_id: &str) -> CoreResult<Option<Invoice>> {
        read(&self.invoices, request_id.as_bytes())
    }

    pub fn invoice(&self, invoice_id: &str) -> CoreResult<Option<Invoice>> {
        match self.invoice_index.get(invoice_id.as_bytes())? {
            Some(request_id) => read(&self.invoices, &request_id),
            None => Ok(None),
        }
    }

    pub fn payment(&self, payment_id: &str) -> CoreResult<Option<Payment>> {
        read(&self.payments, payment_id.as_bytes())
    }

    /// Applies `f` to a payment and its invoice and writes both back together.
    pub fn settle_payment<F>(&self, payment_id: &str, f: F) -> CoreResult<(Payment, Invoice)>
    where
        F: Fn(&mut Payment, &mut Invoice) -> CoreResult<()>,
    {
        let result: TransactionResult<(Payment, Invoice), CoreError> = (&self.payments, &self.invoices)
            .transaction(|(payments, invoices)| {
                let mut payment: Payment = tx_read(payments, payment_id.as_bytes())?
                    .ok_or_else(|| CoreError::not_found(format!("payment {payment_id}")))?;
                let invoice_key = payment.service_request_id.as_bytes().to_vec();
                let mut invoice: Invoice = tx_read(invoices, &invoice_key)?.ok_or_else(|| {
                    CoreError::not_found(format!("invoice for payment {payment_id}"))
                })?;

                f(&mut payment, &mut invoice)?;

                tx_write(payments, payment_id.as_bytes(), &payment)?;
                tx_write(invoices, &invoice_key, &invoice)?;
                Ok((payment, invoice))
            });
        Ok(result?)
    }

    // notifications

    /// Inbox key prefix of a receiver. The id is length-prefixed so that no
    /// receiver's prefix is a prefix of another receiver's keys.
    fn inbox_prefix(receiver_id: &str) -> Vec<u8> {
        let mut key = (receiver_id.len() as u64).to_be_bytes().to_vec();
        key.extend_from_slice(receiver_id.as_bytes());
        key
    }

    fn notification_key(receiver_id: &str, notification_id: &str) -> Vec<u8> {
        let mut key = Self::inbox_prefix(receiver_id);
        key.extend_from_slice(notification_id.as_bytes());
        key
    }

    pub fn put_notification(&self, notification: &Notification) -> CoreResult<()> {
        self.notifications.insert(
            Self::notification_key(&notification.receiver_id, &notification.id),
            encode(notification)?,
        )?;
        Ok(())
    }

    /// All notifications addressed to `receiver_id`, oldest first.
    pub fn notifications_of(&self, receiver_id: &str) -> CoreResult<Vec<Notification>> {
        let mut found = self
            .notifications
            .scan_prefix(Self::inbox_prefix(receiver_id))
            .values()
            .map(|bytes| decode::<Notification>(&bytes?))
            .collect::<CoreResult<Vec<_>>>()?;
        found.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(found)
    }

    /// Flags the given notifications of `receiver_id` as read. Rows that are
    /// gone or already read are skipped. Returns how many changed.
    pub fn mark_notifications_read(&self, receiver_id: &str, ids: &[String]) -> CoreResult<usize> {
        let result: TransactionResult<usize, CoreError> = self.notifications.transaction(|tx| {
            let mut touched = 0;
            for id in ids {
                let key = Self::notification_key(receiver_id, id);
                let Some(mut notification) = tx_read::<Notification>(tx, &key)? else {
                    continue;
                };
                if notification.read {
                    continue;
                }
                notification.read = true;
                tx_write(tx, &key, &notification)?;
                touched += 1;
            }
            Ok(touched)
        });
        Ok(result?)
    }

    /// Removes the given notifications of `receiver_id`. Returns how many
    /// existed.
    pub fn delete_notifications(&self, receiver_id: &str, ids: &[String]) -> CoreResult<usize> {
        let result: TransactionResult<usize, CoreError> = self.notifications.transaction(|tx| {
            let mut touched = 0;
            for id in ids {
                if tx.remove(Self::notification_key(receiver_id, id))?.is_some() {
                    touched += 1;
                }
            }
            Ok(touched)
        });
        Ok(result?)
    }
}
