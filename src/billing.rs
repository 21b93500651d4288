//! Invoice and payment bookkeeping produced when a request completes.
use std::fmt;

use chrono::Utc;
use serde::Deserialize;

use crate::actor::Actor;
use crate::config::BillingConfig;
use crate::directory::Garage;
use crate::error::{CoreError, CoreResult};
use crate::fanout::{Notice, NotificationKind, Outcome};
use crate::lifecycle::ServiceRequest;
use crate::types::{Amount, TimeStamp};
use crate::utils::{self, prefix};

const BPS_SCALE: u128 = 10_000;

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize, minicbor::Encode, minicbor::Decode,
)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    #[default]
    #[n(0)]
    Cash,
    #[n(1)]
    Card,
    #[n(2)]
    BankTransfer,
    #[n(3)]
    Wallet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, minicbor::Encode, minicbor::Decode)]
pub enum PaymentStatus {
    #[n(0)]
    Pending,
    #[n(1)]
    Completed,
    #[n(2)]
    Failed,
    #[n(3)]
    Refunded,
    #[n(4)]
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, minicbor::Encode, minicbor::Decode)]
pub enum InvoiceStatus {
    #[n(0)]
    Unpaid,
    #[n(1)]
    Paid,
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct Payment {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub service_request_id: String,
    #[n(2)]
    pub amount: Amount,
    #[n(3)]
    pub method: PaymentMethod,
    #[n(4)]
    pub status: PaymentStatus,
    #[n(5)]
    pub transaction_id: String,
    #[n(6)]
    pub created_at: TimeStamp<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct Invoice {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub service_request_id: String,
    #[n(2)]
    pub payment_id: String,
    #[n(3)]
    pub subtotal: Amount,
    #[n(4)]
    pub tax_amount: Amount,
    #[n(5)]
    pub total_amount: Amount,
    #[n(6)]
    pub status: InvoiceStatus,
    #[n(7)]
    pub created_at: TimeStamp<Utc>,
}

/// The billing records written when a request completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settlement {
    pub invoice: Invoice,
    pub payment: Payment,
}

impl PaymentStatus {
    /// Bookkeeping transitions of a payment.
    pub fn settle(self, to: PaymentStatus) -> CoreResult<PaymentStatus> {
        use PaymentStatus::*;

        match (self, to) {
            (Pending, Completed | Failed | Cancelled) | (Completed, Refunded) => Ok(to),
            (from, to) => Err(CoreError::conflict(format!(
                "payment cannot move from {from} to {to}"
            ))),
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Completed => "completed",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Refunded => "refunded",
            PaymentStatus::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BillingPolicy {
    /// Tax rate in basis points (1/100 of a percent).
    pub tax_rate_bps: u32,
    pub default_method: PaymentMethod,
}

impl Default for BillingPolicy {
    fn default() -> Self {
        Self {
            tax_rate_bps: 0,
            default_method: PaymentMethod::Cash,
        }
    }
}

impl From<&BillingConfig> for BillingPolicy {
    fn from(config: &BillingConfig) -> Self {
        Self {
            tax_rate_bps: config.tax_rate_bps,
            default_method: config.default_method,
        }
    }
}

impl BillingPolicy {
    /// Tax on `subtotal`, rounded half up to the nearest minor unit.
    pub fn tax_on(&self, subtotal: Amount) -> CoreResult<Amount> {
        let scaled = u128::from(subtotal) * u128::from(self.tax_rate_bps);
        let tax = (scaled + BPS_SCALE / 2) / BPS_SCALE;
        Amount::try_from(tax).map_err(|_| CoreError::invalid("tax amount overflows"))
    }

    /// Builds the invoice and its pending payment from the request's finished work.
    pub fn finalize(
        &self,
        request: &ServiceRequest,
        method: Option<PaymentMethod>,
    ) -> CoreResult<Settlement> {
        let subtotal = request.ledger_total()?;
        let tax_amount = self.tax_on(subtotal)?;
        let total_amount = subtotal
            .checked_add(tax_amount)
            .ok_or_else(|| CoreError::invalid("invoice total overflows"))?;
        let created_at = TimeStamp::new();

        let mut payment = Payment {
            id: utils::new_id(prefix::PAYMENT)?,
            service_request_id: request.id.clone(),
            amount: total_amount,
            method: method.unwrap_or(self.default_method),
            status: PaymentStatus::Pending,
            transaction_id: String::new(),
            created_at: created_at.clone(),
        };
        payment.transaction_id = utils::digest_of(&payment)?;

        let invoice = Invoice {
            id: utils::new_id(prefix::INVOICE)?,
            service_request_id: request.id.clone(),
            payment_id: payment.id.clone(),
            subtotal,
            tax_amount,
            total_amount,
            status: InvoiceStatus::Unpaid,
            created_at,
        };

        Ok(Settlement { invoice, payment })
    }

    /// Completes `request` and bills it.
    pub fn complete(
        &self,
        request: &mut ServiceRequest,
        actor: &Actor,
        garage: &Garage,
        method: Option<PaymentMethod>,
    ) -> CoreResult<Outcome<Settlement>> {
        request.complete(actor, garage)?;
        let settlement = self.finalize(request, method)?;

        let notice = Notice::new(
            &actor.id,
            &request.customer_id,
            NotificationKind::RequestCompleted,
            format!(
                "Request {} is complete. Invoice {} totals {} ({} tax)",
                request.id,
                settlement.invoice.id,
                settlement.invoice.total_amount,
                settlement.invoice.tax_amount
            ),
        );
        Ok(Outcome::new(settlement, vec![notice]))
    }
}

/// Moves a payment to `to` and keeps the invoice's paid flag in step.
pub fn record_payment(
    payment: &mut Payment,
    invoice: &mut Invoice,
    to: PaymentStatus,
) -> CoreResult<()> {
    payment.status = payment.status.settle(to)?;
    invoice.status = if payment.status == PaymentStatus::Completed {
        InvoiceStatus::Paid
    } else {
        InvoiceStatus::Unpaid
    };
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(bps: u32) -> BillingPolicy {
        BillingPolicy {
            tax_rate_bps: bps,
            ..BillingPolicy::default()
        }
    }

    #[test]
    fn tax_rounds_half_up() {
        assert_eq!(policy(0).tax_on(1200).unwrap(), 0);
        assert_eq!(policy(2000).tax_on(1200).unwrap(), 240);
        // 0.5 of a minor unit rounds up
        assert_eq!(policy(500).tax_on(10).unwrap(), 1);
        assert_eq!(policy(400).tax_on(10).unwrap(), 0);
        assert!(policy(2000).tax_on(u64::MAX).is_ok());
        assert!(policy(20_000).tax_on(u64::MAX).is_err());
    }

    #[test]
    fn payment_transitions() {
        use PaymentStatus::*;

        assert_eq!(Pending.settle(Completed), Ok(Completed));
        assert_eq!(Pending.settle(Failed), Ok(Failed));
        assert_eq!(Completed.settle(Refunded), Ok(Refunded));
        assert!(Pending.settle(Refunded).is_err());
        assert!(Failed.settle(Completed).is_err());
        assert!(Refunded.settle(Completed).is_err());
    }

    fn records() -> (Payment, Invoice) {
        let payment = Payment {
            id: "pay_1".into(),
            service_request_id: "req_1".into(),
            amount: 1440,
            method: PaymentMethod::Card,
            status: PaymentStatus::Pending,
            transaction_id: "tx".into(),
            created_at: TimeStamp::new(),
        };
        let invoice = Invoice {
            id: "inv_1".into(),
            service_request_id: "req_1".into(),
            payment_id: "pay_1".into(),
            subtotal: 1200,
            tax_amount: 240,
            total_amount: 1440,
            status: InvoiceStatus::Unpaid,
            created_at: TimeStamp::new(),
        };
        (payment, invoice)
    }

    #[test]
    fn invoice_follows_payment() {
        let (mut payment, mut invoice) = records();

        record_payment(&mut payment, &mut invoice, PaymentStatus::Completed).unwrap();
        assert_eq!(invoice.status, InvoiceStatus::Paid);

        record_payment(&mut payment, &mut invoice, PaymentStatus::Refunded).unwrap();
        assert_eq!(invoice.status, InvoiceStatus::Unpaid);
        assert_eq!(payment.status, PaymentStatus::Refunded);
    }

    #[test]
    fn rejected_settlement_changes_nothing() {
        let (mut payment, mut invoice) = records();
        assert!(record_payment(&mut payment, &mut invoice, PaymentStatus::Refunded).is_err());
        assert_eq!(payment.status, PaymentStatus::Pending);
        assert_eq!(invoice.status, InvoiceStatus::Unpaid);
    }
}
