//! Applying confirmed payments.

use crate::clock::Clock;
use crate::error::{GateError, Result};
use crate::lifecycle::expiry::RenewalPolicy;
use crate::store::{PaymentDraft, Store};
use crate::types::{AccessKind, PaymentId, Timestamp, UserId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};

/// Longest renewal accepted in one payment.
pub const MAX_MONTHS: u32 = 1200;

/// Largest single payment accepted, in minor units. Leaves room to sum
/// a million of them in an `i64`.
pub const MAX_AMOUNT: i64 = i64::MAX / 1_000_000;

/// A payment the transport has confirmed as completed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentConfirmed {
    pub user_id: UserId,
    pub display_name: Option<String>,
    /// Months bought. May be 0 for a full-access purchase.
    pub months: u32,
    /// Grants permanent access.
    pub full_access: bool,
    /// Minor currency units.
    pub amount: i64,
    pub currency: String,
}

impl PaymentConfirmed {
    fn validate(&self) -> Result<()> {
        if !self.full_access && self.months == 0 {
            return Err(GateError::InvalidPayment("months must be at least 1".into()));
        }
        if self.months > MAX_MONTHS {
            return Err(GateError::InvalidPayment(format!(
                "months must be at most {}, got {}",
                MAX_MONTHS, self.months
            )));
        }
        if self.amount < 0 {
            return Err(GateError::InvalidPayment(format!(
                "negative amount {}",
                self.amount
            )));
        }
        if self.amount > MAX_AMOUNT {
            return Err(GateError::InvalidPayment(format!(
                "amount {} exceeds the limit of {}",
                self.amount, MAX_AMOUNT
            )));
        }
        if self.currency.trim().is_empty() {
            return Err(GateError::InvalidPayment("missing currency".into()));
        }
        Ok(())
    }
}

/// Result of a recorded payment, for the caller to render and act on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Grant {
    pub user_id: UserId,
    pub access: AccessKind,
    pub payment_id: PaymentId,
    pub paid_at: Timestamp,
}

impl Grant {
    /// New expiry, or None for permanent access.
    pub fn expiry(&self) -> Option<Timestamp> {
        self.access.expiry()
    }
}

/// Turns confirmed payments into subscriber updates and payment records.
#[derive(Clone)]
pub struct PaymentHandler {
    store: Arc<Store>,
    clock: Arc<dyn Clock>,
    policy: RenewalPolicy,
}

impl PaymentHandler {
    pub fn new(store: Arc<Store>, clock: Arc<dyn Clock>, policy: RenewalPolicy) -> Self {
        Self {
            store,
            clock,
            policy,
        }
    }

    /// Record a confirmed payment.
    ///
    /// The subscriber row and the payment record are written together or not
    /// at all. Errors are returned to the caller; a payment that was taken but
    /// not recorded must reach an operator.
    pub fn confirm(&self, event: &PaymentConfirmed) -> Result<Grant> {
        event.validate().map_err(|e| {
            error!(user_id = %event.user_id, error = %e, "rejected payment confirmation");
            e
        })?;

        let result = self.store.record_payment(event.user_id, |current| {
            // Read the clock under the store lock so renewals apply in order.
            let now = self.clock.now();
            let current_expiry = current.and_then(|s| s.access.expiry());
            let access =
                self.policy
                    .next_access(current_expiry, event.full_access, event.months, now);

            Ok(PaymentDraft {
                display_name: event.display_name.clone(),
                access,
                amount: event.amount,
                currency: event.currency.clone(),
                months: event.months,
                paid_at: now,
            })
        });

        match result {
            Ok((subscriber, payment)) => {
                info!(
                    user_id = %event.user_id,
                    payment_id = payment.id.0,
                    months = event.months,
                    permanent = payment.granted_permanent,
                    expiry = ?payment.resulting_expiry,
                    "payment recorded"
                );
                Ok(Grant {
                    user_id: subscriber.user_id,
                    access: subscriber.access,
                    payment_id: payment.id,
                    paid_at: payment.paid_at,
                })
            }
            Err(e) => {
                error!(
                    user_id = %event.user_id,
                    amount = event.amount,
                    currency = %event.currency,
                    error = %e,
                    "payment NOT recorded"
                );
                Err(e)
            }
        }
    }
}
