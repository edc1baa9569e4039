//! Match-capacity reservation and payment settlement.
//!
//! A purchase takes the match lock, checks capacity and the color split,
//! writes one pending reservation and opens a checkout session. Money arrives
//! later through a webhook; settlement confirms the pending row (plus any
//! extra tickets of the batch) and only then moves `spots_taken`. Cancelling
//! refunds according to how close kick-off is and gives the spot back.

use std::sync::Arc;

use chrono::Duration;
use matchday_payments::PaymentGateway;
use sqlx::{Sqlite, SqlitePool, Transaction};
use tracing::warn;

mod cancellation;
mod error;
mod reaper;
mod reservation;
mod settlement;

pub use cancellation::{CancelOutcome, CancelRequest, refund_percent};
pub use error::{BookingError, ErrorKind};
pub use reservation::{PurchaseIntent, PurchaseRequest, validate_quantity};
pub use settlement::{PaymentCompletion, SettlementOutcome};

pub type BookingResult<T> = Result<T, BookingError>;

/// Commercial settings of the booking flow.
#[derive(Debug, Clone)]
pub struct BookingPolicy {
    pub currency: String,
    pub success_url: String,
    pub cancel_url: String,
    /// How long a checkout (and the seats it holds) stays payable.
    pub hold_ttl: Duration,
    /// Extra time before an unpaid hold is reaped, for late webhooks.
    pub hold_grace: Duration,
}

impl Default for BookingPolicy {
    fn default() -> Self {
        Self {
            currency: "eur".to_string(),
            success_url: "https://easyfutbol.es/pago-ok".to_string(),
            cancel_url: "https://easyfutbol.es/pago-cancelado".to_string(),
            hold_ttl: Duration::minutes(30),
            hold_grace: Duration::minutes(10),
        }
    }
}

#[derive(Clone)]
pub struct Booking {
    pool: SqlitePool,
    gateway: Arc<dyn PaymentGateway>,
    policy: Arc<BookingPolicy>,
}

impl Booking {
    pub fn new(pool: SqlitePool, gateway: Arc<dyn PaymentGateway>, policy: BookingPolicy) -> Self {
        Self { pool, gateway, policy: Arc::new(policy) }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn gateway(&self) -> &dyn PaymentGateway {
        self.gateway.as_ref()
    }

    pub fn policy(&self) -> &BookingPolicy {
        &self.policy
    }
}

/// Commits on success, rolls back (releasing the match lock) on failure.
async fn finish<T>(tx: Transaction<'_, Sqlite>, result: BookingResult<T>) -> BookingResult<T> {
    match result {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback) = tx.rollback().await {
                warn!(error = %rollback, "Rollback failed");
            }
            Err(err)
        }
    }
}
