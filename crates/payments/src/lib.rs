//! Payment gateway adapter.
//!
//! The booking core only needs four things from a payment provider: open a
//! checkout session, look a session up again (with the charge it captured),
//! refund part or all of a charge, and authenticate webhook deliveries.
//! [`PaymentGateway`] captures exactly that; [`StripeGateway`] talks to a
//! Stripe-compatible REST API and [`MockGateway`] keeps everything in memory.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

mod mock;
mod stripe;
pub mod webhook;

pub use mock::{GatewayOp, MockGateway, completion_delivery};
pub use stripe::{StripeGateway, StripeSettings};
pub use webhook::{CheckoutCompletion, WebhookEvent};

pub type GatewayResult<T> = Result<T, GatewayError>;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("payment provider rejected the request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("payment provider unreachable: {0}")]
    Transport(String),

    #[error("unexpected payment provider response: {0}")]
    Decode(String),

    #[error("webhook signature invalid: {0}")]
    SignatureInvalid(String),

    #[error("payment gateway not configured: {0}")]
    NotConfigured(String),
}

/// What to charge for, in the currency's minor units.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckoutRequest {
    pub currency: String,
    pub unit_amount: i64,
    pub quantity: i64,
    pub product_name: String,
    pub description: String,
    pub metadata: BTreeMap<String, String>,
    pub success_url: String,
    pub cancel_url: String,
    /// The provider refuses payment after this instant.
    pub expires_at: Option<DateTime<Utc>>,
}

impl CheckoutRequest {
    pub fn amount(&self) -> i64 {
        self.unit_amount * self.quantity
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutSession {
    pub id: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Charge {
    pub id: String,
    pub amount_captured: i64,
}

/// A checkout session as the provider currently sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    pub id: String,
    pub payment_status: Option<String>,
    pub amount_total: Option<i64>,
    pub metadata: BTreeMap<String, String>,
    pub charge: Option<Charge>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Refund {
    pub id: String,
    pub amount: i64,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn name(&self) -> &'static str;

    async fn create_checkout_session(&self, request: &CheckoutRequest) -> GatewayResult<CheckoutSession>;

    async fn retrieve_session(&self, session_id: &str) -> GatewayResult<SessionState>;

    /// Refunds `amount` (minor units, may be less than the charge). Repeating a
    /// call with the same `idempotency_key` must not refund twice.
    async fn issue_refund(&self, charge_id: &str, amount: i64, idempotency_key: &str) -> GatewayResult<Refund>;

    /// Authenticates a raw webhook delivery and parses it.
    fn verify_webhook(&self, payload: &[u8], signature_header: &str) -> GatewayResult<WebhookEvent>;
}
