//! In-memory gateway for development and tests.
//!
//! Sessions stay unpaid until [`MockGateway::mark_paid`]; any operation can be
//! made to fail once with [`MockGateway::fail_next`].

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use tracing::info;

use crate::webhook::{self, WebhookEvent};
use crate::{
    Charge, CheckoutRequest, CheckoutSession, GatewayError, GatewayResult, PaymentGateway, Refund,
    SessionState,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GatewayOp {
    CreateSession,
    RetrieveSession,
    IssueRefund,
}

#[derive(Debug, Clone)]
struct MockSession {
    request: CheckoutRequest,
    charge: Option<Charge>,
}

#[derive(Default)]
struct MockState {
    sessions: HashMap<String, MockSession>,
    refunds: Vec<(String, Refund)>,
    refunds_by_key: HashMap<String, Refund>,
    failures: HashSet<GatewayOp>,
}

#[derive(Clone)]
pub struct MockGateway {
    webhook_secret: String,
    state: Arc<Mutex<MockState>>,
}

impl MockGateway {
    pub fn new(webhook_secret: impl Into<String>) -> Self {
        Self {
            webhook_secret: webhook_secret.into(),
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        // poisoned state is still usable
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn take_failure(&self, op: GatewayOp) -> GatewayResult<()> {
        if self.state().failures.remove(&op) {
            return Err(GatewayError::Rejected {
                status: 402,
                message: format!("injected {op:?} failure"),
            });
        }
        Ok(())
    }

    /// Makes the next call of `op` fail with a provider rejection.
    pub fn fail_next(&self, op: GatewayOp) {
        self.state().failures.insert(op);
    }

    /// Simulates the customer paying: captures the full session amount.
    pub fn mark_paid(&self, session_id: &str) -> Option<Charge> {
        let mut state = self.state();
        let session = state.sessions.get_mut(session_id)?;
        let charge = Charge {
            id: format!("ch_mock_{}", uuid::Uuid::new_v4().simple()),
            amount_captured: session.request.amount(),
        };
        session.charge = Some(charge.clone());
        Some(charge)
    }

    pub fn session_request(&self, session_id: &str) -> Option<CheckoutRequest> {
        self.state().sessions.get(session_id).map(|s| s.request.clone())
    }

    /// Refunds issued so far as `(charge_id, refund)`.
    pub fn refunds(&self) -> Vec<(String, Refund)> {
        self.state().refunds.clone()
    }

    /// A signed `checkout.session.completed` delivery for `session_id`, as
    /// `(payload, signature_header)`.
    pub fn completion_delivery(&self, session_id: &str, payment_status: &str) -> (Vec<u8>, String) {
        let metadata = self
            .session_request(session_id)
            .map(|r| r.metadata)
            .unwrap_or_default();
        completion_delivery(&self.webhook_secret, session_id, payment_status, &metadata)
    }
}

/// Signed `checkout.session.completed` delivery with arbitrary metadata.
pub fn completion_delivery(
    secret: &str,
    session_id: &str,
    payment_status: &str,
    metadata: &BTreeMap<String, String>,
) -> (Vec<u8>, String) {
    let payload = serde_json::json!({
        "id": format!("evt_mock_{}", uuid::Uuid::new_v4().simple()),
        "type": webhook::CHECKOUT_COMPLETED,
        "data": { "object": {
            "id": session_id,
            "payment_status": payment_status,
            "metadata": metadata,
        }}
    })
    .to_string()
    .into_bytes();
    let header = webhook::sign_payload(&payload, secret, Utc::now().timestamp());
    (payload, header)
}

#[async_trait]
impl PaymentGateway for MockGateway {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn create_checkout_session(&self, request: &CheckoutRequest) -> GatewayResult<CheckoutSession> {
        self.take_failure(GatewayOp::CreateSession)?;
        let id = format!("cs_mock_{}", uuid::Uuid::new_v4().simple());
        let url = format!("https://checkout.mock/pay/{id}");
        self.state().sessions.insert(
            id.clone(),
            MockSession { request: request.clone(), charge: None },
        );
        info!(session_id = %id, amount = request.amount(), "Mock checkout session created");
        Ok(CheckoutSession { id, url })
    }

    async fn retrieve_session(&self, session_id: &str) -> GatewayResult<SessionState> {
        self.take_failure(GatewayOp::RetrieveSession)?;
        let state = self.state();
        let session = state.sessions.get(session_id).ok_or_else(|| GatewayError::Rejected {
            status: 404,
            message: format!("No such checkout session: {session_id}"),
        })?;
        Ok(SessionState {
            id: session_id.to_string(),
            payment_status: Some(if session.charge.is_some() { "paid" } else { "unpaid" }.to_string()),
            amount_total: Some(session.request.amount()),
            metadata: session.request.metadata.clone(),
            charge: session.charge.clone(),
        })
    }

    async fn issue_refund(&self, charge_id: &str, amount: i64, idempotency_key: &str) -> GatewayResult<Refund> {
        self.take_failure(GatewayOp::IssueRefund)?;
        let mut state = self.state();
        if let Some(existing) = state.refunds_by_key.get(idempotency_key) {
            return Ok(existing.clone());
        }
        let refund = Refund {
            id: format!("re_mock_{}", uuid::Uuid::new_v4().simple()),
            amount,
        };
        state.refunds.push((charge_id.to_string(), refund.clone()));
        state.refunds_by_key.insert(idempotency_key.to_string(), refund.clone());
        info!(charge_id, refund_id = %refund.id, amount, "Mock refund issued");
        Ok(refund)
    }

    fn verify_webhook(&self, payload: &[u8], signature_header: &str) -> GatewayResult<WebhookEvent> {
        webhook::verify_signature(payload, signature_header, &self.webhook_secret, 300, Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(quantity: i64) -> CheckoutRequest {
        CheckoutRequest {
            currency: "eur".to_string(),
            unit_amount: 500,
            quantity,
            product_name: "Partido".to_string(),
            description: String::new(),
            metadata: BTreeMap::from([("quantity".to_string(), quantity.to_string())]),
            success_url: "https://ok".to_string(),
            cancel_url: "https://ko".to_string(),
            expires_at: None,
        }
    }

    #[tokio::test]
    async fn session_is_unpaid_until_marked() {
        let gateway = MockGateway::new("whsec_mock");
        let session = gateway.create_checkout_session(&request(3)).await.unwrap();

        let before = gateway.retrieve_session(&session.id).await.unwrap();
        assert_eq!(before.payment_status.as_deref(), Some("unpaid"));
        assert!(before.charge.is_none());

        gateway.mark_paid(&session.id).unwrap();
        let after = gateway.retrieve_session(&session.id).await.unwrap();
        assert_eq!(after.charge.unwrap().amount_captured, 1500);
    }

    #[tokio::test]
    async fn injected_failure_fires_once() {
        let gateway = MockGateway::new("whsec_mock");
        gateway.fail_next(GatewayOp::CreateSession);
        assert!(gateway.create_checkout_session(&request(1)).await.is_err());
        assert!(gateway.create_checkout_session(&request(1)).await.is_ok());
    }

    #[tokio::test]
    async fn refund_is_idempotent_per_key() {
        let gateway = MockGateway::new("whsec_mock");
        let first = gateway.issue_refund("ch_1", 200, "refund-7").await.unwrap();
        let second = gateway.issue_refund("ch_1", 200, "refund-7").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(gateway.refunds().len(), 1);
    }

    #[tokio::test]
    async fn completion_delivery_verifies() {
        let gateway = MockGateway::new("whsec_mock");
        let session = gateway.create_checkout_session(&request(2)).await.unwrap();
        let (payload, header) = gateway.completion_delivery(&session.id, "paid");

        let event = gateway.verify_webhook(&payload, &header).unwrap();
        let completion = event.checkout_completion().unwrap().unwrap();
        assert_eq!(completion.session_id, session.id);
        assert_eq!(completion.metadata.get("quantity").map(String::as_str), Some("2"));
    }
}
