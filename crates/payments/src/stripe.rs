use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::webhook::{self, WebhookEvent};
use crate::{
    Charge, CheckoutRequest, CheckoutSession, GatewayError, GatewayResult, PaymentGateway, Refund,
    SessionState,
};

#[derive(Debug, Clone)]
pub struct StripeSettings {
    pub api_base: String,
    pub secret_key: String,
    pub webhook_secret: String,
    pub webhook_tolerance_secs: i64,
    pub timeout: Duration,
}

/// Stripe-compatible REST adapter (form-encoded requests, JSON responses).
#[derive(Clone)]
pub struct StripeGateway {
    http: Client,
    settings: StripeSettings,
}

impl StripeGateway {
    pub fn new(settings: StripeSettings) -> GatewayResult<Self> {
        if settings.secret_key.is_empty() {
            return Err(GatewayError::NotConfigured("missing Stripe secret key".to_string()));
        }
        let http = Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(|e| GatewayError::Transport(e.to_string()))?;
        Ok(Self { http, settings })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.settings.api_base.trim_end_matches('/'))
    }
}

// --- Provider response types ---

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ApiErrorBody,
}

#[derive(Deserialize)]
struct ApiErrorBody {
    message: String,
}

#[derive(Deserialize)]
struct ApiCheckoutSession {
    id: String,
    url: Option<String>,
    payment_status: Option<String>,
    amount_total: Option<i64>,
    #[serde(default)]
    metadata: Option<BTreeMap<String, String>>,
    payment_intent: Option<Expandable<ApiPaymentIntent>>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Expandable<T> {
    Object(T),
    #[allow(dead_code)]
    Id(String),
}

#[derive(Deserialize)]
struct ApiPaymentIntent {
    latest_charge: Option<Expandable<ApiCharge>>,
}

#[derive(Deserialize)]
struct ApiCharge {
    id: String,
    #[serde(default)]
    amount_captured: i64,
}

#[derive(Deserialize)]
struct ApiRefund {
    id: String,
    amount: i64,
}

async fn parse<T: DeserializeOwned>(response: reqwest::Response) -> GatewayResult<T> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| GatewayError::Transport(e.to_string()))?;
    if !status.is_success() {
        let message = serde_json::from_str::<ErrorEnvelope>(&body)
            .map(|envelope| envelope.error.message)
            .unwrap_or(body);
        return Err(GatewayError::Rejected { status: status.as_u16(), message });
    }
    serde_json::from_str(&body).map_err(|e| GatewayError::Decode(e.to_string()))
}

fn checkout_form(request: &CheckoutRequest) -> Vec<(String, String)> {
    let mut form = vec![
        ("mode".to_string(), "payment".to_string()),
        ("payment_method_types[0]".to_string(), "card".to_string()),
        ("line_items[0][quantity]".to_string(), request.quantity.to_string()),
        ("line_items[0][price_data][currency]".to_string(), request.currency.clone()),
        ("line_items[0][price_data][unit_amount]".to_string(), request.unit_amount.to_string()),
        ("line_items[0][price_data][product_data][name]".to_string(), request.product_name.clone()),
        ("success_url".to_string(), request.success_url.clone()),
        ("cancel_url".to_string(), request.cancel_url.clone()),
    ];
    if !request.description.is_empty() {
        form.push((
            "line_items[0][price_data][product_data][description]".to_string(),
            request.description.clone(),
        ));
    }
    if let Some(expires_at) = request.expires_at {
        form.push(("expires_at".to_string(), expires_at.timestamp().to_string()));
    }
    for (key, value) in &request.metadata {
        form.push((format!("metadata[{key}]"), value.clone()));
    }
    form
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    fn name(&self) -> &'static str {
        "stripe"
    }

    async fn create_checkout_session(&self, request: &CheckoutRequest) -> GatewayResult<CheckoutSession> {
        let response = self
            .http
            .post(self.url("/v1/checkout/sessions"))
            .bearer_auth(&self.settings.secret_key)
            .form(&checkout_form(request))
            .send()
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))?;
        let session: ApiCheckoutSession = parse(response).await?;
        let url = session
            .url
            .ok_or_else(|| GatewayError::Decode(format!("session {} has no checkout url", session.id)))?;
        info!(session_id = %session.id, amount = request.amount(), "Checkout session created");
        Ok(CheckoutSession { id: session.id, url })
    }

    async fn retrieve_session(&self, session_id: &str) -> GatewayResult<SessionState> {
        let response = self
            .http
            .get(self.url(&format!("/v1/checkout/sessions/{session_id}")))
            .bearer_auth(&self.settings.secret_key)
            .query(&[("expand[]", "payment_intent.latest_charge")])
            .send()
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))?;
        let session: ApiCheckoutSession = parse(response).await?;

        let charge = match session.payment_intent {
            Some(Expandable::Object(intent)) => match intent.latest_charge {
                Some(Expandable::Object(charge)) => Some(Charge {
                    id: charge.id,
                    amount_captured: charge.amount_captured,
                }),
                _ => None,
            },
            _ => None,
        };
        debug!(session_id, has_charge = charge.is_some(), "Checkout session retrieved");

        Ok(SessionState {
            id: session.id,
            payment_status: session.payment_status,
            amount_total: session.amount_total,
            metadata: session.metadata.unwrap_or_default(),
            charge,
        })
    }

    async fn issue_refund(&self, charge_id: &str, amount: i64, idempotency_key: &str) -> GatewayResult<Refund> {
        let response = self
            .http
            .post(self.url("/v1/refunds"))
            .bearer_auth(&self.settings.secret_key)
            .header("Idempotency-Key", idempotency_key)
            .form(&[("charge", charge_id.to_string()), ("amount", amount.to_string())])
            .send()
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))?;
        let refund: ApiRefund = parse(response).await?;
        info!(charge_id, refund_id = %refund.id, amount = refund.amount, "Refund issued");
        Ok(Refund { id: refund.id, amount: refund.amount })
    }

    fn verify_webhook(&self, payload: &[u8], signature_header: &str) -> GatewayResult<WebhookEvent> {
        webhook::verify_signature(
            payload,
            signature_header,
            &self.settings.webhook_secret,
            self.settings.webhook_tolerance_secs,
            Utc::now(),
        )
    }
}
