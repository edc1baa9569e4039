//! Webhook authentication and parsing.
//!
//! Deliveries carry a `t=<unix>,v1=<hex>` header where `v1` is the
//! HMAC-SHA256 of `"<t>.<raw body>"` under the endpoint secret.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;

use crate::{GatewayError, GatewayResult};

type HmacSha256 = Hmac<Sha256>;

pub const CHECKOUT_COMPLETED: &str = "checkout.session.completed";

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub data: EventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventData {
    pub object: serde_json::Value,
}

/// The parts of a completed checkout the settlement step needs.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CheckoutCompletion {
    #[serde(rename = "id")]
    pub session_id: String,
    #[serde(default)]
    pub payment_status: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl WebhookEvent {
    /// The completed session, if this is a checkout-completed event.
    pub fn checkout_completion(&self) -> GatewayResult<Option<CheckoutCompletion>> {
        if self.kind != CHECKOUT_COMPLETED {
            return Ok(None);
        }
        serde_json::from_value(self.data.object.clone())
            .map(Some)
            .map_err(|e| GatewayError::Decode(e.to_string()))
    }
}

/// Checks the signature header against `secret` and parses the payload.
///
/// Any problem (empty secret, malformed header, stale timestamp, no matching
/// signature, unparseable body) is reported as `SignatureInvalid`.
pub fn verify_signature(
    payload: &[u8],
    signature_header: &str,
    secret: &str,
    tolerance_secs: i64,
    now: DateTime<Utc>,
) -> GatewayResult<WebhookEvent> {
    if secret.is_empty() {
        return Err(GatewayError::SignatureInvalid("webhook secret not configured".to_string()));
    }

    let mut timestamp: Option<i64> = None;
    let mut signatures = Vec::new();
    for part in signature_header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", v)) => timestamp = v.parse().ok(),
            Some(("v1", v)) => signatures.push(v),
            _ => {}
        }
    }
    let timestamp =
        timestamp.ok_or_else(|| GatewayError::SignatureInvalid("missing timestamp".to_string()))?;
    if signatures.is_empty() {
        return Err(GatewayError::SignatureInvalid("no v1 signature".to_string()));
    }
    if tolerance_secs > 0 && (now.timestamp() - timestamp).abs() > tolerance_secs {
        return Err(GatewayError::SignatureInvalid("timestamp outside tolerance".to_string()));
    }

    let matched = signatures.iter().any(|candidate| {
        let Ok(expected) = hex::decode(candidate) else {
            return false;
        };
        signed_mac(secret, timestamp, payload)
            .map(|mac| mac.verify_slice(&expected).is_ok())
            .unwrap_or(false)
    });
    if !matched {
        return Err(GatewayError::SignatureInvalid("no signature matches payload".to_string()));
    }

    serde_json::from_slice(payload)
        .map_err(|e| GatewayError::SignatureInvalid(format!("payload is not an event: {e}")))
}

/// Builds a signature header for `payload`, as the provider would.
pub fn sign_payload(payload: &[u8], secret: &str, timestamp: i64) -> String {
    let digest = signed_mac(secret, timestamp, payload)
        .map(|mac| hex::encode(mac.finalize().into_bytes()))
        .unwrap_or_default();
    format!("t={timestamp},v1={digest}")
}

fn signed_mac(secret: &str, timestamp: i64, payload: &[u8]) -> Option<HmacSha256> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    Some(mac)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test";

    fn completed_event() -> Vec<u8> {
        serde_json::json!({
            "id": "evt_1",
            "type": "checkout.session.completed",
            "data": { "object": {
                "id": "cs_1",
                "payment_status": "paid",
                "metadata": { "match_id": "3", "quantity": "2" }
            }}
        })
        .to_string()
        .into_bytes()
    }

    #[test]
    fn accepts_valid_signature() {
        let payload = completed_event();
        let now = Utc::now();
        let header = sign_payload(&payload, SECRET, now.timestamp());

        let event = verify_signature(&payload, &header, SECRET, 300, now).unwrap();
        let completion = event.checkout_completion().unwrap().unwrap();
        assert_eq!(completion.session_id, "cs_1");
        assert_eq!(completion.payment_status.as_deref(), Some("paid"));
        assert_eq!(completion.metadata.get("quantity").map(String::as_str), Some("2"));
    }

    #[test]
    fn rejects_tampered_payload() {
        let payload = completed_event();
        let now = Utc::now();
        let header = sign_payload(&payload, SECRET, now.timestamp());
        let mut tampered = payload.clone();
        tampered.extend_from_slice(b" ");

        let err = verify_signature(&tampered, &header, SECRET, 300, now).unwrap_err();
        assert!(matches!(err, GatewayError::SignatureInvalid(_)));
    }

    #[test]
    fn rejects_wrong_secret_and_missing_secret() {
        let payload = completed_event();
        let now = Utc::now();
        let header = sign_payload(&payload, "whsec_other", now.timestamp());

        assert!(verify_signature(&payload, &header, SECRET, 300, now).is_err());
        assert!(verify_signature(&payload, &header, "", 300, now).is_err());
    }

    #[test]
    fn rejects_stale_timestamp() {
        let payload = completed_event();
        let now = Utc::now();
        let header = sign_payload(&payload, SECRET, now.timestamp() - 3600);

        let err = verify_signature(&payload, &header, SECRET, 300, now).unwrap_err();
        assert!(matches!(err, GatewayError::SignatureInvalid(_)));
    }

    #[test]
    fn rejects_malformed_header() {
        let payload = completed_event();
        assert!(verify_signature(&payload, "garbage", SECRET, 300, Utc::now()).is_err());
        assert!(verify_signature(&payload, "t=1", SECRET, 0, Utc::now()).is_err());
    }

    #[test]
    fn other_event_types_have_no_completion() {
        let event: WebhookEvent = serde_json::from_value(serde_json::json!({
            "id": "evt_2",
            "type": "charge.refunded",
            "data": { "object": {} }
        }))
        .unwrap();
        assert!(event.checkout_completion().unwrap().is_none());
    }
}
