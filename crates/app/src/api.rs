use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::Utc;
use matchday_booking::{Booking, BookingError, CancelRequest, PaymentCompletion, PurchaseRequest};
use matchday_models::{MatchDetail, TicketType};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::{Level, error, info, warn};

use crate::auth::AuthUser;
use crate::error::ApiError;

const SIGNATURE_HEADER: &str = "stripe-signature";

#[derive(Clone)]
pub struct AppState {
    pub booking: Booking,
    pub jwt_secret: Arc<str>,
}

pub fn router(state: AppState) -> Router {
    let api_routes = Router::new()
        .route("/health", get(health))
        .route("/matches", get(list_matches))
        .route("/matches/{id}", get(get_match))
        .route("/matches/{id}/attendees", get(list_attendees))
        .route("/matches/{id}/pay", post(pay))
        .route("/matches/{id}/cancel", post(cancel))
        .route("/me/reservations", get(my_reservations))
        .route("/webhook", post(webhook));

    Router::new().nest("/api", api_routes).with_state(state)
}

/// Parses an optional JSON body; an empty body means all defaults.
fn parse_body<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| ApiError::bad_request(format!("invalid request body: {e}")))
}

async fn health(State(state): State<AppState>) -> Response {
    let version = crate::version_string();
    match matchday_db::ping(state.booking.pool()).await {
        Ok(()) => Json(json!({ "ok": true, "service": "matchday", "version": version, "db": "up" })).into_response(),
        Err(e) => {
            warn!(error = %e, "Health check could not reach the database");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "ok": false, "service": "matchday", "version": version, "db": "down" })),
            )
                .into_response()
        }
    }
}

#[derive(Deserialize)]
struct MatchesQuery {
    only_open: Option<String>,
}

async fn list_matches(
    State(state): State<AppState>,
    Query(params): Query<MatchesQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let only_open = matches!(params.only_open.as_deref(), Some("1") | Some("true"));
    let matches = matchday_db::list_matches(state.booking.pool(), only_open).await?;
    Ok(Json(json!({ "ok": true, "data": matches })))
}

async fn get_match(
    State(state): State<AppState>,
    user: AuthUser,
    Path(match_id): Path<i64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let pool = state.booking.pool();
    let info = matchday_db::get_match(pool, match_id)
        .await?
        .ok_or(BookingError::MatchNotFound(match_id))?;
    let (white_remaining, black_remaining) = matchday_db::color_remaining(pool, &info).await?;
    let detail = MatchDetail { info, white_remaining, black_remaining, is_admin: user.is_admin() };
    Ok(Json(json!({ "ok": true, "data": detail })))
}

async fn list_attendees(
    State(state): State<AppState>,
    _user: AuthUser,
    Path(match_id): Path<i64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let pool = state.booking.pool();
    if matchday_db::get_match(pool, match_id).await?.is_none() {
        return Err(BookingError::MatchNotFound(match_id).into());
    }
    let attendees = matchday_db::list_attendees(pool, match_id).await?;
    Ok(Json(json!({ "ok": true, "data": { "attendees": attendees } })))
}

async fn my_reservations(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<serde_json::Value>, ApiError> {
    let rows = matchday_db::list_reservations_for_user(state.booking.pool(), user.id).await?;
    Ok(Json(json!({ "ok": true, "data": rows })))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PayBody {
    ticket_type: Option<String>,
    quantity: Option<i64>,
}

async fn pay(
    State(state): State<AppState>,
    user: AuthUser,
    Path(match_id): Path<i64>,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    let body: PayBody = parse_body(&body)?;
    let ticket_type = match body.ticket_type.as_deref() {
        None => TicketType::White,
        Some(raw) => TicketType::parse(raw)
            .ok_or_else(|| BookingError::Validation(format!("unknown ticketType '{raw}', expected white or black")))?,
    };
    let request = PurchaseRequest {
        match_id,
        user_id: user.id,
        ticket_type,
        quantity: body.quantity.unwrap_or(1),
    };

    let intent = state.booking.request_purchase(&request, Utc::now()).await?;
    Ok(Json(json!({
        "ok": true,
        "checkoutUrl": intent.checkout_url,
        "reservationId": intent.reservation_id,
        "sessionId": intent.session_id,
    })))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CancelBody {
    reservation_id: Option<i64>,
}

async fn cancel(
    State(state): State<AppState>,
    user: AuthUser,
    Path(match_id): Path<i64>,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    let body: CancelBody = parse_body(&body)?;
    let request = CancelRequest { match_id, user_id: user.id, reservation_id: body.reservation_id };

    let outcome = state.booking.cancel(&request, Utc::now()).await?;
    let msg = if outcome.released {
        format!("reservation cancelled, {}% refunded", outcome.percent)
    } else {
        "unpaid reservation removed".to_string()
    };
    let mut response = json!({ "ok": true, "msg": msg, "pct": outcome.percent });
    if let Some(refund_id) = outcome.refund_id {
        response["refundId"] = json!(refund_id);
    }
    Ok(Json(response))
}

async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            warn!("Webhook delivery without signature header");
            ApiError::from(BookingError::SignatureInvalid("missing signature header".to_string()))
        })?;

    let event = state.booking.gateway().verify_webhook(&payload, signature).map_err(|e| {
        warn!(error = %e, "Webhook signature rejected");
        ApiError::from(BookingError::from(e))
    })?;

    let completion = match event.checkout_completion() {
        Ok(Some(completion)) => completion,
        Ok(None) => {
            info!(event_id = %event.id, kind = %event.kind, "Ignoring webhook event");
            return Ok(Json(json!({ "received": true })));
        }
        Err(e) => {
            // redelivery cannot fix a malformed object
            warn!(event_id = %event.id, error = %e, "Unreadable checkout session in webhook");
            return Ok(Json(json!({ "received": true })));
        }
    };

    state
        .booking
        .settle(&PaymentCompletion::from(&completion), Utc::now())
        .await
        .map_err(|e| {
            if settlement_failure_level(&e) == Level::ERROR {
                error!(
                    event_id = %event.id,
                    session_id = %completion.session_id,
                    code = e.code(),
                    error = %e,
                    "Settlement failed for a captured payment"
                );
            } else {
                warn!(event_id = %event.id, session_id = %completion.session_id, error = %e, "Settlement deferred, awaiting redelivery");
            }
            ApiError::settlement_failed(e)
        })?;
    Ok(Json(json!({ "received": true })))
}

/// Money has been captured when settlement runs, so anything but lock
/// contention needs an operator.
fn settlement_failure_level(err: &BookingError) -> Level {
    match err {
        BookingError::Busy => Level::WARN,
        _ => Level::ERROR,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use axum::body::Body;
    use axum::http::Request;
    use chrono::Duration;
    use http_body_util::BodyExt;
    use matchday_booking::BookingPolicy;
    use matchday_models::{MatchStatus, NewMatch};
    use matchday_payments::{MockGateway, completion_delivery};
    use tower::ServiceExt;

    use super::*;
    use crate::auth::issue_token;

    const JWT_SECRET: &str = "test_jwt";
    const WEBHOOK_SECRET: &str = "whsec_api";

    struct Harness {
        app: Router,
        state: AppState,
        gateway: MockGateway,
    }

    async fn harness() -> Harness {
        let path = std::env::temp_dir().join(format!("matchday-api-{}.db", uuid::Uuid::new_v4()));
        let pool = matchday_db::connect(&format!("sqlite:{}", path.display())).await.unwrap();
        matchday_db::migrate(&pool).await.unwrap();
        let gateway = MockGateway::new(WEBHOOK_SECRET);
        let booking = Booking::new(pool, Arc::new(gateway.clone()), BookingPolicy::default());
        let state = AppState { booking, jwt_secret: Arc::from(JWT_SECRET) };
        Harness { app: router(state.clone()), state, gateway }
    }

    async fn seed_match(state: &AppState, capacity: i64, hours_until: i64) -> i64 {
        let new = NewMatch {
            title: "Jueves noche".to_string(),
            city: "Madrid".to_string(),
            field_name: "Canal".to_string(),
            starts_at: Utc::now() + Duration::hours(hours_until),
            duration_min: 60,
            price_eur: 6.0,
            capacity,
            status: MatchStatus::Open,
        };
        matchday_db::create_match(state.booking.pool(), &new, Utc::now()).await.unwrap().id
    }

    fn bearer(user_id: i64) -> String {
        format!("Bearer {}", issue_token(user_id, None, JWT_SECRET))
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, body)
    }

    fn post_json(uri: &str, user_id: i64, body: serde_json::Value) -> Request<Body> {
        Request::post(uri)
            .header("authorization", bearer(user_id))
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn webhook_request(payload: Vec<u8>, signature: &str) -> Request<Body> {
        Request::post("/api/webhook")
            .header(SIGNATURE_HEADER, signature)
            .body(Body::from(payload))
            .unwrap()
    }

    #[tokio::test]
    async fn health_reports_database_up() {
        let h = harness().await;
        let (status, body) = send(&h.app, Request::get("/api/health").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["db"], "up");
    }

    #[tokio::test]
    async fn protected_routes_require_a_token() {
        let h = harness().await;
        let id = seed_match(&h.state, 10, 48).await;
        let request = Request::post(format!("/api/matches/{id}/pay")).body(Body::empty()).unwrap();
        let (status, body) = send(&h.app, request).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["ok"], false);

        let request = Request::get(format!("/api/matches/{id}"))
            .header("authorization", "Bearer not-a-jwt")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(&h.app, request).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn pay_then_webhook_confirms_tickets() {
        let h = harness().await;
        let id = seed_match(&h.state, 10, 48).await;

        let (status, body) = send(
            &h.app,
            post_json(&format!("/api/matches/{id}/pay"), 3, json!({ "ticketType": "black", "quantity": 2 })),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        let session_id = body["sessionId"].as_str().unwrap().to_string();
        assert!(body["checkoutUrl"].as_str().unwrap().contains(&session_id));

        h.gateway.mark_paid(&session_id).unwrap();
        let (payload, signature) = h.gateway.completion_delivery(&session_id, "paid");
        let (status, body) = send(&h.app, webhook_request(payload.clone(), &signature)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["received"], true);

        // redelivery is acknowledged and changes nothing
        let (status, _) = send(&h.app, webhook_request(payload, &signature)).await;
        assert_eq!(status, StatusCode::OK);

        let game = matchday_db::get_match(h.state.booking.pool(), id).await.unwrap().unwrap();
        assert_eq!(game.spots_taken, 2);

        let request = Request::get("/api/me/reservations")
            .header("authorization", bearer(3))
            .body(Body::empty())
            .unwrap();
        let (_, body) = send(&h.app, request).await;
        assert_eq!(body["data"].as_array().unwrap().len(), 2);

        let request = Request::get(format!("/api/matches/{id}"))
            .header("authorization", bearer(3))
            .body(Body::empty())
            .unwrap();
        let (_, body) = send(&h.app, request).await;
        assert_eq!(body["data"]["blackRemaining"], 3);
        assert_eq!(body["data"]["whiteRemaining"], 5);
        assert_eq!(body["data"]["isAdmin"], false);
    }

    #[tokio::test]
    async fn pay_rejects_bad_input() {
        let h = harness().await;
        let id = seed_match(&h.state, 10, 48).await;

        let (status, body) =
            send(&h.app, post_json(&format!("/api/matches/{id}/pay"), 3, json!({ "ticketType": "red" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "ValidationError");

        let (status, _) =
            send(&h.app, post_json(&format!("/api/matches/{id}/pay"), 3, json!({ "quantity": 9 }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = send(&h.app, post_json("/api/matches/999/pay", 3, json!({}))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "MATCH_NOT_FOUND");
    }

    #[tokio::test]
    async fn full_match_is_a_conflict() {
        let h = harness().await;
        let id = seed_match(&h.state, 2, 48).await;
        send(&h.app, post_json(&format!("/api/matches/{id}/pay"), 1, json!({ "ticketType": "white" }))).await;
        send(&h.app, post_json(&format!("/api/matches/{id}/pay"), 2, json!({ "ticketType": "black" }))).await;

        let (status, body) = send(&h.app, post_json(&format!("/api/matches/{id}/pay"), 3, json!({}))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "MATCH_FULL");
    }

    #[tokio::test]
    async fn cancel_refunds_a_paid_ticket() {
        let h = harness().await;
        let id = seed_match(&h.state, 10, 48).await;
        let (_, body) = send(&h.app, post_json(&format!("/api/matches/{id}/pay"), 4, json!({}))).await;
        let session_id = body["sessionId"].as_str().unwrap().to_string();
        h.gateway.mark_paid(&session_id).unwrap();
        let (payload, signature) = h.gateway.completion_delivery(&session_id, "paid");
        send(&h.app, webhook_request(payload, &signature)).await;

        let request = Request::post(format!("/api/matches/{id}/cancel"))
            .header("authorization", bearer(4))
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(&h.app, request).await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["pct"], 100);
        assert!(body["refundId"].is_string());
        assert_eq!(h.gateway.refunds()[0].1.amount, 600);
    }

    #[tokio::test]
    async fn cancel_without_reservation_is_not_found() {
        let h = harness().await;
        let id = seed_match(&h.state, 10, 48).await;
        let (status, body) = send(&h.app, post_json(&format!("/api/matches/{id}/cancel"), 4, json!({}))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "NOT_REGISTERED");
    }

    #[tokio::test]
    async fn webhook_with_bad_signature_is_rejected() {
        let h = harness().await;
        let (payload, foreign) = completion_delivery("whsec_other", "cs_x", "paid", &BTreeMap::new());

        let (status, body) = send(&h.app, webhook_request(payload.clone(), &foreign)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "SignatureInvalid");

        let request = Request::post("/api/webhook").body(Body::from(payload)).unwrap();
        let (status, _) = send(&h.app, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn other_event_types_are_acknowledged() {
        let h = harness().await;
        let payload = json!({ "id": "evt_1", "type": "payment_intent.created", "data": { "object": {} } })
            .to_string()
            .into_bytes();
        let signature = matchday_payments::webhook::sign_payload(&payload, WEBHOOK_SECRET, Utc::now().timestamp());
        let (status, body) = send(&h.app, webhook_request(payload, &signature)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["received"], true);
    }

    #[tokio::test]
    async fn settlement_failure_asks_for_redelivery() {
        let h = harness().await;
        let id = seed_match(&h.state, 1, 48).await;
        sqlx::query("UPDATE matches SET spots_taken = 1 WHERE id = ?")
            .bind(id)
            .execute(h.state.booking.pool())
            .await
            .unwrap();
        let metadata = BTreeMap::from([
            ("match_id".to_string(), id.to_string()),
            ("user_id".to_string(), "9".to_string()),
        ]);
        let (payload, signature) = completion_delivery(WEBHOOK_SECRET, "cs_over", "paid", &metadata);

        let (status, body) = send(&h.app, webhook_request(payload, &signature)).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["code"], "CAPACITY_EXCEEDED");
    }

    #[test]
    fn captured_payment_faults_log_at_error() {
        assert_eq!(settlement_failure_level(&BookingError::CapacityExceeded(3)), Level::ERROR);
        assert_eq!(settlement_failure_level(&BookingError::Internal(anyhow::anyhow!("disk"))), Level::ERROR);
        assert_eq!(settlement_failure_level(&BookingError::Busy), Level::WARN);
    }
}
