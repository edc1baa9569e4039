use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use matchday_db::{ledger, reservations};
use matchday_models::{MAX_TICKETS_PER_PURCHASE, Match, TicketType};
use matchday_payments::CheckoutRequest;
use serde::Serialize;
use sqlx::SqliteConnection;
use tracing::{info, warn};

use crate::{Booking, BookingError, BookingResult, finish};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurchaseRequest {
    pub match_id: i64,
    pub user_id: i64,
    pub ticket_type: TicketType,
    pub quantity: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseIntent {
    pub reservation_id: i64,
    pub session_id: String,
    pub checkout_url: String,
    /// Total charged, in minor units.
    pub amount: i64,
}

/// Quantities outside `1..=MAX_TICKETS_PER_PURCHASE` are rejected, not clamped.
pub fn validate_quantity(quantity: i64) -> BookingResult<i64> {
    if (1..=MAX_TICKETS_PER_PURCHASE).contains(&quantity) {
        Ok(quantity)
    } else {
        Err(BookingError::Validation(format!(
            "quantity must be between 1 and {MAX_TICKETS_PER_PURCHASE}"
        )))
    }
}

/// Price in minor units, if it is a usable positive amount.
fn unit_amount(price: f64) -> Option<i64> {
    if !price.is_finite() || price <= 0.0 {
        return None;
    }
    let cents = (price * 100.0).round();
    (cents >= 1.0).then_some(cents as i64)
}

impl Booking {
    /// Reserves seats for a purchase and opens a checkout session for them.
    ///
    /// On success exactly one pending reservation exists for the attempt and
    /// `spots_taken` is unchanged; on any failure nothing is written.
    pub async fn request_purchase(&self, request: &PurchaseRequest, now: DateTime<Utc>) -> BookingResult<PurchaseIntent> {
        let quantity = validate_quantity(request.quantity)?;

        let mut tx = self.pool.begin().await?;
        let result = self.reserve_locked(&mut tx, request, quantity, now).await;
        let intent = finish(tx, result).await?;

        info!(
            match_id = request.match_id,
            user_id = request.user_id,
            reservation_id = intent.reservation_id,
            session_id = %intent.session_id,
            ticket_type = %request.ticket_type,
            quantity,
            "Purchase reserved, awaiting payment"
        );
        Ok(intent)
    }

    async fn reserve_locked(
        &self,
        conn: &mut SqliteConnection,
        request: &PurchaseRequest,
        quantity: i64,
        now: DateTime<Utc>,
    ) -> BookingResult<PurchaseIntent> {
        let game = ledger::lock_match_for_update(conn, request.match_id)
            .await?
            .ok_or(BookingError::MatchNotFound(request.match_id))?;

        if !game.status.is_payable() {
            return Err(BookingError::NotPayable);
        }
        if game.capacity <= 0 {
            return Err(BookingError::MisconfiguredCapacity);
        }

        let held = ledger::held_seats(conn, game.id).await?;
        let committed = game.spots_taken + held;
        if committed >= game.capacity {
            return Err(BookingError::MatchFull);
        }
        if committed + quantity > game.capacity {
            return Err(BookingError::InsufficientSpots {
                requested: quantity,
                available: game.capacity - committed,
            });
        }

        let unit_amount = unit_amount(game.price_eur).ok_or(BookingError::InvalidPrice)?;

        let color_taken = ledger::color_count(conn, game.id, request.ticket_type).await?;
        if color_taken + quantity > game.per_color_limit() {
            return Err(BookingError::ColorSoldOut(request.ticket_type));
        }

        let reservation_id =
            reservations::insert_pending(conn, game.id, request.user_id, request.ticket_type, quantity, now).await?;

        let checkout = self.checkout_request(&game, request, reservation_id, quantity, unit_amount, now);
        let session = self.gateway.create_checkout_session(&checkout).await.map_err(|e| {
            warn!(match_id = game.id, error = %e, "Checkout session creation failed");
            BookingError::from(e)
        })?;

        reservations::attach_session(conn, reservation_id, &session.id, now).await?;

        Ok(PurchaseIntent {
            reservation_id,
            session_id: session.id,
            checkout_url: session.url,
            amount: checkout.amount(),
        })
    }

    fn checkout_request(
        &self,
        game: &Match,
        request: &PurchaseRequest,
        reservation_id: i64,
        quantity: i64,
        unit_amount: i64,
        now: DateTime<Utc>,
    ) -> CheckoutRequest {
        let metadata = BTreeMap::from([
            ("match_id".to_string(), game.id.to_string()),
            ("user_id".to_string(), request.user_id.to_string()),
            ("reservation_id".to_string(), reservation_id.to_string()),
            ("ticket_type".to_string(), request.ticket_type.to_string()),
            ("quantity".to_string(), quantity.to_string()),
        ]);
        CheckoutRequest {
            currency: self.policy.currency.clone(),
            unit_amount,
            quantity,
            product_name: format!("{} · {} shirt", game.title, request.ticket_type),
            description: format!("{} · {}", game.city, game.starts_at.format("%Y-%m-%d %H:%M UTC")),
            metadata,
            success_url: self.policy.success_url.clone(),
            cancel_url: self.policy.cancel_url.clone(),
            expires_at: Some(now + self.policy.hold_ttl),
        }
    }
}
