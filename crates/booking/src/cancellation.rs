use chrono::{DateTime, Duration, Utc};
use matchday_db::{ledger, reservations};
use matchday_models::{MAX_TICKETS_PER_PURCHASE, Match, Reservation, ReservationStatus};
use serde::Serialize;
use sqlx::SqliteConnection;
use tracing::{info, warn};

use crate::{Booking, BookingError, BookingResult, finish};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelRequest {
    pub match_id: i64,
    pub user_id: i64,
    /// Required when the caller holds more than one active ticket.
    pub reservation_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelOutcome {
    pub reservation_id: i64,
    /// Refunded share of the ticket price. 0 for an unpaid reservation.
    pub percent: i64,
    pub refund_id: Option<String>,
    /// Refunded amount in minor units.
    pub refund_amount: i64,
    /// Whether a paid seat went back to the match.
    pub released: bool,
}

/// Refund tier for a paid ticket: 100% more than a day before kick-off, 40%
/// more than three hours before, nothing after that.
pub fn refund_percent(starts_at: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    let left = starts_at - now;
    if left > Duration::hours(24) {
        100
    } else if left > Duration::hours(3) {
        40
    } else {
        0
    }
}

/// One ticket's share of a session's captured amount at `percent`.
fn refund_amount(captured: i64, session_quantity: i64, percent: i64) -> i64 {
    let per_ticket = captured as f64 / session_quantity.max(1) as f64;
    (per_ticket * percent as f64 / 100.0).round() as i64
}

impl Booking {
    /// Cancels one ticket. Unpaid reservations are dropped; paid ones are
    /// refunded by tier and their seat is released. The refund is requested
    /// before anything is written, and a failed refund leaves the reservation
    /// and the match untouched.
    pub async fn cancel(&self, request: &CancelRequest, now: DateTime<Utc>) -> BookingResult<CancelOutcome> {
        let mut tx = self.pool.begin().await?;
        let result = self.cancel_locked(&mut tx, request, now).await;
        let outcome = finish(tx, result).await?;

        info!(
            match_id = request.match_id,
            user_id = request.user_id,
            reservation_id = outcome.reservation_id,
            percent = outcome.percent,
            refund_id = outcome.refund_id.as_deref().unwrap_or("none"),
            refund_amount = outcome.refund_amount,
            "Reservation cancelled"
        );
        Ok(outcome)
    }

    async fn cancel_locked(
        &self,
        conn: &mut SqliteConnection,
        request: &CancelRequest,
        now: DateTime<Utc>,
    ) -> BookingResult<CancelOutcome> {
        let game = ledger::lock_match_for_update(conn, request.match_id)
            .await?
            .ok_or(BookingError::MatchNotFound(request.match_id))?;

        let reservation = self.cancellation_target(conn, request).await?;

        match reservation.status {
            ReservationStatus::Cancelled => Err(BookingError::AlreadyCancelled),
            ReservationStatus::Pending => {
                reservations::delete_pending(conn, reservation.id).await?;
                Ok(CancelOutcome {
                    reservation_id: reservation.id,
                    percent: 0,
                    refund_id: None,
                    refund_amount: 0,
                    released: false,
                })
            }
            ReservationStatus::Confirmed => self.refund_confirmed(conn, &game, &reservation, now).await,
        }
    }

    /// The single row a cancel request addresses.
    async fn cancellation_target(
        &self,
        conn: &mut SqliteConnection,
        request: &CancelRequest,
    ) -> BookingResult<Reservation> {
        if let Some(reservation_id) = request.reservation_id {
            return match reservations::get_reservation(conn, reservation_id).await? {
                Some(row) if row.user_id == request.user_id && row.match_id == request.match_id => Ok(row),
                _ => Err(BookingError::NotRegistered),
            };
        }

        let mut active = reservations::active_for_user(conn, request.user_id, request.match_id).await?;
        match active.len() {
            0 => match reservations::latest_for_user(conn, request.user_id, request.match_id).await? {
                Some(row) if row.status == ReservationStatus::Cancelled => Err(BookingError::AlreadyCancelled),
                _ => Err(BookingError::NotRegistered),
            },
            1 => Ok(active.remove(0)),
            n => Err(BookingError::Validation(format!(
                "you hold {n} tickets for this match, pass reservationId to choose one"
            ))),
        }
    }

    async fn refund_confirmed(
        &self,
        conn: &mut SqliteConnection,
        game: &Match,
        reservation: &Reservation,
        now: DateTime<Utc>,
    ) -> BookingResult<CancelOutcome> {
        let percent = refund_percent(game.starts_at, now);
        if percent == 0 {
            return Err(BookingError::OutsideRefundWindow);
        }

        let session_id = reservation.session_id.as_deref().ok_or(BookingError::ChargeNotFound)?;
        let session = self.gateway.retrieve_session(session_id).await.map_err(|e| {
            warn!(reservation_id = reservation.id, session_id, error = %e, "Session lookup failed");
            BookingError::from(e)
        })?;
        let charge = session.charge.ok_or(BookingError::ChargeNotFound)?;

        let session_quantity = session
            .metadata
            .get("quantity")
            .and_then(|q| q.trim().parse::<i64>().ok())
            .unwrap_or(1)
            .clamp(1, MAX_TICKETS_PER_PURCHASE);
        let amount = refund_amount(charge.amount_captured, session_quantity, percent);
        if amount <= 0 {
            warn!(reservation_id = reservation.id, captured = charge.amount_captured, percent, "Refund rounds to nothing");
            return Err(BookingError::NothingToRefund);
        }

        let idempotency_key = format!("refund-{}", reservation.id);
        let refund = self
            .gateway
            .issue_refund(&charge.id, amount, &idempotency_key)
            .await
            .map_err(|e| {
                warn!(reservation_id = reservation.id, charge_id = %charge.id, amount, error = %e, "Refund failed");
                BookingError::from(e)
            })?;

        if !reservations::cancel_confirmed(conn, reservation.id, now).await? {
            return Err(BookingError::AlreadyCancelled);
        }
        ledger::decrement_taken(conn, game.id, 1).await?;

        Ok(CancelOutcome {
            reservation_id: reservation.id,
            percent,
            refund_id: Some(refund.id),
            refund_amount: refund.amount,
            released: true,
        })
    }
}
