use chrono::{DateTime, Utc};
use matchday_db::{ledger, reservations};
use matchday_models::{MAX_TICKETS_PER_PURCHASE, TicketType};
use matchday_payments::CheckoutCompletion;
use sqlx::SqliteConnection;
use tracing::{error, info, warn};

use crate::{Booking, BookingError, BookingResult, finish};

/// A verified "payment completed" notification, with its metadata decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentCompletion {
    pub session_id: String,
    pub payment_status: Option<String>,
    pub reservation_id: Option<i64>,
    pub user_id: Option<i64>,
    pub match_id: Option<i64>,
    pub ticket_type: Option<TicketType>,
    /// Tickets paid for, clamped to `1..=MAX_TICKETS_PER_PURCHASE`.
    pub quantity: i64,
}

impl From<&CheckoutCompletion> for PaymentCompletion {
    fn from(completion: &CheckoutCompletion) -> Self {
        let id = |key: &str| {
            completion
                .metadata
                .get(key)
                .and_then(|v| v.trim().parse::<i64>().ok())
                .filter(|v| *v > 0)
        };
        let quantity = completion
            .metadata
            .get("quantity")
            .and_then(|v| v.trim().parse::<i64>().ok())
            .unwrap_or(1)
            .clamp(1, MAX_TICKETS_PER_PURCHASE);

        Self {
            session_id: completion.session_id.clone(),
            payment_status: completion.payment_status.clone(),
            // older checkout sessions name the row `inscription_id`
            reservation_id: id("reservation_id").or_else(|| id("inscription_id")),
            user_id: id("user_id"),
            match_id: id("match_id"),
            ticket_type: completion.metadata.get("ticket_type").and_then(|t| TicketType::parse(t)),
            quantity,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettlementOutcome {
    /// The session is not fully paid; nothing to do.
    NotPaid,
    /// Metadata does not identify a reservation or a user/match pair.
    Unresolvable,
    /// Replay, or the reservation is no longer pending.
    AlreadySettled,
    Confirmed { match_id: i64, tickets: i64 },
}

impl SettlementOutcome {
    pub fn tickets(self) -> i64 {
        match self {
            SettlementOutcome::Confirmed { tickets, .. } => tickets,
            _ => 0,
        }
    }
}

impl Booking {
    /// Applies a payment completion exactly once.
    ///
    /// `Ok` means the notification may be acknowledged (including the no-op
    /// outcomes). `Err` means nothing was written and the provider should
    /// retry.
    pub async fn settle(&self, completion: &PaymentCompletion, now: DateTime<Utc>) -> BookingResult<SettlementOutcome> {
        if completion.payment_status.as_deref() != Some("paid") {
            info!(
                session_id = %completion.session_id,
                payment_status = completion.payment_status.as_deref().unwrap_or("none"),
                "Checkout completed without full payment, ignoring"
            );
            return Ok(SettlementOutcome::NotPaid);
        }

        if completion.reservation_id.is_none() && completion.user_id.is_none() {
            warn!(session_id = %completion.session_id, "Not enough metadata to locate the reservation");
            return Ok(SettlementOutcome::Unresolvable);
        }
        let Some(match_id) = self.resolve_match(completion).await? else {
            warn!(session_id = %completion.session_id, "Payment does not name a match");
            return Ok(SettlementOutcome::Unresolvable);
        };

        let mut tx = self.pool.begin().await?;
        let result = self.settle_locked(&mut tx, completion, match_id, now).await;
        let outcome = finish(tx, result).await?;

        match outcome {
            SettlementOutcome::Confirmed { match_id, tickets } => info!(
                session_id = %completion.session_id,
                reservation_id = ?completion.reservation_id,
                user_id = ?completion.user_id,
                match_id,
                tickets,
                "Payment settled"
            ),
            other => info!(session_id = %completion.session_id, outcome = ?other, "Payment event was a no-op"),
        }
        Ok(outcome)
    }

    /// The match a completion belongs to. The reservation row wins over
    /// metadata when both exist.
    async fn resolve_match(&self, completion: &PaymentCompletion) -> BookingResult<Option<i64>> {
        if let Some(reservation_id) = completion.reservation_id {
            let mut conn = self.pool.acquire().await?;
            if let Some(row) = reservations::get_reservation(&mut conn, reservation_id).await? {
                return Ok(Some(row.match_id));
            }
        }
        Ok(completion.match_id)
    }

    async fn settle_locked(
        &self,
        conn: &mut SqliteConnection,
        completion: &PaymentCompletion,
        match_id: i64,
        now: DateTime<Utc>,
    ) -> BookingResult<SettlementOutcome> {
        if ledger::lock_match_for_update(conn, match_id).await?.is_none() {
            warn!(session_id = %completion.session_id, match_id, "Payment names an unknown match");
            return Ok(SettlementOutcome::Unresolvable);
        }
        if reservations::session_settled(conn, &completion.session_id).await? {
            return Ok(SettlementOutcome::AlreadySettled);
        }

        let session_id = completion.session_id.as_str();
        let ticket_type = completion.ticket_type;

        let tickets = if let Some(reservation_id) = completion.reservation_id {
            match reservations::confirm_pending(conn, reservation_id, session_id, ticket_type, now).await? {
                Some((_, user_id)) => {
                    1 + insert_tickets(conn, match_id, user_id, completion, completion.quantity - 1, now).await?
                }
                None => {
                    if reservations::get_reservation(conn, reservation_id).await?.is_some() {
                        return Ok(SettlementOutcome::AlreadySettled);
                    }
                    // The hold was dropped before the money arrived; the
                    // customer still paid for every ticket of the session.
                    let Some(user_id) = completion.user_id else {
                        error!(
                            session_id,
                            reservation_id,
                            match_id,
                            quantity = completion.quantity,
                            "Paid session lost its reservation and names no user; refund by hand"
                        );
                        return Ok(SettlementOutcome::Unresolvable);
                    };
                    warn!(session_id, reservation_id, user_id, "Paid session lost its reservation, issuing tickets");
                    insert_tickets(conn, match_id, user_id, completion, completion.quantity, now).await?
                }
            }
        } else if let Some(user_id) = completion.user_id {
            let confirmed =
                reservations::confirm_pending_for_user(conn, user_id, match_id, session_id, ticket_type, now).await?
                    as i64;
            confirmed + insert_tickets(conn, match_id, user_id, completion, completion.quantity - confirmed, now).await?
        } else {
            return Ok(SettlementOutcome::Unresolvable);
        };

        if tickets > 0 && !ledger::increment_taken(conn, match_id, tickets).await? {
            warn!(session_id, match_id, tickets, "Settlement would overfill the match");
            return Err(BookingError::CapacityExceeded(match_id));
        }

        Ok(SettlementOutcome::Confirmed { match_id, tickets })
    }
}

/// Writes `count` confirmed rows for the session. Returns how many were written.
async fn insert_tickets(
    conn: &mut SqliteConnection,
    match_id: i64,
    user_id: i64,
    completion: &PaymentCompletion,
    count: i64,
    now: DateTime<Utc>,
) -> BookingResult<i64> {
    let mut written = 0;
    for _ in 0..count.max(0) {
        reservations::insert_confirmed(conn, match_id, user_id, completion.ticket_type, &completion.session_id, now)
            .await?;
        written += 1;
    }
    Ok(written)
}
