//! Reservation row operations. Status changes are conditioned on the current
//! status so a replayed or concurrent call affects zero rows instead of
//! overwriting.

use anyhow::Result;
use chrono::{DateTime, Utc};
use matchday_models::{Reservation, TicketType};
use sqlx::SqliteConnection;

const RESERVATION_COLUMNS: &str = "id, match_id, user_id, ticket_type, status, seats, session_id, \
    goals, assists, mvp, created_at";

pub async fn get_reservation(conn: &mut SqliteConnection, id: i64) -> Result<Option<Reservation>> {
    let sql = format!("SELECT {RESERVATION_COLUMNS} FROM reservations WHERE id = ?");
    let found = sqlx::query_as::<_, Reservation>(&sql)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(found)
}

/// Pending and confirmed rows a user holds for a match, oldest first.
pub async fn active_for_user(conn: &mut SqliteConnection, user_id: i64, match_id: i64) -> Result<Vec<Reservation>> {
    let sql = format!(
        "SELECT {RESERVATION_COLUMNS} FROM reservations \
         WHERE user_id = ? AND match_id = ? AND status IN ('pending', 'confirmed') \
         ORDER BY id"
    );
    let rows = sqlx::query_as::<_, Reservation>(&sql)
        .bind(user_id)
        .bind(match_id)
        .fetch_all(&mut *conn)
        .await?;
    Ok(rows)
}

/// Latest row of any status a user has for a match.
pub async fn latest_for_user(conn: &mut SqliteConnection, user_id: i64, match_id: i64) -> Result<Option<Reservation>> {
    let sql = format!(
        "SELECT {RESERVATION_COLUMNS} FROM reservations \
         WHERE user_id = ? AND match_id = ? ORDER BY id DESC LIMIT 1"
    );
    let row = sqlx::query_as::<_, Reservation>(&sql)
        .bind(user_id)
        .bind(match_id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(row)
}

/// Inserts a pending row holding `seats` seats. Returns the new id.
pub async fn insert_pending(
    conn: &mut SqliteConnection,
    match_id: i64,
    user_id: i64,
    ticket_type: TicketType,
    seats: i64,
    now: DateTime<Utc>,
) -> Result<i64> {
    let id = sqlx::query(
        "INSERT INTO reservations (match_id, user_id, ticket_type, status, seats, created_at, updated_at) \
         VALUES (?, ?, ?, 'pending', ?, ?, ?)",
    )
    .bind(match_id)
    .bind(user_id)
    .bind(ticket_type)
    .bind(seats)
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await?
    .last_insert_rowid();
    Ok(id)
}

/// Inserts an already-confirmed single-seat row. Returns the new id.
pub async fn insert_confirmed(
    conn: &mut SqliteConnection,
    match_id: i64,
    user_id: i64,
    ticket_type: Option<TicketType>,
    session_id: &str,
    now: DateTime<Utc>,
) -> Result<i64> {
    let id = sqlx::query(
        "INSERT INTO reservations (match_id, user_id, ticket_type, status, seats, session_id, created_at, updated_at) \
         VALUES (?, ?, ?, 'confirmed', 1, ?, ?, ?)",
    )
    .bind(match_id)
    .bind(user_id)
    .bind(ticket_type)
    .bind(session_id)
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await?
    .last_insert_rowid();
    Ok(id)
}

pub async fn attach_session(conn: &mut SqliteConnection, id: i64, session_id: &str, now: DateTime<Utc>) -> Result<()> {
    sqlx::query("UPDATE reservations SET session_id = ?, updated_at = ? WHERE id = ?")
        .bind(session_id)
        .bind(now)
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// pending -> confirmed for one row. The row keeps a single seat; the rest of
/// its batch is materialized by the caller. Returns `(match_id, user_id)` of
/// the row when it was still pending, `None` otherwise.
pub async fn confirm_pending(
    conn: &mut SqliteConnection,
    id: i64,
    session_id: &str,
    ticket_type: Option<TicketType>,
    now: DateTime<Utc>,
) -> Result<Option<(i64, i64)>> {
    let row: Option<(i64, i64)> = sqlx::query_as(
        "UPDATE reservations \
         SET status = 'confirmed', session_id = ?, ticket_type = COALESCE(ticket_type, ?), \
             seats = 1, updated_at = ? \
         WHERE id = ? AND status = 'pending' \
         RETURNING match_id, user_id",
    )
    .bind(session_id)
    .bind(ticket_type)
    .bind(now)
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(row)
}

/// pending -> confirmed for every pending row of a user in a match. Returns
/// the number of rows confirmed.
pub async fn confirm_pending_for_user(
    conn: &mut SqliteConnection,
    user_id: i64,
    match_id: i64,
    session_id: &str,
    ticket_type: Option<TicketType>,
    now: DateTime<Utc>,
) -> Result<u64> {
    let confirmed = sqlx::query(
        "UPDATE reservations \
         SET status = 'confirmed', session_id = ?, ticket_type = COALESCE(ticket_type, ?), \
             seats = 1, updated_at = ? \
         WHERE user_id = ? AND match_id = ? AND status = 'pending'",
    )
    .bind(session_id)
    .bind(ticket_type)
    .bind(now)
    .bind(user_id)
    .bind(match_id)
    .execute(&mut *conn)
    .await?
    .rows_affected();
    Ok(confirmed)
}

/// True once a checkout session has been settled: some row carrying it has
/// left the pending state.
pub async fn session_settled(conn: &mut SqliteConnection, session_id: &str) -> Result<bool> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM reservations WHERE session_id = ? AND status IN ('confirmed', 'cancelled')",
    )
    .bind(session_id)
    .fetch_one(&mut *conn)
    .await?;
    Ok(count > 0)
}

/// Deletes an unpaid row. Returns whether a pending row was removed.
pub async fn delete_pending(conn: &mut SqliteConnection, id: i64) -> Result<bool> {
    let deleted = sqlx::query("DELETE FROM reservations WHERE id = ? AND status = 'pending'")
        .bind(id)
        .execute(&mut *conn)
        .await?
        .rows_affected();
    Ok(deleted > 0)
}

/// confirmed -> cancelled. Returns whether the row was still confirmed.
pub async fn cancel_confirmed(conn: &mut SqliteConnection, id: i64, now: DateTime<Utc>) -> Result<bool> {
    let cancelled = sqlx::query(
        "UPDATE reservations SET status = 'cancelled', updated_at = ? WHERE id = ? AND status = 'confirmed'",
    )
    .bind(now)
    .bind(id)
    .execute(&mut *conn)
    .await?
    .rows_affected();
    Ok(cancelled > 0)
}

/// Cancels every pending row created before `cutoff`. Returns how many.
pub async fn expire_pending_before(
    conn: &mut SqliteConnection,
    cutoff: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<u64> {
    let expired = sqlx::query(
        "UPDATE reservations SET status = 'cancelled', updated_at = ? \
         WHERE status = 'pending' AND created_at < ?",
    )
    .bind(now)
    .bind(cutoff)
    .execute(&mut *conn)
    .await?
    .rows_affected();
    Ok(expired)
}
