//! Inventory ledger: the authoritative `capacity` / `spots_taken` record of a
//! match and the per-color seat counts derived from reservation rows.
//!
//! Every function takes a connection so callers can run it inside the
//! transaction that holds the match lock.

use anyhow::Result;
use chrono::Utc;
use matchday_models::{Match, TicketType};
use sqlx::SqliteConnection;

use crate::MATCH_COLUMNS;

/// Takes the exclusive write lock on a match row and returns the row as seen
/// under that lock. `None` when the match does not exist.
///
/// The lock is acquired by writing the row before reading it, so it must be
/// the first statement of its transaction. It is held until commit/rollback.
pub async fn lock_match_for_update(conn: &mut SqliteConnection, match_id: i64) -> Result<Option<Match>> {
    let touched = sqlx::query("UPDATE matches SET updated_at = updated_at WHERE id = ?")
        .bind(match_id)
        .execute(&mut *conn)
        .await?
        .rows_affected();
    if touched == 0 {
        return Ok(None);
    }

    let sql = format!("SELECT {MATCH_COLUMNS} FROM matches WHERE id = ?");
    let locked = sqlx::query_as::<_, Match>(&sql)
        .bind(match_id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(locked)
}

/// Seats of one color held by pending or confirmed reservations.
pub async fn color_count(conn: &mut SqliteConnection, match_id: i64, ticket_type: TicketType) -> Result<i64> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COALESCE(SUM(seats), 0) FROM reservations \
         WHERE match_id = ? AND ticket_type = ? AND status IN ('pending', 'confirmed')",
    )
    .bind(match_id)
    .bind(ticket_type)
    .fetch_one(&mut *conn)
    .await?;
    Ok(count)
}

/// Seats soft-held by pending reservations (not yet in `spots_taken`).
pub async fn held_seats(conn: &mut SqliteConnection, match_id: i64) -> Result<i64> {
    let held: i64 = sqlx::query_scalar(
        "SELECT COALESCE(SUM(seats), 0) FROM reservations WHERE match_id = ? AND status = 'pending'",
    )
    .bind(match_id)
    .fetch_one(&mut *conn)
    .await?;
    Ok(held)
}

/// Adds `n` to `spots_taken`. Returns `false`, leaving the row untouched, when
/// the result would exceed capacity.
pub async fn increment_taken(conn: &mut SqliteConnection, match_id: i64, n: i64) -> Result<bool> {
    let updated = sqlx::query(
        "UPDATE matches SET spots_taken = spots_taken + ?, updated_at = ? \
         WHERE id = ? AND spots_taken + ? <= capacity",
    )
    .bind(n)
    .bind(Utc::now())
    .bind(match_id)
    .bind(n)
    .execute(&mut *conn)
    .await?
    .rows_affected();
    Ok(updated > 0)
}

/// Subtracts `n` from `spots_taken`, never going below zero.
pub async fn decrement_taken(conn: &mut SqliteConnection, match_id: i64, n: i64) -> Result<()> {
    sqlx::query(
        "UPDATE matches SET spots_taken = MAX(spots_taken - ?, 0), updated_at = ? WHERE id = ?",
    )
    .bind(n)
    .bind(Utc::now())
    .bind(match_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{create_match, get_match, reservations, testing};

    #[tokio::test]
    async fn lock_returns_none_for_missing_match() {
        let pool = testing::pool().await;
        let mut tx = pool.begin().await.unwrap();
        assert!(lock_match_for_update(&mut tx, 404).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn lock_reads_current_row() {
        let pool = testing::pool().await;
        let game = create_match(&pool, &testing::new_match(12), Utc::now()).await.unwrap();
        let mut tx = pool.begin().await.unwrap();
        let locked = lock_match_for_update(&mut tx, game.id).await.unwrap().unwrap();
        assert_eq!(locked.capacity, 12);
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn increment_refuses_to_exceed_capacity() {
        let pool = testing::pool().await;
        let game = create_match(&pool, &testing::new_match(4), Utc::now()).await.unwrap();
        let mut conn = pool.acquire().await.unwrap();

        assert!(increment_taken(&mut conn, game.id, 3).await.unwrap());
        assert!(!increment_taken(&mut conn, game.id, 2).await.unwrap());
        assert!(increment_taken(&mut conn, game.id, 1).await.unwrap());
        drop(conn);

        assert_eq!(get_match(&pool, game.id).await.unwrap().unwrap().spots_taken, 4);
    }

    #[tokio::test]
    async fn decrement_is_floored_at_zero() {
        let pool = testing::pool().await;
        let game = create_match(&pool, &testing::new_match(4), Utc::now()).await.unwrap();
        let mut conn = pool.acquire().await.unwrap();

        increment_taken(&mut conn, game.id, 1).await.unwrap();
        decrement_taken(&mut conn, game.id, 1).await.unwrap();
        decrement_taken(&mut conn, game.id, 1).await.unwrap();
        drop(conn);

        assert_eq!(get_match(&pool, game.id).await.unwrap().unwrap().spots_taken, 0);
    }

    #[tokio::test]
    async fn counts_ignore_cancelled_rows() {
        let pool = testing::pool().await;
        let game = create_match(&pool, &testing::new_match(10), Utc::now()).await.unwrap();
        let mut conn = pool.acquire().await.unwrap();

        let held = reservations::insert_pending(&mut conn, game.id, 1, TicketType::White, 2, Utc::now())
            .await
            .unwrap();
        let sold = reservations::insert_confirmed(&mut conn, game.id, 2, Some(TicketType::White), "cs_x", Utc::now())
            .await
            .unwrap();
        assert_eq!(color_count(&mut conn, game.id, TicketType::White).await.unwrap(), 3);
        assert_eq!(held_seats(&mut conn, game.id).await.unwrap(), 2);

        reservations::cancel_confirmed(&mut conn, sold, Utc::now()).await.unwrap();
        reservations::delete_pending(&mut conn, held).await.unwrap();
        assert_eq!(color_count(&mut conn, game.id, TicketType::White).await.unwrap(), 0);
        assert_eq!(held_seats(&mut conn, game.id).await.unwrap(), 0);
    }
}
