use std::str::FromStr;
use std::time::Duration;

use anyhow::{Result, ensure};
use chrono::{DateTime, Utc};
use matchday_models::{Attendee, MAX_CAPACITY, Match, MatchStatus, NewMatch, ReservationSummary};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use tracing::info;

pub mod ledger;
pub mod reservations;

/// How long a writer waits for the database lock. Must outlast a payment
/// provider call, since purchases and refunds hold the lock across one.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(30);

pub async fn connect(database_url: &str) -> Result<SqlitePool> {
    connect_with_busy_timeout(database_url, DEFAULT_BUSY_TIMEOUT).await
}

pub async fn connect_with_busy_timeout(database_url: &str, busy_timeout: Duration) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(busy_timeout)
        .foreign_keys(true);
    let pool = SqlitePoolOptions::new().connect_with(options).await?;
    info!(busy_timeout_ms = busy_timeout.as_millis() as u64, "Connected to database: {database_url}");
    Ok(pool)
}

/// Whether `err` means another writer held the database lock for longer than
/// the busy timeout. The operation can be retried as is.
pub fn is_busy(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut => true,
        sqlx::Error::Database(db) => db
            .code()
            .and_then(|code| code.parse::<i32>().ok())
            // SQLITE_BUSY / SQLITE_LOCKED and their extended codes
            .is_some_and(|code| matches!(code & 0xff, 5 | 6)),
        _ => false,
    }
}

pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    sqlx::migrate!("../../migrations").run(pool).await?;
    info!("Migrations applied");
    Ok(())
}

pub async fn ping(pool: &SqlitePool) -> Result<()> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}

pub(crate) const MATCH_COLUMNS: &str = "id, title, city, field_name, starts_at, duration_min, \
    price_eur, capacity, spots_taken, status";

pub async fn list_matches(pool: &SqlitePool, only_open: bool) -> Result<Vec<Match>> {
    let sql = if only_open {
        format!(
            "SELECT {MATCH_COLUMNS} FROM matches \
             WHERE status IN ('scheduled', 'open') AND spots_taken < capacity \
             ORDER BY starts_at"
        )
    } else {
        format!("SELECT {MATCH_COLUMNS} FROM matches ORDER BY starts_at")
    };
    let matches = sqlx::query_as::<_, Match>(&sql).fetch_all(pool).await?;
    Ok(matches)
}

pub async fn get_match(pool: &SqlitePool, match_id: i64) -> Result<Option<Match>> {
    let sql = format!("SELECT {MATCH_COLUMNS} FROM matches WHERE id = ?");
    let found = sqlx::query_as::<_, Match>(&sql)
        .bind(match_id)
        .fetch_optional(pool)
        .await?;
    Ok(found)
}

/// Inserts a match on behalf of the admin collaborator. Only the storage
/// bounds are checked here.
pub async fn create_match(pool: &SqlitePool, new: &NewMatch, now: DateTime<Utc>) -> Result<Match> {
    ensure!(
        (0..=MAX_CAPACITY).contains(&new.capacity),
        "capacity must be between 0 and {MAX_CAPACITY}"
    );
    let id = sqlx::query(
        "INSERT INTO matches (title, city, field_name, starts_at, duration_min, price_eur, \
            capacity, spots_taken, status, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?, ?, ?)",
    )
    .bind(&new.title)
    .bind(&new.city)
    .bind(&new.field_name)
    .bind(new.starts_at)
    .bind(new.duration_min)
    .bind(new.price_eur)
    .bind(new.capacity)
    .bind(new.status)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?
    .last_insert_rowid();

    get_match(pool, id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("match {id} vanished after insert"))
}

pub async fn set_match_status(pool: &SqlitePool, match_id: i64, status: MatchStatus) -> Result<bool> {
    let result = sqlx::query("UPDATE matches SET status = ?, updated_at = ? WHERE id = ?")
        .bind(status)
        .bind(Utc::now())
        .bind(match_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Seats still available per color, floored at zero: `(white, black)`.
pub async fn color_remaining(pool: &SqlitePool, game: &Match) -> Result<(i64, i64)> {
    let mut conn = pool.acquire().await?;
    let limit = game.per_color_limit();
    let white = ledger::color_count(&mut conn, game.id, matchday_models::TicketType::White).await?;
    let black = ledger::color_count(&mut conn, game.id, matchday_models::TicketType::Black).await?;
    Ok(((limit - white).max(0), (limit - black).max(0)))
}

pub async fn list_reservations_for_user(pool: &SqlitePool, user_id: i64) -> Result<Vec<ReservationSummary>> {
    let rows = sqlx::query_as::<_, ReservationSummary>(
        "SELECT r.id AS reservation_id, r.status, r.session_id, r.ticket_type, \
                m.id AS match_id, m.title, m.city, m.starts_at, m.duration_min, m.field_name \
         FROM reservations r \
         JOIN matches m ON m.id = r.match_id \
         WHERE r.user_id = ? \
         ORDER BY m.starts_at DESC \
         LIMIT 300",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Confirmed ticket holders of a match, whites first.
pub async fn list_attendees(pool: &SqlitePool, match_id: i64) -> Result<Vec<Attendee>> {
    let rows = sqlx::query_as::<_, Attendee>(
        "SELECT user_id, ticket_type FROM reservations \
         WHERE match_id = ? AND status = 'confirmed' \
         ORDER BY CASE ticket_type WHEN 'white' THEN 0 WHEN 'black' THEN 1 ELSE 2 END, user_id",
    )
    .bind(match_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}


#[cfg(test)]
mod tests {
    use super::testing;
    use super::*;
    use matchday_models::TicketType;

    #[tokio::test]
    async fn create_and_fetch_match() {
        let pool = testing::pool().await;
        let created = create_match(&pool, &testing::new_match(10), Utc::now()).await.unwrap();
        assert_eq!(created.capacity, 10);
        assert_eq!(created.spots_taken, 0);
        assert_eq!(created.status, MatchStatus::Open);

        let fetched = get_match(&pool, created.id).await.unwrap().unwrap();
        assert_eq!(fetched.title, "Jueves noche");
        assert!(get_match(&pool, created.id + 100).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rejects_capacity_above_bound() {
        let pool = testing::pool().await;
        assert!(create_match(&pool, &testing::new_match(51), Utc::now()).await.is_err());
    }

    #[tokio::test]
    async fn only_open_hides_full_and_closed_matches() {
        let pool = testing::pool().await;
        let open = create_match(&pool, &testing::new_match(10), Utc::now()).await.unwrap();
        let closed = create_match(&pool, &testing::new_match(10), Utc::now()).await.unwrap();
        set_match_status(&pool, closed.id, MatchStatus::Completed).await.unwrap();

        let listed = list_matches(&pool, true).await.unwrap();
        assert_eq!(listed.iter().map(|m| m.id).collect::<Vec<_>>(), vec![open.id]);
        assert_eq!(list_matches(&pool, false).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn color_remaining_counts_pending_and_confirmed_seats() {
        let pool = testing::pool().await;
        let game = create_match(&pool, &testing::new_match(10), Utc::now()).await.unwrap();
        let mut conn = pool.acquire().await.unwrap();
        reservations::insert_pending(&mut conn, game.id, 1, TicketType::White, 3, Utc::now())
            .await
            .unwrap();
        reservations::insert_confirmed(&mut conn, game.id, 2, Some(TicketType::Black), "cs_1", Utc::now())
            .await
            .unwrap();
        drop(conn);

        let (white, black) = color_remaining(&pool, &game).await.unwrap();
        assert_eq!(white, 2);
        assert_eq!(black, 4);
    }

    #[tokio::test]
    async fn attendees_are_confirmed_only_whites_first() {
        let pool = testing::pool().await;
        let game = create_match(&pool, &testing::new_match(10), Utc::now()).await.unwrap();
        let mut conn = pool.acquire().await.unwrap();
        reservations::insert_confirmed(&mut conn, game.id, 7, Some(TicketType::Black), "cs_a", Utc::now())
            .await
            .unwrap();
        reservations::insert_confirmed(&mut conn, game.id, 9, Some(TicketType::White), "cs_b", Utc::now())
            .await
            .unwrap();
        reservations::insert_pending(&mut conn, game.id, 3, TicketType::White, 1, Utc::now())
            .await
            .unwrap();
        drop(conn);

        let attendees = list_attendees(&pool, game.id).await.unwrap();
        let users: Vec<i64> = attendees.iter().map(|a| a.user_id).collect();
        assert_eq!(users, vec![9, 7]);
    }

    #[tokio::test]
    async fn user_reservations_join_match_data() {
        let pool = testing::pool().await;
        let game = create_match(&pool, &testing::new_match(10), Utc::now()).await.unwrap();
        let mut conn = pool.acquire().await.unwrap();
        reservations::insert_pending(&mut conn, game.id, 5, TicketType::Black, 1, Utc::now())
            .await
            .unwrap();
        drop(conn);

        let mine = list_reservations_for_user(&pool, 5).await.unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].match_id, game.id);
        assert_eq!(mine[0].city, "Madrid");
        assert!(list_reservations_for_user(&pool, 6).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn lock_contention_is_reported_as_busy() {
        let path = std::env::temp_dir().join(format!("matchday-db-{}.db", uuid::Uuid::new_v4()));
        let pool = connect_with_busy_timeout(&format!("sqlite:{}", path.display()), Duration::from_millis(100))
            .await
            .unwrap();
        migrate(&pool).await.unwrap();

        let mut holder = pool.acquire().await.unwrap();
        let mut waiter = pool.acquire().await.unwrap();
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *holder).await.unwrap();

        let err = sqlx::query("UPDATE matches SET updated_at = updated_at")
            .execute(&mut *waiter)
            .await
            .unwrap_err();
        assert!(is_busy(&err), "unexpected error: {err}");

        sqlx::query("ROLLBACK").execute(&mut *holder).await.unwrap();
        sqlx::query("UPDATE matches SET updated_at = updated_at")
            .execute(&mut *waiter)
            .await
            .unwrap();
        assert!(!is_busy(&sqlx::Error::RowNotFound));
    }
}
