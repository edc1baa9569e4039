use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Most tickets a single checkout may buy.
pub const MAX_TICKETS_PER_PURCHASE: i64 = 8;

/// Hard upper bound on a match's capacity.
pub const MAX_CAPACITY: i64 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
pub enum MatchStatus {
    Scheduled,
    Open,
    Completed,
    Cancelled,
}

impl MatchStatus {
    /// Only scheduled and open matches accept new purchases.
    pub fn is_payable(self) -> bool {
        matches!(self, MatchStatus::Scheduled | MatchStatus::Open)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MatchStatus::Scheduled => "scheduled",
            MatchStatus::Open => "open",
            MatchStatus::Completed => "completed",
            MatchStatus::Cancelled => "cancelled",
        }
    }
}

/// Shirt color of a ticket. Each color is its own half of the pitch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
pub enum TicketType {
    White,
    Black,
}

impl TicketType {
    pub fn as_str(self) -> &'static str {
        match self {
            TicketType::White => "white",
            TicketType::Black => "black",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "white" => Some(TicketType::White),
            "black" => Some(TicketType::Black),
            _ => None,
        }
    }
}

impl std::fmt::Display for TicketType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
pub enum ReservationStatus {
    Pending,
    Confirmed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Match {
    pub id: i64,
    pub title: String,
    pub city: String,
    pub field_name: String,
    pub starts_at: DateTime<Utc>,
    pub duration_min: i64,
    pub price_eur: f64,
    pub capacity: i64,
    pub spots_taken: i64,
    pub status: MatchStatus,
}

impl Match {
    /// Tickets of one color allowed for this match: half the capacity, at least one.
    pub fn per_color_limit(&self) -> i64 {
        per_color_limit(self.capacity)
    }
}

pub fn per_color_limit(capacity: i64) -> i64 {
    if capacity <= 0 {
        return MAX_TICKETS_PER_PURCHASE;
    }
    (capacity / 2).max(1)
}

/// Fields the admin collaborator supplies when scheduling a match.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMatch {
    pub title: String,
    pub city: String,
    pub field_name: String,
    pub starts_at: DateTime<Utc>,
    pub duration_min: i64,
    pub price_eur: f64,
    pub capacity: i64,
    pub status: MatchStatus,
}

/// One ticket-holding row ("inscription").
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Reservation {
    pub id: i64,
    pub match_id: i64,
    pub user_id: i64,
    pub ticket_type: Option<TicketType>,
    pub status: ReservationStatus,
    /// Seats held by this row: the whole batch while pending, 1 once confirmed.
    pub seats: i64,
    pub session_id: Option<String>,
    pub goals: Option<i64>,
    pub assists: Option<i64>,
    pub mvp: bool,
    pub created_at: DateTime<Utc>,
}

/// A match as shown to a signed-in user, with what is left of each color.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchDetail {
    #[serde(flatten)]
    pub info: Match,
    pub white_remaining: i64,
    pub black_remaining: i64,
    pub is_admin: bool,
}

/// A row of "my reservations".
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct ReservationSummary {
    pub reservation_id: i64,
    pub status: ReservationStatus,
    pub session_id: Option<String>,
    pub ticket_type: Option<TicketType>,
    pub match_id: i64,
    pub title: String,
    pub city: String,
    pub starts_at: DateTime<Utc>,
    pub duration_min: i64,
    pub field_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Attendee {
    pub user_id: i64,
    pub ticket_type: Option<TicketType>,
}
