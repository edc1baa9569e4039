use matchday_models::TicketType;
use matchday_payments::GatewayError;
use serde::Serialize;
use thiserror::Error;

/// Coarse classification callers branch on (HTTP status, retry policy).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    ValidationError,
    NotFound,
    StateConflict,
    GatewayError,
    SignatureInvalid,
    /// The database stayed locked past the busy timeout; safe to retry.
    Busy,
    InternalError,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::ValidationError => "ValidationError",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::StateConflict => "StateConflict",
            ErrorKind::GatewayError => "GatewayError",
            ErrorKind::SignatureInvalid => "SignatureInvalid",
            ErrorKind::Busy => "Busy",
            ErrorKind::InternalError => "InternalError",
        }
    }
}

#[derive(Debug, Error)]
pub enum BookingError {
    #[error("{0}")]
    Validation(String),

    #[error("match {0} not found")]
    MatchNotFound(i64),

    #[error("you are not registered for this match")]
    NotRegistered,

    #[error("match is not open for payment")]
    NotPayable,

    #[error("match capacity is not configured")]
    MisconfiguredCapacity,

    #[error("match is full")]
    MatchFull,

    #[error("only {available} spots left, {requested} requested")]
    InsufficientSpots { requested: i64, available: i64 },

    #[error("match has an invalid price")]
    InvalidPrice,

    #[error("not enough {0} shirts left for this match")]
    ColorSoldOut(TicketType),

    #[error("reservation already cancelled")]
    AlreadyCancelled,

    #[error("too close to kick-off for a refund")]
    OutsideRefundWindow,

    #[error("payment for this reservation could not be located")]
    ChargeNotFound,

    #[error("refund share of the captured amount rounds to zero")]
    NothingToRefund,

    #[error("match {0} has no room left to settle this payment")]
    CapacityExceeded(i64),

    #[error("payment gateway error: {0}")]
    Gateway(GatewayError),

    #[error("webhook signature invalid: {0}")]
    SignatureInvalid(String),

    #[error("service busy, try again")]
    Busy,

    #[error("internal error: {0:#}")]
    Internal(anyhow::Error),
}

impl BookingError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BookingError::Validation(_) => ErrorKind::ValidationError,
            BookingError::MatchNotFound(_) | BookingError::NotRegistered => ErrorKind::NotFound,
            BookingError::NotPayable
            | BookingError::MisconfiguredCapacity
            | BookingError::MatchFull
            | BookingError::InsufficientSpots { .. }
            | BookingError::InvalidPrice
            | BookingError::ColorSoldOut(_)
            | BookingError::AlreadyCancelled
            | BookingError::OutsideRefundWindow
            | BookingError::ChargeNotFound
            | BookingError::NothingToRefund
            | BookingError::CapacityExceeded(_) => ErrorKind::StateConflict,
            BookingError::Gateway(_) => ErrorKind::GatewayError,
            BookingError::SignatureInvalid(_) => ErrorKind::SignatureInvalid,
            BookingError::Busy => ErrorKind::Busy,
            BookingError::Internal(_) => ErrorKind::InternalError,
        }
    }

    /// Stable machine-readable code for clients.
    pub fn code(&self) -> &'static str {
        match self {
            BookingError::Validation(_) => "VALIDATION",
            BookingError::MatchNotFound(_) => "MATCH_NOT_FOUND",
            BookingError::NotRegistered => "NOT_REGISTERED",
            BookingError::NotPayable => "NOT_PAYABLE",
            BookingError::MisconfiguredCapacity => "MISCONFIGURED_CAPACITY",
            BookingError::MatchFull => "MATCH_FULL",
            BookingError::InsufficientSpots { .. } => "INSUFFICIENT_SPOTS",
            BookingError::InvalidPrice => "INVALID_PRICE",
            BookingError::ColorSoldOut(_) => "COLOR_SOLD_OUT",
            BookingError::AlreadyCancelled => "ALREADY_CANCELLED",
            BookingError::OutsideRefundWindow => "OUTSIDE_REFUND_WINDOW",
            BookingError::ChargeNotFound => "CHARGE_NOT_FOUND",
            BookingError::NothingToRefund => "NOTHING_TO_REFUND",
            BookingError::CapacityExceeded(_) => "CAPACITY_EXCEEDED",
            BookingError::Gateway(_) => "GATEWAY_ERROR",
            BookingError::SignatureInvalid(_) => "SIGNATURE_INVALID",
            BookingError::Busy => "BUSY",
            BookingError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl From<GatewayError> for BookingError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::SignatureInvalid(reason) => BookingError::SignatureInvalid(reason),
            other => BookingError::Gateway(other),
        }
    }
}

impl From<anyhow::Error> for BookingError {
    fn from(err: anyhow::Error) -> Self {
        let busy = err
            .chain()
            .filter_map(|cause| cause.downcast_ref::<sqlx::Error>())
            .any(matchday_db::is_busy);
        if busy { BookingError::Busy } else { BookingError::Internal(err) }
    }
}

impl From<sqlx::Error> for BookingError {
    fn from(err: sqlx::Error) -> Self {
        if matchday_db::is_busy(&err) {
            BookingError::Busy
        } else {
            BookingError::Internal(err.into())
        }
    }
}
