use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use matchday_booking::{BookingError, ErrorKind};
use serde_json::json;
use tracing::error;

/// Error returned by handlers, rendered as `{ok: false, kind, code, msg}`.
///
/// Internal causes are logged when the response is built and never sent to
/// the client.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    kind: &'static str,
    code: &'static str,
    msg: String,
    source: Option<anyhow::Error>,
}

impl ApiError {
    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            kind: "Unauthorized",
            code: "UNAUTHORIZED",
            msg: msg.into(),
            source: None,
        }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            kind: ErrorKind::ValidationError.as_str(),
            code: "VALIDATION",
            msg: msg.into(),
            source: None,
        }
    }

    /// A settlement that could not be applied. Always a 500 so the payment
    /// provider redelivers the event.
    pub fn settlement_failed(err: BookingError) -> Self {
        let mut api = ApiError::from(err);
        api.status = StatusCode::INTERNAL_SERVER_ERROR;
        api
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::ValidationError | ErrorKind::SignatureInvalid => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::StateConflict => StatusCode::CONFLICT,
        ErrorKind::GatewayError => StatusCode::BAD_GATEWAY,
        ErrorKind::Busy => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<BookingError> for ApiError {
    fn from(err: BookingError) -> Self {
        let kind = err.kind();
        let code = err.code();
        match err {
            BookingError::Internal(cause) => Self {
                status: status_for(kind),
                kind: kind.as_str(),
                code,
                msg: "internal server error".to_string(),
                source: Some(cause),
            },
            other => Self {
                status: status_for(kind),
                kind: kind.as_str(),
                code,
                msg: other.to_string(),
                source: None,
            },
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        BookingError::Internal(err).into()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let Some(cause) = &self.source {
            error!(code = self.code, error = ?cause, "Request failed");
        }
        let body = json!({
            "ok": false,
            "kind": self.kind,
            "code": self.code,
            "msg": self.msg,
        });
        (self.status, Json(body)).into_response()
    }
}
