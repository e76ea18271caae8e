use std::time::Duration;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::protocol::{CLOSE_INTERNAL_ERROR, CLOSE_POLICY_VIOLATION};

/// Everything the gateway can reject a client or an operation with.
///
/// The `#[error]` strings are wire-visible: they are sent verbatim in
/// `error { message }` frames and in close reasons, so they must stay stable.
#[derive(Error, Debug)]
pub enum GatewayError {
    // ── Upgrade / admission ──────────────────────────────────────────────
    #[error("missing token or tableId")]
    MissingCredentials,

    #[error("invalid authentication token")]
    InvalidToken,

    #[error("connection failed")]
    ConnectionFailed,

    #[error("Total connection limit reached")]
    TotalConnectionLimit,

    #[error("Table connection limit reached")]
    TableConnectionLimit,

    // ── Protocol ─────────────────────────────────────────────────────────
    #[error("invalid message format")]
    InvalidMessageFormat,

    #[error("unknown message type")]
    UnknownMessageType,

    #[error("{0}")]
    Protocol(String),

    // ── Channels / permissions ───────────────────────────────────────────
    #[error("invalid channel")]
    InvalidChannel,

    #[error("insufficient permissions")]
    InsufficientPermissions,

    #[error("table id required")]
    TableIdRequired,

    #[error("maximum subscriptions for channel reached")]
    ChannelSubscriptionCap,

    #[error("maximum channel subscriptions exceeded")]
    TotalSubscriptionCap,

    #[error("not subscribed")]
    NotSubscribed,

    #[error("unauthorized action")]
    UnauthorizedAction,

    // ── Rate limiting ────────────────────────────────────────────────────
    #[error("Rate limit exceeded. Please slow down.")]
    RateLimited { retry_after: Duration },

    // ── Collaborators ────────────────────────────────────────────────────
    #[error("{0}")]
    Upstream(String),

    // ── Delivery ─────────────────────────────────────────────────────────
    #[error("{0}")]
    Delivery(String),

    // ── Fatal ────────────────────────────────────────────────────────────
    #[error("internal error")]
    Fatal(String),
}

impl GatewayError {
    /// WebSocket close code for errors that terminate the connection.
    /// `None` means the connection stays open and the error is delivered as
    /// an `error { message }` frame.
    pub fn close_code(&self) -> Option<u16> {
        match self {
            Self::MissingCredentials
            | Self::InvalidToken
            | Self::ConnectionFailed
            | Self::TotalConnectionLimit
            | Self::TableConnectionLimit => Some(CLOSE_POLICY_VIOLATION),
            Self::Fatal(_) => Some(CLOSE_INTERNAL_ERROR),
            _ => None,
        }
    }

    /// The message shown to the client. In production mode, upstream failures
    /// collapse to a curated message so internal details never leak.
    pub fn user_message(&self, production: bool) -> String {
        match self {
            Self::Upstream(_) if production => "Service temporarily unavailable".to_owned(),
            Self::Fatal(_) => "internal error".to_owned(),
            other => other.to_string(),
        }
    }
}

/// HTTP mapping for the non-WebSocket surface (health and future REST-side
/// rejections). The upgrade path itself closes the socket with a WebSocket
/// code instead of using this.
impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = match &self {
            GatewayError::MissingCredentials | GatewayError::InvalidToken => {
                StatusCode::UNAUTHORIZED
            }
            GatewayError::TotalConnectionLimit | GatewayError::TableConnectionLimit => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::Fatal(detail) => {
                tracing::error!(detail = %detail, "Internal gateway error");
                StatusCode::INTERNAL_SERVER_ERROR
            }
            _ => StatusCode::BAD_REQUEST,
        };

        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;
