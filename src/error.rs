//! Error types for the conversation engine

use serde::Serialize;
use thiserror::Error;

/// Classified failure from one of the consumed REST interfaces.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ApiError {
    pub kind: ApiErrorKind,
    pub message: String,
}

impl ApiError {
    pub fn new(kind: ApiErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ApiErrorKind::Network, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ApiErrorKind::Auth, message)
    }

    pub fn rate_limit(message: impl Into<String>) -> Self {
        Self::new(ApiErrorKind::RateLimit, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ApiErrorKind::InvalidRequest, message)
    }

    pub fn server_error(message: impl Into<String>) -> Self {
        Self::new(ApiErrorKind::ServerError, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ApiErrorKind::Unknown, message)
    }

    /// Classify a non-success HTTP response.
    pub fn from_status(status: u16, body: &str) -> Self {
        match status {
            401 | 403 => Self::auth(format!("Authentication failed: {body}")),
            429 => Self::rate_limit(format!("Rate limited: {body}")),
            400 | 404 | 422 => Self::invalid_request(format!("Invalid request: {body}")),
            500..=599 => Self::server_error(format!("Server error: {body}")),
            _ => Self::unknown(format!("HTTP {status}: {body}")),
        }
    }

    /// Classify a reqwest client-side failure.
    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::network(format!("Request timeout: {err}"))
        } else if err.is_connect() {
            Self::network(format!("Connection failed: {err}"))
        } else {
            Self::unknown(format!("Request failed: {err}"))
        }
    }
}

/// Error classification for display and retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorKind {
    /// Connection failures and timeouts
    Network,
    /// Authentication failed (401, 403)
    Auth,
    /// Rate limited (429)
    RateLimit,
    /// Bad request (400, 404, 422)
    InvalidRequest,
    /// Server error (5xx)
    ServerError,
    /// Anything else
    Unknown,
}

/// Field-level tool parameter validation failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Errors surfaced to the host through the engine API.
///
/// Cancellation is deliberately absent: stopping a stream is a successful
/// partial completion, not an error.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("assistant is busy; wait for the current operation to finish")]
    Busy,

    #[error("invalid tool parameters")]
    Validation(Vec<FieldError>),

    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("no user message to regenerate")]
    NothingToRegenerate,

    #[error("request failed: {0}")]
    Transport(ApiError),

    #[error("could not update the interaction log: {0}")]
    Persistence(ApiError),

    #[error("engine is no longer running")]
    Closed,
}

/// A transient, dismissible notice shown alongside the conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub kind: NoticeKind,
    pub message: String,
}

impl Notice {
    pub fn transport(err: &ApiError) -> Self {
        Self {
            kind: NoticeKind::Transport,
            message: err.message.clone(),
        }
    }

    pub fn persistence(err: &ApiError) -> Self {
        Self {
            kind: NoticeKind::Persistence,
            message: err.message.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeKind {
    /// Stream open/read or tool endpoint failure; prior log state untouched.
    Transport,
    /// A log create/delete call failed; the engine resynchronized from the
    /// store afterwards.
    Persistence,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert_eq!(ApiError::from_status(401, "nope").kind, ApiErrorKind::Auth);
        assert_eq!(
            ApiError::from_status(429, "slow down").kind,
            ApiErrorKind::RateLimit
        );
        assert_eq!(
            ApiError::from_status(422, "bad field").kind,
            ApiErrorKind::InvalidRequest
        );
        assert_eq!(
            ApiError::from_status(503, "oops").kind,
            ApiErrorKind::ServerError
        );
        assert_eq!(
            ApiError::from_status(302, "redirect").kind,
            ApiErrorKind::Unknown
        );
    }
}
