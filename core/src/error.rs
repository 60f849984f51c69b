use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;

/// Sentinel surfaced when the backend keeps rejecting the access token.
pub const AUTH_EXPIRED: &str = "AUTH_EXPIRED";
/// Sentinel surfaced when a conversation does not exist for the current user.
pub const CONVERSATION_NOT_FOUND: &str = "CONVERSATION_NOT_FOUND";

/// Failures raised by an [`HttpTransport`](crate::transport::HttpTransport).
///
/// Kept as plain strings so one failure can be cloned to every caller that
/// was waiting on it.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(String),
    /// Carries the bound when it is known to the caller that enforced it.
    #[error("request timed out{}", .0.map(|after| format!(" after {after:?}")).unwrap_or_default())]
    Timeout(Option<Duration>),
    #[error("failed to read response body: {0}")]
    Body(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            Self::Timeout(None)
        } else if error.is_builder() {
            Self::InvalidRequest(error.to_string())
        } else if error.is_body() || error.is_decode() {
            Self::Body(error.to_string())
        } else {
            Self::Connect(error.to_string())
        }
    }
}

/// Why a token renewal did not produce a new access token.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RefreshError {
    #[error("no refresh token available")]
    NoRefreshToken,
    #[error("refresh rejected: {message}")]
    Rejected {
        status: Option<u16>,
        message: String,
    },
    #[error("refresh request failed: {0}")]
    Transport(#[from] TransportError),
    /// The session was signed out or replaced while the renewal was running.
    #[error("session changed during refresh")]
    SessionChanged,
}

#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    /// The access token was rejected and could not be recovered.
    #[error("AUTH_EXPIRED")]
    AuthExpired { message: String },
    /// Renewal failed; the session has been cleared.
    #[error("session expired: {0}")]
    RefreshFailed(#[from] RefreshError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// The chat stream carried an in-band error marker.
    #[error("{0}")]
    StreamProtocol(String),
    #[error("malformed response: {0}")]
    MalformedResponse(String),
    #[error("CONVERSATION_NOT_FOUND")]
    ConversationNotFound,
    #[error("{message}")]
    Status { status: StatusCode, message: String },
}

impl ApiError {
    /// Builds the error for a non-success response, reducing the body to text.
    pub fn from_status(status: StatusCode, body: &[u8]) -> Self {
        let message = parse_error_message(status, body);
        if status == StatusCode::UNAUTHORIZED {
            Self::AuthExpired { message }
        } else {
            Self::Status { status, message }
        }
    }

    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::AuthExpired { .. } => Some(StatusCode::UNAUTHORIZED),
            Self::ConversationNotFound => Some(StatusCode::NOT_FOUND),
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Self::AuthExpired { .. } | Self::RefreshFailed(_))
    }

    /// Text suited for showing to a person, without the variant prefix.
    pub fn user_message(&self) -> String {
        match self {
            Self::AuthExpired { .. } => AUTH_EXPIRED.to_string(),
            Self::ConversationNotFound => CONVERSATION_NOT_FOUND.to_string(),
            Self::RefreshFailed(_) => "Session expired, please log in again.".to_string(),
            other => other.to_string(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    error: Option<String>,
    message: Option<String>,
    msg: Option<String>,
}

/// Reduces an error body to the text the backend meant to show.
///
/// Prefers the JSON `error`, `message`, then `msg` field, then the raw body,
/// then `HTTP_<status>`.
pub fn parse_error_message(status: StatusCode, body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    let text = text.trim();
    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(text) {
        let field = [parsed.error, parsed.message, parsed.msg]
            .into_iter()
            .flatten()
            .map(|value| value.trim().to_string())
            .find(|value| !value.is_empty());
        if let Some(message) = field {
            return message;
        }
    }
    if text.is_empty() || text.starts_with('{') {
        format!("HTTP_{}", status.as_u16())
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefers_error_field_then_message_then_msg() {
        let body = br#"{"msg":"third","message":"second","error":"first"}"#;
        assert_eq!(parse_error_message(StatusCode::BAD_REQUEST, body), "first");
        let body = br#"{"msg":"third","message":"second"}"#;
        assert_eq!(parse_error_message(StatusCode::BAD_REQUEST, body), "second");
        let body = br#"{"msg":"Token has expired"}"#;
        assert_eq!(
            parse_error_message(StatusCode::UNAUTHORIZED, body),
            "Token has expired"
        );
    }

    #[test]
    fn falls_back_to_raw_body_and_status() {
        assert_eq!(
            parse_error_message(StatusCode::BAD_GATEWAY, b"upstream down"),
            "upstream down"
        );
        assert_eq!(
            parse_error_message(StatusCode::INTERNAL_SERVER_ERROR, b""),
            "HTTP_500"
        );
        assert_eq!(
            parse_error_message(StatusCode::INTERNAL_SERVER_ERROR, br#"{"ok":false}"#),
            "HTTP_500"
        );
    }

    #[test]
    fn unauthorized_maps_to_auth_expired_sentinel() {
        let err = ApiError::from_status(StatusCode::UNAUTHORIZED, b"");
        assert!(matches!(err, ApiError::AuthExpired { .. }));
        assert_eq!(err.to_string(), AUTH_EXPIRED);
        assert_eq!(err.status(), Some(StatusCode::UNAUTHORIZED));
    }
}
