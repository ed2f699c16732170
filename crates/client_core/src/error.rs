use reqwest::StatusCode;
use serde_json::Value;
use thiserror::Error;

/// Failure taxonomy for requests routed through the gateway.
///
/// The gateway recovers exactly one class of failure on its own (an expired
/// access token, via a single refresh-and-retry cycle); everything else
/// surfaces here.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// No usable refresh token, or the refresh itself was rejected. The
    /// stored credential pair has been cleared and the user must
    /// re-authenticate.
    #[error("session invalid: re-authentication required")]
    SessionInvalid,

    /// The backend answered with a non-2xx status after any credential
    /// recovery already ran. Carries the parsed response body.
    #[error("request failed with status {status}")]
    RequestFailed { status: StatusCode, body: Value },

    /// Network-level failure before a status was obtained.
    #[error("transport failure: {0}")]
    Transport(#[from] reqwest::Error),
}

impl GatewayError {
    /// Backend-provided detail string, when the failure carried one.
    pub fn detail(&self) -> Option<&str> {
        match self {
            GatewayError::RequestFailed { body, .. } => shared::error::detail_from_body(body),
            _ => None,
        }
    }

    pub fn status(&self) -> Option<StatusCode> {
        match self {
            GatewayError::RequestFailed { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exposes_backend_detail_for_request_failures() {
        let err = GatewayError::RequestFailed {
            status: StatusCode::NOT_FOUND,
            body: serde_json::json!({"detail": "Chat not found"}),
        };
        assert_eq!(err.detail(), Some("Chat not found"));
        assert_eq!(err.status(), Some(StatusCode::NOT_FOUND));
    }

    #[test]
    fn session_invalid_has_no_detail() {
        assert_eq!(GatewayError::SessionInvalid.detail(), None);
        assert_eq!(GatewayError::SessionInvalid.status(), None);
    }
}
