use reqwest::StatusCode;
use serde_json::Value;
use thiserror::Error;

use crate::auth::CredentialError;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Server returned invalid JSON (status {status}). Response: {preview}")]
    InvalidResponseBody { status: u16, preview: String },

    #[error("{0}")]
    Rejected(String),

    #[error("Server response did not include device credentials: {0}")]
    IncompleteCredential(String),

    #[error("Network error: {0}")]
    NetworkFailure(#[from] reqwest::Error),

    #[error("Unauthorized - device credentials were revoked")]
    Unauthorized,

    #[error("Not authenticated")]
    NotAuthenticated,

    #[error("Credential storage error: {0}")]
    Storage(#[from] CredentialError),

    #[error("Stored credentials cannot be sent as a header: {0}")]
    InvalidHeader(#[from] reqwest::header::InvalidHeaderValue),
}

/// Maximum number of characters of a response body kept for diagnostics
const MAX_ERROR_BODY_LENGTH: usize = 100;

impl ApiError {
    /// Truncate a response body to avoid logging excessive data
    pub fn truncate_body(body: &str) -> String {
        match body.char_indices().nth(MAX_ERROR_BODY_LENGTH) {
            None => body.to_string(),
            Some((cut, _)) => format!(
                "{}... (truncated, {} total bytes)",
                &body[..cut],
                body.len()
            ),
        }
    }

    pub fn invalid_body(status: StatusCode, body: &str) -> Self {
        ApiError::InvalidResponseBody {
            status: status.as_u16(),
            preview: Self::truncate_body(body),
        }
    }

    /// Build a rejection from a decoded error body, preferring its `error`
    /// field, then `message`, then a generic status line.
    pub fn from_status(status: StatusCode, body: &Value, failure: &str) -> Self {
        let message = ["error", "message"]
            .iter()
            .find_map(|key| {
                body.get(*key)
                    .and_then(Value::as_str)
                    .filter(|message| !message.is_empty())
            })
            .map(str::to_string)
            .unwrap_or_else(|| format!("{} with status: {}", failure, status.as_u16()));
        ApiError::Rejected(message)
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ApiError::Unauthorized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_truncate_short_body() {
        assert_eq!(ApiError::truncate_body("not json"), "not json");
        assert_eq!(ApiError::truncate_body(""), "");
    }

    #[test]
    fn test_truncate_long_body() {
        let body = "x".repeat(250);
        let truncated = ApiError::truncate_body(&body);
        assert!(truncated.starts_with(&"x".repeat(100)));
        assert!(!truncated.starts_with(&"x".repeat(101)));
        assert!(truncated.ends_with("(truncated, 250 total bytes)"));
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let body = "é".repeat(150);
        let truncated = ApiError::truncate_body(&body);
        assert!(truncated.starts_with(&"é".repeat(100)));
        assert!(truncated.ends_with("(truncated, 300 total bytes)"));
    }

    #[test]
    fn test_from_status_prefers_error_field() {
        let body = json!({"error": "code used", "message": "ignored"});
        let err = ApiError::from_status(StatusCode::BAD_REQUEST, &body, "Authentication failed");
        assert!(matches!(err, ApiError::Rejected(ref m) if m == "code used"));
    }

    #[test]
    fn test_from_status_falls_back_to_message() {
        let body = json!({"message": "session closed"});
        let err = ApiError::from_status(StatusCode::GONE, &body, "Authentication failed");
        assert!(matches!(err, ApiError::Rejected(ref m) if m == "session closed"));
    }

    #[test]
    fn test_from_status_skips_empty_error() {
        let body = json!({"error": "", "message": "try again"});
        let err = ApiError::from_status(StatusCode::BAD_REQUEST, &body, "Authentication failed");
        assert!(matches!(err, ApiError::Rejected(ref m) if m == "try again"));
    }

    #[test]
    fn test_from_status_generic_message() {
        for body in [json!({}), json!([1, 2]), json!({"error": {"code": 7}}), json!({"error": ""})] {
            let err = ApiError::from_status(
                StatusCode::INTERNAL_SERVER_ERROR,
                &body,
                "Authentication failed",
            );
            assert_eq!(err.to_string(), "Authentication failed with status: 500");
        }
    }
}
