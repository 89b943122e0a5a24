//! Pairing exchange client and response decoding shared with the gateway.

use std::time::Duration;

use reqwest::{header, Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::auth::Credential;
use crate::ticket::PairingTicket;

use super::ApiError;

// ============================================================================
// Constants
// ============================================================================

/// Fixed verify path, appended to the stored `apiUrl`.
pub const VERIFY_PATH: &str = "/api/mobile/verify";

/// HTTP request timeout in seconds.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

const EXCHANGE_FAILURE: &str = "Authentication failed";
pub(crate) const VERIFY_FAILURE: &str = "Token verification failed";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ExchangeRequest<'a> {
    pairing_code: &'a str,
    device_session_id: &'a str,
    device_name: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GrantResponse {
    device_id: Option<String>,
    refresh_token: Option<String>,
    #[serde(flatten)]
    details: Map<String, Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VerifyResponse {
    refresh_token: Option<String>,
    #[serde(flatten)]
    details: Map<String, Value>,
}

/// Credentials granted by a successful exchange, plus any extra fields the
/// server returned alongside them.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceGrant {
    pub credential: Credential,
    pub details: Map<String, Value>,
}

impl DeviceGrant {
    /// Validate a decoded exchange body against the grant schema.
    pub fn from_body(body: Value, api_url: &str) -> Result<Self, ApiError> {
        if !body.is_object() {
            return Err(ApiError::IncompleteCredential(
                "response body is not a JSON object".to_string(),
            ));
        }
        let grant: GrantResponse = serde_json::from_value(body)
            .map_err(|e| ApiError::IncompleteCredential(format!("unexpected field type: {}", e)))?;

        let device_id = grant.device_id.filter(|s| !s.is_empty());
        let refresh_token = grant.refresh_token.filter(|s| !s.is_empty());
        match (device_id, refresh_token) {
            (Some(device_id), Some(refresh_token)) => Ok(Self {
                credential: Credential {
                    device_id,
                    refresh_token,
                    api_url: api_url.to_string(),
                },
                details: grant.details,
            }),
            (device_id, refresh_token) => {
                let mut missing = Vec::new();
                if device_id.is_none() {
                    missing.push("deviceId");
                }
                if refresh_token.is_none() {
                    missing.push("refreshToken");
                }
                Err(ApiError::IncompleteCredential(format!(
                    "missing {}",
                    missing.join(" and ")
                )))
            }
        }
    }
}

/// Result of a successful verify call.
#[derive(Debug, Clone, PartialEq)]
pub struct VerifyOutcome {
    /// Stored credential after merging any rotated token.
    pub credential: Credential,
    /// Whether the server issued a new refresh token.
    pub rotated: bool,
    pub details: Map<String, Value>,
}

/// Rotated refresh token (if any) and extra fields from a verify body.
/// Non-object bodies carry neither.
pub(crate) fn parse_verify_body(body: Value) -> (Option<String>, Map<String, Value>) {
    if !body.is_object() {
        return (None, Map::new());
    }
    let parsed: VerifyResponse = match serde_json::from_value(body) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!(error = %e, "Ignoring verify response with unexpected field types");
            VerifyResponse::default()
        }
    };
    (
        parsed.refresh_token.filter(|token| !token.is_empty()),
        parsed.details,
    )
}

/// Decode a response body, then apply status-based rejection.
///
/// The body is read as text and parsed as JSON first; a parse failure wins
/// over any status-based error.
pub(crate) fn interpret(status: StatusCode, text: &str, failure: &str) -> Result<Value, ApiError> {
    let body: Value = match serde_json::from_str(text) {
        Ok(body) => body,
        Err(e) => {
            warn!(
                status = status.as_u16(),
                error = %e,
                preview = %ApiError::truncate_body(text),
                "Failed to parse JSON response"
            );
            return Err(ApiError::invalid_body(status, text));
        }
    };

    if !status.is_success() {
        return Err(ApiError::from_status(status, &body, failure));
    }
    Ok(body)
}

pub(crate) async fn decode_response(response: Response, failure: &str) -> Result<Value, ApiError> {
    let status = response.status();
    let text = response.text().await?;
    debug!(status = status.as_u16(), bytes = text.len(), "Response received");
    interpret(status, &text, failure)
}

/// Client for the one-shot pairing exchange.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct PairingClient {
    client: Client,
}

impl PairingClient {
    pub fn new() -> Result<Self, ApiError> {
        Self::with_timeout(Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS))
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, ApiError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    /// Exchange a pairing ticket for device credentials.
    ///
    /// Sends exactly one POST to `{apiUrl}{endpoint}`; there are no retries.
    /// The caller decides whether and where to persist the grant.
    pub async fn exchange(
        &self,
        ticket: &PairingTicket,
        device_name: &str,
    ) -> Result<DeviceGrant, ApiError> {
        let url = ticket.exchange_url();
        info!(url = %url, device_name, "Exchanging pairing ticket");

        let body = ExchangeRequest {
            pairing_code: &ticket.pairing_code,
            device_session_id: &ticket.device_session_id,
            device_name,
        };

        let response = self
            .client
            .post(&url)
            .header(header::ACCEPT, "application/json")
            .json(&body)
            .send()
            .await?;

        let body = decode_response(response, EXCHANGE_FAILURE).await?;
        let grant = DeviceGrant::from_body(body, &ticket.api_url)?;
        info!(device_id = %grant.credential.device_id, "Pairing exchange succeeded");
        Ok(grant)
    }
}
