use chrono::{DateTime, Utc};
use reqwest::{Method, Response};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use crate::api::{ApiError, Gateway, PairingClient};
use crate::auth::Credential;
use crate::ticket::{self, TicketError};

// ============================================================================
// States
// ============================================================================

/// Pairing state rendered by the presentation layer.
///
/// Not persisted: recomputed at startup from the credential store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthState {
    Idle,
    Scanning,
    ValidatingTicket,
    Authenticating,
    Authenticated(Credential),
    Failed(FailureReason),
}

impl AuthState {
    pub fn label(&self) -> &'static str {
        match self {
            AuthState::Idle => "idle",
            AuthState::Scanning => "scanning",
            AuthState::ValidatingTicket => "validating",
            AuthState::Authenticating => "authenticating",
            AuthState::Authenticated(_) => "authenticated",
            AuthState::Failed(_) => "failed",
        }
    }
}

/// Why a pairing or verify attempt ended in `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "camelCase")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts", ts(export))]
pub enum FailureReason {
    Expired,
    Rejected(String),
    /// Carries the truncated raw response body.
    InvalidResponseBody(String),
    IncompleteCredential(String),
    NetworkFailure(String),
    VerifyFailed(String),
    NotAuthenticated,
    Storage(String),
    /// The stored credential cannot be sent as request headers.
    InvalidCredential(String),
}

impl FailureReason {
    /// Human-readable message for the failure screen
    pub fn message(&self) -> String {
        match self {
            FailureReason::Expired => {
                "This QR code has expired. Please request a new one from the web application."
                    .to_string()
            }
            FailureReason::Rejected(message) => message.clone(),
            FailureReason::InvalidResponseBody(preview) => {
                format!("Server returned invalid JSON. Response: {}", preview)
            }
            FailureReason::IncompleteCredential(detail) => {
                format!("Failed to authenticate device: {}. Please try again.", detail)
            }
            FailureReason::NetworkFailure(detail) => {
                format!("Unable to reach the server: {}", detail)
            }
            FailureReason::VerifyFailed(detail) => format!(
                "Token verification failed. Your token may have expired. ({})",
                detail
            ),
            FailureReason::NotAuthenticated => {
                "This device is not paired. Please scan a pairing code.".to_string()
            }
            FailureReason::Storage(detail) => {
                format!("Could not save device credentials: {}", detail)
            }
            FailureReason::InvalidCredential(detail) => format!(
                "Stored device credentials are unusable: {}. Please pair this device again.",
                detail
            ),
        }
    }
}

impl From<&ApiError> for FailureReason {
    fn from(err: &ApiError) -> Self {
        match err {
            ApiError::InvalidResponseBody { preview, .. } => {
                FailureReason::InvalidResponseBody(preview.clone())
            }
            ApiError::Rejected(message) => FailureReason::Rejected(message.clone()),
            ApiError::IncompleteCredential(detail) => {
                FailureReason::IncompleteCredential(detail.clone())
            }
            ApiError::NetworkFailure(e) => FailureReason::NetworkFailure(e.to_string()),
            ApiError::Unauthorized | ApiError::NotAuthenticated => FailureReason::NotAuthenticated,
            ApiError::Storage(e) => FailureReason::Storage(e.to_string()),
            ApiError::InvalidHeader(e) => FailureReason::InvalidCredential(e.to_string()),
        }
    }
}

/// What became of one scanned payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    /// Not scanning, or a payload is already being handled.
    Ignored,
    /// Structurally invalid payload; the scanner stays open.
    Warning(TicketError),
    /// The scan ran to a terminal state (`Authenticated` or `Failed`).
    Finished(AuthState),
}

// ============================================================================
// Machine
// ============================================================================

/// Orchestrates scan → validate → exchange → persist → ready.
///
/// All transitions go through `&mut self`, so at most one exchange or
/// verify call is in flight at a time.
pub struct PairingMachine {
    state: AuthState,
    client: PairingClient,
    gateway: Gateway,
    device_name: String,
    /// Set once a payload is accepted for validation; cleared when the
    /// scanner is (re)opened.
    scanned: bool,
    /// Extra fields returned by the server with the last exchange or verify.
    details: Map<String, Value>,
}

impl PairingMachine {
    /// Create a machine whose initial state reflects the credential store:
    /// `Authenticated` if a complete credential is stored, `Idle` otherwise.
    pub fn new(client: PairingClient, gateway: Gateway, device_name: impl Into<String>) -> Self {
        let state = match gateway.store().load() {
            Ok(Some(credential)) => AuthState::Authenticated(credential),
            Ok(None) => AuthState::Idle,
            Err(e) => {
                warn!(error = %e, "Failed to read stored credentials, starting unpaired");
                AuthState::Idle
            }
        };
        debug!(state = state.label(), "Pairing machine created");

        Self {
            state,
            client,
            gateway,
            device_name: device_name.into(),
            scanned: false,
            details: Map::new(),
        }
    }

    pub fn state(&self) -> &AuthState {
        &self.state
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self.state, AuthState::Authenticated(_))
    }

    pub fn details(&self) -> &Map<String, Value> {
        &self.details
    }

    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    fn transition(&mut self, next: AuthState) {
        debug!(from = self.state.label(), to = next.label(), "Pairing state transition");
        self.state = next;
    }

    fn fail(&mut self, reason: FailureReason) {
        warn!(reason = %reason.message(), "Pairing failed");
        self.transition(AuthState::Failed(reason));
    }

    fn open_scanner(&mut self) {
        self.scanned = false;
        self.transition(AuthState::Scanning);
    }

    /// Idle → Scanning.
    pub fn start(&mut self) -> bool {
        if self.state != AuthState::Idle {
            return false;
        }
        self.open_scanner();
        true
    }

    /// Scanning → Idle. Only the scanner can be cancelled.
    pub fn cancel(&mut self) -> bool {
        if self.state != AuthState::Scanning {
            return false;
        }
        self.transition(AuthState::Idle);
        true
    }

    /// Failed → Scanning, for a new scan.
    pub fn retry(&mut self) -> bool {
        if !matches!(self.state, AuthState::Failed(_)) {
            return false;
        }
        self.open_scanner();
        true
    }

    /// Back to the entry screen.
    ///
    /// Allowed from `Failed` and `Authenticated`, and from `Authenticating`
    /// when an exchange or verify future was dropped before completing.
    /// Stored credentials are kept; use [`PairingMachine::logout`] to remove them.
    pub fn reset(&mut self) -> bool {
        match self.state {
            AuthState::Failed(_) | AuthState::Authenticated(_) | AuthState::Authenticating => {
                self.details.clear();
                self.transition(AuthState::Idle);
                true
            }
            _ => false,
        }
    }

    /// Handle a payload from the scanner.
    pub async fn scanned(&mut self, raw: &str) -> ScanOutcome {
        self.scanned_at(raw, Utc::now()).await
    }

    /// Handle a payload from the scanner, checking expiry against `now`.
    pub async fn scanned_at(&mut self, raw: &str, now: DateTime<Utc>) -> ScanOutcome {
        if self.state != AuthState::Scanning || self.scanned {
            debug!(state = self.state.label(), "Ignoring scan");
            return ScanOutcome::Ignored;
        }
        self.scanned = true;
        self.transition(AuthState::ValidatingTicket);

        let ticket = match ticket::parse(raw) {
            Ok(ticket) => ticket,
            Err(e) => {
                warn!(error = %e, "Rejected scanned payload, scanner stays open");
                self.open_scanner();
                return ScanOutcome::Warning(e);
            }
        };

        let ticket = match ticket.validate_at(now) {
            Ok(ticket) => ticket,
            Err(e) => {
                info!(error = %e, "Pairing ticket expired");
                self.fail(FailureReason::Expired);
                return ScanOutcome::Finished(self.state.clone());
            }
        };

        self.transition(AuthState::Authenticating);
        match self.client.exchange(&ticket, &self.device_name).await {
            Ok(grant) => match self.gateway.store().store(&grant.credential) {
                Ok(()) => {
                    self.gateway.reset_client();
                    self.details = grant.details;
                    info!(device_id = %grant.credential.device_id, "Device paired");
                    self.transition(AuthState::Authenticated(grant.credential));
                }
                Err(e) => {
                    error!(error = %e, "Failed to persist device credentials");
                    self.gateway.reset_client();
                    self.fail(FailureReason::Storage(e.to_string()));
                }
            },
            Err(e) => self.fail(FailureReason::from(&e)),
        }

        ScanOutcome::Finished(self.state.clone())
    }

    /// Authenticated → Authenticating → Authenticated | Failed(VerifyFailed).
    ///
    /// A failed verify leaves stored credentials alone, except that a 401
    /// goes through the gateway's forced logout like any other request.
    pub async fn verify(&mut self) -> &AuthState {
        if !self.is_authenticated() {
            debug!(state = self.state.label(), "Ignoring verify");
            return &self.state;
        }
        self.transition(AuthState::Authenticating);

        match self.gateway.verify().await {
            Ok(outcome) => {
                self.details.extend(outcome.details);
                if outcome.rotated {
                    info!("Stored refresh token updated");
                }
                self.transition(AuthState::Authenticated(outcome.credential));
            }
            Err(e) => {
                if e.is_unauthorized() {
                    warn!("Verify rejected with 401, device was logged out");
                }
                self.fail(FailureReason::VerifyFailed(e.to_string()));
            }
        }
        &self.state
    }

    /// Send an authenticated request through the gateway.
    ///
    /// A 401 has already cleared the store by the time it reaches here; the
    /// machine follows it back to `Idle`.
    pub async fn send(
        &mut self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Response, ApiError> {
        let result = self.gateway.send(method, path, body).await;
        if matches!(result, Err(ApiError::Unauthorized)) {
            info!("Device was logged out by the server");
            self.details.clear();
            self.transition(AuthState::Idle);
        }
        result
    }

    /// Clear stored credentials and return to `Idle`.
    pub fn logout(&mut self) -> Result<(), ApiError> {
        let result = self.gateway.logout();
        self.details.clear();
        self.transition(AuthState::Idle);
        result
    }
}
