//! Authenticated request gateway.
//!
//! The gateway owns the HTTP client bound to the stored credentials. It is
//! built lazily from the credential store and cached until reset. Every
//! response passes through [`Gateway::intercept`]: a 401 clears the stored
//! credentials and the cached client before the error is handed back to the
//! caller. The verify call goes through the same path.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::auth::{Credential, CredentialStore, CredentialUpdate};

use super::client::{decode_response, parse_verify_body, VERIFY_FAILURE};
use super::{ApiError, VerifyOutcome, VERIFY_PATH};

pub const DEVICE_ID_HEADER: &str = "x-device-id";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VerifyRequest<'a> {
    refresh_token: &'a str,
    device_id: &'a str,
}

/// HTTP client carrying a snapshot of the stored credentials.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct AuthedClient {
    client: Client,
    credential: Credential,
    headers: HeaderMap,
}

impl AuthedClient {
    fn build(credential: Credential, timeout: Duration) -> Result<Self, ApiError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        headers.insert(header::ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(
            HeaderName::from_static(DEVICE_ID_HEADER),
            HeaderValue::from_str(&credential.device_id)?,
        );
        let mut bearer = HeaderValue::from_str(&format!("Bearer {}", credential.refresh_token))?;
        bearer.set_sensitive(true);
        headers.insert(header::AUTHORIZATION, bearer);

        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers.clone())
            .build()?;

        Ok(Self {
            client,
            credential,
            headers,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.credential.api_url
    }

    pub fn device_id(&self) -> &str {
        &self.credential.device_id
    }

    /// Headers attached to every request made through this client
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.credential.api_url, path)
    }

    pub fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client.request(method, self.url(path))
    }
}

/// Gives out the authenticated client and enforces the forced-logout rule.
pub struct Gateway {
    store: Arc<CredentialStore>,
    timeout: Duration,
    cached: Mutex<Option<AuthedClient>>,
}

impl Gateway {
    pub fn new(store: Arc<CredentialStore>) -> Self {
        Self::with_timeout(
            store,
            Duration::from_secs(super::client::DEFAULT_REQUEST_TIMEOUT_SECS),
        )
    }

    pub fn with_timeout(store: Arc<CredentialStore>, timeout: Duration) -> Self {
        Self {
            store,
            timeout,
            cached: Mutex::new(None),
        }
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    fn cache(&self) -> MutexGuard<'_, Option<AuthedClient>> {
        // The cache holds no invariants a panic could break.
        self.cached.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Return the cached client, building it from the stored credentials on
    /// first use.
    pub fn get_client(&self) -> Result<AuthedClient, ApiError> {
        let mut cached = self.cache();
        if let Some(client) = cached.as_ref() {
            return Ok(client.clone());
        }

        let credential = self.store.load()?.ok_or(ApiError::NotAuthenticated)?;
        debug!(device_id = %credential.device_id, api_url = %credential.api_url, "Building authenticated client");
        let client = AuthedClient::build(credential, self.timeout)?;
        *cached = Some(client.clone());
        Ok(client)
    }

    /// Drop the cached client. Must follow any credential write or clear.
    pub fn reset_client(&self) {
        if self.cache().take().is_some() {
            debug!("Authenticated client reset");
        }
    }

    /// Clear stored credentials and the cached client.
    pub fn logout(&self) -> Result<(), ApiError> {
        let cleared = self.store.clear();
        self.reset_client();
        cleared?;
        info!("Device logged out");
        Ok(())
    }

    /// Apply the forced-logout rule to a response.
    pub fn intercept(&self, response: Response) -> Result<Response, ApiError> {
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        warn!(url = %response.url(), "Server rejected device credentials, logging out");
        if let Err(e) = self.logout() {
            error!(error = %e, "Failed to clear credentials after 401");
        }
        Err(ApiError::Unauthorized)
    }

    /// Send an authenticated request to `{apiUrl}{path}`.
    pub async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Response, ApiError> {
        let client = self.get_client()?;
        debug!(%method, url = %client.url(path), "Sending authenticated request");

        let mut request = client.request(method, path);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await?;
        self.intercept(response)
    }

    /// Confirm the stored credential with the server.
    ///
    /// POSTs `{refreshToken, deviceId}` to [`VERIFY_PATH`] under the stored
    /// `apiUrl`. A rotated refresh token is merged into the stored
    /// credential and the cached client is rebuilt on next use.
    pub async fn verify(&self) -> Result<VerifyOutcome, ApiError> {
        let client = self.get_client()?;
        info!(url = %client.url(VERIFY_PATH), "Verifying device credentials");

        let body = VerifyRequest {
            refresh_token: &client.credential.refresh_token,
            device_id: &client.credential.device_id,
        };
        let response = client
            .request(Method::POST, VERIFY_PATH)
            .json(&body)
            .send()
            .await?;
        let response = self.intercept(response)?;

        let body = decode_response(response, VERIFY_FAILURE).await?;
        let (refresh_token, details) = parse_verify_body(body);

        let outcome = match refresh_token {
            Some(token) => {
                let merged = self
                    .store
                    .merge(&CredentialUpdate::refresh_token(token))?
                    .ok_or(ApiError::NotAuthenticated)?;
                self.reset_client();
                info!(device_id = %merged.device_id, "Refresh token rotated");
                VerifyOutcome {
                    credential: merged,
                    rotated: true,
                    details,
                }
            }
            None => VerifyOutcome {
                credential: client.credential,
                rotated: false,
                details,
            },
        };
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gateway_with(credential: Option<Credential>) -> Gateway {
        let store = Arc::new(CredentialStore::in_memory());
        if let Some(credential) = credential {
            store.store(&credential).unwrap();
        }
        Gateway::new(store)
    }

    #[test]
    fn test_get_client_without_credentials() {
        let gateway = gateway_with(None);
        assert!(matches!(gateway.get_client(), Err(ApiError::NotAuthenticated)));
    }

    #[test]
    fn test_client_headers() {
        let gateway = gateway_with(Some(Credential::new("dev-1", "rt-1", "https://x.test")));
        let client = gateway.get_client().unwrap();

        assert_eq!(client.base_url(), "https://x.test");
        assert_eq!(client.device_id(), "dev-1");
        assert_eq!(client.url("/api/orders"), "https://x.test/api/orders");

        let headers = client.headers();
        assert_eq!(headers[DEVICE_ID_HEADER], "dev-1");
        assert_eq!(headers[header::AUTHORIZATION], "Bearer rt-1");
        assert_eq!(headers[header::CONTENT_TYPE], "application/json");
        assert!(headers[header::AUTHORIZATION].is_sensitive());
    }

    #[test]
    fn test_client_is_cached_until_reset() {
        let gateway = gateway_with(Some(Credential::new("dev-1", "rt-1", "https://x.test")));
        gateway.get_client().unwrap();

        gateway
            .store()
            .store(&Credential::new("dev-2", "rt-2", "https://x.test"))
            .unwrap();
        assert_eq!(gateway.get_client().unwrap().device_id(), "dev-1");

        gateway.reset_client();
        assert_eq!(gateway.get_client().unwrap().device_id(), "dev-2");
    }

    #[test]
    fn test_logout_clears_store_and_client() {
        let gateway = gateway_with(Some(Credential::new("dev-1", "rt-1", "https://x.test")));
        gateway.get_client().unwrap();

        gateway.logout().unwrap();
        assert!(!gateway.store().has_credentials());
        assert!(matches!(gateway.get_client(), Err(ApiError::NotAuthenticated)));
    }

    #[test]
    fn test_invalid_header_value() {
        let gateway = gateway_with(Some(Credential::new("dev\n1", "rt-1", "https://x.test")));
        assert!(matches!(gateway.get_client(), Err(ApiError::InvalidHeader(_))));
    }
}
