use std::fmt;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use super::backend::{KeyringBackend, MemoryBackend, SecretBackend};

pub const DEVICE_ID_KEY: &str = "pairlink.deviceId";
pub const REFRESH_TOKEN_KEY: &str = "pairlink.refreshToken";
pub const API_URL_KEY: &str = "pairlink.apiUrl";

const ALL_KEYS: [&str; 3] = [DEVICE_ID_KEY, REFRESH_TOKEN_KEY, API_URL_KEY];

#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("Keychain error: {0}")]
    Keyring(#[from] keyring::Error),

    #[error("Secret storage error: {0}")]
    Backend(String),

    #[error("Failed to write {key}; stored credentials were cleared: {source}")]
    PartialWrite {
        key: &'static str,
        #[source]
        source: Box<CredentialError>,
    },

    #[error("Credential store lock poisoned")]
    Poisoned,
}

/// Device credentials issued by the server on a successful pairing.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts", ts(export))]
pub struct Credential {
    pub device_id: String,
    pub refresh_token: String,
    pub api_url: String,
}

impl Credential {
    pub fn new(
        device_id: impl Into<String>,
        refresh_token: impl Into<String>,
        api_url: impl Into<String>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            refresh_token: refresh_token.into(),
            api_url: api_url.into(),
        }
    }

    fn entries(&self) -> [(&'static str, &str); 3] {
        [
            (DEVICE_ID_KEY, self.device_id.as_str()),
            (REFRESH_TOKEN_KEY, self.refresh_token.as_str()),
            (API_URL_KEY, self.api_url.as_str()),
        ]
    }
}

// Keep the refresh token out of logs.
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("device_id", &self.device_id)
            .field("refresh_token", &"<redacted>")
            .field("api_url", &self.api_url)
            .finish()
    }
}

/// Partial update merged into a stored credential. `None` keeps the
/// stored value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CredentialUpdate {
    pub device_id: Option<String>,
    pub refresh_token: Option<String>,
    pub api_url: Option<String>,
}

impl CredentialUpdate {
    pub fn refresh_token(token: impl Into<String>) -> Self {
        Self {
            refresh_token: Some(token.into()),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.device_id.is_none() && self.refresh_token.is_none() && self.api_url.is_none()
    }

    pub fn apply(&self, credential: &Credential) -> Credential {
        Credential {
            device_id: self
                .device_id
                .clone()
                .unwrap_or_else(|| credential.device_id.clone()),
            refresh_token: self
                .refresh_token
                .clone()
                .unwrap_or_else(|| credential.refresh_token.clone()),
            api_url: self
                .api_url
                .clone()
                .unwrap_or_else(|| credential.api_url.clone()),
        }
    }
}

/// All-or-nothing storage of the credential triple.
///
/// Readers and writers are serialized through an `RwLock`, so a load never
/// observes a mix of old and new fields from a concurrent store or clear.
pub struct CredentialStore {
    backend: RwLock<Box<dyn SecretBackend>>,
}

impl CredentialStore {
    pub fn new(backend: impl SecretBackend + 'static) -> Self {
        Self {
            backend: RwLock::new(Box::new(backend)),
        }
    }

    /// Store backed by the OS keychain under the given service name
    pub fn keyring(service: &str) -> Self {
        Self::new(KeyringBackend::new(service))
    }

    pub fn in_memory() -> Self {
        Self::new(MemoryBackend::new())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Box<dyn SecretBackend>>, CredentialError> {
        self.backend.read().map_err(|_| CredentialError::Poisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Box<dyn SecretBackend>>, CredentialError> {
        self.backend.write().map_err(|_| CredentialError::Poisoned)
    }

    /// Replace the stored credential.
    ///
    /// If any key fails to write, all three keys are deleted and
    /// `PartialWrite` is returned.
    pub fn store(&self, credential: &Credential) -> Result<(), CredentialError> {
        let backend = self.write()?;
        write_all(&**backend, credential)?;
        debug!(device_id = %credential.device_id, "Stored device credentials");
        Ok(())
    }

    /// Load the stored credential.
    ///
    /// A partial set (some keys present, some not) is treated as no
    /// credential and the stray keys are deleted.
    pub fn load(&self) -> Result<Option<Credential>, CredentialError> {
        let state = {
            let backend = self.read()?;
            read_all(&**backend)?
        };

        match state {
            Stored::Complete(credential) => Ok(Some(credential)),
            Stored::Empty => Ok(None),
            Stored::Partial => {
                self.repair()?;
                Ok(None)
            }
        }
    }

    /// Merge a partial update into the stored credential.
    ///
    /// Returns the merged credential, or `None` if nothing is stored. On a
    /// failed write the previous credential is restored; if that also fails
    /// the store is cleared.
    pub fn merge(&self, update: &CredentialUpdate) -> Result<Option<Credential>, CredentialError> {
        let backend = self.write()?;
        let current = match read_all(&**backend)? {
            Stored::Complete(credential) => credential,
            Stored::Empty | Stored::Partial => return Ok(None),
        };
        if update.is_empty() {
            return Ok(Some(current));
        }

        let merged = update.apply(&current);
        for (key, value) in merged.entries() {
            let unchanged = current.entries().iter().any(|(k, v)| *k == key && *v == value);
            if unchanged {
                continue;
            }
            if let Err(e) = backend.set(key, value) {
                warn!(key, error = %e, "Failed to merge credential update, restoring previous value");
                write_all(&**backend, &current)?;
                return Err(e);
            }
        }
        debug!(device_id = %merged.device_id, "Merged credential update");
        Ok(Some(merged))
    }

    /// Delete all stored keys. Every key is attempted; the first error is
    /// returned.
    pub fn clear(&self) -> Result<(), CredentialError> {
        let backend = self.write()?;
        clear_all(&**backend)?;
        debug!("Cleared device credentials");
        Ok(())
    }

    /// Presence check used to recompute the auth state at startup
    pub fn has_credentials(&self) -> bool {
        matches!(self.load(), Ok(Some(_)))
    }

    fn repair(&self) -> Result<(), CredentialError> {
        let backend = self.write()?;
        // Re-check under the write lock: a concurrent store may have completed the set.
        if let Stored::Partial = read_all(&**backend)? {
            warn!("Found partially stored credentials, clearing");
            clear_all(&**backend)?;
        }
        Ok(())
    }
}

enum Stored {
    Complete(Credential),
    Empty,
    Partial,
}

fn read_all(backend: &dyn SecretBackend) -> Result<Stored, CredentialError> {
    let device_id = backend.get(DEVICE_ID_KEY)?;
    let refresh_token = backend.get(REFRESH_TOKEN_KEY)?;
    let api_url = backend.get(API_URL_KEY)?;

    Ok(match (device_id, refresh_token, api_url) {
        (Some(device_id), Some(refresh_token), Some(api_url)) => Stored::Complete(Credential {
            device_id,
            refresh_token,
            api_url,
        }),
        (None, None, None) => Stored::Empty,
        _ => Stored::Partial,
    })
}

fn write_all(backend: &dyn SecretBackend, credential: &Credential) -> Result<(), CredentialError> {
    for (key, value) in credential.entries() {
        if let Err(e) = backend.set(key, value) {
            warn!(key, error = %e, "Credential write failed, rolling back");
            if let Err(cleanup) = clear_all(backend) {
                warn!(error = %cleanup, "Rollback after failed credential write also failed");
            }
            return Err(CredentialError::PartialWrite {
                key,
                source: Box::new(e),
            });
        }
    }
    Ok(())
}

fn clear_all(backend: &dyn SecretBackend) -> Result<(), CredentialError> {
    let mut first_error = None;
    for key in ALL_KEYS {
        if let Err(e) = backend.delete(key) {
            warn!(key, error = %e, "Failed to delete credential key");
            first_error.get_or_insert(e);
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
