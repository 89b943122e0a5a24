//! Credential persistence for paired devices.
//!
//! This module provides:
//! - `Credential`: the `{deviceId, refreshToken, apiUrl}` triple issued by the server
//! - `CredentialStore`: all-or-nothing storage of that triple
//! - `SecretBackend`: the key-value secret storage underneath, backed by the
//!   OS keychain via keyring or by memory
//!
//! The triple lives under three namespaced keys. Writes roll back on failure
//! and partial sets found on read are cleared, so callers only ever see a
//! complete credential or none.

pub mod backend;
pub mod credentials;

pub use backend::{KeyringBackend, MemoryBackend, SecretBackend};
pub use credentials::{
    Credential, CredentialError, CredentialStore, CredentialUpdate, API_URL_KEY, DEVICE_ID_KEY,
    REFRESH_TOKEN_KEY,
};
