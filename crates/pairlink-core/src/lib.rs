//! Core library for pairlink.
//!
//! Pairs a device with a web application by scanning a QR code that carries
//! a short-lived pairing ticket, trades that ticket for long-lived device
//! credentials, and keeps those credentials in the OS keychain for later
//! authenticated requests.
//!
//! - [`ticket`]: QR payload parsing and expiry validation
//! - [`api`]: pairing exchange, verify, and the authenticated request gateway
//! - [`auth`]: credential persistence
//! - [`pairing`]: the state machine the presentation layer renders
//! - [`config`]: on-disk configuration

pub mod api;
pub mod auth;
pub mod config;
pub mod pairing;
pub mod ticket;

pub use api::{ApiError, AuthedClient, DeviceGrant, Gateway, PairingClient, VerifyOutcome};
pub use auth::{Credential, CredentialError, CredentialStore, CredentialUpdate};
pub use config::Config;
pub use pairing::{AuthState, FailureReason, PairingMachine, ScanOutcome};
pub use ticket::{PairingTicket, TicketError};
