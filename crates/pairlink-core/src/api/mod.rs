//! HTTP side of the pairing protocol.
//!
//! This module provides:
//! - `PairingClient`: the one-shot exchange of a pairing ticket for device credentials
//! - `Gateway`: a lazily built client bound to the stored credentials, which
//!   logs the device out when the server answers 401, and the verify call
//!
//! Response bodies are always read as text and decoded as JSON before the
//! status is considered, so an undecodable body is reported as such even on
//! error statuses.

pub mod client;
pub mod error;
pub mod gateway;

pub use client::{DeviceGrant, PairingClient, VerifyOutcome, VERIFY_PATH};
pub use error::ApiError;
pub use gateway::{AuthedClient, Gateway, DEVICE_ID_HEADER};
