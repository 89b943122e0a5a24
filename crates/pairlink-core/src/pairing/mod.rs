//! Pairing state machine.
//!
//! Drives a scan from raw QR text to stored credentials:
//!
//! ```text
//! Idle → Scanning → ValidatingTicket → Authenticating → Authenticated | Failed
//! ```
//!
//! Malformed payloads loop back to `Scanning` with a warning; an expired
//! ticket or a failed exchange ends in `Failed`. From `Authenticated` the
//! machine can re-verify the stored credential.

pub mod machine;

pub use machine::{AuthState, FailureReason, PairingMachine, ScanOutcome};
