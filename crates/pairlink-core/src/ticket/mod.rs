//! Pairing ticket parsing and validation.
//!
//! A pairing ticket is the JSON payload encoded in the QR code shown by the
//! web application. [`parse`] is a purely structural check that is safe to
//! run on arbitrary scanned text; expiry is checked separately with
//! [`PairingTicket::validate`] so parsing never depends on the clock.

pub mod parser;

pub use parser::{parse, PairingTicket, TicketError};
