use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::{Map, Value};
use thiserror::Error;

/// Payload keys of the required ticket fields, in payload order.
const PAIRING_CODE: &str = "pairingCode";
const DEVICE_SESSION_ID: &str = "deviceSessionId";
const API_URL: &str = "apiUrl";
const ENDPOINT: &str = "endpoint";

/// Payload key of the optional expiry timestamp.
const EXPIRES_AT: &str = "expiresAt";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TicketError {
    #[error("Invalid QR code. Please scan a valid pairing code. ({0})")]
    MalformedPayload(String),

    #[error("Invalid QR code format. Missing required fields: {}", .0.join(", "))]
    MissingFields(Vec<&'static str>),

    #[error("This QR code has expired. Please request a new one from the web application.")]
    Expired { expires_at: DateTime<Utc> },
}

impl TicketError {
    /// Structural errors leave the scanner open; expiry ends the scan.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, TicketError::Expired { .. })
    }
}

/// A pairing request decoded from a QR code. Ephemeral: consumed by at most
/// one exchange and never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingTicket {
    pub pairing_code: String,
    pub device_session_id: String,
    /// Origin of the web application, without trailing slash.
    pub api_url: String,
    /// Path appended to `api_url` for the exchange request.
    pub endpoint: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl PairingTicket {
    /// Exchange target: `api_url` and `endpoint` concatenated verbatim.
    pub fn exchange_url(&self) -> String {
        format!("{}{}", self.api_url, self.endpoint)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(expires_at) if now > expires_at)
    }

    /// Check the ticket against the wall clock.
    pub fn validate(self) -> Result<Self, TicketError> {
        self.validate_at(Utc::now())
    }

    pub fn validate_at(self, now: DateTime<Utc>) -> Result<Self, TicketError> {
        match self.expires_at {
            Some(expires_at) if now > expires_at => Err(TicketError::Expired { expires_at }),
            _ => Ok(self),
        }
    }
}

enum Field {
    Present(String),
    Missing,
    Mistyped,
}

fn required_field(fields: &Map<String, Value>, name: &str) -> Field {
    match fields.get(name) {
        None | Some(Value::Null) => Field::Missing,
        Some(Value::String(s)) if s.is_empty() => Field::Missing,
        Some(Value::String(s)) => Field::Present(s.clone()),
        Some(_) => Field::Mistyped,
    }
}

/// Parse raw scanned text into a pairing ticket.
///
/// Never panics, whatever the input. Absent, `null` or empty required fields
/// yield [`TicketError::MissingFields`], which takes precedence over
/// [`TicketError::MalformedPayload`] for non-JSON input, non-object payloads
/// and fields of the wrong JSON type. Unknown fields are ignored.
pub fn parse(raw: &str) -> Result<PairingTicket, TicketError> {
    let value: Value = serde_json::from_str(raw)
        .map_err(|e| TicketError::MalformedPayload(format!("not valid JSON: {}", e)))?;

    let Value::Object(fields) = value else {
        return Err(TicketError::MalformedPayload(
            "payload is not a JSON object".to_string(),
        ));
    };

    let checked = [
        (PAIRING_CODE, required_field(&fields, PAIRING_CODE)),
        (DEVICE_SESSION_ID, required_field(&fields, DEVICE_SESSION_ID)),
        (API_URL, required_field(&fields, API_URL)),
        (ENDPOINT, required_field(&fields, ENDPOINT)),
    ];

    let missing: Vec<&'static str> = checked
        .iter()
        .filter(|(_, field)| matches!(field, Field::Missing))
        .map(|(name, _)| *name)
        .collect();
    if !missing.is_empty() {
        return Err(TicketError::MissingFields(missing));
    }

    let mistyped: Vec<&'static str> = checked
        .iter()
        .filter(|(_, field)| matches!(field, Field::Mistyped))
        .map(|(name, _)| *name)
        .collect();
    if !mistyped.is_empty() {
        return Err(TicketError::MalformedPayload(format!(
            "expected string for {}",
            mistyped.join(", ")
        )));
    }

    let expires_at = match fields.get(EXPIRES_AT) {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(parse_timestamp(s).ok_or_else(|| {
            TicketError::MalformedPayload(format!("unrecognized {} timestamp", EXPIRES_AT))
        })?),
        Some(_) => {
            return Err(TicketError::MalformedPayload(format!(
                "expected string for {}",
                EXPIRES_AT
            )))
        }
    };

    match checked {
        [(_, Field::Present(pairing_code)), (_, Field::Present(device_session_id)), (_, Field::Present(api_url)), (_, Field::Present(endpoint))] => {
            Ok(PairingTicket {
                pairing_code,
                device_session_id,
                api_url,
                endpoint,
                expires_at,
            })
        }
        _ => Err(TicketError::MalformedPayload(
            "required fields could not be read".to_string(),
        )),
    }
}

/// Parse an ISO-8601 timestamp. Accepts RFC 3339 with an offset, plus
/// offset-less date-times and bare dates, both taken as UTC.
fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = s.parse::<NaiveDateTime>() {
        return Some(naive.and_utc());
    }
    s.parse::<NaiveDate>()
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}
