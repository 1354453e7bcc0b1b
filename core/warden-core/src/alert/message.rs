//! Alert body and recipient formatting.

use std::fmt::{self, Display};

use chrono::{DateTime, TimeZone, Utc};

pub const ALERT_HEADER: &str = "⚠ WARDEN SECURITY ALERT";
pub const LOCATION_PLACEHOLDER: &str = "GPS signal pending";
pub const EVIDENCE_PLACEHOLDER: &str = "Pending Upload";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreachKind {
    IdentityMismatch,
    WrongPin,
    VerificationTimeout,
    /// The lock surface was left while a scan was still running.
    Abandoned,
}

impl Display for BreachKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            BreachKind::IdentityMismatch => "Identity Mismatch",
            BreachKind::WrongPin => "Wrong PIN",
            BreachKind::VerificationTimeout => "Verification Timeout",
            BreachKind::Abandoned => "Verification Abandoned",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertEvent {
    pub challenge_id: u64,
    pub kind: BreachKind,
    /// Display name of the protected app.
    pub app: String,
    pub occurred_at: DateTime<Utc>,
}

/// Renders the SMS body with `occurred_at` shown in `tz`.
pub fn compose_message<Tz>(
    event: &AlertEvent,
    location: Option<&str>,
    evidence_link: Option<&str>,
    tz: &Tz,
) -> String
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    let time = event.occurred_at.with_timezone(tz).format("%d-%b %H:%M");
    let map = non_blank(location).unwrap_or(LOCATION_PLACEHOLDER);
    let drive = non_blank(evidence_link).unwrap_or(EVIDENCE_PLACEHOLDER);
    format!(
        "{ALERT_HEADER}\nBreach: {}\nApp: {}\nTime: {time}\nMap: {map}\nDrive: {drive}",
        event.kind, event.app
    )
}

/// International form of a trusted number.
///
/// A bare ten-digit number gets `default_country_code`; a number already
/// starting with `+` is kept as entered; anything else gets `+` before its
/// digits. Numbers without any digits are rejected.
pub fn normalize_recipient(number: &str, default_country_code: &str) -> Option<String> {
    let trimmed = number.trim();
    let digits: String = trimmed.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() {
        return None;
    }
    if trimmed.starts_with('+') {
        return Some(trimmed.to_string());
    }
    if digits.len() == 10 {
        let prefix = default_country_code.trim();
        return Some(if prefix.starts_with('+') {
            format!("{prefix}{digits}")
        } else {
            format!("+{prefix}{digits}")
        });
    }
    Some(format!("+{digits}"))
}

/// Splits `body` into transport-sized parts on character boundaries.
pub fn split_parts(body: &str, max_chars: usize) -> Vec<String> {
    if max_chars == 0 || body.chars().count() <= max_chars {
        return vec![body.to_string()];
    }
    let chars: Vec<char> = body.chars().collect();
    chars
        .chunks(max_chars)
        .map(|chunk| chunk.iter().collect())
        .collect()
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}
