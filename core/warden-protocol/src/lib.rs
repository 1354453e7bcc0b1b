//! IPC protocol types and validation for warden-daemon.
//!
//! Shared by the daemon and the platform-side clients (lock surface, dialer
//! hook, foreground reporter) so the schema cannot drift. The daemon remains
//! the authority on validation.

use chrono::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_REQUEST_BYTES: usize = 1024 * 1024; // 1MB
pub const MAX_EVENT_ID_LEN: usize = 128;
pub const MAX_PACKAGE_LEN: usize = 256;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum Method {
    GetHealth,
    GetStatus,
    Event,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Request {
    pub protocol_version: u32,
    pub method: Method,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl Response {
    pub fn ok(id: Option<String>, data: Value) -> Self {
        Self {
            ok: true,
            id,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(id: Option<String>, code: &str, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(ErrorInfo::new(code, message)),
        }
    }

    pub fn error_with_info(id: Option<String>, error: ErrorInfo) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    ForegroundChanged,
    DialObserved,
    BiometricResult,
    FallbackRequested,
    PinSubmitted,
    FrameCaptured,
    FaceEnrolled,
}

/// Raw outcome of a platform authentication prompt, as reported by the lock surface.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuthResult {
    Succeeded,
    /// A single unrecognised attempt; the prompt stays up.
    Failed,
    NegativeButton,
    UserCanceled,
    HardwareUnavailable,
    NotEnrolled,
    Error,
    CredentialConfirmed,
    CredentialRejected,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq)]
pub struct PointPayload {
    pub x: f32,
    pub y: f32,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct LandmarksPayload {
    pub left_eye: PointPayload,
    pub right_eye: PointPayload,
    pub nose_base: PointPayload,
    #[serde(default)]
    pub mouth_left: Option<PointPayload>,
    #[serde(default)]
    pub mouth_right: Option<PointPayload>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct EventEnvelope {
    pub event_id: String,
    pub recorded_at: String,
    pub event_type: EventType,
    #[serde(default)]
    pub package: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub dialed: Option<String>,
    #[serde(default)]
    pub auth_result: Option<AuthResult>,
    #[serde(default)]
    pub pin: Option<String>,
    #[serde(default)]
    pub frame_path: Option<String>,
    #[serde(default)]
    pub landmarks: Option<LandmarksPayload>,
    /// Challenge the input belongs to. Inputs for any other challenge are stale.
    #[serde(default)]
    pub challenge_id: Option<u64>,
}

impl EventEnvelope {
    pub fn new(event_id: impl Into<String>, recorded_at: String, event_type: EventType) -> Self {
        Self {
            event_id: event_id.into(),
            recorded_at,
            event_type,
            package: None,
            display_name: None,
            dialed: None,
            auth_result: None,
            pin: None,
            frame_path: None,
            landmarks: None,
            challenge_id: None,
        }
    }

    pub fn validate(&self) -> Result<(), ErrorInfo> {
        if self.event_id.trim().is_empty() {
            return Err(ErrorInfo::new("invalid_event_id", "event_id is required"));
        }
        if self.event_id.len() > MAX_EVENT_ID_LEN {
            return Err(ErrorInfo::new(
                "invalid_event_id",
                "event_id must be 128 characters or fewer",
            ));
        }

        if DateTime::parse_from_rfc3339(&self.recorded_at).is_err() {
            return Err(ErrorInfo::new(
                "invalid_timestamp",
                "recorded_at must be RFC3339",
            ));
        }

        match self.event_type {
            EventType::ForegroundChanged => {
                require_string(&self.package, "package")?;
                if self.package.as_deref().map(str::len).unwrap_or(0) > MAX_PACKAGE_LEN {
                    return Err(ErrorInfo::new(
                        "invalid_package",
                        "package must be 256 characters or fewer",
                    ));
                }
            }
            EventType::DialObserved => {
                require_string(&self.dialed, "dialed")?;
            }
            EventType::BiometricResult => {
                if self.auth_result.is_none() {
                    return Err(ErrorInfo::new("missing_field", "auth_result is required"));
                }
            }
            EventType::PinSubmitted => {
                require_string(&self.pin, "pin")?;
            }
            EventType::FaceEnrolled => {
                if self.landmarks.is_none() {
                    return Err(ErrorInfo::new("missing_field", "landmarks are required"));
                }
            }
            EventType::FallbackRequested | EventType::FrameCaptured => {}
        }

        Ok(())
    }
}

pub fn parse_event(params: Value) -> Result<EventEnvelope, ErrorInfo> {
    let envelope: EventEnvelope = serde_json::from_value(params).map_err(|err| {
        ErrorInfo::new(
            "invalid_params",
            format!("event payload is invalid JSON: {}", err),
        )
    })?;
    envelope.validate()?;
    Ok(envelope)
}

/// Response data for an `event` request. Only the fields relevant to the
/// event type are present.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventOutcome {
    pub accepted: bool,
    /// Dial events: abort the outgoing call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intercept: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub challenge_id: Option<u64>,
    /// Challenge state after the event, e.g. `alerting`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    /// Text for the lock surface to show.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enrolled: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionView {
    pub package_id: String,
    pub unlocked_at: String,
    pub remaining_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChallengeView {
    pub challenge_id: u64,
    pub target_package: String,
    pub target_display_name: String,
    pub state: String,
    pub action_taken: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub session: Option<SessionView>,
    pub challenge: Option<ChallengeView>,
    pub protected_apps: usize,
    pub setup_complete: bool,
    /// Whether the launcher entry is hidden; the dial code is then the only way in.
    #[serde(default)]
    pub stealth_mode: bool,
}

fn require_string(value: &Option<String>, field: &str) -> Result<(), ErrorInfo> {
    if let Some(candidate) = value {
        if !candidate.trim().is_empty() {
            return Ok(());
        }
    }
    Err(ErrorInfo::new(
        "missing_field",
        format!("{} is required", field),
    ))
}
