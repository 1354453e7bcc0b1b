//! Identity verification strategies.
//!
//! A strategy is chosen once per challenge from the device's capability
//! check. Every strategy answers the same question through
//! [`IdentityVerifier`]: does this sample belong to the owner?
//!
//! - `PlatformBiometric` and `DeviceCredential` consume the platform prompt's
//!   result. The prompt's negative button (or an unusable sensor) becomes a
//!   request for the PIN fallback instead of a verdict.
//! - `FaceGeometry` compares landmark ratios from camera frames against the
//!   enrolled template. No enrolled template means no match is possible.
//! - `PinOnly` never produces a verdict; the challenge goes straight to PIN.

use serde::{Deserialize, Serialize};
use warden_protocol::{AuthResult, LandmarksPayload, PointPayload};

/// Maximum relative deviation between live and enrolled ratios.
pub const FACE_TOLERANCE: f32 = 0.05;
const MIN_FEATURE_DISTANCE: f32 = 1e-3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Match,
    Mismatch,
    /// Not enough signal to decide; the challenge keeps waiting.
    Indeterminate,
}

/// What a single sample tells the challenge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthSignal {
    Verdict(Verdict),
    /// Switch to the PIN path.
    Fallback,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Sample {
    /// Landmarks from one camera frame; `None` when no face was found.
    Face(Option<FaceLandmarks>),
    Platform(AuthResult),
}

pub trait IdentityVerifier: Send + Sync {
    fn verify(&self, sample: &Sample) -> Verdict;
}

// ─────────────────────────────────────────────────────────────────────────────
// Capability detection
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct HardwareProfile {
    /// Strong-class biometric sensor present.
    #[serde(default)]
    pub biometric_strong: bool,
    #[serde(default)]
    pub biometric_enrolled: bool,
    /// A device PIN, pattern or password is configured.
    #[serde(default)]
    pub device_secure: bool,
    #[serde(default)]
    pub camera: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum VerificationStrategy {
    PlatformBiometric,
    DeviceCredential,
    FaceGeometry(FaceGeometryVerifier),
    PinOnly,
}

impl VerificationStrategy {
    /// Picks the strongest strategy the device supports.
    pub fn select(profile: &HardwareProfile, owner_template: Option<&str>) -> Self {
        if profile.biometric_strong && profile.biometric_enrolled {
            return VerificationStrategy::PlatformBiometric;
        }
        if profile.device_secure {
            return VerificationStrategy::DeviceCredential;
        }
        if profile.camera {
            return VerificationStrategy::FaceGeometry(FaceGeometryVerifier::new(owner_template));
        }
        VerificationStrategy::PinOnly
    }

    pub fn name(&self) -> &'static str {
        match self {
            VerificationStrategy::PlatformBiometric => "platform_biometric",
            VerificationStrategy::DeviceCredential => "device_credential",
            VerificationStrategy::FaceGeometry(_) => "face_geometry",
            VerificationStrategy::PinOnly => "pin_only",
        }
    }

    /// Whether the challenge starts waiting for a sample rather than a PIN.
    pub fn scans(&self) -> bool {
        !matches!(self, VerificationStrategy::PinOnly)
    }

    /// What `sample` means for a challenge using this strategy: a request for
    /// the PIN path, or the verifier's verdict.
    pub fn assess(&self, sample: &Sample) -> AuthSignal {
        if self.requests_fallback(sample) {
            return AuthSignal::Fallback;
        }
        AuthSignal::Verdict(self.verify(sample))
    }

    fn requests_fallback(&self, sample: &Sample) -> bool {
        match (self, sample) {
            (
                VerificationStrategy::PlatformBiometric | VerificationStrategy::DeviceCredential,
                Sample::Platform(result),
            ) => interpret_platform_auth(*result) == AuthSignal::Fallback,
            // A prompt the face strategy did not show can still ask for the PIN.
            (VerificationStrategy::FaceGeometry(_), Sample::Platform(AuthResult::NegativeButton)) => {
                true
            }
            _ => false,
        }
    }
}

impl IdentityVerifier for VerificationStrategy {
    fn verify(&self, sample: &Sample) -> Verdict {
        match (self, sample) {
            (
                VerificationStrategy::PlatformBiometric | VerificationStrategy::DeviceCredential,
                Sample::Platform(result),
            ) => match interpret_platform_auth(*result) {
                AuthSignal::Verdict(verdict) => verdict,
                AuthSignal::Fallback => Verdict::Indeterminate,
            },
            (VerificationStrategy::FaceGeometry(verifier), sample) => verifier.verify(sample),
            _ => Verdict::Indeterminate,
        }
    }
}

/// Maps a platform prompt result onto the challenge's vocabulary.
///
/// A single failed attempt leaves the prompt up, and a user cancel is ignored;
/// neither is a verdict. A hard error or rejected credential is a mismatch.
pub fn interpret_platform_auth(result: AuthResult) -> AuthSignal {
    match result {
        AuthResult::Succeeded | AuthResult::CredentialConfirmed => AuthSignal::Verdict(Verdict::Match),
        AuthResult::Failed | AuthResult::UserCanceled => AuthSignal::Verdict(Verdict::Indeterminate),
        AuthResult::NegativeButton | AuthResult::HardwareUnavailable | AuthResult::NotEnrolled => {
            AuthSignal::Fallback
        }
        AuthResult::Error | AuthResult::CredentialRejected => AuthSignal::Verdict(Verdict::Mismatch),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Face geometry
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    fn distance(self, other: Point) -> f32 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }

    fn midpoint(self, other: Point) -> Point {
        Point {
            x: (self.x + other.x) / 2.0,
            y: (self.y + other.y) / 2.0,
        }
    }
}

impl From<PointPayload> for Point {
    fn from(point: PointPayload) -> Self {
        Point {
            x: point.x,
            y: point.y,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FaceLandmarks {
    pub left_eye: Point,
    pub right_eye: Point,
    pub nose_base: Point,
    pub mouth_left: Option<Point>,
    pub mouth_right: Option<Point>,
}

impl From<&LandmarksPayload> for FaceLandmarks {
    fn from(payload: &LandmarksPayload) -> Self {
        FaceLandmarks {
            left_eye: payload.left_eye.into(),
            right_eye: payload.right_eye.into(),
            nose_base: payload.nose_base.into(),
            mouth_left: payload.mouth_left.map(Point::from),
            mouth_right: payload.mouth_right.map(Point::from),
        }
    }
}

/// Enrolled face measurements: `eyeEye|eyeNose[|mouthWidth]`.
///
/// Only the ratios are compared, so the template is scale independent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FaceTemplate {
    pub eye_eye: f32,
    pub eye_nose: f32,
    pub mouth_width: Option<f32>,
}

impl FaceTemplate {
    pub fn parse(raw: &str) -> Option<Self> {
        let fields: Vec<&str> = raw.trim().split('|').collect();
        if !(2..=3).contains(&fields.len()) {
            return None;
        }
        let parse_field = |value: &str| {
            value
                .trim()
                .parse::<f32>()
                .ok()
                .filter(|number| number.is_finite())
        };
        let eye_eye = parse_field(fields[0]).filter(|value| *value > MIN_FEATURE_DISTANCE)?;
        let eye_nose = parse_field(fields[1]).filter(|value| *value > MIN_FEATURE_DISTANCE)?;
        let mouth_width = match fields.get(2) {
            Some(value) => Some(parse_field(*value)?).filter(|width| *width > MIN_FEATURE_DISTANCE),
            None => None,
        };
        Some(Self {
            eye_eye,
            eye_nose,
            mouth_width,
        })
    }

    /// Measures an enrollment frame. Degenerate geometry yields `None`.
    pub fn from_landmarks(landmarks: &FaceLandmarks) -> Option<Self> {
        let eye_eye = landmarks.left_eye.distance(landmarks.right_eye);
        let eye_nose = landmarks
            .left_eye
            .midpoint(landmarks.right_eye)
            .distance(landmarks.nose_base);
        if eye_eye <= MIN_FEATURE_DISTANCE || eye_nose <= MIN_FEATURE_DISTANCE {
            return None;
        }
        let mouth_width = match (landmarks.mouth_left, landmarks.mouth_right) {
            (Some(left), Some(right)) => Some(left.distance(right)).filter(|w| *w > MIN_FEATURE_DISTANCE),
            _ => None,
        };
        Some(Self {
            eye_eye,
            eye_nose,
            mouth_width,
        })
    }

    pub fn encode(&self) -> String {
        match self.mouth_width {
            Some(width) => format!("{:.4}|{:.4}|{:.4}", self.eye_eye, self.eye_nose, width),
            None => format!("{:.4}|{:.4}", self.eye_eye, self.eye_nose),
        }
    }

    fn nose_ratio(&self) -> f32 {
        self.eye_nose / self.eye_eye
    }

    fn mouth_ratio(&self) -> Option<f32> {
        self.mouth_width.map(|width| width / self.eye_eye)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FaceGeometryVerifier {
    template: Option<FaceTemplate>,
    tolerance: f32,
}

impl FaceGeometryVerifier {
    pub fn new(owner_template: Option<&str>) -> Self {
        Self {
            template: owner_template.and_then(FaceTemplate::parse),
            tolerance: FACE_TOLERANCE,
        }
    }

    pub fn has_template(&self) -> bool {
        self.template.is_some()
    }

    pub fn compare(&self, landmarks: Option<&FaceLandmarks>) -> Verdict {
        let Some(landmarks) = landmarks else {
            return Verdict::Indeterminate;
        };
        let Some(live) = FaceTemplate::from_landmarks(landmarks) else {
            return Verdict::Indeterminate;
        };
        let Some(enrolled) = self.template.as_ref() else {
            return Verdict::Mismatch;
        };

        if !within_tolerance(live.nose_ratio(), enrolled.nose_ratio(), self.tolerance) {
            return Verdict::Mismatch;
        }
        match (enrolled.mouth_ratio(), live.mouth_ratio()) {
            (Some(expected), Some(actual)) if !within_tolerance(actual, expected, self.tolerance) => {
                Verdict::Mismatch
            }
            (Some(_), None) => Verdict::Indeterminate,
            _ => Verdict::Match,
        }
    }
}

impl IdentityVerifier for FaceGeometryVerifier {
    fn verify(&self, sample: &Sample) -> Verdict {
        match sample {
            Sample::Face(landmarks) => self.compare(landmarks.as_ref()),
            Sample::Platform(_) => Verdict::Indeterminate,
        }
    }
}

fn within_tolerance(actual: f32, expected: f32, tolerance: f32) -> bool {
    ((actual - expected) / expected).abs() <= tolerance
}
