//! Lock challenge state machine.
//!
//! ```text
//! SCANNING ──match──────────────▶ VERIFIED
//!    │ ──fallback──▶ AWAITING_PIN ──pin ok──▶ VERIFIED
//!    │                    └──pin wrong──▶ ALERTING
//!    └──mismatch / wrong pin / watchdog / left──▶ ALERTING
//! ```
//!
//! Entering ALERTING is guarded by the challenge latch: the first caller to
//! claim it persists evidence and submits the one alert, every later caller
//! gets a plain denial. An alerting challenge stays up and still accepts the
//! owner's PIN or biometric, which verifies without a second alert.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::alert::{AlertEvent, AlertRequest, AlertSink, BreachKind};
use crate::evidence::{EvidenceStore, Frame, FrameSlot};
use crate::session::SessionStore;
use crate::verification::{AuthSignal, Sample, Verdict, VerificationStrategy};

/// Shown on any failure; never names the factor that failed.
pub const DENIED_MESSAGE: &str = "Access denied";
pub const INVALID_PIN_MESSAGE: &str = "Enter the full PIN";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeState {
    Scanning,
    AwaitingPin,
    Alerting,
    Verified,
}

impl ChallengeState {
    pub fn as_str(self) -> &'static str {
        match self {
            ChallengeState::Scanning => "scanning",
            ChallengeState::AwaitingPin => "awaiting_pin",
            ChallengeState::Alerting => "alerting",
            ChallengeState::Verified => "verified",
        }
    }
}

/// Shared between a challenge and the callbacks that outlive a single call
/// into it (the watchdog thread in particular).
#[derive(Debug, Default)]
pub struct ChallengeLatch {
    action_taken: AtomicBool,
    resolved: AtomicBool,
}

impl ChallengeLatch {
    /// Claims the alert side effects. Only the first caller gets `true`.
    pub fn claim_action(&self) -> bool {
        self.action_taken
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn action_taken(&self) -> bool {
        self.action_taken.load(Ordering::SeqCst)
    }

    pub fn resolve(&self) {
        self.resolved.store(true, Ordering::SeqCst);
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved.load(Ordering::SeqCst)
    }

    /// Nothing left for a pending callback to do.
    pub fn is_settled(&self) -> bool {
        self.action_taken() || self.is_resolved()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChallengeInput {
    Sample(Sample),
    FallbackRequested,
    Pin(String),
    WatchdogFired,
    Frame(Frame),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeUpdate {
    Unchanged,
    AwaitingPin,
    /// Malformed PIN entry; cleared without counting as an attempt.
    PinRejected,
    Verified,
    Alerted(BreachKind),
    /// Failure after the alert already went out.
    Denied,
}

impl ChallengeUpdate {
    pub fn user_message(self) -> Option<&'static str> {
        match self {
            ChallengeUpdate::Alerted(_) | ChallengeUpdate::Denied => Some(DENIED_MESSAGE),
            ChallengeUpdate::PinRejected => Some(INVALID_PIN_MESSAGE),
            _ => None,
        }
    }
}

/// Where a challenge's side effects land.
#[derive(Clone)]
pub struct ChallengeContext {
    pub sessions: Arc<SessionStore>,
    pub evidence: Arc<dyn EvidenceStore>,
    pub alerts: Arc<dyn AlertSink>,
}

pub struct LockChallenge {
    id: u64,
    target_package: String,
    target_display_name: String,
    state: ChallengeState,
    latch: Arc<ChallengeLatch>,
    evidence: FrameSlot,
    strategy: VerificationStrategy,
    master_pin: String,
    raised_at: DateTime<Utc>,
}

impl LockChallenge {
    pub fn new(
        id: u64,
        target_package: impl Into<String>,
        target_display_name: impl Into<String>,
        strategy: VerificationStrategy,
        master_pin: impl Into<String>,
        raised_at: DateTime<Utc>,
    ) -> Self {
        let state = if strategy.scans() {
            ChallengeState::Scanning
        } else {
            ChallengeState::AwaitingPin
        };
        Self {
            id,
            target_package: target_package.into(),
            target_display_name: target_display_name.into(),
            state,
            latch: Arc::new(ChallengeLatch::default()),
            evidence: FrameSlot::new(),
            strategy,
            master_pin: master_pin.into(),
            raised_at,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn target_package(&self) -> &str {
        &self.target_package
    }

    pub fn target_display_name(&self) -> &str {
        &self.target_display_name
    }

    pub fn state(&self) -> ChallengeState {
        self.state
    }

    pub fn strategy(&self) -> &VerificationStrategy {
        &self.strategy
    }

    pub fn latch(&self) -> Arc<ChallengeLatch> {
        self.latch.clone()
    }

    pub fn action_taken(&self) -> bool {
        self.latch.action_taken()
    }

    pub fn has_evidence(&self) -> bool {
        self.evidence.has_frame()
    }

    /// Expected PIN length; entries of any other length are rejected outright.
    pub fn pin_length(&self) -> usize {
        self.master_pin.chars().count()
    }

    pub fn is_resolved(&self) -> bool {
        self.state == ChallengeState::Verified || self.latch.is_resolved()
    }

    /// Ends the challenge because the user left it or another app replaced
    /// it. Leaving a scan before any verdict counts as a breach, so the alert
    /// goes out before the challenge is torn down.
    pub fn abandon(&mut self, now: DateTime<Utc>, context: &ChallengeContext) -> ChallengeUpdate {
        if self.is_resolved() {
            return ChallengeUpdate::Unchanged;
        }
        let update = if self.state == ChallengeState::Scanning && !self.latch.action_taken() {
            self.escalate(BreachKind::Abandoned, now, context)
        } else {
            ChallengeUpdate::Unchanged
        };
        self.latch.resolve();
        self.evidence.discard();
        update
    }

    pub fn handle(
        &mut self,
        input: ChallengeInput,
        now: DateTime<Utc>,
        context: &ChallengeContext,
    ) -> ChallengeUpdate {
        if self.is_resolved() {
            return ChallengeUpdate::Unchanged;
        }

        match input {
            ChallengeInput::Frame(frame) => {
                let sample = Sample::Face(frame.landmarks.clone());
                self.evidence.offer(frame);
                if matches!(self.strategy, VerificationStrategy::FaceGeometry(_)) {
                    let signal = self.strategy.assess(&sample);
                    self.apply_signal(signal, now, context)
                } else {
                    ChallengeUpdate::Unchanged
                }
            }
            ChallengeInput::Sample(sample) => {
                let signal = self.strategy.assess(&sample);
                self.apply_signal(signal, now, context)
            }
            ChallengeInput::FallbackRequested => self.enter_pin_fallback(),
            ChallengeInput::Pin(entry) => self.submit_pin(&entry, now, context),
            ChallengeInput::WatchdogFired => {
                if self.state != ChallengeState::Scanning || self.latch.action_taken() {
                    return ChallengeUpdate::Unchanged;
                }
                debug!(challenge_id = self.id, "Watchdog fired with no verdict");
                self.escalate(BreachKind::VerificationTimeout, now, context)
            }
        }
    }

    fn apply_signal(
        &mut self,
        signal: AuthSignal,
        now: DateTime<Utc>,
        context: &ChallengeContext,
    ) -> ChallengeUpdate {
        match signal {
            AuthSignal::Fallback => self.enter_pin_fallback(),
            AuthSignal::Verdict(Verdict::Match) => self.verify(now, context),
            AuthSignal::Verdict(Verdict::Mismatch) => match self.state {
                ChallengeState::Scanning => {
                    self.escalate(BreachKind::IdentityMismatch, now, context)
                }
                ChallengeState::Alerting => ChallengeUpdate::Denied,
                // The owner chose the PIN path; only the PIN decides now.
                ChallengeState::AwaitingPin | ChallengeState::Verified => {
                    ChallengeUpdate::Unchanged
                }
            },
            AuthSignal::Verdict(Verdict::Indeterminate) => ChallengeUpdate::Unchanged,
        }
    }

    fn enter_pin_fallback(&mut self) -> ChallengeUpdate {
        if self.state != ChallengeState::Scanning {
            return ChallengeUpdate::Unchanged;
        }
        debug!(challenge_id = self.id, "Switching to PIN fallback");
        self.state = ChallengeState::AwaitingPin;
        ChallengeUpdate::AwaitingPin
    }

    fn submit_pin(
        &mut self,
        entry: &str,
        now: DateTime<Utc>,
        context: &ChallengeContext,
    ) -> ChallengeUpdate {
        let well_formed = entry.chars().count() == self.pin_length()
            && entry.chars().all(|ch| ch.is_ascii_digit());
        if !well_formed {
            return ChallengeUpdate::PinRejected;
        }

        if constant_time_eq(entry.as_bytes(), self.master_pin.as_bytes()) {
            return self.verify(now, context);
        }
        if self.state == ChallengeState::Alerting {
            return ChallengeUpdate::Denied;
        }
        self.escalate(BreachKind::WrongPin, now, context)
    }

    fn verify(&mut self, now: DateTime<Utc>, context: &ChallengeContext) -> ChallengeUpdate {
        self.state = ChallengeState::Verified;
        self.latch.resolve();
        self.evidence.discard();
        context.sessions.unlock(&self.target_package, now);
        info!(
            challenge_id = self.id,
            package = %self.target_package,
            "Challenge verified"
        );
        ChallengeUpdate::Verified
    }

    fn escalate(
        &mut self,
        kind: BreachKind,
        now: DateTime<Utc>,
        context: &ChallengeContext,
    ) -> ChallengeUpdate {
        if !self.latch.claim_action() {
            return ChallengeUpdate::Denied;
        }
        self.state = ChallengeState::Alerting;

        let evidence = self
            .evidence
            .take()
            .and_then(|frame| match context.evidence.persist(&frame) {
                Ok(path) => Some(path),
                Err(err) => {
                    warn!(challenge_id = self.id, error = %err, "Failed to persist evidence");
                    None
                }
            });

        warn!(
            challenge_id = self.id,
            package = %self.target_package,
            breach = %kind,
            elapsed_ms = now.signed_duration_since(self.raised_at).num_milliseconds(),
            has_evidence = evidence.is_some(),
            "Challenge failed; dispatching alert"
        );
        context.alerts.submit(AlertRequest {
            event: AlertEvent {
                challenge_id: self.id,
                kind,
                app: self.target_display_name.clone(),
                occurred_at: now,
            },
            evidence,
        });
        ChallengeUpdate::Alerted(kind)
    }
}

fn constant_time_eq(left: &[u8], right: &[u8]) -> bool {
    if left.len() != right.len() {
        return false;
    }
    left.iter()
        .zip(right)
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::{Result, WardenError};
    use crate::verification::{FaceGeometryVerifier, FaceLandmarks, Point};
    use chrono::Duration;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use warden_protocol::AuthResult;

    #[derive(Default)]
    pub(crate) struct RecordingAlerts {
        pub(crate) requests: Mutex<Vec<AlertRequest>>,
    }

    impl AlertSink for RecordingAlerts {
        fn submit(&self, request: AlertRequest) {
            self.requests.lock().unwrap().push(request);
        }
    }

    #[derive(Default)]
    pub(crate) struct MemoryEvidence {
        pub(crate) persisted: Mutex<Vec<Frame>>,
    }

    impl EvidenceStore for MemoryEvidence {
        fn persist(&self, frame: &Frame) -> Result<PathBuf> {
            if frame.jpeg.is_empty() {
                return Err(WardenError::EmptyEvidence);
            }
            let mut persisted = self.persisted.lock().unwrap();
            persisted.push(frame.clone());
            Ok(PathBuf::from(format!("/evidence/{}.jpg", persisted.len())))
        }
    }

    pub(crate) struct Harness {
        pub(crate) context: ChallengeContext,
        pub(crate) sessions: Arc<SessionStore>,
        pub(crate) alerts: Arc<RecordingAlerts>,
        pub(crate) evidence: Arc<MemoryEvidence>,
    }

    impl Harness {
        pub(crate) fn new() -> Self {
            let sessions = Arc::new(SessionStore::new(Duration::seconds(30)));
            let alerts = Arc::new(RecordingAlerts::default());
            let evidence = Arc::new(MemoryEvidence::default());
            Self {
                context: ChallengeContext {
                    sessions: sessions.clone(),
                    evidence: evidence.clone(),
                    alerts: alerts.clone(),
                },
                sessions,
                alerts,
                evidence,
            }
        }

        pub(crate) fn alert_count(&self) -> usize {
            self.alerts.requests.lock().unwrap().len()
        }
    }

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn challenge(strategy: VerificationStrategy) -> LockChallenge {
        LockChallenge::new(1, "com.bank.app", "Bank", strategy, "2080", now())
    }

    fn frame(landmarks: Option<FaceLandmarks>) -> Frame {
        Frame {
            captured_at: now(),
            jpeg: b"\xff\xd8frame".to_vec(),
            landmarks,
        }
    }

    fn owner_face() -> FaceLandmarks {
        FaceLandmarks {
            left_eye: Point { x: 0.0, y: 0.0 },
            right_eye: Point { x: 60.0, y: 0.0 },
            nose_base: Point { x: 30.0, y: 45.0 },
            mouth_left: None,
            mouth_right: None,
        }
    }

    fn stranger_face() -> FaceLandmarks {
        FaceLandmarks {
            nose_base: Point { x: 30.0, y: 60.0 },
            ..owner_face()
        }
    }

    #[test]
    fn biometric_match_verifies_and_writes_session() {
        let harness = Harness::new();
        let mut challenge = challenge(VerificationStrategy::PlatformBiometric);
        challenge.handle(ChallengeInput::Frame(frame(None)), now(), &harness.context);

        let update = challenge.handle(
            ChallengeInput::Sample(Sample::Platform(AuthResult::Succeeded)),
            now(),
            &harness.context,
        );

        assert_eq!(update, ChallengeUpdate::Verified);
        assert_eq!(challenge.state(), ChallengeState::Verified);
        assert!(harness.sessions.is_authorized("com.bank.app", now()));
        assert!(!challenge.has_evidence());
        assert_eq!(harness.alert_count(), 0);
    }

    #[test]
    fn mismatch_alerts_once_with_evidence() {
        let harness = Harness::new();
        let mut challenge = challenge(VerificationStrategy::PlatformBiometric);
        challenge.handle(ChallengeInput::Frame(frame(None)), now(), &harness.context);

        let update = challenge.handle(
            ChallengeInput::Sample(Sample::Platform(AuthResult::Error)),
            now(),
            &harness.context,
        );
        assert_eq!(update, ChallengeUpdate::Alerted(BreachKind::IdentityMismatch));
        assert_eq!(update.user_message(), Some(DENIED_MESSAGE));
        assert_eq!(challenge.state(), ChallengeState::Alerting);

        let watchdog = challenge.handle(ChallengeInput::WatchdogFired, now(), &harness.context);
        assert_eq!(watchdog, ChallengeUpdate::Unchanged);

        let again = challenge.handle(
            ChallengeInput::Sample(Sample::Platform(AuthResult::CredentialRejected)),
            now(),
            &harness.context,
        );
        assert_eq!(again, ChallengeUpdate::Denied);

        let requests = harness.alerts.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].event.app, "Bank");
        assert_eq!(requests[0].evidence, Some(PathBuf::from("/evidence/1.jpg")));
        assert_eq!(harness.evidence.persisted.lock().unwrap().len(), 1);
    }

    #[test]
    fn watchdog_alerts_when_scanning_without_verdict() {
        let harness = Harness::new();
        let mut challenge = challenge(VerificationStrategy::PlatformBiometric);
        challenge.handle(
            ChallengeInput::Sample(Sample::Platform(AuthResult::Failed)),
            now(),
            &harness.context,
        );
        assert_eq!(challenge.state(), ChallengeState::Scanning);

        let update = challenge.handle(ChallengeInput::WatchdogFired, now(), &harness.context);
        assert_eq!(update, ChallengeUpdate::Alerted(BreachKind::VerificationTimeout));
        assert!(challenge.action_taken());
        assert_eq!(harness.alert_count(), 1);
        // No frame was captured, so the alert carries no evidence.
        assert!(harness.alerts.requests.lock().unwrap()[0].evidence.is_none());
    }

    #[test]
    fn watchdog_is_ignored_after_fallback() {
        let harness = Harness::new();
        let mut challenge = challenge(VerificationStrategy::PlatformBiometric);
        let update = challenge.handle(
            ChallengeInput::Sample(Sample::Platform(AuthResult::NegativeButton)),
            now(),
            &harness.context,
        );
        assert_eq!(update, ChallengeUpdate::AwaitingPin);

        let watchdog = challenge.handle(ChallengeInput::WatchdogFired, now(), &harness.context);
        assert_eq!(watchdog, ChallengeUpdate::Unchanged);
        assert_eq!(harness.alert_count(), 0);
    }

    #[test]
    fn correct_pin_verifies_from_fallback() {
        let harness = Harness::new();
        let mut challenge = challenge(VerificationStrategy::DeviceCredential);
        challenge.handle(ChallengeInput::FallbackRequested, now(), &harness.context);

        let update = challenge.handle(
            ChallengeInput::Pin("2080".to_string()),
            now(),
            &harness.context,
        );
        assert_eq!(update, ChallengeUpdate::Verified);
        assert!(harness.sessions.is_authorized("com.bank.app", now()));
    }

    #[test]
    fn malformed_pin_is_rejected_without_alert() {
        let harness = Harness::new();
        let mut challenge = challenge(VerificationStrategy::PinOnly);
        assert_eq!(challenge.state(), ChallengeState::AwaitingPin);

        for entry in ["208", "20800", "20a0", ""] {
            let update =
                challenge.handle(ChallengeInput::Pin(entry.to_string()), now(), &harness.context);
            assert_eq!(update, ChallengeUpdate::PinRejected);
        }
        assert_eq!(challenge.state(), ChallengeState::AwaitingPin);
        assert_eq!(harness.alert_count(), 0);
    }

    #[test]
    fn wrong_pin_alerts_then_owner_can_still_unlock() {
        let harness = Harness::new();
        let mut challenge = challenge(VerificationStrategy::PinOnly);

        let wrong = challenge.handle(
            ChallengeInput::Pin("1111".to_string()),
            now(),
            &harness.context,
        );
        assert_eq!(wrong, ChallengeUpdate::Alerted(BreachKind::WrongPin));

        let wrong_again = challenge.handle(
            ChallengeInput::Pin("2222".to_string()),
            now(),
            &harness.context,
        );
        assert_eq!(wrong_again, ChallengeUpdate::Denied);

        let later = now() + Duration::seconds(40);
        let right = challenge.handle(ChallengeInput::Pin("2080".to_string()), later, &harness.context);
        assert_eq!(right, ChallengeUpdate::Verified);
        assert!(harness.sessions.is_authorized("com.bank.app", later));
        assert_eq!(harness.alert_count(), 1);
    }

    #[test]
    fn face_geometry_verifies_from_frames() {
        let harness = Harness::new();
        let strategy = VerificationStrategy::FaceGeometry(FaceGeometryVerifier::new(Some("60|45")));

        let mut owner = challenge(strategy.clone());
        assert_eq!(
            owner.handle(ChallengeInput::Frame(frame(None)), now(), &harness.context),
            ChallengeUpdate::Unchanged
        );
        assert_eq!(
            owner.handle(
                ChallengeInput::Frame(frame(Some(owner_face()))),
                now(),
                &harness.context
            ),
            ChallengeUpdate::Verified
        );

        let mut intruder = challenge(strategy);
        assert_eq!(
            intruder.handle(
                ChallengeInput::Frame(frame(Some(stranger_face()))),
                now(),
                &harness.context
            ),
            ChallengeUpdate::Alerted(BreachKind::IdentityMismatch)
        );
        assert_eq!(harness.alert_count(), 1);
        assert!(harness.alerts.requests.lock().unwrap()[0].evidence.is_some());
    }

    #[test]
    fn resolved_challenge_ignores_late_inputs() {
        let harness = Harness::new();
        let mut challenge = challenge(VerificationStrategy::PinOnly);
        challenge.handle(ChallengeInput::Pin("2080".to_string()), now(), &harness.context);

        let late = challenge.handle(
            ChallengeInput::Pin("1111".to_string()),
            now(),
            &harness.context,
        );
        assert_eq!(late, ChallengeUpdate::Unchanged);
        assert_eq!(harness.alert_count(), 0);
    }

    #[test]
    fn leaving_a_scan_alerts_with_evidence_then_settles() {
        let harness = Harness::new();
        let mut challenge = challenge(VerificationStrategy::PlatformBiometric);
        let latch = challenge.latch();
        challenge.handle(ChallengeInput::Frame(frame(None)), now(), &harness.context);

        let update = challenge.abandon(now(), &harness.context);
        assert_eq!(update, ChallengeUpdate::Alerted(BreachKind::Abandoned));
        assert!(latch.is_settled());
        assert_eq!(
            challenge.handle(ChallengeInput::WatchdogFired, now(), &harness.context),
            ChallengeUpdate::Unchanged
        );

        let requests = harness.alerts.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].evidence.is_some());
    }

    #[test]
    fn leaving_after_a_verdict_or_fallback_sends_nothing_more() {
        let harness = Harness::new();

        let mut alerted = challenge(VerificationStrategy::PlatformBiometric);
        alerted.handle(
            ChallengeInput::Sample(Sample::Platform(AuthResult::Error)),
            now(),
            &harness.context,
        );
        assert_eq!(alerted.abandon(now(), &harness.context), ChallengeUpdate::Unchanged);

        let mut pin_pad = challenge(VerificationStrategy::PlatformBiometric);
        pin_pad.handle(ChallengeInput::FallbackRequested, now(), &harness.context);
        assert_eq!(pin_pad.abandon(now(), &harness.context), ChallengeUpdate::Unchanged);
        assert!(pin_pad.is_resolved());

        assert_eq!(harness.alert_count(), 1);
    }

    #[test]
    fn latch_claims_exactly_once() {
        let latch = Arc::new(ChallengeLatch::default());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let latch = latch.clone();
                std::thread::spawn(move || latch.claim_action())
            })
            .collect();
        let claimed = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|claimed| *claimed)
            .count();
        assert_eq!(claimed, 1);
    }

    #[test]
    fn constant_time_eq_compares_bytes() {
        assert!(constant_time_eq(b"2080", b"2080"));
        assert!(!constant_time_eq(b"2080", b"2081"));
        assert!(!constant_time_eq(b"2080", b"20800"));
    }
}
