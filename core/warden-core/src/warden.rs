//! The decision loop.
//!
//! Every trigger (tick, foreground change, dialed number, verification input,
//! watchdog) arrives as a [`WardenInput`] and is handled by one owner, so the
//! guard, the session slot and the active challenge never race each other.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};
use warden_protocol::{SessionView, StatusSnapshot};

use crate::alert::AlertSink;
use crate::challenge::{ChallengeContext, ChallengeInput};
use crate::config::WardenConfig;
use crate::coordinator::{ChallengeCoordinator, InputOutcome, RaiseOutcome, WatchdogTimer};
use crate::evidence::EvidenceStore;
use crate::foreground::{ForegroundEvent, ForegroundHistory};
use crate::guard::{ForegroundGuard, TickOutcome};
use crate::session::SessionStore;
use crate::settings::SettingsStore;
use crate::stealth::{DialDecision, DialInterceptor, StealthMatcher};
use crate::surface::SurfaceLauncher;
use crate::verification::{FaceLandmarks, FaceTemplate};

#[derive(Debug, Clone, PartialEq)]
pub enum WardenInput {
    Tick,
    ForegroundChanged(ForegroundEvent),
    DialObserved(String),
    Challenge {
        challenge_id: Option<u64>,
        input: ChallengeInput,
    },
    WatchdogFired(u64),
    EnrollFace(FaceLandmarks),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WardenReply {
    Tick(TickOutcome),
    Dial(DialDecision),
    Challenge(InputOutcome),
    /// Whether an owner face template was stored.
    Enrolled(bool),
}

/// External boundaries the loop drives.
#[derive(Clone)]
pub struct Collaborators {
    pub launcher: Arc<dyn SurfaceLauncher>,
    pub evidence: Arc<dyn EvidenceStore>,
    pub alerts: Arc<dyn AlertSink>,
    pub watchdog: Arc<dyn WatchdogTimer>,
}

pub struct Warden {
    history: Arc<ForegroundHistory>,
    guard: ForegroundGuard<Arc<ForegroundHistory>>,
    settings: Arc<SettingsStore>,
    sessions: Arc<SessionStore>,
    coordinator: ChallengeCoordinator,
    dial: DialInterceptor,
    window: Duration,
}

impl Warden {
    pub fn new(
        config: &WardenConfig,
        settings: Arc<SettingsStore>,
        collaborators: Collaborators,
        first_challenge_id: u64,
    ) -> Self {
        let sessions = Arc::new(SessionStore::new(config.guard.grace_period()));
        let history = Arc::new(ForegroundHistory::new(config.guard.history_capacity));
        let window = config.guard.foreground_window();
        let guard = ForegroundGuard::new(
            history.clone(),
            sessions.clone(),
            settings.clone(),
            config.guard.own_package.clone(),
            window,
        );
        let coordinator = ChallengeCoordinator::new(
            config.challenge.watchdog(),
            ChallengeContext {
                sessions: sessions.clone(),
                evidence: collaborators.evidence,
                alerts: collaborators.alerts,
            },
            collaborators.launcher.clone(),
            collaborators.watchdog,
            first_challenge_id,
        );
        Self {
            history,
            guard,
            settings,
            sessions,
            coordinator,
            dial: DialInterceptor::new(collaborators.launcher),
            window,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    pub fn handle(&mut self, input: WardenInput, now: DateTime<Utc>) -> WardenReply {
        match input {
            WardenInput::Tick => WardenReply::Tick(self.tick(now)),
            WardenInput::ForegroundChanged(event) => {
                self.history.record(event);
                WardenReply::Tick(self.tick(now))
            }
            WardenInput::DialObserved(dialed) => {
                let settings = self.settings.snapshot();
                let matcher = StealthMatcher::new(settings.stealth_pin());
                WardenReply::Dial(self.dial.on_dial(&dialed, &matcher))
            }
            WardenInput::Challenge {
                challenge_id,
                input,
            } => WardenReply::Challenge(self.coordinator.handle(challenge_id, input, now)),
            WardenInput::WatchdogFired(challenge_id) => WardenReply::Challenge(
                self.coordinator
                    .handle(Some(challenge_id), ChallengeInput::WatchdogFired, now),
            ),
            WardenInput::EnrollFace(landmarks) => WardenReply::Enrolled(self.enroll_face(&landmarks)),
        }
    }

    pub fn status(&self, now: DateTime<Utc>) -> StatusSnapshot {
        let settings = self.settings.snapshot();
        let session = self.sessions.snapshot().and_then(|session| {
            let remaining = self.sessions.remaining(now)?;
            Some(SessionView {
                package_id: session.package_id,
                unlocked_at: session.unlocked_at.to_rfc3339(),
                remaining_ms: remaining.num_milliseconds(),
            })
        });
        StatusSnapshot {
            session,
            challenge: self.coordinator.view(),
            protected_apps: settings.protected_packages.len(),
            setup_complete: settings.setup_complete(),
            stealth_mode: settings.stealth_mode,
        }
    }

    fn tick(&mut self, now: DateTime<Utc>) -> TickOutcome {
        self.settings.refresh_if_changed();
        self.history.prune_before(now - self.window);

        let outcome = self.guard.tick(now);
        match &outcome {
            TickOutcome::ChallengeRequired {
                package,
                display_name,
            } => {
                let settings = self.settings.snapshot();
                if let RaiseOutcome::Raised(id) =
                    self.coordinator.raise(package, display_name, &settings, now)
                {
                    info!(challenge_id = id, package = %package, "Protected app locked");
                }
            }
            TickOutcome::NotProtected { package } if package != self.guard.own_package() => {
                self.coordinator.dismiss("foreground left the lock surface", now);
            }
            _ => {}
        }
        outcome
    }

    fn enroll_face(&self, landmarks: &FaceLandmarks) -> bool {
        let Some(template) = FaceTemplate::from_landmarks(landmarks) else {
            warn!("Enrollment frame has degenerate face geometry");
            return false;
        };
        let encoded = template.encode();
        match self.settings.update(|settings| {
            settings.owner_face_template = Some(encoded);
        }) {
            Ok(_) => {
                info!("Owner face template enrolled");
                true
            }
            Err(err) => {
                warn!(error = %err, "Failed to store face template");
                false
            }
        }
    }
}
