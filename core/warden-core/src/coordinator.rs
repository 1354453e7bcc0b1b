//! Owns the single active lock challenge.
//!
//! Raising, routing inputs by challenge id, arming the watchdog and
//! launching the lock surface all happen here. Inputs that carry an id other
//! than the active one are stale and dropped.

use std::sync::Arc;
use std::thread;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use warden_protocol::ChallengeView;

use crate::challenge::{ChallengeContext, ChallengeInput, ChallengeLatch, ChallengeUpdate, LockChallenge};
use crate::settings::SecuritySettings;
use crate::surface::{SurfaceLauncher, SurfaceRequest};
use crate::verification::VerificationStrategy;

pub trait WatchdogTimer: Send + Sync {
    /// Arranges for the challenge to be told its watchdog fired after `after`,
    /// unless `latch` has settled by then.
    fn arm(&self, challenge_id: u64, latch: Arc<ChallengeLatch>, after: StdDuration);
}

/// One sleeping thread per armed challenge.
pub struct ThreadWatchdog<F>
where
    F: Fn(u64) + Send + Sync + 'static,
{
    on_fire: Arc<F>,
}

impl<F> ThreadWatchdog<F>
where
    F: Fn(u64) + Send + Sync + 'static,
{
    pub fn new(on_fire: F) -> Self {
        Self {
            on_fire: Arc::new(on_fire),
        }
    }
}

impl<F> WatchdogTimer for ThreadWatchdog<F>
where
    F: Fn(u64) + Send + Sync + 'static,
{
    fn arm(&self, challenge_id: u64, latch: Arc<ChallengeLatch>, after: StdDuration) {
        let on_fire = self.on_fire.clone();
        let spawned = thread::Builder::new()
            .name("warden-watchdog".to_string())
            .spawn(move || {
                thread::sleep(after);
                if !latch.is_settled() {
                    on_fire(challenge_id);
                }
            });
        if let Err(err) = spawned {
            warn!(challenge_id, error = %err, "Failed to arm watchdog");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaiseOutcome {
    Raised(u64),
    /// A challenge for the same app is already up; its surface was re-shown.
    AlreadyActive(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputOutcome {
    NoChallenge,
    Stale,
    Applied {
        challenge_id: u64,
        update: ChallengeUpdate,
    },
}

pub struct ChallengeCoordinator {
    watchdog_after: StdDuration,
    context: ChallengeContext,
    launcher: Arc<dyn SurfaceLauncher>,
    watchdog: Arc<dyn WatchdogTimer>,
    active: Option<LockChallenge>,
    next_id: u64,
}

impl ChallengeCoordinator {
    pub fn new(
        watchdog_after: StdDuration,
        context: ChallengeContext,
        launcher: Arc<dyn SurfaceLauncher>,
        watchdog: Arc<dyn WatchdogTimer>,
        first_id: u64,
    ) -> Self {
        Self {
            watchdog_after,
            context,
            launcher,
            watchdog,
            active: None,
            next_id: first_id.max(1),
        }
    }

    pub fn active(&self) -> Option<&LockChallenge> {
        self.active.as_ref()
    }

    pub fn raise(
        &mut self,
        package: &str,
        display_name: &str,
        settings: &SecuritySettings,
        now: DateTime<Utc>,
    ) -> RaiseOutcome {
        if let Some(active) = self.active.as_ref() {
            if active.target_package() == package {
                let id = active.id();
                self.launch_surface(id, package, active.target_display_name());
                return RaiseOutcome::AlreadyActive(id);
            }
        }
        self.dismiss("replaced by a new detection", now);

        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1).max(1);

        let strategy =
            VerificationStrategy::select(&settings.hardware, settings.owner_face_template.as_deref());
        let challenge = LockChallenge::new(
            id,
            package,
            display_name,
            strategy,
            settings.master_pin(),
            now,
        );
        info!(
            challenge_id = id,
            package = %package,
            strategy = challenge.strategy().name(),
            "Raising lock challenge"
        );

        if challenge.strategy().scans() {
            self.watchdog
                .arm(id, challenge.latch(), self.watchdog_after);
        }
        self.launch_surface(id, package, display_name);
        self.active = Some(challenge);
        RaiseOutcome::Raised(id)
    }

    /// Routes `input` to the active challenge. `None` targets whichever is active.
    pub fn handle(
        &mut self,
        challenge_id: Option<u64>,
        input: ChallengeInput,
        now: DateTime<Utc>,
    ) -> InputOutcome {
        let Some(active) = self.active.as_mut() else {
            return InputOutcome::NoChallenge;
        };
        if challenge_id.is_some_and(|id| id != active.id()) {
            debug!(
                requested = challenge_id,
                active = active.id(),
                "Dropping input for stale challenge"
            );
            return InputOutcome::Stale;
        }

        let id = active.id();
        let update = active.handle(input, now, &self.context);
        if active.is_resolved() {
            self.active = None;
        }
        InputOutcome::Applied {
            challenge_id: id,
            update,
        }
    }

    /// Tears down the active challenge, if any. A challenge still scanning
    /// raises its alert on the way out.
    pub fn dismiss(&mut self, reason: &str, now: DateTime<Utc>) -> Option<ChallengeUpdate> {
        let mut challenge = self.active.take()?;
        debug!(challenge_id = challenge.id(), reason, "Dismissing challenge");
        Some(challenge.abandon(now, &self.context))
    }

    pub fn view(&self) -> Option<ChallengeView> {
        self.active.as_ref().map(|challenge| ChallengeView {
            challenge_id: challenge.id(),
            target_package: challenge.target_package().to_string(),
            target_display_name: challenge.target_display_name().to_string(),
            state: challenge.state().as_str().to_string(),
            action_taken: challenge.action_taken(),
        })
    }

    fn launch_surface(&self, challenge_id: u64, package: &str, display_name: &str) {
        let request = SurfaceRequest::Lock {
            challenge_id,
            package: package.to_string(),
            display_name: display_name.to_string(),
        };
        if let Err(err) = self.launcher.launch(&request) {
            warn!(challenge_id, error = %err, "Failed to launch lock surface");
        }
    }
}
