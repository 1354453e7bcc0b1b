//! Grace-period session bookkeeping.
//!
//! One slot, last writer wins. The guard's read-compare-invalidate step runs
//! under the same mutex the challenge uses to write, so a tick can never see a
//! half-written session.

use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub package_id: String,
    pub unlocked_at: DateTime<Utc>,
}

/// What the guard should do about the current foreground app.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Not a protected app; nothing to do.
    Unprotected,
    /// Protected, but inside the owner's grace window.
    Authorized,
    /// Protected and not authorized; a challenge must be raised.
    Locked,
}

pub struct SessionStore {
    grace_period: Duration,
    slot: Mutex<Option<Session>>,
}

impl SessionStore {
    pub fn new(grace_period: Duration) -> Self {
        Self {
            grace_period,
            slot: Mutex::new(None),
        }
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    /// Grants a grace window for `package_id` starting at `now`.
    pub fn unlock(&self, package_id: &str, now: DateTime<Utc>) {
        let mut slot = self.lock_slot();
        *slot = Some(Session {
            package_id: package_id.to_string(),
            unlocked_at: now,
        });
        debug!(package = %package_id, "Session unlocked");
    }

    pub fn clear(&self) {
        let mut slot = self.lock_slot();
        if slot.take().is_some() {
            debug!("Session cleared");
        }
    }

    pub fn snapshot(&self) -> Option<Session> {
        self.lock_slot().clone()
    }

    pub fn is_authorized(&self, package_id: &str, now: DateTime<Utc>) -> bool {
        let slot = self.lock_slot();
        slot.as_ref()
            .map(|session| within_grace(session, package_id, now, self.grace_period))
            .unwrap_or(false)
    }

    /// Time left in the grace window, if a session is active at `now`.
    pub fn remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        let slot = self.lock_slot();
        let session = slot.as_ref()?;
        let remaining = self.grace_period - now.signed_duration_since(session.unlocked_at);
        (remaining > Duration::zero()).then_some(remaining)
    }

    /// Applies the guard's per-tick policy for `current` as one atomic step.
    ///
    /// - Unprotected: the session is dropped unless `current` is the monitor itself.
    /// - Protected: a session for any other package is re-armed (dropped), an
    ///   expired one is dropped, and only a live session for `current` authorizes.
    pub fn evaluate(
        &self,
        current: &str,
        protected: bool,
        own_package: &str,
        now: DateTime<Utc>,
    ) -> Access {
        let mut slot = self.lock_slot();

        if !protected {
            if current != own_package && slot.is_some() {
                debug!(foreground = %current, "Left protected app; clearing session");
                *slot = None;
            }
            return Access::Unprotected;
        }

        let authorized = match slot.as_ref() {
            Some(session) if session.package_id != current => {
                debug!(
                    previous = %session.package_id,
                    foreground = %current,
                    "Foreground switched; re-arming"
                );
                false
            }
            Some(session) => within_grace(session, current, now, self.grace_period),
            None => false,
        };

        if authorized {
            Access::Authorized
        } else {
            *slot = None;
            Access::Locked
        }
    }

    fn lock_slot(&self) -> MutexGuard<'_, Option<Session>> {
        match self.slot.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn within_grace(
    session: &Session,
    package_id: &str,
    now: DateTime<Utc>,
    grace_period: Duration,
) -> bool {
    session.package_id == package_id && now.signed_duration_since(session.unlocked_at) < grace_period
}
