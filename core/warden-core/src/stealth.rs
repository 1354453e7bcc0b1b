//! Hidden entry through the dialer.
//!
//! Dialing the master PIN (bare, `*#PIN#` or `#PIN#`) aborts the call and
//! opens the entry surface. Comparison is on digits only.

use std::sync::Arc;

use tracing::{info, warn};

use crate::surface::{SurfaceLauncher, SurfaceRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialDecision {
    PassThrough,
    /// Abort the outgoing call; the entry surface was launched.
    Intercept,
}

pub fn normalize_digits(raw: &str) -> String {
    raw.chars().filter(char::is_ascii_digit).collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StealthMatcher {
    pin_digits: Option<String>,
}

impl StealthMatcher {
    /// A PIN with no digits at all never arms the matcher.
    pub fn new(stored_pin: Option<&str>) -> Self {
        Self {
            pin_digits: stored_pin
                .map(normalize_digits)
                .filter(|digits| !digits.is_empty()),
        }
    }

    pub fn is_armed(&self) -> bool {
        self.pin_digits.is_some()
    }

    pub fn matches(&self, dialed: &str) -> bool {
        match self.pin_digits.as_deref() {
            Some(pin) => normalize_digits(dialed) == pin,
            None => false,
        }
    }
}

pub struct DialInterceptor {
    launcher: Arc<dyn SurfaceLauncher>,
}

impl DialInterceptor {
    pub fn new(launcher: Arc<dyn SurfaceLauncher>) -> Self {
        Self { launcher }
    }

    pub fn on_dial(&self, dialed: &str, matcher: &StealthMatcher) -> DialDecision {
        if !matcher.matches(dialed) {
            return DialDecision::PassThrough;
        }

        info!("Stealth dial matched; opening entry surface");
        if let Err(err) = self.launcher.launch(&SurfaceRequest::Entry) {
            warn!(error = %err, "Failed to launch entry surface");
        }
        // The dialed code is a secret; the call is aborted even if the launch failed.
        DialDecision::Intercept
    }
}
