//! Per-tick foreground decision.
//!
//! Each tick resolves the current foreground app, then applies the session
//! policy in one step. Raising the challenge itself is left to the caller so
//! the guard stays free of UI side effects.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};

use crate::foreground::{resolve_foreground, ForegroundSource};
use crate::session::{Access, SessionStore};
use crate::settings::SettingsStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Nothing reported in the window, or the source failed.
    NoForeground,
    NotProtected { package: String },
    Authorized { package: String },
    ChallengeRequired {
        package: String,
        display_name: String,
    },
}

pub struct ForegroundGuard<S: ForegroundSource> {
    source: S,
    sessions: Arc<SessionStore>,
    settings: Arc<SettingsStore>,
    own_package: String,
    window: Duration,
}

impl<S: ForegroundSource> ForegroundGuard<S> {
    pub fn new(
        source: S,
        sessions: Arc<SessionStore>,
        settings: Arc<SettingsStore>,
        own_package: impl Into<String>,
        window: Duration,
    ) -> Self {
        Self {
            source,
            sessions,
            settings,
            own_package: own_package.into(),
            window,
        }
    }

    pub fn own_package(&self) -> &str {
        &self.own_package
    }

    pub fn tick(&self, now: DateTime<Utc>) -> TickOutcome {
        let events = match self.source.events_since(now - self.window) {
            Ok(events) => events,
            Err(err) => {
                warn!(error = %err, "Foreground query failed");
                return TickOutcome::NoForeground;
            }
        };
        let Some(current) = resolve_foreground(&events, now, self.window) else {
            return TickOutcome::NoForeground;
        };

        let protected = self.settings.snapshot().is_protected(&current.package);
        match self
            .sessions
            .evaluate(&current.package, protected, &self.own_package, now)
        {
            Access::Unprotected => TickOutcome::NotProtected {
                package: current.package.clone(),
            },
            Access::Authorized => TickOutcome::Authorized {
                package: current.package.clone(),
            },
            Access::Locked => {
                debug!(package = %current.package, "Protected app without session");
                TickOutcome::ChallengeRequired {
                    package: current.package.clone(),
                    display_name: current.label().to_string(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foreground::ForegroundEvent;
    use crate::settings::SecuritySettings;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    const OWN: &str = "com.warden.app";

    #[derive(Clone, Default)]
    struct FakeSource {
        responses: Arc<Mutex<VecDeque<Result<Vec<ForegroundEvent>, String>>>>,
    }

    impl FakeSource {
        fn push(&self, response: Result<Vec<ForegroundEvent>, String>) {
            self.responses.lock().unwrap().push_back(response);
        }
    }

    impl ForegroundSource for FakeSource {
        fn events_since(&self, _since: DateTime<Utc>) -> Result<Vec<ForegroundEvent>, String> {
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(Vec::new()))
        }
    }

    fn at(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value)
            .expect("parse")
            .with_timezone(&Utc)
    }

    fn guard(source: FakeSource) -> (ForegroundGuard<FakeSource>, Arc<SessionStore>) {
        let mut settings = SecuritySettings::default();
        settings.protected_packages.insert("com.bank.app".to_string());
        settings.protected_packages.insert("com.chat.app".to_string());
        let sessions = Arc::new(SessionStore::new(Duration::seconds(30)));
        let guard = ForegroundGuard::new(
            source,
            sessions.clone(),
            Arc::new(SettingsStore::in_memory(settings)),
            OWN,
            Duration::seconds(10),
        );
        (guard, sessions)
    }

    #[test]
    fn protected_app_without_session_requires_challenge() {
        let source = FakeSource::default();
        let now = at("2026-03-01T10:00:10Z");
        source.push(Ok(vec![ForegroundEvent::new(
            "com.bank.app",
            now - Duration::seconds(1),
        )
        .with_display_name("Bank")]));
        let (guard, _) = guard(source);

        assert_eq!(
            guard.tick(now),
            TickOutcome::ChallengeRequired {
                package: "com.bank.app".to_string(),
                display_name: "Bank".to_string(),
            }
        );
    }

    #[test]
    fn live_session_authorizes_same_app() {
        let source = FakeSource::default();
        let now = at("2026-03-01T10:00:10Z");
        source.push(Ok(vec![ForegroundEvent::new("com.bank.app", now)]));
        let (guard, sessions) = guard(source);
        sessions.unlock("com.bank.app", now - Duration::seconds(29));

        assert_eq!(
            guard.tick(now),
            TickOutcome::Authorized {
                package: "com.bank.app".to_string()
            }
        );
    }

    #[test]
    fn switching_protected_apps_requires_fresh_challenge() {
        let source = FakeSource::default();
        let now = at("2026-03-01T10:00:10Z");
        source.push(Ok(vec![ForegroundEvent::new("com.chat.app", now)]));
        let (guard, sessions) = guard(source);
        sessions.unlock("com.bank.app", now - Duration::seconds(1));

        assert!(matches!(
            guard.tick(now),
            TickOutcome::ChallengeRequired { ref package, .. } if package == "com.chat.app"
        ));
        assert!(sessions.snapshot().is_none());
    }

    #[test]
    fn source_failure_is_treated_as_no_foreground() {
        let source = FakeSource::default();
        source.push(Err("usage stats unavailable".to_string()));
        let (guard, _) = guard(source);
        assert_eq!(guard.tick(at("2026-03-01T10:00:10Z")), TickOutcome::NoForeground);
    }

    #[test]
    fn empty_window_is_no_foreground() {
        let source = FakeSource::default();
        source.push(Ok(Vec::new()));
        let (guard, _) = guard(source);
        assert_eq!(guard.tick(at("2026-03-01T10:00:10Z")), TickOutcome::NoForeground);
    }

    #[test]
    fn own_package_keeps_session() {
        let source = FakeSource::default();
        let now = at("2026-03-01T10:00:10Z");
        source.push(Ok(vec![ForegroundEvent::new(OWN, now)]));
        let (guard, sessions) = guard(source);
        sessions.unlock("com.bank.app", now - Duration::seconds(5));

        assert_eq!(
            guard.tick(now),
            TickOutcome::NotProtected {
                package: OWN.to_string()
            }
        );
        assert!(sessions.snapshot().is_some());
    }
}
