//! Foreground-app resolution.
//!
//! The platform reports foreground transitions as they happen; the guard asks
//! for the most recent one inside a trailing window. A source that fails or has
//! nothing in the window means "no protected app is active" for that tick.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForegroundEvent {
    pub package: String,
    /// Human-readable label, when the platform supplied one.
    pub display_name: Option<String>,
    pub observed_at: DateTime<Utc>,
}

impl ForegroundEvent {
    pub fn new(package: impl Into<String>, observed_at: DateTime<Utc>) -> Self {
        Self {
            package: package.into(),
            display_name: None,
            observed_at,
        }
    }

    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = Some(display_name.into());
        self
    }

    /// Label for user-facing surfaces; falls back to the package id.
    pub fn label(&self) -> &str {
        self.display_name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .unwrap_or(&self.package)
    }
}

pub trait ForegroundSource: Send + Sync {
    /// Foreground transitions observed at or after `since`.
    fn events_since(&self, since: DateTime<Utc>) -> Result<Vec<ForegroundEvent>, String>;
}

impl<T: ForegroundSource + ?Sized> ForegroundSource for Arc<T> {
    fn events_since(&self, since: DateTime<Utc>) -> Result<Vec<ForegroundEvent>, String> {
        (**self).events_since(since)
    }
}

/// Latest event inside `[now - window, now]`. Ties keep the later entry.
pub fn resolve_foreground(
    events: &[ForegroundEvent],
    now: DateTime<Utc>,
    window: Duration,
) -> Option<&ForegroundEvent> {
    let since = now - window;
    events
        .iter()
        .filter(|event| event.observed_at >= since && event.observed_at <= now)
        .fold(None, |latest: Option<&ForegroundEvent>, event| match latest {
            Some(current) if current.observed_at > event.observed_at => Some(current),
            _ => Some(event),
        })
}

/// Bounded ring of reported foreground transitions.
pub struct ForegroundHistory {
    capacity: usize,
    events: Mutex<VecDeque<ForegroundEvent>>,
}

impl ForegroundHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            events: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn record(&self, event: ForegroundEvent) {
        let mut events = self.lock_events();
        while events.len() >= self.capacity {
            events.pop_front();
        }
        events.push_back(event);
    }

    /// Drops entries older than `cutoff`.
    pub fn prune_before(&self, cutoff: DateTime<Utc>) {
        self.lock_events().retain(|event| event.observed_at >= cutoff);
    }

    pub fn len(&self) -> usize {
        self.lock_events().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock_events(&self) -> MutexGuard<'_, VecDeque<ForegroundEvent>> {
        match self.events.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl ForegroundSource for ForegroundHistory {
    fn events_since(&self, since: DateTime<Utc>) -> Result<Vec<ForegroundEvent>, String> {
        Ok(self
            .lock_events()
            .iter()
            .filter(|event| event.observed_at >= since)
            .cloned()
            .collect())
    }
}
