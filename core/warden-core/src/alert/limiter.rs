//! Fixed-window alert rate limit, persisted so a restart cannot reset it.
//!
//! A window opens at the first send after the previous one has run out
//! (`now - start > window`). A slot is reserved before transmitting and
//! handed back if the transport fails, so concurrent dispatches can never
//! exceed the cap.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use fs_err as fs;
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct WindowState {
    #[serde(default)]
    start: Option<DateTime<Utc>>,
    #[serde(default)]
    count: u32,
}

pub struct RateLimiter {
    path: Option<PathBuf>,
    window: Duration,
    max: u32,
    state: WindowState,
}

impl RateLimiter {
    pub fn new(window: Duration, max: u32) -> Self {
        Self {
            path: None,
            window,
            max,
            state: WindowState::default(),
        }
    }

    /// Limiter backed by `path`; unreadable state starts a fresh window.
    pub fn persistent(path: &Path, window: Duration, max: u32) -> Self {
        Self {
            path: Some(path.to_path_buf()),
            window,
            max,
            state: load_state(path).unwrap_or_default(),
        }
    }

    /// Reserves a send slot at `now`. Returns false when the window is full.
    pub fn try_acquire(&mut self, now: DateTime<Utc>) -> bool {
        let expired = self
            .state
            .start
            .map(|start| now.signed_duration_since(start) > self.window)
            .unwrap_or(true);
        if expired {
            self.state = WindowState {
                start: Some(now),
                count: 0,
            };
        }

        if self.state.count >= self.max {
            return false;
        }
        self.state.count += 1;
        self.persist();
        true
    }

    /// Returns a reserved slot after a failed send.
    pub fn release(&mut self) {
        self.state.count = self.state.count.saturating_sub(1);
        self.persist();
    }

    pub fn sent_in_window(&self) -> u32 {
        self.state.count
    }

    fn persist(&self) {
        let Some(path) = self.path.as_ref() else {
            return;
        };
        if let Err(err) = save_state(path, &self.state) {
            warn!(error = %err, "Failed to persist alert limiter state");
        }
    }
}

fn load_state(path: &Path) -> Option<WindowState> {
    let content = fs::read_to_string(path).ok()?;
    serde_json::from_str(&content).ok()
}

fn save_state(path: &Path, state: &WindowState) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|err| format!("create dir failed: {err}"))?;
    }
    let payload = serde_json::to_string(state).map_err(|err| err.to_string())?;
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, payload).map_err(|err| format!("write failed: {err}"))?;
    fs::rename(&tmp_path, path).map_err(|err| format!("rename failed: {err}"))?;
    Ok(())
}
