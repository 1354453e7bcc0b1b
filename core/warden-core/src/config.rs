//! Runtime tuning loaded from `~/.warden/warden.toml`.
//!
//! Every field has a serde default so a partial (or missing) file still yields
//! a complete configuration.

use std::path::Path;
use std::time::Duration as StdDuration;

use chrono::Duration;
use serde::Deserialize;

use crate::error::{Result, WardenError};

#[derive(Debug, Clone, Deserialize, Default)]
pub struct WardenConfig {
    #[serde(default)]
    pub guard: GuardConfig,
    #[serde(default)]
    pub challenge: ChallengeConfig,
    #[serde(default)]
    pub alert: AlertConfig,
    #[serde(default)]
    pub platform: PlatformConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GuardConfig {
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    #[serde(default = "default_foreground_window_ms")]
    pub foreground_window_ms: u64,
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,
    /// The monitor's own package. Foregrounding it does not clear the session.
    #[serde(default = "default_own_package")]
    pub own_package: String,
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            foreground_window_ms: default_foreground_window_ms(),
            grace_period_ms: default_grace_period_ms(),
            own_package: default_own_package(),
            history_capacity: default_history_capacity(),
        }
    }
}

impl GuardConfig {
    pub fn tick(&self) -> StdDuration {
        StdDuration::from_millis(self.tick_ms)
    }

    pub fn foreground_window(&self) -> Duration {
        Duration::milliseconds(self.foreground_window_ms as i64)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::milliseconds(self.grace_period_ms as i64)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChallengeConfig {
    /// How long a scanning challenge waits for a verdict before alerting.
    #[serde(default = "default_watchdog_ms")]
    pub watchdog_ms: u64,
}

impl Default for ChallengeConfig {
    fn default() -> Self {
        Self {
            watchdog_ms: default_watchdog_ms(),
        }
    }
}

impl ChallengeConfig {
    pub fn watchdog(&self) -> StdDuration {
        StdDuration::from_millis(self.watchdog_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AlertConfig {
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    #[serde(default = "default_max_messages")]
    pub max_messages: u32,
    #[serde(default = "default_country_code")]
    pub default_country_code: String,
    #[serde(default = "default_location_timeout_ms")]
    pub location_timeout_ms: u64,
    #[serde(default = "default_upload_timeout_ms")]
    pub upload_timeout_ms: u64,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            window_secs: default_window_secs(),
            max_messages: default_max_messages(),
            default_country_code: default_country_code(),
            location_timeout_ms: default_location_timeout_ms(),
            upload_timeout_ms: default_upload_timeout_ms(),
        }
    }
}

impl AlertConfig {
    pub fn window(&self) -> Duration {
        Duration::seconds(self.window_secs as i64)
    }

    pub fn location_timeout(&self) -> StdDuration {
        StdDuration::from_millis(self.location_timeout_ms)
    }

    pub fn upload_timeout(&self) -> StdDuration {
        StdDuration::from_millis(self.upload_timeout_ms)
    }
}

/// Argv templates for the platform collaborators. An empty template disables
/// the collaborator, which degrades the alert instead of failing it.
///
/// Placeholders: `{to}` `{body}` (SMS), `{path}` `{folder}` (upload),
/// `{package}` `{name}` `{challenge}` (lock surface). An argument that is
/// exactly `{flags}` expands to the launch flag switches.
#[derive(Debug, Clone, Deserialize)]
pub struct PlatformConfig {
    #[serde(default = "default_sms_command")]
    pub sms_command: Vec<String>,
    #[serde(default = "default_sms_part_chars")]
    pub sms_part_chars: usize,
    #[serde(default = "default_location_command")]
    pub location_command: Vec<String>,
    #[serde(default)]
    pub upload_command: Vec<String>,
    #[serde(default = "default_lock_surface_command")]
    pub lock_surface_command: Vec<String>,
    #[serde(default = "default_entry_surface_command")]
    pub entry_surface_command: Vec<String>,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            sms_command: default_sms_command(),
            sms_part_chars: default_sms_part_chars(),
            location_command: default_location_command(),
            upload_command: Vec::new(),
            lock_surface_command: default_lock_surface_command(),
            entry_surface_command: default_entry_surface_command(),
        }
    }
}

pub fn load_runtime_config(path: &Path) -> Result<WardenConfig> {
    if !path.exists() {
        return Ok(WardenConfig::default());
    }

    let content = fs_err::read_to_string(path).map_err(|source| WardenError::Io {
        context: format!("reading {}", path.display()),
        source,
    })?;
    toml::from_str::<WardenConfig>(&content).map_err(|err| WardenError::ConfigMalformed {
        path: path.to_path_buf(),
        details: err.to_string(),
    })
}

fn default_tick_ms() -> u64 {
    500
}

fn default_foreground_window_ms() -> u64 {
    10_000
}

fn default_grace_period_ms() -> u64 {
    30_000
}

fn default_own_package() -> String {
    "com.warden.app".to_string()
}

fn default_history_capacity() -> usize {
    64
}

fn default_watchdog_ms() -> u64 {
    2_000
}

fn default_window_secs() -> u64 {
    300
}

fn default_max_messages() -> u32 {
    3
}

fn default_country_code() -> String {
    "+91".to_string()
}

fn default_location_timeout_ms() -> u64 {
    10_000
}

fn default_upload_timeout_ms() -> u64 {
    15_000
}

fn default_sms_command() -> Vec<String> {
    ["termux-sms-send", "-n", "{to}", "{body}"]
        .iter()
        .map(|part| part.to_string())
        .collect()
}

// UCS-2 multipart segment size; the alert header carries a non-GSM glyph.
fn default_sms_part_chars() -> usize {
    67
}

fn default_location_command() -> Vec<String> {
    ["termux-location", "-p", "network", "-r", "once"]
        .iter()
        .map(|part| part.to_string())
        .collect()
}

fn default_lock_surface_command() -> Vec<String> {
    [
        "am",
        "start",
        "{flags}",
        "-n",
        "com.warden.app/.LockScreenActivity",
        "--es",
        "TARGET_APP_PACKAGE",
        "{package}",
        "--es",
        "TARGET_APP_NAME",
        "{name}",
        "--el",
        "CHALLENGE_ID",
        "{challenge}",
    ]
    .iter()
    .map(|part| part.to_string())
    .collect()
}

fn default_entry_surface_command() -> Vec<String> {
    ["am", "start", "{flags}", "-n", "com.warden.app/.MainActivity"]
        .iter()
        .map(|part| part.to_string())
        .collect()
}
