//! Persisted user settings (`~/.warden/settings.json`).
//!
//! The settings screens are an external writer; the daemon re-reads the file
//! when its modification time changes and writes back only the values it owns
//! (cloud folder cache, hardware capability result).
//!
//! # File Format
//!
//! ```json
//! {
//!   "version": 1,
//!   "settings": { "protected_packages": ["com.bank.app"], "master_pin": "2080", ... }
//! }
//! ```
//!
//! Missing, empty, corrupt or wrong-version files all load as defaults.

use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::warn;

use crate::error::{Result, WardenError};
use crate::verification::HardwareProfile;

const SETTINGS_VERSION: u32 = 1;
/// Fallback master PIN when none is configured. Its presence means setup is incomplete.
pub const DEFAULT_MASTER_PIN: &str = "0000";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SecuritySettings {
    #[serde(default)]
    pub protected_packages: BTreeSet<String>,
    #[serde(default)]
    pub master_pin: Option<String>,
    #[serde(default)]
    pub trusted_number: Option<String>,
    /// Launcher entry hidden by the settings screens. The dial trigger stays
    /// armed either way; the daemon only reports this flag.
    #[serde(default)]
    pub stealth_mode: bool,
    /// Owner face template, `eyeEye|eyeNose[|mouthWidth]` ratios.
    #[serde(default)]
    pub owner_face_template: Option<String>,
    /// Result of the platform's capability check.
    #[serde(default)]
    pub hardware: HardwareProfile,
    /// Cached id of the remote evidence folder.
    #[serde(default)]
    pub drive_folder_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupGap {
    DefaultPin,
    NoRecipient,
    NoProtectedApps,
}

impl SecuritySettings {
    pub fn is_protected(&self, package: &str) -> bool {
        self.protected_packages.contains(package)
    }

    /// PIN the lock challenge compares against; falls back to [`DEFAULT_MASTER_PIN`].
    pub fn master_pin(&self) -> &str {
        self.master_pin
            .as_deref()
            .filter(|pin| !pin.trim().is_empty())
            .unwrap_or(DEFAULT_MASTER_PIN)
    }

    /// PIN for the dial trigger. Only an explicitly configured PIN arms it.
    pub fn stealth_pin(&self) -> Option<&str> {
        self.master_pin.as_deref().filter(|pin| !pin.trim().is_empty())
    }

    pub fn recipient(&self) -> Option<&str> {
        self.trusted_number
            .as_deref()
            .map(str::trim)
            .filter(|number| !number.is_empty())
    }

    pub fn setup_gaps(&self) -> Vec<SetupGap> {
        let mut gaps = Vec::new();
        if self.master_pin() == DEFAULT_MASTER_PIN {
            gaps.push(SetupGap::DefaultPin);
        }
        if self.recipient().is_none() {
            gaps.push(SetupGap::NoRecipient);
        }
        if self.protected_packages.is_empty() {
            gaps.push(SetupGap::NoProtectedApps);
        }
        gaps
    }

    pub fn setup_complete(&self) -> bool {
        self.setup_gaps().is_empty()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SettingsFile {
    version: u32,
    settings: SecuritySettings,
}

struct Loaded {
    settings: SecuritySettings,
    modified: Option<SystemTime>,
}

/// Shared settings snapshot with a single lock; readers get clones.
pub struct SettingsStore {
    path: Option<PathBuf>,
    inner: Mutex<Loaded>,
}

impl SettingsStore {
    pub fn load(path: &Path) -> Self {
        let settings = read_settings(path);
        Self {
            path: Some(path.to_path_buf()),
            inner: Mutex::new(Loaded {
                settings,
                modified: modified_time(path),
            }),
        }
    }

    pub fn in_memory(settings: SecuritySettings) -> Self {
        Self {
            path: None,
            inner: Mutex::new(Loaded {
                settings,
                modified: None,
            }),
        }
    }

    pub fn snapshot(&self) -> SecuritySettings {
        match self.inner.lock() {
            Ok(guard) => guard.settings.clone(),
            Err(poisoned) => poisoned.into_inner().settings.clone(),
        }
    }

    /// Re-reads the file when an external writer changed it. Returns true on reload.
    pub fn refresh_if_changed(&self) -> bool {
        let Some(path) = self.path.as_ref() else {
            return false;
        };
        let modified = modified_time(path);
        let mut guard = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if modified == guard.modified {
            return false;
        }
        guard.settings = read_settings(path);
        guard.modified = modified;
        true
    }

    /// Applies `change` and persists the result atomically.
    pub fn update<F>(&self, change: F) -> Result<SecuritySettings>
    where
        F: FnOnce(&mut SecuritySettings),
    {
        let mut guard = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut next = guard.settings.clone();
        change(&mut next);
        if let Some(path) = self.path.as_ref() {
            write_settings(path, &next)?;
            guard.modified = modified_time(path);
        }
        guard.settings = next.clone();
        Ok(next)
    }
}

fn modified_time(path: &Path) -> Option<SystemTime> {
    fs_err::metadata(path).and_then(|meta| meta.modified()).ok()
}

fn read_settings(path: &Path) -> SecuritySettings {
    let content = match fs_err::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return SecuritySettings::default()
        }
        Err(err) => {
            warn!(error = %err, "Failed to read settings file; using defaults");
            return SecuritySettings::default();
        }
    };

    if content.trim().is_empty() {
        return SecuritySettings::default();
    }

    match serde_json::from_str::<SettingsFile>(&content) {
        Ok(file) if file.version == SETTINGS_VERSION => file.settings,
        Ok(file) => {
            warn!(
                version = file.version,
                expected = SETTINGS_VERSION,
                "Unsupported settings version; using defaults"
            );
            SecuritySettings::default()
        }
        Err(err) => {
            warn!(error = %err, "Corrupt settings file; using defaults");
            SecuritySettings::default()
        }
    }
}

fn write_settings(path: &Path, settings: &SecuritySettings) -> Result<()> {
    let file = SettingsFile {
        version: SETTINGS_VERSION,
        settings: settings.clone(),
    };
    let content = serde_json::to_string_pretty(&file).map_err(|source| WardenError::Json {
        context: "serializing settings".to_string(),
        source,
    })?;

    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs_err::create_dir_all(parent).map_err(|source| WardenError::SettingsWriteFailed {
        path: path.to_path_buf(),
        source,
    })?;
    let mut temp_file =
        NamedTempFile::new_in(parent).map_err(|source| WardenError::SettingsWriteFailed {
            path: path.to_path_buf(),
            source,
        })?;
    temp_file
        .write_all(content.as_bytes())
        .and_then(|_| temp_file.flush())
        .map_err(|source| WardenError::SettingsWriteFailed {
            path: path.to_path_buf(),
            source,
        })?;
    temp_file
        .persist(path)
        .map_err(|err| WardenError::SettingsWriteFailed {
            path: path.to_path_buf(),
            source: err.error,
        })?;
    Ok(())
}
