//! Storage configuration and path management for Warden.
//!
//! Every file the daemon touches is resolved here so tests can point the whole
//! tree at a temp directory with [`StorageConfig::with_root`].

use std::path::{Path, PathBuf};

use crate::error::{Result, WardenError};

const ROOT_DIR_NAME: &str = ".warden";
const EVIDENCE_DIR_NAME: &str = "intruders";
/// Marker that keeps media scanners from indexing the evidence directory.
pub const NO_MEDIA_MARKER: &str = ".nomedia";

/// Central configuration for all Warden storage paths.
///
/// Production code uses `StorageConfig::from_home()` which points to `~/.warden/`.
/// Tests use `StorageConfig::with_root(temp_dir)` for isolation.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    root: PathBuf,
}

impl StorageConfig {
    pub fn from_home() -> Result<Self> {
        let home = dirs::home_dir().ok_or(WardenError::HomeDirNotFound)?;
        Ok(Self {
            root: home.join(ROOT_DIR_NAME),
        })
    }

    /// Creates a StorageConfig with a custom root directory.
    pub fn with_root(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Files
    // ─────────────────────────────────────────────────────────────────────────────

    /// Runtime tuning (TOML).
    pub fn config_file(&self) -> PathBuf {
        self.root.join("warden.toml")
    }

    /// Persisted user settings (protected apps, PIN, recipient, ...).
    pub fn settings_file(&self) -> PathBuf {
        self.root.join("settings.json")
    }

    /// Alert rate-limit window, persisted so restarts cannot reset it.
    pub fn limiter_file(&self) -> PathBuf {
        self.root.join("alert-limiter.json")
    }

    pub fn socket_path(&self) -> PathBuf {
        self.root.join("warden.sock")
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Directories
    // ─────────────────────────────────────────────────────────────────────────────

    /// App-private intruder evidence directory.
    pub fn evidence_dir(&self) -> PathBuf {
        self.root.join(EVIDENCE_DIR_NAME)
    }

    /// Daily hook logs.
    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    /// Ensures the root directory and standard subdirectories exist.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        fs_err::create_dir_all(&self.root)?;
        fs_err::create_dir_all(self.evidence_dir())?;
        let marker = self.evidence_dir().join(NO_MEDIA_MARKER);
        if !marker.exists() {
            fs_err::write(marker, b"")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_with_root_sets_custom_path() {
        let config = StorageConfig::with_root(PathBuf::from("/custom/path"));
        assert_eq!(config.root(), Path::new("/custom/path"));
        assert_eq!(
            config.settings_file(),
            PathBuf::from("/custom/path/settings.json")
        );
        assert_eq!(
            config.evidence_dir(),
            PathBuf::from("/custom/path/intruders")
        );
        assert_eq!(config.socket_path(), PathBuf::from("/custom/path/warden.sock"));
        assert_eq!(config.logs_dir(), PathBuf::from("/custom/path/logs"));
    }

    #[test]
    fn test_ensure_dirs_creates_private_evidence_dir() {
        let temp = TempDir::new().unwrap();
        let config = StorageConfig::with_root(temp.path().join(".warden"));

        config.ensure_dirs().unwrap();

        assert!(config.root().exists());
        assert!(config.evidence_dir().is_dir());
        assert!(config.evidence_dir().join(NO_MEDIA_MARKER).exists());
    }

    #[test]
    fn test_ensure_dirs_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let config = StorageConfig::with_root(temp.path().to_path_buf());

        config.ensure_dirs().unwrap();
        config.ensure_dirs().unwrap();

        assert!(config.evidence_dir().join(NO_MEDIA_MARKER).exists());
    }
}
