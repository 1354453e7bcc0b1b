//! Error types for warden-core operations.
//!
//! Collaborator adapters (SMS, location, upload, launcher) report failures as
//! plain `String`s; those are absorbed at the dispatcher and never become a
//! `WardenError`.

use std::path::PathBuf;

/// All errors that can occur in warden-core operations.
#[derive(Debug, thiserror::Error)]
pub enum WardenError {
    // ─────────────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Home directory not found")]
    HomeDirNotFound,

    #[error("Configuration file malformed: {path}: {details}")]
    ConfigMalformed { path: PathBuf, details: String },

    #[error("Settings write failed: {path}: {source}")]
    SettingsWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ─────────────────────────────────────────────────────────────────────
    // Evidence Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Evidence frame is empty")]
    EmptyEvidence,

    #[error("Evidence write failed: {path}: {source}")]
    EvidenceWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ─────────────────────────────────────────────────────────────────────
    // I/O Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON parsing error: {context}: {source}")]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Convenience type alias for Results using WardenError.
pub type Result<T> = std::result::Result<T, WardenError>;

impl From<WardenError> for String {
    fn from(err: WardenError) -> String {
        err.to_string()
    }
}
