//! File logging for the hook.
//!
//! The hook runs once per platform event with stdout reserved for the daemon's
//! answer, so logs go to a daily file under `~/.warden/logs/`.

use std::env;
use std::path::PathBuf;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use warden_core::StorageConfig;

const LOG_FILE_PREFIX: &str = "warden-hook.log";

/// Keep the returned guard alive until exit or buffered lines are lost.
pub fn init() -> Option<WorkerGuard> {
    let dir = log_dir()?;
    if fs_err::create_dir_all(&dir).is_err() {
        return None;
    }

    let appender = tracing_appender::rolling::daily(&dir, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let filter = EnvFilter::try_from_env("WARDEN_HOOK_LOG")
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .try_init()
        .ok()?;
    Some(guard)
}

fn log_dir() -> Option<PathBuf> {
    if let Ok(dir) = env::var("WARDEN_LOG_DIR") {
        return Some(PathBuf::from(dir));
    }
    StorageConfig::from_home()
        .ok()
        .map(|storage| storage.logs_dir())
}
