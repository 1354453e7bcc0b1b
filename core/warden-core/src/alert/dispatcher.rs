//! Breach alert dispatch.
//!
//! Order per alert: rate check, location, evidence link, compose, normalize
//! recipient, transmit. Location and upload each run on their own thread with
//! a deadline; a miss falls back to the placeholder text. Every failure is
//! logged and absorbed here so the challenge never sees one.

use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Local, Utc};
use tracing::{debug, info, warn};

use super::limiter::RateLimiter;
use super::message::{compose_message, normalize_recipient, split_parts, AlertEvent};
use crate::config::AlertConfig;
use crate::settings::SettingsStore;

pub trait LocationProvider: Send + Sync {
    /// A map link for the device's current position.
    fn locate(&self) -> Result<String, String>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReceipt {
    pub link: String,
    /// Remote folder the file landed in, cached for the next upload.
    pub folder_id: Option<String>,
}

pub trait EvidenceUploader: Send + Sync {
    fn upload(&self, path: &Path, folder_id: Option<&str>) -> Result<UploadReceipt, String>;
}

pub trait SmsTransport: Send + Sync {
    fn send(&self, to: &str, parts: &[String]) -> Result<(), String>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertRequest {
    pub event: AlertEvent,
    /// Persisted intruder frame, if one was captured.
    pub evidence: Option<PathBuf>,
}

/// Where a challenge hands its single alert.
pub trait AlertSink: Send + Sync {
    fn submit(&self, request: AlertRequest);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchReport {
    Sent { recipient: String, parts: usize },
    Suppressed,
    /// No usable recipient configured.
    Disabled,
    TransportFailed(String),
}

pub struct AlertDispatcher {
    config: AlertConfig,
    part_chars: usize,
    settings: Arc<SettingsStore>,
    limiter: Mutex<RateLimiter>,
    location: Arc<dyn LocationProvider>,
    uploader: Arc<dyn EvidenceUploader>,
    transport: Arc<dyn SmsTransport>,
}

impl AlertDispatcher {
    pub fn new(
        config: AlertConfig,
        part_chars: usize,
        settings: Arc<SettingsStore>,
        limiter: RateLimiter,
        location: Arc<dyn LocationProvider>,
        uploader: Arc<dyn EvidenceUploader>,
        transport: Arc<dyn SmsTransport>,
    ) -> Self {
        Self {
            config,
            part_chars,
            settings,
            limiter: Mutex::new(limiter),
            location,
            uploader,
            transport,
        }
    }

    pub fn dispatch(&self, request: &AlertRequest, now: DateTime<Utc>) -> DispatchReport {
        let settings = self.settings.snapshot();
        let Some(recipient) = settings
            .recipient()
            .and_then(|number| normalize_recipient(number, &self.config.default_country_code))
        else {
            warn!(
                challenge_id = request.event.challenge_id,
                "No trusted number configured; alert not sent"
            );
            return DispatchReport::Disabled;
        };

        if !self.lock_limiter().try_acquire(now) {
            warn!(
                challenge_id = request.event.challenge_id,
                "Alert rate limit reached; suppressing"
            );
            return DispatchReport::Suppressed;
        }

        let location = self.resolve_location();
        let link = request
            .evidence
            .as_ref()
            .and_then(|path| self.resolve_evidence_link(path, settings.drive_folder_id.clone()));

        let body = compose_message(&request.event, location.as_deref(), link.as_deref(), &Local);
        let parts = split_parts(&body, self.part_chars);

        match self.transport.send(&recipient, &parts) {
            Ok(()) => {
                info!(
                    challenge_id = request.event.challenge_id,
                    breach = %request.event.kind,
                    parts = parts.len(),
                    "Breach alert sent"
                );
                DispatchReport::Sent {
                    recipient,
                    parts: parts.len(),
                }
            }
            Err(err) => {
                self.lock_limiter().release();
                warn!(
                    challenge_id = request.event.challenge_id,
                    error = %err,
                    "Failed to deliver breach alert"
                );
                DispatchReport::TransportFailed(err)
            }
        }
    }

    fn resolve_location(&self) -> Option<String> {
        let location = self.location.clone();
        run_with_deadline("location", self.config.location_timeout(), move || {
            location.locate()
        })
    }

    fn resolve_evidence_link(&self, path: &Path, folder_id: Option<String>) -> Option<String> {
        let uploader = self.uploader.clone();
        let path = path.to_path_buf();
        let receipt = run_with_deadline("upload", self.config.upload_timeout(), move || {
            uploader.upload(&path, folder_id.as_deref())
        })?;

        if let Some(folder_id) = receipt.folder_id.filter(|id| !id.is_empty()) {
            self.remember_folder(folder_id);
        }
        Some(receipt.link)
    }

    fn remember_folder(&self, folder_id: String) {
        if self.settings.snapshot().drive_folder_id.as_deref() == Some(folder_id.as_str()) {
            return;
        }
        if let Err(err) = self.settings.update(|settings| {
            settings.drive_folder_id = Some(folder_id);
        }) {
            warn!(error = %err, "Failed to cache evidence folder id");
        }
    }

    fn lock_limiter(&self) -> MutexGuard<'_, RateLimiter> {
        match self.limiter.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl AlertSink for AlertDispatcher {
    fn submit(&self, request: AlertRequest) {
        self.dispatch(&request, Utc::now());
    }
}

/// Runs each dispatch on its own thread so the caller returns immediately.
pub struct BackgroundAlertSink {
    dispatcher: Arc<AlertDispatcher>,
}

impl BackgroundAlertSink {
    pub fn new(dispatcher: Arc<AlertDispatcher>) -> Self {
        Self { dispatcher }
    }
}

impl AlertSink for BackgroundAlertSink {
    fn submit(&self, request: AlertRequest) {
        let dispatcher = self.dispatcher.clone();
        let spawned = thread::Builder::new()
            .name("warden-alert".to_string())
            .spawn(move || {
                dispatcher.dispatch(&request, Utc::now());
            });
        if let Err(err) = spawned {
            warn!(error = %err, "Failed to start alert dispatch");
        }
    }
}

/// Runs `work` on a helper thread; `None` on error or when `timeout` passes first.
fn run_with_deadline<T, F>(label: &'static str, timeout: StdDuration, work: F) -> Option<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, String> + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    let spawned = thread::Builder::new()
        .name(format!("warden-{label}"))
        .spawn(move || {
            let _ = tx.send(work());
        });
    if let Err(err) = spawned {
        warn!(collaborator = label, error = %err, "Failed to start collaborator");
        return None;
    }

    match rx.recv_timeout(timeout) {
        Ok(Ok(value)) => Some(value),
        Ok(Err(err)) => {
            warn!(collaborator = label, error = %err, "Collaborator failed; using placeholder");
            None
        }
        Err(_) => {
            debug!(
                collaborator = label,
                timeout_ms = timeout.as_millis() as u64,
                "Collaborator timed out; using placeholder"
            );
            None
        }
    }
}
