//! Intruder evidence: the latest camera frame per challenge, and where it
//! goes once an alert fires.
//!
//! Frames arrive faster than they can be handled. Only the most recent one is
//! kept, and the background worker accepts one frame at a time; anything that
//! arrives while it is busy is dropped rather than queued.

use std::fmt::Display;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, SyncSender, TrySendError};
use std::sync::{Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use chrono::{DateTime, Local, TimeZone, Utc};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::error::{Result, WardenError};
use crate::verification::FaceLandmarks;

const EVIDENCE_PREFIX: &str = "Intrusion-";
const EVIDENCE_EXTENSION: &str = "jpg";

#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub captured_at: DateTime<Utc>,
    /// Encoded image; may be empty when the camera produced landmarks only.
    pub jpeg: Vec<u8>,
    pub landmarks: Option<FaceLandmarks>,
}

/// `Intrusion-yyyyMMdd_HHmmss.jpg` in the capture's local time.
pub fn evidence_file_name<Tz>(captured_at: &DateTime<Tz>) -> String
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    format!(
        "{EVIDENCE_PREFIX}{}.{EVIDENCE_EXTENSION}",
        captured_at.format("%Y%m%d_%H%M%S")
    )
}

// ─────────────────────────────────────────────────────────────────────────────
// Latest-frame slot
// ─────────────────────────────────────────────────────────────────────────────

/// Holds the most recent frame; older ones are overwritten.
#[derive(Default)]
pub struct FrameSlot {
    latest: Mutex<Option<Frame>>,
}

impl FrameSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn offer(&self, frame: Frame) {
        *self.lock_latest() = Some(frame);
    }

    pub fn take(&self) -> Option<Frame> {
        self.lock_latest().take()
    }

    pub fn discard(&self) {
        self.lock_latest().take();
    }

    pub fn has_frame(&self) -> bool {
        self.lock_latest().is_some()
    }

    fn lock_latest(&self) -> MutexGuard<'_, Option<Frame>> {
        match self.latest.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Persistence
// ─────────────────────────────────────────────────────────────────────────────

pub trait EvidenceStore: Send + Sync {
    fn persist(&self, frame: &Frame) -> Result<PathBuf>;
}

/// Writes evidence into the app-private intruder directory.
pub struct FsEvidenceStore {
    dir: PathBuf,
}

impl FsEvidenceStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn available_path(&self, captured_at: DateTime<Utc>) -> PathBuf {
        let name = evidence_file_name(&captured_at.with_timezone(&Local));
        let candidate = self.dir.join(&name);
        if !candidate.exists() {
            return candidate;
        }
        let stem = name.trim_end_matches(&format!(".{EVIDENCE_EXTENSION}"));
        (1..)
            .map(|suffix| self.dir.join(format!("{stem}-{suffix}.{EVIDENCE_EXTENSION}")))
            .find(|path| !path.exists())
            .unwrap_or(candidate)
    }
}

impl EvidenceStore for FsEvidenceStore {
    fn persist(&self, frame: &Frame) -> Result<PathBuf> {
        if frame.jpeg.is_empty() {
            return Err(WardenError::EmptyEvidence);
        }
        fs_err::create_dir_all(&self.dir).map_err(|source| WardenError::EvidenceWriteFailed {
            path: self.dir.clone(),
            source,
        })?;

        let path = self.available_path(frame.captured_at);
        let write_failed = |source| WardenError::EvidenceWriteFailed {
            path: path.clone(),
            source,
        };
        let mut temp_file = NamedTempFile::new_in(&self.dir).map_err(write_failed)?;
        temp_file
            .write_all(&frame.jpeg)
            .and_then(|_| temp_file.flush())
            .map_err(write_failed)?;
        temp_file
            .persist(&path)
            .map_err(|err| write_failed(err.error))?;

        info!(path = %path.display(), bytes = frame.jpeg.len(), "Intruder evidence saved");
        Ok(path)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Frame worker
// ─────────────────────────────────────────────────────────────────────────────

/// Single background worker with room for exactly one pending item.
pub struct FrameWorker<T: Send + 'static> {
    sender: Option<SyncSender<T>>,
    handle: Option<JoinHandle<()>>,
    dropped: AtomicU64,
}

impl<T: Send + 'static> FrameWorker<T> {
    pub fn spawn<F>(name: &str, mut handler: F) -> std::io::Result<Self>
    where
        F: FnMut(T) + Send + 'static,
    {
        let (sender, receiver) = mpsc::sync_channel::<T>(1);
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                for item in receiver {
                    handler(item);
                }
                debug!("Frame worker stopped");
            })?;
        Ok(Self {
            sender: Some(sender),
            handle: Some(handle),
            dropped: AtomicU64::new(0),
        })
    }

    /// Hands `item` to the worker. Returns false when it was dropped.
    pub fn submit(&self, item: T) -> bool {
        let Some(sender) = self.sender.as_ref() else {
            return false;
        };
        match sender.try_send(item) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                warn!("Frame worker is gone; dropping frame");
                false
            }
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl<T: Send + 'static> Drop for FrameWorker<T> {
    fn drop(&mut self) {
        self.sender.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::FixedOffset;
    use std::sync::mpsc::channel;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::tempdir;

    fn frame(bytes: &[u8]) -> Frame {
        Frame {
            captured_at: Utc::now(),
            jpeg: bytes.to_vec(),
            landmarks: None,
        }
    }

    #[test]
    fn file_name_uses_capture_timestamp() {
        let offset = FixedOffset::east_opt(5 * 3600 + 1800).expect("offset");
        let at = offset
            .with_ymd_and_hms(2026, 3, 1, 9, 5, 7)
            .single()
            .expect("timestamp");
        assert_eq!(evidence_file_name(&at), "Intrusion-20260301_090507.jpg");
    }

    #[test]
    fn slot_keeps_only_latest_frame() {
        let slot = FrameSlot::new();
        slot.offer(frame(b"one"));
        slot.offer(frame(b"two"));
        assert_eq!(slot.take().expect("frame").jpeg, b"two");
        assert!(slot.take().is_none());
    }

    #[test]
    fn discard_empties_slot() {
        let slot = FrameSlot::new();
        slot.offer(frame(b"one"));
        slot.discard();
        assert!(!slot.has_frame());
    }

    #[test]
    fn persist_writes_into_evidence_dir() {
        let temp = tempdir().unwrap();
        let store = FsEvidenceStore::new(temp.path().join("intruders"));

        let path = store.persist(&frame(b"\xff\xd8jpeg")).unwrap();
        assert!(path.starts_with(store.dir()));
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("Intrusion-"));
        assert!(name.ends_with(".jpg"));
        assert_eq!(fs_err::read(&path).unwrap(), b"\xff\xd8jpeg");
    }

    #[test]
    fn persist_never_overwrites_same_second_capture() {
        let temp = tempdir().unwrap();
        let store = FsEvidenceStore::new(temp.path().to_path_buf());
        let first = frame(b"first");
        let second = Frame {
            jpeg: b"second".to_vec(),
            ..first.clone()
        };

        let first_path = store.persist(&first).unwrap();
        let second_path = store.persist(&second).unwrap();
        assert_ne!(first_path, second_path);
        assert_eq!(fs_err::read(&first_path).unwrap(), b"first");
    }

    #[test]
    fn persist_rejects_empty_frame() {
        let temp = tempdir().unwrap();
        let store = FsEvidenceStore::new(temp.path().to_path_buf());
        assert!(matches!(
            store.persist(&frame(b"")),
            Err(WardenError::EmptyEvidence)
        ));
    }

    #[test]
    fn worker_drops_items_while_busy() {
        let (gate_tx, gate_rx) = channel::<()>();
        let (seen_tx, seen_rx) = channel::<u32>();
        let gate_rx = Arc::new(Mutex::new(gate_rx));

        let worker = FrameWorker::spawn("test-frames", move |item: u32| {
            seen_tx.send(item).unwrap();
            let _ = gate_rx.lock().unwrap().recv();
        })
        .unwrap();

        assert!(worker.submit(1));
        // Wait until the worker holds item 1, so the slot is free for exactly one more.
        assert_eq!(seen_rx.recv_timeout(Duration::from_secs(2)).unwrap(), 1);
        assert!(worker.submit(2));
        assert!(!worker.submit(3));
        assert_eq!(worker.dropped(), 1);

        gate_tx.send(()).unwrap();
        assert_eq!(seen_rx.recv_timeout(Duration::from_secs(2)).unwrap(), 2);
        gate_tx.send(()).unwrap();
        drop(worker);
    }
}
