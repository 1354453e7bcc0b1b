//! Launch requests for the two user-facing surfaces: the lock challenge and
//! the hidden entry screen.

use std::sync::mpsc::{self, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread;

use tracing::{debug, warn};

/// Task flags a surface launch carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchFlag {
    NewTask,
    SingleTop,
    ClearTop,
    ClearTask,
    NoUserAction,
}

impl LaunchFlag {
    /// Activity-manager switch for this flag.
    pub fn am_switch(self) -> &'static str {
        match self {
            LaunchFlag::NewTask => "--activity-new-task",
            LaunchFlag::SingleTop => "--activity-single-top",
            LaunchFlag::ClearTop => "--activity-clear-top",
            LaunchFlag::ClearTask => "--activity-clear-task",
            LaunchFlag::NoUserAction => "--activity-no-user-action",
        }
    }
}

/// Lock surface: on top of everything, reused if already showing.
pub const LOCK_SURFACE_FLAGS: &[LaunchFlag] = &[
    LaunchFlag::NewTask,
    LaunchFlag::SingleTop,
    LaunchFlag::ClearTop,
    LaunchFlag::NoUserAction,
];

/// Entry surface: a fresh task with nothing behind it.
pub const ENTRY_SURFACE_FLAGS: &[LaunchFlag] = &[LaunchFlag::NewTask, LaunchFlag::ClearTask];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SurfaceRequest {
    Lock {
        challenge_id: u64,
        package: String,
        display_name: String,
    },
    Entry,
}

impl SurfaceRequest {
    pub fn flags(&self) -> &'static [LaunchFlag] {
        match self {
            SurfaceRequest::Lock { .. } => LOCK_SURFACE_FLAGS,
            SurfaceRequest::Entry => ENTRY_SURFACE_FLAGS,
        }
    }
}

pub trait SurfaceLauncher: Send + Sync {
    fn launch(&self, request: &SurfaceRequest) -> Result<(), String>;
}

/// Runs launches on one worker thread so a slow or hung launch never holds
/// up the caller. A request that finds the queue full is refused.
pub struct BackgroundLauncher {
    sender: SyncSender<SurfaceRequest>,
}

impl BackgroundLauncher {
    pub fn spawn(inner: Arc<dyn SurfaceLauncher>, queue: usize) -> std::io::Result<Self> {
        let (sender, receiver) = mpsc::sync_channel::<SurfaceRequest>(queue.max(1));
        thread::Builder::new()
            .name("warden-surface".to_string())
            .spawn(move || {
                for request in receiver {
                    if let Err(err) = inner.launch(&request) {
                        warn!(request = ?request, error = %err, "Surface launch failed");
                    }
                }
                debug!("Surface worker stopped");
            })?;
        Ok(Self { sender })
    }
}

impl SurfaceLauncher for BackgroundLauncher {
    fn launch(&self, request: &SurfaceRequest) -> Result<(), String> {
        match self.sender.try_send(request.clone()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                Err("surface worker busy; launch dropped".to_string())
            }
            Err(TrySendError::Disconnected(_)) => Err("surface worker stopped".to_string()),
        }
    }
}
