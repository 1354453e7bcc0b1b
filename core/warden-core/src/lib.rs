//! # warden-core
//!
//! App-lock security monitor: the foreground guard, the lock challenge state
//! machine and the rate-limited breach alert pipeline.
//!
//! ## Design Principles
//!
//! - **Synchronous**: No async runtime dependency. Timers and slow
//!   collaborators run on plain threads.
//! - **One decision loop**: [`Warden::handle`] is the only entry point that
//!   mutates guard and challenge state; callers serialize access to it.
//! - **Fail closed on a raised challenge**: collaborator failures degrade the
//!   alert, never the lock.
//! - **Explicit time**: every decision takes `now` so tests never sleep.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use warden_core::{Warden, WardenInput};
//!
//! let mut warden = Warden::new(&config, settings, collaborators, first_id);
//! let reply = warden.handle(WardenInput::Tick, chrono::Utc::now());
//! ```

pub mod alert;
pub mod challenge;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod evidence;
pub mod foreground;
pub mod guard;
pub mod session;
pub mod settings;
pub mod stealth;
pub mod storage;
pub mod surface;
pub mod verification;
pub mod warden;

// Re-export commonly used items at crate root
pub use alert::{AlertDispatcher, AlertEvent, AlertRequest, AlertSink, BreachKind, RateLimiter};
pub use challenge::{ChallengeInput, ChallengeState, ChallengeUpdate, LockChallenge};
pub use config::{load_runtime_config, WardenConfig};
pub use coordinator::{ChallengeCoordinator, InputOutcome, ThreadWatchdog, WatchdogTimer};
pub use error::{Result, WardenError};
pub use evidence::{EvidenceStore, Frame, FrameWorker, FsEvidenceStore};
pub use foreground::{ForegroundEvent, ForegroundHistory, ForegroundSource};
pub use guard::{ForegroundGuard, TickOutcome};
pub use session::{Session, SessionStore};
pub use settings::{SecuritySettings, SettingsStore, SetupGap};
pub use stealth::{DialDecision, StealthMatcher};
pub use storage::StorageConfig;
pub use surface::{BackgroundLauncher, LaunchFlag, SurfaceLauncher, SurfaceRequest};
pub use verification::{FaceLandmarks, HardwareProfile, Verdict, VerificationStrategy};
pub use warden::{Collaborators, Warden, WardenInput, WardenReply};
