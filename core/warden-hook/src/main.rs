//! warden-hook: CLI bridge between platform callbacks and the warden daemon.
//!
//! Each invocation forwards one event and prints the daemon's answer as JSON
//! on stdout, so shell glue can act on it (abort a call, dismiss the lock
//! surface, show the denial text).
//!
//! ## Subcommands
//!
//! - `foreground`: Report the app now in front
//! - `dial`: Report an outgoing call; prints whether to abort it
//! - `biometric` / `fallback` / `pin` / `frame`: Lock surface inputs
//! - `enroll`: Store the owner's face template from one frame
//! - `health` / `status`: Query the daemon

mod daemon_client;
mod logging;

use clap::{Parser, Subcommand, ValueEnum};
use std::io::Read;
use std::path::PathBuf;
use warden_protocol::{AuthResult, EventEnvelope, EventType, LandmarksPayload};

#[derive(Parser)]
#[command(name = "warden-hook")]
#[command(about = "Forwards platform events to the warden daemon")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Report a foreground app change
    Foreground {
        /// Package id of the app now in front
        #[arg(long)]
        package: String,

        /// Human-readable app label
        #[arg(long)]
        name: Option<String>,
    },

    /// Report an outgoing call (prints whether to abort it)
    Dial {
        #[arg(value_name = "NUMBER")]
        number: String,
    },

    /// Report the outcome of a platform authentication prompt
    Biometric {
        #[arg(long)]
        challenge: u64,

        #[arg(value_enum)]
        result: AuthArg,
    },

    /// Ask for the PIN pad instead of scanning
    Fallback {
        #[arg(long)]
        challenge: u64,
    },

    /// Submit a PIN (read from stdin so it never shows up in argv)
    Pin {
        #[arg(long)]
        challenge: u64,
    },

    /// Hand a captured camera frame to the active challenge
    Frame {
        #[arg(long)]
        challenge: u64,

        /// Encoded JPEG written by the camera callback
        #[arg(long)]
        path: Option<PathBuf>,

        /// Face landmarks as JSON; omit when no face was detected
        #[arg(long)]
        landmarks: Option<String>,
    },

    /// Enroll the owner's face from one frame's landmarks (JSON)
    Enroll {
        #[arg(long)]
        landmarks: String,
    },

    /// Check that the daemon is up
    Health,

    /// Print the daemon's guard and challenge status
    Status,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum AuthArg {
    Succeeded,
    Failed,
    NegativeButton,
    UserCanceled,
    HardwareUnavailable,
    NotEnrolled,
    Error,
    CredentialConfirmed,
    CredentialRejected,
}

impl From<AuthArg> for AuthResult {
    fn from(value: AuthArg) -> Self {
        match value {
            AuthArg::Succeeded => AuthResult::Succeeded,
            AuthArg::Failed => AuthResult::Failed,
            AuthArg::NegativeButton => AuthResult::NegativeButton,
            AuthArg::UserCanceled => AuthResult::UserCanceled,
            AuthArg::HardwareUnavailable => AuthResult::HardwareUnavailable,
            AuthArg::NotEnrolled => AuthResult::NotEnrolled,
            AuthArg::Error => AuthResult::Error,
            AuthArg::CredentialConfirmed => AuthResult::CredentialConfirmed,
            AuthArg::CredentialRejected => AuthResult::CredentialRejected,
        }
    }
}

fn main() {
    let _logging_guard = logging::init();
    let cli = Cli::parse();

    match run(cli.command) {
        Ok(output) => println!("{}", output),
        Err(e) => {
            tracing::error!(error = %e, "warden-hook failed");
            eprintln!("warden-hook: {}", e);
            std::process::exit(1);
        }
    }
}

fn run(command: Commands) -> Result<serde_json::Value, String> {
    let event = match command {
        Commands::Health => return daemon_client::daemon_health(),
        Commands::Status => {
            let status = daemon_client::daemon_status()?;
            return serde_json::to_value(status).map_err(|err| err.to_string());
        }
        other => build_event(other)?,
    };

    let outcome = daemon_client::send_event(event)?;
    serde_json::to_value(outcome).map_err(|err| err.to_string())
}

fn build_event(command: Commands) -> Result<EventEnvelope, String> {
    let event = match command {
        Commands::Foreground { package, name } => {
            let mut event = daemon_client::new_event(EventType::ForegroundChanged);
            event.package = Some(package);
            event.display_name = name;
            event
        }
        Commands::Dial { number } => {
            let mut event = daemon_client::new_event(EventType::DialObserved);
            event.dialed = Some(number);
            event
        }
        Commands::Biometric { challenge, result } => {
            let mut event = daemon_client::new_event(EventType::BiometricResult);
            event.challenge_id = Some(challenge);
            event.auth_result = Some(result.into());
            event
        }
        Commands::Fallback { challenge } => {
            let mut event = daemon_client::new_event(EventType::FallbackRequested);
            event.challenge_id = Some(challenge);
            event
        }
        Commands::Pin { challenge } => {
            let mut event = daemon_client::new_event(EventType::PinSubmitted);
            event.challenge_id = Some(challenge);
            event.pin = Some(read_pin(std::io::stdin())?);
            event
        }
        Commands::Frame {
            challenge,
            path,
            landmarks,
        } => {
            let mut event = daemon_client::new_event(EventType::FrameCaptured);
            event.challenge_id = Some(challenge);
            event.frame_path = path.map(|path| path.to_string_lossy().into_owned());
            event.landmarks = landmarks.as_deref().map(parse_landmarks).transpose()?;
            event
        }
        Commands::Enroll { landmarks } => {
            let mut event = daemon_client::new_event(EventType::FaceEnrolled);
            event.landmarks = Some(parse_landmarks(&landmarks)?);
            event
        }
        Commands::Health | Commands::Status => {
            return Err("query commands carry no event".to_string())
        }
    };
    Ok(event)
}

fn read_pin<R: Read>(mut input: R) -> Result<String, String> {
    let mut raw = String::new();
    input
        .read_to_string(&mut raw)
        .map_err(|err| format!("Failed to read PIN from stdin: {}", err))?;
    let pin = raw.trim();
    if pin.is_empty() {
        return Err("PIN was empty".to_string());
    }
    Ok(pin.to_string())
}

fn parse_landmarks(raw: &str) -> Result<LandmarksPayload, String> {
    serde_json::from_str(raw).map_err(|err| format!("Invalid landmarks JSON: {}", err))
}
