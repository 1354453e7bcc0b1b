//! Warden daemon entrypoint.
//!
//! A single-writer service that owns the foreground guard, the active lock
//! challenge and the alert pipeline. Platform clients (foreground reporter,
//! dialer hook, lock surface) talk to it over a Unix socket with one JSON
//! request per line.

use fs_err as fs;
use std::env;
use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use warden_core::alert::{AlertDispatcher, BackgroundAlertSink, RateLimiter};
use warden_core::challenge::ChallengeState;
use warden_core::{
    load_runtime_config, BackgroundLauncher, ChallengeInput, ChallengeUpdate, Collaborators,
    DialDecision, FaceLandmarks, ForegroundEvent, Frame, FrameWorker, FsEvidenceStore,
    InputOutcome, SettingsStore, StorageConfig, ThreadWatchdog, Warden, WardenConfig, WardenInput,
    WardenReply,
};
use warden_protocol::{
    parse_event, AuthResult, ErrorInfo, EventEnvelope, EventOutcome, EventType, Method, Request,
    Response, MAX_REQUEST_BYTES, PROTOCOL_VERSION,
};

mod actor;
mod platform;

use actor::ActorHandle;
use platform::{
    CommandLocationProvider, CommandRunner, CommandSmsTransport, CommandSurfaceLauncher,
    CommandTemplate, CommandUploader, ProcessRunner,
};
use warden_core::verification::Sample;

const READ_TIMEOUT_SECS: u64 = 2;
const READ_CHUNK_SIZE: usize = 4096;
const CALL_TIMEOUT_SECS: u64 = 2;
/// Surface launches allowed to wait behind a slow one.
const LAUNCH_QUEUE: usize = 4;

/// A captured frame on its way from the socket to the decision loop.
struct PendingFrame {
    challenge_id: Option<u64>,
    captured_at: DateTime<Utc>,
    path: Option<PathBuf>,
    landmarks: Option<FaceLandmarks>,
}

struct DaemonState {
    actor: ActorHandle,
    frames: FrameWorker<PendingFrame>,
}

fn main() {
    init_logging();

    let storage = match StorageConfig::from_home() {
        Ok(storage) => storage,
        Err(err) => {
            error!(error = %err, "Failed to resolve warden storage root");
            std::process::exit(1);
        }
    };

    if let Err(err) = storage.ensure_dirs() {
        error!(error = %err, path = %storage.root().display(), "Failed to prepare warden directories");
        std::process::exit(1);
    }

    let config = match load_runtime_config(&storage.config_file()) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %err, "Failed to load warden.toml; using defaults");
            WardenConfig::default()
        }
    };

    let settings = Arc::new(SettingsStore::load(&storage.settings_file()));
    for gap in settings.snapshot().setup_gaps() {
        warn!(gap = ?gap, "Setup incomplete");
    }

    let socket_path = storage.socket_path();

    if let Err(err) = prepare_socket_dir(&socket_path) {
        error!(error = %err, "Failed to prepare daemon socket directory");
        std::process::exit(1);
    }

    if let Err(err) = remove_existing_socket(&socket_path) {
        error!(error = %err, path = %socket_path.display(), "Failed to remove existing socket");
        std::process::exit(1);
    }

    let listener = match UnixListener::bind(&socket_path) {
        Ok(listener) => listener,
        Err(err) => {
            error!(error = %err, path = %socket_path.display(), "Failed to bind daemon socket");
            std::process::exit(1);
        }
    };

    let (actor, receiver) = actor::channel();
    let warden = match build_warden(&config, &storage, settings, actor.clone()) {
        Ok(warden) => warden,
        Err(err) => {
            error!(error = %err, "Failed to start surface worker");
            std::process::exit(1);
        }
    };
    if let Err(err) = actor::spawn(warden, receiver, config.guard.tick()) {
        error!(error = %err, "Failed to start decision loop");
        std::process::exit(1);
    }

    let frame_actor = actor.clone();
    let frames = match FrameWorker::spawn("warden-frames", move |pending: PendingFrame| {
        forward_frame(&frame_actor, pending)
    }) {
        Ok(worker) => worker,
        Err(err) => {
            error!(error = %err, "Failed to start frame worker");
            std::process::exit(1);
        }
    };

    info!(
        path = %socket_path.display(),
        protected_apps = protected_app_count(&actor),
        "Warden daemon started"
    );

    let shared_state = Arc::new(DaemonState { actor, frames });
    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let state = Arc::clone(&shared_state);
                thread::spawn(|| handle_connection(stream, state));
            }
            Err(err) => {
                warn!(error = %err, "Failed to accept daemon connection");
            }
        }
    }
}

fn init_logging() {
    let debug_enabled = env::var("WARDEN_DEBUG_LOG")
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    let filter = if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn build_warden(
    config: &WardenConfig,
    storage: &StorageConfig,
    settings: Arc<SettingsStore>,
    actor: ActorHandle,
) -> std::io::Result<Warden> {
    let platform = &config.platform;
    let runner: Arc<dyn CommandRunner> = Arc::new(ProcessRunner);

    let launcher = BackgroundLauncher::spawn(
        Arc::new(CommandSurfaceLauncher::new(
            CommandTemplate::new(platform.lock_surface_command.clone()),
            CommandTemplate::new(platform.entry_surface_command.clone()),
            runner.clone(),
        )),
        LAUNCH_QUEUE,
    )?;
    let dispatcher = Arc::new(AlertDispatcher::new(
        config.alert.clone(),
        platform.sms_part_chars,
        settings.clone(),
        RateLimiter::persistent(
            &storage.limiter_file(),
            config.alert.window(),
            config.alert.max_messages,
        ),
        Arc::new(CommandLocationProvider::new(
            CommandTemplate::new(platform.location_command.clone()),
            runner.clone(),
        )),
        Arc::new(CommandUploader::new(
            CommandTemplate::new(platform.upload_command.clone()),
            runner.clone(),
        )),
        Arc::new(CommandSmsTransport::new(
            CommandTemplate::new(platform.sms_command.clone()),
            runner,
        )),
    ));
    let watchdog = ThreadWatchdog::new(move |challenge_id| {
        actor.post(WardenInput::WatchdogFired(challenge_id));
    });

    // Seeded from the clock so ids held by clients across a restart stay stale.
    let first_challenge_id = Utc::now().timestamp_millis().max(1) as u64;

    Ok(Warden::new(
        config,
        settings,
        Collaborators {
            launcher: Arc::new(launcher),
            evidence: Arc::new(FsEvidenceStore::new(storage.evidence_dir())),
            alerts: Arc::new(BackgroundAlertSink::new(dispatcher)),
            watchdog: Arc::new(watchdog),
        },
        first_challenge_id,
    ))
}

fn protected_app_count(actor: &ActorHandle) -> usize {
    actor
        .status(Duration::from_secs(CALL_TIMEOUT_SECS))
        .map(|status| status.protected_apps)
        .unwrap_or(0)
}

fn forward_frame(actor: &ActorHandle, pending: PendingFrame) {
    let jpeg = match pending.path.as_deref() {
        Some(path) => match fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(error = %err, "Failed to read captured frame; using landmarks only");
                Vec::new()
            }
        },
        None => Vec::new(),
    };
    actor.post(WardenInput::Challenge {
        challenge_id: pending.challenge_id,
        input: ChallengeInput::Frame(Frame {
            captured_at: pending.captured_at,
            jpeg,
            landmarks: pending.landmarks,
        }),
    });
}

fn prepare_socket_dir(socket_path: &Path) -> Result<(), String> {
    let parent = socket_path
        .parent()
        .ok_or_else(|| "Socket path has no parent".to_string())?;
    fs::create_dir_all(parent).map_err(|err| format!("Failed to create socket directory: {}", err))
}

fn remove_existing_socket(socket_path: &Path) -> Result<(), String> {
    if socket_path.exists() {
        fs::remove_file(socket_path)
            .map_err(|err| format!("Failed to remove existing socket: {}", err))?;
    }
    Ok(())
}

fn handle_connection(mut stream: UnixStream, state: Arc<DaemonState>) {
    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            warn!(code = %err.code, message = %err.message, "Failed to read request");
            let response = Response::error_with_info(None, err);
            let _ = write_response(&mut stream, response);
            return;
        }
    };

    tracing::debug!(method = ?request.method, id = ?request.id, "Daemon request received");
    let response = handle_request(request, &state);
    let _ = write_response(&mut stream, response);
}

fn read_request(stream: &mut UnixStream) -> Result<Request, ErrorInfo> {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(READ_TIMEOUT_SECS)));

    let mut buffer = Vec::new();
    let mut chunk = [0u8; READ_CHUNK_SIZE];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > MAX_REQUEST_BYTES {
                    return Err(ErrorInfo::new(
                        "request_too_large",
                        "request exceeded maximum size",
                    ));
                }
                if chunk[..n].contains(&b'\n') {
                    break;
                }
            }
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                return Err(ErrorInfo::new("read_timeout", "request timed out"));
            }
            Err(err) => {
                return Err(ErrorInfo::new(
                    "read_error",
                    format!("failed to read request: {}", err),
                ));
            }
        }
    }

    if buffer.is_empty() {
        return Err(ErrorInfo::new("empty_request", "request body was empty"));
    }

    let newline_index = buffer.iter().position(|b| *b == b'\n');
    let request_bytes = match newline_index {
        Some(index) => {
            if buffer.len() > index + 1 {
                let trailing = &buffer[index + 1..];
                if trailing.iter().any(|b| !b.is_ascii_whitespace()) {
                    warn!("Extra bytes detected after newline; ignoring trailing data");
                }
            }
            &buffer[..index]
        }
        None => buffer.as_slice(),
    };

    if request_bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(ErrorInfo::new("empty_request", "request body was empty"));
    }

    serde_json::from_slice(request_bytes).map_err(|err| {
        ErrorInfo::new(
            "invalid_json",
            format!("request was not valid JSON: {}", err),
        )
    })
}

fn handle_request(request: Request, state: &DaemonState) -> Response {
    if request.protocol_version != PROTOCOL_VERSION {
        return Response::error(
            request.id,
            "protocol_mismatch",
            "unsupported protocol version",
        );
    }

    match request.method {
        Method::GetHealth => Response::ok(
            request.id,
            serde_json::json!({
                "status": "ok",
                "pid": std::process::id(),
                "version": env!("CARGO_PKG_VERSION"),
                "protocol_version": PROTOCOL_VERSION,
                "frames_dropped": state.frames.dropped(),
            }),
        ),
        Method::GetStatus => match state
            .actor
            .status(Duration::from_secs(CALL_TIMEOUT_SECS))
        {
            Ok(snapshot) => match serde_json::to_value(snapshot) {
                Ok(value) => Response::ok(request.id, value),
                Err(err) => Response::error(
                    request.id,
                    "serialization_error",
                    format!("Failed to serialize status: {}", err),
                ),
            },
            Err(err) => Response::error(request.id, "status_error", err),
        },
        Method::Event => handle_event(request, state),
    }
}

fn handle_event(request: Request, state: &DaemonState) -> Response {
    let params = match request.params {
        Some(params) => params,
        None => return Response::error(request.id, "invalid_params", "event payload is required"),
    };

    let event = match parse_event(params) {
        Ok(event) => event,
        Err(err) => return Response::error_with_info(request.id, err),
    };

    // PINs and dialed digits stay out of the log.
    info!(
        event_type = ?event.event_type,
        package = ?event.package,
        challenge_id = ?event.challenge_id,
        "Received event"
    );

    let now = Utc::now();
    let outcome = match event.event_type {
        EventType::FrameCaptured => {
            let accepted = state.frames.submit(pending_frame(&event, now));
            Ok(EventOutcome {
                accepted,
                challenge_id: event.challenge_id,
                ..EventOutcome::default()
            })
        }
        _ => match warden_input(event, now) {
            Some(input) => state
                .actor
                .call(input, Duration::from_secs(CALL_TIMEOUT_SECS))
                .map(event_outcome),
            None => Err("event is missing its payload".to_string()),
        },
    };

    match outcome {
        Ok(outcome) => match serde_json::to_value(outcome) {
            Ok(value) => Response::ok(request.id, value),
            Err(err) => Response::error(
                request.id,
                "serialization_error",
                format!("Failed to serialize event outcome: {}", err),
            ),
        },
        Err(err) => Response::error(request.id, "event_error", err),
    }
}

/// Timestamps from clients are never trusted to be in the future.
fn observed_at(event: &EventEnvelope, now: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&event.recorded_at)
        .map(|value| value.with_timezone(&Utc).min(now))
        .unwrap_or(now)
}

fn pending_frame(event: &EventEnvelope, now: DateTime<Utc>) -> PendingFrame {
    PendingFrame {
        challenge_id: event.challenge_id,
        captured_at: observed_at(event, now),
        path: event
            .frame_path
            .as_deref()
            .filter(|path| !path.trim().is_empty())
            .map(PathBuf::from),
        landmarks: event.landmarks.as_ref().map(FaceLandmarks::from),
    }
}

fn warden_input(event: EventEnvelope, now: DateTime<Utc>) -> Option<WardenInput> {
    let challenge = |input: ChallengeInput| WardenInput::Challenge {
        challenge_id: event.challenge_id,
        input,
    };

    let input = match event.event_type {
        EventType::ForegroundChanged => {
            let mut foreground =
                ForegroundEvent::new(event.package.clone()?, observed_at(&event, now));
            if let Some(name) = event
                .display_name
                .as_deref()
                .filter(|name| !name.trim().is_empty())
            {
                foreground = foreground.with_display_name(name);
            }
            WardenInput::ForegroundChanged(foreground)
        }
        EventType::DialObserved => WardenInput::DialObserved(event.dialed.clone()?),
        EventType::BiometricResult => {
            let result: AuthResult = event.auth_result?;
            challenge(ChallengeInput::Sample(Sample::Platform(result)))
        }
        EventType::FallbackRequested => challenge(ChallengeInput::FallbackRequested),
        EventType::PinSubmitted => challenge(ChallengeInput::Pin(event.pin.clone()?)),
        EventType::FaceEnrolled => {
            WardenInput::EnrollFace(FaceLandmarks::from(event.landmarks.as_ref()?))
        }
        // Frames reach the loop through the frame worker.
        EventType::FrameCaptured => return None,
    };
    Some(input)
}

fn event_outcome(reply: WardenReply) -> EventOutcome {
    match reply {
        WardenReply::Tick(_) => EventOutcome {
            accepted: true,
            ..EventOutcome::default()
        },
        WardenReply::Dial(decision) => EventOutcome {
            accepted: true,
            intercept: Some(decision == DialDecision::Intercept),
            ..EventOutcome::default()
        },
        WardenReply::Enrolled(enrolled) => EventOutcome {
            accepted: true,
            enrolled: Some(enrolled),
            ..EventOutcome::default()
        },
        WardenReply::Challenge(InputOutcome::Applied {
            challenge_id,
            update,
        }) => EventOutcome {
            accepted: true,
            challenge_id: Some(challenge_id),
            state: state_after(update).map(|state| state.as_str().to_string()),
            message: update.user_message().map(str::to_string),
            ..EventOutcome::default()
        },
        WardenReply::Challenge(InputOutcome::NoChallenge | InputOutcome::Stale) => {
            EventOutcome::default()
        }
    }
}

fn state_after(update: ChallengeUpdate) -> Option<ChallengeState> {
    match update {
        ChallengeUpdate::Unchanged => None,
        ChallengeUpdate::AwaitingPin | ChallengeUpdate::PinRejected => {
            Some(ChallengeState::AwaitingPin)
        }
        ChallengeUpdate::Verified => Some(ChallengeState::Verified),
        ChallengeUpdate::Alerted(_) | ChallengeUpdate::Denied => Some(ChallengeState::Alerting),
    }
}

fn write_response(stream: &mut UnixStream, response: Response) -> std::io::Result<()> {
    serde_json::to_writer(&mut *stream, &response)?;
    stream.write_all(b"\n")?;
    stream.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_core::BreachKind;

    fn event(event_type: EventType) -> EventEnvelope {
        EventEnvelope::new("evt-1", "2026-01-30T12:00:00Z".to_string(), event_type)
    }

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-30T12:00:05Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn foreground_timestamp_is_clamped_to_now() {
        let mut future = event(EventType::ForegroundChanged);
        future.recorded_at = "2026-01-30T13:00:00Z".to_string();
        assert_eq!(observed_at(&future, now()), now());

        let past = event(EventType::ForegroundChanged);
        assert!(observed_at(&past, now()) < now());
    }

    #[test]
    fn foreground_event_maps_package_and_label() {
        let mut envelope = event(EventType::ForegroundChanged);
        envelope.package = Some("com.bank.app".to_string());
        envelope.display_name = Some("Bank".to_string());

        match warden_input(envelope, now()) {
            Some(WardenInput::ForegroundChanged(foreground)) => {
                assert_eq!(foreground.package, "com.bank.app");
                assert_eq!(foreground.label(), "Bank");
            }
            other => panic!("unexpected input: {:?}", other),
        }
    }

    #[test]
    fn pin_event_targets_its_challenge() {
        let mut envelope = event(EventType::PinSubmitted);
        envelope.pin = Some("2080".to_string());
        envelope.challenge_id = Some(9);

        assert_eq!(
            warden_input(envelope, now()),
            Some(WardenInput::Challenge {
                challenge_id: Some(9),
                input: ChallengeInput::Pin("2080".to_string()),
            })
        );
    }

    #[test]
    fn missing_payload_yields_no_input() {
        assert_eq!(warden_input(event(EventType::DialObserved), now()), None);
    }

    #[test]
    fn alerted_update_reports_generic_denial() {
        let outcome = event_outcome(WardenReply::Challenge(InputOutcome::Applied {
            challenge_id: 4,
            update: ChallengeUpdate::Alerted(BreachKind::WrongPin),
        }));
        assert!(outcome.accepted);
        assert_eq!(outcome.challenge_id, Some(4));
        assert_eq!(outcome.state.as_deref(), Some("alerting"));
        assert_eq!(outcome.message.as_deref(), Some("Access denied"));
    }

    #[test]
    fn stale_input_is_not_accepted() {
        let outcome = event_outcome(WardenReply::Challenge(InputOutcome::Stale));
        assert!(!outcome.accepted);
        assert!(outcome.challenge_id.is_none());
    }

    #[test]
    fn dial_outcome_carries_intercept_flag() {
        let outcome = event_outcome(WardenReply::Dial(DialDecision::PassThrough));
        assert_eq!(outcome.intercept, Some(false));
    }
}
