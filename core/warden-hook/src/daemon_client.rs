//! Client helper for sending platform events to the warden daemon.
//!
//! The daemon is the only writer. Failures are surfaced to the caller; a
//! transport failure is retried once with the same event id.

use chrono::Utc;
use rand::RngCore;
use std::env;
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::Duration;
use warden_core::StorageConfig;
use warden_protocol::{
    EventEnvelope, EventOutcome, EventType, Method, Request, Response, StatusSnapshot,
    MAX_REQUEST_BYTES, PROTOCOL_VERSION,
};

const SOCKET_ENV: &str = "WARDEN_SOCKET";
const READ_TIMEOUT_MS: u64 = 3000;
const WRITE_TIMEOUT_MS: u64 = 600;
const RETRY_DELAY_MS: u64 = 50;

#[derive(Debug)]
enum SendError {
    /// Connect, write or read failed; the daemon may not have seen the request.
    Transport(String),
    /// The daemon answered with an error.
    Rejected(String),
}

impl SendError {
    fn into_message(self) -> String {
        match self {
            SendError::Transport(message) | SendError::Rejected(message) => message,
        }
    }
}

pub fn new_event(event_type: EventType) -> EventEnvelope {
    EventEnvelope::new(
        make_event_id(std::process::id()),
        Utc::now().to_rfc3339(),
        event_type,
    )
}

pub fn send_event(event: EventEnvelope) -> Result<EventOutcome, String> {
    let label = format!("{:?}", event.event_type);
    let params = serde_json::to_value(&event)
        .map_err(|err| format!("Failed to serialize event: {}", err))?;
    let build_request = || Request {
        protocol_version: PROTOCOL_VERSION,
        method: Method::Event,
        id: Some(event.event_id.clone()),
        params: Some(params.clone()),
    };

    let data = send_with_retry(build_request, &label)?;
    serde_json::from_value(data).map_err(|err| format!("Unexpected event outcome: {}", err))
}

pub fn daemon_health() -> Result<serde_json::Value, String> {
    send_with_retry(
        || Request {
            protocol_version: PROTOCOL_VERSION,
            method: Method::GetHealth,
            id: Some("health-check".to_string()),
            params: None,
        },
        "health check",
    )
}

pub fn daemon_status() -> Result<StatusSnapshot, String> {
    let data = send_with_retry(
        || Request {
            protocol_version: PROTOCOL_VERSION,
            method: Method::GetStatus,
            id: Some("status".to_string()),
            params: None,
        },
        "status request",
    )?;
    serde_json::from_value(data).map_err(|err| format!("Unexpected status payload: {}", err))
}

fn socket_path() -> Result<PathBuf, String> {
    if let Ok(path) = env::var(SOCKET_ENV) {
        return Ok(PathBuf::from(path));
    }
    StorageConfig::from_home()
        .map(|storage| storage.socket_path())
        .map_err(|err| err.to_string())
}

fn send_with_retry<F>(build: F, label: &str) -> Result<serde_json::Value, String>
where
    F: Fn() -> Request,
{
    match send_once(build()) {
        Ok(data) => Ok(data),
        Err(SendError::Transport(err)) => {
            tracing::warn!(error = %err, "Failed to send {} to daemon", label);
            std::thread::sleep(Duration::from_millis(RETRY_DELAY_MS));
            send_once(build()).map_err(|retry_err| {
                let message = retry_err.into_message();
                tracing::warn!(
                    error = %message,
                    "Retry failed sending {} to daemon",
                    label
                );
                message
            })
        }
        Err(SendError::Rejected(err)) => {
            tracing::warn!(error = %err, "Daemon rejected {}", label);
            Err(err)
        }
    }
}

fn send_once(request: Request) -> Result<serde_json::Value, SendError> {
    let response = send_request(request).map_err(SendError::Transport)?;
    if response.ok {
        Ok(response.data.unwrap_or(serde_json::Value::Null))
    } else {
        let message = response
            .error
            .map(|err| format!("{}: {}", err.code, err.message))
            .unwrap_or_else(|| "Unknown daemon error".to_string());
        Err(SendError::Rejected(message))
    }
}

fn send_request(request: Request) -> Result<Response, String> {
    let socket = socket_path()?;
    let mut stream = UnixStream::connect(&socket)
        .map_err(|err| format!("Failed to connect to daemon socket: {}", err))?;
    let _ = stream.set_read_timeout(Some(Duration::from_millis(READ_TIMEOUT_MS)));
    let _ = stream.set_write_timeout(Some(Duration::from_millis(WRITE_TIMEOUT_MS)));

    serde_json::to_writer(&mut stream, &request)
        .map_err(|err| format!("Failed to write request: {}", err))?;
    stream
        .write_all(b"\n")
        .map_err(|err| format!("Failed to flush request: {}", err))?;
    stream.flush().ok();

    read_response(&mut stream)
}

fn read_response(stream: &mut UnixStream) -> Result<Response, String> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > MAX_REQUEST_BYTES {
                    return Err("Response exceeded maximum size".to_string());
                }
                if chunk[..n].contains(&b'\n') {
                    break;
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                return Err("Timed out waiting for daemon response".to_string());
            }
            Err(err) => return Err(format!("Failed to read response: {}", err)),
        }
    }

    let newline_index = buffer.iter().position(|b| *b == b'\n');
    let response_bytes = match newline_index {
        Some(index) => &buffer[..index],
        None => buffer.as_slice(),
    };

    if response_bytes.is_empty() {
        return Err("Daemon response was empty".to_string());
    }

    serde_json::from_slice(response_bytes)
        .map_err(|err| format!("Failed to parse response JSON: {}", err))
}

fn make_event_id(pid: u32) -> String {
    let mut random = rand::thread_rng();
    let rand = random.next_u64();
    format!("evt-{}-{}-{:x}", Utc::now().timestamp_millis(), pid, rand)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixListener;
    use std::path::Path;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, OnceLock,
    };
    use std::time::Instant;

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    struct EnvGuard {
        key: &'static str,
        prior: Option<String>,
    }

    impl EnvGuard {
        fn set(key: &'static str, value: &str) -> Self {
            let prior = std::env::var(key).ok();
            std::env::set_var(key, value);
            Self { key, prior }
        }

        fn unset(key: &'static str) -> Self {
            let prior = std::env::var(key).ok();
            std::env::remove_var(key);
            Self { key, prior }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            if let Some(value) = &self.prior {
                std::env::set_var(self.key, value);
            } else {
                std::env::remove_var(self.key);
            }
        }
    }

    fn env_lock() -> std::sync::MutexGuard<'static, ()> {
        match ENV_LOCK.get_or_init(|| Mutex::new(())).lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn socket_in_temp(prefix: &str) -> PathBuf {
        let dir = Path::new("/tmp").join(format!(
            "{}-{}",
            prefix,
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or(Duration::from_millis(0))
                .as_nanos()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        let socket_path = dir.join("warden.sock");
        let _ = std::fs::remove_file(&socket_path);
        socket_path
    }

    fn read_request(stream: &mut UnixStream) -> Option<Request> {
        let mut buffer = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            match stream.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    buffer.extend_from_slice(&chunk[..n]);
                    if buffer.contains(&b'\n') {
                        break;
                    }
                }
                Err(_) => return None,
            }
        }

        let newline_index = buffer.iter().position(|b| *b == b'\n');
        let request_bytes = match newline_index {
            Some(index) => &buffer[..index],
            None => buffer.as_slice(),
        };
        serde_json::from_slice(request_bytes).ok()
    }

    fn reply(stream: &mut UnixStream, response: &Response) {
        let mut payload = serde_json::to_vec(response).unwrap();
        payload.push(b'\n');
        let _ = stream.write_all(&payload);
    }

    /// Accepts up to `max` connections, answering each with `respond`.
    fn serve<F>(listener: UnixListener, max: usize, respond: F) -> std::thread::JoinHandle<()>
    where
        F: Fn(usize, Option<Request>, &mut UnixStream) + Send + 'static,
    {
        listener.set_nonblocking(true).unwrap();
        std::thread::spawn(move || {
            let start = Instant::now();
            let mut handled = 0;
            while handled < max && start.elapsed() < Duration::from_secs(5) {
                match listener.accept() {
                    Ok((mut stream, _)) => {
                        handled += 1;
                        stream.set_nonblocking(false).unwrap();
                        let request = read_request(&mut stream);
                        respond(handled, request, &mut stream);
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                        std::thread::sleep(Duration::from_millis(10));
                    }
                    Err(_) => break,
                }
            }
        })
    }

    #[test]
    fn dial_event_returns_intercept_decision() {
        let _guard = env_lock();
        let socket_path = socket_in_temp("wh-dial");
        let listener = UnixListener::bind(&socket_path).unwrap();
        let server = serve(listener, 1, |_, request, stream| {
            let request = request.expect("request");
            let event: EventEnvelope =
                serde_json::from_value(request.params.expect("params")).unwrap();
            assert_eq!(event.event_type, EventType::DialObserved);
            assert_eq!(event.dialed.as_deref(), Some("*#2080#"));
            reply(
                stream,
                &Response::ok(
                    request.id,
                    serde_json::json!({"accepted": true, "intercept": true}),
                ),
            );
        });
        let _socket_guard = EnvGuard::set(SOCKET_ENV, socket_path.to_str().unwrap());

        let mut event = new_event(EventType::DialObserved);
        event.dialed = Some("*#2080#".to_string());
        let outcome = send_event(event).expect("outcome");

        server.join().unwrap();
        assert!(outcome.accepted);
        assert_eq!(outcome.intercept, Some(true));
    }

    #[test]
    fn retry_after_lost_response_reuses_event_id() {
        let _guard = env_lock();
        let socket_path = socket_in_temp("wh-lost");
        let listener = UnixListener::bind(&socket_path).unwrap();

        let attempt_ids: Arc<Mutex<Vec<Option<String>>>> = Arc::new(Mutex::new(Vec::new()));
        let attempt_ids_clone = Arc::clone(&attempt_ids);
        let server = serve(listener, 2, move |handled, request, stream| {
            attempt_ids_clone
                .lock()
                .unwrap()
                .push(request.and_then(|request| request.id));
            // The first connection closes without an answer.
            if handled == 2 {
                reply(
                    stream,
                    &Response::ok(None, serde_json::json!({"accepted": true})),
                );
            }
        });
        let _socket_guard = EnvGuard::set(SOCKET_ENV, socket_path.to_str().unwrap());

        let mut event = new_event(EventType::ForegroundChanged);
        event.package = Some("com.bank.app".to_string());
        assert!(send_event(event).is_ok());
        server.join().unwrap();

        let ids = attempt_ids.lock().unwrap();
        assert_eq!(ids.len(), 2);
        assert_eq!(ids[0], ids[1], "retry must reuse the same request/event id");
    }

    #[test]
    fn daemon_rejection_is_not_retried() {
        let _guard = env_lock();
        let socket_path = socket_in_temp("wh-reject");
        let listener = UnixListener::bind(&socket_path).unwrap();

        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();
        let server = serve(listener, 1, move |_, _, stream| {
            attempts_clone.fetch_add(1, Ordering::SeqCst);
            reply(
                stream,
                &Response::error(None, "missing_field", "pin is required"),
            );
        });
        let _socket_guard = EnvGuard::set(SOCKET_ENV, socket_path.to_str().unwrap());

        let err = send_event(new_event(EventType::PinSubmitted)).expect_err("rejected");
        server.join().unwrap();

        assert_eq!(err, "missing_field: pin is required");
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn socket_path_honors_override() {
        let _guard = env_lock();
        let _socket_guard = EnvGuard::set(SOCKET_ENV, "/tmp/custom-warden.sock");
        assert_eq!(
            socket_path().unwrap(),
            PathBuf::from("/tmp/custom-warden.sock")
        );
    }

    #[test]
    fn default_socket_lives_under_warden_root() {
        let _guard = env_lock();
        let _home_guard = EnvGuard::set("HOME", "/tmp/warden-hook-home");
        let _socket_guard = EnvGuard::unset(SOCKET_ENV);
        assert_eq!(
            socket_path().unwrap(),
            PathBuf::from("/tmp/warden-hook-home/.warden/warden.sock")
        );
    }

    #[test]
    fn event_ids_are_unique() {
        assert_ne!(make_event_id(1), make_event_id(1));
    }
}
