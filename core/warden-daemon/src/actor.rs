//! Single owner of the [`Warden`].
//!
//! Socket handlers, the frame worker and watchdog threads all talk to the
//! decision loop through one channel. The loop also drives the guard tick, so
//! a tick never interleaves with an event.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, info, warn};
use warden_core::{Warden, WardenInput, WardenReply};
use warden_protocol::StatusSnapshot;

pub enum ActorMessage {
    Input {
        input: WardenInput,
        reply: Option<SyncSender<WardenReply>>,
    },
    Status {
        reply: SyncSender<StatusSnapshot>,
    },
}

#[derive(Clone)]
pub struct ActorHandle {
    sender: Sender<ActorMessage>,
}

pub fn channel() -> (ActorHandle, Receiver<ActorMessage>) {
    let (sender, receiver) = mpsc::channel();
    (ActorHandle { sender }, receiver)
}

impl ActorHandle {
    /// Sends `input` and waits up to `timeout` for the loop's reply.
    pub fn call(&self, input: WardenInput, timeout: Duration) -> Result<WardenReply, String> {
        let (reply, response) = mpsc::sync_channel(1);
        self.sender
            .send(ActorMessage::Input {
                input,
                reply: Some(reply),
            })
            .map_err(|_| "decision loop is not running".to_string())?;
        response
            .recv_timeout(timeout)
            .map_err(|err| format!("decision loop did not reply: {}", err))
    }

    /// Fire-and-forget. Returns false if the loop is gone.
    pub fn post(&self, input: WardenInput) -> bool {
        let sent = self
            .sender
            .send(ActorMessage::Input { input, reply: None })
            .is_ok();
        if !sent {
            warn!("Decision loop is not running; input dropped");
        }
        sent
    }

    pub fn status(&self, timeout: Duration) -> Result<StatusSnapshot, String> {
        let (reply, response) = mpsc::sync_channel(1);
        self.sender
            .send(ActorMessage::Status { reply })
            .map_err(|_| "decision loop is not running".to_string())?;
        response
            .recv_timeout(timeout)
            .map_err(|err| format!("decision loop did not reply: {}", err))
    }
}

pub fn spawn(
    mut warden: Warden,
    receiver: Receiver<ActorMessage>,
    tick: Duration,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("warden-loop".to_string())
        .spawn(move || {
            info!(tick_ms = tick.as_millis() as u64, "Decision loop started");
            let mut next_tick = Instant::now() + tick;
            loop {
                let wait = next_tick.saturating_duration_since(Instant::now());
                match receiver.recv_timeout(wait) {
                    Ok(message) => handle_message(&mut warden, message),
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }

                // A busy channel must not starve the guard.
                if Instant::now() >= next_tick {
                    warden.handle(WardenInput::Tick, Utc::now());
                    next_tick = Instant::now() + tick;
                }
            }
            debug!("Decision loop stopped");
        })
}

fn handle_message(warden: &mut Warden, message: ActorMessage) {
    match message {
        ActorMessage::Input { input, reply } => {
            let result = warden.handle(input, Utc::now());
            if let Some(reply) = reply {
                // The caller may have timed out already.
                let _ = reply.try_send(result);
            }
        }
        ActorMessage::Status { reply } => {
            let _ = reply.try_send(warden.status(Utc::now()));
        }
    }
}
