//! Request/response correlation for commands sent to devices.
//!
//! Each dispatch registers a pending entry keyed by a fresh request id.
//! Whoever removes that entry from the map resolves the command: the
//! device reply, the timer, or the session ending. Removal and completion
//! happen under the same lock, so every command resolves exactly once.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use threateye_protocol::DeviceOutbound;
use threateye_protocol::messages::CommandPayload;
use threateye_sessions::{SessionId, SessionRegistry, SessionState};

/// A command to run on a device.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub action: String,
    pub params: Value,
}

impl Command {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            params: Value::Null,
        }
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }
}

/// Successful reply from a device.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandReply {
    pub request_id: String,
    pub payload: Value,
    /// The session was `Degraded` when the command was sent.
    pub best_effort: bool,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CommandError {
    #[error("device {device_id} is offline")]
    DeviceOffline { device_id: String },

    #[error("command {request_id} timed out after {after:?}")]
    Timeout { request_id: String, after: Duration },

    #[error("device went offline before answering {request_id}")]
    DeviceWentOffline { request_id: String },

    #[error("invalid command: {0}")]
    InvalidCommand(String),
}

impl CommandError {
    /// The correlation id, if the command got far enough to be issued.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::Timeout { request_id, .. } | Self::DeviceWentOffline { request_id } => {
                Some(request_id)
            }
            _ => None,
        }
    }
}

/// What happened to a device reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveOutcome {
    Resolved,
    /// Unknown, already resolved, or sent by a different session.
    Stale,
}

enum Completion {
    Reply(Value),
    WentOffline,
}

struct PendingCommand {
    target_device_id: String,
    session_id: SessionId,
    issued_at: Instant,
    completion: oneshot::Sender<Completion>,
}

/// Tracks outstanding commands across all devices.
pub struct CommandCorrelator {
    registry: Arc<SessionRegistry>,
    pending: Mutex<HashMap<String, PendingCommand>>,
}

impl CommandCorrelator {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self {
            registry,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Sends `command` to `device_id` and waits for the correlated reply.
    ///
    /// Resolves exactly once: with the reply, with `Timeout` after
    /// `timeout`, or with `DeviceWentOffline` if the session ends first.
    /// Dropping the returned future cancels the command.
    pub async fn dispatch(
        &self,
        device_id: &str,
        command: Command,
        timeout: Duration,
    ) -> Result<CommandReply, CommandError> {
        self.dispatch_to(None, device_id, command, timeout).await
    }

    /// Like [`dispatch`](Self::dispatch), but the device must belong to
    /// `organization_id`. The check is made on the session the command is
    /// sent to; a device of another organization looks offline.
    pub async fn dispatch_for_organization(
        &self,
        organization_id: &str,
        device_id: &str,
        command: Command,
        timeout: Duration,
    ) -> Result<CommandReply, CommandError> {
        self.dispatch_to(Some(organization_id), device_id, command, timeout)
            .await
    }

    async fn dispatch_to(
        &self,
        organization_id: Option<&str>,
        device_id: &str,
        command: Command,
        timeout: Duration,
    ) -> Result<CommandReply, CommandError> {
        if command.action.trim().is_empty() {
            return Err(CommandError::InvalidCommand("action is empty".into()));
        }

        let offline = || CommandError::DeviceOffline {
            device_id: device_id.to_owned(),
        };
        let session = self
            .registry
            .lookup(device_id)
            .ok()
            .filter(|s| s.state().is_live())
            .filter(|s| organization_id.is_none_or(|org| s.organization_id() == org))
            .ok_or_else(offline)?;
        let best_effort = session.state() == SessionState::Degraded;

        let request_id = uuid::Uuid::new_v4().to_string();
        let envelope = DeviceOutbound::Command {
            device_id: device_id.to_owned(),
            command: CommandPayload {
                action: command.action.clone(),
                params: command.params,
                request_id: request_id.clone(),
            },
        }
        .into_envelope()
        .map_err(|e| CommandError::InvalidCommand(e.to_string()))?;

        let (tx, mut rx) = oneshot::channel();
        let issued_at = Instant::now();
        self.lock().insert(
            request_id.clone(),
            PendingCommand {
                target_device_id: device_id.to_owned(),
                session_id: session.id(),
                issued_at,
                completion: tx,
            },
        );
        let guard_request_id = request_id.clone();
        let _guard = PendingGuard {
            correlator: self,
            request_id: &guard_request_id,
        };

        // A session that ended after the lookup may already have failed its
        // pending commands without seeing this one.
        if !session.state().is_live() {
            return Err(offline());
        }
        if let Err(e) = session.send(envelope) {
            warn!(device_id, request_id = %request_id, "command not sent: {e}");
            return Err(offline());
        }
        debug!(device_id, request_id = %request_id, action = %command.action, "command dispatched");

        let completion = match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(completion)) => completion,
            Ok(Err(_)) => Completion::WentOffline,
            Err(_) => {
                // Claim the entry; if a reply got there first, take it.
                if self.lock().remove(&request_id).is_some() {
                    info!(device_id, request_id = %request_id, "command timed out after {timeout:?}");
                    return Err(CommandError::Timeout {
                        request_id,
                        after: timeout,
                    });
                }
                rx.try_recv().unwrap_or(Completion::WentOffline)
            }
        };

        match completion {
            Completion::Reply(payload) => Ok(CommandReply {
                request_id,
                payload,
                best_effort,
                elapsed: issued_at.elapsed(),
            }),
            Completion::WentOffline => Err(CommandError::DeviceWentOffline { request_id }),
        }
    }

    /// Completes the command `request_id` with a reply from `session_id`.
    ///
    /// Replies for unknown or already resolved ids, or from a session other
    /// than the one the command was sent to, are dropped.
    pub fn resolve(&self, session_id: SessionId, request_id: &str, payload: Value) -> ResolveOutcome {
        let mut pending = self.lock();
        match pending.entry(request_id.to_owned()) {
            Entry::Occupied(entry) if entry.get().session_id == session_id => {
                let cmd = entry.remove();
                debug!(
                    device_id = %cmd.target_device_id,
                    request_id,
                    "command answered after {:?}",
                    cmd.issued_at.elapsed()
                );
                let _ = cmd.completion.send(Completion::Reply(payload));
                ResolveOutcome::Resolved
            }
            _ => {
                warn!(request_id, session_id = %session_id, "discarding reply with no pending command");
                ResolveOutcome::Stale
            }
        }
    }

    /// Resolves every command sent to `session_id` with `DeviceWentOffline`.
    pub fn fail_session(&self, session_id: SessionId) -> usize {
        let mut pending = self.lock();
        let ids: Vec<String> = pending
            .iter()
            .filter(|(_, cmd)| cmd.session_id == session_id)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &ids {
            if let Some(cmd) = pending.remove(id) {
                let _ = cmd.completion.send(Completion::WentOffline);
            }
        }
        if !ids.is_empty() {
            info!(session_id = %session_id, count = ids.len(), "failed pending commands of ended session");
        }
        ids.len()
    }

    /// Number of commands awaiting a reply.
    pub fn pending_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, PendingCommand>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Removes the pending entry when `dispatch` returns or is dropped.
struct PendingGuard<'a> {
    correlator: &'a CommandCorrelator,
    request_id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.correlator.lock().remove(self.request_id);
    }
}
