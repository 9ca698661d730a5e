//! Worker for one device connection.
//!
//! Frames from a device are handled strictly in arrival order. The worker
//! owns the liveness timer: every valid message re-arms it, one silent
//! interval degrades the session and a second one takes it offline.

use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use threateye_protocol::codec::{self, CodecError};
use threateye_protocol::constants::{
    ERR_ALREADY_AUTHENTICATED, ERR_AUTH_REJECTED, ERR_MALFORMED_MESSAGE, ERR_NOT_AUTHENTICATED,
    ERR_UNSUPPORTED_MESSAGE,
};
use threateye_protocol::messages::{AckKind, AckPayload, AuthAck};
use threateye_protocol::{DeviceInbound, DeviceOutbound, ErrorPayload};
use threateye_sessions::{
    CloseReason, DeviceLink, DeviceSession, LinkError, PendingSession, SessionEvent, SessionState,
};

use crate::connection::{Connection, Sender};
use crate::hub::{AdmitError, Hub};

/// Drives a device connection from handshake to close. Returns the state
/// the connection ended in.
pub(crate) async fn run(hub: Arc<Hub>, mut conn: Connection) -> SessionState {
    let sender = conn.sender();
    let pending = PendingSession::new();
    let state = pending.watch();
    let Some(session) = authenticate(&hub, &sender, &mut conn, pending).await else {
        return *state.borrow();
    };

    let ack = AuthAck {
        device_id: session.device_id().to_owned(),
        session_id: session.id().to_string(),
        message: "Authentication successful".into(),
        heartbeat_interval: hub.config().heartbeat_interval.as_secs().max(1),
    };
    if reply(&sender, DeviceOutbound::AuthAck(ack)).is_ok() {
        info!(
            device_id = %session.device_id(),
            org = %session.organization_id(),
            peer_addr = %conn.peer_addr,
            "device online"
        );
        hub.request_system_info(&session);
        let reason = serve(&hub, &session, &sender, &mut conn).await;
        hub.finish_session(&session, reason);
    } else {
        hub.finish_session(&session, CloseReason::Normal);
    }
    *state.borrow()
}

/// Waits for a valid `auth`. Anything else is answered with
/// `NOT_AUTHENTICATED` and the connection stays open until the deadline.
///
/// Returns `None` once `pending` has ended `Offline`.
async fn authenticate(
    hub: &Arc<Hub>,
    sender: &Sender,
    conn: &mut Connection,
    pending: PendingSession,
) -> Option<Arc<DeviceSession>> {
    let deadline = tokio::time::sleep(hub.config().auth_deadline());
    tokio::pin!(deadline);

    let closed = |reason: CloseReason| {
        let _ = pending.apply(SessionEvent::TransportClosed);
        DeviceLink::close(sender, reason);
    };

    loop {
        let frame = tokio::select! {
            _ = hub.cancel_token().cancelled() => {
                closed(CloseReason::Shutdown);
                return None;
            }
            _ = &mut deadline => {
                warn!(peer_addr = %conn.peer_addr, "no authentication before deadline, closing");
                closed(CloseReason::HeartbeatTimeout);
                return None;
            }
            frame = conn.recv() => match frame {
                Some(frame) => frame,
                None => {
                    debug!(peer_addr = %conn.peer_addr, "transport closed before authentication");
                    closed(CloseReason::Normal);
                    return None;
                }
            },
        };

        let inbound = match codec::decode_device(&frame) {
            Ok(inbound) => inbound,
            Err(e) => {
                warn!(peer_addr = %conn.peer_addr, "rejecting frame: {e}");
                if reply(sender, error_reply(&e)).is_err() {
                    closed(CloseReason::Normal);
                    return None;
                }
                continue;
            }
        };
        if let Err(e) = codec::ensure_authenticated(&inbound.message, false) {
            debug!(peer_addr = %conn.peer_addr, kind = inbound.message.kind(), "message before authentication");
            if reply(sender, error_reply(&e)).is_err() {
                closed(CloseReason::Normal);
                return None;
            }
            continue;
        }
        let DeviceInbound::Auth(request) = inbound.message else {
            continue;
        };

        debug!(peer_addr = %conn.peer_addr, device_id = %request.device_id, "authenticating");

        return match hub.admit(request, Arc::new(sender.clone()), pending).await {
            Ok(session) => Some(session),
            Err(AdmitError::Rejected(reason)) => {
                let _ = reply(
                    sender,
                    DeviceOutbound::AuthError(ErrorPayload::new(ERR_AUTH_REJECTED, reason)),
                );
                DeviceLink::close(sender, CloseReason::AuthRejected);
                None
            }
            Err(AdmitError::Abandoned) => None,
        };
    }
}

/// Main loop of an authenticated session. Returns why it ended.
async fn serve(
    hub: &Arc<Hub>,
    session: &Arc<DeviceSession>,
    sender: &Sender,
    conn: &mut Connection,
) -> CloseReason {
    let interval = hub.config().heartbeat_interval;
    let mut state_rx = session.watch();
    let liveness = tokio::time::sleep(interval);
    tokio::pin!(liveness);

    loop {
        tokio::select! {
            _ = hub.cancel_token().cancelled() => return CloseReason::Shutdown,

            changed = state_rx.changed() => {
                let state = session.state();
                if changed.is_err() || state.is_terminal() {
                    return match state {
                        SessionState::Evicted => CloseReason::Evicted,
                        _ => CloseReason::Normal,
                    };
                }
            }

            _ = &mut liveness => {
                match hub.advance(session, SessionEvent::HeartbeatMissed) {
                    Some(t) if t.to == SessionState::Offline => {
                        warn!(device_id = %session.device_id(), "heartbeat missed twice, going offline");
                        return CloseReason::HeartbeatTimeout;
                    }
                    Some(_) => {
                        info!(device_id = %session.device_id(), "heartbeat missed, session degraded");
                        liveness.as_mut().reset(Instant::now() + interval);
                    }
                    None => return CloseReason::Normal,
                }
            }

            frame = conn.recv() => {
                let Some(frame) = frame else {
                    debug!(device_id = %session.device_id(), "transport closed");
                    return CloseReason::Normal;
                };
                match handle_frame(hub, session, sender, &frame) {
                    Ok(true) => liveness.as_mut().reset(Instant::now() + interval),
                    Ok(false) => {}
                    Err(e) => {
                        warn!(device_id = %session.device_id(), "{e}, ending session");
                        return CloseReason::Normal;
                    }
                }
            }
        }
    }
}

/// Handles one frame from an authenticated device. Returns `true` if it
/// was a valid message (and so counts as activity).
fn handle_frame(
    hub: &Arc<Hub>,
    session: &Arc<DeviceSession>,
    sender: &Sender,
    frame: &str,
) -> Result<bool, LinkError> {
    let inbound = match codec::decode_device(frame) {
        Ok(inbound) => inbound,
        Err(e) => {
            warn!(device_id = %session.device_id(), "rejecting frame: {e}");
            reply(sender, error_reply(&e))?;
            return Ok(false);
        }
    };

    if let Some(claimed) = inbound.device_id.as_deref() {
        let carries_data = matches!(
            inbound.message,
            DeviceInbound::Telemetry(_) | DeviceInbound::Issue(_)
        );
        if carries_data && claimed != session.device_id() {
            warn!(device_id = %session.device_id(), claimed, "deviceId does not match session");
            let message = format!("deviceId {claimed} does not match this session");
            reply(sender, DeviceOutbound::Error(ErrorPayload::new(ERR_MALFORMED_MESSAGE, message)))?;
            return Ok(false);
        }
    }

    session.touch();
    hub.advance(session, SessionEvent::MessageReceived);

    match inbound.message {
        DeviceInbound::Auth(_) => {
            reply(
                sender,
                DeviceOutbound::Error(ErrorPayload::new(
                    ERR_ALREADY_AUTHENTICATED,
                    "session already authenticated",
                )),
            )?;
        }
        DeviceInbound::Telemetry(snapshot) => {
            trace!(device_id = %session.device_id(), "telemetry received");
            hub.ingest_telemetry(session, snapshot);
            reply(
                sender,
                DeviceOutbound::Ack(AckPayload {
                    kind: AckKind::Telemetry,
                    issue_id: None,
                }),
            )?;
        }
        DeviceInbound::Issue(report) => {
            hub.report_issue(session, &report);
            reply(
                sender,
                DeviceOutbound::Ack(AckPayload {
                    kind: AckKind::Issue,
                    issue_id: report.id,
                }),
            )?;
        }
        DeviceInbound::CommandResponse {
            request_id,
            payload,
        } => hub.resolve_command(session, &request_id, payload),
        DeviceInbound::Heartbeat => trace!(device_id = %session.device_id(), "heartbeat"),
    }
    Ok(true)
}

fn error_reply(err: &CodecError) -> DeviceOutbound {
    let code = match err {
        CodecError::Unsupported(_) => ERR_UNSUPPORTED_MESSAGE,
        CodecError::NotAuthenticated => ERR_NOT_AUTHENTICATED,
        _ => ERR_MALFORMED_MESSAGE,
    };
    DeviceOutbound::Error(ErrorPayload::new(code, err.to_string()))
}

/// Queues a reply. Only a lost connection is an error; a full buffer
/// drops the reply.
fn reply(sender: &Sender, msg: DeviceOutbound) -> Result<(), LinkError> {
    let envelope = match msg.into_envelope() {
        Ok(envelope) => envelope,
        Err(e) => {
            error!("failed to build reply: {e}");
            return Ok(());
        }
    };
    match DeviceLink::send(sender, envelope) {
        Err(LinkError::Full) => Ok(()),
        other => other,
    }
}
