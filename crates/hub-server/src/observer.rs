//! Worker for one admin dashboard connection.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use threateye_commands::{Command, CommandError, CommandReply};
use threateye_fanout::Subscription;
use threateye_protocol::codec::{self, CodecError};
use threateye_protocol::constants::{
    ERR_AUTH_REJECTED, ERR_MALFORMED_MESSAGE, ERR_NOT_AUTHENTICATED, ERR_UNSUPPORTED_MESSAGE,
};
use threateye_protocol::messages::{
    CommandOutcome, CommandResultResponse, DeviceListResponse, DispatchCommandRequest,
    SubscribeRequest, SubscribedResponse,
};
use threateye_protocol::{ErrorPayload, HubEvent, ObserverInbound, ObserverOutbound};
use threateye_sessions::{CloseReason, DeviceLink};

use crate::collaborators::AuthVerdict;
use crate::connection::{Connection, SendError, Sender};
use crate::hub::Hub;

/// Drives an observer connection until it closes.
pub(crate) async fn run(hub: Arc<Hub>, mut conn: Connection) {
    let sender = conn.sender();
    let mut subscription: Option<Subscription<HubEvent>> = None;
    let mut requests: JoinSet<()> = JoinSet::new();
    let command_permits = Arc::new(Semaphore::new(hub.config().max_commands_per_observer));

    loop {
        tokio::select! {
            _ = hub.cancel_token().cancelled() => {
                DeviceLink::close(&sender, CloseReason::Shutdown);
                break;
            }

            event = next_event(subscription.as_ref()) => {
                let Some(event) = event else { break };
                if forward(&sender, ObserverOutbound::Event(event)).await.is_err() {
                    break;
                }
            }

            frame = conn.recv() => {
                let Some(frame) = frame else { break };
                let inflight = Inflight { tasks: &mut requests, permits: &command_permits };
                if !handle_frame(&hub, &sender, &mut subscription, inflight, &frame).await {
                    break;
                }
            }

            Some(joined) = requests.join_next(), if !requests.is_empty() => {
                if let Err(e) = joined {
                    if e.is_panic() {
                        error!(peer_addr = %conn.peer_addr, "dispatch task panicked");
                    }
                }
            }
        }
    }

    requests.abort_all();
    if let Some(sub) = subscription {
        info!(peer_addr = %conn.peer_addr, subscriber = %sub.id(), org = sub.scope(), "observer disconnected");
    }
}

/// Next queued event, or never when not yet subscribed.
async fn next_event(subscription: Option<&Subscription<HubEvent>>) -> Option<HubEvent> {
    match subscription {
        Some(sub) => sub.recv().await,
        None => std::future::pending().await,
    }
}

/// Commands an observer has waiting on devices.
struct Inflight<'a> {
    tasks: &'a mut JoinSet<()>,
    permits: &'a Arc<Semaphore>,
}

/// Handles one frame. Returns `false` when the connection must close.
async fn handle_frame(
    hub: &Arc<Hub>,
    sender: &Sender,
    subscription: &mut Option<Subscription<HubEvent>>,
    inflight: Inflight<'_>,
    frame: &str,
) -> bool {
    let inbound = match codec::decode_observer(frame) {
        Ok(inbound) => inbound,
        Err(e) => {
            warn!("rejecting observer frame: {e}");
            return send_error(sender, None, error_code(&e), e.to_string()).await;
        }
    };

    let scope = subscription.as_ref().map(|s| s.scope().to_owned());
    let org = match (&inbound.message, scope) {
        (ObserverInbound::Subscribe(request), _) => {
            return subscribe(hub, sender, subscription, request).await;
        }
        (_, Some(org)) => org,
        (other, None) => {
            let request_id = other.request_id().map(str::to_owned);
            return send_error(
                sender,
                request_id,
                ERR_NOT_AUTHENTICATED,
                "subscribe first".into(),
            )
            .await;
        }
    };

    match inbound.message {
        ObserverInbound::ListDevices { request_id } => {
            let devices = hub.list_by_organization(&org);
            debug!(org = %org, count = devices.len(), "listing devices");
            let list = DeviceListResponse { devices };
            forward(sender, ObserverOutbound::DeviceList { request_id, list })
                .await
                .is_ok()
        }
        ObserverInbound::DispatchCommand {
            request_id,
            request,
        } => {
            let Ok(permit) = inflight.permits.clone().try_acquire_owned() else {
                warn!(org = %org, "too many commands in flight, rejecting");
                let result = CommandResultResponse {
                    outcome: CommandOutcome::Rejected,
                    device_request_id: None,
                    payload: None,
                    best_effort: false,
                    message: Some("too many commands in flight".into()),
                };
                return forward(sender, ObserverOutbound::CommandResult { request_id, result })
                    .await
                    .is_ok();
            };
            let hub = Arc::clone(hub);
            let sender = sender.clone();
            inflight.tasks.spawn(async move {
                let _permit = permit;
                let result = run_command(&hub, &org, request).await;
                let _ = forward(
                    &sender,
                    ObserverOutbound::CommandResult {
                        request_id,
                        result: command_result(result),
                    },
                )
                .await;
            });
            true
        }
        ObserverInbound::Subscribe(_) => true,
    }
}

async fn subscribe(
    hub: &Arc<Hub>,
    sender: &Sender,
    subscription: &mut Option<Subscription<HubEvent>>,
    request: &SubscribeRequest,
) -> bool {
    if let AuthVerdict::Rejected(reason) = hub.authorize_observer(request).await {
        info!(org = %request.organization_id, "observer rejected: {reason}");
        let _ = send_error(sender, None, ERR_AUTH_REJECTED, reason).await;
        DeviceLink::close(sender, CloseReason::AuthRejected);
        return false;
    }

    let org = request.organization_id.as_str();
    let current = match subscription.take() {
        Some(sub) if sub.scope() == org => sub,
        _ => {
            let sub = hub.subscribe(org);
            info!(org, subscriber = %sub.id(), "observer subscribed");
            sub
        }
    };
    let response = SubscribedResponse {
        organization_id: org.to_owned(),
        subscription_id: current.id().to_string(),
    };
    *subscription = Some(current);
    forward(sender, ObserverOutbound::Subscribed(response))
        .await
        .is_ok()
}

async fn run_command(
    hub: &Hub,
    org: &str,
    request: DispatchCommandRequest,
) -> Result<CommandReply, CommandError> {
    let command = Command::new(request.action).with_params(request.params);
    let timeout = request.timeout_ms.map(Duration::from_millis);
    hub.dispatch_for_organization(org, &request.device_id, command, timeout)
        .await
}

fn command_result(result: Result<CommandReply, CommandError>) -> CommandResultResponse {
    match result {
        Ok(reply) => CommandResultResponse {
            outcome: CommandOutcome::Success,
            device_request_id: Some(reply.request_id),
            payload: Some(reply.payload),
            best_effort: reply.best_effort,
            message: None,
        },
        Err(e) => {
            let outcome = match &e {
                CommandError::DeviceOffline { .. } => CommandOutcome::DeviceOffline,
                CommandError::Timeout { .. } => CommandOutcome::Timeout,
                CommandError::DeviceWentOffline { .. } => CommandOutcome::DeviceWentOffline,
                CommandError::InvalidCommand(_) => CommandOutcome::Rejected,
            };
            CommandResultResponse {
                outcome,
                device_request_id: e.request_id().map(str::to_owned),
                payload: None,
                best_effort: false,
                message: Some(e.to_string()),
            }
        }
    }
}

fn error_code(err: &CodecError) -> &'static str {
    match err {
        CodecError::Unsupported(_) => ERR_UNSUPPORTED_MESSAGE,
        _ => ERR_MALFORMED_MESSAGE,
    }
}

async fn send_error(
    sender: &Sender,
    request_id: Option<String>,
    code: &str,
    message: String,
) -> bool {
    let error = ErrorPayload::new(code, message);
    forward(sender, ObserverOutbound::Error { request_id, error })
        .await
        .is_ok()
}

/// Writes to the observer, waiting for buffer space.
async fn forward(sender: &Sender, msg: ObserverOutbound) -> Result<(), SendError> {
    let envelope = msg
        .into_envelope()
        .map_err(|e| SendError::Encode(e.to_string()))?;
    sender.deliver(&envelope).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use threateye_protocol::MessageType;

    use crate::connection::testing::{Peer, pair};
    use crate::config::HubConfig;
    use crate::hub::testing::{hub, hub_with};

    fn start(hub: &Arc<Hub>) -> (tokio::task::JoinHandle<()>, Peer) {
        let (conn, peer) = pair(hub.cancel_token());
        (tokio::spawn(run(hub.clone(), conn)), peer)
    }

    async fn subscribed(hub: &Arc<Hub>, org: &str) -> (tokio::task::JoinHandle<()>, Peer) {
        let (worker, mut peer) = start(hub);
        peer.send(json!({"type": "subscribe", "data": {"apiKey": "key", "organizationId": org}}))
            .await;
        let ack = peer.next().await.unwrap();
        assert_eq!(ack.msg_type, MessageType::Subscribed);
        (worker, peer)
    }

    async fn device(hub: &Arc<Hub>, device_id: &str, org: &str) -> (tokio::task::JoinHandle<threateye_sessions::SessionState>, Peer) {
        let (conn, mut peer) = pair(hub.cancel_token());
        let worker = tokio::spawn(crate::device::run(hub.clone(), conn));
        peer.send(json!({
            "type": "auth",
            "data": {"apiKey": "key", "deviceId": device_id, "userId": "u1", "organizationId": org}
        }))
        .await;
        assert_eq!(peer.next().await.unwrap().msg_type, MessageType::AuthAck);
        (worker, peer)
    }

    #[tokio::test]
    async fn requests_before_subscribe_are_refused() {
        let hub = hub();
        let (_worker, mut peer) = start(&hub);
        peer.send(json!({"type": "list_devices", "requestId": "r1"})).await;

        let err = peer.next().await.unwrap();
        assert_eq!(err.msg_type, MessageType::Error);
        assert_eq!(err.request_id.as_deref(), Some("r1"));
        assert_eq!(err.data_value().unwrap()["code"], ERR_NOT_AUTHENTICATED);
    }

    #[tokio::test]
    async fn rejected_subscribe_closes() {
        let hub = hub();
        let (worker, mut peer) = start(&hub);
        peer.send(json!({"type": "subscribe", "data": {"apiKey": "bad", "organizationId": "org-a"}}))
            .await;
        let err = peer.next().await.unwrap();
        assert_eq!(err.data_value().unwrap()["code"], ERR_AUTH_REJECTED);
        assert!(peer.next().await.is_none());
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn subscribe_is_idempotent() {
        let hub = hub();
        let (_worker, mut peer) = start(&hub);
        let frame = json!({"type": "subscribe", "data": {"apiKey": "key", "organizationId": "org-a"}});

        peer.send(frame.clone()).await;
        let first = peer.next().await.unwrap().data_value().unwrap();
        peer.send(frame).await;
        let second = peer.next().await.unwrap().data_value().unwrap();

        assert_eq!(first["subscriptionId"], second["subscriptionId"]);
        assert_eq!(hub.stats().observers, 1);
    }

    #[tokio::test]
    async fn events_are_scoped_to_organization() {
        let hub = hub();
        let (_a_worker, mut observer_a) = subscribed(&hub, "org-a").await;
        let (_b_worker, mut observer_b) = subscribed(&hub, "org-b").await;

        let (_d, _dp) = device(&hub, "d-b", "org-b").await;
        let (_d, _dp2) = device(&hub, "d-a", "org-a").await;

        let ev = observer_a.next().await.unwrap();
        assert_eq!(ev.msg_type, MessageType::Event);
        let data = ev.data_value().unwrap();
        assert_eq!(data["type"], "status-change");
        assert_eq!(data["organizationId"], "org-a");
        assert_eq!(data["deviceId"], "d-a");

        let ev = observer_b.next().await.unwrap();
        assert_eq!(ev.data_value().unwrap()["deviceId"], "d-b");
        assert!(observer_a.outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn list_devices_only_shows_own_organization() {
        let hub = hub();
        let (_d1, _p1) = device(&hub, "d1", "org-a").await;
        let (_d2, _p2) = device(&hub, "d2", "org-b").await;
        let (_worker, mut peer) = subscribed(&hub, "org-a").await;

        peer.send(json!({"type": "list_devices", "requestId": "r2"})).await;
        let list = peer.next().await.unwrap();
        assert_eq!(list.msg_type, MessageType::DeviceList);
        assert_eq!(list.request_id.as_deref(), Some("r2"));
        let devices = list.data_value().unwrap()["devices"].clone();
        assert_eq!(devices.as_array().unwrap().len(), 1);
        assert_eq!(devices[0]["deviceId"], "d1");
        assert_eq!(devices[0]["status"], "online");
    }

    #[tokio::test]
    async fn dispatch_command_round_trip() {
        let hub = hub();
        let (_d, mut device_peer) = device(&hub, "d1", "org-a").await;
        let (_worker, mut peer) = subscribed(&hub, "org-a").await;

        peer.send(json!({
            "type": "dispatch_command",
            "requestId": "admin-1",
            "data": {"deviceId": "d1", "action": "getSystemInfo", "timeoutMs": 3000}
        }))
        .await;

        let cmd = device_peer.next().await.unwrap();
        let request_id = cmd.request_id.unwrap();
        device_peer
            .send(json!({
                "type": "command_response",
                "requestId": request_id,
                "data": {"systemInfo": {"osVersion": "Win32"}}
            }))
            .await;

        let result = peer.next().await.unwrap();
        assert_eq!(result.msg_type, MessageType::CommandResult);
        assert_eq!(result.request_id.as_deref(), Some("admin-1"));
        let data = result.data_value().unwrap();
        assert_eq!(data["outcome"], "success");
        assert_eq!(data["payload"]["systemInfo"]["osVersion"], "Win32");
        assert_eq!(data["bestEffort"], false);
    }

    #[tokio::test]
    async fn dispatch_to_other_organization_is_offline() {
        let hub = hub();
        let (_d, _dp) = device(&hub, "d1", "org-b").await;
        let (_worker, mut peer) = subscribed(&hub, "org-a").await;

        peer.send(json!({
            "type": "dispatch_command",
            "requestId": "admin-2",
            "data": {"deviceId": "d1", "action": "getSystemInfo"}
        }))
        .await;
        let result = peer.next().await.unwrap();
        assert_eq!(result.data_value().unwrap()["outcome"], "device_offline");
    }

    #[tokio::test(start_paused = true)]
    async fn slow_command_does_not_block_events() {
        let hub = hub();
        let (_d, mut device_peer) = device(&hub, "d1", "org-a").await;
        let (_worker, mut peer) = subscribed(&hub, "org-a").await;

        peer.send(json!({
            "type": "dispatch_command",
            "requestId": "slow",
            "data": {"deviceId": "d1", "action": "getSystemInfo", "timeoutMs": 3000}
        }))
        .await;
        device_peer.next().await.unwrap();

        device_peer
            .send(json!({"type": "issue", "data": {"description": "usb inserted"}}))
            .await;
        let ev = peer.next().await.unwrap();
        assert_eq!(ev.msg_type, MessageType::Event);
        assert_eq!(ev.data_value().unwrap()["type"], "issue");

        let result = peer.next().await.unwrap();
        assert_eq!(result.request_id.as_deref(), Some("slow"));
        assert_eq!(result.data_value().unwrap()["outcome"], "timeout");
    }

    #[tokio::test(start_paused = true)]
    async fn commands_in_flight_are_capped() {
        let hub = hub_with(HubConfig {
            max_commands_per_observer: 1,
            request_system_info_on_auth: false,
            ..Default::default()
        });
        let (_d, mut device_peer) = device(&hub, "d1", "org-a").await;
        let (_worker, mut peer) = subscribed(&hub, "org-a").await;

        for id in ["first", "second"] {
            peer.send(json!({
                "type": "dispatch_command",
                "requestId": id,
                "data": {"deviceId": "d1", "action": "getSystemInfo", "timeoutMs": 3000}
            }))
            .await;
        }

        let refused = peer.next().await.unwrap();
        assert_eq!(refused.request_id.as_deref(), Some("second"));
        assert_eq!(refused.data_value().unwrap()["outcome"], "rejected");
        device_peer.next().await.unwrap();
        assert_eq!(hub.stats().pending_commands, 1);

        let first = peer.next().await.unwrap();
        assert_eq!(first.request_id.as_deref(), Some("first"));
        assert_eq!(first.data_value().unwrap()["outcome"], "timeout");
        tokio::time::sleep(Duration::from_millis(1)).await;

        // The permit is back once the first command resolved.
        peer.send(json!({
            "type": "dispatch_command",
            "requestId": "third",
            "data": {"deviceId": "d1", "action": "getSystemInfo", "timeoutMs": 3000}
        }))
        .await;
        device_peer.next().await.unwrap();
        assert_eq!(hub.stats().pending_commands, 1);
    }

    #[test]
    fn command_results_map_outcomes() {
        let went = command_result(Err(CommandError::DeviceWentOffline {
            request_id: "r9".into(),
        }));
        assert_eq!(went.outcome, CommandOutcome::DeviceWentOffline);
        assert_eq!(went.device_request_id.as_deref(), Some("r9"));

        let invalid = command_result(Err(CommandError::InvalidCommand("empty".into())));
        assert_eq!(invalid.outcome, CommandOutcome::Rejected);
    }
}
