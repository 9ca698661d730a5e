//! The hub: shared state behind every connection worker.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use threateye_commands::{Command, CommandCorrelator, CommandError, CommandReply};
use threateye_fanout::{EventBus, Subscription};
use threateye_protocol::constants::{ACTION_GET_SYSTEM_INFO, ERR_SESSION_EVICTED};
use threateye_protocol::messages::{AuthRequest, IssueReport, SubscribeRequest};
use threateye_protocol::{
    DeviceSummary, Envelope, HubEvent, StatusChange, SystemInfo, TelemetrySnapshot,
};
use threateye_sessions::{
    CloseReason, DeviceIdentity, DeviceLink, DeviceSession, PendingSession, SessionEvent,
    SessionRegistry, SessionState, Transition,
};

use crate::collaborators::{AuthVerdict, ContentClassifier, CredentialValidator};
use crate::config::HubConfig;

/// Point-in-time counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HubStats {
    pub sessions_online: usize,
    pub sessions_registered: usize,
    pub pending_commands: usize,
    pub observers: usize,
    pub events_published: u64,
    pub events_dropped: u64,
    pub classifications_skipped: u64,
}

/// Why a device could not be admitted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdmitError {
    #[error("{0}")]
    Rejected(String),

    #[error("connection closed during authentication")]
    Abandoned,
}

pub struct Hub {
    config: HubConfig,
    registry: Arc<SessionRegistry>,
    correlator: CommandCorrelator,
    bus: Arc<EventBus<HubEvent>>,
    validator: Arc<dyn CredentialValidator>,
    classifier: Arc<dyn ContentClassifier>,
    classify_permits: Arc<Semaphore>,
    classifications_skipped: AtomicU64,
    cancel: CancellationToken,
}

impl Hub {
    pub fn new(
        config: HubConfig,
        validator: Arc<dyn CredentialValidator>,
        classifier: Arc<dyn ContentClassifier>,
    ) -> Arc<Self> {
        let config = config.clamped();
        let registry = Arc::new(SessionRegistry::new());
        Arc::new(Self {
            correlator: CommandCorrelator::new(registry.clone()),
            bus: Arc::new(EventBus::new(config.observer_queue_capacity)),
            classify_permits: Arc::new(Semaphore::new(config.max_inflight_classifications)),
            classifications_skipped: AtomicU64::new(0),
            cancel: CancellationToken::new(),
            registry,
            validator,
            classifier,
            config,
        })
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Runs `command` on `device_id` and waits for the reply.
    ///
    /// `timeout` defaults to the configured command timeout and is clamped
    /// to the configured maximum.
    pub async fn dispatch(
        &self,
        device_id: &str,
        command: Command,
        timeout: Option<Duration>,
    ) -> Result<CommandReply, CommandError> {
        let timeout = self.config.effective_timeout(timeout);
        self.correlator.dispatch(device_id, command, timeout).await
    }

    /// Like [`dispatch`](Self::dispatch), but only for devices of
    /// `organization_id`. Devices of other organizations look offline.
    pub async fn dispatch_for_organization(
        &self,
        organization_id: &str,
        device_id: &str,
        command: Command,
        timeout: Option<Duration>,
    ) -> Result<CommandReply, CommandError> {
        let timeout = self.config.effective_timeout(timeout);
        self.correlator
            .dispatch_for_organization(organization_id, device_id, command, timeout)
            .await
    }

    pub fn list_by_organization(&self, organization_id: &str) -> Vec<DeviceSummary> {
        self.registry.list_by_organization(organization_id)
    }

    /// Opens an in-process subscription to one organization's events.
    pub fn subscribe(&self, organization_id: &str) -> Subscription<HubEvent> {
        self.bus.subscribe(organization_id)
    }

    /// Current state of the device's registered session, if it has one.
    pub fn session_state(&self, device_id: &str) -> Option<SessionState> {
        self.registry.lookup(device_id).ok().map(|s| s.state())
    }

    pub fn stats(&self) -> HubStats {
        let bus = self.bus.stats();
        HubStats {
            sessions_online: self.registry.live_count(),
            sessions_registered: self.registry.len(),
            pending_commands: self.correlator.pending_count(),
            observers: bus.subscribers,
            events_published: bus.published,
            events_dropped: bus.dropped,
            classifications_skipped: self.classifications_skipped.load(Ordering::Relaxed),
        }
    }

    /// Stops accepting connections and ends every worker.
    pub fn shutdown(&self) {
        info!("hub shutting down");
        self.cancel.cancel();
        self.bus.close_all();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Token cancelled on shutdown; connection workers derive from it.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Validates `request` and installs a session for it, evicting any
    /// session the device already had.
    ///
    /// `pending` is the connection's state so far. It ends `Offline` here
    /// when the credentials are refused or the connection goes away.
    pub(crate) async fn admit(
        &self,
        request: AuthRequest,
        link: Arc<dyn DeviceLink>,
        pending: PendingSession,
    ) -> Result<Arc<DeviceSession>, AdmitError> {
        if let Err(e) = pending.apply(SessionEvent::AuthReceived) {
            debug!(device_id = %request.device_id, "admission abandoned: {e}");
            return Err(AdmitError::Abandoned);
        }
        if let Some(field) = request.missing_field() {
            return Err(reject(&pending, format!("missing {field}")));
        }
        let verdict = tokio::time::timeout(self.config.auth_deadline(), self.validator.validate(&request))
            .await
            .unwrap_or_else(|_| {
                warn!(device_id = %request.device_id, "credential validation timed out");
                AuthVerdict::Rejected("authentication timed out".into())
            });
        if let AuthVerdict::Rejected(reason) = verdict {
            info!(device_id = %request.device_id, org = %request.organization_id, "authentication rejected: {reason}");
            return Err(reject(&pending, reason));
        }
        if !link.is_open() {
            let _ = pending.apply(SessionEvent::TransportClosed);
            return Err(AdmitError::Abandoned);
        }

        let session = DeviceSession::from_pending(
            pending,
            DeviceIdentity {
                device_id: request.device_id,
                user_id: request.user_id,
                organization_id: request.organization_id,
            },
            link,
        );
        let registration = match self.registry.evict_and_register(session.clone()) {
            Ok(registration) => registration,
            Err(e) => {
                debug!("admission abandoned: {e}");
                let _ = session.apply(SessionEvent::TransportClosed);
                return Err(AdmitError::Abandoned);
            }
        };

        if let Some((prior, transition)) = registration.evicted {
            self.publish_transition(&prior, transition);
            self.correlator.fail_session(prior.id());
            let _ = prior.send(Envelope::error(
                ERR_SESSION_EVICTED,
                "another connection authenticated as this device",
            ));
            prior.close(CloseReason::Evicted);
        }
        self.publish_transition(&session, registration.transition);
        Ok(session)
    }

    /// Ends a session: terminal state, registry removal, pending commands
    /// failed, connection closed.
    pub(crate) fn finish_session(&self, session: &Arc<DeviceSession>, reason: CloseReason) {
        if let Ok(transition) = session.apply(SessionEvent::TransportClosed) {
            self.publish_transition(session, transition);
        }
        self.registry.remove_session(session);
        self.correlator.fail_session(session.id());
        session.close(reason);
        info!(
            device_id = %session.device_id(),
            session_id = %session.id(),
            state = %session.state(),
            "session ended"
        );
    }

    /// Applies a liveness/activity event and publishes any change.
    pub(crate) fn advance(
        &self,
        session: &Arc<DeviceSession>,
        event: SessionEvent,
    ) -> Option<Transition> {
        let transition = session.apply(event).ok()?;
        self.publish_transition(session, transition);
        Some(transition)
    }

    /// Stores telemetry and queues it for classification.
    pub(crate) fn ingest_telemetry(
        self: &Arc<Self>,
        session: &Arc<DeviceSession>,
        snapshot: TelemetrySnapshot,
    ) {
        session.update_telemetry(snapshot.clone());

        let permit = match self.classify_permits.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                let skipped = self.classifications_skipped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(device_id = %session.device_id(), skipped, "classifier saturated, skipping telemetry");
                return;
            }
        };

        let hub = Arc::clone(self);
        let organization_id = session.organization_id().to_owned();
        let device_id = session.device_id().to_owned();
        tokio::spawn(async move {
            let _permit = permit;
            if let Some(verdict) = hub.classifier.classify(&snapshot).await {
                info!(device_id = %device_id, level = ?verdict.level, "threat detected");
                let event = HubEvent::threat(&organization_id, &device_id, &verdict);
                hub.bus.publish(&organization_id, event);
            }
        });
    }

    /// Publishes a device-reported issue to its organization.
    pub(crate) fn report_issue(&self, session: &DeviceSession, report: &IssueReport) {
        info!(device_id = %session.device_id(), level = ?report.level, "device reported issue");
        let event = HubEvent::issue(session.organization_id(), session.device_id(), report);
        self.bus.publish(session.organization_id(), event);
    }

    /// Asks a freshly authenticated device for its system information.
    pub(crate) fn request_system_info(self: &Arc<Self>, session: &Arc<DeviceSession>) {
        if !self.config.request_system_info_on_auth {
            return;
        }
        let hub = Arc::clone(self);
        let session = Arc::clone(session);
        tokio::spawn(async move {
            let reply = hub
                .dispatch(session.device_id(), Command::new(ACTION_GET_SYSTEM_INFO), None)
                .await;
            match reply {
                Ok(reply) => match parse_system_info(&reply.payload) {
                    Some(info) if session.state().is_live() => {
                        session.update_telemetry(TelemetrySnapshot::from_system_info(info));
                        debug!(device_id = %session.device_id(), "system info stored");
                    }
                    Some(_) => {}
                    None => warn!(device_id = %session.device_id(), "system info reply without systemInfo"),
                },
                Err(e) => debug!(device_id = %session.device_id(), "system info request failed: {e}"),
            }
        });
    }

    /// Routes a device reply to its pending command.
    pub(crate) fn resolve_command(
        &self,
        session: &DeviceSession,
        request_id: &str,
        payload: serde_json::Value,
    ) {
        self.correlator.resolve(session.id(), request_id, payload);
    }

    pub(crate) async fn authorize_observer(&self, request: &SubscribeRequest) -> AuthVerdict {
        if request.organization_id.trim().is_empty() {
            return AuthVerdict::Rejected("missing organizationId".into());
        }
        tokio::time::timeout(self.config.auth_deadline(), self.validator.validate_observer(request))
            .await
            .unwrap_or_else(|_| {
                warn!(org = %request.organization_id, "observer validation timed out");
                AuthVerdict::Rejected("authentication timed out".into())
            })
    }

    fn publish_transition(&self, session: &DeviceSession, transition: Transition) {
        if !transition.changed() {
            return;
        }
        debug!(
            device_id = %session.device_id(),
            from = %transition.from,
            to = %transition.to,
            "session state changed"
        );
        let change = StatusChange {
            from: transition.from.into(),
            to: transition.to.into(),
            session_id: session.id().to_string(),
        };
        let event = HubEvent::status_change(session.organization_id(), session.device_id(), &change);
        self.bus.publish(session.organization_id(), event);
    }
}

fn reject(pending: &PendingSession, reason: String) -> AdmitError {
    let _ = pending.apply(SessionEvent::AuthRejected);
    AdmitError::Rejected(reason)
}

/// Extracts `systemInfo` from a reply, accepting it bare as well.
fn parse_system_info(payload: &serde_json::Value) -> Option<SystemInfo> {
    let value = payload.get("systemInfo").unwrap_or(payload);
    if !value.is_object() {
        return None;
    }
    serde_json::from_value(value.clone()).ok()
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::collaborators::{AuthFuture, ClassifyFuture};
    use threateye_protocol::{ThreatLevel, ThreatVerdict};

    /// Accepts every key except `"bad"`, for devices and observers alike.
    pub struct AllowAll;

    impl CredentialValidator for AllowAll {
        fn validate<'a>(&'a self, request: &'a AuthRequest) -> AuthFuture<'a> {
            Box::pin(async move {
                if request.api_key == "bad" {
                    AuthVerdict::Rejected("Invalid API key".into())
                } else {
                    AuthVerdict::Authorized
                }
            })
        }

        fn validate_observer<'a>(&'a self, request: &'a SubscribeRequest) -> AuthFuture<'a> {
            Box::pin(async move {
                if request.api_key == "bad" {
                    AuthVerdict::Rejected("Invalid API key".into())
                } else {
                    AuthVerdict::Authorized
                }
            })
        }
    }

    /// Never answers.
    pub struct Stalled;

    impl CredentialValidator for Stalled {
        fn validate<'a>(&'a self, _request: &'a AuthRequest) -> AuthFuture<'a> {
            Box::pin(std::future::pending::<AuthVerdict>())
        }

        fn validate_observer<'a>(&'a self, _request: &'a SubscribeRequest) -> AuthFuture<'a> {
            Box::pin(std::future::pending::<AuthVerdict>())
        }
    }

    /// Flags any snapshot whose extra fields contain `"suspicious": true`.
    pub struct FlagSuspicious;

    impl ContentClassifier for FlagSuspicious {
        fn classify<'a>(&'a self, snapshot: &'a TelemetrySnapshot) -> ClassifyFuture<'a> {
            Box::pin(async move {
                let flagged = snapshot.extra.get("suspicious") == Some(&serde_json::Value::Bool(true));
                flagged.then(|| ThreatVerdict {
                    level: ThreatLevel::High,
                    kind: "behavior".into(),
                    description: "Suspicious patterns in user activity".into(),
                    confidence: 0.9,
                    details: serde_json::Value::Null,
                })
            })
        }
    }

    pub fn hub_with(config: HubConfig) -> Arc<Hub> {
        Hub::new(config, Arc::new(AllowAll), Arc::new(FlagSuspicious))
    }

    pub fn hub() -> Arc<Hub> {
        hub_with(HubConfig {
            request_system_info_on_auth: false,
            ..Default::default()
        })
    }

    pub fn auth(device_id: &str, org: &str) -> AuthRequest {
        AuthRequest {
            api_key: "key".into(),
            device_id: device_id.into(),
            user_id: "u1".into(),
            organization_id: org.into(),
        }
    }
}
