//! The live record of one authenticated device.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use uuid::Uuid;

use threateye_protocol::{DeviceSummary, Envelope, TelemetrySnapshot};

use crate::state::{SessionEvent, SessionState, Transition, TransitionError};

/// Outbound half of a device connection, as seen by the session layer.
///
/// Implemented by the transport. Sends never block: a full buffer or a
/// dead connection is reported immediately and not retried.
pub trait DeviceLink: Send + Sync + 'static {
    /// Queues an envelope for delivery.
    fn send(&self, envelope: Envelope) -> Result<(), LinkError>;

    /// Closes the connection after flushing queued frames.
    fn close(&self, reason: CloseReason);

    /// Returns `true` while the connection is still open.
    fn is_open(&self) -> bool;
}

/// Why a write to a device failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum LinkError {
    #[error("send buffer full")]
    Full,

    #[error("connection lost")]
    ConnectionLost,
}

/// Why the hub is closing a device connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Normal,
    AuthRejected,
    Evicted,
    HeartbeatTimeout,
    Shutdown,
}

/// Unique id of one session instance (a device may have many over time).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identity established at authentication. Immutable afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub device_id: String,
    pub user_id: String,
    pub organization_id: String,
}

#[derive(Debug)]
struct Activity {
    last_active: DateTime<Utc>,
    last_telemetry: Option<TelemetrySnapshot>,
}

/// State of a connection that has no identity yet.
///
/// Starts in `Connecting`. The worker drives it through authentication and
/// either hands it to [`DeviceSession::from_pending`] or ends it here.
/// Receivers taken from [`watch`](Self::watch) keep following the state
/// after the hand-over.
#[derive(Debug)]
pub struct PendingSession {
    state: watch::Sender<SessionState>,
}

impl PendingSession {
    pub fn new() -> Self {
        let (state, _) = watch::channel(SessionState::Connecting);
        Self { state }
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn apply(&self, event: SessionEvent) -> Result<Transition, TransitionError> {
        apply(&self.state, event)
    }
}

impl Default for PendingSession {
    fn default() -> Self {
        Self::new()
    }
}

/// One connected device.
///
/// The session owns its link; the state lives in a `watch` channel so the
/// connection worker notices transitions made elsewhere (eviction).
pub struct DeviceSession {
    id: SessionId,
    identity: DeviceIdentity,
    link: Arc<dyn DeviceLink>,
    connected_at: DateTime<Utc>,
    state: watch::Sender<SessionState>,
    activity: Mutex<Activity>,
}

impl DeviceSession {
    /// Creates a session in `Authenticating`; the registry moves it online.
    pub fn new(identity: DeviceIdentity, link: Arc<dyn DeviceLink>) -> Arc<Self> {
        let pending = PendingSession::new();
        let _ = pending.apply(SessionEvent::AuthReceived);
        Self::from_pending(pending, identity, link)
    }

    /// Takes over the state of a connection whose credentials were accepted.
    pub fn from_pending(
        pending: PendingSession,
        identity: DeviceIdentity,
        link: Arc<dyn DeviceLink>,
    ) -> Arc<Self> {
        let now = Utc::now();
        Arc::new(Self {
            id: SessionId::new(),
            identity,
            link,
            connected_at: now,
            state: pending.state,
            activity: Mutex::new(Activity {
                last_active: now,
                last_telemetry: None,
            }),
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn device_id(&self) -> &str {
        &self.identity.device_id
    }

    pub fn organization_id(&self) -> &str {
        &self.identity.organization_id
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Returns a receiver that observes every state change.
    pub fn watch(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Applies a state machine event atomically.
    pub fn apply(&self, event: SessionEvent) -> Result<Transition, TransitionError> {
        apply(&self.state, event)
    }

    /// Records inbound activity at the current time.
    pub fn touch(&self) {
        self.activity().last_active = Utc::now();
    }

    pub fn last_active(&self) -> DateTime<Utc> {
        self.activity().last_active
    }

    /// Replaces the last known telemetry. No history is kept.
    pub fn update_telemetry(&self, snapshot: TelemetrySnapshot) {
        self.activity().last_telemetry = Some(snapshot);
    }

    pub fn last_telemetry(&self) -> Option<TelemetrySnapshot> {
        self.activity().last_telemetry.clone()
    }

    /// Writes a frame to the device.
    pub fn send(&self, envelope: Envelope) -> Result<(), LinkError> {
        self.link.send(envelope)
    }

    /// Closes the device connection.
    pub fn close(&self, reason: CloseReason) {
        self.link.close(reason);
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_open()
    }

    /// Admin-facing view of the session.
    pub fn summary(&self) -> DeviceSummary {
        let activity = self.activity();
        DeviceSummary {
            device_id: self.identity.device_id.clone(),
            user_id: self.identity.user_id.clone(),
            organization_id: self.identity.organization_id.clone(),
            session_id: self.id.to_string(),
            status: self.state().into(),
            connected_at: self.connected_at,
            last_active: activity.last_active,
            system_info: activity
                .last_telemetry
                .as_ref()
                .and_then(|t| t.system_info.clone()),
        }
    }

    fn activity(&self) -> std::sync::MutexGuard<'_, Activity> {
        self.activity.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceSession")
            .field("id", &self.id)
            .field("device_id", &self.identity.device_id)
            .field("organization_id", &self.identity.organization_id)
            .field("state", &self.state())
            .finish()
    }
}

fn apply(
    state: &watch::Sender<SessionState>,
    event: SessionEvent,
) -> Result<Transition, TransitionError> {
    let mut outcome = Err(TransitionError::Terminal(SessionState::Offline));
    state.send_if_modified(|current| match current.transition(event) {
        Ok(next) => {
            outcome = Ok(Transition {
                from: *current,
                to: next,
            });
            let changed = next != *current;
            *current = next;
            changed
        }
        Err(e) => {
            outcome = Err(e);
            false
        }
    });
    outcome
}

/// Link test double that records frames in memory.
#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    #[derive(Default)]
    pub struct RecordingLink {
        pub sent: Mutex<Vec<Envelope>>,
        pub closed: Mutex<Option<CloseReason>>,
        pub broken: AtomicBool,
    }

    impl DeviceLink for RecordingLink {
        fn send(&self, envelope: Envelope) -> Result<(), LinkError> {
            if self.broken.load(Ordering::SeqCst) {
                return Err(LinkError::ConnectionLost);
            }
            self.sent.lock().unwrap().push(envelope);
            Ok(())
        }

        fn close(&self, reason: CloseReason) {
            *self.closed.lock().unwrap() = Some(reason);
        }

        fn is_open(&self) -> bool {
            self.closed.lock().unwrap().is_none()
        }
    }

    pub fn identity(device_id: &str, org: &str) -> DeviceIdentity {
        DeviceIdentity {
            device_id: device_id.into(),
            user_id: format!("user-of-{device_id}"),
            organization_id: org.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{RecordingLink, identity};
    use super::*;
    use threateye_protocol::{DeviceStatus, MessageType, SystemInfo};

    fn session() -> (Arc<DeviceSession>, Arc<RecordingLink>) {
        let link = Arc::new(RecordingLink::default());
        (DeviceSession::new(identity("d1", "org-a"), link.clone()), link)
    }

    #[test]
    fn starts_authenticating() {
        let (s, _) = session();
        assert_eq!(s.state(), SessionState::Authenticating);
        assert_eq!(s.device_id(), "d1");
    }

    #[test]
    fn pending_state_carries_into_session() {
        let pending = PendingSession::new();
        let rx = pending.watch();
        assert_eq!(pending.state(), SessionState::Connecting);
        pending.apply(SessionEvent::AuthReceived).unwrap();

        let s = DeviceSession::from_pending(pending, identity("d1", "org-a"), Arc::new(RecordingLink::default()));
        assert_eq!(s.state(), SessionState::Authenticating);
        s.apply(SessionEvent::AuthAccepted).unwrap();
        assert_eq!(*rx.borrow(), SessionState::Online);
    }

    #[test]
    fn pending_rejection_ends_offline() {
        let pending = PendingSession::new();
        assert!(pending.apply(SessionEvent::AuthRejected).is_err());
        pending.apply(SessionEvent::AuthReceived).unwrap();
        let t = pending.apply(SessionEvent::AuthRejected).unwrap();
        assert_eq!(t.from, SessionState::Authenticating);
        assert_eq!(t.to, SessionState::Offline);
        assert!(pending.apply(SessionEvent::TransportClosed).is_err());
    }

    #[test]
    fn apply_reports_transition() {
        let (s, _) = session();
        let t = s.apply(SessionEvent::AuthAccepted).unwrap();
        assert_eq!(t.from, SessionState::Authenticating);
        assert_eq!(t.to, SessionState::Online);
        assert!(t.changed());

        let t = s.apply(SessionEvent::MessageReceived).unwrap();
        assert!(!t.changed());
    }

    #[test]
    fn apply_refuses_after_terminal() {
        let (s, _) = session();
        s.apply(SessionEvent::AuthAccepted).unwrap();
        s.apply(SessionEvent::Superseded).unwrap();
        assert_eq!(
            s.apply(SessionEvent::MessageReceived),
            Err(TransitionError::Terminal(SessionState::Evicted))
        );
        assert_eq!(s.state(), SessionState::Evicted);
    }

    #[tokio::test]
    async fn watchers_see_changes() {
        let (s, _) = session();
        let mut rx = s.watch();
        s.apply(SessionEvent::AuthAccepted).unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), SessionState::Online);
    }

    #[test]
    fn telemetry_overwritten_wholesale() {
        let (s, _) = session();
        s.update_telemetry(TelemetrySnapshot::from_system_info(SystemInfo {
            os_version: "Win32".into(),
            ..Default::default()
        }));
        s.update_telemetry(TelemetrySnapshot::default());
        assert!(s.last_telemetry().unwrap().system_info.is_none());
    }

    #[test]
    fn summary_hides_connection() {
        let (s, _) = session();
        s.apply(SessionEvent::AuthAccepted).unwrap();
        s.update_telemetry(TelemetrySnapshot::from_system_info(SystemInfo {
            cpu_usage: 33.0,
            ..Default::default()
        }));
        let summary = s.summary();
        assert_eq!(summary.status, DeviceStatus::Online);
        assert_eq!(summary.session_id, s.id().to_string());
        assert_eq!(summary.system_info.unwrap().cpu_usage, 33.0);
    }

    #[test]
    fn send_and_close_go_through_link() {
        let (s, link) = session();
        let env = Envelope::new::<()>(MessageType::Heartbeat, None).unwrap();
        s.send(env).unwrap();
        assert_eq!(link.sent.lock().unwrap().len(), 1);

        s.close(CloseReason::Evicted);
        assert!(!s.is_connected());
        assert_eq!(*link.closed.lock().unwrap(), Some(CloseReason::Evicted));
    }

    #[test]
    fn touch_moves_last_active_forward() {
        let (s, _) = session();
        let before = s.last_active();
        s.touch();
        assert!(s.last_active() >= before);
    }
}
