//! Per-device session lifecycle.
//!
//! All state changes go through [`SessionState::transition`]; anything not
//! listed there is rejected.

use std::fmt;

use threateye_protocol::DeviceStatus;

/// Lifecycle state of a device connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Transport open, no identity yet.
    Connecting,
    /// `auth` received, credentials being verified.
    Authenticating,
    /// Authenticated and installed in the registry.
    Online,
    /// One heartbeat interval missed. Commands are best-effort.
    Degraded,
    /// Terminal: connection gone, timed out or credentials rejected.
    Offline,
    /// Terminal: replaced by a newer authentication for the same device.
    Evicted,
}

/// Inputs that drive the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    AuthReceived,
    AuthAccepted,
    AuthRejected,
    HeartbeatMissed,
    MessageReceived,
    TransportClosed,
    Superseded,
}

/// A state change that was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("session already ended as {0}")]
    Terminal(SessionState),

    #[error("{event:?} is not valid in state {from}")]
    Invalid {
        from: SessionState,
        event: SessionEvent,
    },
}

/// An applied state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: SessionState,
    pub to: SessionState,
}

impl Transition {
    /// Returns `true` if the state actually changed.
    pub fn changed(&self) -> bool {
        self.from != self.to
    }
}

impl SessionState {
    /// Computes the next state for `event`.
    pub fn transition(self, event: SessionEvent) -> Result<SessionState, TransitionError> {
        use SessionEvent as E;
        use SessionState as S;

        if self.is_terminal() {
            return Err(TransitionError::Terminal(self));
        }

        let next = match (self, event) {
            (S::Connecting, E::AuthReceived) => S::Authenticating,
            (S::Authenticating, E::AuthAccepted) => S::Online,
            (S::Authenticating, E::AuthRejected) => S::Offline,
            (S::Online, E::HeartbeatMissed) => S::Degraded,
            (S::Degraded, E::HeartbeatMissed) => S::Offline,
            (S::Online | S::Degraded, E::MessageReceived) => S::Online,
            (S::Online | S::Degraded, E::Superseded) => S::Evicted,
            (_, E::TransportClosed) => S::Offline,
            (from, event) => return Err(TransitionError::Invalid { from, event }),
        };
        Ok(next)
    }

    /// `Offline` and `Evicted` end the session instance.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Offline | Self::Evicted)
    }

    /// Authenticated and still reachable.
    pub fn is_live(self) -> bool {
        matches!(self, Self::Online | Self::Degraded)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Connecting => "connecting",
            Self::Authenticating => "authenticating",
            Self::Online => "online",
            Self::Degraded => "degraded",
            Self::Offline => "offline",
            Self::Evicted => "evicted",
        };
        f.write_str(s)
    }
}

impl From<SessionState> for DeviceStatus {
    fn from(state: SessionState) -> Self {
        match state {
            SessionState::Connecting => DeviceStatus::Connecting,
            SessionState::Authenticating => DeviceStatus::Authenticating,
            SessionState::Online => DeviceStatus::Online,
            SessionState::Degraded => DeviceStatus::Degraded,
            SessionState::Offline => DeviceStatus::Offline,
            SessionState::Evicted => DeviceStatus::Evicted,
        }
    }
}
