use std::time::Duration;

use tokio::sync::Semaphore;

use threateye_protocol::constants::{
    DEFAULT_COMMAND_TIMEOUT, DEFAULT_HEARTBEAT_INTERVAL, MAX_COMMAND_TIMEOUT,
};

/// Runtime settings for a [`Hub`](crate::Hub) and its listener.
#[derive(Debug, Clone, PartialEq)]
pub struct HubConfig {
    /// TCP port to listen on (0 = OS-assigned).
    pub port: u16,
    /// Expected gap between device messages. One silent interval degrades
    /// a session, two take it offline.
    pub heartbeat_interval: Duration,
    /// Used when a dispatch does not name a timeout.
    pub command_timeout: Duration,
    /// Upper bound for any requested timeout.
    pub max_command_timeout: Duration,
    /// Events buffered per observer before the oldest are dropped.
    pub observer_queue_capacity: usize,
    /// Outbound frames buffered per connection.
    pub send_buffer_size: usize,
    /// Classifier calls allowed to run at once.
    pub max_inflight_classifications: usize,
    /// Commands one observer may have waiting on devices at once.
    pub max_commands_per_observer: usize,
    /// Ask each device for `getSystemInfo` right after it authenticates.
    pub request_system_info_on_auth: bool,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            max_command_timeout: MAX_COMMAND_TIMEOUT,
            observer_queue_capacity: 256,
            send_buffer_size: 256,
            max_inflight_classifications: 64,
            max_commands_per_observer: 32,
            request_system_info_on_auth: true,
        }
    }
}

impl HubConfig {
    /// Longest heartbeat interval the hub will run with.
    pub const MAX_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(3600);

    /// Most classifier calls that can be allowed at once.
    pub const MAX_INFLIGHT_CLASSIFICATIONS: usize = Semaphore::MAX_PERMITS;

    /// Pulls out-of-range values back into the supported range.
    pub fn clamped(mut self) -> Self {
        self.heartbeat_interval = self
            .heartbeat_interval
            .clamp(Duration::from_secs(1), Self::MAX_HEARTBEAT_INTERVAL);
        self.max_inflight_classifications = self
            .max_inflight_classifications
            .min(Self::MAX_INFLIGHT_CLASSIFICATIONS);
        self.max_commands_per_observer = self
            .max_commands_per_observer
            .clamp(1, Semaphore::MAX_PERMITS);
        self
    }

    /// The timeout to use for a dispatch, clamped to the maximum.
    pub fn effective_timeout(&self, requested: Option<Duration>) -> Duration {
        requested
            .unwrap_or(self.command_timeout)
            .min(self.max_command_timeout)
    }

    /// How long a connection may stay unauthenticated.
    pub fn auth_deadline(&self) -> Duration {
        self.heartbeat_interval.saturating_mul(2)
    }
}
