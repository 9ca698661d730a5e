use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// How often the transport pings an idle peer.
///
/// Pings only keep NAT and proxy mappings alive; a pong is not counted as
/// session activity.
pub const WS_PING_PERIOD: Duration = Duration::from_secs(15);

/// Maximum inbound message size in bytes (1 MB).
///
/// Telemetry snapshots may carry a base64 screenshot, everything else is
/// far smaller.
pub const WS_MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Default expected heartbeat cadence of a device.
///
/// One missed interval degrades the session, a second consecutive miss
/// takes it offline.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Default time an administrator command waits for the device reply.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound for caller-supplied command timeouts.
pub const MAX_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// Command requested from every device right after it comes online.
pub const ACTION_GET_SYSTEM_INFO: &str = "getSystemInfo";

/// WebSocket message type identifier.
///
/// Serialized as the plain `type` string of the envelope. Device replies
/// using the older `<name>Response` naming (e.g. `systemInfoResponse`) are
/// kept as [`MessageType::LegacyResponse`] so they can still be correlated.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageType {
    // Device -> Hub
    Auth,
    Telemetry,
    Issue,
    CommandResponse,
    Heartbeat,

    // Hub -> Device
    AuthAck,
    AuthError,
    Command,
    Ack,

    // Observer -> Hub
    Subscribe,
    ListDevices,
    DispatchCommand,

    // Hub -> Observer
    Subscribed,
    DeviceList,
    CommandResult,
    Event,

    // Both directions
    Error,

    /// A device reply named after the command, e.g. `systemInfoResponse`.
    LegacyResponse(String),

    /// Forward compatibility: unknown message types deserialize here.
    Unknown(String),
}

impl MessageType {
    /// Maps a wire `type` string to its message type.
    pub fn from_wire(s: &str) -> Self {
        match s {
            "auth" => Self::Auth,
            // `monitoring` is the name older device clients use.
            "telemetry" | "monitoring" => Self::Telemetry,
            "issue" => Self::Issue,
            "command_response" => Self::CommandResponse,
            "heartbeat" => Self::Heartbeat,
            "auth_ack" => Self::AuthAck,
            "auth_error" => Self::AuthError,
            "command" => Self::Command,
            "ack" => Self::Ack,
            "subscribe" => Self::Subscribe,
            "list_devices" => Self::ListDevices,
            "dispatch_command" => Self::DispatchCommand,
            "subscribed" => Self::Subscribed,
            "device_list" => Self::DeviceList,
            "command_result" => Self::CommandResult,
            "event" => Self::Event,
            "error" => Self::Error,
            other if other.len() > "Response".len() && other.ends_with("Response") => {
                Self::LegacyResponse(other.to_owned())
            }
            other => Self::Unknown(other.to_owned()),
        }
    }

    /// The wire `type` string.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Auth => "auth",
            Self::Telemetry => "telemetry",
            Self::Issue => "issue",
            Self::CommandResponse => "command_response",
            Self::Heartbeat => "heartbeat",
            Self::AuthAck => "auth_ack",
            Self::AuthError => "auth_error",
            Self::Command => "command",
            Self::Ack => "ack",
            Self::Subscribe => "subscribe",
            Self::ListDevices => "list_devices",
            Self::DispatchCommand => "dispatch_command",
            Self::Subscribed => "subscribed",
            Self::DeviceList => "device_list",
            Self::CommandResult => "command_result",
            Self::Event => "event",
            Self::Error => "error",
            Self::LegacyResponse(s) | Self::Unknown(s) => s,
        }
    }

    /// Returns `true` for both reply spellings a device may use.
    pub fn is_command_response(&self) -> bool {
        matches!(self, Self::CommandResponse | Self::LegacyResponse(_))
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for MessageType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for MessageType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Self::from_wire(&s))
    }
}

/// Credentials were missing or rejected by the validator.
pub const ERR_AUTH_REJECTED: &str = "AUTH_ERROR";
/// A message other than `auth`/`subscribe` arrived before authentication.
pub const ERR_NOT_AUTHENTICATED: &str = "NOT_AUTHENTICATED";
/// A second `auth` arrived on an already authenticated connection.
pub const ERR_ALREADY_AUTHENTICATED: &str = "ALREADY_AUTHENTICATED";
/// The frame could not be decoded.
pub const ERR_MALFORMED_MESSAGE: &str = "MALFORMED_MESSAGE";
/// The frame decoded but its type is not valid on this endpoint.
pub const ERR_UNSUPPORTED_MESSAGE: &str = "UNSUPPORTED_MESSAGE";
/// The session was replaced by a newer authentication for the device.
pub const ERR_SESSION_EVICTED: &str = "SESSION_EVICTED";
