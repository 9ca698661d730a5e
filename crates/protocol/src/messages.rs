use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::telemetry::SystemInfo;

// ---------------------------------------------------------------------------
// Shared payloads
// ---------------------------------------------------------------------------

/// Body of `error` and `auth_error` messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

impl ErrorPayload {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_owned(),
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Device payloads
// ---------------------------------------------------------------------------

/// First message a device sends after connecting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthRequest {
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub device_id: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub organization_id: String,
}

impl AuthRequest {
    /// Returns the name of the first empty field, if any.
    pub fn missing_field(&self) -> Option<&'static str> {
        [
            ("apiKey", &self.api_key),
            ("deviceId", &self.device_id),
            ("userId", &self.user_id),
            ("organizationId", &self.organization_id),
        ]
        .into_iter()
        .find(|(_, v)| v.trim().is_empty())
        .map(|(name, _)| name)
    }
}

/// Sent to a device once its session is online.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthAck {
    pub device_id: String,
    pub session_id: String,
    pub message: String,
    /// Seconds between expected heartbeats.
    pub heartbeat_interval: u64,
}

/// Command pushed to a device.
///
/// The request id is repeated inside the data because older device clients
/// read it from there and echo it back in `data.requestId`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandPayload {
    pub action: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
    pub request_id: String,
}

/// A problem detected locally by the device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueReport {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// What an `ack` acknowledges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckKind {
    Telemetry,
    Issue,
}

/// Receipt for telemetry and issue frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckPayload {
    pub kind: AckKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issue_id: Option<Value>,
}

// ---------------------------------------------------------------------------
// Observer payloads
// ---------------------------------------------------------------------------

/// First message an admin dashboard sends after connecting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeRequest {
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub organization_id: String,
}

/// Confirms an observer subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribedResponse {
    pub organization_id: String,
    pub subscription_id: String,
}

/// Asks the hub to run a command on a device of the observer's organization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchCommandRequest {
    pub device_id: String,
    pub action: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// How a dispatched command ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandOutcome {
    Success,
    Timeout,
    DeviceOffline,
    DeviceWentOffline,
    Rejected,
}

/// Result of a `dispatch_command` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResultResponse {
    pub outcome: CommandOutcome,
    /// Correlation id the hub used toward the device, when one was issued.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default)]
    pub best_effort: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Lifecycle state of a device session as shown to administrators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Connecting,
    Authenticating,
    Online,
    Degraded,
    Offline,
    Evicted,
}

/// One entry of a `device_list`. Never carries connection details.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSummary {
    pub device_id: String,
    pub user_id: String,
    pub organization_id: String,
    pub session_id: String,
    pub status: DeviceStatus,
    pub connected_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_info: Option<SystemInfo>,
}

/// Reply to `list_devices`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceListResponse {
    pub devices: Vec<DeviceSummary>,
}
