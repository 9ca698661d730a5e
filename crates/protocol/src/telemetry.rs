use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Periodic snapshot reported by a device.
///
/// Only `systemInfo` is interpreted by the hub. Everything else (screenshot,
/// audio transcript, activity data) is kept as-is for the classifier.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetrySnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_info: Option<SystemInfo>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TelemetrySnapshot {
    /// Snapshot carrying only system information.
    pub fn from_system_info(info: SystemInfo) -> Self {
        Self {
            system_info: Some(info),
            extra: Map::new(),
        }
    }
}

/// Host details collected by the device agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemInfo {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub os_version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub browser: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub screen_resolution: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub timezone: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ip_address: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub running_processes: Vec<String>,
    #[serde(default)]
    pub memory_usage: f64,
    #[serde(default)]
    pub cpu_usage: f64,
    #[serde(default)]
    pub disk_usage: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battery_level: Option<f64>,
    #[serde(default)]
    pub network_connections: u32,
}
