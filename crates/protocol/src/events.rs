//! Security events fanned out to admin dashboards.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::messages::{DeviceStatus, IssueReport};

/// Event category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    Threat,
    Issue,
    StatusChange,
}

/// Severity assigned by the content classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreatLevel {
    Low,
    Medium,
    High,
    Critical,
}

/// Verdict returned by the external content classifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreatVerdict {
    pub level: ThreatLevel,
    /// Classifier-defined category, e.g. `behavior` or `content`.
    #[serde(rename = "type")]
    pub kind: String,
    pub description: String,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub details: Value,
}

/// Payload of a `status-change` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusChange {
    pub from: DeviceStatus,
    pub to: DeviceStatus,
    pub session_id: String,
}

/// Event delivered to observers: `{type, organizationId, deviceId, payload, timestamp}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HubEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub organization_id: String,
    pub device_id: String,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl HubEvent {
    fn new(kind: EventKind, organization_id: &str, device_id: &str, payload: Value) -> Self {
        Self {
            kind,
            organization_id: organization_id.to_owned(),
            device_id: device_id.to_owned(),
            payload,
            timestamp: Utc::now(),
        }
    }

    /// A classifier verdict for a device's telemetry.
    pub fn threat(organization_id: &str, device_id: &str, verdict: &ThreatVerdict) -> Self {
        let payload = serde_json::to_value(verdict).unwrap_or(Value::Null);
        Self::new(EventKind::Threat, organization_id, device_id, payload)
    }

    /// A problem reported by the device itself.
    pub fn issue(organization_id: &str, device_id: &str, report: &IssueReport) -> Self {
        let payload = serde_json::to_value(report).unwrap_or(Value::Null);
        Self::new(EventKind::Issue, organization_id, device_id, payload)
    }

    /// A session lifecycle transition.
    pub fn status_change(organization_id: &str, device_id: &str, change: &StatusChange) -> Self {
        let payload = serde_json::to_value(change).unwrap_or(Value::Null);
        Self::new(EventKind::StatusChange, organization_id, device_id, payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_kind_wire_names() {
        assert_eq!(
            serde_json::to_string(&EventKind::StatusChange).unwrap(),
            "\"status-change\""
        );
        assert_eq!(serde_json::to_string(&EventKind::Threat).unwrap(), "\"threat\"");
    }

    #[test]
    fn threat_event_shape() {
        let verdict = ThreatVerdict {
            level: ThreatLevel::High,
            kind: "behavior".into(),
            description: "Suspicious patterns in user activity".into(),
            confidence: 0.85,
            details: Value::Null,
        };
        let ev = HubEvent::threat("org-a", "d1", &verdict);
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "threat");
        assert_eq!(json["organizationId"], "org-a");
        assert_eq!(json["deviceId"], "d1");
        assert_eq!(json["payload"]["level"], "high");
        assert_eq!(json["payload"]["type"], "behavior");
        assert!(json["timestamp"].is_string());
    }

    #[test]
    fn status_change_payload() {
        let change = StatusChange {
            from: DeviceStatus::Online,
            to: DeviceStatus::Degraded,
            session_id: "s1".into(),
        };
        let ev = HubEvent::status_change("org-a", "d1", &change);
        assert_eq!(ev.kind, EventKind::StatusChange);
        assert_eq!(ev.payload["to"], "degraded");
    }

    #[test]
    fn threat_levels_order() {
        assert!(ThreatLevel::Critical > ThreatLevel::High);
        assert!(ThreatLevel::Low < ThreatLevel::Medium);
    }
}
