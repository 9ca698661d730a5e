fn main() {
    println!("Run `cargo test -p wire-compat` to execute wire compatibility tests.");
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use threateye_protocol::codec::{self, DeviceInbound, ObserverInbound};
    use threateye_protocol::messages::{
        AckPayload, AuthAck, AuthRequest, CommandPayload, CommandResultResponse,
        DeviceListResponse, DispatchCommandRequest, IssueReport, SubscribeRequest,
    };
    use threateye_protocol::{
        DeviceStatus, Envelope, EventKind, HubEvent, MessageType, StatusChange,
        TelemetrySnapshot, ThreatVerdict,
    };

    fn fixtures_dir() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures")
    }

    fn load_raw(name: &str) -> String {
        let path = fixtures_dir().join(name);
        fs::read_to_string(&path)
            .unwrap_or_else(|e| panic!("failed to read fixture {}: {e}", path.display()))
    }

    fn load_fixture(name: &str) -> serde_json::Value {
        serde_json::from_str(&load_raw(name))
            .unwrap_or_else(|e| panic!("failed to parse fixture {name}: {e}"))
    }

    /// Normalizes numbers so that `12` and `12.0` compare equal.
    ///
    /// Browser clients send integral floats without a fraction; `f64`
    /// fields re-serialize them with one.
    fn normalize_value(v: &serde_json::Value) -> serde_json::Value {
        match v {
            serde_json::Value::Number(n) => match n.as_f64() {
                Some(f) => serde_json::json!(f),
                None => v.clone(),
            },
            serde_json::Value::Object(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), normalize_value(v)))
                    .collect(),
            ),
            serde_json::Value::Array(arr) => {
                serde_json::Value::Array(arr.iter().map(normalize_value).collect())
            }
            _ => v.clone(),
        }
    }

    /// Deserializes a fixture, re-serializes it and compares the JSON.
    fn roundtrip_test<T>(name: &str) -> T
    where
        T: serde::de::DeserializeOwned + serde::Serialize,
    {
        let fixture = load_fixture(name);
        let parsed: T = serde_json::from_value(fixture.clone())
            .unwrap_or_else(|e| panic!("failed to deserialize {name}: {e}"));
        let reserialized = serde_json::to_value(&parsed)
            .unwrap_or_else(|e| panic!("failed to re-serialize {name}: {e}"));

        assert_eq!(
            normalize_value(&fixture),
            normalize_value(&reserialized),
            "roundtrip mismatch for {name}:\n  wire: {fixture}\n  rust: {reserialized}"
        );
        parsed
    }

    // --- Device payloads ---

    #[test]
    fn fixture_auth_request() {
        let req: AuthRequest = roundtrip_test("auth_request.json");
        assert_eq!(req.missing_field(), None);
    }

    #[test]
    fn fixture_auth_ack() {
        let ack: AuthAck = roundtrip_test("auth_ack.json");
        assert_eq!(ack.heartbeat_interval, 5);
    }

    #[test]
    fn fixture_command_payload() {
        let cmd: CommandPayload = roundtrip_test("command_payload.json");
        assert!(cmd.params.is_null());
    }

    #[test]
    fn fixture_issue_report() {
        let issue: IssueReport = roundtrip_test("issue_report.json");
        assert_eq!(issue.kind.as_deref(), Some("extension_disabled"));
    }

    #[test]
    fn fixture_ack_payload() {
        roundtrip_test::<AckPayload>("ack_payload.json");
    }

    #[test]
    fn fixture_telemetry_snapshot() {
        let snapshot: TelemetrySnapshot = roundtrip_test("telemetry_snapshot.json");
        let info = snapshot.system_info.unwrap();
        assert_eq!(info.running_processes.len(), 2);
        assert_eq!(info.battery_level, Some(87.0));
        assert!(snapshot.extra.contains_key("activityData"));
        assert!(snapshot.extra.contains_key("audioTranscript"));
    }

    // --- Observer payloads ---

    #[test]
    fn fixture_subscribe_request() {
        roundtrip_test::<SubscribeRequest>("subscribe_request.json");
    }

    #[test]
    fn fixture_dispatch_command_request() {
        let req: DispatchCommandRequest = roundtrip_test("dispatch_command_request.json");
        assert_eq!(req.timeout_ms, Some(3000));
    }

    #[test]
    fn fixture_command_result_response() {
        let result: CommandResultResponse = roundtrip_test("command_result_response.json");
        assert!(result.best_effort);
        assert_eq!(result.message, None);
    }

    #[test]
    fn fixture_device_list_response() {
        let list: DeviceListResponse = roundtrip_test("device_list_response.json");
        assert_eq!(list.devices.len(), 2);
        assert_eq!(list.devices[0].status, DeviceStatus::Degraded);
        assert!(list.devices[1].system_info.is_none());
    }

    #[test]
    fn fixture_hub_event_threat() {
        let event: HubEvent = roundtrip_test("hub_event_threat.json");
        assert_eq!(event.kind, EventKind::Threat);
        let verdict: ThreatVerdict = serde_json::from_value(event.payload).unwrap();
        assert_eq!(verdict.kind, "content");
    }

    #[test]
    fn fixture_hub_event_status_change() {
        let event: HubEvent = roundtrip_test("hub_event_status_change.json");
        assert_eq!(event.kind, EventKind::StatusChange);
        let change: StatusChange = serde_json::from_value(event.payload).unwrap();
        assert_eq!(change.from, DeviceStatus::Online);
        assert_eq!(change.to, DeviceStatus::Degraded);
    }

    // --- Envelopes and whole frames ---

    #[test]
    fn fixture_envelope_command() {
        // RawValue data only deserializes from text, not from a Value.
        let raw = load_raw("envelope_command.json");
        let env: Envelope = serde_json::from_str(&raw).unwrap();
        let reserialized = serde_json::to_value(&env).unwrap();
        assert_eq!(reserialized, load_fixture("envelope_command.json"));
        assert_eq!(env.msg_type, MessageType::Command);
        let cmd: CommandPayload = env.parse_data().unwrap().unwrap();
        assert_eq!(env.request_id.as_deref(), Some(cmd.request_id.as_str()));
    }

    #[test]
    fn legacy_monitoring_frame_decodes_as_telemetry() {
        let msg = codec::decode_device(&load_raw("frame_monitoring.json")).unwrap();
        assert_eq!(msg.device_id.as_deref(), Some("ws-lab-014"));
        match msg.message {
            DeviceInbound::Telemetry(snapshot) => {
                assert_eq!(snapshot.system_info.unwrap().cpu_usage, 33.1);
                assert!(snapshot.extra.contains_key("screenshot"));
            }
            other => panic!("expected telemetry, got {other:?}"),
        }
    }

    #[test]
    fn legacy_response_frame_carries_embedded_request_id() {
        let msg = codec::decode_device(&load_raw("frame_system_info_response.json")).unwrap();
        match msg.message {
            DeviceInbound::CommandResponse {
                request_id,
                payload,
            } => {
                assert_eq!(request_id, "3f6d2b8a-1c44-4e0b-8a77-52f1e0c9d6aa");
                assert_eq!(payload["systemInfo"]["timezone"], "America/Chicago");
                assert!(payload.get("requestId").is_none());
            }
            other => panic!("expected command response, got {other:?}"),
        }
    }

    #[test]
    fn dispatch_command_frame() {
        let msg = codec::decode_observer(&load_raw("frame_dispatch_command.json")).unwrap();
        assert_eq!(msg.message.request_id(), Some("dash-77"));
        match msg.message {
            ObserverInbound::DispatchCommand { request, .. } => {
                assert_eq!(request.action, "getSystemInfo");
                assert_eq!(request.timeout_ms, None);
            }
            other => panic!("expected dispatch_command, got {other:?}"),
        }
    }
}
