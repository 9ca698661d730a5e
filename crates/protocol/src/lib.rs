pub mod codec;
pub mod constants;
pub mod envelope;
pub mod events;
pub mod messages;
pub mod telemetry;

// Re-export primary types for convenience.
pub use codec::{CodecError, DeviceInbound, DeviceOutbound, Inbound, ObserverInbound, ObserverOutbound};
pub use constants::MessageType;
pub use envelope::Envelope;
pub use events::{EventKind, HubEvent, StatusChange, ThreatLevel, ThreatVerdict};
pub use messages::{DeviceStatus, DeviceSummary, ErrorPayload};
pub use telemetry::{SystemInfo, TelemetrySnapshot};
