use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::MessageType;
use crate::messages::ErrorPayload;

/// Envelope for all WebSocket communication.
///
/// The `data` field uses `serde_json::value::RawValue` to defer
/// deserialization until the message type is known. Timestamps are
/// RFC 3339 in UTC on both directions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Box<serde_json::value::RawValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl Envelope {
    /// Creates a new envelope stamped with the current time.
    pub fn new<T: Serialize>(
        msg_type: MessageType,
        data: Option<&T>,
    ) -> Result<Self, serde_json::Error> {
        let raw = match data {
            Some(d) => {
                let json = serde_json::to_string(d)?;
                Some(serde_json::value::RawValue::from_string(json)?)
            }
            None => None,
        };
        Ok(Self {
            msg_type,
            request_id: None,
            device_id: None,
            data: raw,
            timestamp: Some(Utc::now()),
        })
    }

    /// Creates an `error` envelope.
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        let payload = ErrorPayload::new(code, message);
        // ErrorPayload is two strings; serializing it cannot fail.
        let data = serde_json::to_string(&payload)
            .ok()
            .and_then(|json| serde_json::value::RawValue::from_string(json).ok());
        Self {
            msg_type: MessageType::Error,
            request_id: None,
            device_id: None,
            data,
            timestamp: Some(Utc::now()),
        }
    }

    /// Sets the correlation id.
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Sets the device id.
    pub fn with_device_id(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    /// Deserializes the data into the given type.
    pub fn parse_data<T: for<'de> Deserialize<'de>>(
        &self,
    ) -> Result<Option<T>, serde_json::Error> {
        match &self.data {
            Some(raw) => Ok(Some(serde_json::from_str(raw.get())?)),
            None => Ok(None),
        }
    }

    /// Returns the data as a generic JSON value (`{}` when absent).
    pub fn data_value(&self) -> Result<serde_json::Value, serde_json::Error> {
        Ok(self
            .parse_data::<serde_json::Value>()?
            .unwrap_or_else(|| serde_json::Value::Object(Default::default())))
    }
}
