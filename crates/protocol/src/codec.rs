//! Frame <-> typed message conversion for both hub endpoints.
//!
//! Decoding validates the envelope and the shape of `data` for the message
//! type. Whether a message is allowed in the current session phase is a
//! separate check ([`ensure_authenticated`]) because it depends on state the
//! codec does not own.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::constants::{MessageType, WS_MAX_MESSAGE_SIZE};
use crate::envelope::Envelope;
use crate::events::HubEvent;
use crate::messages::{
    AckPayload, AuthAck, AuthRequest, CommandPayload, CommandResultResponse,
    DeviceListResponse, DispatchCommandRequest, ErrorPayload, IssueReport, SubscribeRequest,
    SubscribedResponse,
};
use crate::telemetry::TelemetrySnapshot;

/// Errors produced while decoding or encoding frames.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("unsupported message type: {0}")]
    Unsupported(String),

    #[error("message exceeds max size ({size} > {max})")]
    TooLarge { size: usize, max: usize },

    #[error("not authenticated")]
    NotAuthenticated,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A decoded message plus the envelope fields every handler needs.
#[derive(Debug, Clone, PartialEq)]
pub struct Inbound<T> {
    pub message: T,
    pub device_id: Option<String>,
    /// Sender's timestamp, or receipt time when the frame carried none.
    pub timestamp: DateTime<Utc>,
}

/// Messages a monitored device may send.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceInbound {
    Auth(AuthRequest),
    Telemetry(TelemetrySnapshot),
    Issue(IssueReport),
    CommandResponse { request_id: String, payload: Value },
    Heartbeat,
}

impl DeviceInbound {
    /// Everything but `auth` needs an authenticated session.
    pub fn requires_auth(&self) -> bool {
        !matches!(self, Self::Auth(_))
    }

    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Auth(_) => "auth",
            Self::Telemetry(_) => "telemetry",
            Self::Issue(_) => "issue",
            Self::CommandResponse { .. } => "command_response",
            Self::Heartbeat => "heartbeat",
        }
    }
}

/// Messages an admin dashboard may send.
#[derive(Debug, Clone, PartialEq)]
pub enum ObserverInbound {
    Subscribe(SubscribeRequest),
    ListDevices { request_id: Option<String> },
    DispatchCommand {
        request_id: Option<String>,
        request: DispatchCommandRequest,
    },
}

impl ObserverInbound {
    pub fn requires_auth(&self) -> bool {
        !matches!(self, Self::Subscribe(_))
    }

    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::Subscribe(_) => None,
            Self::ListDevices { request_id } | Self::DispatchCommand { request_id, .. } => {
                request_id.as_deref()
            }
        }
    }
}

/// Messages the hub sends to a device.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceOutbound {
    AuthAck(AuthAck),
    AuthError(ErrorPayload),
    Command {
        device_id: String,
        command: CommandPayload,
    },
    Ack(AckPayload),
    Error(ErrorPayload),
}

impl DeviceOutbound {
    pub fn into_envelope(self) -> Result<Envelope, serde_json::Error> {
        match self {
            Self::AuthAck(ack) => {
                let device_id = ack.device_id.clone();
                Ok(Envelope::new(MessageType::AuthAck, Some(&ack))?.with_device_id(device_id))
            }
            Self::AuthError(err) => Envelope::new(MessageType::AuthError, Some(&err)),
            Self::Command { device_id, command } => {
                let request_id = command.request_id.clone();
                Ok(Envelope::new(MessageType::Command, Some(&command))?
                    .with_request_id(request_id)
                    .with_device_id(device_id))
            }
            Self::Ack(ack) => Envelope::new(MessageType::Ack, Some(&ack)),
            Self::Error(err) => Envelope::new(MessageType::Error, Some(&err)),
        }
    }
}

/// Messages the hub sends to an admin dashboard.
#[derive(Debug, Clone, PartialEq)]
pub enum ObserverOutbound {
    Subscribed(SubscribedResponse),
    DeviceList {
        request_id: Option<String>,
        list: DeviceListResponse,
    },
    CommandResult {
        request_id: Option<String>,
        result: CommandResultResponse,
    },
    Event(HubEvent),
    Error {
        request_id: Option<String>,
        error: ErrorPayload,
    },
}

impl ObserverOutbound {
    pub fn into_envelope(self) -> Result<Envelope, serde_json::Error> {
        let (env, request_id) = match self {
            Self::Subscribed(resp) => (Envelope::new(MessageType::Subscribed, Some(&resp))?, None),
            Self::DeviceList { request_id, list } => {
                (Envelope::new(MessageType::DeviceList, Some(&list))?, request_id)
            }
            Self::CommandResult { request_id, result } => {
                (Envelope::new(MessageType::CommandResult, Some(&result))?, request_id)
            }
            Self::Event(event) => {
                let device_id = event.device_id.clone();
                (
                    Envelope::new(MessageType::Event, Some(&event))?.with_device_id(device_id),
                    None,
                )
            }
            Self::Error { request_id, error } => {
                (Envelope::new(MessageType::Error, Some(&error))?, request_id)
            }
        };
        Ok(match request_id {
            Some(id) => env.with_request_id(id),
            None => env,
        })
    }
}

/// Parses the outer envelope of a frame.
pub fn decode_envelope(frame: &str) -> Result<Envelope, CodecError> {
    if frame.len() > WS_MAX_MESSAGE_SIZE {
        return Err(CodecError::TooLarge {
            size: frame.len(),
            max: WS_MAX_MESSAGE_SIZE,
        });
    }
    serde_json::from_str(frame).map_err(|e| CodecError::Malformed(e.to_string()))
}

/// Decodes a frame received on the device endpoint.
pub fn decode_device(frame: &str) -> Result<Inbound<DeviceInbound>, CodecError> {
    let env = decode_envelope(frame)?;
    let message = match &env.msg_type {
        MessageType::Auth => DeviceInbound::Auth(object_data(&env)?),
        MessageType::Telemetry => DeviceInbound::Telemetry(object_data(&env)?),
        MessageType::Issue => DeviceInbound::Issue(object_data(&env)?),
        MessageType::Heartbeat => DeviceInbound::Heartbeat,
        t if t.is_command_response() => command_response(&env)?,
        other => return Err(CodecError::Unsupported(other.to_string())),
    };
    Ok(inbound(env, message))
}

/// Decodes a frame received on the observer endpoint.
pub fn decode_observer(frame: &str) -> Result<Inbound<ObserverInbound>, CodecError> {
    let env = decode_envelope(frame)?;
    let message = match &env.msg_type {
        MessageType::Subscribe => ObserverInbound::Subscribe(object_data(&env)?),
        MessageType::ListDevices => ObserverInbound::ListDevices {
            request_id: env.request_id.clone(),
        },
        MessageType::DispatchCommand => ObserverInbound::DispatchCommand {
            request_id: env.request_id.clone(),
            request: object_data(&env)?,
        },
        other => return Err(CodecError::Unsupported(other.to_string())),
    };
    Ok(inbound(env, message))
}

/// Rejects messages that need a session when none exists yet.
pub fn ensure_authenticated(msg: &DeviceInbound, authenticated: bool) -> Result<(), CodecError> {
    if msg.requires_auth() && !authenticated {
        return Err(CodecError::NotAuthenticated);
    }
    Ok(())
}

/// Serializes an envelope into a text frame.
pub fn encode(env: &Envelope) -> Result<String, CodecError> {
    Ok(serde_json::to_string(env)?)
}

fn inbound<T>(env: Envelope, message: T) -> Inbound<T> {
    Inbound {
        message,
        device_id: env.device_id,
        timestamp: env.timestamp.unwrap_or_else(Utc::now),
    }
}

/// Parses `data` as `T`, requiring it to be a JSON object (absent = `{}`).
fn object_data<T: DeserializeOwned>(env: &Envelope) -> Result<T, CodecError> {
    let value = env
        .data_value()
        .map_err(|e| CodecError::Malformed(format!("invalid {} data: {e}", env.msg_type)))?;
    if !value.is_object() {
        return Err(CodecError::Malformed(format!(
            "{} data must be an object",
            env.msg_type
        )));
    }
    serde_json::from_value(value)
        .map_err(|e| CodecError::Malformed(format!("invalid {} data: {e}", env.msg_type)))
}

/// Builds a command response, taking the request id from the envelope or,
/// for older clients, from `data.requestId`.
fn command_response(env: &Envelope) -> Result<DeviceInbound, CodecError> {
    let mut payload: Value = object_data(env)?;
    let embedded = payload
        .as_object_mut()
        .and_then(|map| map.remove("requestId"))
        .and_then(|v| v.as_str().map(str::to_owned));

    let request_id = env
        .request_id
        .clone()
        .or(embedded)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| CodecError::Malformed(format!("{} without requestId", env.msg_type)))?;

    Ok(DeviceInbound::CommandResponse {
        request_id,
        payload,
    })
}
