//! Real-time hub for monitored devices.
//!
//! Devices connect on `/ws/device`, authenticate, stream telemetry and
//! answer commands. Admin dashboards connect on `/ws/observer`, subscribe
//! to one organization's events and issue commands through the hub.

mod collaborators;
mod config;
mod connection;
mod device;
mod hub;
mod observer;
mod server;

pub use collaborators::{
    AuthFuture, AuthVerdict, ClassifyFuture, ContentClassifier, CredentialValidator,
    NoopClassifier,
};
pub use config::HubConfig;
pub use connection::{SendError, Sender};
pub use hub::{AdmitError, Hub, HubStats};
pub use server::{DEVICE_PATH, Endpoint, HubServer, OBSERVER_PATH};

pub use threateye_commands::{Command, CommandError, CommandReply};
pub use threateye_sessions::SessionState;

/// Errors produced by the hub listener.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("connection upgraded without a known endpoint")]
    UnknownEndpoint,
}
