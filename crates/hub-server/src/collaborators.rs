//! Seams to the services the hub calls out to.
//!
//! Implementors supply credential checks and content classification; the
//! hub owns when they are called and what happens with the answer.

use std::future::Future;
use std::pin::Pin;

use threateye_protocol::messages::{AuthRequest, SubscribeRequest};
use threateye_protocol::{TelemetrySnapshot, ThreatVerdict};

/// A boxed future returned by credential checks.
pub type AuthFuture<'a> = Pin<Box<dyn Future<Output = AuthVerdict> + Send + 'a>>;

/// A boxed future returned by the classifier.
pub type ClassifyFuture<'a> = Pin<Box<dyn Future<Output = Option<ThreatVerdict>> + Send + 'a>>;

/// Outcome of a credential check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthVerdict {
    Authorized,
    Rejected(String),
}

/// Decides whether a device or dashboard may connect.
pub trait CredentialValidator: Send + Sync + 'static {
    /// Called once per device `auth` message.
    fn validate<'a>(&'a self, request: &'a AuthRequest) -> AuthFuture<'a>;

    /// Called once per observer `subscribe` message.
    fn validate_observer<'a>(&'a self, _request: &'a SubscribeRequest) -> AuthFuture<'a> {
        Box::pin(async { AuthVerdict::Rejected("observers are not accepted".into()) })
    }
}

/// Looks at telemetry and reports anything worth an administrator's time.
///
/// Runs off the ingestion path; a slow classifier delays only its own
/// verdicts.
pub trait ContentClassifier: Send + Sync + 'static {
    fn classify<'a>(&'a self, snapshot: &'a TelemetrySnapshot) -> ClassifyFuture<'a>;
}

/// Classifier that never reports anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopClassifier;

impl ContentClassifier for NoopClassifier {
    fn classify<'a>(&'a self, _snapshot: &'a TelemetrySnapshot) -> ClassifyFuture<'a> {
        Box::pin(async { None })
    }
}
