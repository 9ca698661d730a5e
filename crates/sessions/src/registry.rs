//! Single source of truth for which devices are online.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use threateye_protocol::DeviceSummary;
use tracing::{debug, info};

use crate::session::DeviceSession;
use crate::state::{SessionEvent, Transition, TransitionError};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("device {0} already has a live session")]
    DuplicateDevice(String),

    #[error("device {0} not found")]
    NotFound(String),

    #[error(transparent)]
    Transition(#[from] TransitionError),
}

/// Result of installing a session.
#[derive(Debug)]
pub struct Registration {
    /// The installed session's own transition (`Authenticating -> Online`).
    pub transition: Transition,
    /// The session it replaced, if any, with the transition it underwent.
    pub evicted: Option<(Arc<DeviceSession>, Transition)>,
}

/// Maps `deviceId` to its live session.
///
/// Mutations are serialized by one lock that is never held across an
/// await; readers copy what they need and work outside it.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Arc<DeviceSession>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `session` and moves it online.
    ///
    /// Fails with `DuplicateDevice` if another live session holds the
    /// device. Entries left behind by ended sessions are replaced.
    pub fn register(&self, session: Arc<DeviceSession>) -> Result<Registration, RegistryError> {
        let mut sessions = self.lock();
        if let Some(current) = sessions.get(session.device_id()) {
            if current.state().is_live() && current.id() != session.id() {
                return Err(RegistryError::DuplicateDevice(session.device_id().to_owned()));
            }
        }

        let transition = session.apply(SessionEvent::AuthAccepted)?;
        sessions.insert(session.device_id().to_owned(), session.clone());
        info!(
            device_id = %session.device_id(),
            session_id = %session.id(),
            org = %session.organization_id(),
            "session registered"
        );
        Ok(Registration {
            transition,
            evicted: None,
        })
    }

    /// Evicts any live holder of the device and installs `session`, as
    /// one step under the registry lock.
    ///
    /// Nothing changes if `session` can no longer go online (its
    /// connection closed while credentials were being checked).
    pub fn evict_and_register(
        &self,
        session: Arc<DeviceSession>,
    ) -> Result<Registration, RegistryError> {
        let mut sessions = self.lock();
        let transition = session.apply(SessionEvent::AuthAccepted)?;

        let evicted = match sessions.insert(session.device_id().to_owned(), session.clone()) {
            Some(prior) if prior.id() != session.id() => match prior.apply(SessionEvent::Superseded) {
                Ok(t) => {
                    info!(
                        device_id = %session.device_id(),
                        evicted = %prior.id(),
                        replacement = %session.id(),
                        "session evicted"
                    );
                    Some((prior, t))
                }
                Err(e) => {
                    debug!(device_id = %session.device_id(), "prior session already ended: {e}");
                    None
                }
            },
            _ => None,
        };

        info!(
            device_id = %session.device_id(),
            session_id = %session.id(),
            org = %session.organization_id(),
            "session registered"
        );
        Ok(Registration {
            transition,
            evicted,
        })
    }

    pub fn lookup(&self, device_id: &str) -> Result<Arc<DeviceSession>, RegistryError> {
        self.lock()
            .get(device_id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(device_id.to_owned()))
    }

    /// Summaries of the organization's live sessions.
    pub fn list_by_organization(&self, organization_id: &str) -> Vec<DeviceSummary> {
        let snapshot: Vec<Arc<DeviceSession>> = self
            .lock()
            .values()
            .filter(|s| s.organization_id() == organization_id)
            .cloned()
            .collect();

        let mut summaries: Vec<DeviceSummary> = snapshot
            .iter()
            .filter(|s| s.state().is_live())
            .map(|s| s.summary())
            .collect();
        summaries.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        summaries
    }

    /// Removes whatever session holds `device_id`.
    pub fn remove(&self, device_id: &str) -> Option<Arc<DeviceSession>> {
        let removed = self.lock().remove(device_id);
        if removed.is_some() {
            debug!(device_id, "session removed");
        }
        removed
    }

    /// Removes `session` only if it is still the registered instance.
    pub fn remove_session(&self, session: &DeviceSession) -> bool {
        let mut sessions = self.lock();
        match sessions.get(session.device_id()) {
            Some(current) if current.id() == session.id() => {
                sessions.remove(session.device_id());
                debug!(device_id = %session.device_id(), session_id = %session.id(), "session removed");
                true
            }
            _ => false,
        }
    }

    /// Every registered session, for shutdown.
    pub fn drain(&self) -> Vec<Arc<DeviceSession>> {
        self.lock().drain().map(|(_, s)| s).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Number of sessions currently `Online` or `Degraded`.
    pub fn live_count(&self) -> usize {
        self.lock().values().filter(|s| s.state().is_live()).count()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<DeviceSession>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
