//! Device sessions: lifecycle state machine, per-device record and the
//! registry that guarantees one live session per device.

pub mod registry;
pub mod session;
pub mod state;

pub use registry::{Registration, RegistryError, SessionRegistry};
pub use session::{
    CloseReason, DeviceIdentity, DeviceLink, DeviceSession, LinkError, PendingSession, SessionId,
};
pub use state::{SessionEvent, SessionState, Transition, TransitionError};
