pub mod correlator;

pub use correlator::{Command, CommandCorrelator, CommandError, CommandReply, ResolveOutcome};
