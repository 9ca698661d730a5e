pub mod bus;
pub mod queue;

pub use bus::{BusStats, EventBus, SubscriberId, Subscription};
pub use queue::DropOldestQueue;
