//! Publish/subscribe bus scoped by organization.
//!
//! Every subscriber owns a bounded mailbox. Publishing copies the matching
//! mailboxes out of the subscriber map and pushes outside the map lock, so
//! a slow reader only ever loses its own oldest events.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::queue::DropOldestQueue;

/// Identifies one subscription on a bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Counters across the lifetime of a bus.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusStats {
    pub subscribers: usize,
    pub published: u64,
    pub delivered: u64,
    pub dropped: u64,
}

struct Mailbox<E> {
    scope: String,
    queue: Mutex<DropOldestQueue<E>>,
    notify: Notify,
    closed: AtomicBool,
    dropped: AtomicU64,
}

impl<E> Mailbox<E> {
    fn queue(&self) -> MutexGuard<'_, DropOldestQueue<E>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }
}

pub struct EventBus<E> {
    subscribers: Mutex<HashMap<SubscriberId, Arc<Mailbox<E>>>>,
    capacity: usize,
    next_id: AtomicU64,
    published: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl<E: Clone + Send + 'static> EventBus<E> {
    /// Creates a bus whose mailboxes hold up to `capacity` events each.
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
            next_id: AtomicU64::new(1),
            published: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Registers a subscriber for events published under `scope`.
    ///
    /// Dropping the returned handle unsubscribes.
    pub fn subscribe(self: &Arc<Self>, scope: &str) -> Subscription<E> {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mailbox = Arc::new(Mailbox {
            scope: scope.to_owned(),
            queue: Mutex::new(DropOldestQueue::new(self.capacity)),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        });
        self.lock().insert(id, mailbox.clone());
        debug!(subscriber = %id, org = scope, "subscribed");

        Subscription {
            id,
            mailbox,
            bus: Arc::downgrade(self),
        }
    }

    /// Removes a subscriber. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let removed = self.lock().remove(&id);
        match removed {
            Some(mailbox) => {
                mailbox.close();
                debug!(subscriber = %id, org = %mailbox.scope, "unsubscribed");
                true
            }
            None => false,
        }
    }

    /// Delivers `event` to every subscriber of `scope`.
    ///
    /// Never waits on a subscriber. Returns the number of mailboxes the
    /// event was placed in.
    pub fn publish(&self, scope: &str, event: E) -> usize {
        self.published.fetch_add(1, Ordering::Relaxed);

        let targets: Vec<(SubscriberId, Arc<Mailbox<E>>)> = self
            .lock()
            .iter()
            .filter(|(_, mb)| mb.scope == scope)
            .map(|(id, mb)| (*id, mb.clone()))
            .collect();

        for (id, mailbox) in &targets {
            let evicted = mailbox.queue().push(event.clone());
            if evicted.is_some() {
                let total = mailbox.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                self.dropped.fetch_add(1, Ordering::Relaxed);
                if total == 1 || total.is_power_of_two() {
                    warn!(subscriber = %id, org = scope, dropped = total, "subscriber lagging, dropping oldest events");
                }
            }
            mailbox.notify.notify_one();
        }

        self.delivered.fetch_add(targets.len() as u64, Ordering::Relaxed);
        targets.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            subscribers: self.subscriber_count(),
            published: self.published.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    /// Closes every subscription; receivers drain and then end.
    pub fn close_all(&self) {
        let drained: Vec<_> = self.lock().drain().collect();
        for (_, mailbox) in drained {
            mailbox.close();
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SubscriberId, Arc<Mailbox<E>>>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Receiving end of a subscription.
pub struct Subscription<E: Clone + Send + 'static> {
    id: SubscriberId,
    mailbox: Arc<Mailbox<E>>,
    bus: std::sync::Weak<EventBus<E>>,
}

impl<E: Clone + Send + 'static> Subscription<E> {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn scope(&self) -> &str {
        &self.mailbox.scope
    }

    /// Waits for the next event. Returns `None` once the subscription is
    /// closed and its queue drained.
    pub async fn recv(&self) -> Option<E> {
        loop {
            if let Some(event) = self.try_recv() {
                return Some(event);
            }
            if self.mailbox.closed.load(Ordering::Acquire) {
                return self.try_recv();
            }
            self.mailbox.notify.notified().await;
        }
    }

    pub fn try_recv(&self) -> Option<E> {
        self.mailbox.queue().pop()
    }

    /// Events this subscriber lost to overflow.
    pub fn dropped(&self) -> u64 {
        self.mailbox.dropped.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.mailbox.queue().len()
    }

    pub fn is_empty(&self) -> bool {
        self.mailbox.queue().is_empty()
    }
}

impl<E: Clone + Send + 'static> Drop for Subscription<E> {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}
