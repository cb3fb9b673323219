//! In-process event bus.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tracing::{debug, warn};

use crate::bus::{EventBus, PublishError, PushOutcome, SubscriberQueue, Subscription};
use crate::{Event, SubscriptionPattern, Topic};

/// Default per-subscription buffer size.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 256;

#[derive(Debug)]
struct Slot {
    id: u64,
    pattern: SubscriptionPattern,
    queue: Arc<SubscriberQueue>,
}

#[derive(Debug, Default)]
struct RegistryState {
    slots: Vec<Slot>,
    closed: bool,
}

/// Slots and the closed flag share one lock, so a subscription is either
/// registered before `close` drains the slots or created already closed.
#[derive(Debug, Default)]
struct Registry {
    state: Mutex<RegistryState>,
}

impl Registry {
    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn remove(&self, id: u64) {
        self.lock().slots.retain(|slot| slot.id != id);
    }
}

/// In-memory pub/sub bus.
///
/// - Fan-out happens on the publisher's task; pushing into a subscriber buffer
///   never waits.
/// - Each subscription has its own bounded buffer (see [`SubscriberQueue`]).
/// - Publishing holds the registry lock for the whole fan-out, so concurrent
///   publishers are serialized and every subscription observes one order.
#[derive(Debug)]
pub struct InMemoryEventBus {
    registry: Arc<Registry>,
    capacity: usize,
    next_id: AtomicU64,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_SUBSCRIBER_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            registry: Arc::new(Registry::default()),
            capacity: capacity.max(1),
            next_id: AtomicU64::new(1),
        }
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.registry.lock().slots.len()
    }

    /// Shut the bus down: pending and future receives return `Closed` once
    /// their buffers are drained, and further publishes fail.
    pub fn close(&self) {
        let slots = {
            let mut registry = self.registry.lock();
            registry.closed = true;
            std::mem::take(&mut registry.slots)
        };
        for slot in slots {
            slot.queue.close();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.registry.lock().closed
    }
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for InMemoryEventBus {
    fn drop(&mut self) {
        self.close();
    }
}

impl EventBus for InMemoryEventBus {
    fn publish(&self, topic: &Topic, event: Arc<Event>) -> Result<(), PublishError> {
        let registry = self.registry.lock();
        if registry.closed {
            return Err(PublishError::Closed);
        }

        for slot in registry.slots.iter().filter(|slot| slot.pattern.matches(topic)) {
            match slot.queue.push(Arc::clone(&event)) {
                PushOutcome::Queued | PushOutcome::Closed => {}
                PushOutcome::Overflowed { dropped } => {
                    warn!(
                        subscription = slot.id,
                        pattern = %slot.pattern,
                        dropped,
                        global_sequence = event.global_sequence,
                        "subscriber buffer overflowed; backlog dropped"
                    );
                }
            }
        }
        Ok(())
    }

    fn subscribe(&self, pattern: SubscriptionPattern) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let queue = Arc::new(SubscriberQueue::new(self.capacity));

        {
            let mut registry = self.registry.lock();
            if registry.closed {
                queue.close();
            } else {
                registry.slots.push(Slot {
                    id,
                    pattern: pattern.clone(),
                    queue: Arc::clone(&queue),
                });
            }
        }
        debug!(subscription = id, pattern = %pattern, "subscribed");

        let registry: Weak<Registry> = Arc::downgrade(&self.registry);
        Subscription::new(id, pattern, queue, move || {
            if let Some(registry) = registry.upgrade() {
                registry.remove(id);
            }
        })
    }
}
