//! Bounded single-consumer queues with a configurable overflow policy
//!
//! Producers never wait: `push` either queues the item or discards something
//! according to the mailbox's [`OverflowPolicy`]. This keeps room broadcasts
//! and signaling callbacks from stalling behind a slow participant.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// What a full mailbox discards
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Reject the incoming item
    #[default]
    DropNewest,
    /// Evict the oldest queued item to make room
    DropOldest,
}

/// Outcome of a [`Mailbox::push`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queued after evicting the oldest item
    Evicted,
    /// The item was discarded
    Dropped,
    Closed,
}

impl PushOutcome {
    /// Whether the pushed item is now in the queue
    #[must_use]
    pub const fn is_queued(&self) -> bool {
        matches!(self, Self::Queued | Self::Evicted)
    }
}

struct Shared<T> {
    queue: Mutex<VecDeque<T>>,
    capacity: usize,
    policy: OverflowPolicy,
    notify: Notify,
    closed: AtomicBool,
    dropped: AtomicU64,
}

/// Cloneable handle to a bounded queue with one consumer
pub struct Mailbox<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Mailbox<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Mailbox<T> {
    /// A zero capacity is raised to one.
    #[must_use]
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(VecDeque::with_capacity(capacity)),
                capacity,
                policy,
                notify: Notify::new(),
                closed: AtomicBool::new(false),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    #[must_use]
    pub fn from_config(config: &crate::config::QueueConfig) -> Self {
        Self::new(config.capacity, config.overflow)
    }

    /// Queue an item without waiting
    pub fn push(&self, item: T) -> PushOutcome {
        if self.is_closed() {
            return PushOutcome::Closed;
        }

        let outcome = {
            let mut queue = self.shared.queue.lock();
            if queue.len() < self.shared.capacity {
                queue.push_back(item);
                PushOutcome::Queued
            } else {
                match self.shared.policy {
                    OverflowPolicy::DropNewest => PushOutcome::Dropped,
                    OverflowPolicy::DropOldest => {
                        queue.pop_front();
                        queue.push_back(item);
                        PushOutcome::Evicted
                    }
                }
            }
        };

        match outcome {
            PushOutcome::Queued => self.shared.notify.notify_one(),
            PushOutcome::Evicted => {
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                self.shared.notify.notify_one();
            }
            PushOutcome::Dropped => {
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
            }
            PushOutcome::Closed => {}
        }
        outcome
    }

    /// Wait for the next item.
    ///
    /// Returns `None` once the mailbox is closed and drained.
    pub async fn recv(&self) -> Option<T> {
        loop {
            if let Some(item) = self.try_recv() {
                return Some(item);
            }
            if self.is_closed() {
                return None;
            }
            self.shared.notify.notified().await;
        }
    }

    pub fn try_recv(&self) -> Option<T> {
        self.shared.queue.lock().pop_front()
    }

    /// Take everything currently queued
    pub fn drain(&self) -> Vec<T> {
        self.shared.queue.lock().drain(..).collect()
    }

    /// Reject further pushes and wake the consumer
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.notify.notify_one();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.queue.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Items discarded because the mailbox was full
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}
