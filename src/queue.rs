//! Bounded FIFO between the webhook receiver and the worker pool.
//!
//! `push` never waits: a full queue either refuses the new event or evicts the
//! oldest one, depending on [`OverflowPolicy`]. Workers `pop` and sleep on a
//! `Notify` while the queue is empty.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio::sync::Notify;

use crate::config::OverflowPolicy;
use crate::event::InboundEvent;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("dispatch queue is full ({capacity} events)")]
    Full { capacity: usize },
    #[error("dispatch queue is closed")]
    Closed,
}

/// Result of a successful push.
#[derive(Debug)]
pub enum Pushed {
    Queued,
    /// The event was queued after evicting the oldest one.
    Evicted(InboundEvent),
}

struct Inner {
    events: VecDeque<InboundEvent>,
    closed: bool,
}

pub struct DispatchQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    capacity: usize,
    policy: OverflowPolicy,
    accepted: AtomicU64,
    rejected: AtomicU64,
    evicted: AtomicU64,
}

impl DispatchQueue {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            inner: Mutex::new(Inner {
                events: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            notify: Notify::new(),
            capacity,
            policy,
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
        }
    }

    // No critical section can panic halfway through an update; poisoning
    // carries no meaning here.
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, event: InboundEvent) -> Result<Pushed, QueueError> {
        let outcome = {
            let mut inner = self.lock();
            if inner.closed {
                return Err(QueueError::Closed);
            }
            if inner.events.len() < self.capacity {
                inner.events.push_back(event);
                Pushed::Queued
            } else {
                match self.policy {
                    OverflowPolicy::RejectNewest => {
                        self.rejected.fetch_add(1, Ordering::Relaxed);
                        return Err(QueueError::Full {
                            capacity: self.capacity,
                        });
                    }
                    OverflowPolicy::DropOldest => {
                        let oldest = inner.events.pop_front();
                        inner.events.push_back(event);
                        match oldest {
                            Some(old) => {
                                self.evicted.fetch_add(1, Ordering::Relaxed);
                                Pushed::Evicted(old)
                            }
                            None => Pushed::Queued,
                        }
                    }
                }
            }
        };
        self.accepted.fetch_add(1, Ordering::Relaxed);
        self.notify.notify_one();
        Ok(outcome)
    }

    /// Wait for the next event. Returns `None` once closed and drained.
    pub async fn pop(&self) -> Option<InboundEvent> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a push between the check and the
            // await still wakes us.
            notified.as_mut().enable();
            {
                let mut inner = self.lock();
                if let Some(event) = inner.events.pop_front() {
                    return Some(event);
                }
                if inner.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Stop accepting events. Already queued events can still be popped.
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}
