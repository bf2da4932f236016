//! # Event bus for broadcasting runtime events.
//!
//! [`Bus`] is a thin wrapper around [`tokio::sync::broadcast`] that provides
//! non-blocking event publishing from multiple sources (engines, pool, scheduler).
//!
//! ## Architecture
//! ```text
//! Publishers (many):                   Subscriber (one):
//!   Engine 1  ──┐
//!   Engine N  ──┤
//!   Pool      ──┼──────► Bus ───────► subscriber_listener ────► SubscriberSet
//!   Scheduler ──┤  (broadcast chan)     (in Runtime)
//!   Manager   ──┘
//! ```
//!
//! Publishing never blocks, so engine actors and the scheduler can emit from
//! their hot paths. The ring buffer is shared by every receiver: a receiver
//! that falls behind sees `RecvError::Lagged(n)` and loses the `n` oldest
//! events. Nothing is retained for receivers created later.

use tokio::sync::broadcast;

use super::event::Event;

/// Broadcast channel for runtime events.
///
/// Cheap to clone (internally holds an `Arc`-backed sender).
#[derive(Clone, Debug)]
pub struct Bus {
    tx: broadcast::Sender<Event>,
}

impl Bus {
    /// Creates a new bus with the given channel capacity (clamped to at least 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, _rx) = broadcast::channel::<Event>(capacity);
        Self { tx }
    }

    /// Publishes an event to all active subscribers.
    ///
    /// If there are no receivers, the event is dropped.
    pub fn publish(&self, ev: Event) {
        let _ = self.tx.send(ev);
    }

    /// Creates a new receiver that will observe subsequent events.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}
