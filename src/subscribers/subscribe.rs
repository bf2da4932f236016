//! # Subscriber trait
//!
//! `Subscribe` is the extension point for observing the runtime: engine
//! lifecycle, pool pressure and analysis settlement all arrive as [`Event`]s.
//! Each subscriber gets its own bounded queue and worker inside the
//! [`SubscriberSet`](crate::SubscriberSet), so a slow subscriber never stalls
//! the scheduler or the engines.
//!
//! ## Example
//! ```rust
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use enginevisor::{Event, EventKind, Subscribe};
//!
//! #[derive(Default)]
//! struct CrashCounter(AtomicUsize);
//!
//! #[async_trait::async_trait]
//! impl Subscribe for CrashCounter {
//!     async fn on_event(&self, ev: &Event) {
//!         if ev.kind == EventKind::EngineExited {
//!             self.0.fetch_add(1, Ordering::Relaxed);
//!         }
//!     }
//!     fn name(&self) -> &'static str { "crash-counter" }
//! }
//! ```

use async_trait::async_trait;

use crate::events::Event;

/// Contract for event subscribers.
///
/// Called from a dedicated worker task; avoid blocking the async runtime.
#[async_trait]
pub trait Subscribe: Send + Sync + 'static {
    /// Handles one event.
    async fn on_event(&self, event: &Event);

    /// Name used in overflow/panic events.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Capacity of this subscriber's queue. Events beyond it are dropped.
    fn queue_capacity(&self) -> usize {
        1024
    }
}
