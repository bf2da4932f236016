//! # Event subscribers.
//!
//! Runtime events published on the [`Bus`](crate::events::Bus) are fanned out to
//! user-supplied [`Subscribe`] implementations through a [`SubscriberSet`].
//!
//! ```text
//! Engine / Pool / Scheduler ── publish(Event) ──► Bus ──► listener (in Runtime)
//!                                                           │
//!                                                           ├──► EngineTracker (internal)
//!                                                           └──► SubscriberSet::emit
//!                                                                  ├──► LogWriter
//!                                                                  └──► custom ...
//! ```

mod subscribe;
mod subscriber_set;

#[cfg(feature = "logging")]
mod embedded;

pub use subscribe::Subscribe;
pub use subscriber_set::SubscriberSet;

#[cfg(feature = "logging")]
pub use embedded::LogWriter;
