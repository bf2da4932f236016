//! Engine restart pacing.
//!
//! A worker that crashes, times out or is interrupted is restarted at once.
//! Only a worker that fails to *launch* is retried, and those retries are
//! spaced by a [`BackoffPolicy`] so a broken executable does not spin.
//!
//! ## Contents
//! - [`BackoffPolicy`] delay before relaunch attempt `n` (first / factor / max + jitter)
//! - [`JitterPolicy`]  randomization so engines relaunch out of step
//!
//! ## Defaults
//! - `BackoffPolicy::default()` → first=100ms, factor=2.0, max=5s, jitter=Equal.

mod backoff;
mod jitter;

pub use backoff::BackoffPolicy;
pub use jitter::JitterPolicy;
