//! # Request pool between the scheduler and the engines.
//!
//! ```text
//!  Scheduler ── submit(request) ──► Pool ── Dispatcher::next() ──► EngineManager
//!      ▲                            │ (≤ capacity keys)                  │
//!      └──── ResultStream ◄─────────┴──────────── ResultSender ◄─────────┘
//! ```
//!
//! ## Rules
//! - One entry per [`AnalysisKey`](crate::protocol::AnalysisKey); resubmitting a key
//!   cancels the previous entry, queued or in flight, and never fails with `Full`.
//! - Waiting entries are dispatched newest first.
//! - An entry leaves the pool when its sender finishes, is dropped, or is cancelled.

mod shared;
mod stream;

pub use shared::{Dispatcher, Pool};
pub use stream::{ResultSender, ResultStream, StreamEvent};
