//! # Analysis scheduling.
//!
//! [`admission`] decides what runs next under the INIT/RUN slot budgets and
//! routes results back into the analyses; [`session`] wraps it in a single
//! actor task and exposes [`InstanceHandle`] to callers.

mod admission;
mod session;

pub use admission::SlotUsage;
pub use session::InstanceHandle;

pub(crate) use admission::Scheduler;
pub(crate) use session::{Command, Session};
