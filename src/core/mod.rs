//! Runtime core: configuration, assembly and lifecycle.
//!
//! Internal modules:
//! - [`config`]: runtime settings and the worker command;
//! - [`builder`]: assembles a [`Runtime`];
//! - [`runtime`]: starts the engines and the scheduler, handles shutdown;
//! - [`alive`]: tracks busy engines for the shutdown report;
//! - [`shutdown`]: cross-platform shutdown signal handling.

mod alive;
mod builder;
mod config;
mod runtime;
mod shutdown;

pub use alive::EngineTracker;
pub use builder::RuntimeBuilder;
pub use config::{Config, EngineCommand};
pub use runtime::Runtime;
