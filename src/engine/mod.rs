//! # Engines: supervised external worker processes.
//!
//! - [`process`]: launching workers and controlling their processes
//! - [`actor`]: one engine, serving one request at a time
//! - [`manager`]: the fixed engine table and the pool dispatch loop

mod actor;
mod manager;
mod process;

pub use actor::{CRASH_MESSAGE, TIMEOUT_MESSAGE};
pub use process::{
    ProcessLauncher, WorkerControl, WorkerLauncher, WorkerProcess, WorkerReader, WorkerWriter,
};

pub(crate) use manager::EngineManager;
