//! # enginevisor
//!
//! **Enginevisor** schedules statistical analyses onto a fixed pool of
//! external worker processes ("engines") and supervises those processes.
//!
//! Clients edit analyses (options, reruns, deletions, saves) through an
//! [`InstanceHandle`]. A single scheduler actor decides what runs next under
//! two slot budgets (INIT and RUN), hands requests to a keyed [`Pool`] that
//! keeps only the newest request per analysis, and applies results as they
//! stream back. Timeouts, crashes and supersession are handled per engine and
//! always reach the analysis as a well-formed result.
//!
//! ## Architecture
//! ### Overview
//! ```text
//!   InstanceHandle   InstanceHandle   InstanceHandle
//!          │                │                │
//!          └────────────────┼────────────────┘
//!                           ▼  Command (mpsc)
//! ┌───────────────────────────────────────────────────────────────────┐
//! │  Session actor                                                    │
//! │  - AnalysisCollection per instance                                │
//! │  - Scheduler: active_init <= init_slots, active_run <= run_slots  │
//! │  - in-flight table (key → ticket, perform, revision)              │
//! └──────┬──────────────────────────────────────────────▲─────────────┘
//!        │ Pool::submit(request)                        │ StreamEvent
//!        ▼                                              │ (forwarder per request)
//! ┌──────────────────────────────┐              ┌───────┴──────┐
//! │ Pool (newest wins per key)   │── Dispatcher ─► dispatch loop │
//! └──────────────────────────────┘              └───────┬───────┘
//!                                          same key / idle / backlog
//!                     ┌─────────────────────────┼─────────────────────────┐
//!                     ▼                         ▼                         ▼
//!              ┌─────────────┐           ┌─────────────┐           ┌─────────────┐
//!              │ EngineActor │           │ EngineActor │           │ EngineActor │
//!              └──────┬──────┘           └──────┬──────┘           └──────┬──────┘
//!                     │ u32 LE length + bincode(Envelope) over stdin/stdout │
//!                     ▼                         ▼                         ▼
//!                  worker 0                  worker 1                  worker N
//!
//!  every component ── publish(Event) ──► Bus ──► listener ──► EngineTracker
//!                                                         └─► SubscriberSet ─► Subscribe
//! ```
//!
//! ### Analysis lifecycle
//! ```text
//! NONE ──admit(INIT)──► RUNNING ──► INITED ──admit(RUN)──► RUNNING ──► COMPLETE
//!   ▲                      │                                  │          │ SAVE op
//!   │                      └──────────── ERROR ◄──────────────┘          ▼
//!   └── set_options / run / rerun / module installed ◄──────────── RUNNING ─► COMPLETE
//! ```
//!
//! ## Features
//! | Area              | Description                                                   | Key types / traits                         |
//! |-------------------|---------------------------------------------------------------|--------------------------------------------|
//! | **Runtime**       | Start engines and scheduler, graceful shutdown.               | [`Runtime`], [`RuntimeBuilder`]            |
//! | **Analyses**      | Ordered per-instance analyses, options, ops, annotations.     | [`InstanceHandle`], [`AnalysisSnapshot`]   |
//! | **Pool**          | Keyed last-write-wins request queue with result streams.      | [`Pool`], [`ResultStream`]                 |
//! | **Engines**       | Worker launch, interrupt, timeout, crash recovery.            | [`WorkerLauncher`], [`ProcessLauncher`]    |
//! | **Wire protocol** | Length-prefixed envelopes to and from workers.                | [`Envelope`], [`FrameReader`]              |
//! | **Subscriber API**| Observe engine, pool and scheduler events.                    | [`Subscribe`], [`Event`]                   |
//! | **Policies**      | Relaunch pacing after failed launches.                        | [`BackoffPolicy`], [`JitterPolicy`]        |
//! | **Configuration** | Slot budgets, limits, worker command, env overrides.          | [`Config`], [`EngineCommand`]              |
//!
//! ## Optional features
//! - `logging` (default): exports the built-in [`LogWriter`] subscriber.
//!
//! ## Example
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//! use enginevisor::{AnalysisMeta, Config, EngineCommand, Runtime, StaticRegistry, Subscribe};
//!
//! # fn main() -> Result<(), enginevisor::RuntimeError> {
//! let mut cfg = Config::default();
//! cfg.run_slots = 2;
//! cfg.analysis_duration_limit = Duration::from_secs(300);
//! cfg.engine = EngineCommand::new("analysis-engine").data_path("/var/lib/analyses");
//!
//! #[cfg(feature = "logging")]
//! let subs: Vec<Arc<dyn Subscribe>> = vec![Arc::new(enginevisor::LogWriter::new())];
//! #[cfg(not(feature = "logging"))]
//! let subs: Vec<Arc<dyn Subscribe>> = Vec::new();
//!
//! let registry = StaticRegistry::new().with_module("jmv", [AnalysisMeta::new("ttest")]);
//! let runtime = Runtime::builder(cfg)
//!     .with_subscribers(subs)
//!     .with_registry(Arc::new(registry))
//!     .build()?;
//! assert_eq!(runtime.config().engines(), 3);
//! # Ok(())
//! # }
//! ```

mod analysis;
mod core;
mod engine;
mod error;
mod events;
mod modules;
mod options;
mod policies;
mod pool;
mod protocol;
mod scheduler;
mod subscribers;

// ---- Public re-exports ----

pub use analysis::{
    Analysis, AnalysisCollection, AnalysisSnapshot, AnalysisStatus, Builtin, CollectionError,
    MAX_PENDING_OPS, NewAnalysis, OpKind, OpReply, WEIGHTS_OPTION,
};
pub use core::{Config, EngineCommand, EngineTracker, Runtime, RuntimeBuilder};
pub use engine::{
    CRASH_MESSAGE, ProcessLauncher, TIMEOUT_MESSAGE, WorkerControl, WorkerLauncher,
    WorkerProcess, WorkerReader, WorkerWriter,
};
pub use error::{EngineError, OpError, PoolError, ProtocolError, RuntimeError, SessionError};
pub use events::{Bus, Event, EventKind};
pub use modules::{AnalysisMeta, ModuleError, ModuleRegistry, StaticRegistry};
pub use options::{OptionMap, OptionValue, Options, OptionsError};
pub use policies::{BackoffPolicy, JitterPolicy};
pub use pool::{Dispatcher, Pool, ResultSender, ResultStream, StreamEvent};
pub use protocol::{
    AnalysisId, AnalysisKey, AnalysisRequest, AnalysisResponse, ElementContent, Envelope,
    FrameReader, FrameWriter, InstanceId, MAX_FRAME_BYTES, MessageStatus, Payload, Perform,
    ResultElement, ResultStatus, ResultTree, decode_envelope, encode_envelope, frame_codec,
};
pub use scheduler::{InstanceHandle, SlotUsage};
pub use subscribers::{Subscribe, SubscriberSet};

// Optional: expose a simple built-in logger subscriber.
#[cfg(feature = "logging")]
pub use subscribers::LogWriter;
