//! Error types used by the enginevisor runtime.
//!
//! - [`RuntimeError`]: raised by the orchestration runtime itself (startup, shutdown, config).
//! - [`PoolError`]: raised by [`Pool::submit`](crate::Pool::submit) and friends.
//! - [`EngineError`]: raised while launching or talking to a worker process.
//! - [`ProtocolError`]: framing and envelope encode/decode failures.
//! - [`OpError`]: delivered to callers awaiting a pending analysis operation (SAVE).
//! - [`SessionError`]: returned by [`InstanceHandle`](crate::InstanceHandle) calls.
//!
//! All public enums provide `as_label` (stable snake_case, for logs/metrics)
//! and `as_message` (human-readable details).

use std::time::Duration;

use thiserror::Error;

use crate::analysis::CollectionError;

/// # Errors produced by the enginevisor runtime.
///
/// These represent failures of the orchestration system itself.
/// Only [`RuntimeError::EngineStartup`] and [`RuntimeError::BackendUnavailable`]
/// are session-fatal: the computation backend is not viable.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// Configuration rejected by [`Config::validate`](crate::Config::validate).
    #[error("invalid configuration: {reason}")]
    Config {
        /// What is wrong with the configuration.
        reason: String,
    },

    /// The very first launch of an engine failed.
    #[error("engine {engine} failed to start: {reason}")]
    EngineStartup {
        /// Engine index.
        engine: usize,
        /// Underlying failure.
        reason: String,
    },

    /// An engine died at startup after the runtime was already running.
    #[error("computation backend unavailable: {reason}")]
    BackendUnavailable {
        /// Underlying failure.
        reason: String,
    },

    /// `start()` was called twice.
    #[error("runtime already started")]
    AlreadyStarted,

    /// The runtime was used before `start()`.
    #[error("runtime not started")]
    NotStarted,

    /// Shutdown grace period was exceeded; some engines did not stop in time.
    #[error("shutdown timeout {grace:?} exceeded; stuck engines: {stuck:?}")]
    GraceExceeded {
        /// The configured grace duration.
        grace: Duration,
        /// Engines that were still busy.
        stuck: Vec<usize>,
    },
}

impl RuntimeError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    ///
    /// # Example
    /// ```
    /// use enginevisor::RuntimeError;
    /// use std::time::Duration;
    ///
    /// let err = RuntimeError::GraceExceeded { grace: Duration::from_secs(5), stuck: vec![] };
    /// assert_eq!(err.as_label(), "runtime_grace_exceeded");
    /// ```
    pub fn as_label(&self) -> &'static str {
        match self {
            RuntimeError::Config { .. } => "runtime_config",
            RuntimeError::EngineStartup { .. } => "runtime_engine_startup",
            RuntimeError::BackendUnavailable { .. } => "runtime_backend_unavailable",
            RuntimeError::AlreadyStarted => "runtime_already_started",
            RuntimeError::NotStarted => "runtime_not_started",
            RuntimeError::GraceExceeded { .. } => "runtime_grace_exceeded",
        }
    }

    /// Returns a human-readable message with details about the error.
    pub fn as_message(&self) -> String {
        match self {
            RuntimeError::GraceExceeded { grace, stuck } => {
                format!("grace exceeded after {grace:?}; stuck engines={stuck:?}")
            }
            other => other.to_string(),
        }
    }

    /// True for failures that make the whole session unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RuntimeError::EngineStartup { .. } | RuntimeError::BackendUnavailable { .. }
        )
    }
}

/// Error returned by [`Pool`](crate::Pool) operations.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    /// Queued plus in-flight keys already reach the pool capacity.
    #[error("pool full")]
    Full,

    /// No queued or in-flight entry exists for the key.
    #[error("no entry for key")]
    NotFound,

    /// The pool was closed (runtime shutting down).
    #[error("pool closed")]
    Closed,
}

impl PoolError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            PoolError::Full => "pool_full",
            PoolError::NotFound => "pool_not_found",
            PoolError::Closed => "pool_closed",
        }
    }

    pub fn as_message(&self) -> String {
        self.to_string()
    }
}

/// Errors raised while framing or decoding worker messages.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Transport failure on the worker pipes.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Envelope could not be serialized.
    #[error("encode failed: {0}")]
    Encode(String),

    /// Frame body is not a valid envelope.
    #[error("decode failed: {0}")]
    Decode(String),
}

impl ProtocolError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            ProtocolError::Io(_) => "protocol_io",
            ProtocolError::Encode(_) => "protocol_encode",
            ProtocolError::Decode(_) => "protocol_decode",
        }
    }

    pub fn as_message(&self) -> String {
        self.to_string()
    }
}

/// Errors raised while launching or driving a worker process.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum EngineError {
    /// The worker executable could not be spawned.
    #[error("launch failed: {0}")]
    Launch(String),

    /// The worker exited before it could serve requests.
    #[error("worker exited at startup (code {code:?})")]
    ExitedAtStartup {
        /// Exit code, if the process reported one.
        code: Option<i32>,
    },

    /// Wire-level failure.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl EngineError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            EngineError::Launch(_) => "engine_launch",
            EngineError::ExitedAtStartup { .. } => "engine_exited_at_startup",
            EngineError::Protocol(_) => "engine_protocol",
        }
    }

    pub fn as_message(&self) -> String {
        self.to_string()
    }
}

/// Outcome delivered to a caller awaiting a pending operation.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OpError {
    /// The worker reported an error while performing the operation.
    #[error("operation failed: {0}")]
    Failed(String),

    /// The analysis module is not installed; no worker can serve it.
    #[error("{0}")]
    ModuleNotInstalled(String),

    /// The analysis was deleted before the operation completed.
    #[error("analysis deleted")]
    Deleted,

    /// Too many operations are already pending on the analysis.
    #[error("too many pending operations")]
    TooMany,

    /// The runtime stopped before the operation completed.
    #[error("operation abandoned")]
    Abandoned,
}

impl OpError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            OpError::Failed(_) => "op_failed",
            OpError::ModuleNotInstalled(_) => "op_module_not_installed",
            OpError::Deleted => "op_deleted",
            OpError::TooMany => "op_too_many",
            OpError::Abandoned => "op_abandoned",
        }
    }

    pub fn as_message(&self) -> String {
        self.to_string()
    }
}

/// Error returned by [`InstanceHandle`](crate::InstanceHandle) calls.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    /// The scheduler actor is gone (runtime shut down).
    #[error("session closed")]
    Closed,

    /// The computation backend failed fatally.
    #[error("computation backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Collection-level rejection (unknown id, deleted analysis, ...).
    #[error(transparent)]
    Collection(#[from] CollectionError),

    /// Pending operation outcome.
    #[error(transparent)]
    Op(#[from] OpError),
}

impl SessionError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            SessionError::Closed => "session_closed",
            SessionError::BackendUnavailable(_) => "session_backend_unavailable",
            SessionError::Collection(e) => e.as_label(),
            SessionError::Op(e) => e.as_label(),
        }
    }

    pub fn as_message(&self) -> String {
        self.to_string()
    }
}
