//! # Runtime events emitted by the scheduler, pool and engines.
//!
//! The [`EventKind`] enum classifies event types across four categories:
//! - **Engine events**: worker process lifecycle (starting, exited, restarted, fatal)
//! - **Pool events**: request queueing, supersession, capacity
//! - **Scheduler events**: admission rejections, settled analyses, stale results
//! - **Runtime events**: shutdown and subscriber health
//!
//! The [`Event`] struct carries additional metadata such as timestamps, engine index,
//! analysis key, revision, reasons and delays.
//!
//! ## Ordering guarantees
//! Each event has a globally unique sequence number (`seq`) that increases monotonically.
//! Use `seq` to restore the exact order when events are delivered out of order.
//!
//! ## Example
//! ```rust
//! use std::time::Duration;
//! use enginevisor::{Event, EventKind};
//!
//! let ev = Event::new(EventKind::EngineLaunchFailed)
//!     .with_engine(2)
//!     .with_reason("no such file")
//!     .with_attempt(3)
//!     .with_delay(Duration::from_millis(400));
//!
//! assert_eq!(ev.kind, EventKind::EngineLaunchFailed);
//! assert_eq!(ev.engine, Some(2));
//! assert_eq!(ev.reason.as_deref(), Some("no such file"));
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::{Duration, SystemTime};

use crate::analysis::AnalysisStatus;
use crate::protocol::{AnalysisKey, Perform};

/// Global sequence counter for event ordering.
static EVENT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Classification of runtime events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    // === Subscriber events ===
    /// Subscriber panicked during event processing.
    ///
    /// Sets:
    /// - `subscriber`: subscriber name
    /// - `reason`: panic info/message
    SubscriberPanicked,

    /// Subscriber dropped an event (queue full or worker closed).
    ///
    /// Sets:
    /// - `subscriber`: subscriber name
    /// - `reason`: "full" or "closed"
    SubscriberOverflow,

    // === Shutdown events ===
    /// Shutdown requested (OS signal or explicit call).
    ShutdownRequested,

    /// All engines stopped within the configured grace period.
    AllStoppedWithin,

    /// Grace period exceeded; some engines did not stop in time.
    ///
    /// Sets:
    /// - `reason`: stuck engine indices
    GraceExceeded,

    // === Engine lifecycle ===
    /// A worker process is being launched.
    ///
    /// Sets:
    /// - `engine`: engine index
    /// - `attempt`: launch attempt (1-based, reset after a successful launch)
    EngineStarting,

    /// A worker process is up and idle.
    ///
    /// Sets:
    /// - `engine`: engine index
    EngineStarted,

    /// Launching a worker process failed.
    ///
    /// Sets:
    /// - `engine`: engine index
    /// - `attempt`: launch attempt
    /// - `reason`: launch error
    /// - `delay_ms`: backoff before the next launch (absent on a first launch)
    EngineLaunchFailed,

    /// A worker process exited on its own.
    ///
    /// Sets:
    /// - `engine`: engine index
    /// - `key`: analysis in flight, if any
    /// - `reason`: exit code description
    EngineExited,

    /// The engine is restarting its worker process.
    ///
    /// Sets:
    /// - `engine`: engine index
    /// - `reason`: why ("crashed", "timeout", "interrupt ignored", "requested")
    EngineRestarting,

    /// An in-flight analysis was interrupted to make room for a newer request.
    ///
    /// Sets:
    /// - `engine`: engine index
    /// - `key`: interrupted analysis
    EngineInterrupted,

    /// The worker ignored every stop step (message, terminate, kill) and was abandoned.
    ///
    /// Sets:
    /// - `engine`: engine index
    EngineAbandoned,

    /// A worker died before serving its first request: the backend is not viable.
    ///
    /// Sets:
    /// - `engine`: engine index
    /// - `reason`: failure description
    EngineFatal,

    /// An engine picked up a request.
    ///
    /// Sets:
    /// - `engine`, `key`, `perform`, `revision`
    EngineBusy,

    /// An engine finished with a request (completed, failed or cancelled).
    ///
    /// Sets:
    /// - `engine`, `key`
    EngineIdle,

    /// The analysis exceeded the configured duration limit.
    ///
    /// Sets:
    /// - `engine`, `key`
    /// - `timeout_ms`: configured limit
    TimeoutHit,

    /// A response did not match the engine's current request and was dropped.
    ///
    /// Sets:
    /// - `engine`, `key`, `revision` (of the dropped response)
    StaleResultDropped,

    // === Pool events ===
    /// A request was installed as queued.
    ///
    /// Sets:
    /// - `key`, `perform`, `revision`
    RequestQueued,

    /// A queued or in-flight request was cancelled by a newer one for the same key.
    ///
    /// Sets:
    /// - `key`
    RequestSuperseded,

    /// A submission for a new key was refused because the pool is full.
    ///
    /// Sets:
    /// - `key`
    PoolFull,

    // === Scheduler events ===
    /// An analysis was admitted and its request handed to the pool.
    ///
    /// Sets:
    /// - `key`, `perform`, `revision`
    AnalysisDispatched,

    /// Admission refused: the module is not installed. No slot consumed.
    ///
    /// Sets:
    /// - `key`
    /// - `reason`: message stored on the analysis
    AnalysisRejected,

    /// A terminal result was applied to an analysis.
    ///
    /// Sets:
    /// - `key`, `perform`, `revision`
    /// - `status`: status after the result was applied
    AnalysisSettled,
}

/// Runtime event with optional metadata.
///
/// - `seq`: monotonic global sequence for ordering
/// - `at`: wall-clock timestamp (for logs)
/// - other optional fields are set depending on the [`EventKind`]
#[derive(Clone, Debug)]
pub struct Event {
    /// Globally unique, monotonically increasing sequence number.
    pub seq: u64,
    /// Wall-clock timestamp.
    pub at: SystemTime,
    /// Event classification.
    pub kind: EventKind,

    /// Engine index, if applicable.
    pub engine: Option<usize>,
    /// Analysis key, if applicable.
    pub key: Option<AnalysisKey>,
    /// Perform verb of the request involved.
    pub perform: Option<Perform>,
    /// Revision of the request or response involved.
    pub revision: Option<u64>,
    /// Analysis status after a settled result.
    pub status: Option<AnalysisStatus>,
    /// Subscriber name (subscriber events only).
    pub subscriber: Option<&'static str>,
    /// Human-readable reason (errors, overflow details, etc.).
    pub reason: Option<Arc<str>>,
    /// Attempt count (starting from 1).
    pub attempt: Option<u32>,
    /// Timeout in milliseconds (compact).
    pub timeout_ms: Option<u32>,
    /// Delay before the next attempt in milliseconds (compact).
    pub delay_ms: Option<u32>,
}

impl Event {
    /// Creates a new event of the given kind with current timestamp and next sequence number.
    pub fn new(kind: EventKind) -> Self {
        Self {
            seq: EVENT_SEQ.fetch_add(1, AtomicOrdering::Relaxed),
            at: SystemTime::now(),
            kind,
            engine: None,
            key: None,
            perform: None,
            revision: None,
            status: None,
            subscriber: None,
            reason: None,
            attempt: None,
            timeout_ms: None,
            delay_ms: None,
        }
    }

    /// Attaches an engine index.
    #[inline]
    pub fn with_engine(mut self, engine: usize) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Attaches an analysis key.
    #[inline]
    pub fn with_key(mut self, key: AnalysisKey) -> Self {
        self.key = Some(key);
        self
    }

    /// Attaches a perform verb.
    #[inline]
    pub fn with_perform(mut self, perform: Perform) -> Self {
        self.perform = Some(perform);
        self
    }

    /// Attaches a revision.
    #[inline]
    pub fn with_revision(mut self, revision: u64) -> Self {
        self.revision = Some(revision);
        self
    }

    /// Attaches the analysis status.
    #[inline]
    pub fn with_status(mut self, status: AnalysisStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Attaches a human-readable reason.
    #[inline]
    pub fn with_reason(mut self, reason: impl Into<Arc<str>>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Attaches an attempt count.
    #[inline]
    pub fn with_attempt(mut self, n: u32) -> Self {
        self.attempt = Some(n);
        self
    }

    /// Attaches a timeout duration (stored as milliseconds).
    #[inline]
    pub fn with_timeout(mut self, d: Duration) -> Self {
        self.timeout_ms = Some(compact_ms(d));
        self
    }

    /// Attaches a delay (stored as milliseconds).
    #[inline]
    pub fn with_delay(mut self, d: Duration) -> Self {
        self.delay_ms = Some(compact_ms(d));
        self
    }

    /// Creates a subscriber overflow event.
    #[inline]
    pub fn subscriber_overflow(subscriber: &'static str, reason: &'static str) -> Self {
        let mut ev = Event::new(EventKind::SubscriberOverflow).with_reason(reason);
        ev.subscriber = Some(subscriber);
        ev
    }

    /// Creates a subscriber panic event.
    #[inline]
    pub fn subscriber_panicked(subscriber: &'static str, info: String) -> Self {
        let mut ev = Event::new(EventKind::SubscriberPanicked).with_reason(info);
        ev.subscriber = Some(subscriber);
        ev
    }

    /// True for events produced by the subscriber machinery itself.
    #[inline]
    pub fn is_subscriber_event(&self) -> bool {
        matches!(
            self.kind,
            EventKind::SubscriberOverflow | EventKind::SubscriberPanicked
        )
    }
}

fn compact_ms(d: Duration) -> u32 {
    d.as_millis().min(u128::from(u32::MAX)) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::InstanceId;

    #[test]
    fn sequence_numbers_increase() {
        let a = Event::new(EventKind::EngineStarted);
        let b = Event::new(EventKind::EngineStarted);
        assert!(b.seq > a.seq);
    }

    #[test]
    fn builder_sets_fields() {
        let key = AnalysisKey::new(InstanceId::from("i1"), 3);
        let ev = Event::new(EventKind::AnalysisSettled)
            .with_key(key.clone())
            .with_perform(Perform::Init)
            .with_revision(7)
            .with_status(AnalysisStatus::Inited)
            .with_timeout(Duration::from_secs(u64::MAX));

        assert_eq!(ev.key, Some(key));
        assert_eq!(ev.perform, Some(Perform::Init));
        assert_eq!(ev.revision, Some(7));
        assert_eq!(ev.status, Some(AnalysisStatus::Inited));
        assert_eq!(ev.timeout_ms, Some(u32::MAX));
    }

    #[test]
    fn subscriber_helpers() {
        let ev = Event::subscriber_overflow("audit", "full");
        assert!(ev.is_subscriber_event());
        assert_eq!(ev.subscriber, Some("audit"));
        assert_eq!(ev.reason.as_deref(), Some("full"));
    }
}
