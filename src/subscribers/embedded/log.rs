//! # LogWriter: events as `tracing` records
//!
//! Failures go out at `warn`/`error`, lifecycle at `info`, per-request chatter at `debug`.
//!
//! ## Example output (fmt subscriber)
//! ```text
//! INFO  engine starting engine=0 attempt=1
//! DEBUG engine busy engine=0 key=inst/3 perform="run" revision=7
//! WARN  analysis timed out engine=0 key=inst/3 timeout_ms=60000
//! ERROR backend not viable engine=1 reason="worker exited at startup (code Some(3))"
//! ```

use async_trait::async_trait;

use crate::events::{Event, EventKind};
use crate::subscribers::Subscribe;

/// Subscriber that emits one `tracing` record per event.
#[derive(Default)]
pub struct LogWriter;

impl LogWriter {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Subscribe for LogWriter {
    async fn on_event(&self, e: &Event) {
        let key = e.key.as_ref().map(ToString::to_string);
        let key = key.as_deref();
        let reason = e.reason.as_deref();
        let perform = e.perform.map(|p| p.as_str());
        match e.kind {
            EventKind::SubscriberPanicked => {
                tracing::error!(subscriber = e.subscriber, reason, "subscriber panicked")
            }
            EventKind::SubscriberOverflow => {
                tracing::warn!(subscriber = e.subscriber, reason, "subscriber overflow")
            }
            EventKind::ShutdownRequested => tracing::info!("shutdown requested"),
            EventKind::AllStoppedWithin => tracing::info!("all engines stopped within grace"),
            EventKind::GraceExceeded => tracing::warn!(reason, "grace exceeded"),
            EventKind::EngineStarting => {
                tracing::info!(engine = e.engine, attempt = e.attempt, "engine starting")
            }
            EventKind::EngineStarted => tracing::info!(engine = e.engine, "engine started"),
            EventKind::EngineLaunchFailed => tracing::warn!(
                engine = e.engine,
                attempt = e.attempt,
                delay_ms = e.delay_ms,
                reason,
                "engine launch failed"
            ),
            EventKind::EngineExited => {
                tracing::warn!(engine = e.engine, key, reason, "engine exited")
            }
            EventKind::EngineRestarting => {
                tracing::info!(engine = e.engine, reason, "engine restarting")
            }
            EventKind::EngineInterrupted => {
                tracing::debug!(engine = e.engine, key, "analysis interrupted")
            }
            EventKind::EngineAbandoned => {
                tracing::error!(engine = e.engine, "worker ignored stop requests; abandoned")
            }
            EventKind::EngineFatal => {
                tracing::error!(engine = e.engine, reason, "backend not viable")
            }
            EventKind::EngineBusy => tracing::debug!(
                engine = e.engine,
                key,
                perform,
                revision = e.revision,
                "engine busy"
            ),
            EventKind::EngineIdle => tracing::debug!(engine = e.engine, key, "engine idle"),
            EventKind::TimeoutHit => tracing::warn!(
                engine = e.engine,
                key,
                timeout_ms = e.timeout_ms,
                "analysis timed out"
            ),
            EventKind::StaleResultDropped => tracing::debug!(
                engine = e.engine,
                key,
                revision = e.revision,
                "stale result dropped"
            ),
            EventKind::RequestQueued => {
                tracing::trace!(key, perform, revision = e.revision, "request queued")
            }
            EventKind::RequestSuperseded => tracing::debug!(key, "request superseded"),
            EventKind::PoolFull => tracing::debug!(key, "pool full"),
            EventKind::AnalysisDispatched => {
                tracing::trace!(key, perform, revision = e.revision, "analysis dispatched")
            }
            EventKind::AnalysisRejected => tracing::info!(key, reason, "analysis rejected"),
            EventKind::AnalysisSettled => tracing::debug!(
                key,
                perform,
                revision = e.revision,
                status = ?e.status,
                "analysis settled"
            ),
        }
    }

    fn name(&self) -> &'static str {
        "LogWriter"
    }
}
