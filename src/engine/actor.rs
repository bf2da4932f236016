//! # Engine actor: one worker process, one request at a time.
//!
//! ```text
//!            ┌──────────── relaunch (backoff on failure) ◄──────────────┐
//!            ▼                                                         │
//!   ┌──► Idle ── Assignment ──► Serving ── terminal response ──► Idle  │
//!   │     │                        │                                   │
//!   │     │ exit after a request   ├─ sender cancelled ─► interrupt ───┤ no ack within cancel_grace
//!   │     └────────────────────────┼─ duration limit  ─► ERROR ────────┤
//!   │                              └─ worker exit     ─► ERROR ────────┤
//!   │                                                                  │
//!   └───────────────────────── stop escalation ◄───────────────────────┘
//!
//!   exit before the first request after a start ──► EngineFatal, actor ends
//! ```
//!
//! ## Rules
//! - The manager is told a request is finished *before* the result is
//!   delivered, so follow-up requests find this engine idle.
//! - A response is accepted only if instance, analysis and revision match the
//!   current request.
//! - Process-level failures reach the waiter as well-formed ERROR responses.
//! - Stop escalation: shutdown message and closed stdin, SIGTERM, kill. Each
//!   step waits at most `stop_timeout`; after the last one the process is abandoned.

use std::future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

use crate::error::ProtocolError;
use crate::events::{Bus, Event, EventKind};
use crate::policies::BackoffPolicy;
use crate::pool::ResultSender;
use crate::protocol::{
    AnalysisKey, AnalysisRequest, AnalysisResponse, Envelope, MessageStatus, Payload, Perform,
    ResultStatus,
};

use super::process::{WorkerLauncher, WorkerProcess};

/// Synthesized when the duration limit is hit.
pub const TIMEOUT_MESSAGE: &str =
    "This analysis has exceeded the current time limits and has been terminated.";

/// Synthesized when the worker dies while serving a request.
pub const CRASH_MESSAGE: &str =
    "This analysis has terminated, likely due to hitting a resource limit.";

/// A request handed to an engine by the manager.
pub(crate) struct Assignment {
    pub seq: u64,
    pub request: AnalysisRequest,
    pub sender: ResultSender,
}

/// Engine → manager notifications.
#[derive(Debug)]
pub(crate) enum Report {
    /// The engine is done with assignment `seq`.
    Finished { engine: usize, seq: u64 },
    /// The backend is not viable; the engine has stopped for good.
    Fatal { engine: usize, reason: String },
}

#[derive(Clone, Debug)]
pub(crate) struct EngineParams {
    pub duration_limit: Option<Duration>,
    pub cancel_grace: Duration,
    pub stop_timeout: Duration,
    pub backoff: BackoffPolicy,
}

/// How serving one request ended.
enum Outcome {
    /// The worker is still usable.
    Idle,
    /// The worker must be stopped and replaced.
    Restart(&'static str),
    Shutdown,
}

/// What to do after an idle wait.
enum Step {
    Keep,
    Serve(Assignment),
    Restart(&'static str),
    Exited(String),
    Stop,
}

enum Routed {
    Partial(AnalysisResponse),
    Terminal(AnalysisResponse),
    Stale(AnalysisResponse),
    Ignored,
}

/// Classifies an envelope against the current request.
fn route(request: &AnalysisRequest, envelope: Envelope) -> Routed {
    let Payload::AnalysisResponse(response) = envelope.payload else {
        return Routed::Ignored;
    };
    if !response.matches(request) {
        return Routed::Stale(response);
    }
    let terminal = envelope.status != MessageStatus::InProgress
        || (request.perform == Perform::Init && response.status == ResultStatus::Inited);
    if terminal {
        Routed::Terminal(response)
    } else {
        Routed::Partial(response)
    }
}

fn describe_exit(exit: io::Result<Option<i32>>) -> String {
    match exit {
        Ok(Some(code)) => format!("exit code {code}"),
        Ok(None) => "terminated by signal".to_owned(),
        Err(e) => format!("wait failed: {e}"),
    }
}

pub(crate) struct EngineActor {
    pub index: usize,
    pub launcher: Arc<dyn WorkerLauncher>,
    pub params: EngineParams,
    pub bus: Bus,
    pub assignments: mpsc::UnboundedReceiver<Assignment>,
    pub reports: mpsc::UnboundedSender<Report>,
    pub restart: watch::Receiver<u64>,
}

impl EngineActor {
    fn event(&self, kind: EventKind) -> Event {
        Event::new(kind).with_engine(self.index)
    }

    /// Drives `worker` (already launched) until cancelled or fatal.
    pub async fn run(mut self, worker: WorkerProcess, token: CancellationToken) {
        let mut worker = Some(worker);
        let mut at_startup = true;
        let mut watching_restart = true;

        loop {
            let mut w = match worker.take() {
                Some(w) => w,
                None => match self.relaunch(&token).await {
                    Some(w) => {
                        at_startup = true;
                        w
                    }
                    None => break,
                },
            };

            let step = tokio::select! {
                biased;
                _ = token.cancelled() => Step::Stop,
                changed = self.restart.changed(), if watching_restart => match changed {
                    Ok(()) => Step::Restart("requested"),
                    Err(_) => {
                        watching_restart = false;
                        Step::Keep
                    }
                },
                exit = w.control.wait() => Step::Exited(describe_exit(exit)),
                frame = w.reader.next() => match frame {
                    None => Step::Exited("worker closed its output".to_owned()),
                    Some(Err(ProtocolError::Io(e))) => Step::Exited(format!("read failed: {e}")),
                    Some(Err(e)) => {
                        tracing::warn!(engine = self.index, error = %e, "undecodable frame from idle worker");
                        Step::Keep
                    }
                    Some(Ok(envelope)) => {
                        self.unsolicited(envelope);
                        Step::Keep
                    }
                },
                next = self.assignments.recv() => match next {
                    Some(assignment) => Step::Serve(assignment),
                    None => Step::Stop,
                },
            };

            match step {
                Step::Keep => worker = Some(w),
                Step::Stop => {
                    self.stop(w).await;
                    break;
                }
                Step::Restart(reason) => {
                    self.bus
                        .publish(self.event(EventKind::EngineRestarting).with_reason(reason));
                    self.stop(w).await;
                }
                Step::Exited(reason) => {
                    self.bus
                        .publish(self.event(EventKind::EngineExited).with_reason(reason.clone()));
                    if at_startup {
                        self.fatal(reason);
                        break;
                    }
                    self.bus
                        .publish(self.event(EventKind::EngineRestarting).with_reason("crashed"));
                    self.stop(w).await;
                }
                Step::Serve(assignment) => {
                    at_startup = false;
                    match self.serve(&mut w, assignment, &token).await {
                        Outcome::Idle => worker = Some(w),
                        Outcome::Shutdown => {
                            self.stop(w).await;
                            break;
                        }
                        Outcome::Restart(reason) => {
                            self.bus.publish(
                                self.event(EventKind::EngineRestarting).with_reason(reason),
                            );
                            self.stop(w).await;
                        }
                    }
                }
            }
        }
        tracing::debug!(engine = self.index, "engine stopped");
    }

    fn fatal(&self, reason: String) {
        tracing::error!(engine = self.index, %reason, "worker exited before serving a request");
        self.bus
            .publish(self.event(EventKind::EngineFatal).with_reason(reason.clone()));
        let _ = self.reports.send(Report::Fatal {
            engine: self.index,
            reason,
        });
    }

    fn unsolicited(&self, envelope: Envelope) {
        if let Payload::AnalysisResponse(response) = envelope.payload {
            self.bus.publish(
                self.event(EventKind::StaleResultDropped)
                    .with_key(response.key())
                    .with_revision(response.revision),
            );
        }
    }

    /// Sends one request and follows it to its end.
    async fn serve(
        &self,
        w: &mut WorkerProcess,
        assignment: Assignment,
        token: &CancellationToken,
    ) -> Outcome {
        let Assignment {
            seq,
            request,
            mut sender,
        } = assignment;
        let key = request.key();

        if sender.is_cancelled() {
            self.finished(seq, &key);
            return Outcome::Idle;
        }

        self.bus.publish(
            self.event(EventKind::EngineBusy)
                .with_key(key.clone())
                .with_perform(request.perform)
                .with_revision(request.revision),
        );

        let payload = Payload::AnalysisRequest(request.clone());
        if let Err(e) = w.writer.send(MessageStatus::InProgress, payload).await {
            tracing::warn!(engine = self.index, %key, error = %e, "request write failed");
            self.finish(seq, &key, sender, AnalysisResponse::error_for(&request, CRASH_MESSAGE));
            return Outcome::Restart("crashed");
        }

        let deadline = self.params.duration_limit.map(|d| Instant::now() + d);
        let timer = async move {
            match deadline {
                Some(at) => time::sleep_until(at).await,
                None => future::pending::<()>().await,
            }
        };
        tokio::pin!(timer);

        loop {
            tokio::select! {
                biased;
                // Still busy until stopped, so a slow stop shows up as stuck.
                _ = token.cancelled() => return Outcome::Shutdown,
                _ = sender.cancelled() => {
                    return self.interrupt(w, seq, &request, token).await;
                }
                _ = &mut timer => {
                    let limit = self.params.duration_limit.unwrap_or_default();
                    self.bus.publish(
                        self.event(EventKind::TimeoutHit)
                            .with_key(key.clone())
                            .with_timeout(limit),
                    );
                    self.finish(seq, &key, sender, AnalysisResponse::error_for(&request, TIMEOUT_MESSAGE));
                    return Outcome::Restart("timeout");
                }
                exit = w.control.wait() => {
                    self.crashed(&key, describe_exit(exit));
                    self.finish(seq, &key, sender, AnalysisResponse::error_for(&request, CRASH_MESSAGE));
                    return Outcome::Restart("crashed");
                }
                frame = w.reader.next() => match frame {
                    None | Some(Err(ProtocolError::Io(_))) => {
                        self.crashed(&key, "worker closed its output".to_owned());
                        self.finish(seq, &key, sender, AnalysisResponse::error_for(&request, CRASH_MESSAGE));
                        return Outcome::Restart("crashed");
                    }
                    Some(Err(e)) => {
                        tracing::warn!(engine = self.index, %key, error = %e, "undecodable frame");
                    }
                    Some(Ok(envelope)) => match route(&request, envelope) {
                        Routed::Partial(response) => {
                            sender.write(response);
                        }
                        Routed::Terminal(response) => {
                            self.finish(seq, &key, sender, response);
                            return Outcome::Idle;
                        }
                        Routed::Stale(response) => {
                            self.bus.publish(
                                self.event(EventKind::StaleResultDropped)
                                    .with_key(response.key())
                                    .with_revision(response.revision),
                            );
                        }
                        Routed::Ignored => {}
                    },
                },
            }
        }
    }

    /// The current request was superseded: ask the worker to drop it and wait
    /// up to `cancel_grace` for the acknowledgement.
    async fn interrupt(
        &self,
        w: &mut WorkerProcess,
        seq: u64,
        request: &AnalysisRequest,
        token: &CancellationToken,
    ) -> Outcome {
        let key = request.key();
        self.bus
            .publish(self.event(EventKind::EngineInterrupted).with_key(key.clone()));

        if let Err(e) = w.control.interrupt() {
            tracing::warn!(engine = self.index, %key, error = %e, "interrupt failed");
            self.finished(seq, &key);
            return Outcome::Restart("interrupt failed");
        }

        let grace = time::sleep(self.params.cancel_grace);
        tokio::pin!(grace);

        let outcome = loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break Outcome::Shutdown,
                _ = &mut grace => break Outcome::Restart("interrupt ignored"),
                _ = w.control.wait() => break Outcome::Restart("exited after interrupt"),
                frame = w.reader.next() => match frame {
                    None | Some(Err(ProtocolError::Io(_))) => {
                        break Outcome::Restart("exited after interrupt");
                    }
                    Some(Err(_)) => {}
                    Some(Ok(envelope)) => {
                        if let Routed::Terminal(_) = route(request, envelope) {
                            break Outcome::Idle;
                        }
                    }
                },
            }
        };
        self.finished(seq, &key);
        outcome
    }

    fn crashed(&self, key: &AnalysisKey, reason: String) {
        tracing::warn!(engine = self.index, %key, %reason, "worker died while serving");
        self.bus.publish(
            self.event(EventKind::EngineExited)
                .with_key(key.clone())
                .with_reason(reason),
        );
    }

    fn finished(&self, seq: u64, key: &AnalysisKey) {
        let _ = self.reports.send(Report::Finished {
            engine: self.index,
            seq,
        });
        self.bus
            .publish(self.event(EventKind::EngineIdle).with_key(key.clone()));
    }

    fn finish(
        &self,
        seq: u64,
        key: &AnalysisKey,
        mut sender: ResultSender,
        response: AnalysisResponse,
    ) {
        self.finished(seq, key);
        sender.complete(response);
    }

    /// Stops `w`, escalating until it exits or every step timed out.
    async fn stop(&self, mut w: WorkerProcess) {
        let limit = self.params.stop_timeout;

        let polite = async {
            if w
                .writer
                .send(MessageStatus::Complete, Payload::Shutdown)
                .await
                .is_ok()
            {
                let _ = w.writer.close().await;
            }
        };
        let _ = time::timeout(limit, polite).await;
        if time::timeout(limit, w.control.wait()).await.is_ok() {
            return;
        }

        tracing::debug!(engine = self.index, "worker ignored shutdown, terminating");
        if let Err(e) = w.control.terminate() {
            tracing::debug!(engine = self.index, error = %e, "terminate failed");
        }
        if time::timeout(limit, w.control.wait()).await.is_ok() {
            return;
        }

        tracing::debug!(engine = self.index, "worker ignored terminate, killing");
        if let Err(e) = w.control.kill() {
            tracing::debug!(engine = self.index, error = %e, "kill failed");
        }
        if time::timeout(limit, w.control.wait()).await.is_ok() {
            return;
        }

        tracing::warn!(engine = self.index, pid = ?w.control.pid(), "worker abandoned");
        self.bus.publish(self.event(EventKind::EngineAbandoned));
    }

    /// Launches a replacement worker, backing off between failed attempts.
    async fn relaunch(&self, token: &CancellationToken) -> Option<WorkerProcess> {
        let mut failures: u32 = 0;
        loop {
            if token.is_cancelled() {
                return None;
            }
            let attempt = failures.saturating_add(1);
            self.bus
                .publish(self.event(EventKind::EngineStarting).with_attempt(attempt));

            match self.launcher.launch(self.index).await {
                Ok(w) => {
                    self.bus.publish(self.event(EventKind::EngineStarted));
                    return Some(w);
                }
                Err(e) => {
                    let delay = self.params.backoff.next(failures);
                    failures = attempt;
                    self.bus.publish(
                        self.event(EventKind::EngineLaunchFailed)
                            .with_attempt(attempt)
                            .with_reason(e.to_string())
                            .with_delay(delay),
                    );
                    tokio::select! {
                        _ = time::sleep(delay) => {}
                        _ = token.cancelled() => return None,
                    }
                }
            }
        }
    }
}
