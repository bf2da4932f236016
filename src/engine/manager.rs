//! # EngineManager: owns the engines and feeds them from the pool.
//!
//! ```text
//! start():
//!   for i in 0..engines: launcher.launch(i)   (any failure → EngineStartup)
//!   spawn EngineActor[i]
//!   spawn dispatch loop
//!
//! dispatch loop:
//!   loop select! {
//!     token cancelled         → exit
//!     Report::Finished(i,seq) → engine i idle (if seq is its latest) → drain backlog
//!     Report::Fatal(i,reason) → engine i dead, fatal watch = Some(reason)
//!     dispatcher.next()       → assign(request, sender)
//!   }
//!
//! assign: engine already serving the same key → first idle engine → backlog
//! ```

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::core::Config;
use crate::error::RuntimeError;
use crate::events::{Bus, Event, EventKind};
use crate::pool::{Dispatcher, ResultSender};
use crate::protocol::{AnalysisKey, AnalysisRequest};

use super::actor::{Assignment, EngineActor, EngineParams, Report};
use super::process::WorkerLauncher;

pub(crate) struct EngineManager {
    count: usize,
    params: EngineParams,
    launcher: Arc<dyn WorkerLauncher>,
    bus: Bus,
    restart: watch::Sender<u64>,
    fatal: Arc<watch::Sender<Option<String>>>,
}

impl EngineManager {
    pub fn new(cfg: &Config, launcher: Arc<dyn WorkerLauncher>, bus: Bus) -> Self {
        let (restart, _) = watch::channel(0);
        let (fatal, _) = watch::channel(None);
        Self {
            count: cfg.engines(),
            params: EngineParams {
                duration_limit: cfg.duration_limit(),
                cancel_grace: cfg.cancel_grace,
                stop_timeout: cfg.stop_timeout,
                backoff: cfg.restart_backoff.clone(),
            },
            launcher,
            bus,
            restart,
            fatal: Arc::new(fatal),
        }
    }

    pub fn engine_count(&self) -> usize {
        self.count
    }

    /// Receiver that turns `Some(reason)` once the backend is not viable.
    pub fn fatal(&self) -> watch::Receiver<Option<String>> {
        self.fatal.subscribe()
    }

    /// Asks every engine to replace its worker process once idle.
    pub fn restart_engines(&self) {
        self.restart.send_modify(|generation| *generation += 1);
    }

    /// Launches every worker, then spawns the engine actors and the dispatch
    /// loop into `set`.
    ///
    /// A failed first launch is session-fatal: nothing is spawned, workers
    /// launched so far are dropped (and killed).
    pub async fn start(
        &self,
        dispatcher: Dispatcher,
        set: &mut JoinSet<()>,
        token: &CancellationToken,
    ) -> Result<(), RuntimeError> {
        let mut workers = Vec::with_capacity(self.count);
        for engine in 0..self.count {
            self.bus.publish(
                Event::new(EventKind::EngineStarting)
                    .with_engine(engine)
                    .with_attempt(1),
            );
            match self.launcher.launch(engine).await {
                Ok(worker) => {
                    self.bus
                        .publish(Event::new(EventKind::EngineStarted).with_engine(engine));
                    workers.push(worker);
                }
                Err(e) => {
                    let reason = e.to_string();
                    self.bus.publish(
                        Event::new(EventKind::EngineLaunchFailed)
                            .with_engine(engine)
                            .with_attempt(1)
                            .with_reason(reason.clone()),
                    );
                    self.bus.publish(
                        Event::new(EventKind::EngineFatal)
                            .with_engine(engine)
                            .with_reason(reason.clone()),
                    );
                    self.fatal.send_replace(Some(reason.clone()));
                    return Err(RuntimeError::EngineStartup { engine, reason });
                }
            }
        }

        let (reports_tx, reports) = mpsc::unbounded_channel();
        let mut engines = Vec::with_capacity(self.count);
        for (index, worker) in workers.into_iter().enumerate() {
            let (tx, assignments) = mpsc::unbounded_channel();
            let actor = EngineActor {
                index,
                launcher: Arc::clone(&self.launcher),
                params: self.params.clone(),
                bus: self.bus.clone(),
                assignments,
                reports: reports_tx.clone(),
                restart: self.restart.subscribe(),
            };
            set.spawn(actor.run(worker, token.child_token()));
            engines.push(EngineSlot {
                tx,
                current: None,
                alive: true,
            });
        }
        drop(reports_tx);

        let dispatch = DispatchLoop {
            engines,
            backlog: VecDeque::new(),
            reports,
            dispatcher,
            fatal: Arc::clone(&self.fatal),
            next_seq: 1,
        };
        set.spawn(dispatch.run(token.child_token()));
        Ok(())
    }
}

struct EngineSlot {
    tx: mpsc::UnboundedSender<Assignment>,
    /// Latest assignment: (seq, key).
    current: Option<(u64, AnalysisKey)>,
    alive: bool,
}

impl EngineSlot {
    fn is_idle(&self) -> bool {
        self.alive && self.current.is_none()
    }

    fn serves(&self, key: &AnalysisKey) -> bool {
        self.alive && self.current.as_ref().is_some_and(|(_, k)| k == key)
    }
}

struct DispatchLoop {
    engines: Vec<EngineSlot>,
    backlog: VecDeque<(AnalysisRequest, ResultSender)>,
    reports: mpsc::UnboundedReceiver<Report>,
    dispatcher: Dispatcher,
    fatal: Arc<watch::Sender<Option<String>>>,
    next_seq: u64,
}

impl DispatchLoop {
    async fn run(mut self, token: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                Some(report) = self.reports.recv() => self.on_report(report),
                next = self.dispatcher.next() => match next {
                    Some((request, sender)) => self.assign(request, sender),
                    None => break,
                },
            }
        }
        tracing::debug!(backlog = self.backlog.len(), "dispatch loop stopped");
    }

    fn on_report(&mut self, report: Report) {
        match report {
            Report::Finished { engine, seq } => {
                let Some(slot) = self.engines.get_mut(engine) else {
                    return;
                };
                if slot.current.as_ref().is_some_and(|(s, _)| *s == seq) {
                    slot.current = None;
                }
                self.drain_backlog();
            }
            Report::Fatal { engine, reason } => {
                if let Some(slot) = self.engines.get_mut(engine) {
                    slot.alive = false;
                    slot.current = None;
                }
                self.fatal.send_replace(Some(reason));
            }
        }
    }

    fn assign(&mut self, request: AnalysisRequest, sender: ResultSender) {
        let key = request.key();
        let target = self
            .engines
            .iter()
            .position(|e| e.serves(&key))
            .or_else(|| self.engines.iter().position(EngineSlot::is_idle));

        let Some(index) = target else {
            tracing::debug!(%key, "no idle engine, request backlogged");
            self.backlog.push_back((request, sender));
            return;
        };

        let seq = self.next_seq;
        self.next_seq += 1;
        let assignment = Assignment {
            seq,
            request,
            sender,
        };
        match self.engines[index].tx.send(assignment) {
            Ok(()) => self.engines[index].current = Some((seq, key)),
            Err(mpsc::error::SendError(assignment)) => {
                self.engines[index].alive = false;
                self.engines[index].current = None;
                self.assign(assignment.request, assignment.sender);
            }
        }
    }

    fn drain_backlog(&mut self) {
        let pending = std::mem::take(&mut self.backlog);
        for (request, sender) in pending {
            if sender.is_cancelled() {
                continue;
            }
            self.assign(request, sender);
        }
    }
}
