//! # Session actor and instance handles.
//!
//! One task owns the [`Scheduler`] and everything it holds. Callers talk to
//! it through [`InstanceHandle`]s; result streams reach it through one
//! forwarder task per dispatched request.
//!
//! ```text
//! InstanceHandle ── Command ──────────┐
//!                                     ▼
//! forwarder(key, ticket) ── Delivery ─► Session::run ──► Scheduler
//!      ▲                                                  │ send_next()
//!      └──────────── ResultStream ◄── Pool::submit ◄──────┘
//! ```
//!
//! ## Rules
//! - Every command that may reschedule is followed by an admission pass for
//!   each changed analysis, then a general pass.
//! - A freed slot triggers an admission pass.
//! - Once the backend is reported fatal, mutating commands fail with
//!   [`SessionError::BackendUnavailable`].
//! - When the session ends, pending ops are answered with [`OpError::Abandoned`].

use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::analysis::{AnalysisSnapshot, NewAnalysis, OpReply};
use crate::error::{OpError, SessionError};
use crate::pool::StreamEvent;
use crate::protocol::{AnalysisId, AnalysisKey, AnalysisResponse, InstanceId};

use super::admission::{Scheduler, SlotUsage, Started};

type Reply<T> = oneshot::Sender<Result<T, SessionError>>;

pub(crate) enum Command {
    Open {
        instance: InstanceId,
        reply: Reply<()>,
    },
    Create {
        instance: InstanceId,
        spec: NewAnalysis,
        reply: Reply<AnalysisId>,
    },
    Annotate {
        instance: InstanceId,
        patron: AnalysisId,
        reply: Reply<AnalysisId>,
    },
    SetOptions {
        key: AnalysisKey,
        options: Vec<u8>,
        changed: Vec<String>,
        revision: u64,
        enabled: Option<bool>,
        reply: Reply<bool>,
    },
    Run {
        key: AnalysisKey,
        clear_state: bool,
        reply: Reply<bool>,
    },
    RerunAll {
        instance: InstanceId,
        reply: Reply<usize>,
    },
    Delete {
        key: AnalysisKey,
        reply: Reply<()>,
    },
    Save {
        key: AnalysisKey,
        path: String,
        part: Option<String>,
        reply: Reply<OpReply>,
    },
    ModuleInstalled {
        namespace: String,
        reply: Reply<usize>,
    },
    Snapshot {
        key: AnalysisKey,
        reply: Reply<AnalysisSnapshot>,
    },
    List {
        instance: InstanceId,
        reply: Reply<Vec<AnalysisSnapshot>>,
    },
    Slots {
        reply: oneshot::Sender<SlotUsage>,
    },
}

impl Command {
    fn is_read_only(&self) -> bool {
        matches!(
            self,
            Command::Snapshot { .. } | Command::List { .. } | Command::Slots { .. }
        )
    }

    fn reject(self, err: SessionError) {
        match self {
            Command::Open { reply, .. } | Command::Delete { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            Command::Create { reply, .. } | Command::Annotate { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            Command::SetOptions { reply, .. } | Command::Run { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            Command::RerunAll { reply, .. } | Command::ModuleInstalled { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            Command::Save { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            Command::Snapshot { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            Command::List { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            Command::Slots { .. } => {}
        }
    }
}

/// One stream event on its way back to the actor.
struct Delivery {
    key: AnalysisKey,
    ticket: u64,
    event: StreamEvent,
}

pub(crate) struct Session {
    scheduler: Scheduler,
    commands: mpsc::Receiver<Command>,
    deliveries_tx: mpsc::UnboundedSender<Delivery>,
    deliveries: mpsc::UnboundedReceiver<Delivery>,
    fatal: watch::Receiver<Option<String>>,
}

impl Session {
    pub fn new(
        scheduler: Scheduler,
        commands: mpsc::Receiver<Command>,
        fatal: watch::Receiver<Option<String>>,
    ) -> Self {
        let (deliveries_tx, deliveries) = mpsc::unbounded_channel();
        Self {
            scheduler,
            commands,
            deliveries_tx,
            deliveries,
            fatal,
        }
    }

    /// Runs until cancelled or every handle is dropped.
    pub async fn run(mut self, token: CancellationToken) {
        let mut watching = true;
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                Some(delivery) = self.deliveries.recv() => {
                    let Delivery { key, ticket, event } = delivery;
                    if self.scheduler.on_stream_event(&key, ticket, event) {
                        self.pass(None);
                    }
                }
                changed = self.fatal.changed(), if watching => {
                    if changed.is_err() {
                        watching = false;
                        continue;
                    }
                    if let Some(reason) = self.fatal_reason() {
                        tracing::error!(%reason, "computation backend unavailable");
                        self.scheduler.abandon(OpError::Failed(reason));
                    }
                }
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => self.handle(cmd),
                    None => break,
                },
            }
        }
        self.scheduler.abandon(OpError::Abandoned);
        tracing::debug!("session stopped");
    }

    fn fatal_reason(&self) -> Option<String> {
        self.fatal.borrow().clone()
    }

    fn handle(&mut self, cmd: Command) {
        if !cmd.is_read_only()
            && let Some(reason) = self.fatal_reason()
        {
            cmd.reject(SessionError::BackendUnavailable(reason));
            return;
        }

        let s = &mut self.scheduler;
        match cmd {
            Command::Open { instance, reply } => {
                s.open(&instance);
                let _ = reply.send(Ok(()));
            }
            Command::Create {
                instance,
                spec,
                reply,
            } => {
                let result = s
                    .collection_mut(&instance)
                    .and_then(|c| c.create(spec))
                    .map_err(SessionError::from);
                let _ = reply.send(result);
            }
            Command::Annotate {
                instance,
                patron,
                reply,
            } => {
                let result = s
                    .collection_mut(&instance)
                    .and_then(|c| c.create_annotation(patron))
                    .map_err(SessionError::from);
                let _ = reply.send(result);
            }
            Command::SetOptions {
                key,
                options,
                changed,
                revision,
                enabled,
                reply,
            } => {
                let result = s
                    .collection_mut(&key.instance_id)
                    .and_then(|c| {
                        c.set_options(key.analysis_id, &options, &changed, revision, enabled)
                    })
                    .map_err(SessionError::from);
                let _ = reply.send(result);
            }
            Command::Run {
                key,
                clear_state,
                reply,
            } => {
                let result = s
                    .collection_mut(&key.instance_id)
                    .and_then(|c| {
                        if clear_state {
                            c.rerun(key.analysis_id)
                        } else {
                            c.run(key.analysis_id)
                        }
                    })
                    .map_err(SessionError::from);
                let _ = reply.send(result);
            }
            Command::RerunAll { instance, reply } => {
                let result = s
                    .collection_mut(&instance)
                    .map(|c| c.rerun_all())
                    .map_err(SessionError::from);
                let _ = reply.send(result);
            }
            Command::Delete { key, reply } => {
                let _ = reply.send(s.delete(&key).map_err(SessionError::from));
            }
            Command::Save {
                key,
                path,
                part,
                reply,
            } => {
                let _ = reply.send(s.queue_save(&key, path, part).map_err(SessionError::from));
            }
            Command::ModuleInstalled { namespace, reply } => {
                let _ = reply.send(Ok(s.module_installed(&namespace)));
            }
            Command::Snapshot { key, reply } => {
                let _ = reply.send(s.snapshot(&key).map_err(SessionError::from));
            }
            Command::List { instance, reply } => {
                let result = s
                    .collection(&instance)
                    .map(|c| c.iter().map(|a| a.snapshot()).collect())
                    .map_err(SessionError::from);
                let _ = reply.send(result);
            }
            Command::Slots { reply } => {
                let _ = reply.send(s.slots());
                return;
            }
        }

        for key in self.scheduler.take_changed() {
            self.pass(Some(&key));
        }
        self.pass(None);
    }

    fn pass(&mut self, hint: Option<&AnalysisKey>) {
        for started in self.scheduler.send_next(hint) {
            self.forward(started);
        }
    }

    fn forward(&self, started: Started) {
        let Started {
            key,
            ticket,
            mut stream,
        } = started;
        let tx = self.deliveries_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = stream.next().await {
                let terminal = event.is_terminal();
                let delivery = Delivery {
                    key: key.clone(),
                    ticket,
                    event,
                };
                if tx.send(delivery).is_err() || terminal {
                    break;
                }
            }
        });
    }
}

/// Handle to one instance's analyses inside a running [`Runtime`](crate::Runtime).
///
/// Cheap to clone. Every call is answered by the session actor; calls fail
/// with [`SessionError::Closed`] once the runtime has shut down.
#[derive(Clone)]
pub struct InstanceHandle {
    instance: InstanceId,
    tx: mpsc::Sender<Command>,
}

impl InstanceHandle {
    pub(crate) async fn open(
        instance: InstanceId,
        tx: mpsc::Sender<Command>,
    ) -> Result<Self, SessionError> {
        let handle = Self { instance, tx };
        let instance = handle.instance.clone();
        handle
            .call(|reply| Command::Open { instance, reply })
            .await?;
        Ok(handle)
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.instance
    }

    fn key(&self, id: AnalysisId) -> AnalysisKey {
        AnalysisKey::new(self.instance.clone(), id)
    }

    async fn call<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)?
    }

    /// Creates an analysis; it is scheduled right away if it needs work.
    pub async fn create(&self, spec: NewAnalysis) -> Result<AnalysisId, SessionError> {
        let instance = self.instance.clone();
        self.call(|reply| Command::Create {
            instance,
            spec,
            reply,
        })
        .await
    }

    /// Inserts an empty annotation right after `patron`.
    pub async fn create_annotation(&self, patron: AnalysisId) -> Result<AnalysisId, SessionError> {
        let instance = self.instance.clone();
        self.call(|reply| Command::Annotate {
            instance,
            patron,
            reply,
        })
        .await
    }

    /// Updates options. Returns whether the analysis was rescheduled.
    pub async fn set_options(
        &self,
        id: AnalysisId,
        options: Vec<u8>,
        changed: Vec<String>,
        revision: u64,
        enabled: Option<bool>,
    ) -> Result<bool, SessionError> {
        let key = self.key(id);
        self.call(|reply| Command::SetOptions {
            key,
            options,
            changed,
            revision,
            enabled,
            reply,
        })
        .await
    }

    pub async fn run(&self, id: AnalysisId) -> Result<bool, SessionError> {
        let key = self.key(id);
        self.call(|reply| Command::Run {
            key,
            clear_state: false,
            reply,
        })
        .await
    }

    /// Reruns from scratch (`clear_state`).
    pub async fn rerun(&self, id: AnalysisId) -> Result<bool, SessionError> {
        let key = self.key(id);
        self.call(|reply| Command::Run {
            key,
            clear_state: true,
            reply,
        })
        .await
    }

    pub async fn rerun_all(&self) -> Result<usize, SessionError> {
        let instance = self.instance.clone();
        self.call(|reply| Command::RerunAll { instance, reply })
            .await
    }

    pub async fn delete(&self, id: AnalysisId) -> Result<(), SessionError> {
        let key = self.key(id);
        self.call(|reply| Command::Delete { key, reply }).await
    }

    /// Queues a SAVE and waits for the worker's answer.
    pub async fn save(
        &self,
        id: AnalysisId,
        path: impl Into<String>,
        part: Option<String>,
    ) -> Result<AnalysisResponse, SessionError> {
        let key = self.key(id);
        let path = path.into();
        let outcome = self
            .call(|reply| Command::Save {
                key,
                path,
                part,
                reply,
            })
            .await?;
        Ok(outcome.await.map_err(|_| OpError::Abandoned)??)
    }

    /// Re-resolves analyses of `namespace` in every instance and reruns them.
    pub async fn module_installed(&self, namespace: impl Into<String>) -> Result<usize, SessionError> {
        let namespace = namespace.into();
        self.call(|reply| Command::ModuleInstalled { namespace, reply })
            .await
    }

    pub async fn snapshot(&self, id: AnalysisId) -> Result<AnalysisSnapshot, SessionError> {
        let key = self.key(id);
        self.call(|reply| Command::Snapshot { key, reply }).await
    }

    /// Snapshots of every analysis of the instance, in order.
    pub async fn snapshots(&self) -> Result<Vec<AnalysisSnapshot>, SessionError> {
        let instance = self.instance.clone();
        self.call(|reply| Command::List { instance, reply }).await
    }

    pub async fn slots(&self) -> Result<SlotUsage, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Slots { reply })
            .await
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::analysis::AnalysisStatus;
    use crate::events::Bus;
    use crate::modules::{AnalysisMeta, StaticRegistry};
    use crate::pool::{Dispatcher, Pool};
    use crate::protocol::{Perform, ResultElement, ResultStatus, ResultTree};

    struct Rig {
        handle: InstanceHandle,
        fatal: watch::Sender<Option<String>>,
        token: CancellationToken,
        registry: Arc<StaticRegistry>,
    }

    /// Answers every request: INIT → INITED, RUN → COMPLETE, SAVE → COMPLETE.
    fn fake_worker(mut d: Dispatcher) {
        tokio::spawn(async move {
            while let Some((req, mut sender)) = d.next().await {
                let status = match req.perform {
                    Perform::Init => ResultStatus::Inited,
                    Perform::Run | Perform::Save => ResultStatus::Complete,
                };
                sender.complete(AnalysisResponse {
                    instance_id: req.instance_id.clone(),
                    analysis_id: req.analysis_id,
                    namespace: req.namespace.clone(),
                    name: req.name.clone(),
                    revision: req.revision,
                    status,
                    options: Vec::new(),
                    results: ResultTree {
                        title: req.name.clone(),
                        status,
                        error: None,
                        elements: vec![ResultElement::preformatted(
                            "main",
                            req.path.clone().unwrap_or_default(),
                        )],
                    },
                });
            }
        });
    }

    async fn rig() -> Rig {
        let bus = Bus::new(256);
        let pool = Pool::new(3, bus.clone());
        fake_worker(pool.dispatcher().expect("dispatcher"));
        let registry = Arc::new(
            StaticRegistry::new().with_module("jmv", [AnalysisMeta::new("descriptives")]),
        );
        let scheduler = Scheduler::new(1, 2, pool, bus, registry.clone());
        let (tx, rx) = mpsc::channel(16);
        let (fatal, fatal_rx) = watch::channel(None);
        let token = CancellationToken::new();
        tokio::spawn(Session::new(scheduler, rx, fatal_rx).run(token.clone()));
        let handle = InstanceHandle::open(InstanceId::from("inst"), tx)
            .await
            .expect("open");
        Rig {
            handle,
            fatal,
            token,
            registry,
        }
    }

    async fn wait_for(handle: &InstanceHandle, id: AnalysisId, want: AnalysisStatus) {
        for _ in 0..200 {
            if handle.snapshot(id).await.expect("snapshot").status == want {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("analysis {id} never reached {want:?}");
    }

    #[tokio::test]
    async fn created_analysis_runs_to_completion() {
        let r = rig().await;
        let id = r
            .handle
            .create(NewAnalysis::new("jmv", "descriptives"))
            .await
            .unwrap();
        wait_for(&r.handle, id, AnalysisStatus::Complete).await;

        let slots = r.handle.slots().await.unwrap();
        assert_eq!(slots.active(), 0);
        assert_eq!(slots.total_slots(), 3);
    }

    #[tokio::test]
    async fn save_resolves_with_the_worker_response() {
        let r = rig().await;
        let id = r
            .handle
            .create(NewAnalysis::new("jmv", "descriptives"))
            .await
            .unwrap();
        wait_for(&r.handle, id, AnalysisStatus::Complete).await;

        let resp = r.handle.save(id, "/tmp/out.csv", None).await.unwrap();
        assert_eq!(resp.status, ResultStatus::Complete);
        assert_eq!(
            resp.results.elements,
            vec![ResultElement::preformatted("main", "/tmp/out.csv")]
        );
        wait_for(&r.handle, id, AnalysisStatus::Complete).await;
    }

    #[tokio::test]
    async fn missing_module_errors_until_installed() {
        let r = rig().await;
        let id = r
            .handle
            .create(NewAnalysis::new("extra", "plot"))
            .await
            .unwrap();
        wait_for(&r.handle, id, AnalysisStatus::Error).await;

        r.registry.install("extra", [AnalysisMeta::new("plot")]);
        assert_eq!(r.handle.module_installed("extra").await.unwrap(), 1);
        wait_for(&r.handle, id, AnalysisStatus::Complete).await;
    }

    #[tokio::test]
    async fn unknown_analysis_is_a_collection_error() {
        let r = rig().await;
        let err = r.handle.run(77).await.unwrap_err();
        assert!(matches!(err, SessionError::Collection(_)), "{err:?}");
    }

    #[tokio::test]
    async fn fatal_backend_rejects_mutations_but_allows_reads() {
        let r = rig().await;
        let id = r
            .handle
            .create(NewAnalysis::new("jmv", "descriptives"))
            .await
            .unwrap();
        wait_for(&r.handle, id, AnalysisStatus::Complete).await;

        r.fatal.send_replace(Some("worker exited at startup".into()));
        tokio::task::yield_now().await;

        let err = r
            .handle
            .create(NewAnalysis::new("jmv", "descriptives"))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            SessionError::BackendUnavailable("worker exited at startup".into())
        );
        assert_eq!(r.handle.snapshots().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn handle_reports_closed_after_shutdown() {
        let r = rig().await;
        r.token.cancel();
        for _ in 0..100 {
            if r.handle.slots().await == Err(SessionError::Closed) {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("session never closed");
    }
}
