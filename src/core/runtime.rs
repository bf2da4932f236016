//! # Runtime: wires the scheduler, the pool and the engines, and shuts them down.
//!
//! The [`Runtime`] owns the event bus, the request [`Pool`], the
//! [`EngineManager`] and the session actor behind every [`InstanceHandle`].
//!
//! ## High-level architecture
//! ```text
//! start():
//!   subscriber_listener(): Bus.subscribe() ─► EngineTracker::update + SubscriberSet::emit
//!   EngineManager::start():  launch every worker (failure → EngineStartup)
//!                            spawn EngineActor[0..N] + dispatch loop
//!   Session::run():          scheduler actor, fed by InstanceHandles
//!
//! Request flow:
//!   InstanceHandle ─► Session ─► Scheduler::send_next ─► Pool::submit
//!   Pool ─► Dispatcher ─► dispatch loop ─► EngineActor ─► worker process
//!   worker ─► EngineActor ─► ResultSender ─► ResultStream ─► Session ─► Analysis
//!
//! Shutdown path:
//!   Bus.publish(ShutdownRequested)
//!   runtime_token.cancel()  → session, dispatch loop and engines stop
//!   pool.close()
//!   wait_all_with_grace(cfg.grace):
//!     ├─ Ok (all joined)  → AllStoppedWithin
//!     └─ timeout          → GraceExceeded (EngineTracker.snapshot() for stuck engines)
//!   listener drains the bus, subscribers drain their queues
//! ```
//!
//! ## Example
//! ```no_run
//! use std::sync::Arc;
//! use enginevisor::{AnalysisMeta, Config, EngineCommand, NewAnalysis, Runtime, StaticRegistry};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut cfg = Config::default();
//!     cfg.engine = EngineCommand::new("/usr/lib/analysis/engine").data_path("/tmp/data");
//!
//!     let registry = StaticRegistry::new().with_module("jmv", [AnalysisMeta::new("descriptives")]);
//!     let runtime = Runtime::builder(cfg)
//!         .with_registry(Arc::new(registry))
//!         .build()?;
//!     runtime.start().await?;
//!
//!     let doc = runtime.instance("doc-1").await?;
//!     let id = doc.create(NewAnalysis::new("jmv", "descriptives")).await?;
//!     println!("{:?}", doc.snapshot(id).await?.status);
//!
//!     runtime.run_until_signal().await?;
//!     Ok(())
//! }
//! ```

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, broadcast, mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::core::{Config, RuntimeBuilder, alive::EngineTracker, shutdown};
use crate::engine::EngineManager;
use crate::error::{RuntimeError, SessionError};
use crate::events::{Bus, Event, EventKind};
use crate::modules::ModuleRegistry;
use crate::pool::Pool;
use crate::protocol::InstanceId;
use crate::scheduler::{Command, InstanceHandle, Scheduler, Session};
use crate::subscribers::{Subscribe, SubscriberSet};

/// Session command queue depth.
const COMMAND_QUEUE: usize = 64;

enum Phase {
    Built,
    Running(Running),
    Stopped,
}

struct Running {
    set: JoinSet<()>,
    commands: mpsc::Sender<Command>,
    listener: JoinHandle<()>,
    listener_token: CancellationToken,
}

/// Analysis scheduling runtime over a fixed set of worker engines.
pub struct Runtime {
    cfg: Config,
    bus: Bus,
    pool: Pool,
    registry: Arc<dyn ModuleRegistry>,
    engines: EngineManager,
    tracker: Arc<EngineTracker>,
    subscribers: Mutex<Vec<Arc<dyn Subscribe>>>,
    token: CancellationToken,
    phase: AsyncMutex<Phase>,
}

impl Runtime {
    /// Starts building a runtime for `cfg`.
    pub fn builder(cfg: Config) -> RuntimeBuilder {
        RuntimeBuilder::new(cfg)
    }

    pub(crate) fn new_internal(
        cfg: Config,
        subscribers: Vec<Arc<dyn Subscribe>>,
        registry: Arc<dyn ModuleRegistry>,
        launcher: Arc<dyn crate::engine::WorkerLauncher>,
    ) -> Self {
        let bus = Bus::new(cfg.bus_capacity_clamped());
        let pool = Pool::new(cfg.total_slots(), bus.clone());
        let engines = EngineManager::new(&cfg, launcher, bus.clone());
        Self {
            cfg,
            bus,
            pool,
            registry,
            engines,
            tracker: Arc::new(EngineTracker::new()),
            subscribers: Mutex::new(subscribers),
            token: CancellationToken::new(),
            phase: AsyncMutex::new(Phase::Built),
        }
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    /// Event bus; subscribe to observe the runtime directly.
    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Receiver that turns `Some(reason)` once the computation backend failed fatally.
    pub fn fatal(&self) -> watch::Receiver<Option<String>> {
        self.engines.fatal()
    }

    /// Launches the engines and the scheduler.
    ///
    /// Fails with [`RuntimeError::EngineStartup`] if any worker cannot be
    /// launched; the runtime cannot be started again after that.
    pub async fn start(&self) -> Result<(), RuntimeError> {
        let mut phase = self.phase.lock().await;
        if !matches!(*phase, Phase::Built) {
            return Err(RuntimeError::AlreadyStarted);
        }
        let dispatcher = self.pool.dispatcher().ok_or(RuntimeError::AlreadyStarted)?;
        *phase = Phase::Stopped;

        let listener_token = CancellationToken::new();
        let listener = self.subscriber_listener(listener_token.clone());

        let mut set = JoinSet::new();
        if let Err(e) = self.engines.start(dispatcher, &mut set, &self.token).await {
            tracing::error!(error = %e, "engine startup failed");
            self.pool.close();
            listener_token.cancel();
            let _ = listener.await;
            return Err(e);
        }

        let scheduler = Scheduler::new(
            self.cfg.init_slots,
            self.cfg.run_slots,
            self.pool.clone(),
            self.bus.clone(),
            Arc::clone(&self.registry),
        );
        let (commands, rx) = mpsc::channel(COMMAND_QUEUE);
        let session = Session::new(scheduler, rx, self.engines.fatal());
        set.spawn(session.run(self.token.child_token()));

        tracing::info!(
            engines = self.engines.engine_count(),
            init_slots = self.cfg.init_slots,
            run_slots = self.cfg.run_slots,
            "runtime started"
        );
        *phase = Phase::Running(Running {
            set,
            commands,
            listener,
            listener_token,
        });
        Ok(())
    }

    /// Opens (or reopens) the analyses of instance `id`.
    ///
    /// Fails with [`SessionError::Closed`] unless the runtime is running.
    pub async fn instance(&self, id: impl Into<InstanceId>) -> Result<InstanceHandle, SessionError> {
        let commands = match &*self.phase.lock().await {
            Phase::Running(running) => running.commands.clone(),
            _ => return Err(SessionError::Closed),
        };
        InstanceHandle::open(id.into(), commands).await
    }

    /// Replaces every worker process once it is idle.
    pub fn restart_engines(&self) {
        tracing::info!("restarting engines");
        self.engines.restart_engines();
    }

    /// Waits for SIGINT/SIGTERM/SIGQUIT (Ctrl-C elsewhere), then shuts down.
    pub async fn run_until_signal(&self) -> Result<(), RuntimeError> {
        match shutdown::wait_for_shutdown_signal().await {
            Ok(signal) => tracing::info!(signal, "shutdown signal received"),
            Err(e) => tracing::error!(error = %e, "signal registration failed, shutting down"),
        }
        self.shutdown().await
    }

    /// Stops the scheduler and every engine, waiting at most `grace`.
    pub async fn shutdown(&self) -> Result<(), RuntimeError> {
        let running = {
            let mut phase = self.phase.lock().await;
            match std::mem::replace(&mut *phase, Phase::Stopped) {
                Phase::Running(running) => running,
                other => {
                    *phase = other;
                    return Err(RuntimeError::NotStarted);
                }
            }
        };
        let Running {
            mut set,
            commands,
            listener,
            listener_token,
        } = running;
        drop(commands);

        self.bus.publish(Event::new(EventKind::ShutdownRequested));
        self.token.cancel();
        self.pool.close();

        let result = self.wait_all_with_grace(&mut set).await;
        set.abort_all();

        listener_token.cancel();
        let _ = listener.await;
        result
    }

    /// Waits for every task to finish within the configured grace period.
    async fn wait_all_with_grace(&self, set: &mut JoinSet<()>) -> Result<(), RuntimeError> {
        let grace = self.cfg.grace;
        let done = async { while set.join_next().await.is_some() {} };

        match tokio::time::timeout(grace, done).await {
            Ok(()) => {
                self.bus.publish(Event::new(EventKind::AllStoppedWithin));
                Ok(())
            }
            Err(_) => {
                let stuck = self.tracker.snapshot().await;
                self.bus.publish(
                    Event::new(EventKind::GraceExceeded).with_reason(format!("{stuck:?}")),
                );
                Err(RuntimeError::GraceExceeded { grace, stuck })
            }
        }
    }

    /// Subscribes to the bus and forwards events to the tracker and the
    /// subscriber set until `stop` is cancelled, then drains what is buffered.
    fn subscriber_listener(&self, stop: CancellationToken) -> JoinHandle<()> {
        let mut rx = self.bus.subscribe();
        let subscribers = std::mem::take(
            &mut *self
                .subscribers
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        let set = SubscriberSet::new(subscribers, self.bus.clone());
        let tracker = Arc::clone(&self.tracker);

        tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    biased;
                    _ = stop.cancelled() => break,
                    received = rx.recv() => received,
                };
                match received {
                    Ok(ev) => {
                        tracker.update(&ev).await;
                        set.emit(&ev);
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "event listener lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            while let Ok(ev) = rx.try_recv() {
                tracker.update(&ev).await;
                set.emit(&ev);
            }
            set.shutdown().await;
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::EngineCommand;

    fn cfg() -> Config {
        Config {
            engine: EngineCommand::new("/nonexistent/enginevisor-worker"),
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn shutdown_before_start_is_rejected() {
        let rt = Runtime::builder(cfg()).build().expect("valid config");
        let err = rt.shutdown().await.unwrap_err();
        assert_eq!(err.as_label(), "runtime_not_started");
    }

    #[tokio::test]
    async fn instance_before_start_is_closed() {
        let rt = Runtime::builder(cfg()).build().expect("valid config");
        assert_eq!(rt.instance("doc").await.err(), Some(SessionError::Closed));
    }

    #[tokio::test]
    async fn failed_first_launch_is_engine_startup_and_fatal() {
        let rt = Runtime::builder(cfg()).build().expect("valid config");
        let fatal = rt.fatal();

        let err = rt.start().await.unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(err, RuntimeError::EngineStartup { engine: 0, .. }));
        assert!(fatal.borrow().is_some());

        let again = rt.start().await.unwrap_err();
        assert_eq!(again.as_label(), "runtime_already_started");
    }
}
