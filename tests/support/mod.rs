//! In-memory scripted workers for driving a `Runtime` end to end.
#![allow(dead_code)]

use std::collections::HashSet;
use std::io;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use enginevisor::{
    AnalysisMeta, AnalysisRequest, AnalysisResponse, AnalysisStatus, Config, EngineError, Event,
    EventKind, FrameReader, FrameWriter, InstanceHandle, JitterPolicy, MessageStatus, Payload,
    Perform, ProtocolError, ResultElement, ResultStatus, ResultTree, Runtime, StaticRegistry,
    WorkerControl, WorkerLauncher, WorkerProcess,
};
use tokio::io::DuplexStream;
use tokio::sync::{broadcast, mpsc, watch};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Signal {
    Interrupt,
    Terminate,
    Kill,
}

/// How every worker launched by a [`ScriptedLauncher`] behaves.
#[derive(Default)]
pub struct Script {
    /// RUN requests for these analyses are never answered.
    pub hang: HashSet<String>,
    /// RUN requests for these analyses make the worker exit with code 137.
    pub crash: HashSet<String>,
    /// Workers exit shortly after answering a RUN for these analyses.
    pub exit_after: HashSet<String>,
    /// Workers exit right after launch.
    pub exit_on_start: bool,
    /// Workers do not acknowledge SIGINT.
    pub ignore_interrupt: bool,
    /// Workers ignore the shutdown message and SIGTERM.
    pub stubborn: bool,
    /// Number of upcoming launches that fail.
    pub failing_launches: AtomicUsize,
    /// Launches attempted, failed ones included.
    pub launches: AtomicUsize,
    /// Every request received, in order.
    pub received: Mutex<Vec<AnalysisRequest>>,
    /// `(worker pid, analysis id)` for every request received.
    pub served: Mutex<Vec<(u32, u32)>>,
}

impl Script {
    pub fn hang(mut self, name: &str) -> Self {
        self.hang.insert(name.to_owned());
        self
    }

    pub fn crash(mut self, name: &str) -> Self {
        self.crash.insert(name.to_owned());
        self
    }

    pub fn exit_after(mut self, name: &str) -> Self {
        self.exit_after.insert(name.to_owned());
        self
    }

    /// Pids of the workers that received requests for analysis `id`.
    pub fn served_by(&self, id: u32) -> Vec<u32> {
        self.served
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, analysis)| *analysis == id)
            .map(|(pid, _)| *pid)
            .collect()
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn received(&self) -> Vec<AnalysisRequest> {
        self.received.lock().unwrap().clone()
    }
}

/// Pid of the first launched worker; later launches count up from it.
pub const FIRST_PID: u32 = 1000;

pub struct ScriptedLauncher {
    pub script: Arc<Script>,
    next_pid: AtomicU32,
}

impl ScriptedLauncher {
    pub fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script: Arc::new(script),
            next_pid: AtomicU32::new(FIRST_PID),
        })
    }
}

#[async_trait]
impl WorkerLauncher for ScriptedLauncher {
    async fn launch(&self, engine: usize) -> Result<WorkerProcess, EngineError> {
        self.script.launches.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .script
            .failing_launches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(EngineError::Launch(format!("engine {engine}: scripted failure")));
        }

        let (engine_out, worker_in) = tokio::io::duplex(64 * 1024);
        let (worker_out, engine_in) = tokio::io::duplex(64 * 1024);
        let (signals_tx, signals) = mpsc::unbounded_channel();
        let (exited_tx, exited) = watch::channel(None);
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);

        tokio::spawn(run_worker(
            pid,
            Arc::clone(&self.script),
            FrameReader::new(worker_in),
            FrameWriter::new(worker_out),
            signals,
            exited_tx,
        ));

        let control = FakeControl {
            pid,
            signals: signals_tx,
            exited,
        };
        Ok(WorkerProcess::new(engine_in, engine_out, control))
    }
}

struct FakeControl {
    pid: u32,
    signals: mpsc::UnboundedSender<Signal>,
    exited: watch::Receiver<Option<Option<i32>>>,
}

#[async_trait]
impl WorkerControl for FakeControl {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn interrupt(&mut self) -> io::Result<()> {
        let _ = self.signals.send(Signal::Interrupt);
        Ok(())
    }

    fn terminate(&mut self) -> io::Result<()> {
        let _ = self.signals.send(Signal::Terminate);
        Ok(())
    }

    fn kill(&mut self) -> io::Result<()> {
        let _ = self.signals.send(Signal::Kill);
        Ok(())
    }

    async fn wait(&mut self) -> io::Result<Option<i32>> {
        loop {
            if let Some(code) = *self.exited.borrow_and_update() {
                return Ok(code);
            }
            if self.exited.changed().await.is_err() {
                return Ok(*self.exited.borrow()).map(Option::flatten);
            }
        }
    }
}

pub fn response(req: &AnalysisRequest, status: ResultStatus, text: &str) -> AnalysisResponse {
    AnalysisResponse {
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
            elements: vec![ResultElement::preformatted("main", text)],
        },
    }
}

async fn run_worker(
    pid: u32,
    script: Arc<Script>,
    mut reader: FrameReader<DuplexStream>,
    mut writer: FrameWriter<DuplexStream>,
    mut signals: mpsc::UnboundedReceiver<Signal>,
    exited: watch::Sender<Option<Option<i32>>>,
) {
    if script.exit_on_start {
        exited.send_replace(Some(Some(1)));
        return;
    }

    let mut current: Option<AnalysisRequest> = None;
    let code = loop {
        tokio::select! {
            signal = signals.recv() => match signal {
                Some(Signal::Interrupt) => {
                    if let Some(req) = current.take()
                        && !script.ignore_interrupt
                    {
                        let ack = response(&req, ResultStatus::Error, "interrupted");
                        let _ = writer
                            .send(MessageStatus::Complete, Payload::AnalysisResponse(ack))
                            .await;
                    }
                }
                Some(Signal::Terminate) if script.stubborn => {}
                Some(Signal::Terminate) | Some(Signal::Kill) | None => break None,
            },
            frame = reader.next() => match frame {
                None | Some(Err(_)) => {
                    if script.stubborn {
                        // Keep "running" until killed.
                        match signals.recv().await {
                            Some(Signal::Kill) | None => break None,
                            Some(_) => continue,
                        }
                    }
                    break Some(0);
                }
                Some(Ok(envelope)) => match envelope.payload {
                    Payload::Shutdown if script.stubborn => {}
                    Payload::Shutdown => break Some(0),
                    Payload::AnalysisResponse(_) => {}
                    Payload::AnalysisRequest(req) => {
                        script.received.lock().unwrap().push(req.clone());
                        script.served.lock().unwrap().push((pid, req.analysis_id));
                        let run = req.perform == Perform::Run;
                        if run && script.crash.contains(&req.name) {
                            break Some(137);
                        }
                        if run && script.hang.contains(&req.name) {
                            current = Some(req);
                            continue;
                        }
                        current = None;
                        if answer(&mut writer, &req).await.is_err() {
                            break Some(0);
                        }
                        if run && script.exit_after.contains(&req.name) {
                            // Leave the engine time to read the answer first.
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            break Some(0);
                        }
                    }
                },
            },
        }
    };
    drop(writer);
    exited.send_replace(Some(code));
}

async fn answer(
    writer: &mut FrameWriter<DuplexStream>,
    req: &AnalysisRequest,
) -> Result<(), ProtocolError> {
    match req.perform {
        Perform::Init => {
            // INITED in an in-progress envelope is terminal for an INIT.
            let resp = response(req, ResultStatus::Inited, "");
            writer
                .send(MessageStatus::InProgress, Payload::AnalysisResponse(resp))
                .await?;
        }
        Perform::Run => {
            let partial = response(req, ResultStatus::Running, "working");
            writer
                .send(MessageStatus::InProgress, Payload::AnalysisResponse(partial))
                .await?;
            let done = response(req, ResultStatus::Complete, "done");
            writer
                .send(MessageStatus::Complete, Payload::AnalysisResponse(done))
                .await?;
        }
        Perform::Save => {
            let text = req.path.clone().unwrap_or_default();
            let done = response(req, ResultStatus::Complete, &text);
            writer
                .send(MessageStatus::Complete, Payload::AnalysisResponse(done))
                .await?;
        }
    }
    Ok(())
}

/// Config with short timings for tests.
pub fn config(init: usize, run: usize) -> Config {
    let mut cfg = Config {
        init_slots: init,
        run_slots: run,
        cancel_grace: Duration::from_millis(100),
        stop_timeout: Duration::from_millis(200),
        grace: Duration::from_secs(5),
        ..Config::default()
    };
    cfg.restart_backoff.first = Duration::from_millis(10);
    cfg.restart_backoff.max = Duration::from_millis(50);
    cfg.restart_backoff.jitter = JitterPolicy::None;
    cfg
}

pub fn registry() -> Arc<StaticRegistry> {
    Arc::new(StaticRegistry::new().with_module(
        "jmv",
        [
            AnalysisMeta::new("descriptives"),
            AnalysisMeta::new("ttest"),
            AnalysisMeta::new("slow"),
            AnalysisMeta::new("crashy"),
        ],
    ))
}

pub fn runtime(cfg: Config, launcher: Arc<ScriptedLauncher>) -> Arc<Runtime> {
    Runtime::builder(cfg)
        .with_registry(registry())
        .with_launcher(launcher)
        .build()
        .expect("valid config")
}

/// Polls until analysis `id` reaches `want`.
pub async fn wait_status(handle: &InstanceHandle, id: u32, want: AnalysisStatus) {
    let polled = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if handle.snapshot(id).await.expect("snapshot").status == want {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "analysis {id} never reached {want:?}");
}

/// Waits for the first event matching `pred`.
pub async fn wait_event(
    rx: &mut broadcast::Receiver<Event>,
    pred: impl Fn(&Event) -> bool,
) -> Event {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Ok(ev) if pred(&ev) => return ev,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("bus closed"),
            }
        }
    })
    .await
    .expect("event did not arrive in time")
}

/// Drains what is buffered and counts events of `kind`.
pub fn count(rx: &mut broadcast::Receiver<Event>, kind: EventKind) -> usize {
    let mut n = 0;
    while let Ok(ev) = rx.try_recv() {
        if ev.kind == kind {
            n += 1;
        }
    }
    n
}
