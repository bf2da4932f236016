//! # Worker processes: launching and controlling one external engine.
//!
//! The engine actor never touches `tokio::process` directly. It asks a
//! [`WorkerLauncher`] for a [`WorkerProcess`] (framed reader and writer plus a
//! [`WorkerControl`]) so that tests can substitute an in-memory worker.
//!
//! ```text
//! ProcessLauncher::launch()
//!   └─► Command(program, argv, env)
//!         ├─ stdin  ──► FrameWriter   (requests, shutdown)
//!         ├─ stdout ──► FrameReader   (responses)
//!         └─ Child  ──► ChildControl  (SIGINT / SIGTERM / kill / wait)
//! ```

use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};

use crate::core::EngineCommand;
use crate::error::EngineError;
use crate::protocol::{FrameReader, FrameWriter};

/// Boxed read half of a worker transport.
pub type WorkerReader = Box<dyn AsyncRead + Send + Unpin>;
/// Boxed write half of a worker transport.
pub type WorkerWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Process-level control over a running worker.
#[async_trait]
pub trait WorkerControl: Send {
    /// OS process id, if there is one.
    fn pid(&self) -> Option<u32>;

    /// Asks the worker to abandon its current request (SIGINT).
    fn interrupt(&mut self) -> io::Result<()>;

    /// Asks the worker to exit (SIGTERM).
    fn terminate(&mut self) -> io::Result<()>;

    /// Kills the worker.
    fn kill(&mut self) -> io::Result<()>;

    /// Waits for the worker to exit and returns its exit code.
    ///
    /// Must be cancel-safe: the engine polls it inside `select!`.
    async fn wait(&mut self) -> io::Result<Option<i32>>;
}

/// A launched worker: transport halves and process control.
pub struct WorkerProcess {
    pub reader: FrameReader<WorkerReader>,
    pub writer: FrameWriter<WorkerWriter>,
    pub control: Box<dyn WorkerControl>,
}

impl WorkerProcess {
    pub fn new(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
        control: impl WorkerControl + 'static,
    ) -> Self {
        Self {
            reader: FrameReader::new(Box::new(reader)),
            writer: FrameWriter::new(Box::new(writer)),
            control: Box::new(control),
        }
    }
}

/// Starts worker processes for the engines.
///
/// # Example
/// ```
/// use async_trait::async_trait;
/// use enginevisor::{EngineError, WorkerLauncher, WorkerProcess};
///
/// struct Unavailable;
///
/// #[async_trait]
/// impl WorkerLauncher for Unavailable {
///     async fn launch(&self, engine: usize) -> Result<WorkerProcess, EngineError> {
///         Err(EngineError::Launch(format!("engine {engine}: no backend")))
///     }
/// }
/// ```
#[async_trait]
pub trait WorkerLauncher: Send + Sync + 'static {
    /// Launches the worker for engine `engine`.
    async fn launch(&self, engine: usize) -> Result<WorkerProcess, EngineError>;
}

/// Launches the configured executable with piped stdin/stdout.
///
/// The child inherits stderr and is killed if its handle is dropped.
pub struct ProcessLauncher {
    command: EngineCommand,
}

impl ProcessLauncher {
    pub fn new(command: EngineCommand) -> Self {
        Self { command }
    }

    pub fn command(&self) -> &EngineCommand {
        &self.command
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(&self, engine: usize) -> Result<WorkerProcess, EngineError> {
        let mut child = Command::new(&self.command.program)
            .args(self.command.argv())
            .envs(self.command.env.iter().map(|(k, v)| (k, v)))
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                EngineError::Launch(format!("{}: {e}", self.command.program.display()))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| EngineError::Launch("worker stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::Launch("worker stdout unavailable".into()))?;

        tracing::debug!(engine, pid = ?child.id(), "worker process spawned");
        Ok(WorkerProcess::new(stdout, stdin, ChildControl { child }))
    }
}

/// [`WorkerControl`] over a `tokio::process::Child`.
struct ChildControl {
    child: Child,
}

impl ChildControl {
    #[cfg(unix)]
    fn signal(&mut self, signal: nix::sys::signal::Signal) -> io::Result<()> {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        let Some(pid) = self.child.id() else {
            // Already reaped.
            return Ok(());
        };
        let pid = i32::try_from(pid).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        kill(Pid::from_raw(pid), signal).map_err(io::Error::from)
    }
}

#[async_trait]
impl WorkerControl for ChildControl {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    #[cfg(unix)]
    fn interrupt(&mut self) -> io::Result<()> {
        self.signal(nix::sys::signal::Signal::SIGINT)
    }

    #[cfg(not(unix))]
    fn interrupt(&mut self) -> io::Result<()> {
        self.child.start_kill()
    }

    #[cfg(unix)]
    fn terminate(&mut self) -> io::Result<()> {
        self.signal(nix::sys::signal::Signal::SIGTERM)
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) -> io::Result<()> {
        self.child.start_kill()
    }

    fn kill(&mut self) -> io::Result<()> {
        self.child.start_kill()
    }

    async fn wait(&mut self) -> io::Result<Option<i32>> {
        self.child.wait().await.map(|status| status.code())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_executable_is_a_launch_error() {
        let launcher = ProcessLauncher::new(EngineCommand::new("/nonexistent/enginevisor-worker"));
        let err = launcher.launch(0).await.err().expect("launch must fail");
        assert_eq!(err.as_label(), "engine_launch");
        assert!(err.to_string().contains("/nonexistent/enginevisor-worker"));
    }

    #[tokio::test]
    async fn spawned_process_can_be_terminated() {
        let launcher = ProcessLauncher::new(EngineCommand::new("sleep").arg("30"));
        let mut worker = launcher.launch(0).await.expect("sleep is available");
        assert!(worker.control.pid().is_some());

        worker.control.terminate().expect("signal");
        let code = worker.control.wait().await.expect("wait");
        assert_eq!(code, None, "terminated by signal, no exit code");
    }
}
