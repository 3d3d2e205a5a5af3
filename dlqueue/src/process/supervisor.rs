//! Process supervisor.
//!
//! One background thread owns every child started through the supervisor. On
//! each pass it reaps exited children and publishes their exit, and for
//! children whose cancellation token fired it walks a termination ladder:
//! graceful request, forced kill after `graceful_timeout`, and finally
//! abandonment after `forced_timeout`. The thread sleeps on a condition
//! variable between passes so new work or a cancellation can wake it early.

use std::path::PathBuf;
use std::process::{Child, ChildStderr, ChildStdout, ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use process_utils::{TerminationRequest, request_termination, std_command};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::output::spawn_record_pump;
use crate::{Error, Result};

/// Timing knobs for the supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Maximum time between two supervision passes.
    pub poll_interval_ms: u64,
    /// How long a process gets to honour a graceful termination request.
    pub graceful_timeout_ms: u64,
    /// How long to wait for a forced kill to take effect before giving up.
    pub forced_timeout_ms: u64,
    /// Upper bound on how long `shutdown` waits for the supervision thread.
    pub shutdown_timeout_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 250,
            graceful_timeout_ms: 5000,
            forced_timeout_ms: 3000,
            shutdown_timeout_ms: 10_000,
        }
    }
}

impl SupervisorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn graceful_timeout(&self) -> Duration {
        Duration::from_millis(self.graceful_timeout_ms)
    }

    pub fn forced_timeout(&self) -> Duration {
        Duration::from_millis(self.forced_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// What to run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl ProcessSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Short label for logs.
    pub fn label(&self) -> String {
        std::path::Path::new(&self.program)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.clone())
    }
}

/// How a supervised process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessExit {
    /// Exited on its own. The code is `None` when a foreign signal killed it.
    Exited(Option<i32>),
    /// Exited after the supervisor asked it to stop.
    Terminated(Option<i32>),
    /// Still running after a forced kill; the supervisor stopped tracking it.
    Abandoned,
    /// The exit status could not be collected.
    Lost,
}

impl ProcessExit {
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Exited(code) | Self::Terminated(code) => *code,
            Self::Abandoned | Self::Lost => None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Exited(Some(0)))
    }
}

#[derive(Debug, Clone, Copy)]
enum Termination {
    Graceful { since: Instant },
    Forced { since: Instant },
}

struct TrackedProcess {
    id: u64,
    pid: u32,
    label: String,
    child: Child,
    token: CancellationToken,
    exit_tx: watch::Sender<Option<ProcessExit>>,
    termination: Option<Termination>,
}

impl TrackedProcess {
    fn publish(&self, exit: ProcessExit) {
        self.exit_tx.send_replace(Some(exit));
    }
}

struct SupervisorState {
    processes: Vec<TrackedProcess>,
    next_id: u64,
    wake_pending: bool,
}

struct Shared {
    config: SupervisorConfig,
    state: Mutex<SupervisorState>,
    wakeup: Condvar,
    closed: AtomicBool,
}

impl Shared {
    fn wake(&self) {
        self.state.lock().wake_pending = true;
        self.wakeup.notify_all();
    }
}

struct Worker {
    handle: JoinHandle<()>,
    done_rx: std_mpsc::Receiver<()>,
}

/// Owns every child process started by the backends.
pub struct ProcessSupervisor {
    shared: Arc<Shared>,
    worker: Mutex<Option<Worker>>,
}

impl ProcessSupervisor {
    /// Create the supervisor and start its background thread.
    pub fn new(config: SupervisorConfig) -> Result<Self> {
        let shared = Arc::new(Shared {
            config,
            state: Mutex::new(SupervisorState {
                processes: Vec::new(),
                next_id: 1,
                wake_pending: false,
            }),
            wakeup: Condvar::new(),
            closed: AtomicBool::new(false),
        });

        let (done_tx, done_rx) = std_mpsc::channel();
        let thread_shared = shared.clone();
        let handle = std::thread::Builder::new()
            .name("process-supervisor".to_string())
            .spawn(move || {
                supervision_loop(&thread_shared);
                let _ = done_tx.send(());
            })
            .map_err(|e| Error::Other(format!("Failed to start supervisor thread: {e}")))?;

        Ok(Self {
            shared,
            worker: Mutex::new(Some(Worker { handle, done_rx })),
        })
    }

    /// Start a process with piped stdout/stderr.
    pub fn start(&self, spec: &ProcessSpec, token: &CancellationToken) -> Result<SupervisedProcess> {
        self.launch(spec, token, false)
    }

    /// Start a process with its output discarded.
    pub fn start_silent(
        &self,
        spec: &ProcessSpec,
        token: &CancellationToken,
    ) -> Result<SupervisedProcess> {
        self.launch(spec, token, true)
    }

    fn launch(
        &self,
        spec: &ProcessSpec,
        token: &CancellationToken,
        silent: bool,
    ) -> Result<SupervisedProcess> {
        if self.is_closed() {
            return Err(Error::SupervisorClosed);
        }
        if token.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let mut cmd = std_command(&spec.program);
        cmd.args(&spec.args).stdin(Stdio::null());
        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        if silent {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        } else {
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        }

        let mut child = cmd.spawn().map_err(|source| Error::Spawn {
            program: spec.program.clone(),
            source,
        })?;

        let pid = child.id();
        let label = spec.label();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (exit_tx, exit_rx) = watch::channel(None);

        let id = {
            let mut state = self.shared.state.lock();
            if self.shared.closed.load(Ordering::SeqCst) {
                drop(state);
                let _ = child.kill();
                let _ = child.wait();
                return Err(Error::SupervisorClosed);
            }
            let id = state.next_id;
            state.next_id += 1;
            state.processes.push(TrackedProcess {
                id,
                pid,
                label: label.clone(),
                child,
                token: token.clone(),
                exit_tx,
                termination: None,
            });
            state.wake_pending = true;
            id
        };
        self.shared.wakeup.notify_all();

        debug!(process_id = id, pid, program = %label, args = ?spec.args, "Process started");

        Ok(SupervisedProcess {
            id,
            pid,
            label,
            stdout,
            stderr,
            exit_rx,
        })
    }

    /// Run a supervision pass as soon as possible.
    pub fn wake(&self) {
        self.shared.wake();
    }

    /// Number of processes currently tracked.
    pub fn tracked_count(&self) -> usize {
        self.shared.state.lock().processes.len()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Kill every tracked process and stop the supervision thread.
    ///
    /// Blocks for at most `shutdown_timeout`. Calling it again is a no-op.
    pub fn shutdown(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        {
            let mut state = self.shared.state.lock();
            let now = Instant::now();
            let count = state.processes.len();
            for process in state.processes.iter_mut() {
                if let Err(e) = process.child.kill() {
                    trace!(process_id = process.id, error = %e, "Kill during shutdown failed");
                }
                process.termination = Some(Termination::Forced { since: now });
            }
            state.wake_pending = true;
            if count > 0 {
                info!(count, "Process supervisor shutting down, killed tracked processes");
            } else {
                debug!("Process supervisor shutting down");
            }
        }
        self.shared.wakeup.notify_all();

        let Some(worker) = self.worker.lock().take() else {
            return;
        };
        match worker
            .done_rx
            .recv_timeout(self.shared.config.shutdown_timeout())
        {
            Ok(()) | Err(std_mpsc::RecvTimeoutError::Disconnected) => {
                let _ = worker.handle.join();
                debug!("Process supervisor stopped");
            }
            Err(std_mpsc::RecvTimeoutError::Timeout) => {
                warn!("Process supervisor did not stop within the shutdown timeout");
            }
        }
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn supervision_loop(shared: &Shared) {
    debug!("Process supervisor started");
    let mut state = shared.state.lock();
    loop {
        let closed = shared.closed.load(Ordering::SeqCst);
        supervise_pass(shared, &mut state, closed);

        if closed && state.processes.is_empty() {
            break;
        }

        if !state.wake_pending {
            shared
                .wakeup
                .wait_for(&mut state, shared.config.poll_interval());
        }
        state.wake_pending = false;
    }
}

fn supervise_pass(shared: &Shared, state: &mut MutexGuard<'_, SupervisorState>, closed: bool) {
    let config = &shared.config;
    let now = Instant::now();
    let mut graceful = Vec::new();

    state.processes.retain_mut(|process| {
        let terminating = process.termination.is_some();
        match process.child.try_wait() {
            Ok(Some(status)) => {
                let exit = classify_exit(status, terminating);
                debug!(process_id = process.id, pid = process.pid, program = %process.label, ?exit, "Process exited");
                process.publish(exit);
                return false;
            }
            Ok(None) => {}
            Err(e) => {
                warn!(process_id = process.id, pid = process.pid, error = %e, "Failed to poll process status");
                process.publish(ProcessExit::Lost);
                return false;
            }
        }

        if !closed && !process.token.is_cancelled() {
            return true;
        }

        match process.termination {
            None => {
                process.termination = Some(Termination::Graceful { since: now });
                graceful.push((process.id, process.pid));
                true
            }
            Some(Termination::Graceful { since })
                if now.duration_since(since) >= config.graceful_timeout() =>
            {
                debug!(process_id = process.id, pid = process.pid, "Graceful termination timed out, killing");
                if let Err(e) = process.child.kill() {
                    warn!(process_id = process.id, error = %e, "Failed to kill process");
                }
                process.termination = Some(Termination::Forced { since: now });
                true
            }
            Some(Termination::Forced { since })
                if now.duration_since(since) >= config.forced_timeout() =>
            {
                warn!(process_id = process.id, pid = process.pid, program = %process.label, "Process survived a forced kill, abandoning it");
                process.publish(ProcessExit::Abandoned);
                false
            }
            Some(_) => true,
        }
    });

    if graceful.is_empty() {
        return;
    }

    // termination requests may shell out on some platforms; keep them off the lock
    MutexGuard::unlocked(state, || {
        for (id, pid) in graceful {
            match request_termination(pid) {
                TerminationRequest::Delivered => {
                    debug!(process_id = id, pid, "Requested graceful termination")
                }
                TerminationRequest::NotFound => {
                    trace!(process_id = id, pid, "Process already gone")
                }
                TerminationRequest::Rejected => {
                    warn!(process_id = id, pid, "Graceful termination request was rejected")
                }
            }
        }
    });
}

fn classify_exit(status: ExitStatus, terminating: bool) -> ProcessExit {
    if terminating {
        ProcessExit::Terminated(status.code())
    } else {
        ProcessExit::Exited(status.code())
    }
}

/// Handle to a process owned by the supervisor.
#[derive(Debug)]
pub struct SupervisedProcess {
    id: u64,
    pid: u32,
    label: String,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    exit_rx: watch::Receiver<Option<ProcessExit>>,
}

impl SupervisedProcess {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Merge stdout and stderr into one stream of records.
    ///
    /// The channel closes once both streams reach end of file. Must be called
    /// from within a Tokio runtime; a second call yields an already closed
    /// channel.
    pub fn output_lines(&mut self) -> Result<mpsc::Receiver<String>> {
        let (tx, rx) = mpsc::channel(256);
        if let Some(stdout) = self.stdout.take() {
            let stdout = tokio::process::ChildStdout::from_std(stdout)?;
            spawn_record_pump(stdout, tx.clone(), "stdout");
        }
        if let Some(stderr) = self.stderr.take() {
            let stderr = tokio::process::ChildStderr::from_std(stderr)?;
            spawn_record_pump(stderr, tx, "stderr");
        }
        Ok(rx)
    }

    /// Read stdout to end of file, keeping at most `limit` bytes.
    ///
    /// Stderr and any stdout past `limit` are read and dropped so the child
    /// never stalls on a full pipe.
    pub async fn read_stdout(&mut self, limit: usize) -> Result<Vec<u8>> {
        if let Some(stderr) = self.stderr.take() {
            let mut stderr = tokio::process::ChildStderr::from_std(stderr)?;
            tokio::spawn(async move {
                let _ = tokio::io::copy(&mut stderr, &mut tokio::io::sink()).await;
            });
        }
        let Some(stdout) = self.stdout.take() else {
            return Ok(Vec::new());
        };

        let mut stdout = tokio::process::ChildStdout::from_std(stdout)?;
        let mut buf = Vec::new();
        (&mut stdout).take(limit as u64).read_to_end(&mut buf).await?;
        let dropped = tokio::io::copy(&mut stdout, &mut tokio::io::sink()).await?;
        if dropped > 0 {
            debug!(process_id = self.id, limit, dropped, "Stdout exceeded the read limit");
        }
        Ok(buf)
    }

    /// Exit published so far, if any.
    pub fn try_exit(&self) -> Option<ProcessExit> {
        *self.exit_rx.borrow()
    }

    /// Wait until the supervisor publishes this process's exit.
    pub async fn wait(&self) -> ProcessExit {
        let mut rx = self.exit_rx.clone();
        match rx.wait_for(Option::is_some).await {
            Ok(exit) => (*exit).unwrap_or(ProcessExit::Lost),
            Err(_) => ProcessExit::Lost,
        }
    }
}
