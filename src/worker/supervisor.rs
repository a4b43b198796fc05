//! Process supervisor: owns the single active worker process.
//!
//! # Lifecycle
//!
//! ```text
//! start() ──▶ ProcessHandle ──wait()──▶ WorkerOutput | WorkerError
//!    │              │
//!    │              ├─ stdout task: LineReassembler → classify → WorkerEvent
//!    │              └─ stderr task: LineReassembler → WorkerEvent::Log
//!    │
//!    └─ active slot ◀── terminate() / terminate_active()  (kills whole tree)
//! ```
//!
//! The active slot is a `Mutex<Option<_>>`.  `start` spawns while holding
//! the lock and refuses to run when the slot is occupied, so a live process
//! can never drop out of reach of `terminate`.
//!
//! No operation has a timeout: a stalled worker waits until it is terminated.

use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::protocol::{classify, LineKind, LineReassembler, PartialResultEvent, ProgressEvent};

use super::tree;

/// Environment forced on every worker so its text I/O is UTF-8 regardless of
/// the host locale.
pub const UTF8_ENV: [(&str, &str); 2] = [("PYTHONUTF8", "1"), ("PYTHONIOENCODING", "utf-8")];

/// Size of each read from the worker's pipes.
const READ_CHUNK: usize = 8192;

/// Lines of stderr quoted in a [`WorkerError::NonZeroExit`] message.
const STDERR_TAIL_LINES: usize = 20;

// ---------------------------------------------------------------------------
// WorkerError
// ---------------------------------------------------------------------------

/// Errors raised while running a worker process.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// The executable could not be launched.
    #[error("failed to launch worker `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    /// Another worker is still tracked as active.
    #[error("a worker is already running (pid {pid})")]
    Busy { pid: u32 },

    /// The worker exited unsuccessfully (`code` is `None` when it died from a
    /// signal).
    #[error("worker exited with {}{}", exit_label(.code), stderr_tail(.stderr))]
    NonZeroExit { code: Option<i32>, stderr: String },

    /// The worker was killed through [`ProcessSupervisor::terminate`].
    #[error("worker (pid {pid}) was terminated")]
    Terminated { pid: u32 },

    /// Signalling the process tree failed.
    #[error("failed to kill worker (pid {pid}): {source}")]
    Signal {
        pid: u32,
        #[source]
        source: io::Error,
    },

    /// Waiting on the child failed at the OS level.
    #[error("failed to wait for worker: {0}")]
    Wait(#[source] io::Error),
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("code {code}"),
        None => "a signal".to_string(),
    }
}

fn stderr_tail(stderr: &str) -> String {
    let lines: Vec<&str> = stderr.trim_end().lines().collect();
    if lines.is_empty() {
        return String::new();
    }
    let from = lines.len().saturating_sub(STDERR_TAIL_LINES);
    format!(": {}", lines[from..].join("\n"))
}

// ---------------------------------------------------------------------------
// Events and launch description
// ---------------------------------------------------------------------------

/// Which pipe a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// Something the worker said while running.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    Progress(ProgressEvent),
    Partial(PartialResultEvent),
    /// Unclassified text, forwarded for diagnostics.
    Log { stream: StreamKind, line: String },
}

/// Channel end on which a running worker publishes its events.
pub type EventSender = mpsc::UnboundedSender<WorkerEvent>;

/// Everything needed to spawn the worker once.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Extra environment on top of the inherited one.
    pub env: Vec<(String, String)>,
}

/// What a successful worker run leaves behind.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerOutput {
    pub exit_code: i32,
    /// Everything written to stdout, marker lines included.
    pub stdout: String,
    pub stderr: String,
}

/// Identity of one spawned process, unique per supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleId(u64);

/// Termination state of a [`ProcessHandle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    Exited(Option<i32>),
    Killed,
}

/// Snapshot of the tracked process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveWorker {
    pub id: HandleId,
    pub pid: u32,
}

#[derive(Debug)]
struct ActiveProcess {
    id: HandleId,
    pid: u32,
    kill_tx: oneshot::Sender<()>,
}

type Slot = Arc<Mutex<Option<ActiveProcess>>>;

fn lock(slot: &Slot) -> MutexGuard<'_, Option<ActiveProcess>> {
    // The slot holds plain data; a panic elsewhere cannot leave it torn.
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// ProcessSupervisor
// ---------------------------------------------------------------------------

/// Spawns workers one at a time and kills them on request.
#[derive(Debug, Default)]
pub struct ProcessSupervisor {
    slot: Slot,
    next_id: AtomicU64,
}

impl ProcessSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn the worker described by `spec`.
    ///
    /// Output readers start immediately; events go to `events` if given.
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// - [`WorkerError::Busy`]: a worker is already active.
    /// - [`WorkerError::Spawn`]: the executable could not be launched.
    pub fn start(
        &self,
        spec: &LaunchSpec,
        events: Option<EventSender>,
    ) -> Result<ProcessHandle, WorkerError> {
        let mut slot = lock(&self.slot);
        if let Some(active) = slot.as_ref() {
            log::warn!("worker: refusing to start, pid {} still active", active.pid);
            return Err(WorkerError::Busy { pid: active.pid });
        }

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .envs(UTF8_ENV)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        tree::prepare_command(&mut cmd);

        let mut child = cmd.spawn().map_err(|source| WorkerError::Spawn {
            program: spec.program.display().to_string(),
            source,
        })?;

        // Without a pid the tree could not be signalled; `kill_on_drop` reaps it.
        let Some(pid) = child.id() else {
            return Err(WorkerError::Spawn {
                program: spec.program.display().to_string(),
                source: io::Error::new(io::ErrorKind::Other, "worker exited before its pid was read"),
            });
        };
        let id = HandleId(self.next_id.fetch_add(1, Ordering::Relaxed));

        let stdout = child
            .stdout
            .take()
            .map(|out| tokio::spawn(pump(out, StreamKind::Stdout, events.clone())));
        let stderr = child
            .stderr
            .take()
            .map(|err| tokio::spawn(pump(err, StreamKind::Stderr, events)));

        let (kill_tx, kill_rx) = oneshot::channel();
        *slot = Some(ActiveProcess { id, pid, kill_tx });

        log::info!("worker: started pid {pid} ({})", spec.program.display());

        Ok(ProcessHandle {
            id,
            pid,
            child,
            stdout,
            stderr,
            kill_rx,
            state: ProcessState::Running,
            slot: Arc::clone(&self.slot),
        })
    }

    /// Kill the process tree of `id` if it is still the active worker.
    ///
    /// Idempotent: an unknown, exited or already terminated handle is a
    /// no-op success.
    pub fn terminate(&self, id: HandleId) -> Result<(), WorkerError> {
        let mut slot = lock(&self.slot);
        if slot.as_ref().is_some_and(|active| active.id == id) {
            if let Some(active) = slot.take() {
                return kill(active);
            }
        }
        Ok(())
    }

    /// Kill whatever worker is active.  Succeeds when nothing is running.
    pub fn terminate_active(&self) -> Result<(), WorkerError> {
        let mut slot = lock(&self.slot);
        match slot.take() {
            Some(active) => kill(active),
            None => {
                log::debug!("worker: terminate requested, nothing active");
                Ok(())
            }
        }
    }

    /// The tracked worker, if any.
    pub fn active(&self) -> Option<ActiveWorker> {
        lock(&self.slot).as_ref().map(|active| ActiveWorker {
            id: active.id,
            pid: active.pid,
        })
    }

    pub fn is_busy(&self) -> bool {
        self.active().is_some()
    }
}

/// Signal the whole tree, then wake the handle so it reaps the child.
fn kill(active: ActiveProcess) -> Result<(), WorkerError> {
    log::info!("worker: terminating pid {} and its descendants", active.pid);
    let result = tree::kill_tree(active.pid).map_err(|source| WorkerError::Signal {
        pid: active.pid,
        source,
    });
    // The handle may already have finished waiting.
    let _ = active.kill_tx.send(());
    result
}

// ---------------------------------------------------------------------------
// ProcessHandle
// ---------------------------------------------------------------------------

/// One spawned worker.  Consumed by [`wait`](Self::wait).
///
/// Dropping a handle without waiting kills the child and frees the slot.
#[derive(Debug)]
pub struct ProcessHandle {
    id: HandleId,
    pid: u32,
    child: Child,
    stdout: Option<JoinHandle<Vec<u8>>>,
    stderr: Option<JoinHandle<Vec<u8>>>,
    kill_rx: oneshot::Receiver<()>,
    state: ProcessState,
    slot: Slot,
}

impl ProcessHandle {
    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    /// Wait for the worker to exit and collect both streams in full.
    ///
    /// # Errors
    ///
    /// - [`WorkerError::Terminated`]: killed via the supervisor.
    /// - [`WorkerError::NonZeroExit`]: exited unsuccessfully.
    pub async fn wait(mut self) -> Result<WorkerOutput, WorkerError> {
        let mut killed = false;
        let status = tokio::select! {
            biased;
            Ok(()) = &mut self.kill_rx => {
                killed = true;
                if let Err(e) = self.child.start_kill() {
                    log::debug!("worker: direct kill of pid {} failed: {e}", self.pid);
                }
                self.child.wait().await
            }
            status = self.child.wait() => status,
        };
        // The signal can reap the child before the kill notice is seen.
        if !killed && self.kill_rx.try_recv().is_ok() {
            killed = true;
        }

        let stdout = join_stream(self.stdout.take()).await;
        let stderr = join_stream(self.stderr.take()).await;
        self.release();

        let status = status.map_err(WorkerError::Wait)?;

        if killed {
            self.state = ProcessState::Killed;
            log::info!("worker: pid {} terminated", self.pid);
            return Err(WorkerError::Terminated { pid: self.pid });
        }

        self.state = ProcessState::Exited(status.code());
        log::info!("worker: pid {} exited ({status})", self.pid);

        match status.code() {
            Some(0) => Ok(WorkerOutput {
                exit_code: 0,
                stdout,
                stderr,
            }),
            code => Err(WorkerError::NonZeroExit { code, stderr }),
        }
    }

    /// Clear the active slot if it still refers to this handle.
    fn release(&self) {
        let mut slot = lock(&self.slot);
        if slot.as_ref().is_some_and(|active| active.id == self.id) {
            *slot = None;
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        self.release();
    }
}

async fn join_stream(task: Option<JoinHandle<Vec<u8>>>) -> String {
    let bytes = match task {
        Some(task) => task.await.unwrap_or_else(|e| {
            log::warn!("worker: output reader failed: {e}");
            Vec::new()
        }),
        None => Vec::new(),
    };
    String::from_utf8_lossy(&bytes).into_owned()
}

// ---------------------------------------------------------------------------
// Stream pump
// ---------------------------------------------------------------------------

/// Read `reader` to the end, publishing one event per complete line and
/// returning every byte read.
pub(crate) async fn pump<R>(mut reader: R, stream: StreamKind, events: Option<EventSender>) -> Vec<u8>
where
    R: AsyncRead + Unpin,
{
    let mut raw = Vec::new();
    let mut lines = LineReassembler::new();
    let mut chunk = [0u8; READ_CHUNK];

    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                raw.extend_from_slice(&chunk[..n]);
                for line in lines.push(&chunk[..n]) {
                    dispatch(stream, line, events.as_ref());
                }
            }
            Err(e) => {
                log::warn!("worker: reading {stream:?} failed: {e}");
                break;
            }
        }
    }

    for line in lines.finish() {
        dispatch(stream, line, events.as_ref());
    }
    raw
}

fn dispatch(stream: StreamKind, line: String, events: Option<&EventSender>) {
    let event = match stream {
        StreamKind::Stdout => match classify(&line) {
            LineKind::Progress(progress) => WorkerEvent::Progress(progress),
            LineKind::Partial(partial) => WorkerEvent::Partial(partial),
            LineKind::Log => {
                log::debug!("[worker stdout] {line}");
                WorkerEvent::Log { stream, line }
            }
        },
        StreamKind::Stderr => {
            log::debug!("[worker stderr] {line}");
            WorkerEvent::Log { stream, line }
        }
    };

    if let Some(tx) = events {
        // A closed receiver means the stage is already over; drop late lines.
        let _ = tx.send(event);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
