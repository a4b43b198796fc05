//! Stage executor: the seam between the pipeline and a running worker.
//!
//! # Overview
//!
//! [`StageExecutor`] is what the orchestrator talks to.  It is object-safe and
//! `Send + Sync` so it can be held behind an `Arc<dyn StageExecutor>` and
//! shared with an abort handle.
//!
//! [`ProcessWorker`] is the production implementation: it turns a
//! [`StageInvocation`] into a worker command line and runs it through a
//! [`ProcessSupervisor`].
//!
//! [`ScriptedExecutor`] (available under `#[cfg(test)]`) replays canned worker
//! output through the real line reassembler and classifier, so pipeline tests
//! run without spawning anything.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;

use crate::config::WorkerConfig;
use crate::protocol::StageInvocation;

use super::supervisor::{EventSender, LaunchSpec, ProcessSupervisor, WorkerError, WorkerOutput};

// ---------------------------------------------------------------------------
// StageExecutor trait
// ---------------------------------------------------------------------------

/// Runs one stage invocation at a time.
#[async_trait]
pub trait StageExecutor: Send + Sync {
    /// Run `invocation` to completion, streaming events to `events` while it
    /// runs.
    ///
    /// `abort` is raised before [`cancel`](Self::cancel) is called.  A
    /// cancel that arrives before the worker is tracked finds nothing to
    /// kill, so implementations must check `abort` once the worker is
    /// running and stop it themselves.
    async fn execute(
        &self,
        invocation: &StageInvocation,
        events: EventSender,
        abort: &AtomicBool,
    ) -> Result<WorkerOutput, WorkerError>;

    /// Kill the running invocation, if any.  Idempotent.
    fn cancel(&self) -> Result<(), WorkerError>;
}

// ---------------------------------------------------------------------------
// ProcessWorker
// ---------------------------------------------------------------------------

/// Runs invocations as real worker processes.
#[derive(Debug)]
pub struct ProcessWorker {
    config: WorkerConfig,
    supervisor: ProcessSupervisor,
}

impl ProcessWorker {
    pub fn new(config: WorkerConfig) -> Self {
        Self {
            config,
            supervisor: ProcessSupervisor::new(),
        }
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    /// Command line for `invocation`:
    /// `program [script] [base args…] [--model_dir <dir>] <stage args…>`.
    pub fn launch_spec(&self, invocation: &StageInvocation) -> LaunchSpec {
        let mut args = Vec::new();
        if let Some(script) = &self.config.script {
            args.push(script.to_string_lossy().into_owned());
        }
        args.extend(self.config.base_args.iter().cloned());
        if let Some(dir) = &self.config.model_dir {
            args.push("--model_dir".to_string());
            args.push(dir.to_string_lossy().into_owned());
        }
        args.extend(invocation.arguments().iter().cloned());

        LaunchSpec {
            program: self.config.program.clone(),
            args,
            env: self
                .config
                .env
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }
}

#[async_trait]
impl StageExecutor for ProcessWorker {
    async fn execute(
        &self,
        invocation: &StageInvocation,
        events: EventSender,
        abort: &AtomicBool,
    ) -> Result<WorkerOutput, WorkerError> {
        let spec = self.launch_spec(invocation);
        log::debug!(
            "worker: {} → {} {}",
            invocation.action(),
            spec.program.display(),
            spec.args.join(" ")
        );
        let handle = self.supervisor.start(&spec, Some(events))?;
        if abort.load(Ordering::SeqCst) {
            log::info!("worker: abort raised during spawn, stopping pid {}", handle.pid());
            self.supervisor.terminate(handle.id())?;
        }
        handle.wait().await
    }

    fn cancel(&self) -> Result<(), WorkerError> {
        self.supervisor.terminate_active()
    }
}

// ---------------------------------------------------------------------------
// ScriptedExecutor  (test-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
pub use scripted::{Script, ScriptedExecutor};


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
