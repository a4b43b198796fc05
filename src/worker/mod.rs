//! Worker process management.
//!
//! [`ProcessSupervisor`] owns the one live worker process and can kill its
//! whole tree; [`StageExecutor`] is the seam the pipeline runs stages through.

pub mod executor;
pub mod supervisor;
mod tree;

pub use executor::{ProcessWorker, StageExecutor};
pub use supervisor::{
    ActiveWorker, EventSender, HandleId, LaunchSpec, ProcessHandle, ProcessState,
    ProcessSupervisor, StreamKind, WorkerError, WorkerEvent, WorkerOutput, UTF8_ENV,
};

#[cfg(test)]
pub use executor::{Script, ScriptedExecutor};
