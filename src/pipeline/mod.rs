//! Pipeline orchestrator module.
//!
//! Sequences the worker stages that turn a source video into a dubbed one
//! and exposes the session data and events a front end needs.
//!
//! # Architecture
//!
//! ```text
//! RunRequest
//!      │
//!      ▼
//! PipelineOrchestrator::run()  ── StageInvocation ──▶ StageExecutor (worker)
//!      │        ▲                                          │
//!      │        └──────── WorkerEvent (mpsc) ──────────────┘
//!      │
//!      ├─ SessionState (owned, &mut self)
//!      └─ PipelineEvent (broadcast) ──▶ subscribers (CLI, tests, UI)
//!
//! AbortHandle ── flag + StageExecutor::cancel() ──▶ kills the running worker
//! ```
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use video_dub::config::{AppConfig, AppPaths};
//! use video_dub::pipeline::{PipelineOrchestrator, RunRequest};
//! use video_dub::worker::ProcessWorker;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = AppConfig::default();
//!     let output_dir = config.output.resolve(&AppPaths::new());
//!     let worker = Arc::new(ProcessWorker::new(config.worker.clone()));
//!
//!     let mut orchestrator = PipelineOrchestrator::new(worker);
//!     let abort = orchestrator.abort_handle();
//!     tokio::spawn(async move {
//!         let _ = tokio::signal::ctrl_c().await;
//!         abort.abort();
//!     });
//!
//!     let request = RunRequest::new("talk.mp4", "French", &output_dir);
//!     println!("{:?}", orchestrator.run(&request).await);
//! }
//! ```

pub mod artifacts;
pub mod runner;
pub mod state;

// ---------------------------------------------------------------------------
// Public re-exports
// ---------------------------------------------------------------------------

pub use artifacts::{srt_timestamp, to_srt};
pub use runner::{AbortHandle, PipelineError, PipelineOrchestrator, RunRequest};
pub use state::{PipelineEvent, PipelineState, RunOutcome, SessionState};
