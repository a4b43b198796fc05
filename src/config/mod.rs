//! Configuration module.
//!
//! Provides `AppConfig` (top-level settings), sub-configs for the worker,
//! pipeline and output, `AppPaths` for cross-platform directories,
//! `RunPaths` for per-media artifacts, and TOML persistence via
//! `AppConfig::load` / `AppConfig::save`.

pub mod paths;
pub mod settings;

pub use paths::{AppPaths, RunPaths};
pub use settings::{AppConfig, OutputConfig, PipelineConfig, WorkerConfig};
