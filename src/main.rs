//! Command-line entry point.
//!
//! ```text
//! video-dub <media> [--lang <language>] [--config <settings.toml>]
//! ```
//!
//! # Startup sequence
//!
//! 1. Initialise logging.
//! 2. Load [`AppConfig`] (defaults when the file does not exist).
//! 3. Create the tokio runtime (multi-thread, 2 workers).
//! 4. Build a [`ProcessWorker`] and a [`PipelineOrchestrator`] around it.
//! 5. Spawn the event reporter and the Ctrl-C watcher.
//! 6. Run the pipeline; exit 0 on `Done`, 1 on `Failed`, 130 on `Aborted`.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use video_dub::{
    config::{AppConfig, AppPaths},
    pipeline::{PipelineEvent, PipelineOrchestrator, RunOutcome, RunRequest},
    worker::ProcessWorker,
};

// ---------------------------------------------------------------------------
// Arguments
// ---------------------------------------------------------------------------

#[derive(Debug, Parser)]
#[command(name = "video-dub")]
#[command(about = "Dub a video through the external media worker")]
struct Cli {
    /// Video to recognize, translate and dub.
    media: PathBuf,

    /// Target language; defaults to `pipeline.target_lang` from the settings.
    #[arg(long)]
    lang: Option<String>,

    /// Settings file to use instead of the platform default.
    #[arg(long)]
    config: Option<PathBuf>,
}

fn exit_code(outcome: &RunOutcome) -> i32 {
    match outcome {
        RunOutcome::Done => 0,
        RunOutcome::Failed { .. } => 1,
        RunOutcome::Aborted { .. } => 130,
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

fn main() {
    // 1. Logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let code = match try_main() {
        Ok(code) => code,
        Err(e) => {
            log::error!("{e:#}");
            2
        }
    };
    std::process::exit(code);
}

fn try_main() -> Result<i32> {
    let args = Cli::parse();

    // 2. Configuration
    let config = match &args.config {
        Some(path) => AppConfig::load_from(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => AppConfig::load().unwrap_or_else(|e| {
            log::warn!("Failed to load config ({e}); using defaults");
            AppConfig::default()
        }),
    };

    let lang = args
        .lang
        .unwrap_or_else(|| config.pipeline.target_lang.clone());
    let output_dir = config.output.resolve(&AppPaths::new());
    let request = RunRequest::new(args.media, lang, &output_dir);

    // 3. Tokio runtime
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .context("failed to create tokio runtime")?;

    let outcome = rt.block_on(run(config, request));
    Ok(exit_code(&outcome))
}

async fn run(config: AppConfig, request: RunRequest) -> RunOutcome {
    // 4. Worker + orchestrator
    let worker = Arc::new(ProcessWorker::new(config.worker));
    let mut orchestrator = PipelineOrchestrator::new(worker);

    // 5. Reporter and Ctrl-C
    let mut events = orchestrator.subscribe();
    let reporter = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => report(&event),
                Err(RecvError::Lagged(n)) => log::warn!("reporter fell behind, {n} events skipped"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let abort = orchestrator.abort_handle();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("Interrupted, stopping the worker");
            abort.abort();
        }
    });

    // 6. Run
    let outcome = orchestrator.run(&request).await;
    interrupt.abort();

    match &outcome {
        RunOutcome::Done => {
            if let Some(path) = &orchestrator.session().output_path {
                println!("{}", path.display());
            }
        }
        RunOutcome::Aborted { during } => log::warn!("Aborted during {during}"),
        RunOutcome::Failed { stage, message } => log::error!("{stage} failed: {message}"),
    }

    // Dropping the orchestrator closes the event channel.
    drop(orchestrator);
    let _ = reporter.await;
    outcome
}

fn report(event: &PipelineEvent) {
    match event {
        PipelineEvent::Progress { percent } => log::info!("progress {percent}%"),
        PipelineEvent::SegmentUpdated { index } => log::debug!("segment {index} updated"),
        PipelineEvent::Partial(partial) => log::debug!("partial result for segment {}", partial.index),
        // Already logged where they happen.
        PipelineEvent::StateChanged(_) | PipelineEvent::Log { .. } => {}
    }
}
