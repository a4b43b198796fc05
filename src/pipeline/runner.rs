//! Pipeline orchestrator: drives recognize → translate → synthesize → merge.
//!
//! [`PipelineOrchestrator`] owns the [`SessionState`] and runs every stage
//! through a [`StageExecutor`].  Progress is published on a
//! `tokio::sync::broadcast` channel; cancellation goes through an
//! [`AbortHandle`].
//!
//! # Pipeline flow
//!
//! ```text
//! run(request)
//!   ├─▶ recognize    → sort by start, write <stem>.srt           [Recognizing]
//!   ├─▶ translate    → placeholders, then whole-list replace     [Translating]
//!   ├─▶ synthesize   → batch_tasks.json, per-index Ready/Error   [Synthesizing]
//!   └─▶ merge        → audio_segments.json, output path          [Merging]
//!                                                                 ──▶ Done
//! any error ──▶ Failed        abort ──▶ Aborted
//! ```
//!
//! # Stage execution
//!
//! While a stage runs, the orchestrator `select!`s between the worker's event
//! channel and the stage future on its own task, so partial results are
//! applied to the session without any locking.  Events still queued when the
//! stage returns are drained before its result is interpreted, and the
//! channel is dropped afterwards: nothing from a finished stage can reach the
//! next one.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

use crate::config::RunPaths;
use crate::protocol::{
    sort_by_start, AudioStatus, BatchItem, PartialResultEvent, PartialUpdate, ProtocolError,
    Segment, StageAction, StageInvocation, StageOutput, StageReply, Translation,
};
use crate::worker::{StageExecutor, WorkerError, WorkerEvent};

use super::artifacts::{merge_manifest, to_srt, write_json, write_text};
use super::state::{PipelineEvent, PipelineState, RunOutcome, SessionState};

/// Events a subscriber may fall behind by before it starts missing some.
const EVENT_CAPACITY: usize = 1024;

// ---------------------------------------------------------------------------
// PipelineError
// ---------------------------------------------------------------------------

/// Errors that can surface inside the pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The worker could not be run, crashed, or was killed.
    #[error(transparent)]
    Worker(#[from] WorkerError),

    /// The worker exited cleanly but its result was unusable.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The worker reported `success: false`.
    #[error("{action} failed: {message}")]
    StageFailure { action: StageAction, message: String },

    /// There is nothing to translate or synthesize.
    #[error("no segments to process")]
    NoSegments,

    /// Synthesis left no segment with usable audio.
    #[error("no segment has audio ready to merge")]
    NothingToMerge,

    #[error("segment {index} is out of range ({len} segments)")]
    SegmentOutOfRange { index: usize, len: usize },

    /// An artifact file could not be written.
    #[error("failed to write {}: {source}", path.display())]
    Artifact {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The operation was cancelled through an [`AbortHandle`].
    #[error("aborted")]
    Aborted,

    /// Internal / unexpected error.
    #[error("internal error: {0}")]
    Internal(String),
}

fn unexpected(action: StageAction, output: &StageOutput) -> PipelineError {
    PipelineError::Internal(format!("{action} produced an unexpected result: {output:?}"))
}

// ---------------------------------------------------------------------------
// RunRequest
// ---------------------------------------------------------------------------

/// Inputs of one run over one media file.
#[derive(Debug, Clone, PartialEq)]
pub struct RunRequest {
    pub media: PathBuf,
    pub target_lang: String,
    pub paths: RunPaths,
}

impl RunRequest {
    /// Request with the standard artifact layout under `output_dir`.
    pub fn new(media: impl Into<PathBuf>, target_lang: impl Into<String>, output_dir: &Path) -> Self {
        let media = media.into();
        let target_lang = target_lang.into();
        let paths = RunPaths::for_media(output_dir, &media, &target_lang);
        Self {
            media,
            target_lang,
            paths,
        }
    }
}

// ---------------------------------------------------------------------------
// AbortHandle
// ---------------------------------------------------------------------------

/// Cancels the orchestrator's current operation from any task or thread.
#[derive(Clone)]
pub struct AbortHandle {
    flag: Arc<AtomicBool>,
    executor: Arc<dyn StageExecutor>,
}

impl AbortHandle {
    /// Raise the abort flag and kill the running worker.  Safe to call
    /// repeatedly or when nothing is running.
    pub fn abort(&self) {
        self.flag.store(true, Ordering::SeqCst);
        log::info!("pipeline: abort requested");
        if let Err(e) = self.executor.cancel() {
            log::warn!("pipeline: failed to stop worker: {e}");
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// PipelineOrchestrator
// ---------------------------------------------------------------------------

/// Which partial results the running stage may apply to `translated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LiveUpdates {
    None,
    Text,
    Audio,
}

/// Drives the dubbing pipeline.
///
/// Operations take `&mut self`, so at most one runs at a time.
///
/// ```rust,no_run
/// use std::path::Path;
/// use std::sync::Arc;
/// use video_dub::config::WorkerConfig;
/// use video_dub::pipeline::{PipelineOrchestrator, RunRequest};
/// use video_dub::worker::ProcessWorker;
///
/// # async fn example() {
/// let worker = Arc::new(ProcessWorker::new(WorkerConfig::default()));
/// let mut orchestrator = PipelineOrchestrator::new(worker);
/// let mut events = orchestrator.subscribe();
/// let abort = orchestrator.abort_handle();
///
/// let request = RunRequest::new("talk.mp4", "French", Path::new("/tmp/out"));
/// let outcome = orchestrator.run(&request).await;
/// # let _ = (events.try_recv(), abort, outcome);
/// # }
/// ```
pub struct PipelineOrchestrator {
    executor: Arc<dyn StageExecutor>,
    session: SessionState,
    state: PipelineState,
    abort: Arc<AtomicBool>,
    events: broadcast::Sender<PipelineEvent>,
}

impl PipelineOrchestrator {
    pub fn new(executor: Arc<dyn StageExecutor>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            executor,
            session: SessionState::default(),
            state: PipelineState::Idle,
            abort: Arc::new(AtomicBool::new(false)),
            events,
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn session(&self) -> &SessionState {
        &self.session
    }

    /// Receive every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle {
            flag: Arc::clone(&self.abort),
            executor: Arc::clone(&self.executor),
        }
    }

    /// Replace the session with `segments` as the original (source-language)
    /// list, e.g. after the user edited recognized subtitles.
    pub fn load_segments(&mut self, mut segments: Vec<Segment>) {
        sort_by_start(&mut segments);
        self.session.reset();
        self.session.original = segments;
    }

    // -----------------------------------------------------------------------
    // Entry points
    // -----------------------------------------------------------------------

    /// Run every stage over `request.media`.  Starts from a fresh session.
    pub async fn run(&mut self, request: &RunRequest) -> RunOutcome {
        log::info!(
            "pipeline: run {} → {}",
            request.media.display(),
            request.target_lang
        );
        self.begin_operation();
        self.session.reset();

        let result = self.run_all(request).await;
        self.finish(result)
    }

    /// Translate the current original segments and synthesize their audio,
    /// without recognition or merge.
    pub async fn translate_and_synthesize(&mut self, request: &RunRequest) -> RunOutcome {
        self.begin_operation();
        let result = async {
            self.translate(&request.target_lang).await?;
            self.synthesize(request).await
        }
        .await;
        self.finish(result)
    }

    /// Translate `original[index]` again and patch `translated[index]` with the
    /// result.  Does not change [`PipelineState`].
    pub async fn retranslate_segment(&mut self, index: usize, lang: &str) -> Result<String, PipelineError> {
        self.begin_operation();
        self.check_index(index)?;
        let source = self.session.original[index].text.clone();

        let invocation = StageInvocation::translate_text(&source, lang);
        let output = self.run_stage(&invocation, LiveUpdates::None).await?;
        let StageOutput::Translated(translation) = &output else {
            return Err(unexpected(invocation.action(), &output));
        };

        let text = translation
            .first_text()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| ProtocolError::Invalid {
                action: StageAction::Translate,
                reason: "translation is empty".into(),
            })?
            .to_string();

        log::info!("pipeline: segment {index} retranslated");
        self.session.translated[index].text = text.clone();
        self.publish(PipelineEvent::SegmentUpdated { index });
        Ok(text)
    }

    /// Synthesize audio for `translated[index]` alone.  The segment is marked
    /// `Generating`, then `Ready` or `Error`.  Does not change
    /// [`PipelineState`].
    pub async fn regenerate_segment_audio(
        &mut self,
        index: usize,
        request: &RunRequest,
    ) -> Result<String, PipelineError> {
        self.begin_operation();
        self.check_index(index)?;

        let output_path = request.paths.segment_audio(index);
        std::fs::create_dir_all(&request.paths.segment_dir).map_err(|source| PipelineError::Artifact {
            path: request.paths.segment_dir.clone(),
            source,
        })?;

        let segment = &self.session.translated[index];
        let invocation = StageInvocation::synthesize_one(
            &request.media,
            &output_path,
            &segment.text,
            segment.start,
            &request.target_lang,
        );
        self.set_audio(index, AudioStatus::Generating, None);

        let result = match self.run_stage(&invocation, LiveUpdates::None).await {
            Ok(StageOutput::SynthesizedOne { audio_path }) => Ok(audio_path),
            Ok(other) => Err(unexpected(invocation.action(), &other)),
            Err(e) => Err(e),
        };

        match result {
            Ok(audio_path) => {
                log::info!("pipeline: segment {index} audio regenerated");
                self.set_audio(index, AudioStatus::Ready, Some(audio_path.clone()));
                Ok(audio_path)
            }
            Err(e) => {
                log::error!("pipeline: segment {index} audio failed: {e}");
                self.set_audio(index, AudioStatus::Error, None);
                Err(e)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Stages
    // -----------------------------------------------------------------------

    async fn run_all(&mut self, request: &RunRequest) -> Result<(), PipelineError> {
        self.recognize(request).await?;
        self.translate(&request.target_lang).await?;
        self.synthesize(request).await?;
        self.merge(request).await
    }

    async fn recognize(&mut self, request: &RunRequest) -> Result<(), PipelineError> {
        self.enter(PipelineState::Recognizing)?;

        let invocation = StageInvocation::recognize(&request.media);
        let output = self.run_stage(&invocation, LiveUpdates::None).await?;
        let StageOutput::Recognized(mut segments) = output else {
            return Err(unexpected(invocation.action(), &output));
        };

        // The worker does not promise chronological order.
        sort_by_start(&mut segments);
        log::info!("pipeline: recognized {} segments", segments.len());

        write_text(&request.paths.subtitle, &to_srt(&segments))?;
        self.session.subtitle_path = Some(request.paths.subtitle.clone());
        self.session.original = segments;
        Ok(())
    }

    async fn translate(&mut self, lang: &str) -> Result<(), PipelineError> {
        self.enter(PipelineState::Translating)?;
        if self.session.original.is_empty() {
            return Err(PipelineError::NoSegments);
        }

        self.session.translated = self
            .session
            .original
            .iter()
            .map(|s| Segment::new(s.start, s.end, ""))
            .collect();

        let invocation = StageInvocation::translate_segments(&self.session.original, lang)
            .map_err(|e| PipelineError::Internal(format!("encoding segments: {e}")))?;
        let output = self.run_stage(&invocation, LiveUpdates::Text).await?;
        let segments = match output {
            StageOutput::Translated(Translation::Segments(segments)) => segments,
            StageOutput::Translated(Translation::Text(_)) => {
                return Err(ProtocolError::Invalid {
                    action: StageAction::Translate,
                    reason: "expected a segment list, got plain text".into(),
                }
                .into())
            }
            other => return Err(unexpected(invocation.action(), &other)),
        };

        if segments.len() != self.session.original.len() {
            log::warn!(
                "pipeline: translation returned {} segments for {} inputs",
                segments.len(),
                self.session.original.len()
            );
        }
        log::info!("pipeline: translated {} segments into {lang}", segments.len());
        self.session.translated = segments;
        Ok(())
    }

    async fn synthesize(&mut self, request: &RunRequest) -> Result<(), PipelineError> {
        self.enter(PipelineState::Synthesizing)?;
        if self.session.translated.is_empty() {
            return Err(PipelineError::NoSegments);
        }

        for (i, segment) in self.session.translated.iter_mut().enumerate() {
            if segment.audio_path.is_none() {
                segment.audio_path = Some(request.paths.segment_audio(i).to_string_lossy().into_owned());
            }
            segment.audio_status = AudioStatus::Generating;
        }
        write_json(&request.paths.batch_tasks, &self.session.translated)?;

        let invocation = StageInvocation::synthesize_batch(&request.media, &request.paths.batch_tasks);
        let output = self.run_stage(&invocation, LiveUpdates::Audio).await?;
        let StageOutput::SynthesizedBatch(items) = output else {
            return Err(unexpected(invocation.action(), &output));
        };

        self.apply_batch(items);
        log::info!(
            "pipeline: {}/{} segments have audio",
            self.session.ready_count(),
            self.session.translated.len()
        );
        Ok(())
    }

    async fn merge(&mut self, request: &RunRequest) -> Result<(), PipelineError> {
        self.enter(PipelineState::Merging)?;

        let manifest = merge_manifest(&self.session.translated);
        if manifest.is_empty() {
            return Err(PipelineError::NothingToMerge);
        }
        write_json(&request.paths.manifest, &manifest)?;

        let invocation = StageInvocation::merge(&request.media, &request.paths.manifest, &request.paths.merged);
        let output = self.run_stage(&invocation, LiveUpdates::None).await?;
        let StageOutput::Merged { output_path } = output else {
            return Err(unexpected(invocation.action(), &output));
        };

        log::info!("pipeline: merged into {output_path}");
        self.session.output_path = Some(PathBuf::from(output_path));
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Stage execution
    // -----------------------------------------------------------------------

    /// Run one invocation, applying its events as they arrive.
    async fn run_stage(
        &mut self,
        invocation: &StageInvocation,
        live: LiveUpdates,
    ) -> Result<StageOutput, PipelineError> {
        self.check_abort()?;
        let action = invocation.action();
        log::debug!("pipeline: invoking {action}");

        let (tx, mut rx) = mpsc::unbounded_channel();
        let executor = Arc::clone(&self.executor);
        let abort = Arc::clone(&self.abort);
        let stage = executor.execute(invocation, tx, &abort);
        tokio::pin!(stage);

        let result = loop {
            tokio::select! {
                biased;
                Some(event) = rx.recv() => self.on_worker_event(event, live),
                result = &mut stage => break result,
            }
        };
        while let Ok(event) = rx.try_recv() {
            self.on_worker_event(event, live);
        }
        drop(rx);

        if self.abort.load(Ordering::SeqCst) {
            log::info!("pipeline: discarding {action} result after abort");
            return Err(PipelineError::Aborted);
        }

        let output = result?;
        match invocation.interpret(&output.stdout, &output.stderr)? {
            StageReply::Success(output) => Ok(output),
            StageReply::Failure { message } => Err(PipelineError::StageFailure { action, message }),
        }
    }

    fn on_worker_event(&mut self, event: WorkerEvent, live: LiveUpdates) {
        match event {
            WorkerEvent::Progress(progress) => self.publish(PipelineEvent::Progress {
                percent: progress.percent,
            }),
            WorkerEvent::Partial(partial) => self.on_partial(partial, live),
            WorkerEvent::Log { stream, line } => self.publish(PipelineEvent::Log { stream, line }),
        }
    }

    fn on_partial(&mut self, partial: PartialResultEvent, live: LiveUpdates) {
        let index = partial.index;
        if index >= self.session.translated.len() {
            log::debug!("pipeline: dropping partial result for unknown segment {index}");
            return;
        }

        let applied = match (&partial.update, live) {
            (PartialUpdate::Text { text }, LiveUpdates::Text) => {
                self.session.translated[index].text = text.clone();
                true
            }
            (PartialUpdate::Audio { audio_path, success, error }, LiveUpdates::Audio) => {
                let segment = &mut self.session.translated[index];
                if *success {
                    if let Some(path) = audio_path {
                        segment.audio_path = Some(path.clone());
                    }
                    segment.audio_status = AudioStatus::Ready;
                } else {
                    log::warn!(
                        "pipeline: segment {index} synthesis failed: {}",
                        error.as_deref().unwrap_or("unknown error")
                    );
                    segment.audio_status = AudioStatus::Error;
                }
                true
            }
            _ => false,
        };

        self.publish(PipelineEvent::Partial(partial));
        if applied {
            self.publish(PipelineEvent::SegmentUpdated { index });
        }
    }

    /// Fold batch results into `translated`.  Indices without a result are
    /// marked `Error`.
    fn apply_batch(&mut self, items: Vec<BatchItem>) {
        let len = self.session.translated.len();
        let mut reported = vec![false; len];

        for item in items {
            let Some(segment) = self.session.translated.get_mut(item.index) else {
                log::warn!("pipeline: batch result for unknown segment {}", item.index);
                continue;
            };
            reported[item.index] = true;
            if item.success {
                if item.audio_path.is_some() {
                    segment.audio_path = item.audio_path;
                }
                segment.audio_status = AudioStatus::Ready;
            } else {
                log::warn!(
                    "pipeline: segment {} synthesis failed: {}",
                    item.index,
                    item.error.as_deref().unwrap_or("unknown error")
                );
                segment.audio_status = AudioStatus::Error;
            }
        }

        for (index, seen) in reported.into_iter().enumerate() {
            if !seen {
                log::warn!("pipeline: no synthesis result for segment {index}");
                self.session.translated[index].audio_status = AudioStatus::Error;
            }
            self.publish(PipelineEvent::SegmentUpdated { index });
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn begin_operation(&self) {
        self.abort.store(false, Ordering::SeqCst);
    }

    fn check_abort(&self) -> Result<(), PipelineError> {
        if self.abort.load(Ordering::SeqCst) {
            return Err(PipelineError::Aborted);
        }
        Ok(())
    }

    /// Abort check, then transition.
    fn enter(&mut self, state: PipelineState) -> Result<(), PipelineError> {
        self.check_abort()?;
        self.set_state(state);
        Ok(())
    }

    fn check_index(&self, index: usize) -> Result<(), PipelineError> {
        let len = self.session.translated.len().min(self.session.original.len());
        if index >= len {
            return Err(PipelineError::SegmentOutOfRange { index, len });
        }
        Ok(())
    }

    fn set_audio(&mut self, index: usize, status: AudioStatus, path: Option<String>) {
        let segment = &mut self.session.translated[index];
        segment.audio_status = status;
        if path.is_some() {
            segment.audio_path = path;
        }
        self.publish(PipelineEvent::SegmentUpdated { index });
    }

    fn set_state(&mut self, state: PipelineState) {
        log::info!("pipeline: {} → {}", self.state, state);
        self.state = state;
        self.publish(PipelineEvent::StateChanged(state));
    }

    fn finish(&mut self, result: Result<(), PipelineError>) -> RunOutcome {
        let stage = self.state;
        match result {
            Ok(()) => {
                self.set_state(PipelineState::Done);
                RunOutcome::Done
            }
            Err(PipelineError::Aborted) => {
                self.set_state(PipelineState::Aborted);
                RunOutcome::Aborted { during: stage }
            }
            Err(e) => {
                log::error!("pipeline: {stage} failed: {e}");
                self.set_state(PipelineState::Failed);
                RunOutcome::Failed {
                    stage,
                    message: e.to_string(),
                }
            }
        }
    }

    fn publish(&self, event: PipelineEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::OnceLock;
    use std::time::Duration;

    use super::*;
    use crate::worker::{Script, ScriptedExecutor};
    use tempfile::{tempdir, TempDir};

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    const RECOGNIZED: &str = r#"[
        {"start": 4.0, "end": 5.5, "text": "second"},
        {"start": 0.5, "end": 2.0, "text": "first"}
    ]"#;

    const TRANSLATED: &str = r#"{"success": true, "segments": [
        {"start": 0.5, "end": 2.0, "text": "premier"},
        {"start": 4.0, "end": 5.5, "text": "second"}
    ]}"#;

    fn request(dir: &TempDir) -> RunRequest {
        RunRequest::new("/media/talk.mp4", "French", dir.path())
    }

    fn batch_ok(request: &RunRequest, count: usize) -> String {
        let results: Vec<String> = (0..count)
            .map(|i| {
                format!(
                    r#"{{"index": {i}, "success": true, "audio_path": "{}"}}"#,
                    request.paths.segment_audio(i).display()
                )
            })
            .collect();
        format!(r#"{{"success": true, "results": [{}]}}"#, results.join(","))
    }

    fn merged(request: &RunRequest) -> String {
        format!(r#"{{"success": true, "output": "{}"}}"#, request.paths.merged.display())
    }

    fn orchestrator(executor: ScriptedExecutor) -> (PipelineOrchestrator, Arc<ScriptedExecutor>) {
        let executor = Arc::new(executor);
        let orc = PipelineOrchestrator::new(Arc::clone(&executor) as Arc<dyn StageExecutor>);
        (orc, executor)
    }

    fn drain(rx: &mut broadcast::Receiver<PipelineEvent>) -> Vec<PipelineEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    fn states(events: &[PipelineEvent]) -> Vec<PipelineState> {
        events
            .iter()
            .filter_map(|e| match e {
                PipelineEvent::StateChanged(s) => Some(*s),
                _ => None,
            })
            .collect()
    }

    // -----------------------------------------------------------------------
    // Full run
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn full_run_reaches_done_and_writes_artifacts() {
        let dir = tempdir().expect("temp dir");
        let req = request(&dir);
        let (mut orc, executor) = orchestrator(
            ScriptedExecutor::new()
                .on(StageAction::Recognize, Script::reply("[PROGRESS] 40\nloading model", RECOGNIZED))
                .on(StageAction::Translate, Script::reply("", TRANSLATED))
                .on(StageAction::SynthesizeBatch, Script::reply("[PROGRESS] 100", &batch_ok(&req, 2)))
                .on(StageAction::Merge, Script::reply("", &merged(&req))),
        );
        let mut rx = orc.subscribe();

        let outcome = orc.run(&req).await;

        assert_eq!(outcome, RunOutcome::Done);
        assert_eq!(orc.state(), PipelineState::Done);
        assert_eq!(
            executor.actions(),
            vec![
                StageAction::Recognize,
                StageAction::Translate,
                StageAction::SynthesizeBatch,
                StageAction::Merge
            ]
        );

        // Recognition output is sorted and persisted as SRT.
        let session = orc.session();
        assert_eq!(session.original[0].text, "first");
        assert_eq!(session.original[1].text, "second");
        let srt = std::fs::read_to_string(&req.paths.subtitle).expect("srt");
        assert!(srt.starts_with("1\n00:00:00,500 --> 00:00:02,000\nfirst\n"));
        assert_eq!(session.subtitle_path.as_ref(), Some(&req.paths.subtitle));

        // Batch tasks carry predetermined paths.
        let tasks: Vec<Segment> =
            serde_json::from_str(&std::fs::read_to_string(&req.paths.batch_tasks).unwrap()).unwrap();
        assert_eq!(
            tasks[1].audio_path.as_deref(),
            Some(req.paths.segment_audio(1).to_string_lossy().as_ref())
        );
        assert!(tasks.iter().all(|t| t.audio_status == AudioStatus::Generating));

        // Every segment is ready and listed in the manifest.
        assert_eq!(session.ready_count(), 2);
        let manifest: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&req.paths.manifest).unwrap()).unwrap();
        assert_eq!(manifest.as_array().map(Vec::len), Some(2));
        assert_eq!(session.output_path.as_ref(), Some(&req.paths.merged));

        let events = drain(&mut rx);
        assert_eq!(
            states(&events),
            vec![
                PipelineState::Recognizing,
                PipelineState::Translating,
                PipelineState::Synthesizing,
                PipelineState::Merging,
                PipelineState::Done
            ]
        );
        assert!(events.contains(&PipelineEvent::Progress { percent: 40 }));
        assert!(events
            .iter()
            .any(|e| matches!(e, PipelineEvent::Log { line, .. } if line == "loading model")));
    }

    #[tokio::test]
    async fn translate_arguments_carry_sorted_source_segments() {
        let dir = tempdir().expect("temp dir");
        let req = request(&dir);
        let (mut orc, executor) = orchestrator(
            ScriptedExecutor::new()
                .on(StageAction::Recognize, Script::reply("", RECOGNIZED))
                .on(StageAction::Translate, Script::exit(1, "stop here")),
        );

        orc.run(&req).await;

        let calls = executor.calls();
        let args = calls[1].arguments();
        assert_eq!(args[1], "translate_text");
        let sent: Vec<serde_json::Value> = serde_json::from_str(&args[3]).unwrap();
        assert_eq!(sent[0]["text"], "first");
        assert_eq!(args[5], "French");
    }

    // -----------------------------------------------------------------------
    // Partial results
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn batch_partial_failure_still_merges_ready_segments() {
        let dir = tempdir().expect("temp dir");
        let req = request(&dir);
        let segments: Vec<Segment> = (0..5)
            .map(|i| Segment::new(i as f64, i as f64 + 0.5, format!("s{i}")))
            .collect();
        let translated = serde_json::json!({"success": true, "segments": segments}).to_string();
        let batch = format!(
            r#"{{"success": true, "results": [
                {{"index": 0, "success": true, "audio_path": "{a0}"}},
                {{"index": 1, "success": false, "error": "voice clone failed"}},
                {{"index": 2, "success": false}},
                {{"index": 3, "success": true, "audio_path": "{a3}"}},
                {{"index": 4, "success": false, "error": "empty text"}}
            ]}}"#,
            a0 = req.paths.segment_audio(0).display(),
            a3 = req.paths.segment_audio(3).display(),
        );
        let (mut orc, executor) = orchestrator(
            ScriptedExecutor::new()
                .on(StageAction::Translate, Script::reply("", &translated))
                .on(StageAction::SynthesizeBatch, Script::reply("", &batch))
                .on(StageAction::Merge, Script::reply("", &merged(&req))),
        );
        orc.load_segments(segments);

        assert_eq!(orc.translate_and_synthesize(&req).await, RunOutcome::Done);

        let statuses: Vec<AudioStatus> = orc.session().translated.iter().map(|s| s.audio_status).collect();
        assert_eq!(
            statuses,
            vec![
                AudioStatus::Ready,
                AudioStatus::Error,
                AudioStatus::Error,
                AudioStatus::Ready,
                AudioStatus::Error
            ]
        );

        // Merge proceeds with only the ready pair.
        orc.merge(&req).await.expect("merge");
        let manifest: Vec<serde_json::Value> =
            serde_json::from_str(&std::fs::read_to_string(&req.paths.manifest).unwrap()).unwrap();
        assert_eq!(manifest.len(), 2);
        assert_eq!(manifest[0]["start"], 0.0);
        assert_eq!(manifest[1]["start"], 3.0);
        assert_eq!(executor.actions().last(), Some(&StageAction::Merge));
    }

    #[tokio::test]
    async fn segments_missing_from_batch_results_become_errors() {
        let dir = tempdir().expect("temp dir");
        let req = request(&dir);
        let batch = format!(
            r#"{{"success": true, "results": [{{"index": 1, "success": true, "audio_path": "{}"}}, {{"index": 7, "success": true}}]}}"#,
            req.paths.segment_audio(1).display()
        );
        let (mut orc, _) = orchestrator(
            ScriptedExecutor::new()
                .on(StageAction::Translate, Script::reply("", TRANSLATED))
                .on(StageAction::SynthesizeBatch, Script::reply("", &batch)),
        );
        orc.load_segments(vec![Segment::new(0.5, 2.0, "first"), Segment::new(4.0, 5.5, "second")]);

        assert_eq!(orc.translate_and_synthesize(&req).await, RunOutcome::Done);
        let translated = &orc.session().translated;
        assert_eq!(translated[0].audio_status, AudioStatus::Error);
        assert_eq!(translated[1].audio_status, AudioStatus::Ready);
    }

    #[tokio::test]
    async fn live_partials_update_translated_segments() {
        let dir = tempdir().expect("temp dir");
        let req = request(&dir);
        let lines = concat!(
            "[PARTIAL] {\"index\": 0, \"text\": \"premier\"}\n",
            "[PARTIAL] {\"index\": 9, \"text\": \"nowhere\"}\n",
            "[PARTIAL] {broken\n",
        );
        let audio_lines = "[PARTIAL] {\"index\": 1, \"success\": false, \"error\": \"tts crashed\"}";
        let batch = r#"{"success": true, "results": [{"index": 0, "success": true}, {"index": 1, "success": false}]}"#;
        let (mut orc, _) = orchestrator(
            ScriptedExecutor::new()
                .on(StageAction::Translate, Script::reply(lines, TRANSLATED))
                .on(StageAction::SynthesizeBatch, Script::reply(audio_lines, batch)),
        );
        orc.load_segments(vec![Segment::new(0.5, 2.0, "first"), Segment::new(4.0, 5.5, "second")]);
        let mut rx = orc.subscribe();

        orc.translate_and_synthesize(&req).await;

        let events = drain(&mut rx);
        let partial_indices: Vec<usize> = events
            .iter()
            .filter_map(|e| match e {
                PipelineEvent::Partial(p) => Some(p.index),
                _ => None,
            })
            .collect();
        // Out-of-range index 9 is dropped; the malformed line is only logged.
        assert_eq!(partial_indices, vec![0, 1]);
        assert!(events
            .iter()
            .any(|e| matches!(e, PipelineEvent::Log { line, .. } if line.starts_with("[PARTIAL] {broken"))));

        // Synthesis success keeps the predetermined path when none is reported.
        let first = &orc.session().translated[0];
        assert_eq!(first.audio_status, AudioStatus::Ready);
        assert_eq!(
            first.audio_path.as_deref(),
            Some(req.paths.segment_audio(0).to_string_lossy().as_ref())
        );
    }

    // -----------------------------------------------------------------------
    // Failures
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn reported_stage_failure_halts_the_run() {
        let dir = tempdir().expect("temp dir");
        let req = request(&dir);
        let (mut orc, executor) = orchestrator(
            ScriptedExecutor::new()
                .on(StageAction::Recognize, Script::reply("", RECOGNIZED))
                .on(
                    StageAction::Translate,
                    Script::reply("", r#"{"success": false, "error": "model not downloaded"}"#),
                ),
        );

        let outcome = orc.run(&req).await;

        match outcome {
            RunOutcome::Failed { stage, message } => {
                assert_eq!(stage, PipelineState::Translating);
                assert!(message.contains("model not downloaded"), "{message}");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(orc.state(), PipelineState::Failed);
        assert_eq!(executor.actions(), vec![StageAction::Recognize, StageAction::Translate]);
    }

    #[tokio::test]
    async fn worker_crash_fails_the_stage() {
        let dir = tempdir().expect("temp dir");
        let req = request(&dir);
        let (mut orc, _) = orchestrator(
            ScriptedExecutor::new().on(
                StageAction::Recognize,
                Script::exit(1, "Traceback (most recent call last):\nOSError: no ffmpeg\n"),
            ),
        );

        match orc.run(&req).await {
            RunOutcome::Failed { stage, message } => {
                assert_eq!(stage, PipelineState::Recognizing);
                assert!(message.contains("OSError: no ffmpeg"), "{message}");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!req.paths.subtitle.exists());
    }

    #[tokio::test]
    async fn output_without_sentinels_is_a_protocol_failure() {
        let dir = tempdir().expect("temp dir");
        let req = request(&dir);
        let (mut orc, _) = orchestrator(
            ScriptedExecutor::new().on(StageAction::Recognize, Script::raw("loaded\nthen nothing\n")),
        );

        match orc.run(&req).await {
            RunOutcome::Failed { message, .. } => {
                assert_eq!(message, "worker returned no result: then nothing");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn nothing_ready_fails_merge_without_invoking_it() {
        let dir = tempdir().expect("temp dir");
        let req = request(&dir);
        let batch = r#"{"success": true, "results": [{"index": 0, "success": false}, {"index": 1, "success": false}]}"#;
        let (mut orc, executor) = orchestrator(
            ScriptedExecutor::new()
                .on(StageAction::Recognize, Script::reply("", RECOGNIZED))
                .on(StageAction::Translate, Script::reply("", TRANSLATED))
                .on(StageAction::SynthesizeBatch, Script::reply("", batch)),
        );

        match orc.run(&req).await {
            RunOutcome::Failed { stage, message } => {
                assert_eq!(stage, PipelineState::Merging);
                assert_eq!(message, PipelineError::NothingToMerge.to_string());
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!executor.actions().contains(&StageAction::Merge));
    }

    #[tokio::test]
    async fn empty_recognition_fails_at_translation() {
        let dir = tempdir().expect("temp dir");
        let req = request(&dir);
        let (mut orc, executor) =
            orchestrator(ScriptedExecutor::new().on(StageAction::Recognize, Script::reply("", "[]")));

        match orc.run(&req).await {
            RunOutcome::Failed { stage, .. } => assert_eq!(stage, PipelineState::Translating),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(executor.actions(), vec![StageAction::Recognize]);
    }

    // -----------------------------------------------------------------------
    // Abort
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn abort_between_translate_and_synthesize() {
        let dir = tempdir().expect("temp dir");
        let req = request(&dir);
        let handle: Arc<OnceLock<AbortHandle>> = Arc::default();
        let hook_handle = Arc::clone(&handle);
        let (mut orc, executor) = orchestrator(
            ScriptedExecutor::new()
                .on(StageAction::Recognize, Script::reply("", RECOGNIZED))
                .on(
                    StageAction::Translate,
                    Script::reply("", TRANSLATED).then(move || {
                        if let Some(abort) = hook_handle.get() {
                            abort.abort();
                        }
                    }),
                ),
        );
        let _ = handle.set(orc.abort_handle());

        let outcome = orc.run(&req).await;

        assert_eq!(
            outcome,
            RunOutcome::Aborted {
                during: PipelineState::Translating
            }
        );
        assert_eq!(orc.state(), PipelineState::Aborted);
        assert_eq!(executor.actions(), vec![StageAction::Recognize, StageAction::Translate]);
        assert_eq!(executor.cancel_count(), 1);
        // The translate result arrived after abort and was discarded.
        assert!(orc.session().translated.iter().all(|s| s.text.is_empty()));
        // Artifacts from earlier stages stay in place.
        assert!(req.paths.subtitle.exists());
        assert!(!req.paths.batch_tasks.exists());
    }

    #[tokio::test]
    async fn abort_kills_a_running_stage() {
        let dir = tempdir().expect("temp dir");
        let req = request(&dir);
        let (mut orc, executor) = orchestrator(ScriptedExecutor::new().on(StageAction::Recognize, Script::hang()));
        let abort = orc.abort_handle();

        let (outcome, ()) = tokio::join!(orc.run(&req), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            abort.abort();
        });

        assert_eq!(
            outcome,
            RunOutcome::Aborted {
                during: PipelineState::Recognizing
            }
        );
        assert_eq!(executor.cancel_count(), 1);
        assert_eq!(executor.actions(), vec![StageAction::Recognize]);
    }

    #[tokio::test]
    async fn a_new_run_clears_a_previous_abort() {
        let dir = tempdir().expect("temp dir");
        let req = request(&dir);
        let (mut orc, _) = orchestrator(
            ScriptedExecutor::new().on(StageAction::Recognize, Script::exit(2, "")),
        );
        orc.abort_handle().abort();

        // Runs normally (and fails on the scripted exit) instead of aborting.
        assert!(matches!(orc.run(&req).await, RunOutcome::Failed { .. }));
    }

    // -----------------------------------------------------------------------
    // Single-segment operations
    // -----------------------------------------------------------------------

    /// Orchestrator with two translated, voiced segments; `extra` scripts are
    /// queued behind the ones that build the session.
    async fn translated_session(
        req: &RunRequest,
        extra: Vec<(StageAction, Script)>,
    ) -> (PipelineOrchestrator, Arc<ScriptedExecutor>) {
        let mut scripted = ScriptedExecutor::new()
            .on(StageAction::Translate, Script::reply("", TRANSLATED))
            .on(StageAction::SynthesizeBatch, Script::reply("", &batch_ok(req, 2)));
        for (action, script) in extra {
            scripted = scripted.on(action, script);
        }
        let (mut orc, executor) = orchestrator(scripted);
        orc.load_segments(vec![Segment::new(0.5, 2.0, "first"), Segment::new(4.0, 5.5, "second")]);
        assert_eq!(orc.translate_and_synthesize(req).await, RunOutcome::Done);
        (orc, executor)
    }

    #[tokio::test]
    async fn retranslate_patches_one_segment() {
        let dir = tempdir().expect("temp dir");
        let req = request(&dir);
        let (mut orc, executor) = translated_session(
            &req,
            vec![(
                StageAction::Translate,
                Script::reply("", r#"{"success": true, "text": "deuxième"}"#),
            )],
        )
        .await;

        let text = orc.retranslate_segment(1, "French").await.expect("retranslate");
        assert_eq!(text, "deuxième");
        assert_eq!(orc.session().translated[1].text, "deuxième");
        assert_eq!(orc.session().translated[0].text, "premier");
        assert_eq!(orc.state(), PipelineState::Done);

        // The source text of that one segment is what gets sent.
        let call = executor.calls().last().cloned().expect("call");
        assert_eq!(call.arguments()[3], "second");
        // Audio state is untouched by a text patch.
        assert_eq!(orc.session().translated[1].audio_status, AudioStatus::Ready);
    }

    #[tokio::test]
    async fn single_segment_ops_drop_out_of_range_partials() {
        let dir = tempdir().expect("temp dir");
        let req = request(&dir);
        let lines = concat!(
            "[PARTIAL] {\"index\": 1, \"text\": \"deux\"}\n",
            "[PARTIAL] {\"index\": 7, \"text\": \"nowhere\"}\n",
        );
        let (mut orc, _) = translated_session(
            &req,
            vec![(
                StageAction::Translate,
                Script::reply(lines, r#"{"success": true, "text": "deuxième"}"#),
            )],
        )
        .await;
        let mut rx = orc.subscribe();

        orc.retranslate_segment(1, "French").await.expect("retranslate");

        let partial_indices: Vec<usize> = drain(&mut rx)
            .iter()
            .filter_map(|e| match e {
                PipelineEvent::Partial(p) => Some(p.index),
                _ => None,
            })
            .collect();
        assert_eq!(partial_indices, vec![1]);
        // Published, not applied: the final reply wins.
        assert_eq!(orc.session().translated[1].text, "deuxième");
    }

    #[tokio::test]
    async fn retranslate_rejects_bad_index_and_empty_text() {
        let dir = tempdir().expect("temp dir");
        let req = request(&dir);
        let (mut orc, executor) = translated_session(
            &req,
            vec![(
                StageAction::Translate,
                Script::reply("", r#"{"success": true, "segments": []}"#),
            )],
        )
        .await;

        let err = orc.retranslate_segment(5, "French").await.unwrap_err();
        assert!(matches!(err, PipelineError::SegmentOutOfRange { index: 5, len: 2 }));

        let calls_before = executor.calls().len();
        let err = orc.retranslate_segment(0, "French").await.unwrap_err();
        assert!(matches!(err, PipelineError::Protocol(ProtocolError::Invalid { .. })));
        assert_eq!(executor.calls().len(), calls_before + 1);
        assert_eq!(orc.session().translated[0].text, "premier");
    }

    #[tokio::test]
    async fn regenerate_audio_success_and_failure() {
        let dir = tempdir().expect("temp dir");
        let req = request(&dir);
        let fresh = req.paths.segment_audio(0).with_file_name("segment_0_v2.wav");
        let (mut orc, executor) = translated_session(
            &req,
            vec![
                (
                    StageAction::SynthesizeOne,
                    Script::reply("", &format!(r#"{{"success": true, "audio_path": "{}"}}"#, fresh.display())),
                ),
                (
                    StageAction::SynthesizeOne,
                    Script::reply("", r#"{"success": false, "error": "speaker reference too short"}"#),
                ),
            ],
        )
        .await;
        let mut rx = orc.subscribe();

        let path = orc.regenerate_segment_audio(0, &req).await.expect("regenerate");
        assert_eq!(PathBuf::from(&path), fresh);
        assert_eq!(orc.session().translated[0].audio_status, AudioStatus::Ready);
        assert_eq!(orc.session().translated[0].audio_path.as_deref(), Some(path.as_str()));

        let call = executor.calls().last().cloned().expect("call");
        assert_eq!(call.action(), StageAction::SynthesizeOne);
        assert_eq!(call.arguments()[5], req.paths.segment_audio(0).to_string_lossy());
        assert_eq!(call.arguments()[7], "premier");
        assert_eq!(call.arguments()[9], "0.5");

        let err = orc.regenerate_segment_audio(1, &req).await.unwrap_err();
        assert!(matches!(err, PipelineError::StageFailure { action: StageAction::SynthesizeOne, .. }));
        assert_eq!(orc.session().translated[1].audio_status, AudioStatus::Error);
        assert_eq!(orc.state(), PipelineState::Done);

        let updates: Vec<PipelineEvent> = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, PipelineEvent::SegmentUpdated { .. }))
            .collect();
        assert_eq!(
            updates,
            vec![
                PipelineEvent::SegmentUpdated { index: 0 },
                PipelineEvent::SegmentUpdated { index: 0 },
                PipelineEvent::SegmentUpdated { index: 1 },
                PipelineEvent::SegmentUpdated { index: 1 },
            ]
        );
    }
}
