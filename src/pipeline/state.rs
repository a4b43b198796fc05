//! Pipeline state machine, session data and published events.
//!
//! [`PipelineState`] drives the orchestrator's state machine.  Subscribers see
//! every transition as a [`PipelineEvent::StateChanged`].
//!
//! [`SessionState`] is the working copy of segments across stages.  Only the
//! orchestrator mutates it.

use std::fmt;
use std::path::PathBuf;

use crate::protocol::{PartialResultEvent, Segment};
use crate::worker::StreamKind;

// ---------------------------------------------------------------------------
// PipelineState
// ---------------------------------------------------------------------------

/// States of the dubbing pipeline.
///
/// The state machine transitions are:
///
/// ```text
/// Idle ──run──▶ Recognizing ──▶ Translating ──▶ Synthesizing ──▶ Merging ──▶ Done
///                    │               │               │              │
///                    └───────────────┴──── abort ────┴──────────────┴──▶ Aborted
///                    └───────────────┴──── error ────┴──────────────┴──▶ Failed
/// ```
///
/// Any terminal state moves back to `Recognizing` when a new run starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PipelineState {
    /// No run has started yet.
    #[default]
    Idle,

    /// Speech recognition over the source media.
    Recognizing,

    /// Translating the recognized segments.
    Translating,

    /// Synthesizing dubbed audio for every translated segment.
    Synthesizing,

    /// Muxing the ready audio over the source media.
    Merging,

    /// The last run completed.
    Done,

    /// The last run was cancelled.
    Aborted,

    /// The last run stopped on an error.
    Failed,
}

impl PipelineState {
    /// Returns `true` while a stage is in flight.
    ///
    /// ```
    /// use video_dub::pipeline::PipelineState;
    ///
    /// assert!(!PipelineState::Idle.is_busy());
    /// assert!(PipelineState::Recognizing.is_busy());
    /// assert!(PipelineState::Merging.is_busy());
    /// assert!(!PipelineState::Done.is_busy());
    /// ```
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            PipelineState::Recognizing
                | PipelineState::Translating
                | PipelineState::Synthesizing
                | PipelineState::Merging
        )
    }

    /// `true` for the states a run ends in.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineState::Done | PipelineState::Aborted | PipelineState::Failed
        )
    }

    /// A short human-readable label for status output.
    pub fn label(&self) -> &'static str {
        match self {
            PipelineState::Idle => "Idle",
            PipelineState::Recognizing => "Recognizing",
            PipelineState::Translating => "Translating",
            PipelineState::Synthesizing => "Synthesizing",
            PipelineState::Merging => "Merging",
            PipelineState::Done => "Done",
            PipelineState::Aborted => "Aborted",
            PipelineState::Failed => "Failed",
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

// ---------------------------------------------------------------------------
// RunOutcome
// ---------------------------------------------------------------------------

/// How a run ended.  Abort is an outcome, not an error.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Done,
    /// Cancelled while in (or right after) `during`.
    Aborted { during: PipelineState },
    /// `stage` hit an error; the run went no further.
    Failed {
        stage: PipelineState,
        message: String,
    },
}

impl RunOutcome {
    pub fn is_done(&self) -> bool {
        matches!(self, RunOutcome::Done)
    }
}

// ---------------------------------------------------------------------------
// PipelineEvent
// ---------------------------------------------------------------------------

/// Published to subscribers in the order it happened.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    StateChanged(PipelineState),
    /// Advisory progress of the running stage.
    Progress { percent: u8 },
    /// Per-item result reported by the worker before the stage finished.
    Partial(PartialResultEvent),
    /// Unclassified worker output.
    Log { stream: StreamKind, line: String },
    /// `translated[index]` changed.
    SegmentUpdated { index: usize },
}

// ---------------------------------------------------------------------------
// SessionState
// ---------------------------------------------------------------------------

/// Segments and artifacts of the current run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionState {
    /// Recognized segments, sorted by start time.
    pub original: Vec<Segment>,
    /// Translated segments with their audio state.
    pub translated: Vec<Segment>,
    /// Subtitle file written after recognition.
    pub subtitle_path: Option<PathBuf>,
    /// Media produced by the merge stage.
    pub output_path: Option<PathBuf>,
}

impl SessionState {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Number of translated segments with audio ready to merge.
    pub fn ready_count(&self) -> usize {
        self.translated.iter().filter(|s| s.has_ready_audio()).count()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
