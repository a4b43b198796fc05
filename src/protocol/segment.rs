//! Subtitle segment type shared by every stage.

use serde::{Deserialize, Serialize};

/// Per-segment state of the synthesized (dubbed) audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioStatus {
    /// No audio has been requested for this segment.
    #[default]
    None,
    /// Synthesis is in flight.
    Generating,
    /// Audio exists at `audio_path`.
    Ready,
    /// Synthesis was attempted and failed.
    Error,
}

/// One timed line of speech.
///
/// Produced by recognition; translation rewrites `text`, synthesis fills in
/// `audio_path` and `audio_status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    /// Start time in seconds from the beginning of the media.
    pub start: f64,
    /// End time in seconds from the beginning of the media.
    pub end: f64,
    pub text: String,
    #[serde(default, alias = "audio_path", skip_serializing_if = "Option::is_none")]
    pub audio_path: Option<String>,
    #[serde(default)]
    pub audio_status: AudioStatus,
}

impl Segment {
    pub fn new(start: f64, end: f64, text: impl Into<String>) -> Self {
        Self {
            start,
            end,
            text: text.into(),
            audio_path: None,
            audio_status: AudioStatus::None,
        }
    }

    /// Check the timing invariant `0 <= start < end`.
    pub fn validate(&self) -> Result<(), String> {
        if !self.start.is_finite() || !self.end.is_finite() {
            return Err(format!(
                "segment timing is not finite ({} → {})",
                self.start, self.end
            ));
        }
        if self.start < 0.0 {
            return Err(format!("segment starts before zero ({})", self.start));
        }
        if self.end <= self.start {
            return Err(format!(
                "segment ends before it starts ({} → {})",
                self.start, self.end
            ));
        }
        Ok(())
    }

    /// `true` when the segment has finished audio that can be merged.
    pub fn has_ready_audio(&self) -> bool {
        self.audio_status == AudioStatus::Ready && self.audio_path.is_some()
    }
}

/// Stable sort by start time, ascending.
pub fn sort_by_start(segments: &mut [Segment]) {
    segments.sort_by(|a, b| a.start.total_cmp(&b.start));
}
