//! Classification of worker stdout lines.
//!
//! The worker has no framing beyond two textual tags.  Each complete line
//! matches exactly one production of this grammar, tried in order:
//!
//! ```text
//! line     := progress | partial | log
//! progress := <any> "[PROGRESS]" <ws>* <digits> <any>
//! partial  := <any> "[PARTIAL]"  <ws>* <json-object>
//! log      := <any>
//! ```
//!
//! A tagged line whose body does not parse falls through to `log`; a malformed
//! partial is reported at `warn` level and never aborts the stream.

use serde::Deserialize;

/// Tag announcing a progress percentage.
pub const PROGRESS_TAG: &str = "[PROGRESS]";

/// Tag announcing a per-item partial result.
pub const PARTIAL_TAG: &str = "[PARTIAL]";

// ---------------------------------------------------------------------------
// Event types
// ---------------------------------------------------------------------------

/// Advisory progress report.  Not guaranteed to be non-decreasing: the worker
/// may restart its count when it re-plans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressEvent {
    /// Percentage in `0..=100`; larger reported values are clamped.
    pub percent: u8,
}

/// A result for one item of the current stage, delivered before the stage
/// finishes.
#[derive(Debug, Clone, PartialEq)]
pub struct PartialResultEvent {
    /// Position in the stage's segment list.  May be out of range; consumers
    /// drop such events.
    pub index: usize,
    pub update: PartialUpdate,
}

/// Payload of a [`PartialResultEvent`].
#[derive(Debug, Clone, PartialEq)]
pub enum PartialUpdate {
    /// Translated text for the segment.
    Text { text: String },
    /// Outcome of synthesizing the segment's audio.
    Audio {
        audio_path: Option<String>,
        success: bool,
        error: Option<String>,
    },
}

/// Result of classifying one stdout line.
#[derive(Debug, Clone, PartialEq)]
pub enum LineKind {
    Progress(ProgressEvent),
    Partial(PartialResultEvent),
    /// Opaque text, kept for diagnostics only.
    Log,
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// Classify one complete line.
pub fn classify(line: &str) -> LineKind {
    if let Some(event) = parse_progress(line) {
        return LineKind::Progress(event);
    }

    if let Some(body) = after_tag(line, PARTIAL_TAG) {
        match parse_partial(body) {
            Ok(event) => return LineKind::Partial(event),
            Err(e) => log::warn!("markers: ignoring malformed partial result ({e}): {body}"),
        }
    }

    LineKind::Log
}

/// Text following the first occurrence of `tag`, with leading whitespace
/// removed.
fn after_tag<'a>(line: &'a str, tag: &str) -> Option<&'a str> {
    line.find(tag)
        .map(|pos| line[pos + tag.len()..].trim_start())
}

fn parse_progress(line: &str) -> Option<ProgressEvent> {
    let body = after_tag(line, PROGRESS_TAG)?;
    let digits_end = body
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(body.len());
    let digits = &body[..digits_end];
    if digits.is_empty() {
        return None;
    }

    // A run of digits too long for u64 still means "at least 100".
    let value = digits.parse::<u64>().unwrap_or(u64::MAX);
    Some(ProgressEvent {
        percent: value.min(100) as u8,
    })
}

// ---------------------------------------------------------------------------
// Partial payload decoding
// ---------------------------------------------------------------------------

/// Partial payload exactly as the worker writes it.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WirePartial {
    index: usize,
    #[serde(default)]
    text: Option<String>,
    #[serde(default, alias = "audio_path")]
    audio_path: Option<String>,
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    error: Option<String>,
}

/// Why a `[PARTIAL]` body was rejected.
#[derive(Debug, thiserror::Error)]
pub enum PartialDecodeError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("object carries neither `text` nor `success`")]
    UnknownShape,
}

fn parse_partial(body: &str) -> Result<PartialResultEvent, PartialDecodeError> {
    let wire: WirePartial = serde_json::from_str(body.trim())?;

    let update = if let Some(text) = wire.text {
        PartialUpdate::Text { text }
    } else if let Some(success) = wire.success {
        PartialUpdate::Audio {
            audio_path: wire.audio_path,
            success,
            error: wire.error,
        }
    } else {
        return Err(PartialDecodeError::UnknownShape);
    };

    Ok(PartialResultEvent {
        index: wire.index,
        update,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
