//! Stage invocations and their typed results.
//!
//! Every call into the worker is one [`StageInvocation`]: an action selector
//! plus the positional arguments the worker's command line expects.  When
//! the process exits, [`StageInvocation::interpret`] pulls the sentinel
//! payload out of stdout and decodes it into the [`StageOutput`] variant that
//! belongs to the action.
//!
//! | Action            | Worker name            | Result payload                                   |
//! |-------------------|------------------------|--------------------------------------------------|
//! | `Recognize`       | `test_asr`             | `[{start, end, text}, …]`                        |
//! | `Translate`       | `translate_text`       | `{success, segments \| text, error?}`            |
//! | `SynthesizeOne`   | `generate_single_tts`  | `{success, audioPath, error?}`                   |
//! | `SynthesizeBatch` | `generate_batch_tts`   | `{success, results: [{index, success, …}]}`      |
//! | `Merge`           | `merge_video`          | `{success, outputPath, error?}`                  |

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::segment::Segment;
use super::sentinel::{extract, Extraction};

// ---------------------------------------------------------------------------
// StageAction
// ---------------------------------------------------------------------------

/// The five kinds of work the worker can be asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageAction {
    Recognize,
    Translate,
    SynthesizeOne,
    SynthesizeBatch,
    Merge,
}

impl StageAction {
    /// Value passed to the worker's `--action` flag.
    pub fn wire_name(self) -> &'static str {
        match self {
            Self::Recognize => "test_asr",
            Self::Translate => "translate_text",
            Self::SynthesizeOne => "generate_single_tts",
            Self::SynthesizeBatch => "generate_batch_tts",
            Self::Merge => "merge_video",
        }
    }

    /// Label used in logs and error messages.
    pub fn label(self) -> &'static str {
        match self {
            Self::Recognize => "recognize",
            Self::Translate => "translate",
            Self::SynthesizeOne => "synthesize-one",
            Self::SynthesizeBatch => "synthesize-batch",
            Self::Merge => "merge",
        }
    }
}

impl fmt::Display for StageAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

// ---------------------------------------------------------------------------
// ProtocolError
// ---------------------------------------------------------------------------

/// The worker exited cleanly but its output does not honour the contract.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// No sentinel-delimited result in stdout.  Carries both raw streams.
    #[error("worker returned no result{}", diagnostic_tail(.stdout, .stderr))]
    MissingResult { stdout: String, stderr: String },

    /// The payload is not the JSON shape this action produces.
    #[error("cannot decode {action} result: {source}")]
    Decode {
        action: StageAction,
        #[source]
        source: serde_json::Error,
    },

    /// The payload decoded but violates the action's contract.
    #[error("invalid {action} result: {reason}")]
    Invalid { action: StageAction, reason: String },
}

/// Last non-empty line of stderr (or stdout) to make the message actionable.
fn diagnostic_tail(stdout: &str, stderr: &str) -> String {
    [stderr, stdout]
        .iter()
        .find_map(|text| text.lines().rev().map(str::trim).find(|l| !l.is_empty()))
        .map(|line| format!(": {line}"))
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// StageInvocation
// ---------------------------------------------------------------------------

/// One request to the worker.  Immutable once built; maps to exactly one
/// spawned process.
#[derive(Debug, Clone, PartialEq)]
pub struct StageInvocation {
    action: StageAction,
    arguments: Vec<String>,
}

/// Timing and text only: the shape the translate action reads.
#[derive(Serialize)]
struct TranslateInput<'a> {
    start: f64,
    end: f64,
    text: &'a str,
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

impl StageInvocation {
    fn new(action: StageAction, rest: Vec<String>) -> Self {
        let mut arguments = vec!["--action".to_string(), action.wire_name().to_string()];
        arguments.extend(rest);
        Self { action, arguments }
    }

    /// Speech recognition over a media file.
    pub fn recognize(media: &Path) -> Self {
        Self::new(StageAction::Recognize, vec!["--input".into(), path_arg(media)])
    }

    /// Translate a whole segment list; the list travels inline as JSON.
    pub fn translate_segments(segments: &[Segment], lang: &str) -> Result<Self, serde_json::Error> {
        let input: Vec<TranslateInput<'_>> = segments
            .iter()
            .map(|s| TranslateInput {
                start: s.start,
                end: s.end,
                text: &s.text,
            })
            .collect();
        let json = serde_json::to_string(&input)?;
        Ok(Self::translate_text(&json, lang))
    }

    /// Translate a single piece of text.
    pub fn translate_text(text: &str, lang: &str) -> Self {
        Self::new(
            StageAction::Translate,
            vec![
                "--input".into(),
                text.into(),
                "--lang".into(),
                lang.into(),
                "--json".into(),
            ],
        )
    }

    /// Synthesize one segment's dubbed audio into `output`.
    pub fn synthesize_one(media: &Path, output: &Path, text: &str, start: f64, lang: &str) -> Self {
        Self::new(
            StageAction::SynthesizeOne,
            vec![
                "--input".into(),
                path_arg(media),
                "--output".into(),
                path_arg(output),
                "--text".into(),
                text.into(),
                "--start".into(),
                start.to_string(),
                "--lang".into(),
                lang.into(),
                "--json".into(),
            ],
        )
    }

    /// Synthesize every task listed in the JSON file at `tasks`.
    pub fn synthesize_batch(media: &Path, tasks: &Path) -> Self {
        Self::new(
            StageAction::SynthesizeBatch,
            vec![
                "--input".into(),
                path_arg(media),
                "--ref".into(),
                path_arg(tasks),
                "--json".into(),
            ],
        )
    }

    /// Mux the audio listed in `manifest` over `media`, writing `output`.
    pub fn merge(media: &Path, manifest: &Path, output: &Path) -> Self {
        Self::new(
            StageAction::Merge,
            vec![
                "--input".into(),
                path_arg(media),
                "--ref".into(),
                path_arg(manifest),
                "--output".into(),
                path_arg(output),
            ],
        )
    }

    pub fn action(&self) -> StageAction {
        self.action
    }

    /// Arguments in order, starting with `--action <name>`.
    pub fn arguments(&self) -> &[String] {
        &self.arguments
    }

    /// Extract and decode the result of this invocation from the worker's
    /// accumulated output.
    pub fn interpret(&self, stdout: &str, stderr: &str) -> Result<StageReply, ProtocolError> {
        match extract(stdout, stderr) {
            Extraction::Payload(payload) => decode(self.action, payload),
            Extraction::Diagnostic { stdout, stderr } => Err(ProtocolError::MissingResult {
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Typed results
// ---------------------------------------------------------------------------

/// A well-formed reply: either the typed result, or the worker's own report
/// that the stage failed (`success: false`).
#[derive(Debug, Clone, PartialEq)]
pub enum StageReply {
    Success(StageOutput),
    Failure { message: String },
}

/// Typed result, one variant per action.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutput {
    Recognized(Vec<Segment>),
    Translated(Translation),
    SynthesizedOne { audio_path: String },
    SynthesizedBatch(Vec<BatchItem>),
    Merged { output_path: String },
}

/// What a translate call returned.
#[derive(Debug, Clone, PartialEq)]
pub enum Translation {
    Segments(Vec<Segment>),
    Text(String),
}

impl Translation {
    /// The single translated text: `text`, or the first segment's text.
    pub fn first_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text.as_str()),
            Self::Segments(segments) => segments.first().map(|s| s.text.as_str()),
        }
    }
}

/// Per-index outcome of a batch synthesis.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchItem {
    pub index: usize,
    pub success: bool,
    #[serde(default, alias = "audio_path")]
    pub audio_path: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireTranslate {
    success: bool,
    #[serde(default)]
    segments: Option<Vec<Segment>>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireSynthesizeOne {
    success: bool,
    #[serde(default, alias = "audio_path")]
    audio_path: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct WireBatch {
    success: bool,
    #[serde(default)]
    results: Option<Vec<BatchItem>>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireMerge {
    success: bool,
    #[serde(default, alias = "output")]
    output_path: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// `{success: false, error}` as some actions report failure.
#[derive(Deserialize)]
struct WireFailure {
    success: bool,
    #[serde(default)]
    error: Option<String>,
}

fn failure(error: Option<String>) -> StageReply {
    StageReply::Failure {
        message: error.unwrap_or_else(|| "unknown error".to_string()),
    }
}

fn parse<T: serde::de::DeserializeOwned>(action: StageAction, payload: &str) -> Result<T, ProtocolError> {
    serde_json::from_str(payload).map_err(|source| ProtocolError::Decode { action, source })
}

fn invalid(action: StageAction, reason: impl Into<String>) -> ProtocolError {
    ProtocolError::Invalid {
        action,
        reason: reason.into(),
    }
}

fn validate_all(action: StageAction, segments: &[Segment]) -> Result<(), ProtocolError> {
    for (i, segment) in segments.iter().enumerate() {
        segment
            .validate()
            .map_err(|reason| invalid(action, format!("segment {i}: {reason}")))?;
    }
    Ok(())
}

/// Decode a sentinel payload according to the action's result schema.
pub fn decode(action: StageAction, payload: &str) -> Result<StageReply, ProtocolError> {
    let output = match action {
        StageAction::Recognize => {
            if payload.starts_with('{') {
                // Recognition has no object form; accept only an explicit failure.
                let wire: WireFailure = parse(action, payload)?;
                if wire.success {
                    return Err(invalid(action, "expected a list of segments"));
                }
                return Ok(failure(wire.error));
            }
            let segments: Vec<Segment> = parse(action, payload)?;
            validate_all(action, &segments)?;
            StageOutput::Recognized(segments)
        }

        StageAction::Translate => {
            let wire: WireTranslate = parse(action, payload)?;
            if !wire.success {
                return Ok(failure(wire.error));
            }
            match (wire.segments, wire.text) {
                (Some(segments), _) => {
                    validate_all(action, &segments)?;
                    StageOutput::Translated(Translation::Segments(segments))
                }
                (None, Some(text)) => StageOutput::Translated(Translation::Text(text)),
                (None, None) => return Err(invalid(action, "neither `segments` nor `text` present")),
            }
        }

        StageAction::SynthesizeOne => {
            let wire: WireSynthesizeOne = parse(action, payload)?;
            if !wire.success {
                return Ok(failure(wire.error));
            }
            let audio_path = wire
                .audio_path
                .ok_or_else(|| invalid(action, "missing `audioPath`"))?;
            StageOutput::SynthesizedOne { audio_path }
        }

        StageAction::SynthesizeBatch => {
            let wire: WireBatch = parse(action, payload)?;
            if !wire.success {
                return Ok(failure(wire.error));
            }
            let results = wire
                .results
                .ok_or_else(|| invalid(action, "missing `results`"))?;
            StageOutput::SynthesizedBatch(results)
        }

        StageAction::Merge => {
            let wire: WireMerge = parse(action, payload)?;
            if !wire.success {
                return Ok(failure(wire.error));
            }
            let output_path = wire
                .output_path
                .ok_or_else(|| invalid(action, "missing `outputPath`"))?;
            StageOutput::Merged { output_path }
        }
    };

    Ok(StageReply::Success(output))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
