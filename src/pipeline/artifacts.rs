//! Files a run leaves behind: the SRT subtitle, the batch task list and the
//! merge manifest.

use std::path::Path;

use serde::Serialize;

use crate::protocol::Segment;

use super::runner::PipelineError;

// ---------------------------------------------------------------------------
// Subtitles
// ---------------------------------------------------------------------------

/// `HH:MM:SS,mmm`, rounded to the nearest millisecond.  Negative or
/// non-finite input renders as zero.
pub fn srt_timestamp(seconds: f64) -> String {
    let total_ms = if seconds.is_finite() && seconds > 0.0 {
        (seconds * 1000.0).round() as u64
    } else {
        0
    };
    let ms = total_ms % 1000;
    let secs = (total_ms / 1000) % 60;
    let mins = (total_ms / 60_000) % 60;
    let hours = total_ms / 3_600_000;
    format!("{hours:02}:{mins:02}:{secs:02},{ms:03}")
}

/// Render `segments` as SRT, numbered from 1 in slice order.
pub fn to_srt(segments: &[Segment]) -> String {
    segments
        .iter()
        .enumerate()
        .map(|(i, seg)| {
            format!(
                "{}\n{} --> {}\n{}\n",
                i + 1,
                srt_timestamp(seg.start),
                srt_timestamp(seg.end),
                seg.text
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

// ---------------------------------------------------------------------------
// Merge manifest
// ---------------------------------------------------------------------------

/// One `{start, path}` entry of the merge manifest.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ManifestEntry<'a> {
    pub start: f64,
    pub path: &'a str,
}

/// Entries for every segment whose audio is ready, in list order.
pub fn merge_manifest(segments: &[Segment]) -> Vec<ManifestEntry<'_>> {
    segments
        .iter()
        .filter(|s| s.has_ready_audio())
        .filter_map(|s| {
            s.audio_path.as_deref().map(|path| ManifestEntry {
                start: s.start,
                path,
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Writing
// ---------------------------------------------------------------------------

/// Write `contents` to `path`, creating parent directories.
pub fn write_text(path: &Path, contents: &str) -> Result<(), PipelineError> {
    let artifact = |source| PipelineError::Artifact {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(artifact)?;
    }
    std::fs::write(path, contents).map_err(artifact)?;
    log::debug!("pipeline: wrote {}", path.display());
    Ok(())
}

/// Serialize `value` as pretty JSON into `path`.
pub fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), PipelineError> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| PipelineError::Internal(format!("serializing {}: {e}", path.display())))?;
    write_text(path, &json)
}
