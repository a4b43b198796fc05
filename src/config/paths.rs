//! Cross-platform application paths using the `dirs` crate, plus the
//! per-media artifact layout of a run.
//!
//! Layout:
//!
//! Config dir (settings):
//!   Windows: %APPDATA%\video-dub\
//!   macOS:   ~/Library/Application Support/video-dub/
//!   Linux:   ~/.config/video-dub/
//!
//! Data dir (default output root):
//!   Windows: %LOCALAPPDATA%\video-dub\output\
//!   macOS:   ~/Library/Application Support/video-dub/output/
//!   Linux:   ~/.local/share/video-dub/output/
//!
//! Per run, under the output root:
//!
//! ```text
//! <stem>/
//! ├── <stem>.srt                      subtitles from recognition
//! ├── <stem>_segments/
//! │   ├── segment_<i>.wav             synthesized audio per segment
//! │   └── batch_tasks.json            synthesis task list
//! ├── audio_segments.json             merge manifest
//! └── <stem>_dubbed_<lang>.mp4        merged result
//! ```

use std::path::{Path, PathBuf};

/// Where settings live and where runs write by default.
#[derive(Debug, Clone)]
pub struct AppPaths {
    /// Directory for `settings.toml`.
    pub config_dir: PathBuf,
    /// Full path to `settings.toml`.
    pub settings_file: PathBuf,
    /// Default root for run artifacts.
    pub output_dir: PathBuf,
}

impl AppPaths {
    const APP_NAME: &'static str = "video-dub";

    /// Platform directories, or `./video-dub` when the platform has none.
    pub fn new() -> Self {
        let app_dir = |base: Option<PathBuf>| base.unwrap_or_else(|| PathBuf::from(".")).join(Self::APP_NAME);

        let config_dir = app_dir(dirs::config_dir());
        let settings_file = config_dir.join("settings.toml");
        let output_dir = app_dir(dirs::data_local_dir()).join("output");

        Self {
            config_dir,
            settings_file,
            output_dir,
        }
    }
}

impl Default for AppPaths {
    fn default() -> Self {
        Self::new()
    }
}

/// Artifact paths for one run over one media file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPaths {
    /// `<output>/<stem>`.
    pub work_dir: PathBuf,
    pub subtitle: PathBuf,
    /// Directory receiving `segment_<i>.wav` files.
    pub segment_dir: PathBuf,
    pub batch_tasks: PathBuf,
    pub manifest: PathBuf,
    pub merged: PathBuf,
}

impl RunPaths {
    pub fn for_media(output_dir: &Path, media: &Path, lang: &str) -> Self {
        let stem = media
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "media".to_string());

        let work_dir = output_dir.join(&stem);
        let segment_dir = work_dir.join(format!("{stem}_segments"));

        Self {
            subtitle: work_dir.join(format!("{stem}.srt")),
            batch_tasks: segment_dir.join("batch_tasks.json"),
            manifest: work_dir.join("audio_segments.json"),
            merged: work_dir.join(format!("{stem}_dubbed_{lang}.mp4")),
            segment_dir,
            work_dir,
        }
    }

    /// Predetermined audio path for segment `index`.
    pub fn segment_audio(&self, index: usize) -> PathBuf {
        self.segment_dir.join(format!("segment_{index}.wav"))
    }
}
