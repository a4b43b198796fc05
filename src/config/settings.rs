//! Application settings structs, defaults and TOML persistence.
//!
//! All structs implement `Serialize`, `Deserialize`, `Default` and `Clone`
//! so they can be round-tripped through TOML files.  Missing keys fall back
//! to their defaults, so a hand-written file only needs the values it changes.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use super::AppPaths;

// ---------------------------------------------------------------------------
// WorkerConfig
// ---------------------------------------------------------------------------

/// How to launch the media worker.
///
/// The command line is
/// `program [script] [base_args…] [--model_dir <dir>] <stage args…>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Interpreter or executable (e.g. `"python"`).
    pub program: PathBuf,
    /// Script handed to `program` as its first argument; `None` when
    /// `program` is the worker itself.
    pub script: Option<PathBuf>,
    /// Arguments placed before the stage arguments on every call.
    pub base_args: Vec<String>,
    /// Directory holding the worker's models, passed as `--model_dir`.
    pub model_dir: Option<PathBuf>,
    /// Extra environment variables for the worker.
    pub env: BTreeMap<String, String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("python"),
            script: Some(PathBuf::from("backend/main.py")),
            base_args: vec!["--json".into()],
            model_dir: None,
            env: BTreeMap::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// PipelineConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Language the speech is translated and dubbed into.
    pub target_lang: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            target_lang: "English".into(),
        }
    }
}

// ---------------------------------------------------------------------------
// OutputConfig
// ---------------------------------------------------------------------------

/// Where run artifacts are written.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Root for per-media output folders.  `None` means
    /// [`AppPaths::output_dir`].
    pub output_dir: Option<PathBuf>,
}

impl OutputConfig {
    /// The configured directory, or the platform default.
    pub fn resolve(&self, paths: &AppPaths) -> PathBuf {
        self.output_dir
            .clone()
            .unwrap_or_else(|| paths.output_dir.clone())
    }
}

// ---------------------------------------------------------------------------
// AppConfig  (top-level)
// ---------------------------------------------------------------------------

/// Top-level application configuration, serialised as `settings.toml`.
///
/// # Persistence
///
/// ```rust,no_run
/// use video_dub::config::AppConfig;
///
/// // Load (returns Default when file is missing)
/// let config = AppConfig::load().unwrap();
///
/// // Modify and save
/// // config.save().unwrap();
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Worker launch settings.
    pub worker: WorkerConfig,
    /// Pipeline defaults.
    pub pipeline: PipelineConfig,
    /// Artifact locations.
    pub output: OutputConfig,
}

impl AppConfig {
    /// Load configuration from the platform-appropriate `settings.toml`.
    ///
    /// Returns `Ok(AppConfig::default())` when the file does not exist yet,
    /// so callers never need to special-case a missing file.
    pub fn load() -> Result<Self> {
        Self::load_from(&AppPaths::new().settings_file)
    }

    /// Load from an explicit path.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::debug!("config: {} not found, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to the platform-appropriate `settings.toml`,
    /// creating parent directories as needed.
    pub fn save(&self) -> Result<()> {
        self.save_to(&AppPaths::new().settings_file)
    }

    /// Save to an explicit path.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
