//! Run configuration loaded from `~/.config/memfetch/config.toml`.
//!
//! Layers, lowest first: built-in defaults, the TOML file, then CLI flags
//! (applied by the binary on the returned [`Config`]).

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Folder for composited files under `separate-folders` naming
pub const WITH_OVERLAYS_DIR: &str = "with_overlays";
/// Folder for plain files under `separate-folders` naming
pub const WITHOUT_OVERLAYS_DIR: &str = "without_overlays";
/// Folder for raw overlay copies
pub const OVERLAYS_DIR: &str = "overlays";
/// Filename suffix for composited files under `single-folder` naming
pub const OVERLAY_SUFFIX: &str = "_overlayed";

/// Which variants to produce for entries that carry an overlay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
#[serde(rename_all = "kebab-case")]
pub enum OverlayMode {
    /// Base media only
    #[default]
    None,
    /// Composited media only
    With,
    /// Base and composited media
    Both,
}

impl OverlayMode {
    /// Whether the overlay asset must be fetched at all.
    #[must_use]
    pub fn wants_overlay(self) -> bool {
        !matches!(self, Self::None)
    }
}

/// Placement of plain vs composited variants when both are written
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
#[serde(rename_all = "kebab-case")]
pub enum OverlayNaming {
    /// Same folder, composited file gets the `_overlayed` suffix
    SingleFolder,
    /// `with_overlays/` and `without_overlays/`
    #[default]
    SeparateFolders,
}

/// What happens when an overlay track is shorter than the base video
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
#[serde(rename_all = "kebab-case")]
pub enum OverlayTrackPolicy {
    /// Hold the last overlay frame until the base video ends
    #[default]
    Freeze,
    /// Restart the overlay track from its first frame
    Loop,
}

/// Retry and timeout policy for media fetches
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct FetchSettings {
    /// Attempts per URL, including the first one
    pub max_attempts: u32,
    /// Timeout applied to each attempt separately
    pub attempt_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    /// Base delay before the first retry, doubled each retry
    pub backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            attempt_timeout_secs: 30,
            connect_timeout_secs: 10,
            backoff_ms: 500,
            max_backoff_ms: 8_000,
        }
    }
}

impl FetchSettings {
    #[must_use]
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Full run configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    pub output_dir: PathBuf,
    /// Worker pool size; also bounds concurrent transcoder processes
    pub concurrency: usize,
    pub embed_metadata: bool,
    pub skip_existing: bool,
    pub overlay_mode: OverlayMode,
    pub overlay_naming: OverlayNaming,
    pub overlay_track: OverlayTrackPolicy,
    /// Override for the ffmpeg executable (name or path)
    pub ffmpeg_path: Option<PathBuf>,
    pub filename_prefix: String,
    pub extract_text: bool,
    /// Persist raw overlay assets next to the composited output
    pub copy_overlays: bool,
    pub tesseract_path: Option<PathBuf>,
    pub ocr_language: String,
    /// Creator tag written to EXIF `Software` and QuickTime `©too`
    pub software_tag: Option<String>,
    pub jpeg_quality: u8,
    /// Wall-clock limit for a single transcoder invocation
    pub transcode_timeout_secs: u64,
    /// Where the enriched manifest goes (defaults next to the outputs)
    pub enriched_manifest: Option<PathBuf>,
    pub fetch: FetchSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("./downloads"),
            concurrency: 40,
            embed_metadata: true,
            skip_existing: true,
            overlay_mode: OverlayMode::default(),
            overlay_naming: OverlayNaming::default(),
            overlay_track: OverlayTrackPolicy::default(),
            ffmpeg_path: None,
            filename_prefix: String::new(),
            extract_text: false,
            copy_overlays: false,
            tesseract_path: None,
            ocr_language: "eng".to_string(),
            software_tag: None,
            jpeg_quality: 95,
            transcode_timeout_secs: 300,
            enriched_manifest: None,
            fetch: FetchSettings::default(),
        }
    }
}

impl Config {
    /// Load from an explicit file, or from the default location if present.
    ///
    /// A missing default file yields [`Config::default`]; a missing explicit
    /// file is an error.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = match explicit {
            Some(path) => path.to_path_buf(),
            None => {
                let path = config_path();
                if !path.exists() {
                    return Ok(Self::default());
                }
                path
            }
        };

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;

        Self::from_toml(&content).with_context(|| format!("invalid TOML in {}", path.display()))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Reject combinations that would make every entry fail.
    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            bail!("concurrency must be at least 1");
        }
        if self.fetch.max_attempts == 0 {
            bail!("fetch.max-attempts must be at least 1");
        }
        if self.extract_text && !self.overlay_mode.wants_overlay() {
            bail!("text extraction requires overlays; use overlay mode 'with' or 'both'");
        }
        if self.copy_overlays && self.overlay_mode != OverlayMode::Both {
            bail!("copying overlays requires overlay mode 'both'");
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            bail!("jpeg-quality must be between 1 and 100, got {}", self.jpeg_quality);
        }
        Ok(())
    }

    #[must_use]
    pub fn transcode_timeout(&self) -> Duration {
        Duration::from_secs(self.transcode_timeout_secs)
    }

    /// Destination of the enriched manifest for a given input manifest.
    #[must_use]
    pub fn enriched_manifest_path(&self, input: &Path) -> PathBuf {
        if let Some(ref path) = self.enriched_manifest {
            return path.clone();
        }
        let stem = input
            .file_stem()
            .map_or_else(|| "memories".into(), |s| s.to_string_lossy());
        self.output_dir.join(format!("{stem}.enriched.json"))
    }
}

/// Return the path to the default config file.
fn config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("memfetch")
        .join("config.toml")
}
