//! Overlay text extraction
//!
//! Text is read only from the overlay layer: it carries captions on a
//! transparent background, which gives far cleaner input than the composited
//! media. A frame is flattened onto black, converted to grayscale,
//! auto-contrasted and inverted (dark text on white) before OCR.
//!
//! Video and animated overlays are sampled through the [`Transcoder`] and the
//! first non-blank frame is used.

use std::io::Cursor;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use image::{DynamicImage, GrayImage, ImageFormat, Luma};
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tracing::{debug, instrument};

use crate::transcode::{is_video_extension, sniff_extension, TranscodeRequest, Transcoder};

/// Frames sampled from a moving overlay
const MAX_SAMPLED_FRAMES: u32 = 12;

/// Luma spread below which a frame counts as blank
const BLANK_SPREAD: u8 = 8;

/// Errors from text extraction
#[derive(Error, Debug)]
pub enum OcrError {
    #[error("{program} not available: {reason}")]
    NotFound { program: String, reason: String },

    #[error("OCR engine exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },

    #[error("OCR timed out after {0:?}")]
    Timeout(Duration),

    #[error("cannot prepare overlay frame: {0}")]
    Image(String),

    #[error("OCR I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, OcrError>;

/// OCR engine over a single prepared PNG frame.
#[async_trait]
pub trait TextExtractor: Send + Sync {
    fn name(&self) -> &str;

    /// Verify the engine runs. Returns the resolved executable.
    async fn check_available(&self) -> Result<PathBuf>;

    /// Recognize text in `png`. Returns an empty string when none is found.
    async fn extract(&self, png: Bytes) -> Result<String>;
}

/// tesseract CLI engine
#[derive(Debug, Clone)]
pub struct TesseractExtractor {
    program: PathBuf,
    language: String,
    permits: Arc<Semaphore>,
    timeout: Duration,
}

impl TesseractExtractor {
    pub fn new(program: impl Into<PathBuf>, language: &str, max_concurrent: usize) -> Self {
        let program = program.into();
        let program = which::which(&program).unwrap_or(program);
        Self {
            program,
            language: language.to_string(),
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            timeout: Duration::from_secs(60),
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// `--psm 11`: sparse text, no assumed layout. Overlay captions float
    /// anywhere on the frame.
    pub fn build_args(&self, image: &std::path::Path) -> Vec<String> {
        vec![
            image.to_string_lossy().to_string(),
            "stdout".to_string(),
            "-l".to_string(),
            self.language.clone(),
            "--psm".to_string(),
            "11".to_string(),
        ]
    }

    fn spawn_error(&self, err: std::io::Error) -> OcrError {
        if err.kind() == std::io::ErrorKind::NotFound {
            OcrError::NotFound {
                program: self.program.display().to_string(),
                reason: err.to_string(),
            }
        } else {
            OcrError::Io(err)
        }
    }
}

#[async_trait]
impl TextExtractor for TesseractExtractor {
    fn name(&self) -> &str {
        "tesseract"
    }

    async fn check_available(&self) -> Result<PathBuf> {
        let output = Command::new(&self.program)
            .arg("--version")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| self.spawn_error(e))?;
        if output.status.success() {
            Ok(self.program.clone())
        } else {
            Err(OcrError::NotFound {
                program: self.program.display().to_string(),
                reason: format!("--version exited with {}", output.status),
            })
        }
    }

    async fn extract(&self, png: Bytes) -> Result<String> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| OcrError::Io(std::io::Error::other(e)))?;

        let frame = tempfile::Builder::new().suffix(".png").tempfile()?;
        tokio::fs::write(frame.path(), &png).await?;

        let child = Command::new(&self.program)
            .args(self.build_args(frame.path()))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| self.spawn_error(e))?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| OcrError::Timeout(self.timeout))??;

        if !output.status.success() {
            return Err(OcrError::Failed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(normalize_text(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// Picks the overlay frame and runs the extractor on it
#[derive(Clone)]
pub struct OverlayTextReader {
    extractor: Arc<dyn TextExtractor>,
    transcoder: Option<Arc<dyn Transcoder>>,
}

impl OverlayTextReader {
    pub fn new(extractor: Arc<dyn TextExtractor>, transcoder: Option<Arc<dyn Transcoder>>) -> Self {
        Self {
            extractor,
            transcoder,
        }
    }

    /// Extract text from an overlay asset. Blank overlays yield `""`.
    #[instrument(skip_all, fields(size = overlay.len()))]
    pub async fn read(&self, overlay: Bytes) -> Result<String> {
        let still = {
            let overlay = overlay.clone();
            tokio::task::spawn_blocking(move || prepare_frame(&overlay))
                .await
                .map_err(|e| OcrError::Image(e.to_string()))?
        };

        let ext = sniff_extension(&overlay);
        let frame = match still {
            Ok(Some(png)) => Some(png),
            Ok(None) if !is_video_extension(ext) && ext != "gif" && ext != "webp" => None,
            // Undecodable, or blank first frame of something that moves
            _ => self.first_sampled_frame(overlay, ext).await?,
        };

        match frame {
            Some(png) => self.extractor.extract(Bytes::from(png)).await,
            None => {
                debug!("Overlay has no visible content");
                Ok(String::new())
            }
        }
    }

    async fn first_sampled_frame(&self, overlay: Bytes, ext: &'static str) -> Result<Option<Vec<u8>>> {
        let Some(transcoder) = self.transcoder.as_ref() else {
            return Ok(None);
        };
        let input_ext = if ext == "bin" { "mp4" } else { ext };
        let sampled = transcoder
            .run(TranscodeRequest::SampleFrames {
                input: overlay,
                input_ext,
                max_frames: MAX_SAMPLED_FRAMES,
            })
            .await
            .map_err(|e| OcrError::Image(format!("frame sampling failed: {e}")))?;

        tokio::task::spawn_blocking(move || {
            sampled
                .streams
                .iter()
                .find_map(|frame| prepare_frame(frame).ok().flatten())
        })
        .await
        .map_err(|e| OcrError::Image(e.to_string()))
    }
}

/// Flatten, grayscale and auto-contrast one frame into dark text on white.
///
/// Transparent areas are flattened onto whichever of black or white
/// contrasts with the visible content, so dark captions survive as well as
/// light ones. Returns `None` for a blank frame and the prepared PNG
/// otherwise.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn prepare_frame(bytes: &[u8]) -> Result<Option<Vec<u8>>> {
    let decoded = image::load_from_memory(bytes).map_err(|e| OcrError::Image(e.to_string()))?;
    let rgba = decoded.to_rgba8();

    let (coverage, weighted) = rgba.pixels().fold((0.0_f32, 0.0_f32), |(coverage, weighted), p| {
        let alpha = f32::from(p[3]) / 255.0;
        (coverage + alpha, weighted + luma(p.0) * alpha)
    });
    let dark_content = coverage > 0.0 && weighted / coverage < 128.0;
    let background = if dark_content { 255.0 } else { 0.0 };

    let mut gray = GrayImage::from_fn(rgba.width(), rgba.height(), |x, y| {
        let px = rgba.get_pixel(x, y).0;
        let alpha = f32::from(px[3]) / 255.0;
        let value = luma(px) * alpha + background * (1.0 - alpha);
        Luma([value.round().clamp(0.0, 255.0) as u8])
    });

    let (lo, hi) = gray
        .pixels()
        .fold((u8::MAX, u8::MIN), |(lo, hi), p| (lo.min(p[0]), hi.max(p[0])));
    if gray.pixels().next().is_none() || hi.saturating_sub(lo) < BLANK_SPREAD {
        return Ok(None);
    }

    let spread = f32::from(hi - lo);
    for pixel in gray.pixels_mut() {
        let stretched = f32::from(pixel[0] - lo) * 255.0 / spread;
        let value = stretched.round().clamp(0.0, 255.0) as u8;
        pixel[0] = if dark_content { value } else { 255 - value };
    }

    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageLuma8(gray)
        .write_to(&mut out, ImageFormat::Png)
        .map_err(|e| OcrError::Image(e.to_string()))?;
    Ok(Some(out.into_inner()))
}

fn luma([r, g, b, _]: [u8; 4]) -> f32 {
    0.299 * f32::from(r) + 0.587 * f32::from(g) + 0.114 * f32::from(b)
}

/// Trim lines, drop blank ones, join with newlines.
pub fn normalize_text(raw: &str) -> String {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}
