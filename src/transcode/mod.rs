//! External media transcoder seam.
//!
//! Video compositing, container metadata rewrites and frame sampling all go
//! through a [`Transcoder`]. The production implementation shells out to
//! ffmpeg ([`FfmpegTranscoder`]); tests substitute fakes.

pub mod ffmpeg;

pub use ffmpeg::FfmpegTranscoder;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::config::OverlayTrackPolicy;

/// Errors from a transcoder invocation
#[derive(Error, Debug)]
pub enum TranscodeError {
    #[error("{program} not available: {reason}")]
    NotFound { program: String, reason: String },

    #[error("{program} exited with {status}: {stderr}")]
    Failed {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("transcoder timed out after {0:?}")]
    Timeout(Duration),

    #[error("transcoder produced no output")]
    NoOutput,

    #[error("transcoder I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TranscodeError>;

/// One unit of work for a transcoder
#[derive(Debug, Clone)]
pub enum TranscodeRequest {
    /// Alpha-composite `overlay` over every frame of `base`, scaled to the
    /// base dimensions. Audio is carried over unchanged.
    Composite {
        base: Bytes,
        overlay: Bytes,
        /// Extension matching the overlay container (`png`, `webp`, `mp4`)
        overlay_ext: &'static str,
        track: OverlayTrackPolicy,
    },
    /// Stream-copy `input`, setting container-level metadata tags.
    RewriteMetadata {
        input: Bytes,
        tags: Vec<(String, String)>,
    },
    /// Decode up to `max_frames` still frames (PNG) from a video.
    SampleFrames {
        input: Bytes,
        input_ext: &'static str,
        max_frames: u32,
    },
}

impl TranscodeRequest {
    /// Short label for logs
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Composite { .. } => "composite",
            Self::RewriteMetadata { .. } => "rewrite-metadata",
            Self::SampleFrames { .. } => "sample-frames",
        }
    }
}

/// Output byte streams. Composite and rewrite produce exactly one; frame
/// sampling produces one per frame, in order.
#[derive(Debug, Clone, Default)]
pub struct TranscodeOutput {
    pub streams: Vec<Bytes>,
}

impl TranscodeOutput {
    #[must_use]
    pub fn single(bytes: Bytes) -> Self {
        Self {
            streams: vec![bytes],
        }
    }

    /// First stream, or [`TranscodeError::NoOutput`] if empty.
    pub fn into_single(self) -> Result<Bytes> {
        self.streams
            .into_iter()
            .next()
            .filter(|b| !b.is_empty())
            .ok_or(TranscodeError::NoOutput)
    }
}

/// Trait for external transcoders.
///
/// Implementations bound their own process concurrency and enforce a
/// wall-clock timeout per invocation; a timed-out process is killed.
#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Program name for logs and error messages.
    fn name(&self) -> &str;

    /// Verify the executable runs. Returns its resolved path.
    async fn check_available(&self) -> Result<PathBuf>;

    async fn run(&self, request: TranscodeRequest) -> Result<TranscodeOutput>;
}

/// Guess a file extension from leading magic bytes.
///
/// Falls back to `bin` for unknown data.
#[must_use]
pub fn sniff_extension(bytes: &[u8]) -> &'static str {
    if bytes.starts_with(b"\x89PNG\r\n\x1a\n") {
        "png"
    } else if is_webp(bytes) {
        "webp"
    } else if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
        "gif"
    } else if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        "jpg"
    } else if bytes.len() >= 12 && &bytes[4..8] == b"ftyp" {
        if &bytes[8..11] == b"qt " {
            "mov"
        } else {
            "mp4"
        }
    } else if bytes.starts_with(&[0x1A, 0x45, 0xDF, 0xA3]) {
        "webm"
    } else {
        "bin"
    }
}

#[must_use]
pub fn is_webp(bytes: &[u8]) -> bool {
    bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP"
}

/// Whether the sniffed extension names a container that can hold motion.
#[must_use]
pub fn is_video_extension(ext: &str) -> bool {
    matches!(ext, "mp4" | "mov" | "webm")
}
