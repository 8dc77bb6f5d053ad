//! Overlay compositor
//!
//! Images are blended in-process with the `image` crate; videos are handed to
//! the [`Transcoder`]. The caller picks the path via [`MediaKind`] once per
//! entry.

use std::io::Cursor;
use std::sync::Arc;

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::{DynamicImage, ImageFormat};
use tracing::{debug, warn};

use crate::config::OverlayTrackPolicy;
use crate::error::MemoryError;
use crate::manifest::MediaKind;
use crate::transcode::{is_webp, sniff_extension, TranscodeError, TranscodeRequest, Transcoder};

/// Merges overlay assets onto base media
#[derive(Clone)]
pub struct Compositor {
    transcoder: Option<Arc<dyn Transcoder>>,
    track: OverlayTrackPolicy,
    jpeg_quality: u8,
}

impl Compositor {
    pub fn new(
        transcoder: Option<Arc<dyn Transcoder>>,
        track: OverlayTrackPolicy,
        jpeg_quality: u8,
    ) -> Self {
        Self {
            transcoder,
            track,
            jpeg_quality,
        }
    }

    /// Composite `overlay` onto `base`.
    ///
    /// Fails with [`MemoryError::Composition`] when either asset cannot be
    /// decoded, or for video when the transcoder is missing or fails.
    pub async fn compose(
        &self,
        base: Bytes,
        overlay: Bytes,
        kind: MediaKind,
    ) -> Result<Bytes, MemoryError> {
        match kind {
            MediaKind::Image => {
                let quality = self.jpeg_quality;
                tokio::task::spawn_blocking(move || composite_image(&base, &overlay, quality))
                    .await
                    .map_err(|e| MemoryError::Internal(format!("image composite task: {e}")))?
            }
            MediaKind::Video => self.compose_video(base, overlay).await,
        }
    }

    async fn compose_video(&self, base: Bytes, overlay: Bytes) -> Result<Bytes, MemoryError> {
        let Some(transcoder) = self.transcoder.as_ref() else {
            return Err(MemoryError::Composition(
                "video overlay requires ffmpeg, which is not available".into(),
            ));
        };

        match self.run_composite(transcoder.as_ref(), &base, &overlay).await {
            Err(TranscodeError::Failed { .. }) if is_webp(&overlay) => {
                // Some WebP overlays use features ffmpeg's decoder rejects.
                warn!("ffmpeg rejected WebP overlay, retrying as PNG");
                let png = tokio::task::spawn_blocking(move || reencode_png(&overlay))
                    .await
                    .map_err(|e| MemoryError::Internal(format!("overlay re-encode task: {e}")))??;
                self.run_composite(transcoder.as_ref(), &base, &png)
                    .await
                    .map_err(|e| MemoryError::Composition(format!("after PNG re-encode: {e}")))
            }
            other => other.map_err(|e| MemoryError::Composition(e.to_string())),
        }
    }

    async fn run_composite(
        &self,
        transcoder: &dyn Transcoder,
        base: &Bytes,
        overlay: &Bytes,
    ) -> Result<Bytes, TranscodeError> {
        let overlay_ext = match sniff_extension(overlay) {
            "bin" => "png",
            ext => ext,
        };
        debug!(overlay_ext, track = ?self.track, "Compositing video overlay");
        transcoder
            .run(TranscodeRequest::Composite {
                base: base.clone(),
                overlay: overlay.clone(),
                overlay_ext,
                track: self.track,
            })
            .await?
            .into_single()
    }
}

/// Alpha-blend `overlay` (resized to the base dimensions) onto `base` and
/// encode the result as JPEG.
pub fn composite_image(base: &[u8], overlay: &[u8], quality: u8) -> Result<Bytes, MemoryError> {
    let base = image::load_from_memory(base)
        .map_err(|e| MemoryError::Composition(format!("cannot decode base image: {e}")))?;
    let overlay = image::load_from_memory(overlay)
        .map_err(|e| MemoryError::Composition(format!("cannot decode overlay: {e}")))?;

    let mut canvas = base.to_rgba8();
    let (width, height) = canvas.dimensions();
    let mut layer = overlay.to_rgba8();
    if layer.dimensions() != (width, height) {
        layer = imageops::resize(&layer, width, height, FilterType::Lanczos3);
    }
    imageops::overlay(&mut canvas, &layer, 0, 0);

    let rgb = DynamicImage::ImageRgba8(canvas).to_rgb8();
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, quality)
        .encode_image(&rgb)
        .map_err(|e| MemoryError::Composition(format!("JPEG encode failed: {e}")))?;
    Ok(Bytes::from(out))
}

/// Decode any supported still (first frame of animations) and re-encode as PNG.
pub fn reencode_png(bytes: &[u8]) -> Result<Bytes, MemoryError> {
    let decoded = image::load_from_memory(bytes)
        .map_err(|e| MemoryError::Composition(format!("cannot decode overlay: {e}")))?;
    let mut out = Cursor::new(Vec::new());
    decoded
        .write_to(&mut out, ImageFormat::Png)
        .map_err(|e| MemoryError::Composition(format!("PNG encode failed: {e}")))?;
    Ok(Bytes::from(out.into_inner()))
}
