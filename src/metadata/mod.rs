//! Metadata embedder
//!
//! Writes capture time and location into the media's native container:
//! EXIF for JPEG images (in-process, no pixel re-encode) and container tags
//! for video (transcoder stream copy). Callers treat every error here as a
//! warning and keep the untagged bytes.

pub mod exif;

use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use tracing::debug;

use crate::error::MemoryError;
use crate::manifest::{Location, MediaKind};
use crate::transcode::{TranscodeRequest, Transcoder};

/// Embeds capture metadata into fetched or composited media
#[derive(Clone)]
pub struct MetadataEmbedder {
    transcoder: Option<Arc<dyn Transcoder>>,
    enabled: bool,
    software_tag: Option<String>,
}

impl MetadataEmbedder {
    pub fn new(
        transcoder: Option<Arc<dyn Transcoder>>,
        enabled: bool,
        software_tag: Option<String>,
    ) -> Self {
        Self {
            transcoder,
            enabled,
            software_tag,
        }
    }

    /// An embedder that passes bytes through untouched
    pub fn disabled() -> Self {
        Self::new(None, false, None)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Return `media` with metadata embedded, or unchanged when disabled.
    pub async fn embed(
        &self,
        media: Bytes,
        captured_at: DateTime<Utc>,
        location: Option<Location>,
        kind: MediaKind,
    ) -> Result<Bytes, MemoryError> {
        if !self.enabled {
            return Ok(media);
        }

        match kind {
            MediaKind::Image => {
                let software = self.software_tag.clone();
                tokio::task::spawn_blocking(move || {
                    exif::embed_jpeg(&media, captured_at, location, software.as_deref())
                })
                .await
                .map_err(|e| MemoryError::Internal(format!("EXIF task: {e}")))?
                .map(Bytes::from)
            }
            MediaKind::Video => {
                let Some(transcoder) = self.transcoder.as_ref() else {
                    return Err(MemoryError::Metadata(
                        "video metadata requires ffmpeg, which is not available".into(),
                    ));
                };
                let tags = video_tags(captured_at, location, self.software_tag.as_deref());
                debug!(tags = tags.len(), "Rewriting video container tags");
                transcoder
                    .run(TranscodeRequest::RewriteMetadata { input: media, tags })
                    .await
                    .and_then(crate::transcode::TranscodeOutput::into_single)
                    .map_err(|e| MemoryError::Metadata(e.to_string()))
            }
        }
    }
}

/// Container tags for a video: creation time, optional creator, and the
/// location in the forms QuickTime readers look for.
pub fn video_tags(
    captured_at: DateTime<Utc>,
    location: Option<Location>,
    software: Option<&str>,
) -> Vec<(String, String)> {
    let mut tags = vec![(
        "creation_time".to_string(),
        captured_at.to_rfc3339_opts(SecondsFormat::Millis, true),
    )];
    if let Some(software) = software {
        tags.push(("©too".to_string(), software.to_string()));
    }
    if let Some(location) = location {
        let iso = iso6709(location);
        tags.push(("location".to_string(), iso.clone()));
        tags.push(("location-eng".to_string(), iso));
    }
    tags
}

/// ISO 6709 point string, e.g. `+52.3702+004.8952+0.000/`
pub fn iso6709(location: Location) -> String {
    format!(
        "{:+08.4}{:+09.4}+0.000/",
        location.latitude, location.longitude
    )
}
