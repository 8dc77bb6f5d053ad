//! Scheduler and per-entry pipeline
//!
//! A fixed pool of workers claims entries by index from a shared counter and
//! drives each one end to end:
//!
//! ```text
//! skip check → fetch base (+ overlay) → OCR → compose → embed metadata → place
//! ```
//!
//! Workers send `(index, result)` back over a channel; only the owning task
//! touches [`RunStats`] and the result vector, which is filled by index so
//! the output order matches the manifest regardless of completion order.

use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context};
use bytes::Bytes;
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::compose::Compositor;
use crate::config::{Config, OverlayMode};
use crate::error::{EntryError, MemoryError};
use crate::fetch::Fetch;
use crate::manifest::{Manifest, MediaKind, MemoryEntry, ParsedEntry};
use crate::metadata::MetadataEmbedder;
use crate::ocr::{OverlayTextReader, TesseractExtractor, TextExtractor};
use crate::output::{OutputPlacer, Variant};
use crate::stats::RunStats;
use crate::transcode::{sniff_extension, FfmpegTranscoder, Transcoder};

/// Outcome of one entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Status {
    Downloaded,
    SkippedExisting,
    Failed,
}

/// Result of driving one entry through the pipeline.
///
/// `error` is set exactly when `status` is [`Status::Failed`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessingResult {
    /// `None` only for records that failed to parse
    pub entry_id: Option<String>,
    pub status: Status,
    /// Produced files, plain variant first
    pub output_paths: Vec<PathBuf>,
    pub error: Option<EntryError>,
    pub extracted_text: Option<String>,
    pub bytes_fetched: u64,
    pub media_kind: Option<MediaKind>,
    pub overlay_applied: bool,
    pub metadata_warning: Option<String>,
}

impl ProcessingResult {
    fn for_entry(entry: &MemoryEntry, status: Status, output_paths: Vec<PathBuf>) -> Self {
        Self {
            entry_id: Some(entry.id.clone()),
            status,
            output_paths,
            error: None,
            extracted_text: None,
            bytes_fetched: 0,
            media_kind: Some(entry.media_kind),
            overlay_applied: false,
            metadata_warning: None,
        }
    }

    pub fn downloaded(entry: &MemoryEntry, output_paths: Vec<PathBuf>) -> Self {
        Self::for_entry(entry, Status::Downloaded, output_paths)
    }

    pub fn skipped(entry: &MemoryEntry, output_paths: Vec<PathBuf>) -> Self {
        Self::for_entry(entry, Status::SkippedExisting, output_paths)
    }

    pub fn failed(entry: &MemoryEntry, error: &MemoryError) -> Self {
        let mut result = Self::for_entry(entry, Status::Failed, Vec::new());
        result.error = Some(EntryError::from(error));
        result
    }

    /// Result for a record that never became a [`MemoryEntry`]
    pub fn failed_unparsed(error: EntryError) -> Self {
        Self {
            entry_id: None,
            status: Status::Failed,
            output_paths: Vec::new(),
            error: Some(error),
            extracted_text: None,
            bytes_fetched: 0,
            media_kind: None,
            overlay_applied: false,
            metadata_warning: None,
        }
    }

    #[must_use]
    pub fn with_extracted_text(mut self, text: Option<String>) -> Self {
        self.extracted_text = text;
        self
    }

    pub fn is_failed(&self) -> bool {
        self.status == Status::Failed
    }
}

/// The stages one entry passes through
pub struct Pipeline {
    fetcher: Arc<dyn Fetch>,
    compositor: Compositor,
    embedder: MetadataEmbedder,
    text_reader: Option<OverlayTextReader>,
    placer: OutputPlacer,
    mode: OverlayMode,
    copy_overlays: bool,
}

impl Pipeline {
    pub fn new(
        config: &Config,
        fetcher: Arc<dyn Fetch>,
        transcoder: Option<Arc<dyn Transcoder>>,
        text_reader: Option<OverlayTextReader>,
    ) -> Self {
        Self {
            fetcher,
            compositor: Compositor::new(transcoder.clone(), config.overlay_track, config.jpeg_quality),
            embedder: MetadataEmbedder::new(
                transcoder,
                config.embed_metadata,
                config.software_tag.clone(),
            ),
            text_reader: if config.extract_text { text_reader } else { None },
            placer: OutputPlacer::from_config(config),
            mode: config.overlay_mode,
            copy_overlays: config.copy_overlays,
        }
    }

    pub fn placer(&self) -> &OutputPlacer {
        &self.placer
    }

    /// Drive one entry through every stage. Never panics on entry-level
    /// failures; they come back as a failed result.
    #[instrument(skip_all, fields(entry = %entry.id))]
    pub async fn process(&self, entry: &MemoryEntry) -> ProcessingResult {
        let plan = self.placer.plan(entry);
        let pending = self.placer.pending(entry);
        if pending.is_empty() {
            debug!("All outputs exist, skipping");
            return ProcessingResult::skipped(entry, plan.into_iter().map(|(_, p)| p).collect());
        }

        let mut result = ProcessingResult::downloaded(entry, Vec::new());
        match self.run_stages(entry, &pending, &mut result).await {
            Ok(()) => {
                result.output_paths = plan.into_iter().map(|(_, p)| p).collect();
            }
            Err(err) => {
                warn!("Entry failed: {err}");
                result.status = Status::Failed;
                result.error = Some(EntryError::from(&err));
            }
        }
        result
    }

    async fn run_stages(
        &self,
        entry: &MemoryEntry,
        pending: &[(Variant, PathBuf)],
        result: &mut ProcessingResult,
    ) -> Result<(), MemoryError> {
        let base = self.fetcher.fetch(entry.base_url()).await?;
        result.bytes_fetched += base.len() as u64;

        let overlay = match entry.overlay_url() {
            Some(url) if self.mode.wants_overlay() => {
                let bytes = self.fetcher.fetch(url).await?;
                result.bytes_fetched += bytes.len() as u64;
                Some(bytes)
            }
            _ => None,
        };

        if let (Some(overlay), Some(reader)) = (&overlay, &self.text_reader) {
            match reader.read(overlay.clone()).await {
                Ok(text) => result.extracted_text = Some(text),
                Err(err) => warn!("Text extraction failed: {err}"),
            }
        }

        if let (Some(overlay), true) = (&overlay, self.copy_overlays) {
            let ext = sniff_extension(overlay);
            let ext = if ext == "bin" { "png" } else { ext };
            self.placer
                .place_overlay_copy(entry, overlay.clone(), ext)
                .await?;
        }

        for (variant, path) in pending {
            let media = match variant {
                Variant::Plain => base.clone(),
                Variant::Overlayed => {
                    let Some(ref overlay) = overlay else {
                        return Err(MemoryError::Internal("overlay variant without overlay".into()));
                    };
                    let merged = self
                        .compositor
                        .compose(base.clone(), overlay.clone(), entry.media_kind)
                        .await;
                    match merged {
                        Ok(bytes) => {
                            result.overlay_applied = true;
                            bytes
                        }
                        Err(err) => {
                            // `with` has no plain variant, so its path gets the base media.
                            // A later run skips it like any existing output.
                            if self.mode == OverlayMode::With {
                                warn!("Composition failed, keeping base media: {err}");
                                let media = self.embed_or_warn(entry, base.clone(), result).await;
                                self.placer.place(entry, path, media).await?;
                            }
                            // Plain outputs placed so far stay; the entry still fails.
                            result.output_paths = self.existing_outputs(entry);
                            return Err(err);
                        }
                    }
                }
            };

            let media = self.embed_or_warn(entry, media, result).await;
            self.placer.place(entry, path, media).await?;
            result.output_paths.push(path.clone());
        }

        Ok(())
    }

    /// Metadata failures keep the untagged bytes.
    async fn embed_or_warn(
        &self,
        entry: &MemoryEntry,
        media: Bytes,
        result: &mut ProcessingResult,
    ) -> Bytes {
        if !self.embedder.is_enabled() {
            return media;
        }
        match self
            .embedder
            .embed(media.clone(), entry.captured_at, entry.location, entry.media_kind)
            .await
        {
            Ok(tagged) => tagged,
            Err(err) => {
                warn!("Writing without metadata: {err}");
                result.metadata_warning = Some(err.to_string());
                media
            }
        }
    }

    fn existing_outputs(&self, entry: &MemoryEntry) -> Vec<PathBuf> {
        self.placer
            .plan(entry)
            .into_iter()
            .map(|(_, p)| p)
            .filter(|p| p.exists())
            .collect()
    }
}

/// Bounded worker pool over a [`Pipeline`]
pub struct Scheduler {
    pipeline: Arc<Pipeline>,
    concurrency: usize,
    cancel: CancellationToken,
}

impl Scheduler {
    pub fn new(pipeline: Pipeline, concurrency: usize) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
            concurrency: concurrency.max(1),
            cancel: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn with_cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Token that aborts the run: unstarted entries become `Cancelled`,
    /// in-flight ones are abandoned (staged files never become visible).
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Process every entry; results come back in input order.
    pub async fn run(&self, entries: Vec<ParsedEntry>, stats: &mut RunStats) -> Vec<ProcessingResult> {
        let total = entries.len();
        if total == 0 {
            return Vec::new();
        }

        let entries = Arc::new(entries);
        let next = Arc::new(AtomicUsize::new(0));
        let (tx, mut rx) = mpsc::unbounded_channel::<(usize, ProcessingResult)>();
        let mut workers = JoinSet::new();

        for _ in 0..self.concurrency.min(total) {
            let entries = Arc::clone(&entries);
            let next = Arc::clone(&next);
            let pipeline = Arc::clone(&self.pipeline);
            let cancel = self.cancel.clone();
            let tx = tx.clone();

            workers.spawn(async move {
                loop {
                    let index = next.fetch_add(1, Ordering::SeqCst);
                    let Some(parsed) = entries.get(index) else {
                        break;
                    };
                    let result = process_claimed(&pipeline, parsed, &cancel).await;
                    if tx.send((index, result)).is_err() {
                        break;
                    }
                }
            });
        }
        drop(tx);

        let mut slots: Vec<Option<ProcessingResult>> = vec![None; total];
        while let Some((index, result)) = rx.recv().await {
            stats.record(&result);
            slots[index] = Some(result);
        }
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!("Worker task ended abnormally: {e}");
            }
        }

        slots
            .into_iter()
            .map(|slot| {
                slot.unwrap_or_else(|| {
                    let result = ProcessingResult::failed_unparsed(EntryError::from(
                        MemoryError::Internal("no result produced".into()),
                    ));
                    stats.record(&result);
                    result
                })
            })
            .collect()
    }

    /// Run the manifest and, when `enriched` is given, write the enriched
    /// manifest once every entry is done.
    pub async fn run_manifest(
        &self,
        manifest: &Manifest,
        enriched: Option<&Path>,
        stats: &mut RunStats,
    ) -> Vec<ProcessingResult> {
        let results = self.run(manifest.entries(), stats).await;
        if let Some(path) = enriched {
            match manifest.write_enriched(&results, path).await {
                Ok(()) => info!("Enriched manifest written to {}", path.display()),
                Err(err) => {
                    error!("Enriched manifest not written: {err}");
                    stats.record_run_error(format!("enriched manifest: {err}"));
                }
            }
        }
        results
    }
}

async fn process_claimed(
    pipeline: &Pipeline,
    parsed: &ParsedEntry,
    cancel: &CancellationToken,
) -> ProcessingResult {
    let entry = match parsed {
        Ok(entry) => entry,
        Err(error) => return ProcessingResult::failed_unparsed(error.clone()),
    };
    if cancel.is_cancelled() {
        return ProcessingResult::failed(entry, &MemoryError::Cancelled);
    }

    let guarded = AssertUnwindSafe(pipeline.process(entry)).catch_unwind();
    tokio::select! {
        outcome = guarded => outcome.unwrap_or_else(|panic| {
            let message = panic
                .downcast_ref::<&str>()
                .map(ToString::to_string)
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(entry = %entry.id, "Pipeline panicked: {message}");
            ProcessingResult::failed(entry, &MemoryError::Internal(message))
        }),
        () = cancel.cancelled() => ProcessingResult::failed(entry, &MemoryError::Cancelled),
    }
}

/// External tools resolved before any entry is scheduled
pub struct Preflight {
    pub transcoder: Option<Arc<dyn Transcoder>>,
    pub text_reader: Option<OverlayTextReader>,
}

/// Validate configuration and resolve external tools.
///
/// Fails once, up front, when a required tool is missing instead of letting
/// every entry fail the same way.
pub async fn preflight(config: &Config) -> anyhow::Result<Preflight> {
    config.validate()?;

    let ffmpeg = FfmpegTranscoder::locate(
        config.ffmpeg_path.as_deref(),
        config.concurrency,
        config.transcode_timeout(),
    );
    let transcoder: Option<Arc<dyn Transcoder>> = match ffmpeg.check_available().await {
        Ok(path) => {
            info!("ffmpeg found at {}", path.display());
            Some(Arc::new(ffmpeg))
        }
        Err(err) if config.overlay_mode.wants_overlay() => {
            bail!("ffmpeg is required for overlay mode but is not usable: {err}");
        }
        Err(err) => {
            warn!("ffmpeg not usable ({err}); video metadata will not be written");
            None
        }
    };

    let text_reader = if config.extract_text {
        let program = config
            .tesseract_path
            .clone()
            .unwrap_or_else(|| PathBuf::from("tesseract"));
        let engine = TesseractExtractor::new(program, &config.ocr_language, config.concurrency);
        let path = engine
            .check_available()
            .await
            .context("tesseract is required for text extraction")?;
        info!("tesseract found at {}", path.display());
        Some(OverlayTextReader::new(Arc::new(engine), transcoder.clone()))
    } else {
        None
    };

    tokio::fs::create_dir_all(&config.output_dir)
        .await
        .with_context(|| format!("IOError: cannot create {}", config.output_dir.display()))?;

    Ok(Preflight {
        transcoder,
        text_reader,
    })
}
