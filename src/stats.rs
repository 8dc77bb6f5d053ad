//! Run statistics
//!
//! Owned by the scheduler's result loop and updated only there, one
//! [`ProcessingResult`] at a time.

use std::fmt::Write as _;
use std::time::{Duration, Instant};

use crate::error::{EntryError, ErrorKind};
use crate::manifest::MediaKind;
use crate::scheduler::{ProcessingResult, Status};

/// Aggregate counters for one run
#[derive(Debug, Clone)]
pub struct RunStats {
    pub downloaded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub composition_failures: usize,
    pub metadata_warnings: usize,
    pub texts_extracted: usize,
    pub bytes_fetched: u64,
    pub images: usize,
    pub images_with_overlay: usize,
    pub videos: usize,
    pub videos_with_overlay: usize,
    /// `(entry id, error)` per failed entry, in completion order
    pub failures: Vec<(String, EntryError)>,
    /// Failures outside any single entry (e.g. enriched manifest write)
    pub run_errors: Vec<String>,
    started: Instant,
}

impl Default for RunStats {
    fn default() -> Self {
        Self::new()
    }
}

impl RunStats {
    pub fn new() -> Self {
        Self {
            downloaded: 0,
            skipped: 0,
            failed: 0,
            composition_failures: 0,
            metadata_warnings: 0,
            texts_extracted: 0,
            bytes_fetched: 0,
            images: 0,
            images_with_overlay: 0,
            videos: 0,
            videos_with_overlay: 0,
            failures: Vec::new(),
            run_errors: Vec::new(),
            started: Instant::now(),
        }
    }

    pub fn record(&mut self, result: &ProcessingResult) {
        self.bytes_fetched += result.bytes_fetched;
        if result.metadata_warning.is_some() {
            self.metadata_warnings += 1;
        }
        if result.extracted_text.as_deref().is_some_and(|t| !t.is_empty()) {
            self.texts_extracted += 1;
        }

        match result.status {
            Status::Downloaded => {
                self.downloaded += 1;
                match (result.media_kind, result.overlay_applied) {
                    (Some(MediaKind::Image), false) => self.images += 1,
                    (Some(MediaKind::Image), true) => self.images_with_overlay += 1,
                    (Some(MediaKind::Video), false) => self.videos += 1,
                    (Some(MediaKind::Video), true) => self.videos_with_overlay += 1,
                    (None, _) => {}
                }
            }
            Status::SkippedExisting => self.skipped += 1,
            Status::Failed => {
                self.failed += 1;
                if let Some(ref error) = result.error {
                    if error.kind == ErrorKind::Composition {
                        self.composition_failures += 1;
                    }
                    let id = result
                        .entry_id
                        .clone()
                        .unwrap_or_else(|| "<unparsed entry>".to_string());
                    self.failures.push((id, error.clone()));
                }
            }
        }
    }

    pub fn record_run_error(&mut self, message: impl Into<String>) {
        self.run_errors.push(message.into());
    }

    pub fn total(&self) -> usize {
        self.downloaded + self.skipped + self.failed
    }

    /// True when any entry failed or a run-level step failed.
    pub fn has_failures(&self) -> bool {
        self.failed > 0 || !self.run_errors.is_empty()
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Human-readable end-of-run report.
    #[allow(clippy::cast_precision_loss)]
    pub fn summary(&self) -> String {
        let secs = self.elapsed().as_secs_f64();
        let mb = self.bytes_fetched as f64 / 1_048_576.0;
        let rate = if secs > 0.0 { mb / secs } else { 0.0 };

        let mut out = String::new();
        let _ = writeln!(
            out,
            "Processed {} entries in {secs:.1}s: {} downloaded, {} skipped, {} failed",
            self.total(),
            self.downloaded,
            self.skipped,
            self.failed
        );
        let _ = writeln!(out, "Fetched {mb:.1} MB ({rate:.2} MB/s)");
        let _ = writeln!(
            out,
            "Images: {} plain, {} with overlay | Videos: {} plain, {} with overlay",
            self.images, self.images_with_overlay, self.videos, self.videos_with_overlay
        );
        if self.composition_failures > 0 || self.metadata_warnings > 0 {
            let _ = writeln!(
                out,
                "Composition failures: {} | Metadata warnings: {}",
                self.composition_failures, self.metadata_warnings
            );
        }
        if self.texts_extracted > 0 {
            let _ = writeln!(out, "Overlay text extracted: {}", self.texts_extracted);
        }
        for (id, error) in &self.failures {
            let _ = writeln!(out, "  FAILED {id}: {error}");
        }
        for message in &self.run_errors {
            let _ = writeln!(out, "  ERROR {message}");
        }
        out
    }
}
