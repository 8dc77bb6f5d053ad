//! `memfetch` - bulk downloader for exported memories
//!
//! # Features
//!
//! - **Bounded concurrency**: fixed worker pool, results in manifest order
//! - **Retrying fetcher**: per-attempt timeouts, backoff on transient errors
//! - **Overlays**: in-process image blending, ffmpeg video compositing
//! - **Metadata**: EXIF capture time and GPS for JPEG, container tags for video
//! - **OCR**: overlay caption text into an enriched manifest
//! - **Idempotent output**: skip-existing checks and atomic writes
//!
//! # Example
//!
//! ```rust,no_run
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! use memfetch::{preflight, Config, HttpFetcher, Manifest, Pipeline, RunStats, Scheduler};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::default();
//!     let manifest = Manifest::load(Path::new("memories_history.json"))?;
//!     let tools = preflight(&config).await?;
//!     let fetcher = Arc::new(HttpFetcher::new(config.fetch.clone())?);
//!     let pipeline = Pipeline::new(&config, fetcher, tools.transcoder, tools.text_reader);
//!
//!     let mut stats = RunStats::new();
//!     Scheduler::new(pipeline, config.concurrency)
//!         .run_manifest(&manifest, None, &mut stats)
//!         .await;
//!     println!("{}", stats.summary());
//!     Ok(())
//! }
//! ```

pub mod compose;
pub mod config;
pub mod error;
pub mod fetch;
pub mod manifest;
pub mod metadata;
pub mod ocr;
pub mod output;
pub mod scheduler;
pub mod stats;
pub mod transcode;

pub use compose::Compositor;
pub use config::{Config, FetchSettings, OverlayMode, OverlayNaming, OverlayTrackPolicy};
pub use error::{EntryError, ErrorKind, MemoryError};
pub use fetch::{Fetch, HttpFetcher};
pub use manifest::{Location, Manifest, MediaKind, MemoryEntry, ParsedEntry};
pub use metadata::MetadataEmbedder;
pub use ocr::{OverlayTextReader, TesseractExtractor, TextExtractor};
pub use output::{OutputPlacer, Variant};
pub use scheduler::{preflight, Pipeline, Preflight, ProcessingResult, Scheduler, Status};
pub use stats::RunStats;
pub use transcode::{FfmpegTranscoder, TranscodeRequest, Transcoder};

/// Version of memfetch
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
