//! `memfetch` CLI - download exported memories with overlays and metadata

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use memfetch::{
    preflight, Config, HttpFetcher, Manifest, OverlayMode, OverlayNaming, OverlayTrackPolicy,
    Pipeline, RunStats, Scheduler,
};

#[derive(Parser)]
#[command(name = "memfetch")]
#[command(about = "Bulk downloader for exported memories: overlays, capture time, location")]
#[command(version)]
struct Cli {
    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Only warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download every memory in a manifest
    Download(DownloadArgs),

    /// List entries that have no usable location
    MissingLocations {
        /// Manifest JSON file
        manifest: PathBuf,

        /// Secondary manifest whose locations override the primary one
        #[arg(long)]
        locations: Option<PathBuf>,
    },
}

#[derive(Args)]
struct DownloadArgs {
    /// Manifest JSON file (e.g. memories_history.json)
    manifest: PathBuf,

    /// Output directory
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Number of concurrent workers
    #[arg(long)]
    concurrent: Option<usize>,

    /// Which variants to write for entries with an overlay
    #[arg(long, value_enum)]
    overlay: Option<OverlayMode>,

    /// Where plain and overlayed files go under `--overlay both`
    #[arg(long, value_enum)]
    overlay_naming: Option<OverlayNaming>,

    /// Behaviour when a video overlay is shorter than the base video
    #[arg(long, value_enum)]
    overlay_track: Option<OverlayTrackPolicy>,

    /// Path to the ffmpeg executable
    #[arg(long)]
    ffmpeg_path: Option<PathBuf>,

    /// Do not embed capture time or location
    #[arg(long)]
    no_exif: bool,

    /// Re-download entries whose outputs already exist
    #[arg(long)]
    no_skip_existing: bool,

    /// Filename prefix
    #[arg(long)]
    prefix: Option<String>,

    /// Extract overlay text into an enriched manifest
    #[arg(long)]
    ocr_metadata: bool,

    /// Keep raw overlay assets in `overlays/` (requires `--overlay both`)
    #[arg(long)]
    copy_overlays: bool,

    /// Manifest with corrected locations, matched by entry key
    #[arg(long)]
    locations: Option<PathBuf>,

    /// Where to write the enriched manifest
    #[arg(long)]
    enriched_manifest: Option<PathBuf>,

    /// Config file (default: ~/.config/memfetch/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,
}

impl DownloadArgs {
    /// Layer CLI flags over the loaded config.
    fn apply(&self, config: &mut Config) {
        if let Some(ref output) = self.output {
            config.output_dir.clone_from(output);
        }
        if let Some(concurrent) = self.concurrent {
            config.concurrency = concurrent;
        }
        if let Some(mode) = self.overlay {
            config.overlay_mode = mode;
        }
        if let Some(naming) = self.overlay_naming {
            config.overlay_naming = naming;
        }
        if let Some(track) = self.overlay_track {
            config.overlay_track = track;
        }
        if self.ffmpeg_path.is_some() {
            config.ffmpeg_path.clone_from(&self.ffmpeg_path);
        }
        if self.no_exif {
            config.embed_metadata = false;
        }
        if self.no_skip_existing {
            config.skip_existing = false;
        }
        if let Some(ref prefix) = self.prefix {
            config.filename_prefix.clone_from(prefix);
        }
        if self.ocr_metadata {
            config.extract_text = true;
        }
        if self.copy_overlays {
            config.copy_overlays = true;
        }
        if self.enriched_manifest.is_some() {
            config.enriched_manifest.clone_from(&self.enriched_manifest);
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);

    let outcome = match cli.command {
        Commands::Download(args) => cmd_download(args).await,
        Commands::MissingLocations {
            manifest,
            locations,
        } => cmd_missing_locations(&manifest, locations.as_deref()).map(|()| true),
    };

    match outcome {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            eprintln!("❌ Error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: bool, quiet: bool) {
    let level = if verbose {
        "debug"
    } else if quiet {
        "warn"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("memfetch={level}")));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

/// Returns `Ok(false)` when the run finished with failed entries.
async fn cmd_download(args: DownloadArgs) -> Result<bool> {
    let mut config = Config::load(args.config.as_deref())?;
    args.apply(&mut config);

    let manifest = load_with_overrides(&args.manifest, args.locations.as_deref())?;
    let tools = preflight(&config).await?;

    let fetcher = Arc::new(HttpFetcher::new(config.fetch.clone())?);
    let pipeline = Pipeline::new(&config, fetcher, tools.transcoder, tools.text_reader);
    let scheduler = Scheduler::new(pipeline, config.concurrency);

    let cancel = scheduler.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, abandoning remaining entries");
            cancel.cancel();
        }
    });

    eprintln!(
        "📥 Downloading {} memories to {} ({} workers)",
        manifest.len(),
        config.output_dir.display(),
        config.concurrency
    );

    let enriched = config
        .extract_text
        .then(|| config.enriched_manifest_path(&args.manifest));
    let mut stats = RunStats::new();
    scheduler
        .run_manifest(&manifest, enriched.as_deref(), &mut stats)
        .await;

    eprintln!("\n📊 {}", stats.summary());
    Ok(!stats.has_failures())
}

fn cmd_missing_locations(manifest: &Path, locations: Option<&Path>) -> Result<()> {
    let manifest = load_with_overrides(manifest, locations)?;
    let missing = manifest.missing_locations();
    for entry in &missing {
        println!(
            "{}\t{}\t{}",
            entry.id,
            entry.captured_at.format("%Y-%m-%d %H:%M:%S UTC"),
            entry.media_kind
        );
    }
    eprintln!("{} of {} entries have no location", missing.len(), manifest.len());
    Ok(())
}

fn load_with_overrides(path: &Path, locations: Option<&Path>) -> Result<Manifest> {
    let mut manifest = Manifest::load(path)?;
    if let Some(locations) = locations {
        let overrides = Manifest::load(locations)?;
        let changed = manifest.apply_location_overrides(&overrides);
        info!("Applied {changed} location overrides from {}", locations.display());
    }
    Ok(manifest)
}
