//! End-to-end pipeline tests with in-process fakes for the network,
//! the transcoder and the OCR engine.

use std::collections::HashMap;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage, Rgba, RgbaImage};

use memfetch::metadata::exif;
use memfetch::ocr::OcrError;
use memfetch::transcode::{TranscodeError, TranscodeOutput};
use memfetch::{
    Config, ErrorKind, Fetch, Manifest, MemoryError, OverlayMode, OverlayNaming,
    OverlayTextReader, Pipeline, RunStats, Scheduler, Status, TextExtractor, TranscodeRequest,
    Transcoder,
};

// ─── Fakes ───────────────────────────────────────────────────────────────────

#[derive(Default)]
struct FakeCdn {
    bodies: HashMap<String, Bytes>,
    requests: Mutex<Vec<String>>,
}

impl FakeCdn {
    fn serve(mut self, url: &str, body: Vec<u8>) -> Self {
        self.bodies.insert(url.to_string(), Bytes::from(body));
        self
    }

    fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl Fetch for FakeCdn {
    async fn fetch(&self, url: &str) -> Result<Bytes, MemoryError> {
        self.requests.lock().unwrap().push(url.to_string());
        self.bodies
            .get(url)
            .cloned()
            .ok_or_else(|| MemoryError::network(url, "HTTP 403 Forbidden"))
    }
}

/// Appends a marker instead of really compositing; metadata rewrites pass through.
struct FakeFfmpeg {
    fail_composite: bool,
}

#[async_trait]
impl Transcoder for FakeFfmpeg {
    fn name(&self) -> &str {
        "fake-ffmpeg"
    }

    async fn check_available(&self) -> memfetch::transcode::Result<PathBuf> {
        Ok(PathBuf::from("/usr/bin/fake-ffmpeg"))
    }

    async fn run(&self, request: TranscodeRequest) -> memfetch::transcode::Result<TranscodeOutput> {
        match request {
            TranscodeRequest::Composite { .. } if self.fail_composite => Err(TranscodeError::Failed {
                program: "fake-ffmpeg".into(),
                status: "exit status: 1".into(),
                stderr: "Invalid data found when processing input".into(),
            }),
            TranscodeRequest::Composite { base, .. } => {
                let mut out = base.to_vec();
                out.extend_from_slice(b"+overlay");
                Ok(TranscodeOutput::single(Bytes::from(out)))
            }
            TranscodeRequest::RewriteMetadata { input, .. } => Ok(TranscodeOutput::single(input)),
            TranscodeRequest::SampleFrames { .. } => Ok(TranscodeOutput::default()),
        }
    }
}

struct FixedOcr(&'static str);

#[async_trait]
impl TextExtractor for FixedOcr {
    fn name(&self) -> &str {
        "fixed"
    }

    async fn check_available(&self) -> Result<PathBuf, OcrError> {
        Ok(PathBuf::from("/usr/bin/fixed"))
    }

    async fn extract(&self, _png: Bytes) -> Result<String, OcrError> {
        Ok(self.0.to_string())
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn jpeg(width: u32, height: u32) -> Vec<u8> {
    let img = RgbImage::from_pixel(width, height, Rgb([40, 90, 160]));
    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(img)
        .write_to(&mut out, ImageFormat::Jpeg)
        .unwrap();
    out.into_inner()
}

/// Transparent PNG with an opaque white band across the middle.
fn caption_png(width: u32, height: u32) -> Vec<u8> {
    let img = RgbaImage::from_fn(width, height, |_, y| {
        if y > height / 3 && y < 2 * height / 3 {
            Rgba([255, 255, 255, 255])
        } else {
            Rgba([0, 0, 0, 0])
        }
    });
    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageRgba8(img)
        .write_to(&mut out, ImageFormat::Png)
        .unwrap();
    out.into_inner()
}

fn config(dir: &Path, mode: OverlayMode, naming: OverlayNaming) -> Config {
    Config {
        output_dir: dir.to_path_buf(),
        concurrency: 4,
        overlay_mode: mode,
        overlay_naming: naming,
        ..Config::default()
    }
}

fn scheduler(
    config: &Config,
    cdn: Arc<FakeCdn>,
    ffmpeg: Option<Arc<dyn Transcoder>>,
    ocr: Option<OverlayTextReader>,
) -> Scheduler {
    let pipeline = Pipeline::new(config, cdn, ffmpeg, ocr);
    Scheduler::new(pipeline, config.concurrency)
}

const IMAGE_WITH_OVERLAY: &str = r#"[
    {"Date": "2023-07-14 12:30:05 UTC", "Media Type": "Image",
     "Location": "Latitude, Longitude: 52.3702, 4.8952",
     "Media Download Url": "https://cdn.test/a.jpg",
     "Overlay Download Url": "https://cdn.test/a-overlay.png"}
]"#;

fn image_cdn() -> FakeCdn {
    FakeCdn::default()
        .serve("https://cdn.test/a.jpg", jpeg(64, 48))
        .serve("https://cdn.test/a-overlay.png", caption_png(32, 24))
}

// ─── Overlay naming ──────────────────────────────────────────────────────────

#[tokio::test]
async fn both_separate_folders_writes_one_file_per_subfolder() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), OverlayMode::Both, OverlayNaming::SeparateFolders);
    let manifest = Manifest::from_json(IMAGE_WITH_OVERLAY).unwrap();
    let cdn = Arc::new(image_cdn());

    let mut stats = RunStats::new();
    let results = scheduler(&config, cdn, None, None)
        .run_manifest(&manifest, None, &mut stats)
        .await;

    let plain = dir.path().join("without_overlays/2023-07-14_12-30-05.jpg");
    let overlayed = dir.path().join("with_overlays/2023-07-14_12-30-05.jpg");
    assert_eq!(results[0].status, Status::Downloaded);
    assert_eq!(results[0].output_paths, vec![plain.clone(), overlayed.clone()]);
    assert!(results[0].overlay_applied);

    let plain_img = image::open(&plain).unwrap();
    let overlayed_img = image::open(&overlayed).unwrap();
    assert_eq!(plain_img.to_rgb8().dimensions(), (64, 48));
    assert_eq!(overlayed_img.to_rgb8().dimensions(), (64, 48));
    // The white caption band only shows up in the composited variant.
    assert!(overlayed_img.to_rgb8().get_pixel(32, 24)[0] > 200);
    assert!(plain_img.to_rgb8().get_pixel(32, 24)[0] < 100);

    assert_eq!(stats.images_with_overlay, 1);
    assert!(!stats.has_failures());
}

#[tokio::test]
async fn both_single_folder_differs_only_by_suffix() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), OverlayMode::Both, OverlayNaming::SingleFolder);
    let manifest = Manifest::from_json(IMAGE_WITH_OVERLAY).unwrap();

    let mut stats = RunStats::new();
    scheduler(&config, Arc::new(image_cdn()), None, None)
        .run_manifest(&manifest, None, &mut stats)
        .await;

    let mut names: Vec<String> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    assert_eq!(
        names,
        vec![
            "2023-07-14_12-30-05.jpg".to_string(),
            "2023-07-14_12-30-05_overlayed.jpg".to_string(),
        ]
    );
}

#[tokio::test]
async fn with_mode_writes_only_composite() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), OverlayMode::With, OverlayNaming::SeparateFolders);
    let manifest = Manifest::from_json(IMAGE_WITH_OVERLAY).unwrap();

    let mut stats = RunStats::new();
    let results = scheduler(&config, Arc::new(image_cdn()), None, None)
        .run_manifest(&manifest, None, &mut stats)
        .await;

    assert_eq!(
        results[0].output_paths,
        vec![dir.path().join("2023-07-14_12-30-05.jpg")]
    );
    assert!(results[0].overlay_applied);
}

// ─── Metadata and placement ──────────────────────────────────────────────────

#[tokio::test]
async fn placed_image_carries_location_and_capture_mtime() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), OverlayMode::None, OverlayNaming::SeparateFolders);
    let manifest = Manifest::from_json(IMAGE_WITH_OVERLAY).unwrap();
    let cdn = Arc::new(image_cdn());

    let mut stats = RunStats::new();
    scheduler(&config, Arc::clone(&cdn), None, None)
        .run_manifest(&manifest, None, &mut stats)
        .await;

    // Overlay is never fetched when overlays are off.
    assert_eq!(cdn.request_count(), 1);

    let path = dir.path().join("2023-07-14_12-30-05.jpg");
    let bytes = std::fs::read(&path).unwrap();
    let location = exif::read_location(&bytes).expect("GPS tags written");
    assert!((location.latitude - 52.3702).abs() < 1e-3);
    assert!((location.longitude - 4.8952).abs() < 1e-3);

    let entry = manifest.entries()[0].clone().unwrap();
    let mtime = std::fs::metadata(&path).unwrap().modified().unwrap();
    assert_eq!(mtime, SystemTime::from(entry.captured_at));
}

#[tokio::test]
async fn metadata_failure_keeps_untagged_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), OverlayMode::None, OverlayNaming::SeparateFolders);
    let manifest = Manifest::from_json(
        r#"[{"Date": "2023-07-14 12:30:05 UTC", "Media Type": "Image",
             "Media Download Url": "https://cdn.test/odd.jpg"}]"#,
    )
    .unwrap();
    // PNG served where a JPEG was expected
    let body = caption_png(8, 8);
    let cdn = Arc::new(FakeCdn::default().serve("https://cdn.test/odd.jpg", body.clone()));

    let mut stats = RunStats::new();
    let results = scheduler(&config, cdn, None, None)
        .run_manifest(&manifest, None, &mut stats)
        .await;

    assert_eq!(results[0].status, Status::Downloaded);
    assert!(results[0].metadata_warning.is_some());
    assert_eq!(stats.metadata_warnings, 1);
    let written = std::fs::read(dir.path().join("2023-07-14_12-30-05.jpg")).unwrap();
    assert_eq!(written, body);
}

// ─── Idempotence ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn rerun_skips_without_fetching() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), OverlayMode::Both, OverlayNaming::SeparateFolders);
    let manifest = Manifest::from_json(IMAGE_WITH_OVERLAY).unwrap();
    let cdn = Arc::new(image_cdn());
    let scheduler = scheduler(&config, Arc::clone(&cdn), None, None);

    let mut first = RunStats::new();
    scheduler.run_manifest(&manifest, None, &mut first).await;
    assert_eq!(first.downloaded, 1);
    let fetched = cdn.request_count();

    let mut second = RunStats::new();
    let results = scheduler.run_manifest(&manifest, None, &mut second).await;
    assert_eq!(cdn.request_count(), fetched);
    assert_eq!(second.skipped, 1);
    assert_eq!(results[0].status, Status::SkippedExisting);
    assert_eq!(results[0].output_paths.len(), 2);
}

#[tokio::test]
async fn no_skip_existing_overwrites() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path(), OverlayMode::None, OverlayNaming::SeparateFolders);
    config.skip_existing = false;
    let manifest = Manifest::from_json(IMAGE_WITH_OVERLAY).unwrap();
    let cdn = Arc::new(image_cdn());
    let scheduler = scheduler(&config, Arc::clone(&cdn), None, None);

    let mut stats = RunStats::new();
    scheduler.run_manifest(&manifest, None, &mut stats).await;
    scheduler.run_manifest(&manifest, None, &mut stats).await;
    assert_eq!(cdn.request_count(), 2);
    assert_eq!(stats.downloaded, 2);
    assert_eq!(stats.skipped, 0);
}

// ─── Failure isolation ───────────────────────────────────────────────────────

#[tokio::test]
async fn expired_url_fails_only_its_entry() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), OverlayMode::None, OverlayNaming::SeparateFolders);
    let manifest = Manifest::from_json(
        r#"[
            {"Date": "2023-01-01 00:00:01 UTC", "Media Type": "Image",
             "Media Download Url": "https://cdn.test/1.jpg"},
            {"Date": "2023-01-01 00:00:02 UTC", "Media Type": "Image",
             "Media Download Url": "https://cdn.test/expired.jpg?Signature=abc"},
            {"Date": "2023-01-01 00:00:03 UTC", "Media Type": "Image",
             "Media Download Url": "https://cdn.test/3.jpg"}
        ]"#,
    )
    .unwrap();
    let cdn = Arc::new(
        FakeCdn::default()
            .serve("https://cdn.test/1.jpg", jpeg(8, 8))
            .serve("https://cdn.test/3.jpg", jpeg(8, 8)),
    );

    let mut stats = RunStats::new();
    let results = scheduler(&config, cdn, None, None)
        .run_manifest(&manifest, None, &mut stats)
        .await;

    let ids: Vec<_> = results.iter().map(|r| r.entry_id.clone().unwrap()).collect();
    assert_eq!(
        ids,
        ["2023-01-01_00-00-01", "2023-01-01_00-00-02", "2023-01-01_00-00-03"]
    );
    assert_eq!(results[0].status, Status::Downloaded);
    assert_eq!(results[2].status, Status::Downloaded);

    let error = results[1].error.as_ref().unwrap();
    assert_eq!(error.kind, ErrorKind::Network);
    assert!(!error.message.contains("abc"));
    assert!(results[1].output_paths.is_empty());
    assert!(!dir.path().join("2023-01-01_00-00-02.jpg").exists());
    assert_eq!((stats.downloaded, stats.failed), (2, 1));
}

#[tokio::test]
async fn composition_failure_keeps_plain_variant() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), OverlayMode::Both, OverlayNaming::SingleFolder);
    let manifest = Manifest::from_json(
        r#"[{"Date": "2023-07-15 08:00:00 UTC", "Media Type": "Video",
             "Media Download Url": "https://cdn.test/v.mp4",
             "Overlay Download Url": "https://cdn.test/v-overlay.png"}]"#,
    )
    .unwrap();
    let cdn = Arc::new(
        FakeCdn::default()
            .serve("https://cdn.test/v.mp4", b"base-video".to_vec())
            .serve("https://cdn.test/v-overlay.png", caption_png(8, 8)),
    );
    let plain = dir.path().join("2023-07-15_08-00-00.mp4");
    let overlayed = dir.path().join("2023-07-15_08-00-00_overlayed.mp4");

    let broken: Arc<dyn Transcoder> = Arc::new(FakeFfmpeg {
        fail_composite: true,
    });
    let mut stats = RunStats::new();
    let results = scheduler(&config, Arc::clone(&cdn), Some(broken), None)
        .run_manifest(&manifest, None, &mut stats)
        .await;

    assert_eq!(results[0].status, Status::Failed);
    assert_eq!(results[0].error.as_ref().unwrap().kind, ErrorKind::Composition);
    assert_eq!(results[0].output_paths, vec![plain.clone()]);
    assert!(plain.exists());
    assert!(!overlayed.exists());
    assert_eq!(stats.composition_failures, 1);

    // A rerun with a working transcoder only produces the missing composite.
    let working: Arc<dyn Transcoder> = Arc::new(FakeFfmpeg {
        fail_composite: false,
    });
    let mut stats = RunStats::new();
    let results = scheduler(&config, cdn, Some(working), None)
        .run_manifest(&manifest, None, &mut stats)
        .await;

    assert_eq!(results[0].status, Status::Downloaded);
    assert_eq!(std::fs::read(&plain).unwrap(), b"base-video");
    assert_eq!(std::fs::read(&overlayed).unwrap(), b"base-video+overlay");
    assert_eq!(stats.videos_with_overlay, 1);
}

#[tokio::test]
async fn with_mode_composition_failure_keeps_base_media() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), OverlayMode::With, OverlayNaming::SeparateFolders);
    let manifest = Manifest::from_json(
        r#"[{"Date": "2023-07-15 08:00:00 UTC", "Media Type": "Video",
             "Media Download Url": "https://cdn.test/v.mp4",
             "Overlay Download Url": "https://cdn.test/v-overlay.png"}]"#,
    )
    .unwrap();
    let cdn = Arc::new(
        FakeCdn::default()
            .serve("https://cdn.test/v.mp4", b"base-video".to_vec())
            .serve("https://cdn.test/v-overlay.png", caption_png(8, 8)),
    );
    let output = dir.path().join("2023-07-15_08-00-00.mp4");

    let broken: Arc<dyn Transcoder> = Arc::new(FakeFfmpeg {
        fail_composite: true,
    });
    let scheduler = scheduler(&config, Arc::clone(&cdn), Some(broken), None);
    let mut stats = RunStats::new();
    let results = scheduler.run_manifest(&manifest, None, &mut stats).await;

    assert_eq!(results[0].status, Status::Failed);
    assert_eq!(results[0].error.as_ref().unwrap().kind, ErrorKind::Composition);
    assert!(!results[0].overlay_applied);
    assert_eq!(results[0].output_paths, vec![output.clone()]);
    assert_eq!(std::fs::read(&output).unwrap(), b"base-video");
    assert_eq!(stats.composition_failures, 1);

    // The base media counts as the entry's output from now on.
    let fetched = cdn.request_count();
    let mut stats = RunStats::new();
    let results = scheduler.run_manifest(&manifest, None, &mut stats).await;
    assert_eq!(results[0].status, Status::SkippedExisting);
    assert_eq!(cdn.request_count(), fetched);
}

#[tokio::test]
async fn malformed_record_fails_in_place() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), OverlayMode::None, OverlayNaming::SeparateFolders);
    let manifest = Manifest::from_json(
        r#"[
            {"Media Type": "Image", "Media Download Url": "https://cdn.test/nodate.jpg"},
            {"Date": "2023-01-01 00:00:01 UTC", "Media Type": "Image",
             "Media Download Url": "https://cdn.test/1.jpg"}
        ]"#,
    )
    .unwrap();
    let cdn = Arc::new(FakeCdn::default().serve("https://cdn.test/1.jpg", jpeg(8, 8)));

    let mut stats = RunStats::new();
    let results = scheduler(&config, Arc::clone(&cdn), None, None)
        .run_manifest(&manifest, None, &mut stats)
        .await;

    assert_eq!(results[0].entry_id, None);
    assert_eq!(results[0].error.as_ref().unwrap().kind, ErrorKind::Manifest);
    assert_eq!(results[1].status, Status::Downloaded);
    assert_eq!(cdn.request_count(), 1);
}

// ─── Overlay text ────────────────────────────────────────────────────────────

#[tokio::test]
async fn extracted_text_lands_in_enriched_manifest() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path(), OverlayMode::With, OverlayNaming::SeparateFolders);
    config.extract_text = true;
    let manifest = Manifest::from_json(
        r#"{"Saved Media": [
            {"Date": "2023-07-14 12:30:05 UTC", "Media Type": "Image",
             "Media Download Url": "https://cdn.test/a.jpg",
             "Overlay Download Url": "https://cdn.test/a-overlay.png",
             "Download Link": "https://app.test/dl?a"},
            {"Date": "2023-07-14 13:00:00 UTC", "Media Type": "Image",
             "Media Download Url": "https://cdn.test/b.jpg"}
        ]}"#,
    )
    .unwrap();
    let cdn = Arc::new(
        image_cdn().serve("https://cdn.test/b.jpg", jpeg(16, 16)),
    );
    let reader = OverlayTextReader::new(Arc::new(FixedOcr("Lunch time")), None);
    let enriched = dir.path().join("memories_history.enriched.json");

    let mut stats = RunStats::new();
    let results = scheduler(&config, cdn, None, Some(reader))
        .run_manifest(&manifest, Some(&enriched), &mut stats)
        .await;

    assert_eq!(results[0].extracted_text.as_deref(), Some("Lunch time"));
    assert_eq!(results[1].extracted_text, None);
    assert_eq!(stats.texts_extracted, 1);

    let document: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&enriched).unwrap()).unwrap();
    let records = document["Saved Media"].as_array().unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0]["Extracted Text"], "Lunch time");
    assert_eq!(records[0]["Id"], "2023-07-14_12-30-05");
    assert_eq!(records[0]["Download Link"], "https://app.test/dl?a");
    assert!(records[1].get("Extracted Text").is_none());
}

#[tokio::test]
async fn rerun_keeps_extracted_text() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path(), OverlayMode::With, OverlayNaming::SeparateFolders);
    config.extract_text = true;
    let manifest = Manifest::from_json(IMAGE_WITH_OVERLAY).unwrap();
    let cdn = Arc::new(image_cdn());
    let reader = OverlayTextReader::new(Arc::new(FixedOcr("Lunch time")), None);
    let scheduler = scheduler(&config, Arc::clone(&cdn), None, Some(reader));
    let enriched = dir.path().join("memories_history.enriched.json");

    let mut first = RunStats::new();
    scheduler
        .run_manifest(&manifest, Some(&enriched), &mut first)
        .await;
    assert_eq!(first.texts_extracted, 1);

    let mut second = RunStats::new();
    let results = scheduler
        .run_manifest(&manifest, Some(&enriched), &mut second)
        .await;
    assert_eq!(results[0].status, Status::SkippedExisting);
    assert_eq!(results[0].extracted_text, None);

    let document: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&enriched).unwrap()).unwrap();
    assert_eq!(document[0]["Extracted Text"], "Lunch time");
    assert_eq!(document[0]["Id"], "2023-07-14_12-30-05");
}

#[tokio::test]
async fn copy_overlays_keeps_raw_asset() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path(), OverlayMode::Both, OverlayNaming::SeparateFolders);
    config.copy_overlays = true;
    let manifest = Manifest::from_json(IMAGE_WITH_OVERLAY).unwrap();

    let mut stats = RunStats::new();
    scheduler(&config, Arc::new(image_cdn()), None, None)
        .run_manifest(&manifest, None, &mut stats)
        .await;

    let copy = dir.path().join("overlays/2023-07-14_12-30-05_overlay.png");
    assert_eq!(std::fs::read(copy).unwrap(), caption_png(32, 24));
}
