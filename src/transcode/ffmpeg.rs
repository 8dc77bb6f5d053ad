//! ffmpeg subprocess transcoder
//!
//! Each request runs in its own scratch directory:
//! - inputs are written as files (ffmpeg needs seekable mp4 input)
//! - one ffmpeg process is spawned with `kill_on_drop`
//! - outputs are read back into memory before the directory is removed
//!
//! A semaphore caps live ffmpeg processes at the run's concurrency so a
//! large worker pool cannot fork-bomb the host.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tracing::{debug, instrument, warn};

use super::{Result, TranscodeError, TranscodeOutput, TranscodeRequest, Transcoder};
use crate::config::OverlayTrackPolicy;

/// Lines of stderr kept in error messages
const STDERR_TAIL_LINES: usize = 12;

const DEFAULT_VIDEO_CODEC: &str = "libx264";

/// ffmpeg-backed [`Transcoder`]
#[derive(Debug, Clone)]
pub struct FfmpegTranscoder {
    /// Path to ffmpeg binary
    program: PathBuf,
    permits: Arc<Semaphore>,
    timeout: Duration,
    /// Encoder used when compositing forces a re-encode
    video_codec: String,
}

impl FfmpegTranscoder {
    /// Create a transcoder. `program` may be a bare name resolved via PATH.
    pub fn new(program: impl Into<PathBuf>, max_concurrent: usize, timeout: Duration) -> Self {
        let program = program.into();
        let program = which::which(&program).unwrap_or(program);
        Self {
            program,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            timeout,
            video_codec: DEFAULT_VIDEO_CODEC.to_string(),
        }
    }

    /// ffmpeg from an explicit override, falling back to PATH lookup
    pub fn locate(
        override_path: Option<&Path>,
        max_concurrent: usize,
        timeout: Duration,
    ) -> Self {
        let program = override_path.map_or_else(|| PathBuf::from("ffmpeg"), Path::to_path_buf);
        Self::new(program, max_concurrent, timeout)
    }

    #[must_use]
    pub fn with_video_codec(mut self, codec: &str) -> Self {
        self.video_codec = codec.to_string();
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Build the overlay compositing command line.
    ///
    /// The overlay is scaled to the base dimensions with `scale2ref`. Under
    /// [`OverlayTrackPolicy::Freeze`] the overlay's last frame is cloned
    /// until the base ends; under `Loop` the overlay input is looped. Either
    /// way output length follows the base video.
    pub fn composite_args(
        &self,
        base: &Path,
        overlay: &Path,
        track: OverlayTrackPolicy,
        output: &Path,
    ) -> Vec<String> {
        let mut args = quiet_args();

        args.extend(["-i".to_string(), base.to_string_lossy().to_string()]);
        if track == OverlayTrackPolicy::Loop {
            args.extend(["-stream_loop".to_string(), "-1".to_string()]);
        }
        args.extend(["-i".to_string(), overlay.to_string_lossy().to_string()]);

        let overlay_source = match track {
            OverlayTrackPolicy::Freeze => "[1:v]tpad=stop_mode=clone:stop=-1[pad];[pad]",
            OverlayTrackPolicy::Loop => "[1:v]",
        };
        let filter = format!(
            "{overlay_source}[0:v]scale2ref=w=iw:h=ih[ovr][base];\
             [base][ovr]overlay=0:0:shortest=1:format=auto,format=yuv420p[v]"
        );

        args.extend([
            "-filter_complex".to_string(),
            filter,
            "-map".to_string(),
            "[v]".to_string(),
            "-map".to_string(),
            "0:a?".to_string(),
            "-c:v".to_string(),
            self.video_codec.clone(),
        ]);
        if self.video_codec == "libx264" {
            args.extend([
                "-preset".to_string(),
                "medium".to_string(),
                "-crf".to_string(),
                "18".to_string(),
            ]);
        }
        args.extend([
            "-c:a".to_string(),
            "copy".to_string(),
            "-map_metadata".to_string(),
            "0".to_string(),
            "-movflags".to_string(),
            "+faststart".to_string(),
            "-f".to_string(),
            "mp4".to_string(),
            output.to_string_lossy().to_string(),
        ]);
        args
    }

    /// Build the stream-copy metadata rewrite command line.
    ///
    /// `use_metadata_tags` keeps custom keys such as `location-eng` in the
    /// mp4 `udta` box.
    pub fn metadata_args(input: &Path, tags: &[(String, String)], output: &Path) -> Vec<String> {
        let mut args = quiet_args();
        args.extend([
            "-i".to_string(),
            input.to_string_lossy().to_string(),
            "-map".to_string(),
            "0".to_string(),
            "-c".to_string(),
            "copy".to_string(),
            "-map_metadata".to_string(),
            "0".to_string(),
        ]);
        for (key, value) in tags {
            args.push("-metadata".to_string());
            args.push(format!("{key}={value}"));
        }
        args.extend([
            "-movflags".to_string(),
            "use_metadata_tags".to_string(),
            "-f".to_string(),
            "mp4".to_string(),
            output.to_string_lossy().to_string(),
        ]);
        args
    }

    /// Build the frame sampling command line (2 fps, PNG frames).
    pub fn sample_args(input: &Path, max_frames: u32, pattern: &Path) -> Vec<String> {
        let mut args = quiet_args();
        args.extend([
            "-i".to_string(),
            input.to_string_lossy().to_string(),
            "-vf".to_string(),
            "fps=2".to_string(),
            "-frames:v".to_string(),
            max_frames.max(1).to_string(),
            pattern.to_string_lossy().to_string(),
        ]);
        args
    }

    /// Spawn ffmpeg with `args`, enforcing the permit and timeout.
    async fn execute(&self, args: &[String]) -> Result<()> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| TranscodeError::Io(std::io::Error::other(e)))?;

        debug!("Running: {} {}", self.program.display(), args.join(" "));

        let child = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| self.spawn_error(e))?;

        // Dropping the future on timeout drops the child, which kills it.
        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| TranscodeError::Timeout(self.timeout))??;

        if output.status.success() {
            return Ok(());
        }

        let stderr = stderr_tail(&output.stderr);
        warn!("ffmpeg failed ({}): {}", output.status, stderr);
        Err(TranscodeError::Failed {
            program: self.name().to_string(),
            status: output.status.to_string(),
            stderr,
        })
    }

    fn spawn_error(&self, err: std::io::Error) -> TranscodeError {
        if err.kind() == std::io::ErrorKind::NotFound {
            TranscodeError::NotFound {
                program: self.program.display().to_string(),
                reason: err.to_string(),
            }
        } else {
            TranscodeError::Io(err)
        }
    }

    async fn composite(
        &self,
        base: &Bytes,
        overlay: &Bytes,
        overlay_ext: &str,
        track: OverlayTrackPolicy,
    ) -> Result<TranscodeOutput> {
        let scratch = tempfile::tempdir()?;
        let base_path = scratch.path().join("base.mp4");
        let overlay_path = scratch.path().join(format!("overlay.{overlay_ext}"));
        let output_path = scratch.path().join("composited.mp4");

        tokio::fs::write(&base_path, base).await?;
        tokio::fs::write(&overlay_path, overlay).await?;

        let args = self.composite_args(&base_path, &overlay_path, track, &output_path);
        self.execute(&args).await?;

        let bytes = tokio::fs::read(&output_path).await?;
        Ok(TranscodeOutput::single(Bytes::from(bytes)))
    }

    async fn rewrite_metadata(
        &self,
        input: &Bytes,
        tags: &[(String, String)],
    ) -> Result<TranscodeOutput> {
        let scratch = tempfile::tempdir()?;
        let input_path = scratch.path().join("input.mp4");
        let output_path = scratch.path().join("tagged.mp4");

        tokio::fs::write(&input_path, input).await?;
        self.execute(&Self::metadata_args(&input_path, tags, &output_path))
            .await?;

        let bytes = tokio::fs::read(&output_path).await?;
        Ok(TranscodeOutput::single(Bytes::from(bytes)))
    }

    async fn sample_frames(
        &self,
        input: &Bytes,
        input_ext: &str,
        max_frames: u32,
    ) -> Result<TranscodeOutput> {
        let scratch = tempfile::tempdir()?;
        let input_path = scratch.path().join(format!("input.{input_ext}"));
        let pattern = scratch.path().join("frame_%03d.png");

        tokio::fs::write(&input_path, input).await?;
        self.execute(&Self::sample_args(&input_path, max_frames, &pattern))
            .await?;

        let mut frames = Vec::new();
        let mut dir = tokio::fs::read_dir(scratch.path()).await?;
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name();
            if name.to_string_lossy().starts_with("frame_") {
                frames.push(entry.path());
            }
        }
        frames.sort();

        let mut streams = Vec::with_capacity(frames.len());
        for frame in frames {
            streams.push(Bytes::from(tokio::fs::read(&frame).await?));
        }
        Ok(TranscodeOutput { streams })
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    fn name(&self) -> &str {
        "ffmpeg"
    }

    async fn check_available(&self) -> Result<PathBuf> {
        let child = Command::new(&self.program)
            .arg("-version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| self.spawn_error(e))?;

        let limit = Duration::from_secs(10);
        let output = tokio::time::timeout(limit, child.wait_with_output())
            .await
            .map_err(|_| TranscodeError::Timeout(limit))??;

        if output.status.success() {
            Ok(self.program.clone())
        } else {
            Err(TranscodeError::NotFound {
                program: self.program.display().to_string(),
                reason: format!("-version exited with {}", output.status),
            })
        }
    }

    #[instrument(skip_all, fields(op = request.label()))]
    async fn run(&self, request: TranscodeRequest) -> Result<TranscodeOutput> {
        match request {
            TranscodeRequest::Composite {
                base,
                overlay,
                overlay_ext,
                track,
            } => self.composite(&base, &overlay, overlay_ext, track).await,
            TranscodeRequest::RewriteMetadata { input, tags } => {
                self.rewrite_metadata(&input, &tags).await
            }
            TranscodeRequest::SampleFrames {
                input,
                input_ext,
                max_frames,
            } => self.sample_frames(&input, input_ext, max_frames).await,
        }
    }
}

fn quiet_args() -> Vec<String> {
    vec![
        "-hide_banner".to_string(),
        "-nostdin".to_string(),
        "-loglevel".to_string(),
        "error".to_string(),
        "-y".to_string(),
    ]
}

/// Last few non-empty lines of ffmpeg stderr
fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join("\n")
}
