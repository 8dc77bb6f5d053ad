//! Output placement
//!
//! Resolves destination paths from the naming policy, answers the
//! skip-existing question before any work starts, and writes files
//! atomically: bytes go to a hidden staging file in the destination
//! directory, which is renamed over the final path once flushed.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use bytes::Bytes;
use tracing::debug;

use crate::config::{
    Config, OverlayMode, OverlayNaming, OVERLAYS_DIR, OVERLAY_SUFFIX, WITHOUT_OVERLAYS_DIR,
    WITH_OVERLAYS_DIR,
};
use crate::error::MemoryError;
use crate::manifest::MemoryEntry;

/// Output variant of an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    /// Base media without overlay
    Plain,
    /// Base media with overlay composited
    Overlayed,
}

/// Computes destination paths and writes outputs
#[derive(Debug, Clone)]
pub struct OutputPlacer {
    root: PathBuf,
    prefix: String,
    naming: OverlayNaming,
    mode: OverlayMode,
    skip_existing: bool,
}

impl OutputPlacer {
    pub fn new(
        root: impl Into<PathBuf>,
        prefix: &str,
        naming: OverlayNaming,
        mode: OverlayMode,
        skip_existing: bool,
    ) -> Self {
        Self {
            root: root.into(),
            prefix: sanitize(prefix),
            naming,
            mode,
            skip_existing,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            &config.output_dir,
            &config.filename_prefix,
            config.overlay_naming,
            config.overlay_mode,
            config.skip_existing,
        )
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File stem shared by every variant of an entry.
    pub fn base_name(&self, entry: &MemoryEntry) -> String {
        let id = sanitize(&entry.id);
        if self.prefix.is_empty() {
            id
        } else if self.prefix.ends_with(['_', '-']) {
            format!("{}{id}", self.prefix)
        } else {
            format!("{}_{id}", self.prefix)
        }
    }

    /// Variants produced for an entry, plain first.
    pub fn variants(&self, entry: &MemoryEntry) -> Vec<Variant> {
        if !entry.has_overlay() {
            return vec![Variant::Plain];
        }
        match self.mode {
            OverlayMode::None => vec![Variant::Plain],
            OverlayMode::With => vec![Variant::Overlayed],
            OverlayMode::Both => vec![Variant::Plain, Variant::Overlayed],
        }
    }

    pub fn path_for(&self, entry: &MemoryEntry, variant: Variant) -> PathBuf {
        let base = self.base_name(entry);
        let ext = entry.media_kind.extension();
        let separate =
            self.mode == OverlayMode::Both && self.naming == OverlayNaming::SeparateFolders;

        match (variant, self.mode) {
            (Variant::Plain, _) if separate => {
                self.root.join(WITHOUT_OVERLAYS_DIR).join(format!("{base}.{ext}"))
            }
            (Variant::Overlayed, OverlayMode::Both) if separate => {
                self.root.join(WITH_OVERLAYS_DIR).join(format!("{base}.{ext}"))
            }
            (Variant::Overlayed, OverlayMode::Both) => {
                self.root.join(format!("{base}{OVERLAY_SUFFIX}.{ext}"))
            }
            _ => self.root.join(format!("{base}.{ext}")),
        }
    }

    /// Every destination an entry would produce, plain first.
    pub fn plan(&self, entry: &MemoryEntry) -> Vec<(Variant, PathBuf)> {
        self.variants(entry)
            .into_iter()
            .map(|v| (v, self.path_for(entry, v)))
            .collect()
    }

    /// Planned outputs still to be written. Under skip-existing, paths that
    /// already exist are left out; an empty result means the entry is done.
    pub fn pending(&self, entry: &MemoryEntry) -> Vec<(Variant, PathBuf)> {
        let plan = self.plan(entry);
        if !self.skip_existing {
            return plan;
        }
        plan.into_iter().filter(|(_, path)| !path.exists()).collect()
    }

    pub fn overlay_copy_path(&self, entry: &MemoryEntry, ext: &str) -> PathBuf {
        self.root
            .join(OVERLAYS_DIR)
            .join(format!("{}_overlay.{ext}", self.base_name(entry)))
    }

    /// Write one output atomically, stamped with the capture time.
    pub async fn place(
        &self,
        entry: &MemoryEntry,
        path: &Path,
        bytes: Bytes,
    ) -> Result<(), MemoryError> {
        debug!(path = %path.display(), size = bytes.len(), "Placing output");
        write_atomic(path, bytes, Some(SystemTime::from(entry.captured_at))).await
    }

    /// Persist the raw overlay asset under `overlays/`.
    pub async fn place_overlay_copy(
        &self,
        entry: &MemoryEntry,
        overlay: Bytes,
        ext: &str,
    ) -> Result<PathBuf, MemoryError> {
        let path = self.overlay_copy_path(entry, ext);
        self.place(entry, &path, overlay).await?;
        Ok(path)
    }
}

/// Replace characters outside `[A-Za-z0-9._-]` with `_`.
pub fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Stage `bytes` next to `path` and rename into place.
///
/// Missing parent directories are created. A crash before the rename leaves
/// only a hidden `.memfetch-*` file behind, never a partial `path`.
pub async fn write_atomic(
    path: &Path,
    bytes: Bytes,
    modified: Option<SystemTime>,
) -> Result<(), MemoryError> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || write_atomic_blocking(&path, &bytes, modified))
        .await
        .map_err(|e| MemoryError::Internal(format!("write task: {e}")))?
}

fn write_atomic_blocking(
    path: &Path,
    bytes: &[u8],
    modified: Option<SystemTime>,
) -> Result<(), MemoryError> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir).map_err(|e| MemoryError::io(dir, e))?;

    let mut staged = tempfile::Builder::new()
        .prefix(".memfetch-")
        .suffix(".part")
        .tempfile_in(dir)
        .map_err(|e| MemoryError::io(dir, e))?;
    staged.write_all(bytes).map_err(|e| MemoryError::io(staged.path(), e))?;
    staged
        .as_file()
        .sync_all()
        .map_err(|e| MemoryError::io(staged.path(), e))?;
    if let Some(time) = modified {
        staged
            .as_file()
            .set_modified(time)
            .map_err(|e| MemoryError::io(staged.path(), e))?;
    }

    staged
        .persist(path)
        .map_err(|e| MemoryError::io(path, e.error))?;
    Ok(())
}
