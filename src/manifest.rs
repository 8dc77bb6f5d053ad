//! Manifest model: typed memory entries parsed from an export listing
//!
//! The manifest is a JSON document, either `{"Saved Media": [...]}` or a bare
//! array of records. Each record is parsed independently: a malformed record
//! becomes a `ManifestError` for that entry alone, while the rest of the
//! manifest stays usable. Unknown keys are kept verbatim so an enriched
//! re-export round-trips everything the input carried.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::error::{EntryError, MemoryError};
use crate::output::sanitize;
use crate::scheduler::ProcessingResult;

/// Top-level key of the export document
pub const SAVED_MEDIA_KEY: &str = "Saved Media";

const KEY_ID: &str = "Id";
const KEY_TEXT: &str = "Extracted Text";
const KEY_LATITUDE: &str = "latitude";
const KEY_LONGITUDE: &str = "longitude";

static LOCATION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(-?\d+(?:\.\d+)?)\s*,\s*(-?\d+(?:\.\d+)?)").expect("valid location regex")
});

/// Media kind of an entry; selects the code path in every stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    /// Output file extension
    #[must_use]
    pub fn extension(self) -> &'static str {
        match self {
            Self::Image => "jpg",
            Self::Video => "mp4",
        }
    }
}

impl FromStr for MediaKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "image" => Ok(Self::Image),
            "video" => Ok(Self::Video),
            other => Err(format!("unsupported media type '{other}', expected image or video")),
        }
    }
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Image => "image",
            Self::Video => "video",
        })
    }
}

/// Geolocation in signed decimal degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
}

impl Location {
    /// Returns `None` for out-of-range values and for the (0, 0) placeholder
    /// exports use when no fix was recorded.
    #[must_use]
    pub fn new(latitude: f64, longitude: f64) -> Option<Self> {
        let valid = latitude.is_finite()
            && longitude.is_finite()
            && (-90.0..=90.0).contains(&latitude)
            && (-180.0..=180.0).contains(&longitude);
        if !valid || (latitude == 0.0 && longitude == 0.0) {
            return None;
        }
        Some(Self {
            latitude,
            longitude,
        })
    }

    /// Parse `"Latitude, Longitude: 52.37, 4.89"` style strings.
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        let caps = LOCATION_RE.captures(text)?;
        let latitude = caps[1].parse().ok()?;
        let longitude = caps[2].parse().ok()?;
        Self::new(latitude, longitude)
    }
}

/// One manifest row, immutable once parsed apart from `extracted_text`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    /// Normalized key, unique within the manifest
    pub id: String,
    pub captured_at: DateTime<Utc>,
    pub location: Option<Location>,
    pub media_kind: MediaKind,
    /// Base URL, then overlay URL when the entry has an overlay
    download_urls: Vec<String>,
    pub extracted_text: Option<String>,
}

impl MemoryEntry {
    pub fn new(
        id: impl Into<String>,
        captured_at: DateTime<Utc>,
        media_kind: MediaKind,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            captured_at,
            location: None,
            media_kind,
            download_urls: vec![base_url.into()],
            extracted_text: None,
        }
    }

    #[must_use]
    pub fn with_overlay(mut self, overlay_url: impl Into<String>) -> Self {
        self.download_urls.truncate(1);
        self.download_urls.push(overlay_url.into());
        self
    }

    #[must_use]
    pub fn with_location(mut self, location: Option<Location>) -> Self {
        self.location = location;
        self
    }

    #[must_use]
    pub fn has_overlay(&self) -> bool {
        self.download_urls.len() == 2
    }

    #[must_use]
    pub fn download_urls(&self) -> &[String] {
        &self.download_urls
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.download_urls[0]
    }

    #[must_use]
    pub fn overlay_url(&self) -> Option<&str> {
        self.download_urls.get(1).map(String::as_str)
    }
}

/// Serde view of a record. Unknown keys stay only in the source value.
#[derive(Debug, Clone, Default, Deserialize)]
struct RawMemory {
    #[serde(rename = "Id", default)]
    id: Option<String>,
    #[serde(rename = "Date", default)]
    date: Option<String>,
    #[serde(rename = "Media Type", default)]
    media_type: Option<String>,
    #[serde(rename = "Media Download Url", default)]
    media_download_url: Option<String>,
    #[serde(rename = "Overlay Download Url", default)]
    overlay_download_url: Option<String>,
    #[serde(rename = "Location", default)]
    location: Option<String>,
    #[serde(default)]
    latitude: Option<f64>,
    #[serde(default)]
    longitude: Option<f64>,
    #[serde(rename = "Extracted Text", default)]
    extracted_text: Option<String>,
}

/// Parse result for a single record
pub type ParsedEntry = std::result::Result<MemoryEntry, EntryError>;

/// A record as read (kept for re-export) plus its parse result
#[derive(Debug, Clone)]
pub struct ManifestRecord {
    pub source: Value,
    pub entry: ParsedEntry,
}

/// Parsed manifest document
#[derive(Debug, Clone)]
pub struct Manifest {
    /// Input used the `{"Saved Media": [...]}` wrapper
    wrapped: bool,
    records: Vec<ManifestRecord>,
}

impl Manifest {
    /// Read and parse a manifest file. Unreadable or non-JSON documents are
    /// fatal; malformed records are not.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read manifest {}", path.display()))?;
        Self::from_json(&content).with_context(|| format!("invalid manifest {}", path.display()))
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let document: Value = serde_json::from_str(content)?;
        let (wrapped, items) = match document {
            Value::Array(items) => (false, items),
            Value::Object(mut object) => match object.remove(SAVED_MEDIA_KEY) {
                Some(Value::Array(items)) => (true, items),
                _ => return Err(anyhow!("expected a \"{SAVED_MEDIA_KEY}\" array")),
            },
            _ => return Err(anyhow!("expected a JSON array or object")),
        };

        let mut ids = IdAllocator::default();
        let records = items
            .into_iter()
            .map(|source| {
                let entry = parse_record(&source, &mut ids).map_err(EntryError::from);
                ManifestRecord { source, entry }
            })
            .collect();

        Ok(Self { wrapped, records })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    #[must_use]
    pub fn records(&self) -> &[ManifestRecord] {
        &self.records
    }

    /// Parse results in manifest order, ready for the scheduler.
    #[must_use]
    pub fn entries(&self) -> Vec<ParsedEntry> {
        self.records.iter().map(|r| r.entry.clone()).collect()
    }

    /// Keys of well-formed entries without a usable location.
    #[must_use]
    pub fn missing_locations(&self) -> Vec<&MemoryEntry> {
        self.records
            .iter()
            .filter_map(|r| r.entry.as_ref().ok())
            .filter(|e| e.location.is_none())
            .collect()
    }

    /// Copy locations from a secondary manifest keyed by normalized entry id.
    /// Returns the number of entries whose location changed.
    pub fn apply_location_overrides(&mut self, overrides: &Manifest) -> usize {
        let by_id: HashMap<&str, Location> = overrides
            .records
            .iter()
            .filter_map(|r| r.entry.as_ref().ok())
            .filter_map(|e| e.location.map(|loc| (e.id.as_str(), loc)))
            .collect();

        let mut changed = 0;
        for record in &mut self.records {
            let Ok(entry) = record.entry.as_mut() else {
                continue;
            };
            let Some(location) = by_id.get(entry.id.as_str()) else {
                continue;
            };
            if entry.location == Some(*location) {
                continue;
            }
            entry.location = Some(*location);
            if let Value::Object(object) = &mut record.source {
                object.insert(KEY_LATITUDE.into(), location.latitude.into());
                object.insert(KEY_LONGITUDE.into(), location.longitude.into());
            }
            changed += 1;
        }
        changed
    }

    /// Build the enriched document: original records plus normalized `Id`,
    /// known coordinates, and `Extracted Text`.
    ///
    /// `results` must be in manifest order, as returned by the scheduler.
    ///
    /// `carried` maps entry ids to text extracted by an earlier run; it fills
    /// in for entries whose result has none (e.g. skipped as existing).
    #[must_use]
    pub fn enriched(
        &self,
        results: &[ProcessingResult],
        carried: &HashMap<String, String>,
    ) -> Value {
        let items = self
            .records
            .iter()
            .enumerate()
            .map(|(index, record)| {
                let mut source = record.source.clone();
                let (Value::Object(object), Ok(entry)) = (&mut source, &record.entry) else {
                    return source;
                };
                object.insert(KEY_ID.into(), entry.id.clone().into());
                if let Some(location) = entry.location {
                    object.insert(KEY_LATITUDE.into(), location.latitude.into());
                    object.insert(KEY_LONGITUDE.into(), location.longitude.into());
                }
                let text = results
                    .get(index)
                    .and_then(|r| r.extracted_text.clone())
                    .or_else(|| carried.get(&entry.id).cloned())
                    .or_else(|| entry.extracted_text.clone());
                if let Some(text) = text {
                    object.insert(KEY_TEXT.into(), text.into());
                }
                source
            })
            .collect::<Vec<_>>();

        if self.wrapped {
            let mut object = Map::new();
            object.insert(SAVED_MEDIA_KEY.into(), Value::Array(items));
            Value::Object(object)
        } else {
            Value::Array(items)
        }
    }

    /// Serialize [`Manifest::enriched`] and write it atomically.
    ///
    /// Text already present in an enriched manifest at `path` is kept for
    /// entries this run did not extract again.
    pub async fn write_enriched(
        &self,
        results: &[ProcessingResult],
        path: &Path,
    ) -> std::result::Result<(), MemoryError> {
        let carried = match tokio::fs::read_to_string(path).await {
            Ok(previous) => extracted_texts(&previous),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(err) => return Err(MemoryError::io(path, err)),
        };
        let document = self.enriched(results, &carried);
        let bytes = serde_json::to_vec_pretty(&document)
            .map_err(|e| MemoryError::io(path, std::io::Error::other(e)))?;
        crate::output::write_atomic(path, bytes.into(), None).await
    }
}

/// `Extracted Text` by entry id from a previously written enriched manifest.
fn extracted_texts(document: &str) -> HashMap<String, String> {
    match Manifest::from_json(document) {
        Ok(previous) => previous
            .records
            .into_iter()
            .filter_map(|r| r.entry.ok())
            .filter_map(|e| e.extracted_text.map(|text| (e.id, text)))
            .collect(),
        Err(err) => {
            warn!("Ignoring unreadable enriched manifest: {err}");
            HashMap::new()
        }
    }
}

/// Hands out normalized ids, numbering entries that share a capture instant.
///
/// Uniqueness is checked on the sanitized form, since that is what names
/// the output files.
#[derive(Default)]
struct IdAllocator {
    taken: HashSet<String>,
    occurrences: HashMap<String, u32>,
}

impl IdAllocator {
    fn claim_explicit(&mut self, id: &str) -> std::result::Result<String, MemoryError> {
        let name = sanitize(id);
        if !self.taken.insert(name.clone()) {
            return Err(MemoryError::Manifest(format!(
                "duplicate id '{id}' (output name '{name}' already taken)"
            )));
        }
        Ok(id.to_string())
    }

    fn derive(&mut self, captured_at: DateTime<Utc>) -> String {
        let base = captured_at.format("%Y-%m-%d_%H-%M-%S").to_string();
        let count = self.occurrences.entry(base.clone()).or_insert(0);
        loop {
            *count += 1;
            let candidate = if *count == 1 {
                base.clone()
            } else {
                format!("{base}_{count}")
            };
            if self.taken.insert(sanitize(&candidate)) {
                return candidate;
            }
        }
    }
}

fn parse_record(source: &Value, ids: &mut IdAllocator) -> std::result::Result<MemoryEntry, MemoryError> {
    let raw: RawMemory = serde_json::from_value(source.clone())
        .map_err(|e| MemoryError::Manifest(e.to_string()))?;

    let date = raw
        .date
        .as_deref()
        .filter(|d| !d.trim().is_empty())
        .ok_or_else(|| MemoryError::Manifest("missing Date".into()))?;
    let captured_at = parse_date(date)?;

    let media_kind = raw
        .media_type
        .as_deref()
        .ok_or_else(|| MemoryError::Manifest("missing Media Type".into()))?
        .parse::<MediaKind>()
        .map_err(MemoryError::Manifest)?;

    let base_url = raw
        .media_download_url
        .as_deref()
        .filter(|u| !u.trim().is_empty())
        .ok_or_else(|| MemoryError::Manifest("missing Media Download Url".into()))?;
    let base_url = checked_url(base_url)?;

    let overlay_url = match raw.overlay_download_url.as_deref().map(str::trim) {
        Some(url) if !url.is_empty() => Some(checked_url(url)?),
        _ => None,
    };

    let location = match (raw.latitude, raw.longitude) {
        (Some(lat), Some(lon)) => Location::new(lat, lon),
        _ => raw.location.as_deref().and_then(Location::parse),
    };

    let id = match raw.id.as_deref().map(str::trim) {
        Some(id) if !id.is_empty() => ids.claim_explicit(id)?,
        _ => ids.derive(captured_at),
    };

    let mut entry = MemoryEntry::new(id, captured_at, media_kind, base_url).with_location(location);
    if let Some(overlay_url) = overlay_url {
        entry = entry.with_overlay(overlay_url);
    }
    entry.extracted_text = raw.extracted_text;
    Ok(entry)
}

fn parse_date(raw: &str) -> std::result::Result<DateTime<Utc>, MemoryError> {
    let trimmed = raw.trim();
    if let Some(naive) = trimmed.strip_suffix("UTC") {
        return NaiveDateTime::parse_from_str(naive.trim(), "%Y-%m-%d %H:%M:%S")
            .map(|dt| dt.and_utc())
            .map_err(|e| MemoryError::Manifest(format!("invalid Date '{trimmed}': {e}")));
    }
    DateTime::parse_from_rfc3339(trimmed)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| MemoryError::Manifest(format!("invalid Date '{trimmed}': {e}")))
}

fn checked_url(raw: &str) -> std::result::Result<String, MemoryError> {
    let parsed = url::Url::parse(raw.trim())
        .map_err(|e| MemoryError::Manifest(format!("invalid URL: {e}")))?;
    match parsed.scheme() {
        "http" | "https" => Ok(raw.trim().to_string()),
        scheme => Err(MemoryError::Manifest(format!("unsupported URL scheme '{scheme}'"))),
    }
}
