//! JPEG EXIF embedding
//!
//! Existing primary-IFD fields are read with `kamadak-exif`, the capture time
//! and GPS fields are replaced, and a fresh TIFF block is serialized with the
//! experimental writer. The new APP1 segment is spliced into the JPEG marker
//! stream; entropy-coded scan data is copied byte for byte.

use std::io::Cursor;

use chrono::{DateTime, Utc};
use exif::experimental::Writer;
use exif::{Context, Field, In, Rational, Reader, Tag, Value};

use crate::error::MemoryError;
use crate::manifest::Location;

const EXIF_HEADER: &[u8] = b"Exif\0\0";

const MARKER_SOI: u8 = 0xD8;
const MARKER_EOI: u8 = 0xD9;
const MARKER_SOS: u8 = 0xDA;
const MARKER_APP0: u8 = 0xE0;
const MARKER_APP1: u8 = 0xE1;

const OFFSET_TIME: Tag = Tag(Context::Exif, 0x9010);
const OFFSET_TIME_ORIGINAL: Tag = Tag(Context::Exif, 0x9011);
const OFFSET_TIME_DIGITIZED: Tag = Tag(Context::Exif, 0x9012);
const TILE_OFFSETS: Tag = Tag(Context::Tiff, 0x0144);
const TILE_BYTE_COUNTS: Tag = Tag(Context::Tiff, 0x0145);

/// Offsets and pointers the writer regenerates or cannot relocate
const DROPPED_TAGS: [Tag; 10] = [
    Tag::ExifIFDPointer,
    Tag::GPSInfoIFDPointer,
    Tag::InteropIFDPointer,
    Tag::MakerNote,
    Tag::StripOffsets,
    Tag::StripByteCounts,
    TILE_OFFSETS,
    TILE_BYTE_COUNTS,
    Tag::JPEGInterchangeFormat,
    Tag::JPEGInterchangeFormatLength,
];

/// Capture times are written as UTC wall clock
const UTC_OFFSET: &str = "+00:00";

/// Tags rewritten on every embed
const TIME_TAGS: [Tag; 6] = [
    Tag::DateTime,
    Tag::DateTimeOriginal,
    Tag::DateTimeDigitized,
    OFFSET_TIME,
    OFFSET_TIME_ORIGINAL,
    OFFSET_TIME_DIGITIZED,
];

/// Write capture time (and location, when known) into a JPEG.
pub fn embed_jpeg(
    jpeg: &[u8],
    captured_at: DateTime<Utc>,
    location: Option<Location>,
    software: Option<&str>,
) -> Result<Vec<u8>, MemoryError> {
    if !is_jpeg(jpeg) {
        return Err(MemoryError::Metadata("EXIF embedding needs a JPEG".into()));
    }

    let (mut fields, little_endian) = existing_fields(jpeg);
    fields.retain(|f| !TIME_TAGS.contains(&f.tag));
    if software.is_some() {
        fields.retain(|f| f.tag != Tag::Software);
    }
    if location.is_some() {
        fields.retain(|f| f.tag.context() != Context::Gps);
    }

    let timestamp = captured_at.format("%Y:%m:%d %H:%M:%S").to_string();
    for tag in [Tag::DateTime, Tag::DateTimeOriginal, Tag::DateTimeDigitized] {
        fields.push(ascii_field(tag, &timestamp));
    }
    for tag in [OFFSET_TIME, OFFSET_TIME_ORIGINAL, OFFSET_TIME_DIGITIZED] {
        fields.push(ascii_field(tag, UTC_OFFSET));
    }
    if let Some(software) = software {
        fields.push(ascii_field(Tag::Software, software));
    }
    if let Some(location) = location {
        fields.extend(gps_fields(location));
    }

    let tiff = serialize(&fields, little_endian)?;
    splice_app1(jpeg, &tiff)
}

/// Read the GPS position back from a JPEG, if present.
pub fn read_location(jpeg: &[u8]) -> Option<Location> {
    let exif = Reader::new()
        .read_from_container(&mut Cursor::new(jpeg))
        .ok()?;
    let latitude = dms_to_degrees(&exif.get_field(Tag::GPSLatitude, In::PRIMARY)?.value)?;
    let longitude = dms_to_degrees(&exif.get_field(Tag::GPSLongitude, In::PRIMARY)?.value)?;
    let south = ascii_value(&exif.get_field(Tag::GPSLatitudeRef, In::PRIMARY)?.value)? == "S";
    let west = ascii_value(&exif.get_field(Tag::GPSLongitudeRef, In::PRIMARY)?.value)? == "W";
    Some(Location {
        latitude: if south { -latitude } else { latitude },
        longitude: if west { -longitude } else { longitude },
    })
}

/// Read an ASCII tag from the primary IFD.
pub fn read_ascii(jpeg: &[u8], tag: Tag) -> Option<String> {
    let exif = Reader::new()
        .read_from_container(&mut Cursor::new(jpeg))
        .ok()?;
    ascii_value(&exif.get_field(tag, In::PRIMARY)?.value)
}

fn is_jpeg(bytes: &[u8]) -> bool {
    bytes.len() >= 4 && bytes[0] == 0xFF && bytes[1] == MARKER_SOI
}

/// Primary-IFD fields the writer can re-serialize, plus the byte order.
///
/// Maker notes hold absolute offsets that would dangle. The thumbnail IFD
/// is dropped.
fn existing_fields(jpeg: &[u8]) -> (Vec<Field>, bool) {
    let Ok(exif) = Reader::new().read_from_container(&mut Cursor::new(jpeg)) else {
        return (Vec::new(), false);
    };
    let fields = exif
        .fields()
        .filter(|f| f.ifd_num == In::PRIMARY)
        .filter(|f| !DROPPED_TAGS.contains(&f.tag))
        .filter(|f| f.tag.context() != Context::Interop)
        .filter(|f| !matches!(f.value, Value::Unknown(..)))
        .cloned()
        .collect();
    (fields, exif.little_endian())
}

fn ascii_field(tag: Tag, text: &str) -> Field {
    Field {
        tag,
        ifd_num: In::PRIMARY,
        value: Value::Ascii(vec![text.as_bytes().to_vec()]),
    }
}

fn ascii_value(value: &Value) -> Option<String> {
    match value {
        Value::Ascii(parts) => parts
            .first()
            .map(|p| String::from_utf8_lossy(p).trim().to_string()),
        _ => None,
    }
}

fn gps_fields(location: Location) -> Vec<Field> {
    let gps = |tag, value| Field {
        tag,
        ifd_num: In::PRIMARY,
        value,
    };
    let lat_ref = if location.latitude < 0.0 { "S" } else { "N" };
    let lon_ref = if location.longitude < 0.0 { "W" } else { "E" };
    vec![
        gps(Tag::GPSVersionID, Value::Byte(vec![2, 3, 0, 0])),
        gps(Tag::GPSLatitudeRef, Value::Ascii(vec![lat_ref.as_bytes().to_vec()])),
        gps(Tag::GPSLatitude, Value::Rational(degrees_to_dms(location.latitude))),
        gps(Tag::GPSLongitudeRef, Value::Ascii(vec![lon_ref.as_bytes().to_vec()])),
        gps(Tag::GPSLongitude, Value::Rational(degrees_to_dms(location.longitude))),
    ]
}

/// Absolute decimal degrees as degree/minute/second rationals, seconds in
/// thousandths.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn degrees_to_dms(value: f64) -> Vec<Rational> {
    let abs = value.abs();
    let mut degrees = abs.trunc() as u32;
    let minutes_f = (abs - abs.trunc()) * 60.0;
    let mut minutes = minutes_f.trunc() as u32;
    let mut millis = ((minutes_f - minutes_f.trunc()) * 60_000.0).round() as u32;
    if millis >= 60_000 {
        millis -= 60_000;
        minutes += 1;
    }
    if minutes >= 60 {
        minutes -= 60;
        degrees += 1;
    }
    vec![
        Rational {
            num: degrees,
            denom: 1,
        },
        Rational {
            num: minutes,
            denom: 1,
        },
        Rational {
            num: millis,
            denom: 1000,
        },
    ]
}

fn dms_to_degrees(value: &Value) -> Option<f64> {
    match value {
        Value::Rational(parts) if parts.len() >= 3 => {
            Some(parts[0].to_f64() + parts[1].to_f64() / 60.0 + parts[2].to_f64() / 3600.0)
        }
        _ => None,
    }
}

fn serialize(fields: &[Field], little_endian: bool) -> Result<Vec<u8>, MemoryError> {
    let mut writer = Writer::new();
    for field in fields {
        writer.push_field(field);
    }
    let mut out = Cursor::new(Vec::new());
    writer
        .write(&mut out, little_endian)
        .map_err(|e| MemoryError::Metadata(format!("EXIF serialization failed: {e}")))?;
    Ok(out.into_inner())
}

/// Replace any Exif APP1 segment with one carrying `tiff`.
///
/// The new segment goes after leading APP0 (JFIF) segments, as readers
/// expect; all other segments and the scan data keep their order.
fn splice_app1(jpeg: &[u8], tiff: &[u8]) -> Result<Vec<u8>, MemoryError> {
    let payload_len = EXIF_HEADER.len() + tiff.len() + 2;
    let segment_len = u16::try_from(payload_len)
        .map_err(|_| MemoryError::Metadata(format!("EXIF block too large ({payload_len} bytes)")))?;

    let mut app1 = Vec::with_capacity(payload_len + 2);
    app1.extend_from_slice(&[0xFF, MARKER_APP1]);
    app1.extend_from_slice(&segment_len.to_be_bytes());
    app1.extend_from_slice(EXIF_HEADER);
    app1.extend_from_slice(tiff);

    let mut out = Vec::with_capacity(jpeg.len() + app1.len());
    out.extend_from_slice(&jpeg[..2]);
    let mut inserted = false;
    let mut pos = 2;

    loop {
        if pos + 1 >= jpeg.len() || jpeg[pos] != 0xFF {
            return Err(MemoryError::Metadata(format!(
                "malformed JPEG marker at offset {pos}"
            )));
        }
        let marker = jpeg[pos + 1];
        if marker == 0xFF {
            // Fill byte before a marker
            pos += 1;
            continue;
        }
        if marker == MARKER_SOS || marker == MARKER_EOI {
            break;
        }
        if marker == 0x01 || (0xD0..=0xD7).contains(&marker) {
            out.extend_from_slice(&jpeg[pos..pos + 2]);
            pos += 2;
            continue;
        }
        if pos + 4 > jpeg.len() {
            return Err(MemoryError::Metadata("truncated JPEG segment".into()));
        }
        let len = usize::from(u16::from_be_bytes([jpeg[pos + 2], jpeg[pos + 3]]));
        let end = pos + 2 + len;
        if len < 2 || end > jpeg.len() {
            return Err(MemoryError::Metadata("truncated JPEG segment".into()));
        }

        let is_exif = marker == MARKER_APP1 && jpeg[pos + 4..end].starts_with(EXIF_HEADER);
        if !is_exif {
            if !inserted && marker != MARKER_APP0 {
                out.extend_from_slice(&app1);
                inserted = true;
            }
            out.extend_from_slice(&jpeg[pos..end]);
        }
        pos = end;
    }

    if !inserted {
        out.extend_from_slice(&app1);
    }
    out.extend_from_slice(&jpeg[pos..]);
    Ok(out)
}
