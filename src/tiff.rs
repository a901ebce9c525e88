//! TIFF collaborator: in-memory decode, aligned int32 writer, and the
//! header-preserving strip overwrite used by merge mode
//!
//! Decoding is delegated to the `tiff` crate; every supported grayscale
//! sample layout (u8/u16/u32, i8/i16/i32, f32, one sample per pixel) is
//! promoted to `f32`. Writing is done by hand because both output paths
//! have byte-level requirements no encoder exposes:
//!
//! - [`write_tiff_i32_aligned`] pads the file to a 4096-byte boundary
//!   before the strip data so downstream direct-I/O readers can map it.
//! - [`write_tiff_i32_with_original_header`] reuses the exact byte image
//!   of a source TIFF and overwrites only the strip payload, which
//!   preserves every tag in the file including vendor private ones.

use crate::error::{FramepackError, Result};
use std::io::Cursor;
use std::path::Path;
use tiff::decoder::ifd::Value;
use tiff::decoder::{Decoder, DecodingResult};
use tiff::tags::Tag;
use tracing::warn;

/// Direct-I/O readers downstream require strip data on this boundary.
const STRIP_ALIGNMENT: usize = 4096;

/// Non-image header fields carried from a source TIFF to an output
#[derive(Debug, Clone)]
pub struct TiffHeaderInfo {
    pub compression: u16,
    pub photometric: u16,
    pub orientation: u16,
    pub planar_config: u16,
    pub x_resolution: f32,
    pub y_resolution: f32,
    pub resolution_unit: u16,
    pub date_time: Option<String>,
    pub software: Option<String>,
    pub description: Option<String>,
    pub artist: Option<String>,
    pub copyright: Option<String>,
}

impl Default for TiffHeaderInfo {
    fn default() -> Self {
        TiffHeaderInfo {
            compression: 1,    // none
            photometric: 1,    // min-is-black
            orientation: 1,    // top-left
            planar_config: 1,  // contiguous
            x_resolution: 1.0,
            y_resolution: 1.0,
            resolution_unit: 2, // inch
            date_time: None,
            software: None,
            description: None,
            artist: None,
            copyright: None,
        }
    }
}

/// Decode an in-memory grayscale TIFF to `f32` samples.
///
/// Returns `(samples, width, height, header)`. Fails on multi-sample
/// images and on layouts outside u8/16/32, i8/16/32, f32.
pub fn read_tiff_f32(data: &[u8]) -> Result<(Vec<f32>, u32, u32, TiffHeaderInfo)> {
    let mut decoder = Decoder::new(Cursor::new(data))?;
    let (width, height) = decoder.dimensions()?;

    let samples_per_pixel = tag_u16(&mut decoder, Tag::SamplesPerPixel).unwrap_or(1);
    if samples_per_pixel != 1 {
        return Err(FramepackError::header_mismatch(format!(
            "only single-sample images are supported, found {} samples per pixel",
            samples_per_pixel
        )));
    }

    let header = read_header_info(&mut decoder);

    let image = match decoder.read_image()? {
        DecodingResult::U8(v) => v.into_iter().map(|s| s as f32).collect::<Vec<f32>>(),
        DecodingResult::U16(v) => v.into_iter().map(|s| s as f32).collect(),
        DecodingResult::U32(v) => v.into_iter().map(|s| s as f32).collect(),
        DecodingResult::I8(v) => v.into_iter().map(|s| s as f32).collect(),
        DecodingResult::I16(v) => v.into_iter().map(|s| s as f32).collect(),
        DecodingResult::I32(v) => v.into_iter().map(|s| s as f32).collect(),
        DecodingResult::F32(v) => v,
        _ => {
            return Err(FramepackError::header_mismatch(
                "unsupported sample layout (only 8/16/32-bit integer and f32 grayscale)",
            ))
        }
    };

    let expected = width as usize * height as usize;
    if image.len() != expected {
        return Err(FramepackError::header_mismatch(format!(
            "decoded {} samples for a {}x{} image",
            image.len(),
            width,
            height
        )));
    }
    Ok((image, width, height, header))
}

/// Enumerate strip offsets and byte counts of an in-memory TIFF.
pub fn strip_layout(data: &[u8]) -> Result<(Vec<u64>, Vec<u64>)> {
    let mut decoder = Decoder::new(Cursor::new(data))?;
    let offsets = tag_u64_vec(&mut decoder, Tag::StripOffsets)
        .ok_or_else(|| FramepackError::header_mismatch("no strip offsets"))?;
    let counts = tag_u64_vec(&mut decoder, Tag::StripByteCounts)
        .ok_or_else(|| FramepackError::header_mismatch("no strip byte counts"))?;
    Ok((offsets, counts))
}

/// Write `img` as an uncompressed int32 grayscale TIFF with the strip
/// data starting on a 4096-byte boundary.
///
/// Samples are truncated toward zero, matching the merge pipeline's
/// integer output convention. Header fields from `hdr` are carried over;
/// absent optional strings are simply omitted.
pub fn write_tiff_i32_aligned(
    path: &Path,
    img: &[f32],
    width: u32,
    height: u32,
    hdr: &TiffHeaderInfo,
) -> Result<()> {
    let bytes = encode_tiff_i32_aligned(img, width, height, hdr)?;
    std::fs::write(path, bytes)?;
    Ok(())
}

/// Overwrite only the strip payload of `original`, keeping every other
/// byte, and write the result to `path`.
///
/// Legal only when the output has the same dimensions and a sample size
/// equal to the original's per-pixel byte count; both are verified and a
/// violation fails with a header mismatch instead of silently corrupting
/// the tags.
pub fn write_tiff_i32_with_original_header(
    path: &Path,
    img: &[f32],
    width: u32,
    height: u32,
    original: &[u8],
) -> Result<()> {
    if original.len() < 4 || &original[0..2] != b"II" {
        return Err(FramepackError::header_mismatch(
            "original TIFF is not little-endian; cannot overwrite strips in place",
        ));
    }

    let mut decoder = Decoder::new(Cursor::new(original))?;
    let (orig_w, orig_h) = decoder.dimensions()?;
    if (orig_w, orig_h) != (width, height) {
        return Err(FramepackError::header_mismatch(format!(
            "merged image is {}x{} but the template is {}x{}",
            width, height, orig_w, orig_h
        )));
    }
    drop(decoder);

    let (offsets, counts) = strip_layout(original)?;
    if offsets.is_empty() {
        return Err(FramepackError::header_mismatch("template has no strips"));
    }

    let data_size = img.len() * 4;
    let strip_capacity: u64 = counts.iter().sum();
    if strip_capacity != data_size as u64 {
        return Err(FramepackError::header_mismatch(format!(
            "strip capacity is {} bytes but the merged payload needs {}",
            strip_capacity, data_size
        )));
    }
    let first = offsets[0] as usize;
    if first + data_size > original.len() {
        return Err(FramepackError::header_mismatch(format!(
            "strip payload of {} bytes at offset {} exceeds the template size {}",
            data_size,
            first,
            original.len()
        )));
    }

    let mut out = original.to_vec();
    for (i, &sample) in img.iter().enumerate() {
        let value = sample as i32;
        out[first + i * 4..first + i * 4 + 4].copy_from_slice(&value.to_le_bytes());
    }

    std::fs::write(path, out)?;
    Ok(())
}

// ---------------------------------------------------------------------
// Minimal little-endian TIFF writer
// ---------------------------------------------------------------------

const TYPE_ASCII: u16 = 2;
const TYPE_SHORT: u16 = 3;
const TYPE_LONG: u16 = 4;
const TYPE_RATIONAL: u16 = 5;

enum EntryData {
    Short(u16),
    Long(u32),
    Rational(u32, u32),
    Ascii(Vec<u8>),
}

struct RawEntry {
    tag: u16,
    data: EntryData,
}

impl RawEntry {
    fn type_code(&self) -> u16 {
        match self.data {
            EntryData::Short(_) => TYPE_SHORT,
            EntryData::Long(_) => TYPE_LONG,
            EntryData::Rational(..) => TYPE_RATIONAL,
            EntryData::Ascii(_) => TYPE_ASCII,
        }
    }

    fn count(&self) -> u32 {
        match &self.data {
            EntryData::Ascii(bytes) => bytes.len() as u32,
            _ => 1,
        }
    }

    fn external_len(&self) -> usize {
        match &self.data {
            EntryData::Rational(..) => 8,
            EntryData::Ascii(bytes) if bytes.len() > 4 => bytes.len(),
            _ => 0,
        }
    }
}

fn rational(value: f32) -> (u32, u32) {
    if value <= 0.0 {
        return (0, 1);
    }
    ((value * 10_000.0).round() as u32, 10_000)
}

fn ascii(value: &str) -> Vec<u8> {
    let mut bytes = value.as_bytes().to_vec();
    bytes.push(0);
    bytes
}

pub(crate) fn encode_tiff_i32_aligned(
    img: &[f32],
    width: u32,
    height: u32,
    hdr: &TiffHeaderInfo,
) -> Result<Vec<u8>> {
    if img.len() != width as usize * height as usize {
        return Err(FramepackError::header_mismatch(format!(
            "{} samples do not fill a {}x{} image",
            img.len(),
            width,
            height
        )));
    }

    let strip_bytes = img.len() * 4;
    let mut entries = vec![
        RawEntry { tag: 256, data: EntryData::Long(width) },
        RawEntry { tag: 257, data: EntryData::Long(height) },
        RawEntry { tag: 258, data: EntryData::Short(32) },
        RawEntry { tag: 259, data: EntryData::Short(1) }, // no compression
        RawEntry { tag: 262, data: EntryData::Short(hdr.photometric) },
        RawEntry { tag: 273, data: EntryData::Long(0) }, // strip offset, patched below
        RawEntry { tag: 274, data: EntryData::Short(hdr.orientation) },
        RawEntry { tag: 277, data: EntryData::Short(1) },
        RawEntry { tag: 278, data: EntryData::Long(height) },
        RawEntry { tag: 279, data: EntryData::Long(strip_bytes as u32) },
        RawEntry {
            tag: 282,
            data: {
                let (n, d) = rational(hdr.x_resolution);
                EntryData::Rational(n, d)
            },
        },
        RawEntry {
            tag: 283,
            data: {
                let (n, d) = rational(hdr.y_resolution);
                EntryData::Rational(n, d)
            },
        },
        RawEntry { tag: 284, data: EntryData::Short(hdr.planar_config) },
        RawEntry { tag: 296, data: EntryData::Short(hdr.resolution_unit) },
        RawEntry { tag: 339, data: EntryData::Short(2) }, // signed integer samples
    ];
    if let Some(text) = &hdr.description {
        entries.push(RawEntry { tag: 270, data: EntryData::Ascii(ascii(text)) });
    }
    if let Some(text) = &hdr.software {
        entries.push(RawEntry { tag: 305, data: EntryData::Ascii(ascii(text)) });
    }
    if let Some(text) = &hdr.date_time {
        entries.push(RawEntry { tag: 306, data: EntryData::Ascii(ascii(text)) });
    }
    if let Some(text) = &hdr.artist {
        entries.push(RawEntry { tag: 315, data: EntryData::Ascii(ascii(text)) });
    }
    if let Some(text) = &hdr.copyright {
        entries.push(RawEntry { tag: 33432, data: EntryData::Ascii(ascii(text)) });
    }
    entries.sort_by_key(|e| e.tag);

    // Layout: 8-byte header, IFD, external values, zero pad, strip data
    let ifd_offset = 8usize;
    let ifd_len = 2 + entries.len() * 12 + 4;
    let external_start = ifd_offset + ifd_len;
    let external_len: usize = entries.iter().map(|e| e.external_len()).sum();
    let data_end = external_start + external_len;
    let strip_offset = data_end.div_ceil(STRIP_ALIGNMENT) * STRIP_ALIGNMENT;

    // Patch the strip offset now that it is known
    for entry in &mut entries {
        if entry.tag == 273 {
            entry.data = EntryData::Long(strip_offset as u32);
        }
    }

    let mut out = Vec::with_capacity(strip_offset + strip_bytes);
    out.extend_from_slice(b"II");
    out.extend_from_slice(&42u16.to_le_bytes());
    out.extend_from_slice(&(ifd_offset as u32).to_le_bytes());

    // IFD entries, 12 bytes each; external values are assigned offsets in
    // entry order after the IFD
    let mut external: Vec<u8> = Vec::with_capacity(external_len);
    out.extend_from_slice(&(entries.len() as u16).to_le_bytes());
    for entry in &entries {
        out.extend_from_slice(&entry.tag.to_le_bytes());
        out.extend_from_slice(&entry.type_code().to_le_bytes());
        out.extend_from_slice(&entry.count().to_le_bytes());

        let mut value_field = [0u8; 4];
        match &entry.data {
            EntryData::Short(v) => value_field[0..2].copy_from_slice(&v.to_le_bytes()),
            EntryData::Long(v) => value_field.copy_from_slice(&v.to_le_bytes()),
            EntryData::Rational(n, d) => {
                let offset = (external_start + external.len()) as u32;
                value_field.copy_from_slice(&offset.to_le_bytes());
                external.extend_from_slice(&n.to_le_bytes());
                external.extend_from_slice(&d.to_le_bytes());
            }
            EntryData::Ascii(bytes) => {
                if bytes.len() <= 4 {
                    value_field[..bytes.len()].copy_from_slice(bytes);
                } else {
                    let offset = (external_start + external.len()) as u32;
                    value_field.copy_from_slice(&offset.to_le_bytes());
                    external.extend_from_slice(bytes);
                }
            }
        }
        out.extend_from_slice(&value_field);
    }
    out.extend_from_slice(&0u32.to_le_bytes()); // no next IFD
    out.extend_from_slice(&external);

    out.resize(strip_offset, 0);
    for &sample in img {
        out.extend_from_slice(&(sample as i32).to_le_bytes());
    }
    Ok(out)
}

// ---------------------------------------------------------------------
// Tag reading helpers
// ---------------------------------------------------------------------

fn read_header_info<R: std::io::Read + std::io::Seek>(
    decoder: &mut Decoder<R>,
) -> TiffHeaderInfo {
    let defaults = TiffHeaderInfo::default();
    TiffHeaderInfo {
        compression: tag_u16(decoder, Tag::Compression).unwrap_or(defaults.compression),
        photometric: tag_u16(decoder, Tag::PhotometricInterpretation)
            .unwrap_or(defaults.photometric),
        orientation: tag_u16(decoder, Tag::Orientation).unwrap_or(defaults.orientation),
        planar_config: tag_u16(decoder, Tag::PlanarConfiguration)
            .unwrap_or(defaults.planar_config),
        x_resolution: tag_f32(decoder, Tag::XResolution).unwrap_or(defaults.x_resolution),
        y_resolution: tag_f32(decoder, Tag::YResolution).unwrap_or(defaults.y_resolution),
        resolution_unit: tag_u16(decoder, Tag::ResolutionUnit)
            .unwrap_or(defaults.resolution_unit),
        date_time: tag_string(decoder, Tag::DateTime),
        software: tag_string(decoder, Tag::Software),
        description: tag_string(decoder, Tag::ImageDescription),
        artist: tag_string(decoder, Tag::Artist),
        copyright: tag_string(decoder, Tag::Copyright),
    }
}

fn find_value<R: std::io::Read + std::io::Seek>(
    decoder: &mut Decoder<R>,
    tag: Tag,
) -> Option<Value> {
    match decoder.find_tag(tag) {
        Ok(value) => value,
        Err(e) => {
            warn!("failed to read tag {:?}: {}", tag, e);
            None
        }
    }
}

fn scalar_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Byte(v) => Some(*v as u64),
        Value::Short(v) => Some(*v as u64),
        Value::Unsigned(v) => Some(*v as u64),
        Value::UnsignedBig(v) => Some(*v),
        _ => None,
    }
}

fn tag_u16<R: std::io::Read + std::io::Seek>(decoder: &mut Decoder<R>, tag: Tag) -> Option<u16> {
    let value = find_value(decoder, tag)?;
    match &value {
        Value::List(items) => items.first().and_then(scalar_u64),
        other => scalar_u64(other),
    }
    .map(|v| v as u16)
}

fn tag_f32<R: std::io::Read + std::io::Seek>(decoder: &mut Decoder<R>, tag: Tag) -> Option<f32> {
    fn convert(value: &Value) -> Option<f32> {
        match value {
            Value::Float(v) => Some(*v),
            Value::Double(v) => Some(*v as f32),
            Value::Rational(n, d) if *d != 0 => Some(*n as f32 / *d as f32),
            Value::RationalBig(n, d) if *d != 0 => Some(*n as f32 / *d as f32),
            other => scalar_u64(other).map(|v| v as f32),
        }
    }
    let value = find_value(decoder, tag)?;
    match &value {
        Value::List(items) => items.first().and_then(convert),
        other => convert(other),
    }
}

fn tag_string<R: std::io::Read + std::io::Seek>(
    decoder: &mut Decoder<R>,
    tag: Tag,
) -> Option<String> {
    match find_value(decoder, tag)? {
        Value::Ascii(s) => Some(s),
        _ => None,
    }
}

fn tag_u64_vec<R: std::io::Read + std::io::Seek>(
    decoder: &mut Decoder<R>,
    tag: Tag,
) -> Option<Vec<u64>> {
    match find_value(decoder, tag)? {
        Value::List(items) => items.iter().map(scalar_u64).collect(),
        other => scalar_u64(&other).map(|v| vec![v]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn gradient(width: u32, height: u32) -> Vec<f32> {
        (0..width * height).map(|i| i as f32).collect()
    }

    #[test]
    fn test_aligned_writer_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.tif");
        let img = gradient(5, 4);
        let hdr = TiffHeaderInfo {
            software: Some("framepack".into()),
            date_time: Some("2025:11:08 12:00:00".into()),
            description: Some("merged frame".into()),
            ..TiffHeaderInfo::default()
        };

        write_tiff_i32_aligned(&path, &img, 5, 4, &hdr).unwrap();
        let bytes = std::fs::read(&path).unwrap();

        let (decoded, w, h, info) = read_tiff_f32(&bytes).unwrap();
        assert_eq!((w, h), (5, 4));
        assert_eq!(decoded, img);
        assert_eq!(info.software.as_deref(), Some("framepack"));
        assert_eq!(info.date_time.as_deref(), Some("2025:11:08 12:00:00"));
        assert_eq!(info.description.as_deref(), Some("merged frame"));
    }

    #[test]
    fn test_aligned_writer_strip_alignment() {
        let img = gradient(3, 3);
        let bytes =
            encode_tiff_i32_aligned(&img, 3, 3, &TiffHeaderInfo::default()).unwrap();

        let (offsets, counts) = strip_layout(&bytes).unwrap();
        assert_eq!(offsets.len(), 1);
        assert_eq!(offsets[0] % STRIP_ALIGNMENT as u64, 0);
        assert!(offsets[0] >= STRIP_ALIGNMENT as u64);
        assert_eq!(counts[0], 9 * 4);
        assert_eq!(bytes.len() as u64, offsets[0] + counts[0]);
    }

    #[test]
    fn test_negative_samples_truncate_toward_zero() {
        let img = vec![-1.0f32, -2.9, 3.7, 0.0];
        let bytes =
            encode_tiff_i32_aligned(&img, 2, 2, &TiffHeaderInfo::default()).unwrap();
        let (decoded, _, _, _) = read_tiff_f32(&bytes).unwrap();
        assert_eq!(decoded, vec![-1.0, -2.0, 3.0, 0.0]);
    }

    #[test]
    fn test_promotion_from_u16() {
        // Encode a u16 grayscale image with the tiff crate and confirm
        // samples come back promoted to f32
        let samples: Vec<u16> = (0u16..12).map(|v| v * 1000).collect();
        let mut buf = Cursor::new(Vec::new());
        let mut encoder = tiff::encoder::TiffEncoder::new(&mut buf).unwrap();
        encoder
            .write_image::<tiff::encoder::colortype::Gray16>(4, 3, &samples)
            .unwrap();
        let bytes = buf.into_inner();

        let (decoded, w, h, _) = read_tiff_f32(&bytes).unwrap();
        assert_eq!((w, h), (4, 3));
        let expected: Vec<f32> = samples.iter().map(|&v| v as f32).collect();
        assert_eq!(decoded, expected);
    }

    #[test]
    fn test_header_preserving_overwrite() {
        let hdr = TiffHeaderInfo {
            software: Some("detector v2".into()),
            artist: Some("beamline".into()),
            ..TiffHeaderInfo::default()
        };
        let original = encode_tiff_i32_aligned(&gradient(4, 2), 4, 2, &hdr).unwrap();

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("merged.tif");
        let replacement: Vec<f32> = (0..8).map(|v| (v * 10) as f32).collect();
        write_tiff_i32_with_original_header(&path, &replacement, 4, 2, &original).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes.len(), original.len());

        let (decoded, w, h, info) = read_tiff_f32(&bytes).unwrap();
        assert_eq!((w, h), (4, 2));
        assert_eq!(decoded, replacement);
        // Tags survive byte-for-byte
        assert_eq!(info.software.as_deref(), Some("detector v2"));
        assert_eq!(info.artist.as_deref(), Some("beamline"));
    }

    #[test]
    fn test_overwrite_rejects_dimension_mismatch() {
        let original =
            encode_tiff_i32_aligned(&gradient(4, 2), 4, 2, &TiffHeaderInfo::default()).unwrap();
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.tif");

        let wrong = gradient(3, 3);
        assert!(matches!(
            write_tiff_i32_with_original_header(&path, &wrong, 3, 3, &original),
            Err(FramepackError::HeaderMismatch(_))
        ));
        assert!(!path.exists());
    }

    #[test]
    fn test_encode_rejects_sample_count_mismatch() {
        assert!(matches!(
            encode_tiff_i32_aligned(&[1.0, 2.0], 3, 3, &TiffHeaderInfo::default()),
            Err(FramepackError::HeaderMismatch(_))
        ));
    }
}
