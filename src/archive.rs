//! LZ4 archive container codec
//!
//! One archive holds a complete set: the byte-wise concatenation of the
//! source frames, block-compressed, preceded by a metadata table describing
//! how to slice the payload back into files.
//!
//! ## On-disk layout (little-endian throughout)
//!
//! ```text
//! u64   metadata_size
//! bytes metadata section
//! u64   compressed_size
//! bytes compressed payload
//! ```
//!
//! Metadata section:
//!
//! ```text
//! u32 magic    = 0x41345A4C ("LZ4A")
//! u32 version  = 1
//! u64 file_count
//! file_count times:
//!   u32 name_len;  bytes name
//!   u32 ext_len;   bytes ext
//!   u64 original_size
//!   u64 payload_offset       // within the uncompressed payload
//! ```
//!
//! [`build_archive`] never returns bytes that failed the in-memory round
//! trip: the produced archive is decompressed and compared against the
//! inputs before being handed back. That check is the only thing standing
//! between a bad compressor and deleted source frames, so it is not
//! optional.

use crate::error::{FramepackError, Result};
use lz4::block::CompressionMode;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

/// Archive magic number, "LZ4A" read as a little-endian u32
pub const ARCHIVE_MAGIC: u32 = 0x4134_5A4C;

/// Current container format revision
pub const ARCHIVE_VERSION: u32 = 1;

// LZ4 block compression is limited to ~2 GB of input (LZ4_MAX_INPUT_SIZE).
const MAX_PAYLOAD: usize = 0x7E00_0000;

/// Metadata for one file inside an archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryMeta {
    /// Original filename (no directory)
    pub name: String,
    /// Original extension including the leading dot, e.g. `.tif`
    pub ext: String,
    /// Uncompressed size in bytes
    pub original_size: u64,
    /// Offset of this file within the concatenated payload
    pub payload_offset: u64,
}

/// One file reconstituted from an archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    /// Original filename
    pub name: String,
    /// Original file content
    pub data: Vec<u8>,
}

/// Build a self-checked archive from ordered `(path, bytes)` pairs.
///
/// `acceleration` is the LZ4 speed dial: 1 compresses at the default ratio,
/// higher values trade ratio for throughput.
///
/// # Errors
///
/// [`FramepackError::CompressFailure`] if the input is empty, oversized, or
/// the compressor errors; [`FramepackError::IntegrityFailure`] if the
/// round-trip self-check cannot reproduce the inputs.
pub fn build_archive(files: &[(PathBuf, Vec<u8>)], acceleration: i32) -> Result<Vec<u8>> {
    if files.is_empty() {
        return Err(FramepackError::compress("no files to compress"));
    }

    // Metadata table with cumulative payload offsets
    let mut metadata = Vec::with_capacity(files.len());
    let mut offset = 0u64;
    let mut total = 0usize;
    for (path, data) in files {
        metadata.push(EntryMeta {
            name: file_name_of(path),
            ext: extension_of(path),
            original_size: data.len() as u64,
            payload_offset: offset,
        });
        offset += data.len() as u64;
        total += data.len();
    }

    if total > MAX_PAYLOAD {
        return Err(FramepackError::compress(format!(
            "payload of {} bytes exceeds the LZ4 block limit",
            total
        )));
    }

    // Concatenate payloads in metadata order
    let mut payload = Vec::with_capacity(total);
    for (_, data) in files {
        payload.extend_from_slice(data);
    }

    let bound = lz4::block::compress_bound(payload.len())
        .map_err(|e| FramepackError::compress(format!("compress bound failed: {}", e)))?;
    let mut compressed = vec![0u8; bound];
    let compressed_len = lz4::block::compress_to_buffer(
        &payload,
        Some(CompressionMode::FAST(acceleration)),
        false,
        &mut compressed,
    )
    .map_err(|e| FramepackError::compress(format!("LZ4 compression failed: {}", e)))?;
    compressed.truncate(compressed_len);

    trace!(
        "compressed {} files: {} -> {} bytes ({:.1}%)",
        files.len(),
        payload.len(),
        compressed_len,
        if payload.is_empty() {
            100.0
        } else {
            compressed_len as f64 / payload.len() as f64 * 100.0
        }
    );

    let meta_bytes = serialize_metadata(&metadata);

    let mut out = Vec::with_capacity(16 + meta_bytes.len() + compressed.len());
    out.extend_from_slice(&(meta_bytes.len() as u64).to_le_bytes());
    out.extend_from_slice(&meta_bytes);
    out.extend_from_slice(&(compressed.len() as u64).to_le_bytes());
    out.extend_from_slice(&compressed);

    verify_round_trip(&out, files)?;

    Ok(out)
}

/// Decompress the self-check copy and compare it entry-for-entry against
/// the inputs. Runs entirely in memory, before anything touches disk.
fn verify_round_trip(archive: &[u8], files: &[(PathBuf, Vec<u8>)]) -> Result<()> {
    let entries = read_archive(archive)
        .map_err(|e| FramepackError::integrity(format!("self-check decode failed: {}", e)))?;

    if entries.len() != files.len() {
        return Err(FramepackError::integrity(format!(
            "self-check produced {} entries, expected {}",
            entries.len(),
            files.len()
        )));
    }
    for (entry, (path, data)) in entries.iter().zip(files) {
        if entry.data.len() != data.len() {
            return Err(FramepackError::integrity(format!(
                "self-check size mismatch for {}: {} != {}",
                entry.name,
                entry.data.len(),
                data.len()
            )));
        }
        if entry.data != *data {
            return Err(FramepackError::integrity(format!(
                "self-check content mismatch for {:?}",
                path
            )));
        }
    }
    debug!("self-check passed for {} entries", entries.len());
    Ok(())
}

/// Reconstitute the original files from archive bytes.
///
/// # Errors
///
/// [`FramepackError::MalformedArchive`] on framing or metadata damage,
/// [`FramepackError::UnsupportedVersion`] on version skew, and
/// [`FramepackError::CorruptPayload`] when decompression does not produce
/// the byte count the metadata promises.
pub fn read_archive(bytes: &[u8]) -> Result<Vec<ArchiveEntry>> {
    let mut reader = ByteReader::new(bytes);

    let metadata_size = reader.read_u64()? as usize;
    let meta_bytes = reader.read_bytes(metadata_size)?;
    let metadata = parse_metadata(meta_bytes)?;

    let compressed_size = reader.read_u64()? as usize;
    let compressed = reader.read_bytes(compressed_size)?;

    let total: u64 = metadata.iter().map(|m| m.original_size).sum();
    if total as usize > MAX_PAYLOAD {
        return Err(FramepackError::malformed(format!(
            "metadata claims {} payload bytes, beyond the block limit",
            total
        )));
    }

    let mut payload = vec![0u8; total as usize];
    let produced = if total == 0 {
        0
    } else {
        lz4::block::decompress_to_buffer(compressed, Some(total as i32), &mut payload)
            .map_err(|_| FramepackError::CorruptPayload {
                expected: total,
                actual: 0,
            })?
    };
    if produced as u64 != total {
        return Err(FramepackError::CorruptPayload {
            expected: total,
            actual: produced as u64,
        });
    }

    let mut entries = Vec::with_capacity(metadata.len());
    for meta in &metadata {
        let start = meta.payload_offset as usize;
        let end = start + meta.original_size as usize;
        entries.push(ArchiveEntry {
            name: meta.name.clone(),
            data: payload[start..end].to_vec(),
        });
    }
    Ok(entries)
}

/// Read and decode an archive file from disk.
pub fn read_archive_file(path: &Path) -> Result<Vec<ArchiveEntry>> {
    let bytes = std::fs::read(path)?;
    read_archive(&bytes)
}

fn serialize_metadata(metadata: &[EntryMeta]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&ARCHIVE_MAGIC.to_le_bytes());
    out.extend_from_slice(&ARCHIVE_VERSION.to_le_bytes());
    out.extend_from_slice(&(metadata.len() as u64).to_le_bytes());
    for meta in metadata {
        out.extend_from_slice(&(meta.name.len() as u32).to_le_bytes());
        out.extend_from_slice(meta.name.as_bytes());
        out.extend_from_slice(&(meta.ext.len() as u32).to_le_bytes());
        out.extend_from_slice(meta.ext.as_bytes());
        out.extend_from_slice(&meta.original_size.to_le_bytes());
        out.extend_from_slice(&meta.payload_offset.to_le_bytes());
    }
    out
}

fn parse_metadata(bytes: &[u8]) -> Result<Vec<EntryMeta>> {
    let mut reader = ByteReader::new(bytes);

    let magic = reader.read_u32()?;
    if magic != ARCHIVE_MAGIC {
        return Err(FramepackError::malformed(format!(
            "bad magic number 0x{:08X}",
            magic
        )));
    }
    let version = reader.read_u32()?;
    if version != ARCHIVE_VERSION {
        return Err(FramepackError::UnsupportedVersion { found: version });
    }

    let file_count = reader.read_u64()?;
    let mut metadata = Vec::new();
    let mut expected_offset = 0u64;
    for _ in 0..file_count {
        let name_len = reader.read_u32()? as usize;
        let name = String::from_utf8(reader.read_bytes(name_len)?.to_vec())
            .map_err(|_| FramepackError::malformed("entry name is not valid UTF-8"))?;
        let ext_len = reader.read_u32()? as usize;
        let ext = String::from_utf8(reader.read_bytes(ext_len)?.to_vec())
            .map_err(|_| FramepackError::malformed("entry extension is not valid UTF-8"))?;
        let original_size = reader.read_u64()?;
        let payload_offset = reader.read_u64()?;

        // Offsets must tile the payload exactly
        if payload_offset != expected_offset {
            return Err(FramepackError::malformed(format!(
                "payload offset {} for {} does not follow previous entry (expected {})",
                payload_offset, name, expected_offset
            )));
        }
        expected_offset = expected_offset.checked_add(original_size).ok_or_else(|| {
            FramepackError::malformed("payload offsets overflow")
        })?;

        metadata.push(EntryMeta {
            name,
            ext,
            original_size,
            payload_offset,
        });
    }
    Ok(metadata)
}

/// Bounds-checked little-endian reader over a byte slice
struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        ByteReader { buf, pos: 0 }
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(len).filter(|&e| e <= self.buf.len());
        match end {
            Some(end) => {
                let slice = &self.buf[self.pos..end];
                self.pos = end;
                Ok(slice)
            }
            None => Err(FramepackError::malformed(format!(
                "truncated at offset {} (wanted {} bytes of {})",
                self.pos,
                len,
                self.buf.len()
            ))),
        }
    }

    fn read_u32(&mut self) -> Result<u32> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
    }

    fn read_u64(&mut self) -> Result<u64> {
        let bytes = self.read_bytes(8)?;
        Ok(u64::from_le_bytes(bytes.try_into().unwrap()))
    }
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn extension_of(path: &Path) -> String {
    path.extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_files() -> Vec<(PathBuf, Vec<u8>)> {
        vec![
            (
                PathBuf::from("/data/test_01_00001.tif"),
                b"first frame content".repeat(20),
            ),
            (
                PathBuf::from("/data/test_01_00002.tif"),
                vec![0u8; 1024],
            ),
            (
                PathBuf::from("/data/test_01_00003.tif"),
                (0u32..256).flat_map(|v| v.to_le_bytes()).collect(),
            ),
        ]
    }

    #[test]
    fn test_round_trip() {
        let files = sample_files();
        let archive = build_archive(&files, 1).unwrap();
        let entries = read_archive(&archive).unwrap();

        assert_eq!(entries.len(), files.len());
        for (entry, (path, data)) in entries.iter().zip(&files) {
            assert_eq!(entry.name, path.file_name().unwrap().to_string_lossy());
            assert_eq!(&entry.data, data);
        }
    }

    #[test]
    fn test_archive_size_formula() {
        let files = sample_files();
        let archive = build_archive(&files, 4).unwrap();

        let metadata_size = u64::from_le_bytes(archive[0..8].try_into().unwrap()) as usize;
        let compressed_size = u64::from_le_bytes(
            archive[8 + metadata_size..16 + metadata_size].try_into().unwrap(),
        ) as usize;
        assert_eq!(archive.len(), 16 + metadata_size + compressed_size);
    }

    #[test]
    fn test_metadata_offsets_are_cumulative() {
        let files = sample_files();
        let archive = build_archive(&files, 1).unwrap();
        let metadata_size = u64::from_le_bytes(archive[0..8].try_into().unwrap()) as usize;
        let metadata = parse_metadata(&archive[8..8 + metadata_size]).unwrap();

        assert_eq!(metadata[0].payload_offset, 0);
        for pair in metadata.windows(2) {
            assert_eq!(
                pair[1].payload_offset,
                pair[0].payload_offset + pair[0].original_size
            );
        }
        assert_eq!(metadata[0].ext, ".tif");
    }

    #[test]
    fn test_empty_file_entry() {
        let files = vec![
            (PathBuf::from("empty.tif"), Vec::new()),
            (PathBuf::from("full.tif"), vec![42u8; 512]),
        ];
        let archive = build_archive(&files, 1).unwrap();
        let entries = read_archive(&archive).unwrap();
        assert!(entries[0].data.is_empty());
        assert_eq!(entries[1].data, vec![42u8; 512]);
    }

    #[test]
    fn test_no_files_rejected() {
        assert!(matches!(
            build_archive(&[], 1),
            Err(FramepackError::CompressFailure(_))
        ));
    }

    #[test]
    fn test_bad_magic() {
        let files = sample_files();
        let mut archive = build_archive(&files, 1).unwrap();
        archive[8] ^= 0xFF; // first metadata byte is the magic
        assert!(matches!(
            read_archive(&archive),
            Err(FramepackError::MalformedArchive(_))
        ));
    }

    #[test]
    fn test_unsupported_version() {
        let files = sample_files();
        let mut archive = build_archive(&files, 1).unwrap();
        // Version field sits right after the magic in the metadata section
        archive[12..16].copy_from_slice(&99u32.to_le_bytes());
        assert!(matches!(
            read_archive(&archive),
            Err(FramepackError::UnsupportedVersion { found: 99 })
        ));
    }

    #[test]
    fn test_truncated_archive() {
        let files = sample_files();
        let archive = build_archive(&files, 1).unwrap();
        assert!(matches!(
            read_archive(&archive[..archive.len() - 10]),
            Err(FramepackError::MalformedArchive(_))
        ));
        assert!(matches!(
            read_archive(&archive[..4]),
            Err(FramepackError::MalformedArchive(_))
        ));
    }

    #[test]
    fn test_corrupt_payload() {
        let files = sample_files();
        let mut archive = build_archive(&files, 1).unwrap();
        // Stomp on the compressed section
        let len = archive.len();
        for byte in archive[len - 20..].iter_mut() {
            *byte = 0xAA;
        }
        assert!(matches!(
            read_archive(&archive),
            Err(FramepackError::CorruptPayload { .. })
        ));
    }

    #[test]
    fn test_acceleration_levels_round_trip() {
        let files = sample_files();
        for accel in [1, 4, 16] {
            let archive = build_archive(&files, accel).unwrap();
            let entries = read_archive(&archive).unwrap();
            assert_eq!(entries.len(), files.len());
        }
    }
}
