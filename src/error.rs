//! Error types for the framepack library
//!
//! One enum covers every failure the monitor, codec, and restore tools can
//! surface. Worker-side failures (read/compress/verify/write) all resolve to
//! "leave the sources alone and retry the set later"; reader-side failures
//! resolve to "log and yield nothing".

use std::path::PathBuf;
use thiserror::Error;

/// Type alias for Results in the framepack library
pub type Result<T> = std::result::Result<T, FramepackError>;

/// Main error type for all framepack operations
#[derive(Debug, Error)]
pub enum FramepackError {
    /// I/O errors during file operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A source frame could not be fully read
    #[error("Read failure: {0}")]
    ReadFailure(String),

    /// The block compressor reported an error
    #[error("Compress failure: {0}")]
    CompressFailure(String),

    /// The in-memory round-trip self-check did not reproduce the inputs
    #[error("Integrity failure: {0}")]
    IntegrityFailure(String),

    /// The archive could not be written, or landed with the wrong size
    #[error("Write failure for {path:?}: expected {expected} bytes, found {actual}")]
    WriteFailure {
        /// Output path that failed
        path: PathBuf,
        /// Size the archive should have had
        expected: u64,
        /// Size observed on disk
        actual: u64,
    },

    /// Archive framing or metadata could not be parsed
    #[error("Malformed archive: {0}")]
    MalformedArchive(String),

    /// Archive was written by an incompatible format revision
    #[error("Unsupported archive version: {found}")]
    UnsupportedVersion {
        /// Version number found in the metadata section
        found: u32,
    },

    /// Decompressed payload does not match the metadata
    #[error("Corrupt payload: expected {expected} bytes, decompressed {actual}")]
    CorruptPayload {
        /// Sum of the original sizes in the metadata table
        expected: u64,
        /// Byte count actually produced by decompression
        actual: u64,
    },

    /// The persistent index file could not be loaded
    #[error("Index corrupt: {0}")]
    IndexCorrupt(String),

    /// A TIFF to be rewritten does not match the merged image geometry
    #[error("Header mismatch: {0}")]
    HeaderMismatch(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Errors during bincode serialization/deserialization
    #[error("Bincode error: {0}")]
    Bincode(String),

    /// Thread pool construction error
    #[error("Thread pool error: {0}")]
    ThreadPool(String),

    /// Frame pattern could not be compiled
    #[error("Pattern error: {0}")]
    Pattern(#[from] regex::Error),

    /// Errors surfaced by the TIFF collaborator
    #[error("TIFF error: {0}")]
    Tiff(#[from] tiff::TiffError),
}

// Implement conversions for bincode 2.0 error types
impl From<bincode::error::DecodeError> for FramepackError {
    fn from(err: bincode::error::DecodeError) -> Self {
        FramepackError::Bincode(err.to_string())
    }
}

impl From<bincode::error::EncodeError> for FramepackError {
    fn from(err: bincode::error::EncodeError) -> Self {
        FramepackError::Bincode(err.to_string())
    }
}

impl FramepackError {
    /// Create a read-failure error with a custom message
    pub fn read(msg: impl Into<String>) -> Self {
        FramepackError::ReadFailure(msg.into())
    }

    /// Create a compress error with a custom message
    pub fn compress(msg: impl Into<String>) -> Self {
        FramepackError::CompressFailure(msg.into())
    }

    /// Create an integrity error with a custom message
    pub fn integrity(msg: impl Into<String>) -> Self {
        FramepackError::IntegrityFailure(msg.into())
    }

    /// Create a malformed-archive error with a custom message
    pub fn malformed(msg: impl Into<String>) -> Self {
        FramepackError::MalformedArchive(msg.into())
    }

    /// Create a header-mismatch error with a custom message
    pub fn header_mismatch(msg: impl Into<String>) -> Self {
        FramepackError::HeaderMismatch(msg.into())
    }

    /// True for errors that leave the source set intact and retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FramepackError::Io(_)
                | FramepackError::ReadFailure(_)
                | FramepackError::CompressFailure(_)
                | FramepackError::IntegrityFailure(_)
                | FramepackError::WriteFailure { .. }
        )
    }
}
