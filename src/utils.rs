//! Small shared helpers: timestamps, atomic writes, zero-padded numbers.

use crate::error::Result;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Convert a [`SystemTime`] to milliseconds since the Unix epoch.
///
/// Stored as a signed 64-bit value so that pre-epoch timestamps (seen on
/// some network shares after clock adjustments) survive a save/load cycle.
pub fn system_time_millis(t: SystemTime) -> i64 {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_millis() as i64,
        Err(e) => -(e.duration().as_millis() as i64),
    }
}

/// Read a file's modification time as epoch milliseconds.
pub fn modified_millis(path: &Path) -> std::io::Result<i64> {
    let meta = fs::metadata(path)?;
    Ok(system_time_millis(meta.modified()?))
}

/// Write `bytes` to `path` atomically: write a sibling temp file, flush,
/// then rename over the destination.
///
/// A crash mid-write leaves either the old file or no file, never a
/// truncated one.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = temp_sibling(path);
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

fn temp_sibling(path: &Path) -> std::path::PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Format `number` zero-padded to `width` digits.
pub fn zero_pad(number: u32, width: usize) -> String {
    format!("{:0width$}", number, width = width)
}

/// Format a byte count for logs.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[unit])
    } else {
        format!("{:.2} {}", value, UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_system_time_millis() {
        let t = UNIX_EPOCH + Duration::from_millis(1_234_567);
        assert_eq!(system_time_millis(t), 1_234_567);

        let before = UNIX_EPOCH - Duration::from_millis(500);
        assert_eq!(system_time_millis(before), -500);
    }

    #[test]
    fn test_write_atomic() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.bin");

        write_atomic(&path, b"first").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"first");

        // Overwrite must replace, not append
        write_atomic(&path, b"second").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"second");

        // No temp file left behind
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_zero_pad() {
        assert_eq!(zero_pad(1, 5), "00001");
        assert_eq!(zero_pad(12345, 5), "12345");
        assert_eq!(zero_pad(3, 2), "03");
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.50 KB");
    }
}
