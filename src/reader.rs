//! Offline restore driver: extract or merge archived sets
//!
//! Enumerates the archives covering a requested run and frame range,
//! decodes each one in memory, and either writes the original frames back
//! out or hands them to the merger. Archives are spread across a small
//! fixed pool of worker threads; a damaged archive is logged and counted,
//! never fatal to the batch.

use crate::archive::{self, ArchiveEntry};
use crate::error::{FramepackError, Result};
use crate::merge;
use crate::utils::zero_pad;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Progress callback: `(archives done, archives total)`
pub type ProgressCallback = Arc<dyn Fn(usize, usize) + Send + Sync>;

/// What to do with each restored archive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreMode {
    /// Write every frame back to disk under its original name
    Extract,
    /// Sum frames channel-wise across the given phase count
    Merge {
        /// Number of phase-interleaved channels per output group
        phases: u32,
    },
}

/// Parameters for one restore batch
#[derive(Clone)]
pub struct RestoreRequest {
    /// Directory holding the `.lz4` archives
    pub input_dir: PathBuf,
    /// Directory restored/merged frames are written to
    pub output_dir: PathBuf,
    /// Filename prefix the archives were produced with
    pub prefix: String,
    /// First run to restore (inclusive)
    pub start_run: u16,
    /// Last run to restore (inclusive)
    pub end_run: u16,
    /// First frame number of the range (inclusive)
    pub start_image: u32,
    /// Last frame number of the range (inclusive)
    pub end_image: u32,
    /// Frames per archive, as configured on the archiver side
    pub set_size: u32,
    /// Divisor feeding merged-output numbering (instrument convention)
    pub frame_divisor: u32,
    /// Worker threads for the batch
    pub concurrency: usize,
    /// Restore mode
    pub mode: RestoreMode,
    /// Optional per-archive progress notification
    pub progress: Option<ProgressCallback>,
}

impl Default for RestoreRequest {
    fn default() -> Self {
        RestoreRequest {
            input_dir: PathBuf::from("Z:"),
            output_dir: PathBuf::from("Z:"),
            prefix: "test".to_string(),
            start_run: 1,
            end_run: 1,
            start_image: 1,
            end_image: 100,
            set_size: 100,
            frame_divisor: 10,
            concurrency: 3,
            mode: RestoreMode::Extract,
            progress: None,
        }
    }
}

impl RestoreRequest {
    fn validate(&self) -> Result<()> {
        if self.set_size == 0 || self.concurrency == 0 {
            return Err(FramepackError::InvalidConfiguration(
                "set size and concurrency must be at least 1".into(),
            ));
        }
        if self.end_run < self.start_run || self.end_image < self.start_image {
            return Err(FramepackError::InvalidConfiguration(
                "run and image ranges must not be empty".into(),
            ));
        }
        if let RestoreMode::Merge { phases } = self.mode {
            if phases == 0 {
                return Err(FramepackError::InvalidConfiguration(
                    "merge phase count must be at least 1".into(),
                ));
            }
        }
        Ok(())
    }

    /// Archive start frames covering `[start_image, end_image]`.
    fn set_starts(&self) -> Vec<u32> {
        let mut starts = Vec::new();
        let mut start = ((self.start_image - 1) / self.set_size) * self.set_size + 1;
        while start <= self.end_image {
            starts.push(start);
            start += self.set_size;
        }
        starts
    }
}

/// Outcome of a restore batch
#[derive(Debug, Default, Clone)]
pub struct RestoreStats {
    /// Archives decoded and handled
    pub archives_processed: usize,
    /// Archives that failed to decode or restore
    pub archives_failed: usize,
    /// Frames (or merged groups) written to the output directory
    pub files_written: usize,
}

/// Run one restore batch across all requested runs.
pub fn restore_archives(request: &RestoreRequest) -> Result<RestoreStats> {
    request.validate()?;
    std::fs::create_dir_all(&request.output_dir)?;

    let set_starts = request.set_starts();
    let total = set_starts.len() * (request.end_run - request.start_run + 1) as usize;
    info!(
        "restoring {} archives ({} per run) with {} workers",
        total,
        set_starts.len(),
        request.concurrency
    );

    let stats = Mutex::new(RestoreStats::default());
    let done = std::sync::atomic::AtomicUsize::new(0);

    for run in request.start_run..=request.end_run {
        let prefix_with_run = format!("{}_{}_", request.prefix, zero_pad(run as u32, 2));
        let batch_size = set_starts.len().div_ceil(request.concurrency).max(1);

        std::thread::scope(|scope| {
            for chunk in set_starts.chunks(batch_size) {
                let prefix_with_run = prefix_with_run.clone();
                let stats = &stats;
                let done = &done;
                scope.spawn(move || {
                    debug!(
                        "processing batch {}{:05}..{:05}",
                        prefix_with_run,
                        chunk[0],
                        chunk[chunk.len() - 1]
                    );
                    for &set_start in chunk {
                        let archive_name =
                            format!("{}{}.lz4", prefix_with_run, zero_pad(set_start, 5));
                        let archive_path = request.input_dir.join(&archive_name);
                        match restore_one(request, &archive_path, &prefix_with_run, set_start)
                        {
                            Ok(written) => {
                                let mut stats = stats.lock();
                                stats.archives_processed += 1;
                                stats.files_written += written;
                            }
                            Err(e) => {
                                error!("failed to restore {}: {}", archive_name, e);
                                stats.lock().archives_failed += 1;
                            }
                        }
                        if let Some(progress) = &request.progress {
                            let count =
                                done.fetch_add(1, std::sync::atomic::Ordering::Relaxed) + 1;
                            progress(count, total);
                        }
                    }
                });
            }
        });
    }

    let stats = stats.into_inner();
    info!(
        "restore finished: {} archives ok, {} failed, {} files written",
        stats.archives_processed, stats.archives_failed, stats.files_written
    );
    Ok(stats)
}

fn restore_one(
    request: &RestoreRequest,
    archive_path: &Path,
    prefix_with_run: &str,
    set_start: u32,
) -> Result<usize> {
    info!("processing {:?}", archive_path);
    let entries = archive::read_archive_file(archive_path)?;
    if entries.is_empty() {
        return Err(FramepackError::malformed("archive holds no entries"));
    }

    match request.mode {
        RestoreMode::Extract => extract_entries(&entries, &request.output_dir),
        RestoreMode::Merge { phases } => merge::merge_entries(
            &entries,
            prefix_with_run,
            &request.output_dir,
            set_start,
            set_start + request.set_size - 1,
            phases,
            request.frame_divisor,
        ),
    }
}

/// Write every TIFF entry back to disk under its original name.
pub fn extract_entries(entries: &[ArchiveEntry], output_dir: &Path) -> Result<usize> {
    std::fs::create_dir_all(output_dir)?;
    let mut written = 0usize;
    for entry in entries {
        let is_tiff = Path::new(&entry.name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("tif") || e.eq_ignore_ascii_case("tiff"))
            .unwrap_or(false);
        if !is_tiff {
            debug!("skipping non-TIFF entry {}", entry.name);
            continue;
        }
        std::fs::write(output_dir.join(&entry.name), &entry.data)?;
        written += 1;
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::build_archive;
    use std::fs;
    use tempfile::TempDir;

    fn make_archive(dir: &Path, name: &str, frames: &[(String, Vec<u8>)]) {
        let files: Vec<(PathBuf, Vec<u8>)> = frames
            .iter()
            .map(|(n, d)| (PathBuf::from(n), d.clone()))
            .collect();
        let bytes = build_archive(&files, 1).unwrap();
        fs::write(dir.join(name), bytes).unwrap();
    }

    #[test]
    fn test_set_starts_cover_requested_range() {
        let request = RestoreRequest {
            start_image: 1,
            end_image: 250,
            set_size: 100,
            ..RestoreRequest::default()
        };
        assert_eq!(request.set_starts(), vec![1, 101, 201]);

        let request = RestoreRequest {
            start_image: 150,
            end_image: 250,
            set_size: 100,
            ..RestoreRequest::default()
        };
        assert_eq!(request.set_starts(), vec![101, 201]);
    }

    #[test]
    fn test_extract_round_trip() {
        let input = TempDir::new().unwrap();
        let output = TempDir::new().unwrap();

        let frames_a: Vec<(String, Vec<u8>)> = (1..=2)
            .map(|i| {
                (
                    format!("test_01_{:05}.tif", i),
                    format!("frame {}", i).into_bytes(),
                )
            })
            .collect();
        let frames_b: Vec<(String, Vec<u8>)> = (3..=4)
            .map(|i| {
                (
                    format!("test_01_{:05}.tif", i),
                    format!("frame {}", i).into_bytes(),
                )
            })
            .collect();
        make_archive(input.path(), "test_01_00001.lz4", &frames_a);
        make_archive(input.path(), "test_01_00003.lz4", &frames_b);

        let request = RestoreRequest {
            input_dir: input.path().to_path_buf(),
            output_dir: output.path().to_path_buf(),
            start_image: 1,
            end_image: 4,
            set_size: 2,
            mode: RestoreMode::Extract,
            ..RestoreRequest::default()
        };
        let stats = restore_archives(&request).unwrap();

        assert_eq!(stats.archives_processed, 2);
        assert_eq!(stats.archives_failed, 0);
        assert_eq!(stats.files_written, 4);
        for i in 1..=4 {
            let path = output.path().join(format!("test_01_{:05}.tif", i));
            assert_eq!(fs::read(path).unwrap(), format!("frame {}", i).into_bytes());
        }
    }

    #[test]
    fn test_missing_archive_is_counted_not_fatal() {
        let input = TempDir::new().unwrap();
        let output = TempDir::new().unwrap();
        make_archive(
            input.path(),
            "test_01_00001.lz4",
            &[("test_01_00001.tif".to_string(), b"x".to_vec())],
        );

        let request = RestoreRequest {
            input_dir: input.path().to_path_buf(),
            output_dir: output.path().to_path_buf(),
            start_image: 1,
            end_image: 2,
            set_size: 1,
            mode: RestoreMode::Extract,
            ..RestoreRequest::default()
        };
        let stats = restore_archives(&request).unwrap();
        assert_eq!(stats.archives_processed, 1);
        assert_eq!(stats.archives_failed, 1);
    }

    #[test]
    fn test_extract_skips_non_tiff_entries() {
        let output = TempDir::new().unwrap();
        let entries = vec![
            ArchiveEntry {
                name: "test_01_00001.tif".into(),
                data: b"tiff bytes".to_vec(),
            },
            ArchiveEntry {
                name: "notes.txt".into(),
                data: b"not a frame".to_vec(),
            },
        ];
        let written = extract_entries(&entries, output.path()).unwrap();
        assert_eq!(written, 1);
        assert!(output.path().join("test_01_00001.tif").exists());
        assert!(!output.path().join("notes.txt").exists());
    }

    #[test]
    fn test_progress_callback_counts_archives() {
        let input = TempDir::new().unwrap();
        let output = TempDir::new().unwrap();
        for start in [1u32, 2] {
            make_archive(
                input.path(),
                &format!("test_01_{:05}.lz4", start),
                &[(format!("test_01_{:05}.tif", start), b"x".to_vec())],
            );
        }

        let seen = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let seen_cb = seen.clone();
        let request = RestoreRequest {
            input_dir: input.path().to_path_buf(),
            output_dir: output.path().to_path_buf(),
            start_image: 1,
            end_image: 2,
            set_size: 1,
            mode: RestoreMode::Extract,
            progress: Some(Arc::new(move |_, _| {
                seen_cb.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            })),
            ..RestoreRequest::default()
        };
        restore_archives(&request).unwrap();
        assert_eq!(seen.load(std::sync::atomic::Ordering::Relaxed), 2);
    }
}
