//! Set-processing pipeline: read → compress → verify → write → delete
//!
//! One call archives one complete set. The ordering is transactional:
//! sources are only queued for deletion after the self-checked archive is
//! on disk with the expected size. Any failure before that point leaves
//! the set untouched for a later retry.

use crate::archive;
use crate::deleter::DeleteHandle;
use crate::error::{FramepackError, Result};
use crate::types::{FileSet, MonitorConfig};
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Archive one complete set into the output directory.
///
/// Succeeds without work when the output archive already exists. On
/// success the set's sources (minus its first frame) are enqueued for
/// deletion when `config.delete_after` is set.
pub fn process_file_set(
    set: &FileSet,
    config: &MonitorConfig,
    deleter: &DeleteHandle,
) -> Result<()> {
    let start = Instant::now();
    let output_path = set.key.archive_path(&config.output_dir, &config.prefix);

    if output_path.exists() {
        info!("skipping already processed set: {:?}", output_path);
        return Ok(());
    }

    let paths: Vec<PathBuf> = set.paths().cloned().collect();
    let files = read_files_parallel(&paths, config.max_threads)?;

    let bytes = archive::build_archive(&files, config.acceleration)?;
    drop(files);

    write_archive(&output_path, &bytes)?;

    // One raw representative frame stays visible next to the archive.
    // Failures here are logged but do not fail the set.
    if let Some(first) = set.first_file() {
        let dest = config.output_dir.join(
            first
                .file_name()
                .map(|n| n.to_os_string())
                .unwrap_or_default(),
        );
        if let Err(e) = std::fs::copy(first, &dest) {
            warn!("failed to copy first file {:?} to {:?}: {}", first, dest, e);
        }
    }

    if config.delete_after {
        deleter.push(paths, set.first_file().cloned());
    }

    info!(
        "created {:?} ({} files) in {} ms",
        output_path.file_name().unwrap_or_default(),
        set.files.len(),
        start.elapsed().as_millis()
    );
    Ok(())
}

/// Read every source file across a dedicated pool of `max_threads`
/// readers, preserving set order.
fn read_files_parallel(paths: &[PathBuf], max_threads: usize) -> Result<Vec<(PathBuf, Vec<u8>)>> {
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(max_threads.max(1))
        .build()
        .map_err(|e| FramepackError::ThreadPool(e.to_string()))?;

    let results: Vec<Result<(PathBuf, Vec<u8>)>> = pool.install(|| {
        paths
            .par_iter()
            .map(|path| read_exact(path).map(|data| (path.clone(), data)))
            .collect()
    });

    let mut files = Vec::with_capacity(paths.len());
    for result in results {
        files.push(result?);
    }
    if files.len() != paths.len() {
        return Err(FramepackError::read(format!(
            "read {} of {} files",
            files.len(),
            paths.len()
        )));
    }
    Ok(files)
}

/// Read a whole file, treating a size mismatch against the stat result as
/// a short read.
fn read_exact(path: &Path) -> Result<Vec<u8>> {
    use std::io::Read;

    let mut file = std::fs::File::open(path)
        .map_err(|e| FramepackError::read(format!("cannot open {:?}: {}", path, e)))?;
    let expected = file
        .metadata()
        .map_err(|e| FramepackError::read(format!("cannot stat {:?}: {}", path, e)))?
        .len();

    let mut data = Vec::with_capacity(expected as usize);
    file.read_to_end(&mut data)
        .map_err(|e| FramepackError::read(format!("cannot read {:?}: {}", path, e)))?;

    if data.len() as u64 != expected {
        return Err(FramepackError::read(format!(
            "short read on {:?}: expected {} bytes, got {}",
            path,
            expected,
            data.len()
        )));
    }
    Ok(data)
}

/// Atomically write the archive and verify its on-disk size.
fn write_archive(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    crate::utils::write_atomic(path, bytes)?;

    let actual = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
    if actual != bytes.len() as u64 {
        let _ = std::fs::remove_file(path);
        return Err(FramepackError::WriteFailure {
            path: path.to_path_buf(),
            expected: bytes.len() as u64,
            actual,
        });
    }
    debug!("wrote {:?} ({} bytes)", path, actual);
    Ok(())
}
