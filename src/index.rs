//! Persistent set index for fast change detection
//!
//! The index maps every frame the scanner has seen to its owning
//! `(run, set)` key, together with the last observed modification time.
//! Comparing modification times lets incremental scans skip unchanged
//! files without re-reading them, and the on-disk copy lets a restarted
//! monitor pick up exactly where it stopped.
//!
//! The index file lives at `<watch_dir>/.file_index.bin`. Its layout is an
//! implementation detail: a corrupt or incompatible file is discarded and
//! the index rebuilt from the next scan, never trusted for restart
//! decisions.
//!
//! All access is serialized through the single lock the monitor holds
//! around each public operation; the struct itself carries no interior
//! locking.

use crate::error::Result;
use crate::types::{FileSet, TaskKey};
use crate::utils::write_atomic;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tracing::{debug, info, trace, warn};

/// Name of the index file inside the watched directory
pub const INDEX_FILE_NAME: &str = ".file_index.bin";

#[derive(Serialize, Deserialize)]
struct PersistedSet {
    key: TaskKey,
    processed: bool,
    /// (frame number, path, modification time in epoch ms)
    files: Vec<(u32, PathBuf, i64)>,
}

#[derive(Serialize, Deserialize)]
struct PersistedIndex {
    sets: Vec<PersistedSet>,
}

/// Persistent `(run, set)` → file-set mapping
pub struct FileIndex {
    index_path: PathBuf,
    set_size: u32,
    dirty: bool,
    file_sets: BTreeMap<TaskKey, FileSet>,
    path_keys: HashMap<PathBuf, TaskKey>,
    mod_times: HashMap<PathBuf, i64>,
}

impl FileIndex {
    /// Open the index for `watch_dir`, loading any existing index file.
    ///
    /// A missing file yields an empty index. A file that fails to decode is
    /// logged and discarded; the next scan rebuilds it.
    pub fn open(watch_dir: &Path, set_size: u32) -> Self {
        let index_path = watch_dir.join(INDEX_FILE_NAME);
        let mut index = FileIndex {
            index_path,
            set_size,
            dirty: false,
            file_sets: BTreeMap::new(),
            path_keys: HashMap::new(),
            mod_times: HashMap::new(),
        };
        index.load();
        index
    }

    /// Number of tracked files.
    pub fn len(&self) -> usize {
        self.path_keys.len()
    }

    /// True when no files are tracked.
    pub fn is_empty(&self) -> bool {
        self.path_keys.is_empty()
    }

    /// Insert or update one frame. Idempotent.
    ///
    /// Computes the owning key from `(run, frame_number)`, creates the set
    /// if needed, and records the modification time. `processed` only
    /// initializes newly created sets; re-observing a frame never flips an
    /// existing set's flag.
    pub fn add_file(
        &mut self,
        path: &Path,
        run: u16,
        frame_number: u32,
        mod_time_ms: i64,
        processed: bool,
    ) {
        let key = TaskKey::for_frame(run, frame_number, self.set_size);

        // A re-observed path always encodes the same (run, frame), so a key
        // change can only come from a set-size change; drop the stale entry.
        if let Some(&old_key) = self.path_keys.get(path) {
            if old_key != key {
                self.remove_path_from_set(old_key, path);
            }
        }

        let set = self
            .file_sets
            .entry(key)
            .or_insert_with(|| {
                let mut set = FileSet::new(key);
                set.processed = processed;
                set
            });
        set.files.insert(frame_number, path.to_path_buf());

        self.path_keys.insert(path.to_path_buf(), key);
        self.mod_times.insert(path.to_path_buf(), mod_time_ms);
        self.dirty = true;
        trace!("indexed {:?} into {}", path, key);
    }

    /// True if `path` is unknown or its stored modification time differs.
    pub fn has_file_changed(&self, path: &Path, mod_time_ms: i64) -> bool {
        match self.mod_times.get(path) {
            Some(&stored) => stored != mod_time_ms,
            None => true,
        }
    }

    /// Flip the processed flag on one set.
    pub fn mark_file_set_processed(&mut self, key: TaskKey, processed: bool) {
        if let Some(set) = self.file_sets.get_mut(&key) {
            if set.processed != processed {
                set.processed = processed;
                self.dirty = true;
            }
        }
    }

    /// Look up one set.
    pub fn get_file_set(&self, key: TaskKey) -> Option<&FileSet> {
        self.file_sets.get(&key)
    }

    /// Snapshot of all sets, optionally filtering out processed ones.
    pub fn all_file_sets(&self, include_processed: bool) -> Vec<FileSet> {
        self.file_sets
            .values()
            .filter(|set| include_processed || !set.processed)
            .cloned()
            .collect()
    }

    /// Drop entries whose backing file no longer exists, and any set left
    /// empty afterwards.
    pub fn cleanup(&mut self) {
        let vanished: Vec<PathBuf> = self
            .path_keys
            .keys()
            .filter(|path| !path.exists())
            .cloned()
            .collect();
        if vanished.is_empty() {
            return;
        }

        for path in &vanished {
            if let Some(key) = self.path_keys.remove(path) {
                self.remove_path_from_set(key, path);
            }
            self.mod_times.remove(path);
        }
        self.dirty = true;
        debug!("cleanup removed {} vanished entries", vanished.len());
    }

    /// Re-open every processed set whose archive is missing from
    /// `output_dir`. Returns the number of sets re-opened.
    ///
    /// Closes the crash window between the optimistic processed-mark and a
    /// successful archive write: after a restart such sets run again.
    pub fn reconcile(&mut self, output_dir: &Path, prefix: &str) -> usize {
        let mut reopened = 0;
        for set in self.file_sets.values_mut() {
            if set.processed && !set.key.archive_path(output_dir, prefix).exists() {
                warn!("no archive on disk for processed {}, re-opening", set.key);
                set.processed = false;
                reopened += 1;
            }
        }
        if reopened > 0 {
            self.dirty = true;
        }
        reopened
    }

    /// Write the index file if anything changed since the last save.
    pub fn save(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let persisted = PersistedIndex {
            sets: self
                .file_sets
                .values()
                .map(|set| PersistedSet {
                    key: set.key,
                    processed: set.processed,
                    files: set
                        .files
                        .iter()
                        .map(|(&frame, path)| {
                            let mtime = self.mod_times.get(path).copied().unwrap_or(0);
                            (frame, path.clone(), mtime)
                        })
                        .collect(),
                })
                .collect(),
        };
        let bytes = bincode::serde::encode_to_vec(&persisted, bincode::config::standard())?;
        write_atomic(&self.index_path, &bytes)?;
        self.dirty = false;
        trace!("saved index with {} sets", self.file_sets.len());
        Ok(())
    }

    fn load(&mut self) {
        let bytes = match std::fs::read(&self.index_path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
            Err(e) => {
                warn!("could not read index file {:?}: {}", self.index_path, e);
                return;
            }
        };

        let persisted: PersistedIndex =
            match bincode::serde::decode_from_slice(&bytes, bincode::config::standard()) {
                Ok((persisted, _)) => persisted,
                Err(e) => {
                    warn!(
                        "index file {:?} is corrupt ({}), rebuilding from scan",
                        self.index_path, e
                    );
                    // Overwrite the bad file on the next save
                    self.dirty = true;
                    return;
                }
            };

        for set in persisted.sets {
            let mut file_set = FileSet::new(set.key);
            file_set.processed = set.processed;
            for (frame, path, mtime) in set.files {
                file_set.files.insert(frame, path.clone());
                self.path_keys.insert(path.clone(), set.key);
                self.mod_times.insert(path, mtime);
            }
            self.file_sets.insert(set.key, file_set);
        }
        info!(
            "loaded index: {} sets, {} files",
            self.file_sets.len(),
            self.path_keys.len()
        );
    }

    fn remove_path_from_set(&mut self, key: TaskKey, path: &Path) {
        if let Some(set) = self.file_sets.get_mut(&key) {
            set.files.retain(|_, p| p != path);
            if set.files.is_empty() {
                self.file_sets.remove(&key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn frame_path(dir: &Path, run: u16, frame: u32) -> PathBuf {
        dir.join(format!("test_{:02}_{:05}.tif", run, frame))
    }

    #[test]
    fn test_add_file_groups_by_key() {
        let dir = TempDir::new().unwrap();
        let mut index = FileIndex::open(dir.path(), 100);

        for frame in 1..=150u32 {
            index.add_file(&frame_path(dir.path(), 1, frame), 1, frame, 1000, false);
        }

        let sets = index.all_file_sets(true);
        assert_eq!(sets.len(), 2);
        assert_eq!(sets[0].key, TaskKey { run: 1, set_number: 1 });
        assert_eq!(sets[0].files.len(), 100);
        assert!(sets[0].is_complete(100));
        assert_eq!(sets[1].key, TaskKey { run: 1, set_number: 101 });
        assert_eq!(sets[1].files.len(), 50);
        assert!(!sets[1].is_complete(100));

        // Every member path recomputes to its set's key
        for set in &sets {
            for (&frame, _) in &set.files {
                assert_eq!(TaskKey::for_frame(set.key.run, frame, 100), set.key);
            }
        }
    }

    #[test]
    fn test_add_file_idempotent() {
        let dir = TempDir::new().unwrap();
        let mut index = FileIndex::open(dir.path(), 100);
        let path = frame_path(dir.path(), 1, 5);

        index.add_file(&path, 1, 5, 1000, false);
        index.add_file(&path, 1, 5, 2000, false);

        assert_eq!(index.len(), 1);
        assert!(!index.has_file_changed(&path, 2000));
        assert!(index.has_file_changed(&path, 1000));
    }

    #[test]
    fn test_has_file_changed_unknown_path() {
        let dir = TempDir::new().unwrap();
        let index = FileIndex::open(dir.path(), 100);
        assert!(index.has_file_changed(Path::new("/nowhere.tif"), 0));
    }

    #[test]
    fn test_first_file_tracking() {
        let dir = TempDir::new().unwrap();
        let mut index = FileIndex::open(dir.path(), 10);

        // Observe out of order; first file appears only once frame 11 shows up
        index.add_file(&frame_path(dir.path(), 2, 13), 2, 13, 1, false);
        let key = TaskKey { run: 2, set_number: 11 };
        assert!(index.get_file_set(key).unwrap().first_file().is_none());

        index.add_file(&frame_path(dir.path(), 2, 11), 2, 11, 1, false);
        assert_eq!(
            index.get_file_set(key).unwrap().first_file(),
            Some(&frame_path(dir.path(), 2, 11))
        );
    }

    #[test]
    fn test_mark_processed_filters_snapshot() {
        let dir = TempDir::new().unwrap();
        let mut index = FileIndex::open(dir.path(), 2);
        index.add_file(&frame_path(dir.path(), 1, 1), 1, 1, 1, false);
        index.add_file(&frame_path(dir.path(), 1, 2), 1, 2, 1, false);

        let key = TaskKey { run: 1, set_number: 1 };
        index.mark_file_set_processed(key, true);
        assert!(index.all_file_sets(false).is_empty());
        assert_eq!(index.all_file_sets(true).len(), 1);

        index.mark_file_set_processed(key, false);
        assert_eq!(index.all_file_sets(false).len(), 1);
    }

    #[test]
    fn test_cleanup_removes_vanished_files() {
        let dir = TempDir::new().unwrap();
        let kept = frame_path(dir.path(), 1, 1);
        let gone = frame_path(dir.path(), 1, 2);
        fs::write(&kept, b"x").unwrap();
        fs::write(&gone, b"x").unwrap();

        let mut index = FileIndex::open(dir.path(), 2);
        index.add_file(&kept, 1, 1, 1, false);
        index.add_file(&gone, 1, 2, 1, false);

        fs::remove_file(&gone).unwrap();
        index.cleanup();

        assert_eq!(index.len(), 1);
        let key = TaskKey { run: 1, set_number: 1 };
        assert_eq!(index.get_file_set(key).unwrap().files.len(), 1);

        // Removing the last file removes the set
        fs::remove_file(&kept).unwrap();
        index.cleanup();
        assert!(index.get_file_set(key).is_none());
        assert!(index.is_empty());
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = TempDir::new().unwrap();
        {
            let mut index = FileIndex::open(dir.path(), 100);
            for frame in 1..=100u32 {
                index.add_file(
                    &frame_path(dir.path(), 1, frame),
                    1,
                    frame,
                    frame as i64 * 10,
                    false,
                );
            }
            index.mark_file_set_processed(TaskKey { run: 1, set_number: 1 }, true);
            index.save().unwrap();
        }
        assert!(dir.path().join(INDEX_FILE_NAME).exists());

        let reloaded = FileIndex::open(dir.path(), 100);
        assert_eq!(reloaded.len(), 100);
        let set = reloaded
            .get_file_set(TaskKey { run: 1, set_number: 1 })
            .unwrap();
        assert!(set.processed);
        assert!(set.is_complete(100));
        assert!(!reloaded.has_file_changed(&frame_path(dir.path(), 1, 7), 70));
    }

    #[test]
    fn test_save_skipped_when_clean() {
        let dir = TempDir::new().unwrap();
        let mut index = FileIndex::open(dir.path(), 100);
        index.save().unwrap();
        // Nothing was ever added or loaded, so no file should appear
        assert!(!dir.path().join(INDEX_FILE_NAME).exists());
    }

    #[test]
    fn test_corrupt_index_is_discarded() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(INDEX_FILE_NAME), b"not an index at all").unwrap();

        let index = FileIndex::open(dir.path(), 100);
        assert!(index.is_empty());
    }

    #[test]
    fn test_reconcile_reopens_missing_archives() {
        let watch = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let mut index = FileIndex::open(watch.path(), 1);

        index.add_file(&frame_path(watch.path(), 1, 1), 1, 1, 1, false);
        index.add_file(&frame_path(watch.path(), 1, 2), 1, 2, 1, false);
        let done = TaskKey { run: 1, set_number: 1 };
        let stale = TaskKey { run: 1, set_number: 2 };
        index.mark_file_set_processed(done, true);
        index.mark_file_set_processed(stale, true);

        // Only the first set's archive made it to disk
        fs::write(done.archive_path(out.path(), "test"), b"archive").unwrap();

        assert_eq!(index.reconcile(out.path(), "test"), 1);
        assert!(index.get_file_set(done).unwrap().processed);
        assert!(!index.get_file_set(stale).unwrap().processed);
    }
}
