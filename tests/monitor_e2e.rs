//! End-to-end monitor scenarios against a live watch directory
//!
//! Each test runs a real monitor with a shortened poll interval and waits
//! on observable filesystem effects with a bounded deadline.

use framepack::{read_archive_file, Monitor, MonitorConfig};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{RngCore, SeedableRng};
use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};
use tempfile::TempDir;

const FRAME_BYTES: usize = 1024;

fn test_config(watch: &Path, out: &Path, set_size: u32) -> MonitorConfig {
    MonitorConfig {
        watch_dir: watch.to_path_buf(),
        output_dir: out.to_path_buf(),
        prefix: "test".to_string(),
        set_size,
        poll_interval: Duration::from_millis(50),
        max_threads: 4,
        max_processes: 1,
        acceleration: 4,
        delete_after: true,
    }
}

fn frame_name(run: u16, frame: u32) -> String {
    format!("test_{:02}_{:05}.tif", run, frame)
}

/// Deterministic per-frame content so archives can be verified later.
fn frame_content(run: u16, frame: u32) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64((run as u64) << 32 | frame as u64);
    let mut buf = vec![0u8; FRAME_BYTES];
    rng.fill_bytes(&mut buf);
    buf
}

fn write_frame(dir: &Path, run: u16, frame: u32) {
    fs::write(dir.join(frame_name(run, frame)), frame_content(run, frame)).unwrap();
}

fn wait_for(deadline: Duration, mut probe: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if probe() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(25));
    }
    false
}

fn tif_files(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|n| n.ends_with(".tif"))
        .collect();
    names.sort();
    names
}

#[test]
fn happy_path_archives_one_set_and_keeps_first_frame() {
    let watch = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    for frame in 1..=100 {
        write_frame(watch.path(), 1, frame);
    }

    let monitor = Monitor::spawn(test_config(watch.path(), out.path(), 100)).unwrap();

    let archive_path = out.path().join("test_01_00001.lz4");
    assert!(
        wait_for(Duration::from_secs(20), || archive_path.exists()),
        "archive never appeared"
    );
    // Deletion is asynchronous; wait until only the first frame remains
    assert!(
        wait_for(Duration::from_secs(20), || tif_files(watch.path())
            == vec![frame_name(1, 1)]),
        "sources were not reduced to the first frame: {:?}",
        tif_files(watch.path())
    );
    monitor.shutdown();

    // The preserved representative copy sits next to the archive
    assert!(out.path().join(frame_name(1, 1)).exists());

    // The archive reproduces all 100 frames in ascending order
    let entries = read_archive_file(&archive_path).unwrap();
    assert_eq!(entries.len(), 100);
    for (i, entry) in entries.iter().enumerate() {
        let frame = i as u32 + 1;
        assert_eq!(entry.name, frame_name(1, frame));
        assert_eq!(entry.data, frame_content(1, frame));
    }
}

#[test]
fn incomplete_set_is_left_alone() {
    let watch = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    for frame in 1..=99 {
        write_frame(watch.path(), 2, frame);
    }

    let monitor = Monitor::spawn(test_config(watch.path(), out.path(), 100)).unwrap();
    assert!(wait_for(Duration::from_secs(10), || monitor.initial_scan_done()));
    // Give the scheduler ample time to (wrongly) act
    std::thread::sleep(Duration::from_millis(500));
    monitor.shutdown();

    assert!(!out.path().join("test_02_00001.lz4").exists());
    assert_eq!(tif_files(watch.path()).len(), 99);
}

#[test]
fn interleaved_runs_produce_one_archive_each() {
    let watch = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();

    let mut work: Vec<(u16, u32)> = Vec::new();
    for frame in 1..=100 {
        work.push((3, frame));
        work.push((4, frame));
    }
    work.shuffle(&mut StdRng::seed_from_u64(7));
    for (run, frame) in work {
        write_frame(watch.path(), run, frame);
    }

    let monitor = Monitor::spawn(test_config(watch.path(), out.path(), 100)).unwrap();

    let a3 = out.path().join("test_03_00001.lz4");
    let a4 = out.path().join("test_04_00001.lz4");
    assert!(
        wait_for(Duration::from_secs(30), || a3.exists() && a4.exists()),
        "expected both archives"
    );
    monitor.shutdown();

    for (run, path) in [(3u16, &a3), (4u16, &a4)] {
        let entries = read_archive_file(path).unwrap();
        assert_eq!(entries.len(), 100);
        for (i, entry) in entries.iter().enumerate() {
            assert_eq!(entry.name, frame_name(run, i as u32 + 1));
            assert_eq!(entry.data, frame_content(run, i as u32 + 1));
        }
    }
}

#[test]
fn restart_completes_a_pending_set() {
    let watch = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    let index_file = watch.path().join(".file_index.bin");

    // First session sees only half the set
    for frame in 1..=50 {
        write_frame(watch.path(), 1, frame);
    }
    {
        let monitor = Monitor::spawn(test_config(watch.path(), out.path(), 100)).unwrap();
        assert!(wait_for(Duration::from_secs(10), || monitor.initial_scan_done()
            && monitor.index_len() >= 50));
        monitor.shutdown();
    }
    assert!(index_file.exists(), "index must persist across sessions");
    assert!(!out.path().join("test_01_00001.lz4").exists());

    // Second session receives the rest
    for frame in 51..=100 {
        write_frame(watch.path(), 1, frame);
    }
    let monitor = Monitor::spawn(test_config(watch.path(), out.path(), 100)).unwrap();
    let archive_path = out.path().join("test_01_00001.lz4");
    assert!(
        wait_for(Duration::from_secs(20), || archive_path.exists()),
        "archive not produced after restart"
    );
    monitor.shutdown();

    assert!(index_file.exists());
    let entries = read_archive_file(&archive_path).unwrap();
    assert_eq!(entries.len(), 100);
}

#[test]
fn failed_set_is_retried_and_succeeds_once_fixed() {
    let watch = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();

    let monitor = Monitor::spawn(test_config(watch.path(), out.path(), 3)).unwrap();
    assert!(wait_for(Duration::from_secs(10), || monitor.initial_scan_done()));

    // Index two real frames first
    write_frame(watch.path(), 5, 1);
    write_frame(watch.path(), 5, 2);
    assert!(wait_for(Duration::from_secs(10), || monitor.index_len() == 2));

    // Sabotage frame 2: a directory under the frame name stays indexed
    // (the path still exists) but every read of it fails
    let victim = watch.path().join(frame_name(5, 2));
    fs::remove_file(&victim).unwrap();
    fs::create_dir(&victim).unwrap();

    // Completing the set dispatches a worker that must fail
    write_frame(watch.path(), 5, 3);
    std::thread::sleep(Duration::from_millis(800));
    let archive_path = out.path().join("test_05_00001.lz4");
    assert!(
        !archive_path.exists(),
        "archive must not exist while a source is unreadable"
    );

    // Clear the fault; the next sweep re-offers the set and it succeeds
    fs::remove_dir(&victim).unwrap();
    write_frame(watch.path(), 5, 2);
    assert!(
        wait_for(Duration::from_secs(20), || archive_path.exists()),
        "set was not retried after the fault cleared"
    );
    monitor.shutdown();

    // Exactly one archive for the set, with the expected content
    let archives: Vec<_> = fs::read_dir(out.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().ends_with(".lz4"))
        .collect();
    assert_eq!(archives.len(), 1);

    let entries = read_archive_file(&archive_path).unwrap();
    assert_eq!(entries.len(), 3);
    assert_eq!(entries[1].data, frame_content(5, 2));
}
