//! Integration tests for the shared-handle file cache: handle-pool
//! behavior under pressure, round-trip I/O, and close semantics.
use std::sync::Arc;

use rstest::rstest;
use tempfile::TempDir;

use tasktree::core::files::{CachedFile, HandlePool, OpenFlags};

mod common;

const RW_CREATE: OpenFlags = OpenFlags::READ
    .union(OpenFlags::WRITE)
    .union(OpenFlags::CREATE);

#[test]
fn test_hundred_files_share_four_handles() {
    common::init_logging();

    let dir = TempDir::new().unwrap();
    let pool = Arc::new(HandlePool::new(4));

    const FILE_COUNT: usize = 100;
    const FILE_SIZE: usize = 1024;
    const BUFFER_SIZE: usize = 256;

    // Create and fill 100 files through the pool.
    let mut files: Vec<CachedFile> = (0..FILE_COUNT)
        .map(|i| {
            CachedFile::open_with_pool(
                Arc::clone(&pool),
                dir.path().join(format!("file{:03}.bin", i)),
                RW_CREATE,
                BUFFER_SIZE,
                false,
            )
            .unwrap()
        })
        .collect();

    for (i, file) in files.iter_mut().enumerate() {
        let payload: Vec<u8> = (0..FILE_SIZE).map(|k| ((k + i) % 251) as u8).collect();
        file.write(&payload).unwrap();
        file.seek(0);
    }

    // Interleave getc across all files; the pool cap must hold the
    // whole time.
    for round in 0..FILE_SIZE {
        for (i, file) in files.iter_mut().enumerate() {
            let expected = ((round + i) % 251) as u8;
            assert_eq!(file.getc().unwrap(), expected);
        }
        let stats = pool.stats();
        assert!(
            stats.open_count <= 4,
            "open_count {} exceeds the cap",
            stats.open_count
        );
    }

    // Sequential getc stays on the buffer fast path.
    for file in &files {
        let stats = file.stats();
        let total = stats.fast_path_hits + stats.fast_path_misses;
        assert!(
            stats.fast_path_hits as f64 / total as f64 > 0.99,
            "fast path rate too low: {:?}",
            stats
        );
    }
}

#[test]
fn test_capacity_shrink_is_immediately_visible() {
    common::init_logging();

    let dir = TempDir::new().unwrap();
    let pool = Arc::new(HandlePool::new(8));

    let mut files: Vec<CachedFile> = (0..8)
        .map(|i| {
            CachedFile::open_with_pool(
                Arc::clone(&pool),
                dir.path().join(format!("f{}.bin", i)),
                RW_CREATE,
                64,
                false,
            )
            .unwrap()
        })
        .collect();
    for file in files.iter_mut() {
        file.write(b"x").unwrap();
        file.close().unwrap();
    }

    // Park all eight handles, then shrink.
    let mut files: Vec<CachedFile> = (0..8)
        .map(|i| {
            CachedFile::open_with_pool(
                Arc::clone(&pool),
                dir.path().join(format!("f{}.bin", i)),
                OpenFlags::READ,
                64,
                false,
            )
            .unwrap()
        })
        .collect();
    assert_eq!(pool.stats().open_count, 8);

    pool.set_capacity(3);
    let stats = pool.stats();
    assert!(stats.open_count <= 3.max(stats.used_count));

    // The files still read fine; evicted handles are re-opened on
    // demand.
    for file in files.iter_mut() {
        assert_eq!(file.getc().unwrap(), b'x');
    }
}

#[rstest]
#[case::small(64, 3)]
#[case::medium(512, 2)]
#[case::large(4096, 1)]
fn test_round_trip_against_reference_model(#[case] buffer_size: usize, #[case] pool_cap: usize) {
    common::init_logging();

    let dir = TempDir::new().unwrap();
    let pool = Arc::new(HandlePool::new(pool_cap));
    let path = dir.path().join("model.bin");
    let mut file =
        CachedFile::open_with_pool(Arc::clone(&pool), &path, RW_CREATE, buffer_size, false)
            .unwrap();

    // A fixed sequence of writes and seeks, mirrored against a plain
    // in-memory model.
    let mut model: Vec<u8> = Vec::new();
    let operations: &[(u64, usize, u8)] = &[
        (0, 100, 1),
        (50, 200, 2),
        (1000, 5000, 3),
        (40, 8, 4),
        (3000, 100, 5),
        (249, 2, 6),
        (5999, 1, 7),
    ];

    for &(position, len, fill) in operations {
        let data = vec![fill; len];
        file.seek(position);
        file.write(&data).unwrap();

        let end = position as usize + len;
        if model.len() < end {
            model.resize(end, 0);
        }
        model[position as usize..end].copy_from_slice(&data);
    }

    assert_eq!(file.get_size().unwrap(), model.len() as u64);

    // Verify through the cache, then through the raw file system after
    // closing.
    file.seek(0);
    let mut readback = vec![0u8; model.len()];
    file.read_exact(&mut readback).unwrap();
    assert_eq!(readback, model);

    file.close().unwrap();
    assert_eq!(std::fs::read(&path).unwrap(), model);
}

#[test]
fn test_zero_handle_cap_still_works() {
    common::init_logging();

    let dir = TempDir::new().unwrap();
    let pool = Arc::new(HandlePool::new(0));
    let mut file = CachedFile::open_with_pool(
        Arc::clone(&pool),
        dir.path().join("squeezed.bin"),
        RW_CREATE,
        64,
        false,
    )
    .unwrap();

    let payload: Vec<u8> = (0..300u16).map(|i| (i % 256) as u8).collect();
    file.write(&payload).unwrap();
    file.seek(0);
    let mut readback = vec![0u8; payload.len()];
    file.read_exact(&mut readback).unwrap();
    assert_eq!(readback, payload);

    file.close().unwrap();
    assert_eq!(pool.stats().open_count, 0);
}

#[test]
fn test_append_mode_positions_writes_at_eof() {
    common::init_logging();

    let dir = TempDir::new().unwrap();
    let pool = Arc::new(HandlePool::new(2));
    let path = dir.path().join("journal.log");
    std::fs::write(&path, b"seed-entry|").unwrap();

    let mut file = CachedFile::open_with_pool(
        Arc::clone(&pool),
        &path,
        OpenFlags::READ | OpenFlags::APPEND,
        16,
        false,
    )
    .unwrap();

    // The appended entry spans a partial head block, a raw middle run,
    // and a buffered tail, so the flush offsets matter.
    let entry: Vec<u8> = (0..40u8).map(|i| b'a' + (i % 26)).collect();
    file.write(&entry).unwrap();

    // A seek between appends must not relocate the write.
    file.seek(3);
    file.write(b"|end").unwrap();

    let mut expected = b"seed-entry|".to_vec();
    expected.extend_from_slice(&entry);
    expected.extend_from_slice(b"|end");

    file.seek(0);
    let mut readback = vec![0u8; expected.len()];
    file.read_exact(&mut readback).unwrap();
    assert_eq!(readback, expected);

    file.close().unwrap();
    assert_eq!(std::fs::read(&path).unwrap(), expected);
}

#[test]
fn test_dropping_pool_then_closing_file_is_safe() {
    common::init_logging();

    let dir = TempDir::new().unwrap();
    let path = dir.path().join("late.bin");
    let pool = Arc::new(HandlePool::new(2));

    let mut file =
        CachedFile::open_with_pool(Arc::clone(&pool), &path, RW_CREATE, 64, false).unwrap();
    file.write(b"kept").unwrap();

    // The pool object survives through the file's own Arc; dropping
    // our reference first must not lose the flush.
    drop(pool);
    file.close().unwrap();
    file.close().unwrap();
    assert_eq!(std::fs::read(&path).unwrap(), b"kept");
}

#[test]
fn test_global_pool_facade() {
    common::init_logging();

    let dir = TempDir::new().unwrap();
    let previous = tasktree::core::files::get_max_shared_handles();
    tasktree::core::files::set_max_shared_handles(6);
    assert_eq!(tasktree::core::files::get_max_shared_handles(), 6);

    let mut file =
        CachedFile::open(dir.path().join("global.bin"), RW_CREATE, 128, false).unwrap();
    file.write(b"via the process-wide pool").unwrap();
    file.seek(8);
    let mut word = [0u8; 12];
    file.read_exact(&mut word).unwrap();
    assert_eq!(&word, b"process-wide");
    file.close().unwrap();

    tasktree::core::files::set_max_shared_handles(previous);
}
