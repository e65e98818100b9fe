use std::io::Cursor;
use std::sync::Arc;

use crate::error::B2sError;
use crate::storage::memory::MemoryStore;
use crate::storage::{ObjectStore, PutOptions};
use crate::uploader::{effective_part_size, SpoolSettings, Uploader, MAX_PARTS, MAX_PART_SIZE};

fn opts() -> PutOptions {
    PutOptions {
        storage_class: "DEEP_ARCHIVE".into(),
        sse: "AES256".into(),
        content_type: None,
    }
}

fn uploader(store: &Arc<MemoryStore>, part_size: u64, concurrency: usize) -> Uploader {
    Uploader::new(
        Arc::clone(store) as Arc<dyn ObjectStore>,
        part_size,
        concurrency,
        None,
    )
}

#[test]
fn put_small_stores_body_with_options() {
    let store = Arc::new(MemoryStore::new());
    let up = uploader(&store, 1024, 2);
    let etag = up.put_small("k/manifest.json", b"{}", &opts()).unwrap();
    assert!(etag.is_some());

    let obj = store.object("k/manifest.json").unwrap();
    assert_eq!(obj.data, b"{}");
    assert_eq!(obj.storage_class, "DEEP_ARCHIVE");
    assert_eq!(obj.sse, "AES256");
}

#[test]
fn put_large_single_part() {
    let store = Arc::new(MemoryStore::new());
    let up = uploader(&store, 1024, 2);
    let data = vec![7u8; 100];

    let outcome = up
        .put_large("k/chunk.bin", &mut Cursor::new(data.clone()), &opts(), 1024)
        .unwrap();
    assert_eq!(outcome.size, 100);
    assert!(outcome.etag.is_some());
    assert_eq!(store.object("k/chunk.bin").unwrap().data, data);

    let ops = store.ops();
    assert_eq!(ops[0], "CREATE_MULTIPART k/chunk.bin");
    assert_eq!(ops[1], "UPLOAD_PART k/chunk.bin#1");
    assert_eq!(*ops.last().unwrap(), "COMPLETE_MULTIPART k/chunk.bin");
}

#[test]
fn put_large_splits_into_parts_and_reassembles() {
    let store = Arc::new(MemoryStore::new());
    let up = uploader(&store, 1024, 4);
    let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();

    let outcome = up
        .put_large("k/chunk.bin", &mut Cursor::new(data.clone()), &opts(), 16 * 1024)
        .unwrap();
    assert_eq!(outcome.size, data.len() as u64);
    assert_eq!(store.object("k/chunk.bin").unwrap().data, data);

    let part_ops = store
        .ops()
        .iter()
        .filter(|op| op.starts_with("UPLOAD_PART"))
        .count();
    assert_eq!(part_ops, 10); // 10_000 / 1024 rounded up
}

#[test]
fn exact_part_boundary_produces_no_empty_part() {
    let store = Arc::new(MemoryStore::new());
    let up = uploader(&store, 1000, 2);
    let data = vec![1u8; 2000];

    up.put_large("k", &mut Cursor::new(data.clone()), &opts(), 4096)
        .unwrap();
    let part_ops = store
        .ops()
        .iter()
        .filter(|op| op.starts_with("UPLOAD_PART"))
        .count();
    assert_eq!(part_ops, 2);
    assert_eq!(store.object("k").unwrap().data, data);
}

#[test]
fn empty_body_still_creates_the_object() {
    let store = Arc::new(MemoryStore::new());
    let up = uploader(&store, 1024, 2);
    let outcome = up
        .put_large("k", &mut Cursor::new(Vec::new()), &opts(), 1024)
        .unwrap();
    assert_eq!(outcome.size, 0);
    assert_eq!(store.object("k").unwrap().data, Vec::<u8>::new());
}

#[test]
fn failed_part_aborts_the_upload() {
    let store = Arc::new(MemoryStore::new());
    store.fail_part(2, u32::MAX);
    let up = uploader(&store, 100, 2);
    let data = vec![9u8; 1000];

    let err = up
        .put_large("k", &mut Cursor::new(data), &opts(), 4096)
        .unwrap_err();
    assert!(matches!(err, B2sError::Upload(_)), "{err:?}");
    assert!(store.object("k").is_none(), "no partial object may remain");
    assert_eq!(store.open_multiparts(), 0, "upload must be aborted");
    assert!(store.ops().iter().any(|op| op.starts_with("ABORT_MULTIPART")));
}

#[test]
fn spooled_parts_round_trip_and_clean_up() {
    let store = Arc::new(MemoryStore::new());
    let spool_dir = tempfile::tempdir().unwrap();
    let up = Uploader::new(
        Arc::clone(&store) as Arc<dyn ObjectStore>,
        1024,
        4,
        Some(SpoolSettings {
            dir: spool_dir.path().to_path_buf(),
            size_bytes: 8 * 1024,
        }),
    );
    let data: Vec<u8> = (0..5000u32).map(|i| (i % 127) as u8).collect();

    let outcome = up
        .put_large("k", &mut Cursor::new(data.clone()), &opts(), 16 * 1024)
        .unwrap();
    assert_eq!(outcome.size, data.len() as u64);
    assert_eq!(store.object("k").unwrap().data, data);

    let leftovers = std::fs::read_dir(spool_dir.path()).unwrap().count();
    assert_eq!(leftovers, 0, "spool files must be removed");
}

#[test]
fn spool_failure_removes_spool_files() {
    let store = Arc::new(MemoryStore::new());
    store.fail_part(1, u32::MAX);
    let spool_dir = tempfile::tempdir().unwrap();
    let up = Uploader::new(
        Arc::clone(&store) as Arc<dyn ObjectStore>,
        1024,
        2,
        Some(SpoolSettings {
            dir: spool_dir.path().to_path_buf(),
            size_bytes: 8 * 1024,
        }),
    );

    let err = up
        .put_large("k", &mut Cursor::new(vec![1u8; 4000]), &opts(), 8 * 1024)
        .unwrap_err();
    assert!(matches!(err, B2sError::Upload(_)));
    assert_eq!(std::fs::read_dir(spool_dir.path()).unwrap().count(), 0);
    assert_eq!(store.open_multiparts(), 0);
}

#[test]
fn effective_part_size_honors_limits() {
    const GIB: u64 = 1024 * 1024 * 1024;
    const MIB: u64 = 1024 * 1024;

    // Default stays as configured.
    assert_eq!(effective_part_size(128 * MIB, 200 * GIB), 128 * MIB);
    // Configured above the per-part cap clamps down.
    assert_eq!(effective_part_size(6 * GIB, 200 * GIB), MAX_PART_SIZE);
    // Tiny configured part size is raised to respect the part ceiling.
    let raised = effective_part_size(MIB, 200 * GIB);
    assert_eq!(raised, (200 * GIB).div_ceil(MAX_PARTS));
    assert!(raised * MAX_PARTS >= 200 * GIB);
    // A 200 GiB chunk at the default size stays well under the ceiling.
    assert!((200 * GIB).div_ceil(128 * MIB) <= MAX_PARTS);
}
