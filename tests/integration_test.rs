//! End-to-end integration test exercising the full stack: frame codec,
//! chunked file I/O, cached blob store, inode database, and the
//! filesystem facade together, the way an embedder would actually wire
//! them up.

use std::sync::Arc;

use vaultfs_core::blob::{FileBlobStore, OpenFlags};
use vaultfs_core::cache::{CachedBlobStore, VersionQuery};
use vaultfs_core::fs::{FileSystem, OpenMode};
use vaultfs_core::frame::FrameKey;
use vaultfs_core::inodedb::log::InMemoryLogIO;
use vaultfs_core::inodedb::snapshot::InMemorySnapshotIO;
use vaultfs_core::inodedb::InodeDb;

struct ZeroVersion;
impl VersionQuery for ZeroVersion {
    fn query_version(&self, _path: &str) -> vaultfs_core::Result<u64> {
        Ok(0)
    }
}

fn build_fs(backend_dir: &std::path::Path, cache_dir: &std::path::Path) -> FileSystem {
    let backend = Arc::new(FileBlobStore::new(backend_dir).unwrap());
    let cache = Arc::new(FileBlobStore::new(cache_dir).unwrap());
    let cbs = Arc::new(CachedBlobStore::new(
        backend,
        cache,
        OpenFlags::ReadWriteCreate,
        Arc::new(ZeroVersion),
    ));
    let idb = Arc::new(
        InodeDb::boot(
            Box::new(InMemoryLogIO::new()),
            Box::new(InMemorySnapshotIO::new()),
        )
        .unwrap(),
    );
    FileSystem::new(idb, cbs, FrameKey::new([42u8; 32]), 64 * 1024)
}

#[test]
fn write_sync_reopen_round_trip() {
    let backend_dir = tempfile::tempdir().unwrap();
    let cache_dir = tempfile::tempdir().unwrap();
    let fs = build_fs(backend_dir.path(), cache_dir.path());

    let root = fs.root_id();
    let file_id = fs.create_file(root, "notes.txt", Some("notes.txt")).unwrap();

    let handle = fs.open(file_id, OpenMode::ReadWrite).unwrap();
    let payload = b"the quick brown fox jumps over the lazy dog";
    fs.pwrite(file_id, handle, 0, payload).unwrap();
    fs.sync(file_id).unwrap();
    fs.close_handle(file_id, handle).unwrap();

    let handle2 = fs.open(file_id, OpenMode::Read).unwrap();
    let mut buf = vec![0u8; payload.len()];
    fs.pread(file_id, handle2, 0, &mut buf).unwrap();
    assert_eq!(&buf, payload);
    fs.close_handle(file_id, handle2).unwrap();
}

#[test]
fn multi_chunk_file_spans_several_blobs() {
    let backend_dir = tempfile::tempdir().unwrap();
    let cache_dir = tempfile::tempdir().unwrap();
    let fs = build_fs(backend_dir.path(), cache_dir.path());

    let root = fs.root_id();
    let file_id = fs.create_file(root, "big.bin", None).unwrap();
    let handle = fs.open(file_id, OpenMode::ReadWrite).unwrap();

    let data = vec![0x5Au8; 64 * 1024 * 3 + 123];
    fs.pwrite(file_id, handle, 0, &data).unwrap();
    fs.sync(file_id).unwrap();

    let mut buf = vec![0u8; data.len()];
    fs.pread(file_id, handle, 0, &mut buf).unwrap();
    assert_eq!(buf, data);

    fs.close_handle(file_id, handle).unwrap();
}

#[test]
fn directory_tree_create_rename_remove() {
    let backend_dir = tempfile::tempdir().unwrap();
    let cache_dir = tempfile::tempdir().unwrap();
    let fs = build_fs(backend_dir.path(), cache_dir.path());

    let root = fs.root_id();
    let docs = fs.create_dir(root, "docs").unwrap();
    fs.create_file(docs, "draft.txt", None).unwrap();

    fs.rename(root, "docs", root, "documents").unwrap();
    assert!(fs.remove(root, "docs").is_err());

    let err = fs.remove(root, "documents").unwrap_err();
    assert_eq!(err, vaultfs_core::fs::PosixError::ENotEmpty);

    assert!(fs.remove(docs, "draft.txt").is_ok());
    fs.remove(root, "documents").unwrap();
}

#[test]
fn log_replay_matches_live_state_after_many_transactions() {
    let backend_dir = tempfile::tempdir().unwrap();
    let cache_dir = tempfile::tempdir().unwrap();

    let log = InMemoryLogIO::new();
    let snapshot = InMemorySnapshotIO::new();
    let idb = Arc::new(
        InodeDb::boot(Box::new(log.clone()), Box::new(snapshot.clone())).unwrap(),
    );

    let backend = Arc::new(FileBlobStore::new(backend_dir.path()).unwrap());
    let cache = Arc::new(FileBlobStore::new(cache_dir.path()).unwrap());
    let cbs = Arc::new(CachedBlobStore::new(
        backend,
        cache,
        OpenFlags::ReadWriteCreate,
        Arc::new(ZeroVersion),
    ));
    let fs = FileSystem::new(idb.clone(), cbs, FrameKey::new([1u8; 32]), 4096);

    let root = fs.root_id();
    for i in 0..10 {
        let name = format!("file-{i}.txt");
        let id = fs.create_file(root, &name, None).unwrap();
        let handle = fs.open(id, OpenMode::ReadWrite).unwrap();
        fs.pwrite(id, handle, 0, format!("contents {i}").as_bytes())
            .unwrap();
        fs.sync(id).unwrap();
        fs.close_handle(id, handle).unwrap();
    }

    let replayed = InodeDb::boot(Box::new(log), Box::new(snapshot)).unwrap();

    idb.with_state(|live| {
        replayed.with_state(|replayed_state| {
            assert_eq!(live.last_tx, replayed_state.last_tx);
            assert_eq!(live.nodes.len(), replayed_state.nodes.len());
        });
    });
}
