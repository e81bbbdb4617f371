use super::*;
use crate::store::{ObjectKind, ROOT_OBJECT_ID};
use sqlx::SqlitePool;
use tempfile::{TempDir, tempdir};

const CHUNK: u64 = 8;
const THRESHOLD: u64 = 16;

async fn make_cache(max_bytes: u64) -> (CacheStore, StateStore, TempDir) {
    let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
    let store = StateStore::from_pool(pool);
    store.init().await.unwrap();
    let dir = tempdir().unwrap();
    let cache = CacheStore::new(
        dir.path().to_path_buf(),
        store.clone(),
        CHUNK,
        THRESHOLD,
        max_bytes,
    );
    cache.ensure_layout().await.unwrap();
    (cache, store, dir)
}

async fn make_file(store: &StateStore, name: &str) -> String {
    store
        .create_local_object(ROOT_OBJECT_ID, name, ObjectKind::File)
        .await
        .unwrap()
        .id
}

#[tokio::test]
async fn threshold_boundary_selects_layout() {
    let cache = CacheStore::new(
        PathBuf::from("/tmp/unused"),
        StateStore::from_pool(SqlitePool::connect_lazy("sqlite::memory:").unwrap()),
        CHUNK,
        THRESHOLD,
        u64::MAX,
    );
    assert!(!cache.uses_sparse(THRESHOLD - 1));
    assert!(cache.uses_sparse(THRESHOLD));
}

#[tokio::test]
async fn chunk_span_straddles_boundaries() {
    let cache = CacheStore::new(
        PathBuf::from("/tmp/unused"),
        StateStore::from_pool(SqlitePool::connect_lazy("sqlite::memory:").unwrap()),
        CHUNK,
        THRESHOLD,
        u64::MAX,
    );
    // A read of [chunk_size - 1, chunk_size + 1) demands chunks 0 and 1.
    assert_eq!(cache.chunk_span(CHUNK - 1, 2, 32), Some((0, 1)));
    assert_eq!(cache.chunk_span(0, 1, 32), Some((0, 0)));
    assert_eq!(cache.chunk_span(31, 100, 32), Some((3, 3)));
    assert_eq!(cache.chunk_span(0, 0, 32), None);
    assert_eq!(cache.chunk_span(40, 4, 32), None);
    assert_eq!(cache.total_chunks(0), 0);
    assert_eq!(cache.total_chunks(1), 1);
    assert_eq!(cache.total_chunks(CHUNK * 3 + 1), 4);
}

#[tokio::test]
async fn placeholder_write_read_round_trip() {
    let (cache, store, _dir) = make_cache(u64::MAX).await;
    let id = make_file(&store, "note.txt").await;

    cache.create_placeholder(&id).await.unwrap();
    let entry = store.get_cache_entry(&id).await.unwrap().unwrap();
    assert_eq!(entry.present_locally, Presence::Full);
    assert_eq!(entry.size, 0);

    let len = cache.write(&id, 0, b"hello world").await.unwrap();
    assert_eq!(len, 11);
    assert_eq!(cache.read(&id, 6, 5).await.unwrap(), b"world");
    // Short read past EOF truncates instead of zero-filling.
    assert_eq!(cache.read(&id, 6, 64).await.unwrap(), b"world");
}

#[tokio::test]
async fn chunk_writes_promote_to_full_once_complete() {
    let (cache, store, _dir) = make_cache(u64::MAX).await;
    let id = make_file(&store, "movie.mp4").await;
    let size = CHUNK * 2 + 3; // three chunks, last one short

    cache.reserve_sparse(&id, size).await.unwrap();
    assert_eq!(
        store.get_cache_entry(&id).await.unwrap().unwrap().present_locally,
        Presence::Sparse
    );
    assert_eq!(
        cache.missing_chunks(&id, 0, size, size).await.unwrap(),
        vec![0, 1, 2]
    );

    cache.write_chunk(&id, 1, &[1u8; CHUNK as usize], size).await.unwrap();
    assert_eq!(
        cache.missing_chunks(&id, 0, size, size).await.unwrap(),
        vec![0, 2]
    );
    assert_eq!(
        store.get_cache_entry(&id).await.unwrap().unwrap().present_locally,
        Presence::Sparse
    );

    cache.write_chunk(&id, 0, &[2u8; CHUNK as usize], size).await.unwrap();
    cache.write_chunk(&id, 2, &[3u8; 3], size).await.unwrap();

    let entry = store.get_cache_entry(&id).await.unwrap().unwrap();
    assert_eq!(entry.present_locally, Presence::Full);
    assert!(entry.file_hash.is_some());
    // Promotion purges the chunk rows.
    assert_eq!(store.chunk_count(&id).await.unwrap(), 0);

    let mut expected = vec![2u8; CHUNK as usize];
    expected.extend_from_slice(&[1u8; CHUNK as usize]);
    expected.extend_from_slice(&[3u8; 3]);
    assert_eq!(cache.read(&id, 0, size as usize).await.unwrap(), expected);
}

#[tokio::test]
async fn chunk_index_outside_file_is_rejected() {
    let (cache, store, _dir) = make_cache(u64::MAX).await;
    let id = make_file(&store, "movie.mp4").await;
    let err = cache
        .write_chunk(&id, 4, b"x", CHUNK * 2)
        .await
        .expect_err("chunk past EOF");
    assert!(matches!(err, CacheError::ChunkOutOfRange { .. }));
}

#[tokio::test]
async fn full_download_commits_via_part_rename() {
    let (cache, store, _dir) = make_cache(u64::MAX).await;
    let id = make_file(&store, "a.bin").await;

    let part = cache.begin_full_download(&id).await.unwrap();
    tokio::fs::write(&part, b"content").await.unwrap();
    let (size, hash) = cache.commit_full_download(&id).await.unwrap();

    assert_eq!(size, 7);
    assert_eq!(hash.len(), 64);
    assert!(!tokio::fs::try_exists(&part).await.unwrap());
    assert_eq!(cache.read(&id, 0, 7).await.unwrap(), b"content");
    let entry = store.get_cache_entry(&id).await.unwrap().unwrap();
    assert_eq!(entry.present_locally, Presence::Full);
    assert_eq!(entry.file_hash.as_deref(), Some(hash.as_str()));
}

#[tokio::test]
async fn startup_sweep_removes_leaked_partials() {
    let (cache, _store, _dir) = make_cache(u64::MAX).await;
    let leaked = cache.part_path("file-dead");
    tokio::fs::write(&leaked, b"half").await.unwrap();

    let swept = cache.ensure_layout().await.unwrap();
    assert_eq!(swept, 1);
    assert!(!tokio::fs::try_exists(&leaked).await.unwrap());
}

#[tokio::test]
async fn staged_upload_presents_remote_name_without_moving_cache_file() {
    let (cache, store, _dir) = make_cache(u64::MAX).await;
    let id = make_file(&store, "report.pdf").await;
    cache.create_placeholder(&id).await.unwrap();
    cache.write(&id, 0, b"pdf bytes").await.unwrap();

    let staged_path;
    {
        let staged = cache.stage_upload(&id, "report.pdf").await.unwrap();
        staged_path = staged.path().to_path_buf();
        assert_eq!(staged_path.file_name().unwrap(), "report.pdf");
        assert_eq!(tokio::fs::read(staged.path()).await.unwrap(), b"pdf bytes");
        let meta = tokio::fs::symlink_metadata(staged.path()).await.unwrap();
        assert!(meta.file_type().is_symlink());
    }
    // Staging dir is cleaned up on drop; the cache file stays put.
    assert!(!staged_path.exists());
    assert_eq!(cache.read(&id, 0, 9).await.unwrap(), b"pdf bytes");
}

#[tokio::test]
async fn invalidate_chunks_drops_rows_and_reallocates() {
    let (cache, store, _dir) = make_cache(u64::MAX).await;
    let id = make_file(&store, "big.iso").await;
    let size = CHUNK * 4;
    cache.write_chunk(&id, 1, &[9u8; CHUNK as usize], size).await.unwrap();
    assert_eq!(store.chunk_count(&id).await.unwrap(), 1);

    cache.invalidate_chunks(&id, size).await.unwrap();
    assert_eq!(store.chunk_count(&id).await.unwrap(), 0);
    let meta = tokio::fs::metadata(cache.object_path(&id)).await.unwrap();
    assert_eq!(meta.len(), size);
}

#[tokio::test]
async fn eviction_frees_lru_and_spares_pinned_and_open() {
    let (cache, store, _dir) = make_cache(8).await;

    let old = make_file(&store, "old.bin").await;
    let pinned = make_file(&store, "pinned.bin").await;
    let open = make_file(&store, "open.bin").await;
    for id in [&old, &pinned, &open] {
        cache.create_placeholder(id).await.unwrap();
        cache.write(id, 0, b"12345678").await.unwrap();
        store
            .set_cache_content(id, Presence::Full, 8, None)
            .await
            .unwrap();
    }
    store.set_pinned(&pinned, true).await.unwrap();
    store.bump_open_count(&open, 1).await.unwrap();
    // Make "old" the LRU entry.
    sqlx::query("UPDATE cache_entries SET last_accessed = 1 WHERE object_id = ?1")
        .bind(&old)
        .execute(store.pool_for_tests())
        .await
        .unwrap();

    let freed = cache.evict_once().await.unwrap();
    assert!(freed >= 8);
    assert_eq!(
        store.get_cache_entry(&old).await.unwrap().unwrap().present_locally,
        Presence::Absent
    );
    assert_eq!(
        store.get_cache_entry(&pinned).await.unwrap().unwrap().present_locally,
        Presence::Full
    );
    assert_eq!(
        store.get_cache_entry(&open).await.unwrap().unwrap().present_locally,
        Presence::Full
    );
    assert!(cache.read(&pinned, 0, 8).await.is_ok());
}

#[tokio::test]
async fn zero_byte_files_need_no_chunks() {
    let (cache, store, _dir) = make_cache(u64::MAX).await;
    let id = make_file(&store, "empty.txt").await;

    let part = cache.begin_full_download(&id).await.unwrap();
    tokio::fs::write(&part, b"").await.unwrap();
    let (size, _hash) = cache.commit_full_download(&id).await.unwrap();
    assert_eq!(size, 0);
    assert_eq!(store.chunk_count(&id).await.unwrap(), 0);
    assert_eq!(
        cache.missing_chunks(&id, 0, 4096, 0).await.unwrap(),
        Vec::<i64>::new()
    );
}
