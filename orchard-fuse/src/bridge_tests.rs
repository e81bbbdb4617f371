use super::*;
use orchardd::store::{ObjectKind, Presence, ROOT_OBJECT_ID, RemoteDelta, StateStore};
use sqlx::SqlitePool;
use std::sync::Arc;
use tempfile::{TempDir, tempdir};

const CHUNK: u64 = 8;
const THRESHOLD: u64 = 16;

async fn make_bridge(options: BridgeOptions) -> (Arc<OrchardBridge>, StateStore, CacheStore, TempDir) {
    let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
    let store = StateStore::from_pool(pool);
    store.init().await.unwrap();
    let dir = tempdir().unwrap();
    let cache = CacheStore::new(
        dir.path().to_path_buf(),
        store.clone(),
        CHUNK,
        THRESHOLD,
        u64::MAX,
    );
    cache.ensure_layout().await.unwrap();
    let bridge = Arc::new(OrchardBridge::new(store.clone(), cache.clone(), options));
    (bridge, store, cache, dir)
}

async fn seed_remote_file(store: &StateStore, name: &str, size: i64, etag: &str) -> String {
    store
        .apply_remote_delta(&RemoteDelta {
            cloud_id: format!("DOC::{name}"),
            cloud_parent_id: "FOLDER::root".to_string(),
            parent_id: ROOT_OBJECT_ID.to_string(),
            name: name.to_string(),
            kind: ObjectKind::File,
            size: Some(size),
            etag: Some(etag.to_string()),
            revision: None,
            cloud_modified_at: Some(1_700_000_000),
        })
        .await
        .unwrap()
        .id
}

async fn pending_actions(store: &StateStore) -> i64 {
    store.count_actions_with_status("pending").await.unwrap()
}

#[tokio::test]
async fn open_of_uncached_large_file_never_blocks_or_downloads() {
    let (bridge, store, _cache, _dir) = make_bridge(BridgeOptions::default()).await;
    let id = seed_remote_file(&store, "movie.mp4", (CHUNK * 12) as i64, "e1").await;

    let started = std::time::Instant::now();
    let handle = bridge.open("/movie.mp4").await.unwrap();
    assert!(started.elapsed() < Duration::from_millis(50));
    assert_eq!(handle.object_id, id);
    assert_eq!(pending_actions(&store).await, 0);
    let entry = store.get_cache_entry(&id).await.unwrap().unwrap();
    assert_eq!(entry.open_count, 1);
}

#[tokio::test]
async fn read_enqueues_first_chunk_and_unblocks_when_it_lands() {
    let (bridge, store, cache, _dir) = make_bridge(BridgeOptions {
        chunk_read_timeout: Duration::from_secs(5),
        ..BridgeOptions::default()
    })
    .await;
    let size = CHUNK * 12;
    let id = seed_remote_file(&store, "movie.mp4", size as i64, "e1").await;

    // Simulated engine: deliver chunk 0 shortly after the read blocks.
    let feeder_cache = cache.clone();
    let feeder_id = id.clone();
    let feeder = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        feeder_cache
            .write_chunk(&feeder_id, 0, &[7u8; CHUNK as usize], size)
            .await
            .unwrap();
    });

    let data = bridge.read("/movie.mp4", 0, 4, None).await.unwrap();
    feeder.await.unwrap();
    assert_eq!(data, vec![7u8; 4]);

    // The blocked read enqueued exactly the chunk it needed, at priority 10.
    let action = store
        .claim_next("test", orchardd::sync::queue::Lane::Io)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(action.action_type, ActionType::DownloadChunk);
    assert_eq!(action.priority, PRIORITY_FUSE);
    assert_eq!(
        orchardd::sync::queue::chunk_index_from_metadata(action.metadata.as_deref()),
        Some(0)
    );
}

#[tokio::test]
async fn read_deep_into_file_requests_only_the_covering_chunk() {
    let (bridge, store, _cache, _dir) = make_bridge(BridgeOptions {
        chunk_read_timeout: Duration::from_millis(50),
        ..BridgeOptions::default()
    })
    .await;
    let size = CHUNK * 12;
    let id = seed_remote_file(&store, "movie.mp4", size as i64, "e1").await;

    // 90/8 = 11.25, so only chunk index 11 is demanded.
    let err = bridge
        .read("/movie.mp4", CHUNK * 11 + 2, 4, None)
        .await
        .expect_err("no engine running; the read must time out");
    assert!(matches!(err, BridgeError::ReadTimeout(_)));

    let action = store
        .claim_next("test", orchardd::sync::queue::Lane::Io)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(action.target_id, id);
    assert_eq!(
        orchardd::sync::queue::chunk_index_from_metadata(action.metadata.as_deref()),
        Some(11)
    );
    assert!(store
        .claim_next("test", orchardd::sync::queue::Lane::Io)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn straddling_read_demands_both_chunks() {
    let (bridge, store, _cache, _dir) = make_bridge(BridgeOptions {
        chunk_read_timeout: Duration::from_millis(50),
        ..BridgeOptions::default()
    })
    .await;
    let size = CHUNK * 4;
    seed_remote_file(&store, "big.bin", size as i64, "e1").await;

    let err = bridge
        .read("/big.bin", CHUNK - 1, 2, None)
        .await
        .expect_err("expected timeout");
    assert!(matches!(err, BridgeError::ReadTimeout(_)));

    let mut indices = Vec::new();
    while let Some(action) = store
        .claim_next("test", orchardd::sync::queue::Lane::Io)
        .await
        .unwrap()
    {
        indices.push(
            orchardd::sync::queue::chunk_index_from_metadata(action.metadata.as_deref()).unwrap(),
        );
        store.complete_action(action.action_id).await.unwrap();
    }
    indices.sort_unstable();
    assert_eq!(indices, vec![0, 1]);
}

#[tokio::test]
async fn thumbnailer_reads_are_suppressed_without_side_effects() {
    let (bridge, store, _cache, _dir) = make_bridge(BridgeOptions {
        thumbnailer_denylist: vec!["ffmpeg-thumbnailer".to_string()],
        chunk_read_timeout: Duration::from_millis(50),
        ..BridgeOptions::default()
    })
    .await;
    let id = seed_remote_file(&store, "movie.mp4", (CHUNK * 12) as i64, "e1").await;

    let data = bridge
        .read("/movie.mp4", 0, 4096, Some("ffmpeg-thumbnailer"))
        .await
        .unwrap();
    // Clamped at EOF like any read, but every byte is zero.
    assert_eq!(data, vec![0u8; (CHUNK * 12) as usize]);
    assert_eq!(pending_actions(&store).await, 0);
    assert_eq!(store.chunk_count(&id).await.unwrap(), 0);
}

#[tokio::test]
async fn thumbnailer_denial_can_be_an_io_error_instead() {
    let (bridge, store, _cache, _dir) = make_bridge(BridgeOptions {
        thumbnailer_denylist: vec!["tumbler".to_string()],
        deny_action: DenyAction::IoError,
        chunk_read_timeout: Duration::from_millis(50),
        ..BridgeOptions::default()
    })
    .await;
    seed_remote_file(&store, "movie.mp4", (CHUNK * 12) as i64, "e1").await;

    let err = bridge
        .read("/movie.mp4", 0, 4096, Some("tumbler"))
        .await
        .expect_err("denied reader");
    assert!(matches!(err, BridgeError::Denied(_)));
    assert_eq!(pending_actions(&store).await, 0);
}

#[tokio::test]
async fn create_write_release_coalesces_to_one_push() {
    let (bridge, store, cache, _dir) = make_bridge(BridgeOptions::default()).await;

    let handle = bridge.create("/note.txt").await.unwrap();
    assert_eq!(pending_actions(&store).await, 1);

    bridge.write("/note.txt", 0, b"hello").await.unwrap();
    bridge.write("/note.txt", 5, b" world").await.unwrap();
    bridge.release(&handle).await.unwrap();

    // The release-time update_content collapsed into the pending upload.
    assert_eq!(pending_actions(&store).await, 1);
    let object = store.resolve_path("/note.txt").await.unwrap().unwrap();
    assert!(object.dirty);
    assert_eq!(object.size, 11);
    assert_eq!(cache.read(&object.id, 0, 11).await.unwrap(), b"hello world");
}

#[tokio::test]
async fn fresh_creates_are_immediately_readable() {
    let (bridge, _store, _cache, _dir) = make_bridge(BridgeOptions::default()).await;
    bridge.create("/draft.txt").await.unwrap();
    bridge.write("/draft.txt", 0, b"abc").await.unwrap();
    let data = bridge.read("/draft.txt", 0, 3, None).await.unwrap();
    assert_eq!(data, b"abc");
}

#[tokio::test]
async fn readdir_returns_stale_data_and_schedules_background_listing() {
    let (bridge, store, _cache, _dir) = make_bridge(BridgeOptions::default()).await;
    bridge.mkdir("/Docs").await.unwrap();
    // The fresh mkdir enqueued an upload; drain it for a clean count.
    let upload = store
        .claim_next("test", orchardd::sync::queue::Lane::Io)
        .await
        .unwrap()
        .unwrap();
    store.complete_action(upload.action_id).await.unwrap();

    let folder = store.resolve_path("/Docs").await.unwrap().unwrap();
    let child = store
        .create_local_object(&folder.id, "a.txt", ObjectKind::File)
        .await
        .unwrap();

    let entries = bridge.readdir("/Docs").await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].name, "a.txt");
    assert_eq!(entries[0].kind, ObjectKind::File);
    let _ = child;

    // last_synced is still zero, so a low-priority listing was scheduled.
    let action = store
        .claim_next("test", orchardd::sync::queue::Lane::Meta)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(action.action_type, ActionType::ListChildren);
    assert_eq!(action.priority, PRIORITY_BACKGROUND);
    assert_eq!(action.target_id, folder.id);
}

#[tokio::test]
async fn rename_and_move_enqueue_matching_actions() {
    let (bridge, store, _cache, _dir) = make_bridge(BridgeOptions::default()).await;
    bridge.mkdir("/Docs").await.unwrap();
    bridge.create("/a.txt").await.unwrap();
    let object = store.resolve_path("/a.txt").await.unwrap().unwrap();

    bridge.rename("/a.txt", "/b.txt").await.unwrap();
    assert!(store.resolve_path("/a.txt").await.unwrap().is_none());
    let renamed = store.resolve_path("/b.txt").await.unwrap().unwrap();
    assert_eq!(renamed.id, object.id);
    assert!(
        store
            .pending_action_exists(&object.id, ActionType::Rename)
            .await
            .unwrap()
    );

    bridge.rename("/b.txt", "/Docs/b.txt").await.unwrap();
    assert!(
        store
            .pending_action_exists(&object.id, ActionType::Move)
            .await
            .unwrap()
    );
    let moved = store.resolve_path("/Docs/b.txt").await.unwrap().unwrap();
    assert_eq!(moved.id, object.id);
}

#[tokio::test]
async fn unlink_tombstones_and_enqueues_delete() {
    let (bridge, store, _cache, _dir) = make_bridge(BridgeOptions::default()).await;
    let id = seed_remote_file(&store, "junk.bin", 4, "e1").await;

    bridge.unlink("/junk.bin").await.unwrap();
    assert!(store.resolve_path("/junk.bin").await.unwrap().is_none());
    let object = store.get_object(&id).await.unwrap().unwrap();
    assert!(object.deleted);
    assert_eq!(object.sync_state, SyncState::DeletedLocal);
    assert!(
        store
            .pending_action_exists(&id, ActionType::Delete)
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn rmdir_refuses_non_empty_folders() {
    let (bridge, store, _cache, _dir) = make_bridge(BridgeOptions::default()).await;
    bridge.mkdir("/Docs").await.unwrap();
    let folder = store.resolve_path("/Docs").await.unwrap().unwrap();
    store
        .create_local_object(&folder.id, "keep.txt", ObjectKind::File)
        .await
        .unwrap();

    let err = bridge.rmdir("/Docs").await.expect_err("folder not empty");
    assert!(matches!(err, BridgeError::NotEmpty(_)));
}

#[tokio::test]
async fn status_xattr_tracks_presence_and_sync_state() {
    let (bridge, store, cache, _dir) = make_bridge(BridgeOptions::default()).await;
    let id = seed_remote_file(&store, "movie.mp4", (CHUNK * 12) as i64, "e1").await;

    assert_eq!(
        bridge.getxattr("/movie.mp4", XATTR_STATUS).await.unwrap(),
        b"cloud"
    );

    cache
        .write_chunk(&id, 0, &[1u8; CHUNK as usize], CHUNK * 12)
        .await
        .unwrap();
    assert_eq!(
        bridge.getxattr("/movie.mp4", XATTR_STATUS).await.unwrap(),
        b"partial"
    );
    assert_eq!(
        bridge.getxattr("/movie.mp4", XATTR_EMBLEMS).await.unwrap(),
        b"emblem-synchronizing"
    );

    bridge.create("/new.txt").await.unwrap();
    bridge.write("/new.txt", 0, b"x").await.unwrap();
    assert_eq!(
        bridge.getxattr("/new.txt", XATTR_STATUS).await.unwrap(),
        b"dirty"
    );
}

#[tokio::test]
async fn pin_xattr_pins_and_schedules_materialization() {
    let (bridge, store, _cache, _dir) = make_bridge(BridgeOptions::default()).await;
    let id = seed_remote_file(&store, "keep.bin", 4, "e1").await;

    assert_eq!(bridge.getxattr("/keep.bin", XATTR_PIN).await.unwrap(), b"0");
    bridge.setxattr("/keep.bin", XATTR_PIN, b"1").await.unwrap();
    assert_eq!(bridge.getxattr("/keep.bin", XATTR_PIN).await.unwrap(), b"1");

    let entry = store.get_cache_entry(&id).await.unwrap().unwrap();
    assert!(entry.pinned);
    assert!(
        store
            .pending_action_exists(&id, ActionType::Download)
            .await
            .unwrap()
    );

    let err = bridge
        .setxattr("/keep.bin", "user.orchard.bogus", b"1")
        .await
        .expect_err("unknown xattr");
    assert!(matches!(err, BridgeError::UnsupportedXattr(_)));
}

#[tokio::test]
async fn remote_deletion_while_open_purges_on_last_close() {
    let (bridge, store, cache, _dir) = make_bridge(BridgeOptions::default()).await;
    let id = seed_remote_file(&store, "doomed.txt", 4, "e1").await;
    cache.create_placeholder(&id).await.unwrap();
    cache.write(&id, 0, b"data").await.unwrap();
    store
        .set_cache_content(&id, Presence::Full, 4, None)
        .await
        .unwrap();

    let handle = bridge.open("/doomed.txt").await.unwrap();

    // The remote listing noticed the file is gone.
    store
        .mark_deleted(&id, orchardd::sync::queue::Direction::Pull)
        .await
        .unwrap();

    // Content survives while the file is open.
    assert!(cache.read(&id, 0, 4).await.is_ok());

    bridge.release(&handle).await.unwrap();
    assert!(store.get_cache_entry(&id).await.unwrap().is_none());
    // The tombstone row stays for idempotency.
    let tombstone = store.get_object(&id).await.unwrap().unwrap();
    assert!(tombstone.deleted);
    assert_eq!(tombstone.sync_state, SyncState::DeletedCloud);
}
