#[tokio::test]
async fn list_children_indexes_entries_and_writes_shadows() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("/v1/folders/{CLOUD_ROOT_ID}/children")))
        .and(header("authorization", "Bearer test-token"))
        .and(query_param("offset", "0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(children_page(serde_json::json!([
            {
                "cloud_id": "DOC::a",
                "name": "a.txt",
                "type": "file",
                "size": 5,
                "etag": "e1",
                "modified": "2024-01-01T00:00:00Z"
            },
            {
                "cloud_id": "FOLDER::projects",
                "name": "Projects",
                "type": "folder"
            }
        ]))))
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let engine = make_engine(&server, dir.path()).await;
    engine
        .store
        .enqueue_action(&NewAction::list_children(
            crate::store::ROOT_OBJECT_ID,
            PRIORITY_BACKGROUND,
        ))
        .await
        .unwrap();
    assert!(engine.run_once("meta-0", Lane::Meta).await.unwrap());

    let file = engine
        .store
        .resolve_path("/a.txt")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(file.origin, Origin::Cloud);
    assert_eq!(file.sync_state, SyncState::Synced);
    assert_eq!(file.etag.as_deref(), Some("e1"));
    assert_eq!(file.size, 5);
    let shadow = engine.store.get_shadow(&file.id).await.unwrap().unwrap();
    assert_eq!(shadow.etag.as_deref(), Some("e1"));
    // No cache entry is materialized by a metadata pull.
    assert!(engine.store.get_cache_entry(&file.id).await.unwrap().is_none());

    let folder = engine
        .store
        .resolve_path("/Projects")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(folder.kind, ObjectKind::Folder);
    // The subfolder got its own background listing.
    assert!(
        engine
            .store
            .pending_action_exists(&folder.id, ActionType::ListChildren)
            .await
            .unwrap()
    );

    let root = engine
        .store
        .get_object(crate::store::ROOT_OBJECT_ID)
        .await
        .unwrap()
        .unwrap();
    assert!(root.last_synced > 0);
}

#[tokio::test]
async fn list_children_tombstones_vanished_cloud_objects() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("/v1/folders/{CLOUD_ROOT_ID}/children")))
        .respond_with(ResponseTemplate::new(200).set_body_json(children_page(serde_json::json!([]))))
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let engine = make_engine(&server, dir.path()).await;
    let object = seed_cloud_file(&engine, "DOC::gone", "gone.txt", 4, "e1").await;

    engine
        .store
        .enqueue_action(&NewAction::list_children(
            crate::store::ROOT_OBJECT_ID,
            PRIORITY_BACKGROUND,
        ))
        .await
        .unwrap();
    assert!(engine.run_once("meta-0", Lane::Meta).await.unwrap());

    let tombstone = engine.store.get_object(&object.id).await.unwrap().unwrap();
    assert!(tombstone.deleted);
    assert!(tombstone.missing_from_cloud);
    assert_eq!(tombstone.sync_state, SyncState::DeletedCloud);
    assert!(
        engine
            .store
            .pending_action_exists(&object.id, ActionType::Delete)
            .await
            .unwrap()
    );

    // The pull-side delete clears the projection but keeps the tombstone.
    assert!(engine.run_once("meta-0", Lane::Meta).await.unwrap());
    assert!(engine.store.get_shadow(&object.id).await.unwrap().is_none());
    assert!(engine.store.get_object(&object.id).await.unwrap().is_some());
}

#[tokio::test]
async fn download_fetches_small_file_via_part_swap() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/items/DOC::a"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "etag": "e1",
            "revision": "r1",
            "size": 5
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/items/DOC::a/content"))
        .and(header("if-match", "e1"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"hello"))
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let engine = make_engine(&server, dir.path()).await;
    let object = seed_cloud_file(&engine, "DOC::a", "a.txt", 5, "e1").await;

    engine
        .store
        .enqueue_action(&NewAction::download(&object.id, PRIORITY_FUSE))
        .await
        .unwrap();
    assert!(engine.run_once("io-0", Lane::Io).await.unwrap());

    assert_eq!(
        engine.cache.read(&object.id, 0, 5).await.unwrap(),
        b"hello"
    );
    let entry = engine
        .store
        .get_cache_entry(&object.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.present_locally, Presence::Full);
    assert!(entry.file_hash.is_some());
    let shadow = engine.store.get_shadow(&object.id).await.unwrap().unwrap();
    assert_eq!(shadow.file_hash, entry.file_hash);
    assert!(!engine.cache.part_path(&object.id).exists());
}

#[tokio::test]
async fn chunk_downloads_use_ranges_and_promote_when_complete() {
    let server = MockServer::start().await;
    let size = CHUNK * 2 + 4; // chunks 0..=2, last one short
    for (range, body) in [
        ("bytes=0-7", vec![b'a'; 8]),
        ("bytes=8-15", vec![b'b'; 8]),
        ("bytes=16-19", vec![b'c'; 4]),
    ] {
        Mock::given(method("GET"))
            .and(path("/v1/items/DOC::big/content"))
            .and(header("range", range))
            .and(header("if-match", "e1"))
            .respond_with(ResponseTemplate::new(206).set_body_bytes(body))
            .mount(&server)
            .await;
    }

    let dir = tempdir().unwrap();
    let engine = make_engine(&server, dir.path()).await;
    let object = seed_cloud_file(&engine, "DOC::big", "big.bin", size as i64, "e1").await;

    for index in [0i64, 1, 2] {
        engine
            .store
            .enqueue_action(&NewAction::download_chunk(&object.id, index, PRIORITY_FUSE))
            .await
            .unwrap();
        assert!(engine.run_once("io-0", Lane::Io).await.unwrap());
    }

    let entry = engine
        .store
        .get_cache_entry(&object.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.present_locally, Presence::Full);
    assert_eq!(engine.store.chunk_count(&object.id).await.unwrap(), 0);

    let mut expected = vec![b'a'; 8];
    expected.extend(vec![b'b'; 8]);
    expected.extend(vec![b'c'; 4]);
    assert_eq!(
        engine.cache.read(&object.id, 0, size as usize).await.unwrap(),
        expected
    );
}

#[tokio::test]
async fn stale_chunk_fetch_invalidates_and_schedules_reconcile() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/items/DOC::big/content"))
        .respond_with(ResponseTemplate::new(412))
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let engine = make_engine(&server, dir.path()).await;
    let size = CHUNK * 4;
    let object = seed_cloud_file(&engine, "DOC::big", "big.bin", size as i64, "e1").await;
    engine
        .cache
        .write_chunk(&object.id, 1, &[9u8; CHUNK as usize], size)
        .await
        .unwrap();

    engine
        .store
        .enqueue_action(&NewAction::download_chunk(&object.id, 0, PRIORITY_FUSE))
        .await
        .unwrap();
    assert!(engine.run_once("io-0", Lane::Io).await.unwrap());

    // Every cached chunk was dropped and a reconcile is queued at read priority.
    assert_eq!(engine.store.chunk_count(&object.id).await.unwrap(), 0);
    let action = engine
        .store
        .claim_next("meta-0", Lane::Meta)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(action.action_type, ActionType::EnsureLatest);
    assert_eq!(action.priority, PRIORITY_FUSE);
}

#[tokio::test]
async fn ensure_latest_schedules_pull_when_remote_moved() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/items/DOC::a"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "etag": "e2",
            "size": 5
        })))
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let engine = make_engine(&server, dir.path()).await;
    let object = seed_cloud_file(&engine, "DOC::a", "a.txt", 5, "e1").await;

    engine
        .store
        .enqueue_action(&NewAction::ensure_latest(&object.id, PRIORITY_BACKGROUND))
        .await
        .unwrap();
    assert!(engine.run_once("meta-0", Lane::Meta).await.unwrap());

    let refreshed = engine.store.get_object(&object.id).await.unwrap().unwrap();
    assert_eq!(refreshed.sync_state, SyncState::PendingPull);
    assert!(
        engine
            .store
            .pending_action_exists(&object.id, ActionType::Download)
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn ensure_latest_tombstones_remote_deletion() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/items/DOC::a"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let engine = make_engine(&server, dir.path()).await;
    let object = seed_cloud_file(&engine, "DOC::a", "a.txt", 5, "e1").await;

    engine
        .store
        .enqueue_action(&NewAction::ensure_latest(&object.id, PRIORITY_BACKGROUND))
        .await
        .unwrap();
    assert!(engine.run_once("meta-0", Lane::Meta).await.unwrap());

    let refreshed = engine.store.get_object(&object.id).await.unwrap().unwrap();
    assert!(refreshed.deleted);
    assert_eq!(refreshed.sync_state, SyncState::DeletedCloud);
}

#[tokio::test]
async fn ensure_latest_repushes_dirty_object_deleted_remotely() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/items/DOC::a"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let engine = make_engine(&server, dir.path()).await;
    let object = seed_cloud_file(&engine, "DOC::a", "a.txt", 5, "e1").await;
    engine.store.mark_dirty(&object.id).await.unwrap();

    engine
        .store
        .enqueue_action(&NewAction::ensure_latest(&object.id, PRIORITY_BACKGROUND))
        .await
        .unwrap();
    assert!(engine.run_once("meta-0", Lane::Meta).await.unwrap());

    // Local edit vs remote delete: the local bytes go back up as new.
    let refreshed = engine.store.get_object(&object.id).await.unwrap().unwrap();
    assert!(!refreshed.deleted);
    assert!(refreshed.missing_from_cloud);
    assert!(
        engine
            .store
            .pending_action_exists(&object.id, ActionType::Upload)
            .await
            .unwrap()
    );
}
