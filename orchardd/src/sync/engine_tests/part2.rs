#[tokio::test]
async fn upload_pushes_new_file_and_records_cloud_identity() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("/v1/folders/{CLOUD_ROOT_ID}/children")))
        .respond_with(ResponseTemplate::new(200).set_body_json(children_page(serde_json::json!([]))))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path(format!("/v1/folders/{CLOUD_ROOT_ID}/items")))
        .and(query_param("name", "note.txt"))
        .and(body_bytes(b"hello"))
        .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
            "cloud_id": "DOC::note",
            "etag": "e1",
            "revision": "r1"
        })))
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let engine = make_engine(&server, dir.path()).await;
    let object = seed_local_file(&engine, "note.txt", b"hello").await;

    engine
        .store
        .enqueue_action(&NewAction::upload(&object.id))
        .await
        .unwrap();
    assert!(engine.run_once("io-0", Lane::Io).await.unwrap());

    let refreshed = engine.store.get_object(&object.id).await.unwrap().unwrap();
    assert_eq!(refreshed.sync_state, SyncState::Synced);
    assert!(!refreshed.dirty);
    assert_eq!(refreshed.cloud_id.as_deref(), Some("DOC::note"));
    assert_eq!(refreshed.etag.as_deref(), Some("e1"));
    assert_eq!(refreshed.revision.as_deref(), Some("r1"));
    let shadow = engine.store.get_shadow(&object.id).await.unwrap().unwrap();
    assert_eq!(shadow.etag.as_deref(), Some("e1"));
    assert!(shadow.file_hash.is_some());
}

#[tokio::test]
async fn upload_displaces_same_named_remote_sibling() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("/v1/folders/{CLOUD_ROOT_ID}/children")))
        .respond_with(ResponseTemplate::new(200).set_body_json(children_page(serde_json::json!([
            {
                "cloud_id": "DOC::other",
                "name": "note.txt",
                "type": "file",
                "size": 3,
                "etag": "eX"
            }
        ]))))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/v1/items/DOC::other"))
        .and(header("if-match", "eX"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path(format!("/v1/folders/{CLOUD_ROOT_ID}/items")))
        .and(query_param("name", "note.txt"))
        .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
            "cloud_id": "DOC::mine",
            "etag": "e1"
        })))
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let engine = make_engine(&server, dir.path()).await;
    let object = seed_local_file(&engine, "note.txt", b"abc").await;

    engine
        .store
        .enqueue_action(&NewAction::upload(&object.id))
        .await
        .unwrap();
    assert!(engine.run_once("io-0", Lane::Io).await.unwrap());

    let refreshed = engine.store.get_object(&object.id).await.unwrap().unwrap();
    assert_eq!(refreshed.cloud_id.as_deref(), Some("DOC::mine"));
    // The displaced remote is preserved for audit.
    let history = refreshed.conflict_history.unwrap();
    assert!(history.contains("DOC::other"));
}

#[tokio::test]
async fn content_conflict_resolves_local_wins_by_displacement() {
    let server = MockServer::start().await;
    // The conditional update observes a precondition failure...
    Mock::given(method("PUT"))
        .and(path("/v1/items/DOC::a/content"))
        .and(header("if-match", "e1"))
        .respond_with(ResponseTemplate::new(412))
        .expect(1)
        .mount(&server)
        .await;
    // ...the remote moved to e2...
    Mock::given(method("GET"))
        .and(path("/v1/items/DOC::a"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "etag": "e2",
            "size": 9
        })))
        .mount(&server)
        .await;
    // ...Local Wins deletes it conditional on e2 and re-uploads.
    Mock::given(method("DELETE"))
        .and(path("/v1/items/DOC::a"))
        .and(header("if-match", "e2"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path(format!("/v1/folders/{CLOUD_ROOT_ID}/items")))
        .and(query_param("name", "a.txt"))
        .and(body_bytes(b"local own"))
        .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
            "cloud_id": "DOC::a2",
            "etag": "e3"
        })))
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let engine = make_engine(&server, dir.path()).await;
    let object = seed_cloud_file(&engine, "DOC::a", "a.txt", 9, "e1").await;
    engine.cache.create_placeholder(&object.id).await.unwrap();
    engine.cache.write(&object.id, 0, b"local own").await.unwrap();
    engine.store.mark_dirty(&object.id).await.unwrap();

    engine
        .store
        .enqueue_action(&NewAction::update_content(&object.id))
        .await
        .unwrap();
    assert!(engine.run_once("io-0", Lane::Io).await.unwrap());

    let refreshed = engine.store.get_object(&object.id).await.unwrap().unwrap();
    assert_eq!(refreshed.sync_state, SyncState::Synced);
    assert_eq!(refreshed.cloud_id.as_deref(), Some("DOC::a2"));
    assert_eq!(refreshed.etag.as_deref(), Some("e3"));
    let shadow = engine.store.get_shadow(&object.id).await.unwrap().unwrap();
    assert_eq!(shadow.etag.as_deref(), Some("e3"));
    assert!(refreshed.conflict_history.unwrap().contains("DOC::a"));
}

#[tokio::test]
async fn content_conflict_remote_wins_schedules_pull() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/v1/items/DOC::a/content"))
        .respond_with(ResponseTemplate::new(412))
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let engine =
        make_engine_with_policy(&server, dir.path(), ConflictPolicy::RemoteWins).await;
    let object = seed_cloud_file(&engine, "DOC::a", "a.txt", 4, "e1").await;
    engine.cache.create_placeholder(&object.id).await.unwrap();
    engine.cache.write(&object.id, 0, b"mine").await.unwrap();
    engine.store.mark_dirty(&object.id).await.unwrap();

    engine
        .store
        .enqueue_action(&NewAction::update_content(&object.id))
        .await
        .unwrap();
    assert!(engine.run_once("io-0", Lane::Io).await.unwrap());

    let refreshed = engine.store.get_object(&object.id).await.unwrap().unwrap();
    assert!(!refreshed.dirty);
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
async fn content_conflict_manual_parks_the_object() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/v1/items/DOC::a/content"))
        .respond_with(ResponseTemplate::new(412))
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let engine = make_engine_with_policy(&server, dir.path(), ConflictPolicy::Manual).await;
    let object = seed_cloud_file(&engine, "DOC::a", "a.txt", 4, "e1").await;
    engine.cache.create_placeholder(&object.id).await.unwrap();
    engine.cache.write(&object.id, 0, b"mine").await.unwrap();
    engine.store.mark_dirty(&object.id).await.unwrap();

    engine
        .store
        .enqueue_action(&NewAction::update_content(&object.id))
        .await
        .unwrap();
    assert!(engine.run_once("io-0", Lane::Io).await.unwrap());

    let refreshed = engine.store.get_object(&object.id).await.unwrap().unwrap();
    assert_eq!(refreshed.sync_state, SyncState::Conflict);
    assert_eq!(
        engine
            .store
            .list_objects_in_state(SyncState::Conflict)
            .await
            .unwrap()
            .len(),
        1
    );
}

#[tokio::test]
async fn rename_is_conditional_and_rewrites_the_shadow() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/items/DOC::a/rename"))
        .and(query_param("name", "b.txt"))
        .and(header("if-match", "e1"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({"etag": "e2", "revision": "r2"})),
        )
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let engine = make_engine(&server, dir.path()).await;
    let object = seed_cloud_file(&engine, "DOC::a", "a.txt", 4, "e1").await;
    engine
        .store
        .relocate_object(&object.id, crate::store::ROOT_OBJECT_ID, "b.txt")
        .await
        .unwrap();

    engine
        .store
        .enqueue_action(&NewAction::rename(&object.id, "b.txt"))
        .await
        .unwrap();
    assert!(engine.run_once("meta-0", Lane::Meta).await.unwrap());

    let refreshed = engine.store.get_object(&object.id).await.unwrap().unwrap();
    assert_eq!(refreshed.full_name(), "b.txt");
    assert_eq!(refreshed.etag.as_deref(), Some("e2"));
    assert_eq!(refreshed.sync_state, SyncState::Synced);
    let shadow = engine.store.get_shadow(&object.id).await.unwrap().unwrap();
    assert_eq!(shadow.name.as_deref(), Some("b.txt"));
    assert_eq!(shadow.etag.as_deref(), Some("e2"));
}

#[tokio::test]
async fn move_targets_the_new_parents_cloud_id() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/items/DOC::a/move"))
        .and(query_param("parent", "FOLDER::dst"))
        .and(header("if-match", "e1"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({"etag": "e2"})),
        )
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let engine = make_engine(&server, dir.path()).await;
    let object = seed_cloud_file(&engine, "DOC::a", "a.txt", 4, "e1").await;
    let folder = engine
        .store
        .apply_remote_delta(&RemoteDelta {
            cloud_id: "FOLDER::dst".to_string(),
            cloud_parent_id: CLOUD_ROOT_ID.to_string(),
            parent_id: crate::store::ROOT_OBJECT_ID.to_string(),
            name: "Dst".to_string(),
            kind: ObjectKind::Folder,
            size: None,
            etag: None,
            revision: None,
            cloud_modified_at: None,
        })
        .await
        .unwrap();

    engine
        .store
        .enqueue_action(&NewAction::move_to(&object.id, &folder.id))
        .await
        .unwrap();
    assert!(engine.run_once("meta-0", Lane::Meta).await.unwrap());

    let refreshed = engine.store.get_object(&object.id).await.unwrap().unwrap();
    assert_eq!(refreshed.parent_id.as_deref(), Some(folder.id.as_str()));
    assert_eq!(refreshed.cloud_parent_id.as_deref(), Some("FOLDER::dst"));
    assert_eq!(refreshed.etag.as_deref(), Some("e2"));
}

#[tokio::test]
async fn push_delete_is_conditional_and_drops_the_tombstone() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/v1/items/DOC::a"))
        .and(header("if-match", "e1"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let engine = make_engine(&server, dir.path()).await;
    let object = seed_cloud_file(&engine, "DOC::a", "a.txt", 4, "e1").await;
    engine
        .store
        .mark_deleted(&object.id, Direction::Push)
        .await
        .unwrap();

    engine
        .store
        .enqueue_action(&NewAction::delete(&object.id, Direction::Push))
        .await
        .unwrap();
    assert!(engine.run_once("meta-0", Lane::Meta).await.unwrap());

    // Both sides confirmed: object, shadow and cache rows are all gone.
    assert!(engine.store.get_object(&object.id).await.unwrap().is_none());
    assert!(engine.store.get_shadow(&object.id).await.unwrap().is_none());
}

#[tokio::test]
async fn push_delete_treats_already_gone_as_success() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/v1/items/DOC::a"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let engine = make_engine(&server, dir.path()).await;
    let object = seed_cloud_file(&engine, "DOC::a", "a.txt", 4, "e1").await;
    engine
        .store
        .mark_deleted(&object.id, Direction::Push)
        .await
        .unwrap();
    engine
        .store
        .enqueue_action(&NewAction::delete(&object.id, Direction::Push))
        .await
        .unwrap();

    assert!(engine.run_once("meta-0", Lane::Meta).await.unwrap());
    assert!(engine.store.get_object(&object.id).await.unwrap().is_none());
}

#[tokio::test]
async fn delete_conflict_restores_the_remote_version() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/v1/items/DOC::a"))
        .and(header("if-match", "e1"))
        .respond_with(ResponseTemplate::new(412))
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let engine = make_engine(&server, dir.path()).await;
    let object = seed_cloud_file(&engine, "DOC::a", "a.txt", 4, "e1").await;
    engine
        .store
        .mark_deleted(&object.id, Direction::Push)
        .await
        .unwrap();
    engine
        .store
        .enqueue_action(&NewAction::delete(&object.id, Direction::Push))
        .await
        .unwrap();

    assert!(engine.run_once("meta-0", Lane::Meta).await.unwrap());

    // The local delete is cancelled and the remote edit is pulled back.
    let refreshed = engine.store.get_object(&object.id).await.unwrap().unwrap();
    assert!(!refreshed.deleted);
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
async fn folder_upload_creates_remotely_and_lists_back() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(format!("/v1/folders/{CLOUD_ROOT_ID}/folders")))
        .and(query_param("name", "Docs"))
        .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
            "cloud_id": "FOLDER::docs",
            "etag": "e1"
        })))
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let engine = make_engine(&server, dir.path()).await;
    let folder = engine
        .store
        .create_local_object(crate::store::ROOT_OBJECT_ID, "Docs", ObjectKind::Folder)
        .await
        .unwrap();

    engine
        .store
        .enqueue_action(&NewAction::upload(&folder.id))
        .await
        .unwrap();
    assert!(engine.run_once("io-0", Lane::Io).await.unwrap());

    let refreshed = engine.store.get_object(&folder.id).await.unwrap().unwrap();
    assert_eq!(refreshed.cloud_id.as_deref(), Some("FOLDER::docs"));
    assert_eq!(refreshed.sync_state, SyncState::Synced);
    assert!(
        engine
            .store
            .pending_action_exists(&folder.id, ActionType::ListChildren)
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn sparse_files_defer_upload_until_promotion() {
    let server = MockServer::start().await;
    let dir = tempdir().unwrap();
    let engine = make_engine(&server, dir.path()).await;

    let size = CHUNK * 3;
    let object = seed_cloud_file(&engine, "DOC::big", "big.bin", size as i64, "e1").await;
    engine.cache.reserve_sparse(&object.id, size).await.unwrap();
    engine
        .cache
        .write_chunk(&object.id, 0, &[1u8; CHUNK as usize], size)
        .await
        .unwrap();
    engine.store.mark_dirty(&object.id).await.unwrap();

    engine
        .store
        .enqueue_action(&NewAction::update_content(&object.id))
        .await
        .unwrap();
    assert!(engine.run_once("io-0", Lane::Io).await.unwrap());

    // The push was deferred, not failed, and the holes are being fetched.
    let refreshed = engine.store.get_object(&object.id).await.unwrap().unwrap();
    assert!(refreshed.dirty);
    assert_ne!(refreshed.sync_state, SyncState::Error);
    let mut chunk_requests = 0;
    while let Some(action) = engine.store.claim_next("io-1", Lane::Io).await.unwrap() {
        if action.action_type == ActionType::DownloadChunk {
            chunk_requests += 1;
        }
        engine.store.complete_action(action.action_id).await.unwrap();
    }
    assert_eq!(chunk_requests, 2);
}
