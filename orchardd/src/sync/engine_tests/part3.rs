#[tokio::test]
async fn transient_failures_requeue_with_backoff() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/items/DOC::a"))
        .respond_with(ResponseTemplate::new(503).set_body_string("try later"))
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let engine = make_engine(&server, dir.path()).await;
    let object = seed_cloud_file(&engine, "DOC::a", "a.txt", 4, "e1").await;
    engine
        .store
        .enqueue_action(&NewAction::download(&object.id, PRIORITY_FUSE))
        .await
        .unwrap();

    assert!(engine.run_once("io-0", Lane::Io).await.unwrap());

    // Requeued, gated by not_before, with the error recorded on the row.
    assert_eq!(
        engine.store.count_actions_with_status("pending").await.unwrap(),
        1
    );
    assert!(engine.store.claim_next("io-0", Lane::Io).await.unwrap().is_none());
    let refreshed = engine.store.get_object(&object.id).await.unwrap().unwrap();
    assert_ne!(refreshed.sync_state, SyncState::Error);
}

#[tokio::test]
async fn exhausted_retries_surface_the_object_as_errored() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/items/DOC::a"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let engine = make_engine(&server, dir.path()).await;
    let object = seed_cloud_file(&engine, "DOC::a", "a.txt", 4, "e1").await;
    let action_id = engine
        .store
        .enqueue_action(&NewAction::download(&object.id, PRIORITY_FUSE))
        .await
        .unwrap()
        .unwrap();

    for attempt in 0..3 {
        assert!(engine.run_once("io-0", Lane::Io).await.unwrap());
        if attempt < 2 {
            // Skip the backoff gate so the next attempt is claimable now.
            engine.store.release_action(action_id, 0).await.unwrap();
        }
    }

    assert_eq!(engine.store.list_failed_actions().await.unwrap().len(), 1);
    let refreshed = engine.store.get_object(&object.id).await.unwrap().unwrap();
    assert_eq!(refreshed.sync_state, SyncState::Error);
}

#[tokio::test]
async fn auth_failures_pause_the_engine_without_burning_retries() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/items/DOC::a"))
        .respond_with(ResponseTemplate::new(401).set_body_string("token expired"))
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let engine = make_engine(&server, dir.path()).await;
    let object = seed_cloud_file(&engine, "DOC::a", "a.txt", 4, "e1").await;
    engine
        .store
        .enqueue_action(&NewAction::download(&object.id, PRIORITY_FUSE))
        .await
        .unwrap();

    assert!(!engine.is_paused());
    assert!(engine.run_once("io-0", Lane::Io).await.unwrap());
    assert!(engine.is_paused());

    // The action went back to pending with its retry budget untouched.
    assert_eq!(
        engine.store.count_actions_with_status("pending").await.unwrap(),
        1
    );
    assert!(engine.store.list_failed_actions().await.unwrap().is_empty());

    engine.resume();
    assert!(!engine.is_paused());
}

#[tokio::test]
async fn offline_edits_coalesce_into_one_network_upload() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("/v1/folders/{CLOUD_ROOT_ID}/children")))
        .respond_with(ResponseTemplate::new(200).set_body_json(children_page(serde_json::json!([]))))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path(format!("/v1/folders/{CLOUD_ROOT_ID}/items")))
        .and(query_param("name", "note.txt"))
        .and(body_bytes(b"hello again"))
        .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
            "cloud_id": "DOC::note",
            "etag": "e1"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let engine = make_engine(&server, dir.path()).await;
    engine.set_online(false);

    // Offline: create plus two edits, queue holds a single push.
    let object = seed_local_file(&engine, "note.txt", b"hello").await;
    engine
        .store
        .enqueue_action(&NewAction::upload(&object.id))
        .await
        .unwrap();
    engine.cache.write(&object.id, 0, b"hello world").await.unwrap();
    engine
        .store
        .enqueue_action(&NewAction::update_content(&object.id))
        .await
        .unwrap();
    engine.cache.write(&object.id, 0, b"hello again").await.unwrap();
    engine
        .store
        .update_local_size(&object.id, 11)
        .await
        .unwrap();
    engine
        .store
        .enqueue_action(&NewAction::update_content(&object.id))
        .await
        .unwrap();
    assert_eq!(
        engine.store.count_actions_with_status("pending").await.unwrap(),
        1
    );

    // Reconnect: one upload call settles everything.
    engine.set_online(true);
    assert!(engine.run_once("io-0", Lane::Io).await.unwrap());
    let refreshed = engine.store.get_object(&object.id).await.unwrap().unwrap();
    assert_eq!(refreshed.sync_state, SyncState::Synced);
    assert_eq!(refreshed.cloud_id.as_deref(), Some("DOC::note"));
    assert_eq!(
        engine.store.count_actions_with_status("pending").await.unwrap(),
        0
    );
}

#[tokio::test]
async fn missing_cache_content_is_fatal_for_the_action() {
    let server = MockServer::start().await;
    let dir = tempdir().unwrap();
    let engine = make_engine(&server, dir.path()).await;
    let object = engine
        .store
        .create_local_object(crate::store::ROOT_OBJECT_ID, "ghost.txt", ObjectKind::File)
        .await
        .unwrap();
    // No cache entry was ever created for this object.
    engine
        .store
        .enqueue_action(&NewAction::upload(&object.id))
        .await
        .unwrap();

    assert!(engine.run_once("io-0", Lane::Io).await.unwrap());

    let failed = engine.store.list_failed_actions().await.unwrap();
    assert_eq!(failed.len(), 1);
    assert!(failed[0].last_error.as_deref().unwrap().contains("no cached content"));
    let refreshed = engine.store.get_object(&object.id).await.unwrap().unwrap();
    assert_eq!(refreshed.sync_state, SyncState::Error);
}

#[tokio::test]
async fn upload_against_vanished_remote_requeues_fresh() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/v1/items/DOC::a/content"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let engine = make_engine(&server, dir.path()).await;
    let object = seed_cloud_file(&engine, "DOC::a", "a.txt", 4, "e1").await;
    engine.cache.create_placeholder(&object.id).await.unwrap();
    engine.cache.write(&object.id, 0, b"data").await.unwrap();
    engine.store.mark_dirty(&object.id).await.unwrap();

    engine
        .store
        .enqueue_action(&NewAction::update_content(&object.id))
        .await
        .unwrap();
    assert!(engine.run_once("io-0", Lane::Io).await.unwrap());

    let refreshed = engine.store.get_object(&object.id).await.unwrap().unwrap();
    assert!(refreshed.missing_from_cloud);
    assert!(
        engine
            .store
            .pending_action_exists(&object.id, ActionType::Upload)
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn replaying_a_completed_delete_is_a_no_op() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/v1/items/DOC::a"))
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
    assert!(engine.store.get_object(&object.id).await.unwrap().is_none());

    // The same intent arriving again finds nothing to do and succeeds.
    engine
        .store
        .enqueue_action(&NewAction::delete(&object.id, Direction::Push))
        .await
        .unwrap();
    assert!(engine.run_once("meta-0", Lane::Meta).await.unwrap());
    assert_eq!(
        engine.store.count_actions_with_status("pending").await.unwrap(),
        0
    );
}
