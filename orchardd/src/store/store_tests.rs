use super::*;
use crate::sync::queue::{
    ActionType, Direction, Lane, NewAction, PRIORITY_BACKGROUND, PRIORITY_FUSE,
    PRIORITY_INTERACTIVE,
};
use sqlx::SqlitePool;

async fn make_store() -> StateStore {
    let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
    let store = StateStore::from_pool(pool);
    store.init().await.unwrap();
    store
}

fn delta(cloud_id: &str, parent_id: &str, name: &str, etag: &str) -> RemoteDelta {
    RemoteDelta {
        cloud_id: cloud_id.to_string(),
        cloud_parent_id: "FOLDER::parent".to_string(),
        parent_id: parent_id.to_string(),
        name: name.to_string(),
        kind: ObjectKind::File,
        size: Some(10),
        etag: Some(etag.to_string()),
        revision: None,
        cloud_modified_at: Some(1_700_000_000),
    }
}

#[tokio::test]
async fn init_is_idempotent_and_creates_the_root() {
    let store = make_store().await;
    store.init().await.unwrap();
    let root = store.get_object(ROOT_OBJECT_ID).await.unwrap().unwrap();
    assert_eq!(root.kind, ObjectKind::Folder);
    assert!(root.parent_id.is_none());
    assert!(!root.deleted);
}

#[tokio::test]
async fn resolve_path_walks_names_and_extensions() {
    let store = make_store().await;
    let docs = store
        .create_local_object(ROOT_OBJECT_ID, "Docs", ObjectKind::Folder)
        .await
        .unwrap();
    let file = store
        .create_local_object(&docs.id, "report.final.pdf", ObjectKind::File)
        .await
        .unwrap();
    assert_eq!(file.name, "report.final");
    assert_eq!(file.extension.as_deref(), Some("pdf"));

    let resolved = store
        .resolve_path("/Docs/report.final.pdf")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(resolved.id, file.id);
    assert_eq!(resolved.full_name(), "report.final.pdf");

    assert!(store.resolve_path("/Docs/missing.txt").await.unwrap().is_none());
    // Case-sensitive.
    assert!(store.resolve_path("/docs").await.unwrap().is_none());
    let root = store.resolve_path("/").await.unwrap().unwrap();
    assert_eq!(root.id, ROOT_OBJECT_ID);
}

#[tokio::test]
async fn sibling_names_are_unique_among_non_deleted() {
    let store = make_store().await;
    store
        .create_local_object(ROOT_OBJECT_ID, "a.txt", ObjectKind::File)
        .await
        .unwrap();
    let err = store
        .create_local_object(ROOT_OBJECT_ID, "a.txt", ObjectKind::File)
        .await
        .expect_err("duplicate sibling");
    assert!(matches!(err, StoreError::AlreadyExists { .. }));

    // A deleted sibling frees the name.
    let first = store.resolve_path("/a.txt").await.unwrap().unwrap();
    store.mark_deleted(&first.id, Direction::Push).await.unwrap();
    store
        .create_local_object(ROOT_OBJECT_ID, "a.txt", ObjectKind::File)
        .await
        .unwrap();
}

#[tokio::test]
async fn local_objects_start_pending_push() {
    let store = make_store().await;
    let object = store
        .create_local_object(ROOT_OBJECT_ID, "new.txt", ObjectKind::File)
        .await
        .unwrap();
    assert_eq!(object.origin, Origin::Local);
    assert_eq!(object.sync_state, SyncState::PendingPush);
    assert!(object.dirty);
    assert!(object.cloud_id.is_none());
}

#[tokio::test]
async fn remote_delta_inserts_then_updates_by_cloud_id() {
    let store = make_store().await;
    let created = store
        .apply_remote_delta(&delta("DOC::a", ROOT_OBJECT_ID, "a.txt", "e1"))
        .await
        .unwrap();
    assert_eq!(created.origin, Origin::Cloud);
    assert_eq!(created.sync_state, SyncState::Synced);
    let shadow = store.get_shadow(&created.id).await.unwrap().unwrap();
    assert_eq!(shadow.etag.as_deref(), Some("e1"));

    let renamed = store
        .apply_remote_delta(&delta("DOC::a", ROOT_OBJECT_ID, "b.txt", "e2"))
        .await
        .unwrap();
    assert_eq!(renamed.id, created.id);
    assert_eq!(renamed.full_name(), "b.txt");
    let shadow = store.get_shadow(&created.id).await.unwrap().unwrap();
    assert_eq!(shadow.etag.as_deref(), Some("e2"));
}

#[tokio::test]
async fn remote_delta_leaves_dirty_objects_alone() {
    let store = make_store().await;
    let object = store
        .apply_remote_delta(&delta("DOC::a", ROOT_OBJECT_ID, "a.txt", "e1"))
        .await
        .unwrap();
    store.mark_dirty(&object.id).await.unwrap();

    let untouched = store
        .apply_remote_delta(&delta("DOC::a", ROOT_OBJECT_ID, "renamed.txt", "e2"))
        .await
        .unwrap();
    assert_eq!(untouched.full_name(), "a.txt");
    assert_eq!(untouched.etag.as_deref(), Some("e1"));
    // The shadow keeps the last synced baseline too.
    let shadow = store.get_shadow(&object.id).await.unwrap().unwrap();
    assert_eq!(shadow.etag.as_deref(), Some("e1"));
}

#[tokio::test]
async fn mark_dirty_is_idempotent() {
    let store = make_store().await;
    let object = store
        .apply_remote_delta(&delta("DOC::a", ROOT_OBJECT_ID, "a.txt", "e1"))
        .await
        .unwrap();
    store.mark_dirty(&object.id).await.unwrap();
    store.mark_dirty(&object.id).await.unwrap();
    let refreshed = store.get_object(&object.id).await.unwrap().unwrap();
    assert!(refreshed.dirty);
    assert_eq!(refreshed.sync_state, SyncState::Dirty);
}

#[tokio::test]
async fn deleted_cloud_objects_reject_forward_transitions() {
    let store = make_store().await;
    let object = store
        .apply_remote_delta(&delta("DOC::a", ROOT_OBJECT_ID, "a.txt", "e1"))
        .await
        .unwrap();
    store.mark_deleted(&object.id, Direction::Pull).await.unwrap();

    let err = store
        .set_sync_state(&object.id, SyncState::Synced)
        .await
        .expect_err("tombstones cannot resurrect to synced");
    assert!(matches!(err, StoreError::InvalidTransition { .. }));
}

#[tokio::test]
async fn upload_success_settles_object_shadow_and_cache() {
    let store = make_store().await;
    let object = store
        .create_local_object(ROOT_OBJECT_ID, "a.txt", ObjectKind::File)
        .await
        .unwrap();
    store
        .upsert_cache_entry(&object.id, "/cache/a", 5)
        .await
        .unwrap();

    store
        .apply_upload_success(
            &object.id,
            "DOC::a",
            "e1",
            Some("r1"),
            Some(5),
            Some("hash-1"),
            Some("FOLDER::root"),
        )
        .await
        .unwrap();

    let refreshed = store.get_object(&object.id).await.unwrap().unwrap();
    assert_eq!(refreshed.sync_state, SyncState::Synced);
    assert!(!refreshed.dirty);
    assert_eq!(refreshed.cloud_id.as_deref(), Some("DOC::a"));
    assert_eq!(refreshed.etag.as_deref(), Some("e1"));
    assert_eq!(refreshed.revision.as_deref(), Some("r1"));

    let shadow = store.get_shadow(&object.id).await.unwrap().unwrap();
    assert_eq!(shadow.etag.as_deref(), Some("e1"));
    assert_eq!(shadow.file_hash.as_deref(), Some("hash-1"));

    let entry = store.get_cache_entry(&object.id).await.unwrap().unwrap();
    assert_eq!(entry.file_hash.as_deref(), Some("hash-1"));
}

#[tokio::test]
async fn purge_object_removes_every_trace() {
    let store = make_store().await;
    let object = store
        .apply_remote_delta(&delta("DOC::a", ROOT_OBJECT_ID, "a.txt", "e1"))
        .await
        .unwrap();
    store
        .upsert_cache_entry(&object.id, "/cache/a", 10)
        .await
        .unwrap();
    store.insert_chunk(&object.id, 0).await.unwrap();
    store
        .enqueue_action(&NewAction::download(&object.id, PRIORITY_BACKGROUND))
        .await
        .unwrap();

    store.purge_object(&object.id).await.unwrap();
    assert!(store.get_object(&object.id).await.unwrap().is_none());
    assert!(store.get_shadow(&object.id).await.unwrap().is_none());
    assert!(store.get_cache_entry(&object.id).await.unwrap().is_none());
    assert_eq!(store.count_actions_with_status("pending").await.unwrap(), 0);
}

#[tokio::test]
async fn conflict_history_appends_audit_notes() {
    let store = make_store().await;
    let object = store
        .create_local_object(ROOT_OBJECT_ID, "a.txt", ObjectKind::File)
        .await
        .unwrap();
    store
        .append_conflict_history(&object.id, "DOC::displaced-1", Some("e2"))
        .await
        .unwrap();
    store
        .append_conflict_history(&object.id, "DOC::displaced-2", None)
        .await
        .unwrap();

    let refreshed = store.get_object(&object.id).await.unwrap().unwrap();
    let history: Vec<serde_json::Value> =
        serde_json::from_str(refreshed.conflict_history.as_deref().unwrap()).unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0]["displaced_cloud_id"], "DOC::displaced-1");
    assert_eq!(history[0]["etag"], "e2");
    assert_eq!(history[1]["displaced_cloud_id"], "DOC::displaced-2");
}

// ---------------------------------------------------------------------
// Action queue behavior
// ---------------------------------------------------------------------

#[tokio::test]
async fn repeated_content_updates_coalesce_to_one_pending_action() {
    let store = make_store().await;
    let object = store
        .create_local_object(ROOT_OBJECT_ID, "a.txt", ObjectKind::File)
        .await
        .unwrap();
    for _ in 0..5 {
        store
            .enqueue_action(&NewAction::update_content(&object.id))
            .await
            .unwrap();
    }
    assert_eq!(store.count_actions_with_status("pending").await.unwrap(), 1);
}

#[tokio::test]
async fn upload_supersedes_pending_content_updates() {
    let store = make_store().await;
    let object = store
        .create_local_object(ROOT_OBJECT_ID, "a.txt", ObjectKind::File)
        .await
        .unwrap();
    store
        .enqueue_action(&NewAction::update_content(&object.id))
        .await
        .unwrap();
    store
        .enqueue_action(&NewAction::upload(&object.id))
        .await
        .unwrap();

    assert_eq!(store.count_actions_with_status("pending").await.unwrap(), 1);
    let action = store.claim_next("w", Lane::Io).await.unwrap().unwrap();
    assert_eq!(action.action_type, ActionType::Upload);
}

#[tokio::test]
async fn renames_collapse_keeping_the_final_destination() {
    let store = make_store().await;
    let object = store
        .create_local_object(ROOT_OBJECT_ID, "a.txt", ObjectKind::File)
        .await
        .unwrap();
    store
        .enqueue_action(&NewAction::rename(&object.id, "b.txt"))
        .await
        .unwrap();
    store
        .enqueue_action(&NewAction::rename(&object.id, "c.txt"))
        .await
        .unwrap();

    assert_eq!(store.count_actions_with_status("pending").await.unwrap(), 1);
    let action = store.claim_next("w", Lane::Meta).await.unwrap().unwrap();
    assert_eq!(action.destination.as_deref(), Some("c.txt"));
}

#[tokio::test]
async fn delete_cancels_pending_pushes_for_the_target() {
    let store = make_store().await;
    let object = store
        .create_local_object(ROOT_OBJECT_ID, "a.txt", ObjectKind::File)
        .await
        .unwrap();
    store
        .enqueue_action(&NewAction::upload(&object.id))
        .await
        .unwrap();
    store
        .enqueue_action(&NewAction::rename(&object.id, "b.txt"))
        .await
        .unwrap();
    store
        .enqueue_action(&NewAction::delete(&object.id, Direction::Push))
        .await
        .unwrap();

    assert_eq!(store.count_actions_with_status("pending").await.unwrap(), 1);
    let action = store.claim_next("w", Lane::Meta).await.unwrap().unwrap();
    assert_eq!(action.action_type, ActionType::Delete);
}

#[tokio::test]
async fn duplicate_chunk_requests_dedup_and_keep_highest_priority() {
    let store = make_store().await;
    let object = store
        .create_local_object(ROOT_OBJECT_ID, "big.bin", ObjectKind::File)
        .await
        .unwrap();
    let first = store
        .enqueue_action(&NewAction::download_chunk(&object.id, 3, PRIORITY_BACKGROUND))
        .await
        .unwrap();
    assert!(first.is_some());
    let second = store
        .enqueue_action(&NewAction::download_chunk(&object.id, 3, PRIORITY_FUSE))
        .await
        .unwrap();
    assert!(second.is_none());
    // A different chunk is a different action.
    store
        .enqueue_action(&NewAction::download_chunk(&object.id, 4, PRIORITY_FUSE))
        .await
        .unwrap();

    assert_eq!(store.count_actions_with_status("pending").await.unwrap(), 2);
    let action = store.claim_next("w", Lane::Io).await.unwrap().unwrap();
    // The deduped request inherited the blocked reader's priority.
    assert_eq!(action.priority, PRIORITY_FUSE);
}

#[tokio::test]
async fn claim_orders_by_priority_then_fifo() {
    let store = make_store().await;
    let low = store
        .create_local_object(ROOT_OBJECT_ID, "low.txt", ObjectKind::File)
        .await
        .unwrap();
    let mid = store
        .create_local_object(ROOT_OBJECT_ID, "mid.txt", ObjectKind::File)
        .await
        .unwrap();
    let high = store
        .create_local_object(ROOT_OBJECT_ID, "high.txt", ObjectKind::File)
        .await
        .unwrap();
    store
        .enqueue_action(&NewAction::download(&low.id, PRIORITY_BACKGROUND))
        .await
        .unwrap();
    store
        .enqueue_action(&NewAction::download(&mid.id, PRIORITY_INTERACTIVE))
        .await
        .unwrap();
    store
        .enqueue_action(&NewAction::download(&high.id, PRIORITY_FUSE))
        .await
        .unwrap();

    let first = store.claim_next("w", Lane::Io).await.unwrap().unwrap();
    assert_eq!(first.target_id, high.id);
    store.complete_action(first.action_id).await.unwrap();
    let second = store.claim_next("w", Lane::Io).await.unwrap().unwrap();
    assert_eq!(second.target_id, mid.id);
}

#[tokio::test]
async fn claim_skips_targets_with_an_action_in_flight() {
    let store = make_store().await;
    let object = store
        .create_local_object(ROOT_OBJECT_ID, "a.txt", ObjectKind::File)
        .await
        .unwrap();
    let other = store
        .create_local_object(ROOT_OBJECT_ID, "b.txt", ObjectKind::File)
        .await
        .unwrap();
    store
        .enqueue_action(&NewAction::download_chunk(&object.id, 0, PRIORITY_FUSE))
        .await
        .unwrap();
    store
        .enqueue_action(&NewAction::download_chunk(&object.id, 1, PRIORITY_FUSE))
        .await
        .unwrap();
    store
        .enqueue_action(&NewAction::download(&other.id, PRIORITY_BACKGROUND))
        .await
        .unwrap();

    let first = store.claim_next("w1", Lane::Io).await.unwrap().unwrap();
    assert_eq!(first.target_id, object.id);
    // Per-target FIFO: the second chunk must wait; the other object runs.
    let second = store.claim_next("w2", Lane::Io).await.unwrap().unwrap();
    assert_eq!(second.target_id, other.id);
    assert!(store.claim_next("w3", Lane::Io).await.unwrap().is_none());
}

#[tokio::test]
async fn lanes_separate_metadata_from_transfers() {
    let store = make_store().await;
    let object = store
        .create_local_object(ROOT_OBJECT_ID, "a.txt", ObjectKind::File)
        .await
        .unwrap();
    store
        .enqueue_action(&NewAction::upload(&object.id))
        .await
        .unwrap();
    assert!(store.claim_next("meta", Lane::Meta).await.unwrap().is_none());
    assert!(store.claim_next("io", Lane::Io).await.unwrap().is_some());
}

#[tokio::test]
async fn failed_actions_back_off_then_exhaust() {
    let store = make_store().await;
    let object = store
        .create_local_object(ROOT_OBJECT_ID, "a.txt", ObjectKind::File)
        .await
        .unwrap();
    store
        .enqueue_action(&NewAction::upload(&object.id))
        .await
        .unwrap();

    let action = store.claim_next("w", Lane::Io).await.unwrap().unwrap();
    let future = now_unix() + 3600;
    let outcome = store
        .fail_action(action.action_id, &object.id, "socket reset", future, 3)
        .await
        .unwrap();
    assert_eq!(outcome, FailOutcome::Requeued { not_before: future });
    // Gated by not_before, so nothing is claimable right now.
    assert!(store.claim_next("w", Lane::Io).await.unwrap().is_none());

    // Run the budget out: attempts two and three, the third exhausts.
    store.release_action(action.action_id, 0).await.unwrap();
    let mut last_outcome = outcome;
    for _ in 0..2 {
        let action = store.claim_next("w", Lane::Io).await.unwrap().unwrap();
        last_outcome = store
            .fail_action(action.action_id, &object.id, "socket reset", 0, 3)
            .await
            .unwrap();
    }
    assert_eq!(last_outcome, FailOutcome::Exhausted);
    assert!(store.claim_next("w", Lane::Io).await.unwrap().is_none());

    let failed = store.list_failed_actions().await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].last_error.as_deref(), Some("socket reset"));
    let refreshed = store.get_object(&object.id).await.unwrap().unwrap();
    assert_eq!(refreshed.sync_state, SyncState::Error);
}

#[tokio::test]
async fn startup_recovery_requeues_orphaned_processing_actions() {
    let store = make_store().await;
    let object = store
        .create_local_object(ROOT_OBJECT_ID, "a.txt", ObjectKind::File)
        .await
        .unwrap();
    store
        .enqueue_action(&NewAction::upload(&object.id))
        .await
        .unwrap();
    let claimed = store.claim_next("w-dead", Lane::Io).await.unwrap().unwrap();
    assert_eq!(store.count_actions_with_status("processing").await.unwrap(), 1);

    let recovered = store.recover_orphaned_actions().await.unwrap();
    assert_eq!(recovered, 1);
    let reclaimed = store.claim_next("w-new", Lane::Io).await.unwrap().unwrap();
    assert_eq!(reclaimed.action_id, claimed.action_id);
}

#[tokio::test]
async fn completing_a_completed_action_is_a_no_op() {
    let store = make_store().await;
    let object = store
        .create_local_object(ROOT_OBJECT_ID, "a.txt", ObjectKind::File)
        .await
        .unwrap();
    store
        .enqueue_action(&NewAction::upload(&object.id))
        .await
        .unwrap();
    let action = store.claim_next("w", Lane::Io).await.unwrap().unwrap();
    store.complete_action(action.action_id).await.unwrap();
    store.complete_action(action.action_id).await.unwrap();
    assert_eq!(store.count_actions_with_status("pending").await.unwrap(), 0);
}

#[tokio::test]
async fn object_path_walks_parents() {
    let store = make_store().await;
    let docs = store
        .create_local_object(ROOT_OBJECT_ID, "Docs", ObjectKind::Folder)
        .await
        .unwrap();
    let sub = store
        .create_local_object(&docs.id, "Taxes", ObjectKind::Folder)
        .await
        .unwrap();
    let file = store
        .create_local_object(&sub.id, "2025.pdf", ObjectKind::File)
        .await
        .unwrap();
    assert_eq!(
        store.object_path(&file.id).await.unwrap(),
        "/Docs/Taxes/2025.pdf"
    );
    assert_eq!(store.object_path(ROOT_OBJECT_ID).await.unwrap(), "/");
}
