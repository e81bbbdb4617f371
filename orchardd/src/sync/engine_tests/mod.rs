use super::*;
use crate::store::{Origin, Presence};
use orchard_core::DriveClient;
use sqlx::SqlitePool;
use std::path::Path as FsPath;
use tempfile::tempdir;
use wiremock::matchers::{body_bytes, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const CHUNK: u64 = 8;
const THRESHOLD: u64 = 16;

async fn make_engine(server: &MockServer, cache_root: &FsPath) -> SyncEngine<DriveClient> {
    make_engine_with_policy(server, cache_root, ConflictPolicy::LocalWins).await
}

async fn make_engine_with_policy(
    server: &MockServer,
    cache_root: &FsPath,
    policy: ConflictPolicy,
) -> SyncEngine<DriveClient> {
    let remote = DriveClient::with_base_url(&server.uri(), "test-token").unwrap();
    let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
    let store = StateStore::from_pool(pool);
    store.init().await.unwrap();
    let cache = CacheStore::new(
        cache_root.to_path_buf(),
        store.clone(),
        CHUNK,
        THRESHOLD,
        u64::MAX,
    );
    cache.ensure_layout().await.unwrap();
    SyncEngine::new(
        remote,
        store,
        cache,
        EngineOptions {
            conflict_policy: policy,
            backoff: Backoff::new(
                Duration::from_millis(1000),
                Duration::from_millis(2000),
                false,
            ),
            max_retries: 3,
        },
    )
}

async fn seed_cloud_file(
    engine: &SyncEngine<DriveClient>,
    cloud_id: &str,
    name: &str,
    size: i64,
    etag: &str,
) -> ObjectRecord {
    engine
        .store
        .apply_remote_delta(&RemoteDelta {
            cloud_id: cloud_id.to_string(),
            cloud_parent_id: CLOUD_ROOT_ID.to_string(),
            parent_id: crate::store::ROOT_OBJECT_ID.to_string(),
            name: name.to_string(),
            kind: ObjectKind::File,
            size: Some(size),
            etag: Some(etag.to_string()),
            revision: None,
            cloud_modified_at: Some(1_700_000_000),
        })
        .await
        .unwrap()
}

async fn seed_local_file(
    engine: &SyncEngine<DriveClient>,
    name: &str,
    content: &[u8],
) -> ObjectRecord {
    let object = engine
        .store
        .create_local_object(crate::store::ROOT_OBJECT_ID, name, ObjectKind::File)
        .await
        .unwrap();
    engine.cache.create_placeholder(&object.id).await.unwrap();
    engine.cache.write(&object.id, 0, content).await.unwrap();
    engine
        .store
        .update_local_size(&object.id, content.len() as i64)
        .await
        .unwrap();
    engine.store.get_object(&object.id).await.unwrap().unwrap()
}

fn children_page(items: serde_json::Value) -> serde_json::Value {
    let total = items.as_array().map(|a| a.len()).unwrap_or(0);
    serde_json::json!({
        "limit": 200,
        "offset": 0,
        "total": total,
        "items": items
    })
}

include!("part1.rs");
include!("part2.rs");
include!("part3.rs");
