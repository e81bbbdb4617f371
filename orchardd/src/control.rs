use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use orchard_core::RemoteAdapter;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::store::{Presence, StoreError, SyncState};
use crate::sync::engine::SyncEngine;
use crate::sync::queue::{NewAction, PRIORITY_INTERACTIVE};

/// Loopback-only control and query surface for the daemon.
pub struct ControlState<R> {
    engine: Arc<SyncEngine<R>>,
}

impl<R> Clone for ControlState<R> {
    fn clone(&self) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
        }
    }
}

impl<R> ControlState<R> {
    pub fn new(engine: Arc<SyncEngine<R>>) -> Self {
        Self { engine }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("invalid choice: {0}")]
    InvalidChoice(String),
}

impl IntoResponse for ControlError {
    fn into_response(self) -> Response {
        match self {
            ControlError::Store(err) => (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                format!("store error: {err}"),
            )
                .into_response(),
            ControlError::NotFound(id) => {
                (axum::http::StatusCode::NOT_FOUND, format!("object not found: {id}")).into_response()
            }
            ControlError::InvalidChoice(raw) => {
                (axum::http::StatusCode::BAD_REQUEST, format!("invalid choice: {raw}")).into_response()
            }
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub online: bool,
    pub paused: bool,
    pub pending_actions: i64,
    pub processing_actions: i64,
    pub failed_actions: i64,
    pub conflicts: i64,
    pub errored_objects: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConflictEntry {
    pub id: String,
    pub path: String,
    pub cloud_id: Option<String>,
    pub etag: Option<String>,
    pub conflict_history: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ResolveQuery {
    pub choice: String,
}

#[derive(Debug, Deserialize)]
pub struct PinQuery {
    #[serde(default = "default_pinned")]
    pub pinned: u8,
}

fn default_pinned() -> u8 {
    1
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OkResponse {
    pub ok: bool,
}

pub fn router<R: RemoteAdapter + 'static>(state: ControlState<R>) -> Router {
    Router::new()
        .route("/status", get(status::<R>))
        .route("/conflicts", get(conflicts::<R>))
        .route("/resolve/:id", post(resolve::<R>))
        .route("/pin/:id", post(pin::<R>))
        .route("/pause", post(pause::<R>))
        .route("/resume", post(resume::<R>))
        .with_state(state)
}

/// Binds on loopback only and serves until cancelled.
pub async fn serve<R: RemoteAdapter + 'static>(
    state: ControlState<R>,
    port: u16,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    eprintln!("[orchardd] control api listening on {addr}");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

async fn status<R: RemoteAdapter + 'static>(
    State(state): State<ControlState<R>>,
) -> Result<Json<StatusResponse>, ControlError> {
    let store = state.engine.store();
    Ok(Json(StatusResponse {
        online: state.engine.is_online(),
        paused: state.engine.is_paused(),
        pending_actions: store.count_actions_with_status("pending").await?,
        processing_actions: store.count_actions_with_status("processing").await?,
        failed_actions: store.count_actions_with_status("failed").await?,
        conflicts: store.count_objects_in_state(SyncState::Conflict).await?,
        errored_objects: store.count_objects_in_state(SyncState::Error).await?,
    }))
}

async fn conflicts<R: RemoteAdapter + 'static>(
    State(state): State<ControlState<R>>,
) -> Result<Json<Vec<ConflictEntry>>, ControlError> {
    let store = state.engine.store();
    let mut out = Vec::new();
    for object in store.list_objects_in_state(SyncState::Conflict).await? {
        out.push(ConflictEntry {
            path: store.object_path(&object.id).await?,
            id: object.id,
            cloud_id: object.cloud_id,
            etag: object.etag,
            conflict_history: object.conflict_history,
        });
    }
    Ok(Json(out))
}

/// Manual conflict resolution: `choice=local` re-pushes the local bytes,
/// `choice=remote` adopts the remote version.
async fn resolve<R: RemoteAdapter + 'static>(
    State(state): State<ControlState<R>>,
    Path(id): Path<String>,
    Query(query): Query<ResolveQuery>,
) -> Result<Json<OkResponse>, ControlError> {
    let store = state.engine.store();
    let object = store
        .get_object(&id)
        .await?
        .ok_or_else(|| ControlError::NotFound(id.clone()))?;
    if object.sync_state != SyncState::Conflict {
        return Ok(Json(OkResponse { ok: true }));
    }
    match query.choice.as_str() {
        "local" => {
            store.set_sync_state(&id, SyncState::Dirty).await?;
            store.mark_dirty(&id).await?;
            store
                .enqueue_action(&NewAction::update_content(&id))
                .await?;
        }
        "remote" => {
            store.clear_dirty_flag(&id).await?;
            store.set_sync_state(&id, SyncState::PendingPull).await?;
            store
                .enqueue_action(&NewAction::download(&id, PRIORITY_INTERACTIVE))
                .await?;
        }
        other => return Err(ControlError::InvalidChoice(other.to_string())),
    }
    Ok(Json(OkResponse { ok: true }))
}

/// Pinning guarantees a file stays fully cached and exempt from eviction.
async fn pin<R: RemoteAdapter + 'static>(
    State(state): State<ControlState<R>>,
    Path(id): Path<String>,
    Query(query): Query<PinQuery>,
) -> Result<Json<OkResponse>, ControlError> {
    let store = state.engine.store();
    store
        .get_object(&id)
        .await?
        .ok_or_else(|| ControlError::NotFound(id.clone()))?;
    let pinned = query.pinned != 0;
    store.set_pinned(&id, pinned).await?;
    if pinned {
        let absent = store
            .get_cache_entry(&id)
            .await?
            .map(|entry| entry.present_locally != Presence::Full)
            .unwrap_or(true);
        if absent {
            store
                .enqueue_action(&NewAction::download(&id, PRIORITY_INTERACTIVE))
                .await?;
        }
    } else if let Err(err) = state.engine.cache().evict_once().await {
        eprintln!("[orchardd] eviction after unpin failed: {err}");
    }
    Ok(Json(OkResponse { ok: true }))
}

async fn pause<R: RemoteAdapter + 'static>(
    State(state): State<ControlState<R>>,
) -> Json<OkResponse> {
    state.engine.pause();
    eprintln!("[orchardd] engine paused via control api");
    Json(OkResponse { ok: true })
}

async fn resume<R: RemoteAdapter + 'static>(
    State(state): State<ControlState<R>>,
) -> Json<OkResponse> {
    state.engine.resume();
    eprintln!("[orchardd] engine resumed via control api");
    Json(OkResponse { ok: true })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheStore;
    use crate::store::{ObjectKind, ROOT_OBJECT_ID, StateStore};
    use crate::sync::engine::EngineOptions;
    use orchard_core::DriveClient;
    use sqlx::SqlitePool;
    use tempfile::tempdir;

    async fn make_state() -> (ControlState<DriveClient>, StateStore, tempfile::TempDir) {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let store = StateStore::from_pool(pool);
        store.init().await.unwrap();
        let dir = tempdir().unwrap();
        let cache = CacheStore::new(
            dir.path().to_path_buf(),
            store.clone(),
            8,
            16,
            u64::MAX,
        );
        let remote = DriveClient::with_base_url("http://127.0.0.1:9", "token").unwrap();
        let engine = Arc::new(SyncEngine::new(
            remote,
            store.clone(),
            cache,
            EngineOptions::default(),
        ));
        (ControlState::new(engine), store, dir)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(router: Router, uri: &str) -> T {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        let body = reqwest::get(format!("http://{addr}{uri}"))
            .await
            .unwrap()
            .json::<T>()
            .await
            .unwrap();
        body
    }

    #[tokio::test]
    async fn status_reports_queue_and_conflict_counts() {
        let (state, store, _dir) = make_state().await;
        let object = store
            .create_local_object(ROOT_OBJECT_ID, "a.txt", ObjectKind::File)
            .await
            .unwrap();
        store
            .enqueue_action(&NewAction::upload(&object.id))
            .await
            .unwrap();
        store
            .set_sync_state(&object.id, SyncState::Conflict)
            .await
            .unwrap();

        let status: StatusResponse = get_json(router(state), "/status").await;
        assert_eq!(status.pending_actions, 1);
        assert_eq!(status.conflicts, 1);
        assert!(!status.paused);
    }

    #[tokio::test]
    async fn conflicts_lists_paths_for_parked_objects() {
        let (state, store, _dir) = make_state().await;
        let folder = store
            .create_local_object(ROOT_OBJECT_ID, "Docs", ObjectKind::Folder)
            .await
            .unwrap();
        let object = store
            .create_local_object(&folder.id, "draft.txt", ObjectKind::File)
            .await
            .unwrap();
        store
            .set_sync_state(&object.id, SyncState::Conflict)
            .await
            .unwrap();

        let conflicts: Vec<ConflictEntry> = get_json(router(state), "/conflicts").await;
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].path, "/Docs/draft.txt");
        assert_eq!(conflicts[0].id, object.id);
    }

    #[tokio::test]
    async fn resolve_remote_schedules_a_pull() {
        let (state, store, _dir) = make_state().await;
        let object = store
            .create_local_object(ROOT_OBJECT_ID, "a.txt", ObjectKind::File)
            .await
            .unwrap();
        store
            .set_sync_state(&object.id, SyncState::Conflict)
            .await
            .unwrap();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = router(state);
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        let client = reqwest::Client::new();
        let response: OkResponse = client
            .post(format!("http://{addr}/resolve/{}?choice=remote", object.id))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(response.ok);

        let refreshed = store.get_object(&object.id).await.unwrap().unwrap();
        assert_eq!(refreshed.sync_state, SyncState::PendingPull);
        assert!(!refreshed.dirty);
        assert_eq!(
            store.count_actions_with_status("pending").await.unwrap(),
            1
        );
    }
}
