use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use thiserror::Error;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio_util::sync::CancellationToken;

use orchard_core::{
    CLOUD_ROOT_ID, EntryKind, ErrorClass, RemoteAdapter, RemoteEntry, RemoteError,
};

use super::backoff::Backoff;
use super::conflict::{
    self, Baseline, Classification, ConflictPolicy, DeleteConflict, DeleteResolution, Resolution,
};
use super::queue::{
    ActionType, Direction, Lane, NewAction, PRIORITY_BACKGROUND, PRIORITY_FUSE,
    PRIORITY_INTERACTIVE, chunk_index_from_metadata,
};
use crate::cache::{CacheError, CacheStore};
use crate::store::{
    ActionRecord, FailOutcome, ObjectKind, ObjectRecord, RemoteDelta, StateStore, StoreError,
    SyncState, now_unix,
};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),
    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("time parse error: {0}")]
    Time(#[from] time::error::Parse),
    #[error("object not found for action target: {0}")]
    MissingObject(String),
    #[error("object has no cached content: {0}")]
    MissingCacheContent(String),
    #[error("malformed action metadata on action {0}")]
    BadActionMetadata(i64),
    #[error("action not runnable yet: {0}")]
    NotReady(String),
}

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub conflict_policy: ConflictPolicy,
    pub backoff: Backoff,
    pub max_retries: i64,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            conflict_policy: ConflictPolicy::default(),
            backoff: Backoff::from_millis(500, 60_000),
            max_retries: 5,
        }
    }
}

/// Moves state between the remote, the store and the cache by draining the
/// action queue. Handlers are idempotent; every successful network call
/// commits its effects in one store transaction before the action completes.
pub struct SyncEngine<R> {
    remote: R,
    store: StateStore,
    cache: CacheStore,
    policy: ConflictPolicy,
    backoff: Backoff,
    max_retries: i64,
    paused: AtomicBool,
    online: AtomicBool,
}

impl<R: RemoteAdapter> SyncEngine<R> {
    pub fn new(remote: R, store: StateStore, cache: CacheStore, options: EngineOptions) -> Self {
        Self {
            remote,
            store,
            cache,
            policy: options.conflict_policy,
            backoff: options.backoff,
            max_retries: options.max_retries,
            paused: AtomicBool::new(false),
            online: AtomicBool::new(true),
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Claims and runs one action. `Ok(false)` means the queue had nothing
    /// runnable for this lane.
    pub async fn run_once(&self, worker_id: &str, lane: Lane) -> Result<bool, EngineError> {
        let Some(action) = self.store.claim_next(worker_id, lane).await? else {
            return Ok(false);
        };
        eprintln!(
            "[orchardd] op start: type={} dir={} target={}",
            action.action_type.as_str(),
            action.direction.as_str(),
            action.target_id
        );

        let result = self.dispatch(&action).await;
        match result {
            Ok(()) => {
                self.store.complete_action(action.action_id).await?;
                eprintln!(
                    "[orchardd] op done: type={} target={}",
                    action.action_type.as_str(),
                    action.target_id
                );
                Ok(true)
            }
            Err(err) => {
                self.settle_failure(&action, err).await?;
                Ok(true)
            }
        }
    }

    async fn dispatch(&self, action: &ActionRecord) -> Result<(), EngineError> {
        match action.action_type {
            ActionType::ListChildren => self.execute_list_children(&action.target_id).await,
            ActionType::Download => {
                let object = self.require_object(&action.target_id).await?;
                self.execute_download(&object).await
            }
            ActionType::DownloadChunk => {
                let object = self.require_object(&action.target_id).await?;
                let index = chunk_index_from_metadata(action.metadata.as_deref())
                    .ok_or(EngineError::BadActionMetadata(action.action_id))?;
                self.execute_download_chunk(&object, index).await
            }
            ActionType::EnsureLatest => {
                let object = self.require_object(&action.target_id).await?;
                self.execute_ensure_latest(&object).await
            }
            // An upload supersedes a content update for an unbound object;
            // for a bound one both paths end in the conditional update.
            ActionType::Upload | ActionType::UpdateContent => {
                let object = self.require_object(&action.target_id).await?;
                self.execute_upload(&object).await
            }
            ActionType::Rename => {
                let object = self.require_object(&action.target_id).await?;
                let destination = action
                    .destination
                    .as_deref()
                    .ok_or(EngineError::BadActionMetadata(action.action_id))?;
                self.execute_rename(&object, destination).await
            }
            ActionType::Move => {
                let object = self.require_object(&action.target_id).await?;
                let destination = action
                    .destination
                    .as_deref()
                    .ok_or(EngineError::BadActionMetadata(action.action_id))?;
                self.execute_move(&object, destination).await
            }
            ActionType::Delete => self.execute_delete(&action.target_id).await,
        }
    }

    async fn require_object(&self, id: &str) -> Result<ObjectRecord, EngineError> {
        self.store
            .get_object(id)
            .await?
            .ok_or_else(|| EngineError::MissingObject(id.to_string()))
    }

    async fn settle_failure(
        &self,
        action: &ActionRecord,
        err: EngineError,
    ) -> Result<(), EngineError> {
        if is_enospc(&err) {
            let freed = self.cache.evict_once().await.unwrap_or(0);
            eprintln!(
                "[orchardd] cache full during {}: eviction freed {freed} bytes",
                action.action_type.as_str()
            );
        }

        if let EngineError::NotReady(reason) = &err {
            let not_before = now_unix().saturating_add(2);
            self.store
                .release_action(action.action_id, not_before)
                .await?;
            eprintln!(
                "[orchardd] op deferred: type={} target={} reason={reason}",
                action.action_type.as_str(),
                action.target_id
            );
            return Ok(());
        }

        if error_class(&err) == Some(ErrorClass::Auth) {
            // Authentication problems pause the whole engine instead of
            // burning the action's retry budget.
            self.pause();
            self.store
                .release_action(action.action_id, now_unix().saturating_add(60))
                .await?;
            eprintln!(
                "[orchardd] auth failure on {} for {}; engine paused",
                action.action_type.as_str(),
                action.target_id
            );
            return Ok(());
        }

        let max_retries = if is_transient(&err) { self.max_retries } else { 0 };
        let attempt = action.retry_count.min(u32::MAX as i64) as u32;
        let not_before = self.backoff.not_before(now_unix(), attempt.saturating_add(1));
        let outcome = self
            .store
            .fail_action(
                action.action_id,
                &action.target_id,
                &err.to_string(),
                not_before,
                max_retries,
            )
            .await?;
        match outcome {
            FailOutcome::Requeued { not_before } => eprintln!(
                "[orchardd] op requeued: type={} target={} retry={} not_before={not_before} err={err}",
                action.action_type.as_str(),
                action.target_id,
                action.retry_count + 1
            ),
            FailOutcome::Exhausted => eprintln!(
                "[orchardd] op failed permanently: type={} target={} err={err}",
                action.action_type.as_str(),
                action.target_id
            ),
        }
        Ok(())
    }

    /// Worker loop. Offline or paused, it idles without claiming anything.
    pub async fn run_worker(
        self: Arc<Self>,
        worker_id: String,
        lane: Lane,
        shutdown: CancellationToken,
        idle: Duration,
    ) {
        loop {
            if shutdown.is_cancelled() {
                break;
            }
            if self.is_paused() || !self.is_online() {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(idle.max(Duration::from_millis(500))) => {}
                }
                continue;
            }
            match self.run_once(&worker_id, lane).await {
                Ok(true) => {}
                Ok(false) => {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(idle) => {}
                    }
                }
                Err(err) => {
                    eprintln!("[orchardd] worker {worker_id} error: {err}");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(idle) => {}
                    }
                }
            }
        }
    }

    /// Probes the remote and maintains the process-wide connectivity flag.
    pub async fn run_heartbeat(
        self: Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) {
        loop {
            match self.remote.metadata(CLOUD_ROOT_ID).await {
                Ok(_) | Err(RemoteError::NotFound) => {
                    if !self.is_online() {
                        eprintln!("[orchardd] connectivity restored");
                    }
                    self.set_online(true);
                }
                Err(err) if err.classification() == Some(ErrorClass::Auth) => {
                    self.set_online(true);
                    if !self.is_paused() {
                        eprintln!("[orchardd] heartbeat auth failure; engine paused");
                        self.pause();
                    }
                }
                Err(err) => {
                    if self.is_online() {
                        eprintln!("[orchardd] connectivity lost: {err}");
                    }
                    self.set_online(false);
                }
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    /// Polling loop: the remote has no push channel, so the root listing is
    /// re-enqueued at a low priority on an interval.
    pub async fn run_poll_loop(
        self: Arc<Self>,
        root_object_id: String,
        interval: Duration,
        shutdown: CancellationToken,
    ) {
        loop {
            if self.is_online() && !self.is_paused() {
                if let Err(err) = self
                    .store
                    .enqueue_action(&NewAction::list_children(&root_object_id, PRIORITY_BACKGROUND))
                    .await
                {
                    eprintln!("[orchardd] poll enqueue error: {err}");
                }
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    pub async fn run_eviction_loop(
        self: Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            match self.cache.evict_once().await {
                Ok(0) => {}
                Ok(freed) => eprintln!("[orchardd] eviction freed {freed} bytes"),
                Err(err) => eprintln!("[orchardd] eviction error: {err}"),
            }
        }
    }
}

include!("engine_impl_pull.rs");
include!("engine_impl_push.rs");

pub(crate) fn parse_modified(value: Option<&str>) -> Result<Option<i64>, time::error::Parse> {
    let Some(value) = value else {
        return Ok(None);
    };
    let parsed = OffsetDateTime::parse(value, &Rfc3339)?;
    Ok(Some(parsed.unix_timestamp()))
}

fn entry_kind_to_object(kind: EntryKind) -> ObjectKind {
    match kind {
        EntryKind::File => ObjectKind::File,
        EntryKind::Folder => ObjectKind::Folder,
    }
}

fn error_class(err: &EngineError) -> Option<ErrorClass> {
    match err {
        EngineError::Remote(remote) => remote.classification(),
        _ => None,
    }
}

fn is_transient(err: &EngineError) -> bool {
    match err {
        EngineError::Remote(remote) => remote.is_retryable(),
        EngineError::Io(_) | EngineError::Cache(CacheError::Io(_)) => true,
        EngineError::Store(StoreError::Sqlx(_)) => true,
        _ => false,
    }
}

fn is_enospc(err: &EngineError) -> bool {
    let io = match err {
        EngineError::Io(io) => io,
        EngineError::Cache(CacheError::Io(io)) => io,
        _ => return false,
    };
    io.raw_os_error() == Some(libc::ENOSPC)
}

#[cfg(test)]
#[path = "engine_tests/mod.rs"]
mod tests;
