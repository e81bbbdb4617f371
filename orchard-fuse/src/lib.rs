use std::time::{Duration, Instant};

use thiserror::Error;

use orchardd::cache::{CacheError, CacheStore};
use orchardd::store::{
    ObjectKind, ObjectRecord, Presence, StateStore, StoreError, SyncState,
};
use orchardd::sync::queue::{
    ActionType, Direction, NewAction, PRIORITY_BACKGROUND, PRIORITY_FUSE, PRIORITY_INTERACTIVE,
};

pub const XATTR_STATUS: &str = "user.orchard.status";
pub const XATTR_PIN: &str = "user.orchard.pin";
pub const XATTR_EMBLEMS: &str = "user.xdg.emblems";

/// Folders older than this get a background re-listing on readdir.
const READDIR_STALE_AFTER_SECS: i64 = 60;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("not a folder: {0}")]
    NotAFolder(String),
    #[error("is a folder: {0}")]
    IsAFolder(String),
    #[error("folder not empty: {0}")]
    NotEmpty(String),
    #[error("read timed out waiting for content: {0}")]
    ReadTimeout(String),
    #[error("read denied for thumbnailer process: {0}")]
    Denied(String),
    #[error("unsupported extended attribute: {0}")]
    UnsupportedXattr(String),
}

/// What a denylisted reader receives instead of triggering a download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DenyAction {
    #[default]
    ZeroFill,
    IoError,
}

#[derive(Debug, Clone)]
pub struct BridgeOptions {
    pub thumbnailer_denylist: Vec<String>,
    pub deny_action: DenyAction,
    pub chunk_read_timeout: Duration,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            thumbnailer_denylist: Vec::new(),
            deny_action: DenyAction::default(),
            chunk_read_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attr {
    pub object_id: String,
    pub kind: ObjectKind,
    pub size: i64,
    pub modified_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: ObjectKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenHandle {
    pub object_id: String,
}

/// Translates VFS operations into store reads and queue writes. `getattr`
/// and `readdir` never touch the network; `read` is the only blocking path
/// and only while content is missing.
pub struct OrchardBridge {
    store: StateStore,
    cache: CacheStore,
    options: BridgeOptions,
}

impl OrchardBridge {
    pub fn new(store: StateStore, cache: CacheStore, options: BridgeOptions) -> Self {
        Self {
            store,
            cache,
            options,
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    async fn resolve(&self, path: &str) -> Result<ObjectRecord, BridgeError> {
        self.store
            .resolve_path(path)
            .await?
            .ok_or_else(|| BridgeError::NotFound(path.to_string()))
    }

    fn split_parent(path: &str) -> (String, String) {
        let trimmed = path.trim_end_matches('/');
        match trimmed.rsplit_once('/') {
            Some((parent, name)) if !parent.is_empty() => (parent.to_string(), name.to_string()),
            Some((_, name)) => ("/".to_string(), name.to_string()),
            None => ("/".to_string(), trimmed.to_string()),
        }
    }

    pub async fn getattr(&self, path: &str) -> Result<Attr, BridgeError> {
        let object = self.resolve(path).await?;
        Ok(attr_of(&object))
    }

    /// Pure store read. A stale folder gets a low-priority re-listing
    /// enqueued, and the stale data is returned immediately.
    pub async fn readdir(&self, path: &str) -> Result<Vec<DirEntry>, BridgeError> {
        let folder = self.resolve(path).await?;
        if folder.kind != ObjectKind::Folder {
            return Err(BridgeError::NotAFolder(path.to_string()));
        }

        let stale = now_unix() - folder.last_synced > READDIR_STALE_AFTER_SECS;
        if stale
            && !self
                .store
                .pending_action_exists(&folder.id, ActionType::ListChildren)
                .await?
        {
            self.store
                .enqueue_action(&NewAction::list_children(&folder.id, PRIORITY_BACKGROUND))
                .await?;
        }

        Ok(self
            .store
            .list_children(&folder.id)
            .await?
            .into_iter()
            .map(|child| DirEntry {
                name: child.full_name(),
                kind: child.kind,
            })
            .collect())
    }

    /// Never blocks on a download: existence check, open-count bump, handle.
    pub async fn open(&self, path: &str) -> Result<OpenHandle, BridgeError> {
        let object = self.resolve(path).await?;
        if object.kind == ObjectKind::Folder {
            return Err(BridgeError::IsAFolder(path.to_string()));
        }
        self.ensure_cache_row(&object).await?;
        self.store.bump_open_count(&object.id, 1).await?;

        // A cached file may be stale; kick a background freshness check.
        let present = self
            .store
            .get_cache_entry(&object.id)
            .await?
            .map(|entry| entry.present_locally != Presence::Absent)
            .unwrap_or(false);
        if present && !object.dirty {
            self.store
                .enqueue_action(&NewAction::ensure_latest(&object.id, PRIORITY_BACKGROUND))
                .await?;
        }
        Ok(OpenHandle {
            object_id: object.id,
        })
    }

    async fn ensure_cache_row(&self, object: &ObjectRecord) -> Result<(), BridgeError> {
        if self.store.get_cache_entry(&object.id).await?.is_none() {
            let path = self.cache.object_path(&object.id);
            self.store
                .upsert_cache_entry(&object.id, &path.display().to_string(), object.size)
                .await?;
        }
        Ok(())
    }

    /// Serves from cache when present; otherwise enqueues the minimal
    /// download at FUSE priority and waits on the per-object condition.
    pub async fn read(
        &self,
        path: &str,
        offset: u64,
        len: usize,
        caller_comm: Option<&str>,
    ) -> Result<Vec<u8>, BridgeError> {
        let object = self.resolve(path).await?;
        if object.kind == ObjectKind::Folder {
            return Err(BridgeError::IsAFolder(path.to_string()));
        }
        let size = object.size.max(0) as u64;
        if offset >= size {
            return Ok(Vec::new());
        }
        let len = len.min((size - offset) as usize);

        let presence = self
            .store
            .get_cache_entry(&object.id)
            .await?
            .map(|entry| entry.present_locally)
            .unwrap_or(Presence::Absent);
        if presence == Presence::Full {
            return Ok(self.cache.read(&object.id, offset, len).await?);
        }

        // Content is missing. Thumbnailers and indexers never trigger a
        // materialization; this is an invariant, not an optimization.
        if let Some(comm) = caller_comm {
            if self.is_denied_process(comm) {
                return match self.options.deny_action {
                    DenyAction::ZeroFill => Ok(vec![0u8; len]),
                    DenyAction::IoError => Err(BridgeError::Denied(comm.to_string())),
                };
            }
        }

        if self.cache.uses_sparse(size) {
            self.read_via_chunks(&object, offset, len as u64, size).await?;
        } else {
            self.read_via_full_download(&object).await?;
        }
        Ok(self.cache.read(&object.id, offset, len).await?)
    }

    async fn read_via_chunks(
        &self,
        object: &ObjectRecord,
        offset: u64,
        len: u64,
        size: u64,
    ) -> Result<(), BridgeError> {
        self.cache.reserve_sparse(&object.id, size).await?;
        let deadline = Instant::now() + self.options.chunk_read_timeout;
        loop {
            let missing = self.cache.missing_chunks(&object.id, offset, len, size).await?;
            if missing.is_empty() {
                return Ok(());
            }
            for index in missing {
                self.store
                    .enqueue_action(&NewAction::download_chunk(&object.id, index, PRIORITY_FUSE))
                    .await?;
            }
            if !self.wait_for_signal(&object.id, deadline).await {
                return Err(BridgeError::ReadTimeout(object.id.clone()));
            }
        }
    }

    async fn read_via_full_download(&self, object: &ObjectRecord) -> Result<(), BridgeError> {
        let deadline = Instant::now() + self.options.chunk_read_timeout;
        loop {
            let presence = self
                .store
                .get_cache_entry(&object.id)
                .await?
                .map(|entry| entry.present_locally)
                .unwrap_or(Presence::Absent);
            if presence == Presence::Full {
                return Ok(());
            }
            self.store
                .enqueue_action(&NewAction::download(&object.id, PRIORITY_FUSE))
                .await?;
            if !self.wait_for_signal(&object.id, deadline).await {
                return Err(BridgeError::ReadTimeout(object.id.clone()));
            }
        }
    }

    /// Waits for the cache to signal progress, in short slices so a signal
    /// racing the presence check cannot stall the read.
    async fn wait_for_signal(&self, object_id: &str, deadline: Instant) -> bool {
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        let slice = (deadline - now).min(Duration::from_millis(500));
        let notify = self.cache.readiness(object_id);
        let _ = tokio::time::timeout(slice, notify.notified()).await;
        true
    }

    fn is_denied_process(&self, comm: &str) -> bool {
        self.options
            .thumbnailer_denylist
            .iter()
            .any(|denied| comm.contains(denied.as_str()))
    }

    /// Writes land in the cache file and dirty the object; the coalesced
    /// `update_content` push is scheduled on release.
    pub async fn write(
        &self,
        path: &str,
        offset: u64,
        data: &[u8],
    ) -> Result<usize, BridgeError> {
        let object = self.resolve(path).await?;
        if object.kind == ObjectKind::Folder {
            return Err(BridgeError::IsAFolder(path.to_string()));
        }
        self.ensure_cache_row(&object).await?;

        let entry = self.store.get_cache_entry(&object.id).await?;
        let presence = entry
            .map(|entry| entry.present_locally)
            .unwrap_or(Presence::Absent);
        match presence {
            Presence::Absent => {
                self.cache.create_placeholder(&object.id).await?;
            }
            Presence::Sparse => {
                // A write forces promotion: fetch what is still missing and
                // keep the object dirty until the file is whole.
                let size = object.size.max(0) as u64;
                for index in self.cache.missing_chunks(&object.id, 0, size, size).await? {
                    self.store
                        .enqueue_action(&NewAction::download_chunk(
                            &object.id,
                            index,
                            PRIORITY_INTERACTIVE,
                        ))
                        .await?;
                }
            }
            Presence::Full => {}
        }

        let new_len = self.cache.write(&object.id, offset, data).await?;
        self.store
            .update_local_size(&object.id, new_len as i64)
            .await?;
        self.store.mark_dirty(&object.id).await?;
        Ok(data.len())
    }

    pub async fn truncate(&self, path: &str, len: u64) -> Result<(), BridgeError> {
        let object = self.resolve(path).await?;
        if object.kind == ObjectKind::Folder {
            return Err(BridgeError::IsAFolder(path.to_string()));
        }
        self.ensure_cache_row(&object).await?;
        self.cache.truncate(&object.id, len).await?;
        self.store.update_local_size(&object.id, len as i64).await?;
        self.store.mark_dirty(&object.id).await?;
        self.store
            .enqueue_action(&NewAction::update_content(&object.id))
            .await?;
        Ok(())
    }

    /// Fresh local creates are immediately writable and fully cached.
    pub async fn create(&self, path: &str) -> Result<OpenHandle, BridgeError> {
        let (parent_path, name) = Self::split_parent(path);
        let parent = self.resolve(&parent_path).await?;
        if parent.kind != ObjectKind::Folder {
            return Err(BridgeError::NotAFolder(parent_path));
        }
        let object = match self
            .store
            .create_local_object(&parent.id, &name, ObjectKind::File)
            .await
        {
            Ok(object) => object,
            Err(StoreError::AlreadyExists { .. }) => {
                return Err(BridgeError::AlreadyExists(path.to_string()));
            }
            Err(err) => return Err(err.into()),
        };
        self.cache.create_placeholder(&object.id).await?;
        self.store.bump_open_count(&object.id, 1).await?;
        self.store
            .enqueue_action(&NewAction::upload(&object.id))
            .await?;
        Ok(OpenHandle {
            object_id: object.id,
        })
    }

    pub async fn mkdir(&self, path: &str) -> Result<(), BridgeError> {
        let (parent_path, name) = Self::split_parent(path);
        let parent = self.resolve(&parent_path).await?;
        if parent.kind != ObjectKind::Folder {
            return Err(BridgeError::NotAFolder(parent_path));
        }
        let object = match self
            .store
            .create_local_object(&parent.id, &name, ObjectKind::Folder)
            .await
        {
            Ok(object) => object,
            Err(StoreError::AlreadyExists { .. }) => {
                return Err(BridgeError::AlreadyExists(path.to_string()));
            }
            Err(err) => return Err(err.into()),
        };
        self.store
            .enqueue_action(&NewAction::upload(&object.id))
            .await?;
        Ok(())
    }

    pub async fn unlink(&self, path: &str) -> Result<(), BridgeError> {
        let object = self.resolve(path).await?;
        if object.kind == ObjectKind::Folder {
            return Err(BridgeError::IsAFolder(path.to_string()));
        }
        self.store.mark_deleted(&object.id, Direction::Push).await?;
        self.store
            .enqueue_action(&NewAction::delete(&object.id, Direction::Push))
            .await?;
        Ok(())
    }

    pub async fn rmdir(&self, path: &str) -> Result<(), BridgeError> {
        let object = self.resolve(path).await?;
        if object.kind != ObjectKind::Folder {
            return Err(BridgeError::NotAFolder(path.to_string()));
        }
        if !self.store.list_children(&object.id).await?.is_empty() {
            return Err(BridgeError::NotEmpty(path.to_string()));
        }
        self.store.mark_deleted(&object.id, Direction::Push).await?;
        self.store
            .enqueue_action(&NewAction::delete(&object.id, Direction::Push))
            .await?;
        Ok(())
    }

    /// Atomic store rewrite plus the matching remote actions. Overwriting
    /// an existing file target soft-deletes it first.
    pub async fn rename(&self, old_path: &str, new_path: &str) -> Result<(), BridgeError> {
        let object = self.resolve(old_path).await?;
        let (new_parent_path, new_name) = Self::split_parent(new_path);
        let new_parent = self.resolve(&new_parent_path).await?;
        if new_parent.kind != ObjectKind::Folder {
            return Err(BridgeError::NotAFolder(new_parent_path));
        }

        if let Some(target) = self.store.find_child(&new_parent.id, &new_name).await? {
            if target.id != object.id {
                if target.kind == ObjectKind::Folder {
                    return Err(BridgeError::AlreadyExists(new_path.to_string()));
                }
                self.store.mark_deleted(&target.id, Direction::Push).await?;
                self.store
                    .enqueue_action(&NewAction::delete(&target.id, Direction::Push))
                    .await?;
            }
        }

        let old_parent_id = object.parent_id.clone();
        let is_move = old_parent_id.as_deref() != Some(new_parent.id.as_str());
        let is_rename = object.full_name() != new_name;

        self.store
            .relocate_object(&object.id, &new_parent.id, &new_name)
            .await?;
        if is_move {
            self.store
                .enqueue_action(&NewAction::move_to(&object.id, &new_parent.id))
                .await?;
        }
        if is_rename {
            self.store
                .enqueue_action(&NewAction::rename(&object.id, &new_name))
                .await?;
        }
        Ok(())
    }

    /// Last close schedules the coalesced push for dirty content and purges
    /// the projection of a file deleted remotely while it was open.
    pub async fn release(&self, handle: &OpenHandle) -> Result<(), BridgeError> {
        let open_count = self.store.bump_open_count(&handle.object_id, -1).await?;
        let Some(object) = self.store.get_object(&handle.object_id).await? else {
            return Ok(());
        };

        if object.deleted {
            if object.sync_state == SyncState::DeletedCloud && open_count == 0 {
                self.cache.remove_content(&object.id).await?;
                self.store.delete_shadow(&object.id).await?;
            }
            return Ok(());
        }

        if object.dirty {
            self.store
                .enqueue_action(&NewAction::update_content(&object.id))
                .await?;
        }
        Ok(())
    }

    pub async fn getxattr(&self, path: &str, name: &str) -> Result<Vec<u8>, BridgeError> {
        let object = self.resolve(path).await?;
        let status = self.status_label(&object).await?;
        match name {
            XATTR_STATUS => Ok(status.as_bytes().to_vec()),
            XATTR_PIN => {
                let pinned = self
                    .store
                    .get_cache_entry(&object.id)
                    .await?
                    .map(|entry| entry.pinned)
                    .unwrap_or(false);
                Ok(if pinned { b"1".to_vec() } else { b"0".to_vec() })
            }
            XATTR_EMBLEMS => Ok(emblems_for(status).as_bytes().to_vec()),
            other => Err(BridgeError::UnsupportedXattr(other.to_string())),
        }
    }

    pub async fn setxattr(&self, path: &str, name: &str, value: &[u8]) -> Result<(), BridgeError> {
        if name != XATTR_PIN {
            return Err(BridgeError::UnsupportedXattr(name.to_string()));
        }
        let object = self.resolve(path).await?;
        let pinned = value == b"1";
        self.ensure_cache_row(&object).await?;
        self.store.set_pinned(&object.id, pinned).await?;
        if pinned {
            let full = self
                .store
                .get_cache_entry(&object.id)
                .await?
                .map(|entry| entry.present_locally == Presence::Full)
                .unwrap_or(false);
            if !full && object.kind == ObjectKind::File {
                self.store
                    .enqueue_action(&NewAction::download(&object.id, PRIORITY_INTERACTIVE))
                    .await?;
            }
        } else if let Err(err) = self.cache.evict_once().await {
            eprintln!("[orchard-fuse] eviction after unpin failed: {err}");
        }
        Ok(())
    }

    async fn status_label(&self, object: &ObjectRecord) -> Result<&'static str, BridgeError> {
        let label = match object.sync_state {
            SyncState::Conflict => "conflict",
            SyncState::Error => "error",
            SyncState::Dirty => "dirty",
            SyncState::PendingPush | SyncState::DeletedLocal => "pending_push",
            SyncState::PendingPull | SyncState::DeletedCloud => "pending_pull",
            SyncState::Synced => {
                if object.kind == ObjectKind::Folder {
                    "synced"
                } else {
                    let presence = self
                        .store
                        .get_cache_entry(&object.id)
                        .await?
                        .map(|entry| entry.present_locally)
                        .unwrap_or(Presence::Absent);
                    match presence {
                        Presence::Full => "synced",
                        Presence::Sparse => "partial",
                        Presence::Absent => "cloud",
                    }
                }
            }
        };
        Ok(label)
    }
}

fn attr_of(object: &ObjectRecord) -> Attr {
    Attr {
        object_id: object.id.clone(),
        kind: object.kind,
        size: object.size,
        modified_at: if object.local_modified_at > 0 {
            object.local_modified_at
        } else {
            object.cloud_modified_at
        },
    }
}

fn emblems_for(status: &str) -> &'static str {
    match status {
        "synced" => "emblem-default",
        "cloud" => "emblem-web",
        "conflict" | "error" => "emblem-important",
        _ => "emblem-synchronizing",
    }
}

fn now_unix() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
#[path = "bridge_tests.rs"]
mod tests;
