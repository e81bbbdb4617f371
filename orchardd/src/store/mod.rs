use std::{fs, path::Path};

use orchard_core::CLOUD_ROOT_ID;
use sqlx::{Row, SqlitePool, migrate::Migrator, sqlite::SqliteConnectOptions, sqlite::SqliteRow};
use thiserror::Error;

use crate::sync::queue::{ActionType, Direction, Lane, NewAction};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Locally minted ID of the root folder. Never deleted.
pub const ROOT_OBJECT_ID: &str = "root";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid object kind: {0}")]
    InvalidKind(String),
    #[error("invalid origin: {0}")]
    InvalidOrigin(String),
    #[error("invalid sync state: {0}")]
    InvalidState(String),
    #[error("invalid cache presence: {0}")]
    InvalidPresence(i64),
    #[error("invalid action type: {0}")]
    InvalidActionType(String),
    #[error("invalid direction: {0}")]
    InvalidDirection(String),
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("sibling already exists: {name} under {parent_id}")]
    AlreadyExists { parent_id: String, name: String },
    #[error("invalid sync state transition: {from:?} -> {to:?}")]
    InvalidTransition { from: SyncState, to: SyncState },
    #[error("root object cannot be mutated")]
    RootImmutable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    File,
    Folder,
}

impl ObjectKind {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::File => "file",
            ObjectKind::Folder => "folder",
        }
    }

    pub(crate) fn parse(value: &str) -> Result<Self, StoreError> {
        match value {
            "file" => Ok(ObjectKind::File),
            "folder" => Ok(ObjectKind::Folder),
            other => Err(StoreError::InvalidKind(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Local,
    Cloud,
}

impl Origin {
    fn as_str(&self) -> &'static str {
        match self {
            Origin::Local => "local",
            Origin::Cloud => "cloud",
        }
    }

    fn parse(value: &str) -> Result<Self, StoreError> {
        match value {
            "local" => Ok(Origin::Local),
            "cloud" => Ok(Origin::Cloud),
            other => Err(StoreError::InvalidOrigin(other.to_string())),
        }
    }
}

/// Tagged sync state machine. Transitions not listed in [`SyncState::allows`]
/// are rejected at the store boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Synced,
    Dirty,
    PendingPush,
    PendingPull,
    Conflict,
    Error,
    DeletedLocal,
    DeletedCloud,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Synced => "synced",
            SyncState::Dirty => "dirty",
            SyncState::PendingPush => "pending_push",
            SyncState::PendingPull => "pending_pull",
            SyncState::Conflict => "conflict",
            SyncState::Error => "error",
            SyncState::DeletedLocal => "deleted_local",
            SyncState::DeletedCloud => "deleted_cloud",
        }
    }

    pub fn parse(value: &str) -> Result<Self, StoreError> {
        match value {
            "synced" => Ok(SyncState::Synced),
            "dirty" => Ok(SyncState::Dirty),
            "pending_push" => Ok(SyncState::PendingPush),
            "pending_pull" => Ok(SyncState::PendingPull),
            "conflict" => Ok(SyncState::Conflict),
            "error" => Ok(SyncState::Error),
            "deleted_local" => Ok(SyncState::DeletedLocal),
            "deleted_cloud" => Ok(SyncState::DeletedCloud),
            other => Err(StoreError::InvalidState(other.to_string())),
        }
    }

    /// Whether `self -> next` is a legal transition. Same-state writes are
    /// always legal so retried transactions stay idempotent.
    pub fn allows(&self, next: SyncState) -> bool {
        use SyncState::*;
        if *self == next {
            return true;
        }
        match self {
            Synced | Dirty | PendingPush | PendingPull | Conflict => true,
            // Error is a parking state; anything that makes progress is fine.
            Error => true,
            // A deleted object can only surface errors or conflicts, or be
            // restored by a pull when the remote side won.
            DeletedLocal => matches!(next, Error | PendingPull | Conflict),
            DeletedCloud => matches!(next, Error),
        }
    }
}

/// Cache presence of a file's content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    Absent,
    Full,
    Sparse,
}

impl Presence {
    pub(crate) fn as_i64(&self) -> i64 {
        match self {
            Presence::Absent => 0,
            Presence::Full => 1,
            Presence::Sparse => 2,
        }
    }

    pub(crate) fn parse(value: i64) -> Result<Self, StoreError> {
        match value {
            0 => Ok(Presence::Absent),
            1 => Ok(Presence::Full),
            2 => Ok(Presence::Sparse),
            other => Err(StoreError::InvalidPresence(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObjectRecord {
    pub id: String,
    pub kind: ObjectKind,
    pub parent_id: Option<String>,
    pub name: String,
    pub extension: Option<String>,
    pub size: i64,
    pub cloud_id: Option<String>,
    pub cloud_parent_id: Option<String>,
    pub etag: Option<String>,
    pub revision: Option<String>,
    pub missing_from_cloud: bool,
    pub local_modified_at: i64,
    pub cloud_modified_at: i64,
    pub origin: Origin,
    pub sync_state: SyncState,
    pub dirty: bool,
    pub deleted: bool,
    pub last_synced: i64,
    pub conflict_history: Option<String>,
}

impl ObjectRecord {
    /// Display name as projected into the filesystem.
    pub fn full_name(&self) -> String {
        match &self.extension {
            Some(ext) => format!("{}.{}", self.name, ext),
            None => self.name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShadowRecord {
    pub object_id: String,
    pub cloud_id: Option<String>,
    pub parent_id: Option<String>,
    pub name: Option<String>,
    pub etag: Option<String>,
    pub file_hash: Option<String>,
    pub modified_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheRecord {
    pub object_id: String,
    pub local_path: String,
    pub size: i64,
    pub file_hash: Option<String>,
    pub present_locally: Presence,
    pub pinned: bool,
    pub last_accessed: i64,
    pub open_count: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActionRecord {
    pub action_id: i64,
    pub action_type: ActionType,
    pub target_id: String,
    pub destination: Option<String>,
    pub metadata: Option<String>,
    pub direction: Direction,
    pub priority: i64,
    pub retry_count: i64,
    pub not_before: Option<i64>,
    pub last_error: Option<String>,
    pub created_at: i64,
}

/// Remote-observed metadata applied by `list_children` and pull handlers.
#[derive(Debug, Clone)]
pub struct RemoteDelta {
    pub cloud_id: String,
    pub cloud_parent_id: String,
    pub parent_id: String,
    pub name: String,
    pub kind: ObjectKind,
    pub size: Option<i64>,
    pub etag: Option<String>,
    pub revision: Option<String>,
    pub cloud_modified_at: Option<i64>,
}

/// Outcome of failing an action: retried later or out of budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    Requeued { not_before: i64 },
    Exhausted,
}

#[derive(Clone)]
pub struct StateStore {
    pool: SqlitePool,
}

include!("store_impl.rs");

pub(crate) fn now_unix() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

pub(crate) fn mint_object_id(kind: ObjectKind) -> String {
    let bytes: [u8; 16] = rand::random();
    let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
    format!("{}-{hex}", kind.as_str())
}

/// Splits a projected file name into `(name, extension)` on the last dot.
/// Folders keep their full name.
pub(crate) fn split_name(full_name: &str, kind: ObjectKind) -> (String, Option<String>) {
    if kind == ObjectKind::Folder {
        return (full_name.to_string(), None);
    }
    match full_name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => {
            (stem.to_string(), Some(ext.to_string()))
        }
        _ => (full_name.to_string(), None),
    }
}

fn object_from_row(row: &SqliteRow) -> Result<ObjectRecord, StoreError> {
    let kind: String = row.try_get("kind")?;
    let origin: String = row.try_get("origin")?;
    let sync_state: String = row.try_get("sync_state")?;
    let missing: i64 = row.try_get("missing_from_cloud")?;
    let dirty: i64 = row.try_get("dirty")?;
    let deleted: i64 = row.try_get("deleted")?;
    Ok(ObjectRecord {
        id: row.try_get("id")?,
        kind: ObjectKind::parse(&kind)?,
        parent_id: row.try_get("parent_id")?,
        name: row.try_get("name")?,
        extension: row.try_get("extension")?,
        size: row.try_get("size")?,
        cloud_id: row.try_get("cloud_id")?,
        cloud_parent_id: row.try_get("cloud_parent_id")?,
        etag: row.try_get("etag")?,
        revision: row.try_get("revision")?,
        missing_from_cloud: missing != 0,
        local_modified_at: row.try_get("local_modified_at")?,
        cloud_modified_at: row.try_get("cloud_modified_at")?,
        origin: Origin::parse(&origin)?,
        sync_state: SyncState::parse(&sync_state)?,
        dirty: dirty != 0,
        deleted: deleted != 0,
        last_synced: row.try_get("last_synced")?,
        conflict_history: row.try_get("conflict_history")?,
    })
}

fn action_from_row(row: &SqliteRow) -> Result<ActionRecord, StoreError> {
    let action_type: String = row.try_get("action_type")?;
    let direction: String = row.try_get("direction")?;
    Ok(ActionRecord {
        action_id: row.try_get("action_id")?,
        action_type: ActionType::parse(&action_type)
            .ok_or_else(|| StoreError::InvalidActionType(action_type.clone()))?,
        target_id: row.try_get("target_id")?,
        destination: row.try_get("destination")?,
        metadata: row.try_get("metadata")?,
        direction: Direction::parse(&direction)
            .ok_or_else(|| StoreError::InvalidDirection(direction.clone()))?,
        priority: row.try_get("priority")?,
        retry_count: row.try_get("retry_count")?,
        not_before: row.try_get("not_before")?,
        last_error: row.try_get("last_error")?,
        created_at: row.try_get("created_at")?,
    })
}

const OBJECT_COLUMNS: &str = "id, kind, parent_id, name, extension, size, cloud_id, cloud_parent_id, etag, revision, missing_from_cloud, local_modified_at, cloud_modified_at, origin, sync_state, dirty, deleted, last_synced, conflict_history";

const ACTION_COLUMNS: &str = "action_id, action_type, target_id, destination, metadata, direction, priority, status, retry_count, not_before, worker_id, last_error, created_at";

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
