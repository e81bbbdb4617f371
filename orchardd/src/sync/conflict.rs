use crate::store::{ObjectRecord, ShadowRecord};

/// Local side of the three-way comparison.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalVersion {
    pub content_hash: Option<String>,
    pub dirty: bool,
}

/// Freshly observed remote state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteVersion {
    pub etag: Option<String>,
}

/// The shadow snapshot taken at the last successful sync.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Baseline {
    pub etag: Option<String>,
    pub file_hash: Option<String>,
}

impl Baseline {
    pub fn from_shadow(shadow: &ShadowRecord) -> Self {
        Self {
            etag: shadow.etag.clone(),
            file_hash: shadow.file_hash.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    NoOp,
    PushLocal,
    PullRemote,
    Conflict,
}

/// Three-way comparison among local intent, shadow baseline and the newly
/// observed remote state. Without a baseline both sides count as changed.
pub fn classify(
    base: Option<&Baseline>,
    local: &LocalVersion,
    remote: &RemoteVersion,
) -> Classification {
    let Some(base) = base else {
        return Classification::Conflict;
    };

    let local_changed = local.dirty
        || match (&local.content_hash, &base.file_hash) {
            (Some(current), Some(known)) => current != known,
            (Some(_), None) => true,
            _ => false,
        };
    let remote_changed = remote.etag != base.etag;

    match (local_changed, remote_changed) {
        (false, false) => Classification::NoOp,
        (true, false) => Classification::PushLocal,
        (false, true) => Classification::PullRemote,
        (true, true) => Classification::Conflict,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictPolicy {
    #[default]
    LocalWins,
    RemoteWins,
    Manual,
}

impl ConflictPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictPolicy::LocalWins => "local_wins",
            ConflictPolicy::RemoteWins => "remote_wins",
            ConflictPolicy::Manual => "manual",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "local_wins" => Some(ConflictPolicy::LocalWins),
            "remote_wins" => Some(ConflictPolicy::RemoteWins),
            "manual" => Some(ConflictPolicy::Manual),
            _ => None,
        }
    }
}

/// How the engine acts on a content conflict under the configured policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Delete the remote (conditional on its current ETag), re-upload local.
    DisplaceRemote,
    /// Pull the remote version and drop the local edit.
    AdoptRemote,
    /// Park the object in `sync_state = conflict` for manual resolution.
    Surface,
}

pub fn resolve_content_conflict(policy: ConflictPolicy) -> Resolution {
    match policy {
        ConflictPolicy::LocalWins => Resolution::DisplaceRemote,
        ConflictPolicy::RemoteWins => Resolution::AdoptRemote,
        ConflictPolicy::Manual => Resolution::Surface,
    }
}

/// Delete-vs-edit: a locally edited object deleted remotely is re-pushed as
/// a new cloud object; a locally deleted object edited remotely is restored
/// unless policy says the delete wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteConflict {
    LocalEditRemoteDelete,
    LocalDeleteRemoteEdit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteResolution {
    RepushAsNew,
    RestoreRemote,
    Surface,
}

pub fn resolve_delete_conflict(
    policy: ConflictPolicy,
    conflict: DeleteConflict,
) -> DeleteResolution {
    match conflict {
        DeleteConflict::LocalEditRemoteDelete => DeleteResolution::RepushAsNew,
        DeleteConflict::LocalDeleteRemoteEdit => match policy {
            ConflictPolicy::Manual => DeleteResolution::Surface,
            _ => DeleteResolution::RestoreRemote,
        },
    }
}

pub fn local_version_of(object: &ObjectRecord, cache_hash: Option<&str>) -> LocalVersion {
    LocalVersion {
        content_hash: cache_hash.map(str::to_string),
        dirty: object.dirty,
    }
}
