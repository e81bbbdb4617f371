use std::path::Path;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::client::RemoteError;

/// Well-known cloud ID of the drive root folder.
pub const CLOUD_ROOT_ID: &str = "FOLDER::com.apple.CloudDocs::root";

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Folder,
}

/// One child returned by a folder listing.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RemoteEntry {
    pub cloud_id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: EntryKind,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub etag: Option<String>,
    #[serde(default)]
    pub modified: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RemoteMetadata {
    pub etag: String,
    #[serde(default)]
    pub revision: Option<String>,
    #[serde(default)]
    pub modified: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
}

/// Result of creating or replacing content on the remote.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UploadResult {
    pub cloud_id: String,
    pub etag: String,
    #[serde(default)]
    pub revision: Option<String>,
}

/// New versioning tokens after a metadata mutation (rename/move).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VersionStamp {
    pub etag: String,
    #[serde(default)]
    pub revision: Option<String>,
}

/// The capability set the sync engine consumes. Both `etag` and `revision`
/// are opaque; callers echo `etag` back as `if_match` on mutations.
#[async_trait::async_trait]
pub trait RemoteAdapter: Send + Sync {
    /// Single-level listing of a folder's children.
    async fn list(&self, folder_cloud_id: &str) -> Result<Vec<RemoteEntry>, RemoteError>;

    async fn metadata(&self, cloud_id: &str) -> Result<RemoteMetadata, RemoteError>;

    /// Fetch the inclusive byte range `[start, end]`. With `if_match` set,
    /// a changed remote version yields `RemoteError::PreconditionFailed`.
    async fn download_range(
        &self,
        cloud_id: &str,
        start: u64,
        end: u64,
        if_match: Option<&str>,
    ) -> Result<Bytes, RemoteError>;

    /// Stream the full content to `target`. The caller owns temp-file
    /// placement and the final rename.
    async fn download(
        &self,
        cloud_id: &str,
        if_match: Option<&str>,
        target: &Path,
    ) -> Result<(), RemoteError>;

    /// Create a file named `name` under `parent_cloud_id` from the local
    /// file at `source`.
    async fn upload(
        &self,
        parent_cloud_id: &str,
        name: &str,
        source: &Path,
        if_match: Option<&str>,
    ) -> Result<UploadResult, RemoteError>;

    /// Replace the content of an existing file, conditional on `if_match`.
    async fn update(
        &self,
        cloud_id: &str,
        source: &Path,
        if_match: &str,
    ) -> Result<UploadResult, RemoteError>;

    async fn create_folder(
        &self,
        parent_cloud_id: &str,
        name: &str,
    ) -> Result<UploadResult, RemoteError>;

    async fn rename(
        &self,
        cloud_id: &str,
        new_name: &str,
        if_match: &str,
    ) -> Result<VersionStamp, RemoteError>;

    async fn move_item(
        &self,
        cloud_id: &str,
        new_parent_cloud_id: &str,
        if_match: &str,
    ) -> Result<VersionStamp, RemoteError>;

    /// Delete conditional on `if_match`. `NotFound` is surfaced so callers
    /// can treat "already gone" as success.
    async fn delete(&self, cloud_id: &str, if_match: Option<&str>) -> Result<(), RemoteError>;
}
