mod adapter;
mod client;

pub use adapter::{
    CLOUD_ROOT_ID, EntryKind, RemoteAdapter, RemoteEntry, RemoteMetadata, UploadResult,
    VersionStamp,
};
pub use client::{DriveClient, ErrorClass, RemoteError};
