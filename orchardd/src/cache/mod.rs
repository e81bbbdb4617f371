use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Notify;

use crate::store::{CacheRecord, Presence, StateStore, StoreError};

const PART_SUFFIX: &str = "part";

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("no cache entry for object: {0}")]
    MissingEntry(String),
    #[error("chunk {chunk_index} out of range for object {object_id}")]
    ChunkOutOfRange { object_id: String, chunk_index: i64 },
}

/// On-disk content store addressed by object ID. Files live under
/// `<root>/objects/<id>`; `.part` is reserved for in-flight full downloads;
/// uploads are staged through a symlink so the cache file never moves.
#[derive(Clone)]
pub struct CacheStore {
    root: PathBuf,
    store: StateStore,
    chunk_size: u64,
    small_file_threshold: u64,
    max_bytes: u64,
    waiters: Arc<Mutex<HashMap<String, Arc<Notify>>>>,
}

/// A symlink presenting cache content under its intended remote name.
/// The staging directory is removed on drop.
pub struct StagedUpload {
    dir: PathBuf,
    path: PathBuf,
}

impl StagedUpload {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StagedUpload {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
        let _ = std::fs::remove_dir(&self.dir);
    }
}

impl CacheStore {
    pub fn new(
        root: PathBuf,
        store: StateStore,
        chunk_size: u64,
        small_file_threshold: u64,
        max_bytes: u64,
    ) -> Self {
        Self {
            root,
            store,
            chunk_size,
            small_file_threshold,
            max_bytes,
            waiters: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// Creates the directory layout and sweeps `.part` leftovers from a
    /// previous run.
    pub async fn ensure_layout(&self) -> Result<usize, CacheError> {
        tokio::fs::create_dir_all(self.objects_dir()).await?;
        tokio::fs::create_dir_all(self.staging_dir()).await?;
        let mut swept = 0usize;
        let mut entries = tokio::fs::read_dir(self.objects_dir()).await?;
        while let Some(entry) = entries.next_entry().await? {
            let is_partial = entry
                .path()
                .extension()
                .map(|ext| ext == PART_SUFFIX)
                .unwrap_or(false);
            if is_partial {
                tokio::fs::remove_file(entry.path()).await?;
                swept += 1;
            }
        }
        Ok(swept)
    }

    fn objects_dir(&self) -> PathBuf {
        self.root.join("objects")
    }

    fn staging_dir(&self) -> PathBuf {
        self.root.join("staging")
    }

    pub fn object_path(&self, object_id: &str) -> PathBuf {
        self.objects_dir().join(object_id)
    }

    pub fn part_path(&self, object_id: &str) -> PathBuf {
        self.objects_dir().join(format!("{object_id}.{PART_SUFFIX}"))
    }

    pub fn uses_sparse(&self, size: u64) -> bool {
        size >= self.small_file_threshold
    }

    pub fn total_chunks(&self, size: u64) -> i64 {
        (size.div_ceil(self.chunk_size)) as i64
    }

    /// Inclusive chunk index range covering `[offset, offset + len)`,
    /// clamped to the file size. Empty ranges yield `None`.
    pub fn chunk_span(&self, offset: u64, len: u64, size: u64) -> Option<(i64, i64)> {
        if len == 0 || size == 0 || offset >= size {
            return None;
        }
        let last_byte = (offset + len - 1).min(size - 1);
        Some((
            (offset / self.chunk_size) as i64,
            (last_byte / self.chunk_size) as i64,
        ))
    }

    // ------------------------------------------------------------------
    // Readiness signalling (FUSE read blocks on these)
    // ------------------------------------------------------------------

    pub fn readiness(&self, object_id: &str) -> Arc<Notify> {
        let mut waiters = self.waiters.lock().expect("waiter mutex poisoned");
        waiters
            .entry(object_id.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    pub fn signal(&self, object_id: &str) {
        let waiters = self.waiters.lock().expect("waiter mutex poisoned");
        if let Some(notify) = waiters.get(object_id) {
            notify.notify_waiters();
        }
    }

    // ------------------------------------------------------------------
    // Plain content I/O
    // ------------------------------------------------------------------

    /// Registers an empty, fully-cached file for a fresh local create.
    pub async fn create_placeholder(&self, object_id: &str) -> Result<(), CacheError> {
        let path = self.object_path(object_id);
        tokio::fs::create_dir_all(self.objects_dir()).await?;
        tokio::fs::File::create(&path).await?;
        self.store
            .upsert_cache_entry(object_id, &path.display().to_string(), 0)
            .await?;
        self.store
            .set_cache_content(object_id, Presence::Full, 0, None)
            .await?;
        Ok(())
    }

    pub async fn read(
        &self,
        object_id: &str,
        offset: u64,
        len: usize,
    ) -> Result<Vec<u8>, CacheError> {
        let mut file = tokio::fs::File::open(self.object_path(object_id)).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; len];
        let mut read = 0usize;
        while read < len {
            let n = file.read(&mut buf[read..]).await?;
            if n == 0 {
                break;
            }
            read += n;
        }
        buf.truncate(read);
        self.store.touch_access(object_id).await?;
        Ok(buf)
    }

    /// Writes at `offset`, extending the file as needed. Returns the new
    /// file length.
    pub async fn write(
        &self,
        object_id: &str,
        offset: u64,
        data: &[u8],
    ) -> Result<u64, CacheError> {
        let path = self.object_path(object_id);
        let mut file = tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .await?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        file.flush().await?;
        let len = file.metadata().await?.len();
        self.store
            .upsert_cache_entry(object_id, &path.display().to_string(), len as i64)
            .await?;
        Ok(len)
    }

    pub async fn truncate(&self, object_id: &str, len: u64) -> Result<(), CacheError> {
        let path = self.object_path(object_id);
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .await?;
        file.set_len(len).await?;
        self.store
            .upsert_cache_entry(object_id, &path.display().to_string(), len as i64)
            .await?;
        Ok(())
    }

    pub async fn remove_content(&self, object_id: &str) -> Result<(), CacheError> {
        let _ = tokio::fs::remove_file(self.object_path(object_id)).await;
        let _ = tokio::fs::remove_file(self.part_path(object_id)).await;
        self.store.delete_cache_entry(object_id).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Sparse files and chunks
    // ------------------------------------------------------------------

    /// Ensures the sparse backing file exists at its full logical size.
    /// The truncate allocates no data blocks.
    pub async fn reserve_sparse(&self, object_id: &str, size: u64) -> Result<(), CacheError> {
        let path = self.object_path(object_id);
        tokio::fs::create_dir_all(self.objects_dir()).await?;
        let file = tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .await?;
        if file.metadata().await?.len() != size {
            file.set_len(size).await?;
        }
        self.store
            .upsert_cache_entry(object_id, &path.display().to_string(), size as i64)
            .await?;
        self.store.set_presence(object_id, Presence::Sparse).await?;
        Ok(())
    }

    /// Chunk indices in `[offset, offset + len)` not yet present.
    pub async fn missing_chunks(
        &self,
        object_id: &str,
        offset: u64,
        len: u64,
        size: u64,
    ) -> Result<Vec<i64>, CacheError> {
        let Some((first, last)) = self.chunk_span(offset, len, size) else {
            return Ok(Vec::new());
        };
        let present = self.store.chunk_indices(object_id).await?;
        Ok((first..=last).filter(|idx| !present.contains(idx)).collect())
    }

    /// Writes one aligned chunk into the sparse file, records its presence
    /// and promotes the entry to full when every chunk has landed.
    pub async fn write_chunk(
        &self,
        object_id: &str,
        chunk_index: i64,
        data: &[u8],
        size: u64,
    ) -> Result<(), CacheError> {
        if chunk_index < 0 || chunk_index >= self.total_chunks(size) {
            return Err(CacheError::ChunkOutOfRange {
                object_id: object_id.to_string(),
                chunk_index,
            });
        }
        self.reserve_sparse(object_id, size).await?;

        let path = self.object_path(object_id);
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .await?;
        file.seek(SeekFrom::Start(chunk_index as u64 * self.chunk_size))
            .await?;
        file.write_all(data).await?;
        file.flush().await?;
        file.sync_data().await?;

        self.store.insert_chunk(object_id, chunk_index).await?;
        if self.store.chunk_count(object_id).await? >= self.total_chunks(size) {
            let hash = file_sha256(&path).await?;
            self.store.promote_to_full(object_id).await?;
            self.store
                .set_cache_content(object_id, Presence::Full, size as i64, Some(&hash))
                .await?;
        }
        self.signal(object_id);
        Ok(())
    }

    /// Drops every chunk and re-reserves the backing file. Used when the
    /// remote version moved underneath a partially materialized file.
    pub async fn invalidate_chunks(&self, object_id: &str, size: u64) -> Result<(), CacheError> {
        self.store.delete_chunks(object_id).await?;
        let path = self.object_path(object_id);
        if tokio::fs::try_exists(&path).await? {
            let file = tokio::fs::OpenOptions::new().write(true).open(&path).await?;
            file.set_len(0).await?;
            file.set_len(size).await?;
        }
        self.signal(object_id);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Full downloads and upload staging
    // ------------------------------------------------------------------

    /// Target for an in-flight full download; committed by rename.
    pub async fn begin_full_download(&self, object_id: &str) -> Result<PathBuf, CacheError> {
        tokio::fs::create_dir_all(self.objects_dir()).await?;
        Ok(self.part_path(object_id))
    }

    /// Atomic swap: hash the `.part` file, rename it into place, flip
    /// presence to full. Returns `(size, sha256)`.
    pub async fn commit_full_download(&self, object_id: &str) -> Result<(u64, String), CacheError> {
        let part = self.part_path(object_id);
        let target = self.object_path(object_id);
        let hash = file_sha256(&part).await?;
        let size = tokio::fs::metadata(&part).await?.len();
        tokio::fs::rename(&part, &target).await?;
        self.store
            .upsert_cache_entry(object_id, &target.display().to_string(), size as i64)
            .await?;
        self.store.delete_chunks(object_id).await?;
        self.store
            .set_cache_content(object_id, Presence::Full, size as i64, Some(&hash))
            .await?;
        self.signal(object_id);
        Ok((size, hash))
    }

    pub async fn discard_partial(&self, object_id: &str) -> Result<(), CacheError> {
        let _ = tokio::fs::remove_file(self.part_path(object_id)).await;
        Ok(())
    }

    /// Presents the cache file under its intended remote name through a
    /// symlink in a private staging directory; the cache file is not moved.
    pub async fn stage_upload(
        &self,
        object_id: &str,
        remote_name: &str,
    ) -> Result<StagedUpload, CacheError> {
        let suffix: [u8; 8] = rand::random();
        let tag: String = suffix.iter().map(|b| format!("{b:02x}")).collect();
        let dir = self.staging_dir().join(tag);
        tokio::fs::create_dir_all(&dir).await?;
        let link = dir.join(remote_name);
        let target = self.object_path(object_id);
        tokio::fs::symlink(&target, &link).await?;
        Ok(StagedUpload { dir, path: link })
    }

    pub async fn content_hash(&self, object_id: &str) -> Result<Option<String>, CacheError> {
        let path = self.object_path(object_id);
        if !tokio::fs::try_exists(&path).await? {
            return Ok(None);
        }
        Ok(Some(file_sha256(&path).await?))
    }

    // ------------------------------------------------------------------
    // Eviction
    // ------------------------------------------------------------------

    /// Approximate bytes the cache occupies: full entries count their size,
    /// sparse entries count their present chunks.
    pub async fn usage_bytes(&self) -> Result<u64, CacheError> {
        let mut total = 0u64;
        for entry in self.store.list_cache_entries().await? {
            match entry.present_locally {
                Presence::Full => total += entry.size.max(0) as u64,
                Presence::Sparse => {
                    let chunks = self.store.chunk_count(&entry.object_id).await? as u64;
                    total += self.sparse_bytes(&entry, chunks);
                }
                Presence::Absent => {}
            }
        }
        Ok(total)
    }

    fn sparse_bytes(&self, entry: &CacheRecord, chunks: u64) -> u64 {
        (chunks * self.chunk_size).min(entry.size.max(0) as u64)
    }

    /// One LRU pass: hole-punch old chunks first, then drop unpinned full
    /// entries, until usage fits under the ceiling. Pinned and open files
    /// are untouchable. Returns bytes freed.
    pub async fn evict_once(&self) -> Result<u64, CacheError> {
        let mut usage = self.usage_bytes().await?;
        if usage <= self.max_bytes {
            return Ok(0);
        }
        let mut freed = 0u64;

        for (object_id, chunk_index) in self.store.chunk_eviction_candidates(1024).await? {
            if usage <= self.max_bytes {
                break;
            }
            let entry = self
                .store
                .get_cache_entry(&object_id)
                .await?
                .ok_or_else(|| CacheError::MissingEntry(object_id.clone()))?;
            let offset = chunk_index as u64 * self.chunk_size;
            let len = self
                .chunk_size
                .min((entry.size.max(0) as u64).saturating_sub(offset));
            if len > 0 {
                punch_hole(&self.object_path(&object_id), offset, len).await?;
            }
            self.store.delete_chunk(&object_id, chunk_index).await?;
            usage = usage.saturating_sub(len);
            freed += len;
        }

        for entry in self.store.full_eviction_candidates().await? {
            if usage <= self.max_bytes {
                break;
            }
            let _ = tokio::fs::remove_file(self.object_path(&entry.object_id)).await;
            self.store
                .set_cache_content(&entry.object_id, Presence::Absent, entry.size, None)
                .await?;
            let size = entry.size.max(0) as u64;
            usage = usage.saturating_sub(size);
            freed += size;
        }
        Ok(freed)
    }
}

async fn file_sha256(path: &Path) -> Result<String, std::io::Error> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let digest = hasher.finalize();
    Ok(digest.iter().map(|b| format!("{b:02x}")).collect())
}

/// Deallocates `[offset, offset + len)` so evicted chunks stop occupying
/// disk blocks while the logical size stays intact.
#[cfg(target_os = "linux")]
async fn punch_hole(path: &Path, offset: u64, len: u64) -> Result<(), std::io::Error> {
    use std::os::unix::io::AsRawFd;
    let file = tokio::fs::OpenOptions::new().write(true).open(path).await?;
    let fd = file.as_raw_fd();
    let rc = unsafe {
        libc::fallocate(
            fd,
            libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE,
            offset as libc::off_t,
            len as libc::off_t,
        )
    };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
async fn punch_hole(path: &Path, offset: u64, len: u64) -> Result<(), std::io::Error> {
    // No FALLOC_FL_PUNCH_HOLE here; overwrite with zeroes so reads of an
    // evicted chunk cannot return stale data.
    let mut file = tokio::fs::OpenOptions::new().write(true).open(path).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    file.write_all(&vec![0u8; len as usize]).await?;
    Ok(())
}

#[cfg(test)]
#[path = "cache_tests.rs"]
mod tests;
