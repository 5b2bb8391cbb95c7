//! Content-addressed blob store.
//!
//! Every blob lives at `blobs/sha256/<hex>` next to a `<hex>.meta.json`
//! record. Downloads are staged in `staging/<hex>.partial`, hashed while they
//! are written, and renamed into place only when the hash matches. A blob
//! under its final name has always been verified.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{Mutex, OwnedMutexGuard};
use vmpull_core::config::StorageConfig;
use vmpull_core::error::{Result, VmError};

use super::link::{Access, LinkMethod, Linker};
use crate::oci::digest::{Digest, DigestHasher};

const HASH_BUF_SIZE: usize = 64 * 1024;

/// Metadata for a stored blob.
///
/// Timestamps are Unix milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentStoreEntry {
    pub digest: Digest,
    pub size_bytes: u64,
    pub cached_at: i64,
    pub last_accessed: i64,
    /// Filesystem link count of the blob file (1 when nothing links to it)
    #[serde(skip)]
    pub link_count: u64,
}

/// Content-addressed store shared by all pulls.
pub struct ContentStore {
    /// `blobs/sha256`
    blobs_dir: PathBuf,
    /// In-progress downloads
    staging_dir: PathBuf,
    linker: Linker,
    /// Serializes writers of the same digest; entries live while a writer does
    commit_locks: Arc<DashMap<Digest, Arc<Mutex<()>>>>,
    /// Digests in use by in-flight pulls; never evicted
    pins: Arc<DashMap<Digest, usize>>,
}

impl ContentStore {
    /// Open the store under the configured vmpull home.
    pub fn new(storage: &StorageConfig) -> Result<Self> {
        Self::open(&storage.blobs_dir().join("sha256"), &storage.staging_dir())
    }

    /// Open a store at explicit directories, creating them if needed.
    pub fn open(blobs_dir: &Path, staging_dir: &Path) -> Result<Self> {
        for dir in [blobs_dir, staging_dir] {
            std::fs::create_dir_all(dir).map_err(|e| {
                VmError::StorageError(format!(
                    "Failed to create content store directory {}: {}",
                    dir.display(),
                    e
                ))
            })?;
        }

        Ok(Self {
            blobs_dir: blobs_dir.to_path_buf(),
            staging_dir: staging_dir.to_path_buf(),
            linker: Linker::new(),
            commit_locks: Arc::new(DashMap::new()),
            pins: Arc::new(DashMap::new()),
        })
    }

    pub fn blobs_dir(&self) -> &Path {
        &self.blobs_dir
    }

    /// Final path of a blob.
    pub fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.blobs_dir.join(digest.hex())
    }

    fn meta_path(&self, digest: &Digest) -> PathBuf {
        self.blobs_dir.join(format!("{}.meta.json", digest.hex()))
    }

    fn partial_path(&self, digest: &Digest) -> PathBuf {
        self.staging_dir.join(format!("{}.partial", digest.hex()))
    }

    /// Whether a verified blob is stored under `digest`.
    pub fn has(&self, digest: &Digest) -> bool {
        self.blob_path(digest).is_file()
    }

    /// Open a sink for `digest`.
    ///
    /// Waits for any other writer of the same digest. If the blob was
    /// committed meanwhile the returned writer is already complete
    /// ([`BlobWriter::is_committed`]). A partial download left by an earlier
    /// attempt is resumed: its bytes are re-hashed and
    /// [`BlobWriter::offset`] reports how much is already there.
    pub async fn open_for_write(&self, digest: &Digest) -> Result<BlobWriter> {
        let lock = self.commit_locks.entry(digest.clone()).or_default().clone();
        let guard = lock.lock_owned().await;

        let partial_path = self.partial_path(digest);
        let mut writer = BlobWriter {
            digest: digest.clone(),
            partial_path: partial_path.clone(),
            final_path: self.blob_path(digest),
            meta_path: self.meta_path(digest),
            file: None,
            hasher: DigestHasher::new(),
            written: 0,
            guard: Some(guard),
            locks: self.commit_locks.clone(),
        };

        if self.has(digest) {
            return Ok(writer);
        }

        if partial_path.is_file() {
            let mut existing = tokio::fs::File::open(&partial_path).await?;
            let mut buf = vec![0u8; HASH_BUF_SIZE];
            loop {
                let n = existing.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                writer.hasher.update(&buf[..n]);
                writer.written += n as u64;
            }
            tracing::debug!(
                digest = %digest,
                offset = writer.written,
                "Resuming partial blob"
            );
        }

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&partial_path)
            .await
            .map_err(|e| {
                VmError::StorageError(format!(
                    "Failed to open staging file {}: {}",
                    partial_path.display(),
                    e
                ))
            })?;
        writer.file = Some(file);
        Ok(writer)
    }

    /// Store an in-memory blob (manifests, small configs).
    pub async fn put_bytes(&self, digest: &Digest, data: &[u8]) -> Result<()> {
        let mut writer = self.open_for_write(digest).await?;
        if writer.is_committed() {
            self.touch(digest)?;
            return Ok(());
        }
        writer.reset().await?;
        writer.write(data).await?;
        writer.commit().await?;
        Ok(())
    }

    /// Read a whole blob into memory.
    pub fn read(&self, digest: &Digest) -> Result<Vec<u8>> {
        std::fs::read(self.blob_path(digest)).map_err(|e| {
            VmError::StorageError(format!("Failed to read blob {}: {}", digest, e))
        })
    }

    /// Materialize a stored blob at `target`.
    ///
    /// Reference-links when `dedup` is set and the filesystem allows it,
    /// otherwise copies. A [`Access::Writable`] target never shares an inode
    /// with the blob. Refreshes the entry's access time.
    pub fn link_into(
        &self,
        digest: &Digest,
        target: &Path,
        dedup: bool,
        access: Access,
    ) -> Result<LinkMethod> {
        let source = self.blob_path(digest);
        if !source.is_file() {
            return Err(VmError::StorageError(format!("Blob {} is not in the store", digest)));
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let method = self.linker.link(&source, target, dedup, access)?;
        self.touch(digest)?;

        tracing::debug!(
            digest = %digest,
            target = %target.display(),
            method = ?method,
            "Linked blob"
        );
        Ok(method)
    }

    /// Append a stored blob to `out`, returning the bytes copied.
    pub fn append_to(&self, digest: &Digest, out: &mut impl Write) -> Result<u64> {
        let mut source = std::fs::File::open(self.blob_path(digest)).map_err(|e| {
            VmError::StorageError(format!("Failed to open blob {}: {}", digest, e))
        })?;
        let copied = std::io::copy(&mut source, out)?;
        self.touch(digest)?;
        Ok(copied)
    }

    /// Size in bytes of a stored blob.
    pub fn size_of(&self, digest: &Digest) -> Result<u64> {
        std::fs::metadata(self.blob_path(digest))
            .map(|m| m.len())
            .map_err(|e| VmError::StorageError(format!("Blob {} is not in the store: {}", digest, e)))
    }

    /// All stored blobs with their metadata.
    ///
    /// A blob whose `.meta.json` is missing or unreadable is still listed,
    /// with timestamps taken from the file itself.
    pub fn list_entries(&self) -> Result<Vec<ContentStoreEntry>> {
        let read_dir = std::fs::read_dir(&self.blobs_dir).map_err(|e| {
            VmError::StorageError(format!(
                "Failed to read content store {}: {}",
                self.blobs_dir.display(),
                e
            ))
        })?;

        let mut entries = Vec::new();
        for entry in read_dir {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Ok(digest) = Digest::parse(&format!("sha256:{}", name)) else {
                continue;
            };
            let metadata = entry.metadata()?;
            if !metadata.is_file() {
                continue;
            }

            let mut record = self.read_meta(&digest).unwrap_or_else(|| {
                let modified = metadata
                    .modified()
                    .ok()
                    .map(|t| chrono::DateTime::<Utc>::from(t).timestamp_millis())
                    .unwrap_or(0);
                ContentStoreEntry {
                    digest: digest.clone(),
                    size_bytes: metadata.len(),
                    cached_at: modified,
                    last_accessed: modified,
                    link_count: 1,
                }
            });
            record.size_bytes = metadata.len();
            record.link_count = link_count(&metadata);
            entries.push(record);
        }

        Ok(entries)
    }

    /// Delete a blob and its metadata, returning the bytes released.
    pub fn remove(&self, digest: &Digest) -> Result<u64> {
        let path = self.blob_path(digest);
        let size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);

        if path.exists() {
            std::fs::remove_file(&path).map_err(|e| {
                VmError::StorageError(format!("Failed to remove blob {}: {}", path.display(), e))
            })?;
        }
        let meta = self.meta_path(digest);
        if meta.exists() {
            std::fs::remove_file(&meta).map_err(|e| {
                VmError::StorageError(format!(
                    "Failed to remove blob metadata {}: {}",
                    meta.display(),
                    e
                ))
            })?;
        }

        tracing::debug!(digest = %digest, size_bytes = size, "Removed blob");
        Ok(size)
    }

    /// Mark a blob as used now.
    pub fn touch(&self, digest: &Digest) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let mut record = match self.read_meta(digest) {
            Some(record) => record,
            None => ContentStoreEntry {
                digest: digest.clone(),
                size_bytes: self.size_of(digest)?,
                cached_at: now,
                last_accessed: now,
                link_count: 1,
            },
        };
        record.last_accessed = now;
        write_meta(&self.meta_path(digest), &record)
    }

    /// Sum of all blob sizes.
    pub fn total_size(&self) -> Result<u64> {
        Ok(self.list_entries()?.iter().map(|e| e.size_bytes).sum())
    }

    /// Protect `digests` from eviction until the returned guard drops.
    pub fn pin(&self, digests: impl IntoIterator<Item = Digest>) -> PinGuard {
        let digests: Vec<Digest> = digests.into_iter().collect();
        for digest in &digests {
            *self.pins.entry(digest.clone()).or_insert(0) += 1;
        }
        PinGuard {
            pins: self.pins.clone(),
            digests,
        }
    }

    /// Whether an in-flight pull is using `digest`.
    pub fn is_pinned(&self, digest: &Digest) -> bool {
        self.pins.contains_key(digest)
    }

    fn read_meta(&self, digest: &Digest) -> Option<ContentStoreEntry> {
        let content = std::fs::read_to_string(self.meta_path(digest)).ok()?;
        serde_json::from_str(&content).ok()
    }
}

fn write_meta(path: &Path, record: &ContentStoreEntry) -> Result<()> {
    std::fs::write(path, serde_json::to_string_pretty(record)?).map_err(|e| {
        VmError::StorageError(format!("Failed to write blob metadata {}: {}", path.display(), e))
    })
}

#[cfg(unix)]
fn link_count(metadata: &std::fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    metadata.nlink()
}

#[cfg(not(unix))]
fn link_count(_metadata: &std::fs::Metadata) -> u64 {
    1
}

/// Releases pins on drop.
pub struct PinGuard {
    pins: Arc<DashMap<Digest, usize>>,
    digests: Vec<Digest>,
}

impl Drop for PinGuard {
    fn drop(&mut self) {
        for digest in &self.digests {
            if let Some(mut count) = self.pins.get_mut(digest) {
                *count = count.saturating_sub(1);
            }
            self.pins.remove_if(digest, |_, count| *count == 0);
        }
    }
}

/// Staged write of one blob.
///
/// Dropping the writer without committing keeps the partial file so a later
/// attempt can resume it.
pub struct BlobWriter {
    digest: Digest,
    partial_path: PathBuf,
    final_path: PathBuf,
    meta_path: PathBuf,
    /// `None` once the blob is in the store
    file: Option<tokio::fs::File>,
    hasher: DigestHasher,
    written: u64,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<DashMap<Digest, Arc<Mutex<()>>>>,
}

impl BlobWriter {
    pub fn digest(&self) -> &Digest {
        &self.digest
    }

    /// Bytes already staged; the next write continues from here.
    pub fn offset(&self) -> u64 {
        self.written
    }

    /// The blob is already stored; nothing needs to be written.
    pub fn is_committed(&self) -> bool {
        self.file.is_none()
    }

    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        let file = self.file.as_mut().ok_or_else(|| {
            VmError::StorageError(format!("Blob {} is already committed", self.digest))
        })?;
        // Flushed per chunk so the partial file always holds what `offset` says
        let written = match file.write_all(data).await {
            Ok(()) => file.flush().await,
            Err(e) => Err(e),
        };
        written.map_err(|e| {
            VmError::StorageError(format!(
                "Failed to write staging file {}: {}",
                self.partial_path.display(),
                e
            ))
        })?;
        self.hasher.update(data);
        self.written += data.len() as u64;
        Ok(())
    }

    /// Drop staged bytes and start over from offset 0.
    pub async fn reset(&mut self) -> Result<()> {
        if let Some(file) = self.file.as_mut() {
            file.flush().await?;
            file.set_len(0).await?;
        }
        self.hasher = DigestHasher::new();
        self.written = 0;
        Ok(())
    }

    /// Verify the staged bytes and move them under their digest.
    ///
    /// Returns the blob size. On a hash mismatch the staged bytes are
    /// discarded and [`VmError::DigestMismatchError`] is returned.
    pub async fn commit(mut self) -> Result<u64> {
        let Some(mut file) = self.file.take() else {
            return Ok(std::fs::metadata(&self.final_path)?.len());
        };
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        let actual = std::mem::take(&mut self.hasher).finalize();
        if actual != self.digest {
            let _ = tokio::fs::remove_file(&self.partial_path).await;
            return Err(VmError::DigestMismatchError {
                expected: self.digest.to_string(),
                actual: actual.to_string(),
            });
        }

        tokio::fs::rename(&self.partial_path, &self.final_path)
            .await
            .map_err(|e| {
                VmError::StorageError(format!(
                    "Failed to commit blob {} -> {}: {}",
                    self.partial_path.display(),
                    self.final_path.display(),
                    e
                ))
            })?;

        let now = Utc::now().timestamp_millis();
        write_meta(
            &self.meta_path,
            &ContentStoreEntry {
                digest: self.digest.clone(),
                size_bytes: self.written,
                cached_at: now,
                last_accessed: now,
                link_count: 1,
            },
        )?;

        tracing::debug!(digest = %self.digest, size_bytes = self.written, "Committed blob");
        Ok(self.written)
    }

    /// Throw away staged bytes instead of keeping them for resume.
    pub async fn discard(mut self) -> Result<()> {
        if self.file.take().is_some() {
            let _ = tokio::fs::remove_file(&self.partial_path).await;
        }
        Ok(())
    }
}

impl Drop for BlobWriter {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Waiters hold a clone, so the lock stays while anyone queues on it
        self.locks
            .remove_if(&self.digest, |_, lock| Arc::strong_count(lock) == 1);
    }
}
