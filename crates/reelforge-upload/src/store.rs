//! Scratch storage for individual chunk blobs.
//!
//! Blobs are addressed by `(session, index)`. Each delivery of a chunk is
//! written to its own file (`<session>/<index:08>-<delivery>.chunk`) so a
//! retried chunk never rewrites bytes that a concurrent merge might be
//! reading; the registry decides which delivery owns the index and the
//! ingestor deletes the loser.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reelforge_common::{Error, Result, SessionId};
use serde::Serialize;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufWriter};
use uuid::Uuid;

/// Write buffer used when spooling a chunk to disk.
const WRITE_BUFFER_SIZE: usize = 256 * 1024;

/// Removes a blob that never finished writing.
///
/// Covers both a failed spool and a `put` future that is dropped mid-write,
/// e.g. when the client disconnects during the upload.
struct PartialBlob<'a> {
    path: &'a Path,
    armed: bool,
}

impl<'a> PartialBlob<'a> {
    fn new(path: &'a Path) -> Self {
        Self { path, armed: true }
    }

    fn keep(mut self) {
        self.armed = false;
    }
}

impl Drop for PartialBlob<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match std::fs::remove_file(self.path) {
            Ok(()) => tracing::debug!(path = %self.path.display(), "Removed partial chunk"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                path = %self.path.display(),
                error = %e,
                "Failed to remove partial chunk"
            ),
        }
    }
}

/// One stored chunk, owned by its session until the merge consumes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChunkRecord {
    /// Position of the chunk in the assembled file.
    pub index: u64,
    /// Where the blob lives in scratch storage.
    pub location: PathBuf,
    /// Exact number of bytes stored.
    pub byte_size: u64,
    /// When the chunk finished writing.
    pub received_at: DateTime<Utc>,
}

/// Reader handed out by [`ChunkStore::open`].
pub type ChunkReader = Box<dyn AsyncRead + Unpin + Send>;

/// Durable scratch storage for chunk blobs.
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Spool `data` to a fresh blob for `(session, index)`.
    ///
    /// On failure no blob is left behind.
    async fn put(
        &self,
        session: &SessionId,
        index: u64,
        data: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<ChunkRecord>;

    /// Open a stored blob for reading.
    async fn open(&self, record: &ChunkRecord) -> Result<ChunkReader>;

    /// Delete a stored blob. Deleting a missing blob succeeds.
    async fn remove(&self, record: &ChunkRecord) -> Result<()>;

    /// Drop whatever per-session bookkeeping remains once all blobs are gone.
    async fn release_session(&self, session: &SessionId);
}

/// Filesystem-backed [`ChunkStore`].
#[derive(Debug, Clone)]
pub struct FsChunkStore {
    root: PathBuf,
    max_chunk_bytes: u64,
    fsync: bool,
}

impl FsChunkStore {
    /// Create a store rooted at `root`.
    ///
    /// # Arguments
    /// * `max_chunk_bytes` - Largest accepted chunk; bigger deliveries are rejected.
    /// * `fsync` - Whether each blob is synced to disk before it is reported stored.
    pub fn new(root: impl Into<PathBuf>, max_chunk_bytes: u64, fsync: bool) -> Self {
        Self {
            root: root.into(),
            max_chunk_bytes,
            fsync,
        }
    }

    /// Root directory of the scratch area.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn session_dir(&self, session: &SessionId) -> PathBuf {
        self.root.join(session.as_str())
    }

    /// Remove every blob in the scratch area.
    ///
    /// Session tracking is in-memory only, so blobs found at startup belong to
    /// sessions that can never complete.
    ///
    /// # Returns
    /// The number of session directories removed.
    pub async fn purge_stale(&self) -> Result<usize> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(|e| Error::storage(format!("create {}", self.root.display()), e))?;

        let mut entries = fs::read_dir(&self.root)
            .await
            .map_err(|e| Error::storage("scan chunk directory", e))?;

        let mut removed = 0;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::storage("scan chunk directory", e))?
        {
            let path = entry.path();
            let result = if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                fs::remove_dir_all(&path).await
            } else {
                fs::remove_file(&path).await
            };
            match result {
                Ok(()) => removed += 1,
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to purge stale chunk data"),
            }
        }

        if removed > 0 {
            tracing::info!(removed, "Purged stale chunk data from previous run");
        }
        Ok(removed)
    }

    async fn spool(
        &self,
        path: &Path,
        data: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<u64> {
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await
            .map_err(|e| Error::storage(format!("create {}", path.display()), e))?;

        // Read one byte past the limit so an oversized chunk is detectable.
        let mut limited = data.take(self.max_chunk_bytes + 1);
        let mut out = BufWriter::with_capacity(WRITE_BUFFER_SIZE, file);
        let written = tokio::io::copy(&mut limited, &mut out)
            .await
            .map_err(|e| Error::storage(format!("write {}", path.display()), e))?;

        if written > self.max_chunk_bytes {
            return Err(Error::invalid_argument(format!(
                "chunk exceeds the {} byte limit",
                self.max_chunk_bytes
            )));
        }

        out.flush()
            .await
            .map_err(|e| Error::storage(format!("flush {}", path.display()), e))?;
        if self.fsync {
            out.get_ref()
                .sync_data()
                .await
                .map_err(|e| Error::storage(format!("sync {}", path.display()), e))?;
        }

        Ok(written)
    }
}

#[async_trait]
impl ChunkStore for FsChunkStore {
    async fn put(
        &self,
        session: &SessionId,
        index: u64,
        data: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<ChunkRecord> {
        let dir = self.session_dir(session);
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::storage(format!("create {}", dir.display()), e))?;

        let location = dir.join(format!("{index:08}-{}.chunk", Uuid::new_v4().simple()));

        let guard = PartialBlob::new(&location);
        let byte_size = self.spool(&location, data).await?;
        guard.keep();

        tracing::debug!(
            session = %session,
            index,
            byte_size,
            path = %location.display(),
            "Stored chunk"
        );
        Ok(ChunkRecord {
            index,
            location,
            byte_size,
            received_at: Utc::now(),
        })
    }

    async fn open(&self, record: &ChunkRecord) -> Result<ChunkReader> {
        let file = File::open(&record.location).await.map_err(|e| {
            Error::storage(format!("open chunk {}", record.location.display()), e)
        })?;
        Ok(Box::new(file))
    }

    async fn remove(&self, record: &ChunkRecord) -> Result<()> {
        match fs::remove_file(&record.location).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::storage(
                format!("remove chunk {}", record.location.display()),
                e,
            )),
        }
    }

    async fn release_session(&self, session: &SessionId) {
        // Only succeeds once empty; a fresh upload under the same name may
        // already be writing here.
        let dir = self.session_dir(session);
        if let Err(e) = fs::remove_dir(&dir).await {
            tracing::trace!(path = %dir.display(), error = %e, "Session directory kept");
        }
    }
}
