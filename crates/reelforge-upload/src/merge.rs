//! Exactly-once assembly of a completed session into its artifact.
//!
//! Chunks are appended strictly in index order into a staging file under
//! `<artifact_dir>/.incoming/`, which no session name can address, and the
//! staging file is renamed into place only after every chunk has been
//! written. Each chunk blob is deleted as soon as its bytes are durable, so
//! scratch usage shrinks while the artifact grows.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use reelforge_common::{Error, Result, SessionId};
use serde::Serialize;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use uuid::Uuid;

use crate::registry::{reclaim_chunks, TakenChunks, UploadRegistry};
use crate::store::ChunkStore;

/// Staging directory for in-progress merges, relative to the artifact dir.
pub const STAGING_DIR: &str = ".incoming";

const MERGE_BUFFER_SIZE: usize = 1024 * 1024;

/// A fully assembled, immutable upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergedArtifact {
    pub session_id: SessionId,
    pub path: PathBuf,
    pub byte_size: u64,
}

impl MergedArtifact {
    /// Describe an artifact that is already on disk.
    pub async fn open_existing(session_id: SessionId, path: PathBuf) -> Result<Self> {
        let metadata = fs::metadata(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::not_found("artifact", &session_id)
            } else {
                Error::storage(format!("stat {}", path.display()), e)
            }
        })?;
        if !metadata.is_file() {
            return Err(Error::not_found("artifact", &session_id));
        }
        Ok(Self {
            session_id,
            path,
            byte_size: metadata.len(),
        })
    }
}

/// Concatenates completed sessions into artifacts.
#[derive(Clone)]
pub struct MergeEngine {
    registry: UploadRegistry,
    store: Arc<dyn ChunkStore>,
    artifact_dir: PathBuf,
    fsync: bool,
}

impl MergeEngine {
    pub fn new(
        registry: UploadRegistry,
        store: Arc<dyn ChunkStore>,
        artifact_dir: impl Into<PathBuf>,
        fsync: bool,
    ) -> Self {
        Self {
            registry,
            store,
            artifact_dir: artifact_dir.into(),
            fsync,
        }
    }

    pub fn artifact_dir(&self) -> &Path {
        &self.artifact_dir
    }

    /// Final location of the artifact for `session`.
    pub fn artifact_path(&self, session: &SessionId) -> PathBuf {
        self.artifact_dir.join(session.as_str())
    }

    fn staging_dir(&self) -> PathBuf {
        self.artifact_dir.join(STAGING_DIR)
    }

    /// Delete staging files left behind by a merge that never finished.
    ///
    /// # Returns
    /// The number of files removed.
    pub async fn recover(&self) -> Result<usize> {
        let staging = self.staging_dir();
        fs::create_dir_all(&staging)
            .await
            .map_err(|e| Error::storage(format!("create {}", staging.display()), e))?;

        let mut entries = fs::read_dir(&staging)
            .await
            .map_err(|e| Error::storage("scan staging directory", e))?;
        let mut removed = 0;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::storage("scan staging directory", e))?
        {
            match fs::remove_file(entry.path()).await {
                Ok(()) => removed += 1,
                Err(e) => {
                    tracing::warn!(path = %entry.path().display(), error = %e, "Failed to remove stale merge output")
                }
            }
        }
        if removed > 0 {
            tracing::info!(removed, "Removed interrupted merge output");
        }
        Ok(removed)
    }

    /// Merge a session whose last chunk reported `ReadyToMerge`.
    ///
    /// Registry errors ([`Error::AlreadyMerging`], [`Error::NotFound`]) are
    /// returned untouched. Any failure after the session was taken marks it
    /// failed, reclaims its blobs and surfaces as [`Error::Merge`]; no file is
    /// left at the artifact path in that case.
    ///
    /// Once the session is taken the merge runs on its own task: dropping the
    /// returned future does not interrupt it, and the session still ends up
    /// merged or failed.
    pub async fn merge(&self, session: &SessionId) -> Result<MergedArtifact> {
        let taken = self.registry.take_for_merge(session)?;

        let engine = self.clone();
        let id = session.clone();
        tokio::spawn(async move { engine.run(&id, taken).await })
            .await
            .map_err(|e| Error::merge(session, format!("merge task ended abnormally: {e}")))?
    }

    async fn run(&self, session: &SessionId, taken: TakenChunks) -> Result<MergedArtifact> {
        let started = Instant::now();

        match self.assemble(session, &taken).await {
            Ok(artifact) => {
                self.registry.complete_merge(&taken);
                self.store.release_session(session).await;
                tracing::info!(
                    session = %session,
                    chunks = taken.total_chunks,
                    byte_size = artifact.byte_size,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    path = %artifact.path.display(),
                    "Merged upload"
                );
                Ok(artifact)
            }
            Err(e) => {
                self.registry.fail_merge(&taken);
                reclaim_chunks(self.store.as_ref(), session, &taken.records).await;
                tracing::error!(session = %session, error = %e, "Merge failed");
                Err(e)
            }
        }
    }

    async fn assemble(&self, session: &SessionId, taken: &TakenChunks) -> Result<MergedArtifact> {
        verify_complete(session, taken)?;

        let staging_dir = self.staging_dir();
        fs::create_dir_all(&staging_dir)
            .await
            .map_err(|e| Error::merge(session, format!("create staging directory: {e}")))?;
        fs::create_dir_all(&self.artifact_dir)
            .await
            .map_err(|e| Error::merge(session, format!("create artifact directory: {e}")))?;

        let staging = staging_dir.join(format!("{}.partial", Uuid::new_v4().simple()));
        let target = self.artifact_path(session);

        let result = match self.write_chunks(session, &staging, taken).await {
            Ok(byte_size) => fs::rename(&staging, &target)
                .await
                .map(|()| byte_size)
                .map_err(|e| Error::merge(session, format!("publish artifact: {e}"))),
            Err(e) => Err(e),
        };

        match result {
            Ok(byte_size) => Ok(MergedArtifact {
                session_id: session.clone(),
                path: target,
                byte_size,
            }),
            Err(e) => {
                if let Err(cleanup) = fs::remove_file(&staging).await {
                    if cleanup.kind() != std::io::ErrorKind::NotFound {
                        tracing::warn!(path = %staging.display(), error = %cleanup, "Failed to remove partial artifact");
                    }
                }
                Err(e)
            }
        }
    }

    async fn write_chunks(
        &self,
        session: &SessionId,
        staging: &Path,
        taken: &TakenChunks,
    ) -> Result<u64> {
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(staging)
            .await
            .map_err(|e| Error::merge(session, format!("open destination: {e}")))?;
        let mut out = BufWriter::with_capacity(MERGE_BUFFER_SIZE, file);
        let mut total = 0u64;

        for record in &taken.records {
            let mut source = self.store.open(record).await.map_err(|e| {
                Error::merge(session, format!("open chunk {}: {e}", record.index))
            })?;

            let copied = tokio::io::copy(&mut source, &mut out)
                .await
                .map_err(|e| Error::merge(session, format!("copy chunk {}: {e}", record.index)))?;
            if copied != record.byte_size {
                return Err(Error::merge(
                    session,
                    format!(
                        "chunk {} has {copied} bytes, expected {}",
                        record.index, record.byte_size
                    ),
                ));
            }
            drop(source);

            out.flush()
                .await
                .map_err(|e| Error::merge(session, format!("flush chunk {}: {e}", record.index)))?;
            if self.fsync {
                out.get_ref()
                    .sync_data()
                    .await
                    .map_err(|e| Error::merge(session, format!("sync chunk {}: {e}", record.index)))?;
            }
            total += copied;
            taken.handle.touch();

            if let Err(e) = self.store.remove(record).await {
                tracing::warn!(session = %session, index = record.index, error = %e, "Failed to delete merged chunk");
            }
        }

        out.flush()
            .await
            .map_err(|e| Error::merge(session, format!("flush destination: {e}")))?;
        if self.fsync {
            out.get_ref()
                .sync_all()
                .await
                .map_err(|e| Error::merge(session, format!("sync destination: {e}")))?;
        }

        Ok(total)
    }
}

/// Check that the records cover `0..total_chunks` exactly once, in order.
fn verify_complete(session: &SessionId, taken: &TakenChunks) -> Result<()> {
    if taken.records.len() as u64 != taken.total_chunks {
        let missing = (0..taken.total_chunks)
            .find(|i| !taken.records.iter().any(|r| r.index == *i))
            .unwrap_or(taken.records.len() as u64);
        return Err(Error::merge(
            session,
            format!(
                "chunk {missing} missing ({} of {} received)",
                taken.records.len(),
                taken.total_chunks
            ),
        ));
    }
    for (position, record) in taken.records.iter().enumerate() {
        if record.index != position as u64 {
            return Err(Error::merge(
                session,
                format!("chunk {position} missing"),
            ));
        }
    }
    Ok(())
}
