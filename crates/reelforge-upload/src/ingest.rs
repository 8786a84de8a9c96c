//! Chunk ingestion: store one chunk, then record it.

use std::sync::Arc;

use reelforge_common::{Error, Result, SessionId};
use serde::Serialize;
use tokio::io::AsyncRead;

use crate::registry::{ChunkOutcome, UploadRegistry};
use crate::store::ChunkStore;

/// What the caller learns about an accepted chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChunkReceipt {
    pub outcome: ChunkOutcome,
    pub index: u64,
    pub received: u64,
    pub total_chunks: u64,
    pub byte_size: u64,
}

impl ChunkReceipt {
    pub fn is_ready_to_merge(&self) -> bool {
        self.outcome == ChunkOutcome::ReadyToMerge
    }
}

/// Accepts chunk bytes and feeds the registry.
#[derive(Clone)]
pub struct ChunkIngestor {
    registry: UploadRegistry,
    store: Arc<dyn ChunkStore>,
    max_total_chunks: u64,
}

impl ChunkIngestor {
    pub fn new(registry: UploadRegistry, store: Arc<dyn ChunkStore>, max_total_chunks: u64) -> Self {
        Self {
            registry,
            store,
            max_total_chunks,
        }
    }

    /// Store chunk `index` of `session` and record it.
    ///
    /// Argument errors are raised before anything is written. A storage
    /// failure leaves the session as it was, so the same index can be resent.
    /// When the returned receipt says [`ChunkOutcome::ReadyToMerge`], this
    /// caller owns the merge.
    pub async fn ingest<R>(
        &self,
        session: &SessionId,
        total_chunks: u64,
        index: u64,
        mut data: R,
    ) -> Result<ChunkReceipt>
    where
        R: AsyncRead + Unpin + Send,
    {
        if total_chunks == 0 {
            return Err(Error::invalid_argument("totalChunks must be greater than 0"));
        }
        if total_chunks > self.max_total_chunks {
            return Err(Error::invalid_argument(format!(
                "totalChunks {total_chunks} exceeds the limit of {}",
                self.max_total_chunks
            )));
        }
        if index >= total_chunks {
            return Err(Error::OutOfRange {
                index,
                total: total_chunks,
            });
        }

        // Fails fast for a session that already started merging; the session
        // itself only comes into being once its first chunk is stored.
        self.registry.check_accepting(session, total_chunks)?;

        let record = self.store.put(session, index, &mut data).await?;
        let byte_size = record.byte_size;

        let recorded = match self
            .registry
            .get_or_create(session, total_chunks)
            .and_then(|handle| handle.record_chunk(index, record.clone()))
        {
            Ok(recorded) => recorded,
            Err(e) => {
                // Nothing references the blob we just wrote.
                if let Err(cleanup) = self.store.remove(&record).await {
                    tracing::warn!(session = %session, index, error = %cleanup, "Failed to drop unrecorded chunk");
                }
                return Err(e);
            }
        };

        if let Some(old) = &recorded.superseded {
            tracing::debug!(session = %session, index, "Chunk redelivered, replacing earlier copy");
            if let Err(e) = self.store.remove(old).await {
                tracing::warn!(session = %session, index, error = %e, "Failed to drop superseded chunk");
            }
        }

        tracing::info!(
            session = %session,
            chunk = index + 1,
            total_chunks,
            received = recorded.received,
            byte_size,
            "Received chunk"
        );

        Ok(ChunkReceipt {
            outcome: recorded.outcome,
            index,
            received: recorded.received,
            total_chunks: recorded.total_chunks,
            byte_size,
        })
    }
}
