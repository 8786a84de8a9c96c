//! Reelforge-Upload: the chunked-upload session engine.
//!
//! A large file arrives as independent, possibly concurrent and out-of-order
//! chunk requests. This crate turns them into one artifact, exactly once:
//!
//! - [`store`]: durable scratch storage for chunk blobs ([`ChunkStore`],
//!   [`FsChunkStore`]).
//! - [`registry`]: per-session bookkeeping and the authoritative completion
//!   signal ([`UploadRegistry`]), plus idle-session reaping.
//! - [`ingest`]: store-then-record for a single chunk ([`ChunkIngestor`]).
//! - [`merge`]: ordered, all-or-nothing assembly ([`MergeEngine`]).
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use reelforge_common::SessionId;
//! use reelforge_upload::{ChunkIngestor, ChunkStore, FsChunkStore, MergeEngine, UploadRegistry};
//!
//! # async fn example() -> reelforge_common::Result<()> {
//! let registry = UploadRegistry::new(Duration::from_secs(3600));
//! let store: Arc<dyn ChunkStore> = Arc::new(FsChunkStore::new("data/chunks", 64 << 20, true));
//! let ingestor = ChunkIngestor::new(registry.clone(), store.clone(), 10_000);
//! let merger = MergeEngine::new(registry, store, "data/uploads", true);
//!
//! let id = SessionId::parse("clip.mp4")?;
//! let receipt = ingestor.ingest(&id, 1, 0, &b"bytes"[..]).await?;
//! if receipt.is_ready_to_merge() {
//!     let artifact = merger.merge(&id).await?;
//!     println!("{} bytes at {}", artifact.byte_size, artifact.path.display());
//! }
//! # Ok(())
//! # }
//! ```

pub mod ingest;
pub mod merge;
pub mod registry;
pub mod store;

pub use ingest::{ChunkIngestor, ChunkReceipt};
pub use merge::{MergeEngine, MergedArtifact, STAGING_DIR};
pub use registry::{
    reclaim_chunks, start_reaper_task, ChunkOutcome, RecordedChunk, SessionHandle, SessionState,
    SessionSummary, TakenChunks, UploadRegistry,
};
pub use store::{ChunkReader, ChunkRecord, ChunkStore, FsChunkStore};
