//! Upload session tracking.
//!
//! The registry is the single source of truth for "how many chunks have we
//! seen and are we done". Each session sits behind its own mutex so
//! mutations of one session are serialized while different sessions proceed
//! independently. The mutex is only ever held for metadata updates, never
//! across I/O.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use reelforge_common::{Error, Result, SessionId};
use serde::Serialize;

use crate::store::{ChunkRecord, ChunkStore};

/// Lifecycle of an upload session.
///
/// Moves forward only (`Open -> Merging -> Merged`); `Failed` is terminal and
/// reachable from any state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Open,
    Merging,
    Merged,
    Failed,
}

/// Result of recording a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkOutcome {
    /// More chunks are needed, or another caller already owns the merge.
    StillOpen,
    /// This caller completed the set and must trigger the merge.
    ///
    /// Returned exactly once per session.
    ReadyToMerge,
}

/// What [`SessionHandle::record_chunk`] reports back.
#[derive(Debug, Clone)]
pub struct RecordedChunk {
    pub outcome: ChunkOutcome,
    /// Distinct indices received so far.
    pub received: u64,
    pub total_chunks: u64,
    /// A previous delivery of the same index that this one replaced.
    pub superseded: Option<ChunkRecord>,
}

/// Records handed to the merge engine by [`UploadRegistry::take_for_merge`].
#[derive(Debug, Clone)]
pub struct TakenChunks {
    pub total_chunks: u64,
    /// Sorted by index.
    pub records: Vec<ChunkRecord>,
    pub(crate) handle: SessionHandle,
}

/// Point-in-time view of a session, for listing.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub total_chunks: u64,
    pub received_chunks: u64,
    pub received_bytes: u64,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

#[derive(Debug)]
struct UploadSession {
    total_chunks: u64,
    chunks: BTreeMap<u64, ChunkRecord>,
    state: SessionState,
    ready_signalled: bool,
    created_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
}

impl UploadSession {
    fn new(total_chunks: u64) -> Self {
        let now = Utc::now();
        Self {
            total_chunks,
            chunks: BTreeMap::new(),
            state: SessionState::Open,
            ready_signalled: false,
            created_at: now,
            last_activity: now,
        }
    }

    fn admit(&self, id: &SessionId, total_chunks: u64) -> Result<()> {
        if self.total_chunks != total_chunks {
            return Err(Error::invalid_argument(format!(
                "totalChunks {total_chunks} does not match the {} declared for '{id}'",
                self.total_chunks
            )));
        }
        if self.state != SessionState::Open {
            return Err(Error::SessionClosed(id.to_string()));
        }
        Ok(())
    }

    fn close(&mut self, state: SessionState) -> Vec<ChunkRecord> {
        self.state = state;
        std::mem::take(&mut self.chunks).into_values().collect()
    }
}

/// Shared handle to one session's state.
///
/// A handle stays bound to the session it was issued for: once that session
/// is merged or failed, recording through a stale handle fails with
/// [`Error::SessionClosed`] even if a new session with the same name exists.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: SessionId,
    inner: Arc<Mutex<UploadSession>>,
}

impl SessionHandle {
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn total_chunks(&self) -> u64 {
        self.inner.lock().total_chunks
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    /// Record a stored chunk against this session.
    ///
    /// Re-delivering an index replaces the earlier record (last write wins)
    /// and returns it as `superseded` so its blob can be deleted.
    pub fn record_chunk(&self, index: u64, record: ChunkRecord) -> Result<RecordedChunk> {
        let mut session = self.inner.lock();

        if session.state != SessionState::Open {
            return Err(Error::SessionClosed(self.id.to_string()));
        }
        if index >= session.total_chunks {
            return Err(Error::OutOfRange {
                index,
                total: session.total_chunks,
            });
        }

        let superseded = session.chunks.insert(index, record);
        session.last_activity = Utc::now();

        let received = session.chunks.len() as u64;
        let outcome = if received == session.total_chunks && !session.ready_signalled {
            session.ready_signalled = true;
            ChunkOutcome::ReadyToMerge
        } else {
            ChunkOutcome::StillOpen
        };

        Ok(RecordedChunk {
            outcome,
            received,
            total_chunks: session.total_chunks,
            superseded,
        })
    }

    /// Note progress on a session that is not receiving chunks, such as one
    /// being merged, so the reaper does not consider it stalled.
    pub(crate) fn touch(&self) {
        self.inner.lock().last_activity = Utc::now();
    }

    fn summary(&self) -> SessionSummary {
        let session = self.inner.lock();
        SessionSummary {
            session_id: self.id.clone(),
            total_chunks: session.total_chunks,
            received_chunks: session.chunks.len() as u64,
            received_bytes: session.chunks.values().map(|c| c.byte_size).sum(),
            state: session.state,
            created_at: session.created_at,
            last_activity: session.last_activity,
        }
    }

    fn is_same(&self, other: &SessionHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Process-wide map of session id to session state.
#[derive(Clone)]
pub struct UploadRegistry {
    sessions: Arc<DashMap<SessionId, SessionHandle>>,
    /// Open sessions idle, or merges stalled, for longer than this are
    /// abandoned.
    idle_timeout: Duration,
}

impl UploadRegistry {
    /// Create an empty registry.
    ///
    /// # Arguments
    /// * `idle_timeout` - How long an open session may go without a chunk
    ///   before [`UploadRegistry::reap_idle`] abandons it.
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            idle_timeout,
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Look up a session, creating it on first sight.
    ///
    /// Fails with [`Error::InvalidArgument`] when `total_chunks` is zero or
    /// disagrees with the value the session was created with, and with
    /// [`Error::SessionClosed`] when the session is already merging.
    pub fn get_or_create(&self, id: &SessionId, total_chunks: u64) -> Result<SessionHandle> {
        if total_chunks == 0 {
            return Err(Error::invalid_argument("totalChunks must be greater than 0"));
        }

        let handle = self
            .sessions
            .entry(id.clone())
            .or_insert_with(|| {
                tracing::info!(session = %id, total_chunks, "Opened upload session");
                SessionHandle {
                    id: id.clone(),
                    inner: Arc::new(Mutex::new(UploadSession::new(total_chunks))),
                }
            })
            .clone();

        let mut session = handle.inner.lock();
        session.admit(id, total_chunks)?;
        session.last_activity = Utc::now();
        drop(session);

        Ok(handle)
    }

    /// Check that `id` would accept a chunk declared with `total_chunks`,
    /// without creating anything.
    ///
    /// Unknown sessions pass; they are created once a chunk is stored.
    pub fn check_accepting(&self, id: &SessionId, total_chunks: u64) -> Result<()> {
        if total_chunks == 0 {
            return Err(Error::invalid_argument("totalChunks must be greater than 0"));
        }
        match self.get(id) {
            Some(handle) => handle.inner.lock().admit(id, total_chunks),
            None => Ok(()),
        }
    }

    /// Get an existing session.
    pub fn get(&self, id: &SessionId) -> Option<SessionHandle> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    /// Record a stored chunk against the session registered under `id`.
    ///
    /// Fails with [`Error::SessionClosed`] if no session is registered, since
    /// the only way for one to disappear is a merge, failure or abort.
    pub fn record_chunk(&self, id: &SessionId, index: u64, record: ChunkRecord) -> Result<RecordedChunk> {
        let handle = self
            .get(id)
            .ok_or_else(|| Error::SessionClosed(id.to_string()))?;
        handle.record_chunk(index, record)
    }

    /// Move a session to `Merging` and hand its chunk records to the caller.
    ///
    /// The session keeps its records until the merge settles, so a stalled
    /// merge that gets reaped still has its blobs reclaimed. Fails with
    /// [`Error::AlreadyMerging`] on a second call.
    pub fn take_for_merge(&self, id: &SessionId) -> Result<TakenChunks> {
        let handle = self
            .get(id)
            .ok_or_else(|| Error::not_found("upload session", id))?;

        let mut session = handle.inner.lock();
        match session.state {
            SessionState::Open => {}
            SessionState::Merging | SessionState::Merged => {
                return Err(Error::AlreadyMerging(id.to_string()));
            }
            SessionState::Failed => return Err(Error::SessionClosed(id.to_string())),
        }

        session.state = SessionState::Merging;
        session.last_activity = Utc::now();
        let total_chunks = session.total_chunks;
        let records: Vec<ChunkRecord> = session.chunks.values().cloned().collect();
        drop(session);
        tracing::debug!(session = %id, chunks = records.len(), "Session handed to merge");

        Ok(TakenChunks {
            total_chunks,
            records,
            handle,
        })
    }

    /// Settle a merge that finished. Only touches the session the records
    /// were taken from, even if the name has since been reused.
    pub fn complete_merge(&self, taken: &TakenChunks) {
        if taken.handle.state() != SessionState::Merging {
            tracing::warn!(session = %taken.handle.id, "Merge finished after its session was abandoned");
        }
        self.finish_handle(&taken.handle, SessionState::Merged);
    }

    /// Settle a merge that failed.
    ///
    /// # Returns
    /// Records the session still owned, whose blobs the caller must reclaim.
    pub fn fail_merge(&self, taken: &TakenChunks) -> Vec<ChunkRecord> {
        self.finish_handle(&taken.handle, SessionState::Failed)
    }

    /// Abandon an open session on request.
    ///
    /// # Returns
    /// The session's records, whose blobs the caller must reclaim.
    pub fn abort(&self, id: &SessionId) -> Result<Vec<ChunkRecord>> {
        let handle = self
            .get(id)
            .ok_or_else(|| Error::not_found("upload session", id))?;

        let records = {
            let mut session = handle.inner.lock();
            if session.state != SessionState::Open {
                return Err(Error::SessionClosed(id.to_string()));
            }
            session.close(SessionState::Failed)
        };
        self.sessions.remove_if(id, |_, current| current.is_same(&handle));

        tracing::info!(session = %id, chunks = records.len(), "Aborted upload session");
        Ok(records)
    }

    fn finish_handle(&self, handle: &SessionHandle, state: SessionState) -> Vec<ChunkRecord> {
        let records = handle.inner.lock().close(state);
        self.sessions.remove_if(&handle.id, |_, current| current.is_same(handle));
        records
    }

    /// Abandon sessions that have made no progress for longer than the
    /// timeout.
    ///
    /// Covers open sessions waiting for chunks and merges that stopped
    /// advancing. A merge refreshes its session after every chunk it writes.
    ///
    /// # Returns
    /// Each abandoned session with the records whose blobs must be reclaimed.
    pub fn reap_idle(&self, now: DateTime<Utc>) -> Vec<(SessionId, Vec<ChunkRecord>)> {
        let timeout = chrono::Duration::from_std(self.idle_timeout)
            .unwrap_or_else(|_| chrono::Duration::hours(1));

        let mut reaped = Vec::new();
        self.sessions.retain(|id, handle| {
            let mut session = handle.inner.lock();
            let idle = now - session.last_activity;
            let stalled = matches!(session.state, SessionState::Open | SessionState::Merging);
            if stalled && idle > timeout {
                tracing::warn!(
                    session = %id,
                    state = ?session.state,
                    received = session.chunks.len(),
                    total_chunks = session.total_chunks,
                    idle_secs = idle.num_seconds(),
                    "Abandoned idle upload session"
                );
                reaped.push((id.clone(), session.close(SessionState::Failed)));
                false
            } else {
                true
            }
        });
        reaped
    }

    /// List all tracked sessions, oldest first.
    pub fn snapshot(&self) -> Vec<SessionSummary> {
        let handles: Vec<SessionHandle> = self
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        let mut summaries: Vec<SessionSummary> = handles.iter().map(SessionHandle::summary).collect();
        summaries.sort_by_key(|s| s.created_at);
        summaries
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Default for UploadRegistry {
    fn default() -> Self {
        Self::new(Duration::from_secs(60 * 60))
    }
}

/// Delete the blobs of sessions removed from the registry.
pub async fn reclaim_chunks(store: &dyn ChunkStore, session: &SessionId, records: &[ChunkRecord]) {
    for record in records {
        if let Err(e) = store.remove(record).await {
            tracing::warn!(session = %session, index = record.index, error = %e, "Failed to reclaim chunk");
        }
    }
    store.release_session(session).await;
}

/// Start a background task that abandons idle sessions and reclaims their
/// storage.
///
/// # Returns
/// A join handle for the background task.
pub fn start_reaper_task(
    registry: UploadRegistry,
    store: Arc<dyn ChunkStore>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            let reaped = registry.reap_idle(Utc::now());
            for (session, records) in &reaped {
                reclaim_chunks(store.as_ref(), session, records).await;
            }
            if !reaped.is_empty() {
                tracing::debug!(reaped = reaped.len(), "Reclaimed idle upload sessions");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::path::PathBuf;

    fn sid(name: &str) -> SessionId {
        SessionId::parse(name).unwrap()
    }

    fn record(index: u64) -> ChunkRecord {
        ChunkRecord {
            index,
            location: PathBuf::from(format!("/scratch/{index}.chunk")),
            byte_size: 10,
            received_at: Utc::now(),
        }
    }

    #[test]
    fn get_or_create_is_lazy_and_stable() {
        let registry = UploadRegistry::default();
        assert!(registry.is_empty());

        let a = registry.get_or_create(&sid("a.mp4"), 3).unwrap();
        let b = registry.get_or_create(&sid("a.mp4"), 3).unwrap();
        assert!(a.is_same(&b));
        assert_eq!(registry.len(), 1);
        assert_eq!(a.total_chunks(), 3);
        assert_eq!(a.state(), SessionState::Open);
    }

    #[test]
    fn mismatched_total_is_rejected() {
        let registry = UploadRegistry::default();
        registry.get_or_create(&sid("a.mp4"), 3).unwrap();
        assert_matches!(
            registry.get_or_create(&sid("a.mp4"), 4),
            Err(Error::InvalidArgument(_))
        );
    }

    #[test]
    fn zero_total_is_rejected() {
        let registry = UploadRegistry::default();
        assert_matches!(
            registry.get_or_create(&sid("a.mp4"), 0),
            Err(Error::InvalidArgument(_))
        );
        assert!(registry.is_empty());
    }

    #[test]
    fn ready_to_merge_fires_once_on_completion() {
        let registry = UploadRegistry::default();
        let id = sid("a.mp4");
        registry.get_or_create(&id, 3).unwrap();

        let r = registry.record_chunk(&id, 2, record(2)).unwrap();
        assert_eq!(r.outcome, ChunkOutcome::StillOpen);
        assert_eq!(r.received, 1);

        let r = registry.record_chunk(&id, 0, record(0)).unwrap();
        assert_eq!(r.outcome, ChunkOutcome::StillOpen);

        let r = registry.record_chunk(&id, 1, record(1)).unwrap();
        assert_eq!(r.outcome, ChunkOutcome::ReadyToMerge);
        assert_eq!(r.received, 3);

        // A retry of the last chunk after completion must not re-trigger.
        let r = registry.record_chunk(&id, 1, record(1)).unwrap();
        assert_eq!(r.outcome, ChunkOutcome::StillOpen);
        assert!(r.superseded.is_some());
    }

    #[test]
    fn redelivery_replaces_without_counting_twice() {
        let registry = UploadRegistry::default();
        let id = sid("a.mp4");
        registry.get_or_create(&id, 2).unwrap();

        let first = registry.record_chunk(&id, 0, record(0)).unwrap();
        assert!(first.superseded.is_none());

        let mut newer = record(0);
        newer.location = PathBuf::from("/scratch/0-retry.chunk");
        let second = registry.record_chunk(&id, 0, newer).unwrap();
        assert_eq!(second.received, 1);
        assert_eq!(second.outcome, ChunkOutcome::StillOpen);
        assert_eq!(second.superseded.unwrap().location, PathBuf::from("/scratch/0.chunk"));
    }

    #[test]
    fn out_of_range_leaves_state_untouched() {
        let registry = UploadRegistry::default();
        let id = sid("a.mp4");
        registry.get_or_create(&id, 2).unwrap();

        assert_matches!(
            registry.record_chunk(&id, 2, record(2)),
            Err(Error::OutOfRange { index: 2, total: 2 })
        );
        let summary = &registry.snapshot()[0];
        assert_eq!(summary.received_chunks, 0);
        assert_eq!(summary.state, SessionState::Open);
    }

    #[test]
    fn take_for_merge_is_exclusive_and_ordered() {
        let registry = UploadRegistry::default();
        let id = sid("a.mp4");
        registry.get_or_create(&id, 3).unwrap();
        for index in [2, 0, 1] {
            registry.record_chunk(&id, index, record(index)).unwrap();
        }

        let taken = registry.take_for_merge(&id).unwrap();
        assert_eq!(taken.total_chunks, 3);
        let order: Vec<u64> = taken.records.iter().map(|r| r.index).collect();
        assert_eq!(order, vec![0, 1, 2]);

        assert_matches!(registry.take_for_merge(&id), Err(Error::AlreadyMerging(_)));
    }

    #[test]
    fn chunks_after_merge_started_are_refused() {
        let registry = UploadRegistry::default();
        let id = sid("a.mp4");
        let handle = registry.get_or_create(&id, 1).unwrap();
        registry.record_chunk(&id, 0, record(0)).unwrap();
        let taken = registry.take_for_merge(&id).unwrap();

        assert_matches!(handle.record_chunk(0, record(0)), Err(Error::SessionClosed(_)));
        assert_matches!(registry.get_or_create(&id, 1), Err(Error::SessionClosed(_)));

        registry.complete_merge(&taken);
        assert!(registry.is_empty());
        assert_matches!(handle.record_chunk(0, record(0)), Err(Error::SessionClosed(_)));
        assert_eq!(handle.state(), SessionState::Merged);
    }

    #[test]
    fn failed_merge_returns_outstanding_records() {
        let registry = UploadRegistry::default();
        let id = sid("a.mp4");
        registry.get_or_create(&id, 1).unwrap();
        registry.record_chunk(&id, 0, record(0)).unwrap();
        let taken = registry.take_for_merge(&id).unwrap();

        let leftovers = registry.fail_merge(&taken);
        assert_eq!(leftovers.len(), 1);
        assert!(registry.get(&id).is_none());
    }

    #[test]
    fn removed_session_name_can_be_reused() {
        let registry = UploadRegistry::default();
        let id = sid("a.mp4");
        let old = registry.get_or_create(&id, 1).unwrap();
        registry.abort(&id).unwrap();
        assert_eq!(old.state(), SessionState::Failed);

        let fresh = registry.get_or_create(&id, 2).unwrap();
        assert!(!fresh.is_same(&old));
        assert_eq!(fresh.total_chunks(), 2);

        registry.abort(&id).unwrap();
        assert!(registry.get(&id).is_none());
        assert_eq!(fresh.state(), SessionState::Failed);
    }

    #[test]
    fn abort_refuses_merging_session() {
        let registry = UploadRegistry::default();
        let id = sid("a.mp4");
        registry.get_or_create(&id, 1).unwrap();
        registry.record_chunk(&id, 0, record(0)).unwrap();
        registry.take_for_merge(&id).unwrap();

        assert_matches!(registry.abort(&id), Err(Error::SessionClosed(_)));
        assert_matches!(registry.abort(&sid("other.mp4")), Err(Error::NotFound { .. }));
    }

    #[test]
    fn reap_idle_abandons_stale_sessions_and_stalled_merges() {
        let registry = UploadRegistry::new(Duration::from_secs(60));
        let idle = sid("idle.mp4");
        let merging = sid("merging.mp4");
        registry.get_or_create(&idle, 2).unwrap();
        registry.record_chunk(&idle, 0, record(0)).unwrap();
        registry.get_or_create(&merging, 1).unwrap();
        registry.record_chunk(&merging, 0, record(0)).unwrap();
        registry.take_for_merge(&merging).unwrap();

        assert!(registry.reap_idle(Utc::now()).is_empty());

        let later = Utc::now() + chrono::Duration::seconds(120);
        let mut reaped = registry.reap_idle(later);
        reaped.sort_by(|a, b| a.0.as_str().cmp(b.0.as_str()));
        assert_eq!(reaped.len(), 2);
        assert_eq!(reaped[0].0, idle);
        assert_eq!(reaped[0].1.len(), 1);
        // The stalled merge still hands back its blobs for reclaiming.
        assert_eq!(reaped[1].0, merging);
        assert_eq!(reaped[1].1.len(), 1);
        assert!(registry.is_empty());

        // The name is free again.
        assert!(registry.get_or_create(&merging, 1).is_ok());
    }

    #[test]
    fn settling_a_reaped_merge_leaves_the_new_session_alone() {
        let registry = UploadRegistry::new(Duration::from_secs(60));
        let id = sid("a.mp4");
        registry.get_or_create(&id, 1).unwrap();
        registry.record_chunk(&id, 0, record(0)).unwrap();
        let taken = registry.take_for_merge(&id).unwrap();

        registry.reap_idle(Utc::now() + chrono::Duration::seconds(120));
        let fresh = registry.get_or_create(&id, 2).unwrap();

        assert!(registry.fail_merge(&taken).is_empty());
        registry.complete_merge(&taken);
        assert_eq!(fresh.state(), SessionState::Open);
        assert!(registry.get(&id).unwrap().is_same(&fresh));
    }

    #[test]
    fn check_accepting_never_creates() {
        let registry = UploadRegistry::default();
        let id = sid("a.mp4");
        registry.check_accepting(&id, 3).unwrap();
        assert!(registry.is_empty());

        registry.get_or_create(&id, 3).unwrap();
        assert_matches!(registry.check_accepting(&id, 4), Err(Error::InvalidArgument(_)));
        registry.take_for_merge(&id).unwrap();
        assert_matches!(registry.check_accepting(&id, 3), Err(Error::SessionClosed(_)));
    }

    #[test]
    fn concurrent_last_chunk_signals_exactly_once() {
        let registry = UploadRegistry::default();
        let id = sid("race.mp4");
        registry.get_or_create(&id, 2).unwrap();
        registry.record_chunk(&id, 0, record(0)).unwrap();

        let winners: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..16)
                .map(|_| {
                    let registry = registry.clone();
                    let id = id.clone();
                    scope.spawn(move || registry.record_chunk(&id, 1, record(1)).unwrap().outcome)
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|o| *o == ChunkOutcome::ReadyToMerge)
                .count()
        });
        assert_eq!(winners, 1);
    }
}
