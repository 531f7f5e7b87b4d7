use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::upload::{CompleteOutcome, TransitionOutcome, UploadSessionStore};
use crate::{FileHash, FileId, GridResult, SessionId, UploadSession, UploadStatus};

#[derive(Default)]
struct SessionState {
    sessions: HashMap<SessionId, UploadSession>,
    ttl: Option<Duration>,
}

/// In-memory upload session store
#[derive(Clone, Default)]
pub struct MemoryUploadSessionStore {
    state: Arc<RwLock<SessionState>>,
}

impl MemoryUploadSessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.state.read().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run `f` against one session document under the write lock
    fn with_session_mut<F, R>(&self, session_id: &SessionId, f: F) -> Option<R>
    where
        F: FnOnce(&mut UploadSession) -> R,
    {
        let mut state = self.state.write();
        state.sessions.get_mut(session_id).map(f)
    }
}

#[async_trait]
impl UploadSessionStore for MemoryUploadSessionStore {
    async fn create(&self, session: UploadSession) -> GridResult<UploadSession> {
        let mut state = self.state.write();
        state.sessions.insert(session.session_id.clone(), session.clone());
        Ok(session)
    }

    async fn get(&self, session_id: &SessionId) -> GridResult<Option<UploadSession>> {
        Ok(self.state.read().sessions.get(session_id).cloned())
    }

    async fn delete(&self, session_id: &SessionId) -> GridResult<bool> {
        Ok(self.state.write().sessions.remove(session_id).is_some())
    }

    async fn record_chunk(
        &self,
        session_id: &SessionId,
        chunk_number: u64,
        byte_length: u64,
        now: DateTime<Utc>,
    ) -> GridResult<bool> {
        let applied = self.with_session_mut(session_id, |session| {
            if !session.is_in_progress() || !session.uploaded_chunks.insert(chunk_number) {
                return false;
            }
            session.uploaded_size += byte_length;
            session.updated_at = now;
            true
        });
        Ok(applied.unwrap_or(false))
    }

    async fn complete(
        &self,
        session_id: &SessionId,
        file_id: &FileId,
        file_hash: &FileHash,
        now: DateTime<Utc>,
    ) -> GridResult<CompleteOutcome> {
        let outcome = self.with_session_mut(session_id, |session| match session.status {
            UploadStatus::InProgress => {
                session.file_id = file_id.clone();
                session.file_hash = Some(file_hash.clone());
                session.status = UploadStatus::Completed;
                session.updated_at = now;
                session.expires_at = None;
                CompleteOutcome::Completed
            }
            UploadStatus::Completed => CompleteOutcome::AlreadyCompleted(session.file_id.clone()),
            other => CompleteOutcome::NotInProgress(other),
        });
        Ok(outcome.unwrap_or(CompleteOutcome::Missing))
    }

    async fn transition(
        &self,
        session_id: &SessionId,
        to: UploadStatus,
        now: DateTime<Utc>,
    ) -> GridResult<TransitionOutcome> {
        let outcome = self.with_session_mut(session_id, |session| {
            if !session.is_in_progress() {
                return TransitionOutcome::Rejected(session.status);
            }
            session.status = to;
            session.updated_at = now;
            TransitionOutcome::Applied
        });
        Ok(outcome.unwrap_or(TransitionOutcome::Missing))
    }

    async fn list_stale(&self, now: DateTime<Utc>) -> GridResult<Vec<UploadSession>> {
        let state = self.state.read();
        let mut stale: Vec<UploadSession> = state
            .sessions
            .values()
            .filter(|s| s.is_in_progress() && s.is_expired(now))
            .cloned()
            .collect();
        stale.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(stale)
    }

    async fn live_file_ids(&self, now: DateTime<Utc>) -> GridResult<Vec<FileId>> {
        let state = self.state.read();
        Ok(state
            .sessions
            .values()
            .filter(|s| s.is_in_progress() && !s.is_expired(now))
            .map(|s| s.file_id.clone())
            .collect())
    }

    async fn ensure_ttl_index(&self, expire_after: Duration) -> GridResult<()> {
        self.state.write().ttl.get_or_insert(expire_after);
        Ok(())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> GridResult<u64> {
        let mut state = self.state.write();
        let Some(ttl) = state.ttl else {
            return Ok(0);
        };
        let grace = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero());
        let before = state.sessions.len();
        state
            .sessions
            .retain(|_, s| s.expires_at.map_or(true, |at| at + grace > now));
        Ok((before - state.sessions.len()) as u64)
    }
}
