use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::chunks::ChunkStoreAdapter;
use crate::layout::ChunkLayout;
use crate::refs::ObjectRefs;
use crate::store::GridStore;
use crate::upload::{CompleteOutcome, TransitionOutcome, UploadSessionStore};
use crate::{
    FileHash, FileId, GridConfig, GridCtx, GridError, GridResult, SessionId, SessionRequest,
    UploadProgress, UploadSession, UploadStatus,
};

/// Owns session documents: creation (including instant dedup), progress,
/// completion, cancellation and expiry.
#[derive(Clone)]
pub struct UploadSessionManager {
    store: Arc<dyn GridStore>,
    sessions: Arc<dyn UploadSessionStore>,
    chunks: ChunkStoreAdapter,
    refs: ObjectRefs,
    config: GridConfig,
}

impl UploadSessionManager {
    pub fn new(
        store: Arc<dyn GridStore>,
        sessions: Arc<dyn UploadSessionStore>,
        config: GridConfig,
    ) -> Self {
        Self {
            chunks: ChunkStoreAdapter::new(store.clone(), config.standard_chunk_size),
            refs: ObjectRefs::new(store.clone()),
            store,
            sessions,
            config,
        }
    }

    pub fn config(&self) -> &GridConfig {
        &self.config
    }

    /// Chunk size for a new session: the caller's override or the tier default
    pub fn resolve_chunk_size(&self, total_size: u64, requested: Option<u64>) -> GridResult<u64> {
        let chunk_size =
            requested.unwrap_or_else(|| self.config.chunk_size_tiers.chunk_size_for(total_size));
        ChunkLayout::validate_chunk_size(chunk_size, self.config.standard_chunk_size)?;
        Ok(chunk_size)
    }

    /// Open a session, or complete it instantly when the content already exists
    #[instrument(skip(self, ctx, request), fields(tenant_id = %ctx.tenant_id, filename = %request.filename))]
    pub async fn create_session(
        &self,
        ctx: &GridCtx,
        request: SessionRequest,
    ) -> GridResult<UploadSession> {
        if request.filename.trim().is_empty() {
            return Err(GridError::invalid("filename is required"));
        }
        if request.total_size == 0 {
            return Err(GridError::invalid("total size must be greater than zero"));
        }
        if request.total_size > self.config.max_file_bytes {
            return Err(GridError::invalid(format!(
                "total size {} exceeds the {} byte limit",
                request.total_size, self.config.max_file_bytes
            )));
        }
        let chunk_size = self.resolve_chunk_size(request.total_size, request.chunk_size)?;
        let file_hash = request.file_hash.as_deref().map(FileHash::parse).transpose()?;

        let now = Utc::now();
        let ttl = request.ttl.unwrap_or(self.config.session_ttl);
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|_| GridError::invalid("session ttl is out of range"))?;

        let mut session = UploadSession {
            session_id: SessionId::new(),
            tenant_id: ctx.tenant_id.clone(),
            filename: request.filename,
            content_type: request.content_type,
            total_size: request.total_size,
            chunk_size,
            standard_chunk_size: self.config.standard_chunk_size,
            uploaded_chunks: BTreeSet::new(),
            uploaded_size: 0,
            file_hash,
            file_id: FileId::new(),
            status: UploadStatus::InProgress,
            attributes: request.attributes,
            created_at: now,
            updated_at: now,
            expires_at: Some(now + ttl),
        };

        if let Some(hash) = &session.file_hash {
            if let Some(existing) = self.store.find_file_by_hash(hash).await? {
                if self.refs.acquire(&existing.id).await?.is_some() {
                    info!(file_id = %existing.id, "instant upload: content already stored");
                    session.file_id = existing.id;
                    session.status = UploadStatus::Completed;
                    session.uploaded_chunks = (0..session.total_chunks()).collect();
                    session.uploaded_size = session.total_size;
                    session.expires_at = None;
                }
            }
        }

        let session = self.sessions.create(session).await?;
        debug!(session_id = %session.session_id, status = %session.status, "session created");
        Ok(session)
    }

    /// Session by id; `None` when absent or expired
    pub async fn get_session(&self, session_id: &SessionId) -> GridResult<Option<UploadSession>> {
        let now = Utc::now();
        Ok(self
            .sessions
            .get(session_id)
            .await?
            .filter(|s| s.status != UploadStatus::Expired && !s.is_expired(now)))
    }

    /// Session by id for `ctx`'s tenant, or `SessionNotFound`
    pub async fn fetch(&self, ctx: &GridCtx, session_id: &SessionId) -> GridResult<UploadSession> {
        self.sessions
            .get(session_id)
            .await?
            .filter(|s| s.tenant_id == ctx.tenant_id)
            .ok_or_else(|| GridError::session_not_found(session_id.as_str()))
    }

    /// Record a persisted chunk; a no-op when it was already counted
    pub async fn record_chunk(
        &self,
        session_id: &SessionId,
        chunk_number: u64,
        byte_length: u64,
    ) -> GridResult<bool> {
        self.sessions
            .record_chunk(session_id, chunk_number, byte_length, Utc::now())
            .await
    }

    /// Mark the session completed against `file_id`
    pub async fn complete_session(
        &self,
        session_id: &SessionId,
        file_id: &FileId,
        file_hash: &FileHash,
    ) -> GridResult<CompleteOutcome> {
        self.sessions
            .complete(session_id, file_id, file_hash, Utc::now())
            .await
    }

    /// Abort an upload and discard its data.
    ///
    /// Cancelling an already cancelled or expired session succeeds again;
    /// a completed session cannot be cancelled.
    #[instrument(skip(self, ctx), fields(tenant_id = %ctx.tenant_id))]
    pub async fn cancel_session(
        &self,
        ctx: &GridCtx,
        session_id: &SessionId,
        hard_delete: bool,
    ) -> GridResult<()> {
        let session = self.fetch(ctx, session_id).await?;
        match self
            .sessions
            .transition(session_id, UploadStatus::Cancelled, Utc::now())
            .await?
        {
            TransitionOutcome::Applied => self.discard_target(&session).await?,
            TransitionOutcome::Rejected(UploadStatus::Completed) => {
                return Err(GridError::not_in_progress(session_id.as_str(), UploadStatus::Completed));
            }
            TransitionOutcome::Rejected(status) => {
                // references were released by the cancel that applied the transition
                debug!(%status, "session already terminal");
                if self.store.get_file(&session.file_id).await?.is_none() {
                    self.chunks.cleanup_temp_data(&session.file_id).await?;
                }
            }
            TransitionOutcome::Missing => {
                return Err(GridError::session_not_found(session_id.as_str()));
            }
        }

        if hard_delete {
            self.sessions.delete(session_id).await?;
        }
        info!(hard_delete, "upload cancelled");
        Ok(())
    }

    /// Move stale in-progress sessions to `Expired` and drop their chunks
    #[instrument(skip(self))]
    pub async fn expire_stale(&self) -> GridResult<Vec<SessionId>> {
        let now = Utc::now();
        let mut expired = Vec::new();
        for session in self.sessions.list_stale(now).await? {
            match self
                .sessions
                .transition(&session.session_id, UploadStatus::Expired, now)
                .await?
            {
                TransitionOutcome::Applied => {
                    if let Err(e) = self.discard_target(&session).await {
                        warn!(session_id = %session.session_id, error = %e, "failed to clean up expired session");
                        continue;
                    }
                    expired.push(session.session_id);
                }
                other => debug!(session_id = %session.session_id, ?other, "skipped stale session"),
            }
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "expired stale upload sessions");
        }
        Ok(expired)
    }

    /// Progress of a session, for resumption
    pub async fn progress(&self, ctx: &GridCtx, session_id: &SessionId) -> GridResult<UploadProgress> {
        Ok(self.fetch(ctx, session_id).await?.progress())
    }

    /// Drop whatever an abandoned session wrote. A `files` record under the
    /// session's own id means an earlier finalize published it, so the
    /// session's reference is released instead of deleting data others may share.
    async fn discard_target(&self, session: &UploadSession) -> GridResult<()> {
        match self.store.get_file(&session.file_id).await? {
            Some(file) if file.metadata.session_id.as_ref() == Some(&session.session_id) => {
                self.refs.release(&session.file_id).await?;
            }
            Some(_) => {}
            None => {
                self.chunks.cleanup_temp_data(&session.file_id).await?;
            }
        }
        Ok(())
    }
}
