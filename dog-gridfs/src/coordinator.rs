use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::chunks::ChunkStoreAdapter;
use crate::hash::{hashes_match, sha256_hex};
use crate::receipt::{ChunkReceipt, DeleteReport, FileReceipt};
use crate::refs::{ObjectRefs, Release};
use crate::sessions::UploadSessionManager;
use crate::store::{FileInsert, GridStore};
use crate::upload::{CompleteOutcome, FinalizeOptions, UploadCoordinator, UploadSessionStore};
use crate::{
    ChunkWrite, FileHash, FileId, GridConfig, GridCtx, GridError, GridResult, ObjectMetadata,
    SessionId, SessionRequest, StoredObject, UploadSession, UploadStatus,
};

const PUBLISH_ATTEMPTS: usize = 3;

/// Default upload coordinator: sub-chunk writes, physical completeness
/// checks, content-hash dedup and reference counting
#[derive(Clone)]
pub struct DefaultUploadCoordinator {
    store: Arc<dyn GridStore>,
    sessions: UploadSessionManager,
    chunks: ChunkStoreAdapter,
    refs: ObjectRefs,
}

impl DefaultUploadCoordinator {
    pub fn new<S, SS>(store: S, sessions: SS, config: GridConfig) -> Self
    where
        S: GridStore + 'static,
        SS: UploadSessionStore + 'static,
    {
        Self::from_shared(Arc::new(store), Arc::new(sessions), config)
    }

    pub fn from_shared(
        store: Arc<dyn GridStore>,
        sessions: Arc<dyn UploadSessionStore>,
        config: GridConfig,
    ) -> Self {
        Self {
            chunks: ChunkStoreAdapter::new(store.clone(), config.standard_chunk_size),
            refs: ObjectRefs::new(store.clone()),
            sessions: UploadSessionManager::new(store.clone(), sessions, config),
            store,
        }
    }

    pub fn sessions(&self) -> &UploadSessionManager {
        &self.sessions
    }

    pub fn chunks(&self) -> &ChunkStoreAdapter {
        &self.chunks
    }

    fn ensure_in_progress(session: &UploadSession) -> GridResult<()> {
        if !session.is_in_progress() {
            return Err(GridError::not_in_progress(session.session_id.as_str(), session.status));
        }
        if session.is_expired(Utc::now()) {
            return Err(GridError::not_in_progress(session.session_id.as_str(), UploadStatus::Expired));
        }
        Ok(())
    }

    async fn upload_chunk_inner(
        &self,
        ctx: &GridCtx,
        session_id: &SessionId,
        chunk_number: u64,
        data: Bytes,
        chunk_hash: &str,
    ) -> GridResult<ChunkReceipt> {
        let session = self.sessions.fetch(ctx, session_id).await?;
        Self::ensure_in_progress(&session)?;

        let layout = session.layout();
        if !layout.contains_chunk(chunk_number) {
            return Err(GridError::invalid(format!(
                "chunk {} is outside 0..{}",
                chunk_number,
                layout.total_chunks()
            )));
        }
        let expected_len = layout.chunk_len(chunk_number);
        if data.len() as u64 != expected_len {
            return Err(GridError::invalid(format!(
                "chunk {} must be {} bytes, got {}",
                chunk_number,
                expected_len,
                data.len()
            )));
        }

        let outcome = if self
            .chunks
            .chunk_is_complete(&session.file_id, &layout, chunk_number)
            .await?
        {
            debug!(chunk_number, "chunk already stored");
            ChunkWrite::AlreadyExists
        } else {
            let actual = sha256_hex(&data);
            if !hashes_match(chunk_hash, &actual) {
                warn!(chunk_number, expected = chunk_hash, %actual, "chunk hash mismatch");
                return Err(GridError::ChunkHashMismatch {
                    chunk_number,
                    expected: chunk_hash.to_string(),
                    actual,
                });
            }
            self.chunks
                .write_chunk(&session.file_id, chunk_number, session.chunk_size, data)
                .await?
        };

        self.sessions
            .record_chunk(session_id, chunk_number, expected_len)
            .await?;
        let session = self.sessions.fetch(ctx, session_id).await?;
        Ok(ChunkReceipt {
            chunk_number,
            outcome,
            session,
        })
    }

    /// Finalize in two phases. Everything up to the first reference taken
    /// honours `ctx` cancellation; from there on the call runs to the
    /// completion CAS so a taken reference is always settled.
    async fn finalize_inner(
        &self,
        ctx: &GridCtx,
        session_id: &SessionId,
        options: FinalizeOptions,
    ) -> GridResult<FileReceipt> {
        let session = ctx.run(self.sessions.fetch(ctx, session_id)).await?;
        if session.status == UploadStatus::Completed {
            debug!("session already completed");
            return self.completed_receipt(&session).await;
        }
        Self::ensure_in_progress(&session)?;

        let expected = match options.file_hash.as_deref() {
            Some(hash) => Some(FileHash::parse(hash)?),
            None => session.file_hash.clone(),
        };

        if let Some(hash) = &expected {
            if let Some(existing) = ctx.run(self.store.find_file_by_hash(hash)).await? {
                if existing.id == session.file_id {
                    debug!("object already published by an earlier attempt");
                    return self.settle(&session, existing.id, hash.clone()).await;
                }
                if self.refs.acquire(&existing.id).await?.is_some() {
                    info!(file_id = %existing.id, "content already stored, skipping reassembly");
                    return self.settle(&session, existing.id, hash.clone()).await;
                }
            }
        }

        let layout = session.layout();
        let missing = ctx
            .run(self.chunks.incomplete_chunks(&session.file_id, &layout))
            .await?;
        if !missing.is_empty() {
            debug!(?missing, "finalize with missing chunks");
            return Err(GridError::IncompleteUpload { missing });
        }

        let hash = match expected {
            Some(hash) if options.skip_hash_validation => hash,
            expected => {
                let digest = ctx.run(self.chunks.compute_full_hash(&session.file_id)).await?;
                if digest.length != session.total_size {
                    warn!(stored = digest.length, declared = session.total_size, "stored length differs");
                    let missing = self.chunks.incomplete_chunks(&session.file_id, &layout).await?;
                    return Err(GridError::IncompleteUpload { missing });
                }
                if let Some(expected) = expected {
                    if expected != digest.hash {
                        warn!(%expected, actual = %digest.hash, "file hash mismatch");
                        return Err(GridError::FileHashMismatch {
                            expected: expected.to_string(),
                            actual: digest.hash.to_string(),
                        });
                    }
                }
                digest.hash
            }
        };
        if ctx.is_cancelled() {
            return Err(GridError::Cancelled);
        }

        let target = self.publish(&session, &hash).await?;
        self.settle(&session, target, hash).await
    }

    /// Insert the `files` record over the session's sub-chunks, or join the
    /// object that already holds this content. Returns the object the
    /// session should point at; a foreign object comes back with one
    /// reference already taken for this session.
    async fn publish(&self, session: &UploadSession, hash: &FileHash) -> GridResult<FileId> {
        let object = StoredObject {
            id: session.file_id.clone(),
            length: session.total_size,
            chunk_size: session.standard_chunk_size,
            filename: session.filename.clone(),
            content_type: session.content_type.clone(),
            upload_date: Utc::now(),
            metadata: ObjectMetadata {
                file_hash: hash.clone(),
                ref_count: 1,
                tenant_id: session.tenant_id.clone(),
                session_id: Some(session.session_id.clone()),
                attributes: session.attributes.clone(),
            },
        };

        for _ in 0..PUBLISH_ATTEMPTS {
            match self.store.insert_file(object.clone()).await? {
                FileInsert::Inserted | FileInsert::DuplicateId => return Ok(session.file_id.clone()),
                FileInsert::DuplicateHash(existing) => {
                    if self.refs.acquire(&existing).await?.is_some() {
                        info!(file_id = %existing, "concurrent upload of the same content won");
                        return Ok(existing);
                    }
                    // its last owner is deleting it; the hash slot frees up once that finishes
                    debug!(file_id = %existing, "existing object is being released");
                    tokio::task::yield_now().await;
                }
            }
        }
        Err(GridError::backend(std::io::Error::other(format!(
            "content {} is held by an object being deleted",
            hash
        ))))
    }

    /// Complete the session against `target`, undoing this call's hold on
    /// `target` if a concurrent finalize or cancel got there first
    async fn settle(&self, session: &UploadSession, target: FileId, hash: FileHash) -> GridResult<FileReceipt> {
        let own = session.file_id.clone();
        let deduplicated = target != own;

        match self
            .sessions
            .complete_session(&session.session_id, &target, &hash)
            .await?
        {
            CompleteOutcome::Completed => {
                if deduplicated {
                    self.chunks.cleanup_temp_data(&own).await?;
                }
                info!(file_id = %target, deduplicated, "upload finalized");
                let mut receipt = FileReceipt::for_session(session, hash, deduplicated);
                receipt.file_id = target;
                Ok(receipt)
            }
            CompleteOutcome::AlreadyCompleted(winner) => {
                if deduplicated || winner != own {
                    self.refs.release(&target).await?;
                }
                debug!(file_id = %winner, "concurrent finalize completed the session first");
                let mut completed = session.clone();
                completed.file_id = winner;
                completed.status = UploadStatus::Completed;
                self.completed_receipt(&completed).await
            }
            CompleteOutcome::NotInProgress(status) => {
                self.refs.release(&target).await?;
                Err(GridError::not_in_progress(session.session_id.as_str(), status))
            }
            CompleteOutcome::Missing => {
                self.refs.release(&target).await?;
                Err(GridError::session_not_found(session.session_id.as_str()))
            }
        }
    }

    async fn completed_receipt(&self, session: &UploadSession) -> GridResult<FileReceipt> {
        let object = self.store.get_file(&session.file_id).await?;
        let hash = match (&session.file_hash, &object) {
            (_, Some(object)) => object.metadata.file_hash.clone(),
            (Some(hash), None) => hash.clone(),
            (None, None) => return Err(GridError::not_found(session.file_id.as_str())),
        };
        let deduplicated = object
            .map(|o| o.metadata.session_id.as_ref() != Some(&session.session_id))
            .unwrap_or(false);
        Ok(FileReceipt::for_session(session, hash, deduplicated))
    }

    async fn delete_objects_inner(&self, ids: &[FileId]) -> GridResult<DeleteReport> {
        let mut report = DeleteReport::default();
        for id in ids {
            match self.refs.release(id).await? {
                Release::Released { .. } => report.released.push(id.clone()),
                Release::Deleted { .. } => report.deleted.push(id.clone()),
                Release::Missing => report.missing.push(id.clone()),
            }
        }
        Ok(report)
    }
}

#[async_trait]
impl UploadCoordinator for DefaultUploadCoordinator {
    async fn create_session(&self, ctx: GridCtx, request: SessionRequest) -> GridResult<UploadSession> {
        ctx.run(self.sessions.create_session(&ctx, request)).await
    }

    #[instrument(skip(self, ctx, data, chunk_hash), fields(tenant_id = %ctx.tenant_id, session_id = %session_id, bytes = data.len()))]
    async fn upload_chunk(
        &self,
        ctx: GridCtx,
        session_id: &SessionId,
        chunk_number: u64,
        data: Bytes,
        chunk_hash: &str,
    ) -> GridResult<ChunkReceipt> {
        ctx.run(self.upload_chunk_inner(&ctx, session_id, chunk_number, data, chunk_hash))
            .await
    }

    #[instrument(skip(self, ctx, options), fields(tenant_id = %ctx.tenant_id, session_id = %session_id))]
    async fn finalize(
        &self,
        ctx: GridCtx,
        session_id: &SessionId,
        options: FinalizeOptions,
    ) -> GridResult<FileReceipt> {
        self.finalize_inner(&ctx, session_id, options).await
    }

    async fn cancel(&self, ctx: GridCtx, session_id: &SessionId, hard_delete: bool) -> GridResult<()> {
        ctx.run(self.sessions.cancel_session(&ctx, session_id, hard_delete))
            .await
    }

    #[instrument(skip(self, ctx, ids), fields(tenant_id = %ctx.tenant_id, count = ids.len()))]
    async fn delete_objects(&self, ctx: GridCtx, ids: &[FileId]) -> GridResult<DeleteReport> {
        ctx.run(self.delete_objects_inner(ids)).await
    }

    async fn get_session(&self, ctx: GridCtx, session_id: &SessionId) -> GridResult<UploadSession> {
        ctx.run(async {
            self.sessions
                .get_session(session_id)
                .await?
                .filter(|s| s.tenant_id == ctx.tenant_id)
                .ok_or_else(|| GridError::session_not_found(session_id.as_str()))
        })
        .await
    }
}
