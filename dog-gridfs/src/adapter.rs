use bytes::Bytes;
use std::sync::Arc;

use crate::gc::{GarbageCollector, GcReaper};
use crate::limiter::ConcurrencyController;
use crate::range::ObjectReader;
use crate::receipt::{ChunkReceipt, DeleteReport, FileReceipt, OpenedRange};
use crate::store::GridStore;
use crate::upload::{FinalizeOptions, UploadCoordinator, UploadSessionStore};
use crate::{
    DefaultUploadCoordinator, FileId, GridConfig, GridCtx, GridResult, SessionId, SessionRequest,
    UploadProgress, UploadSession,
};

/// The grid adapter - what services embed to get resumable uploads,
/// dedup and range reads
pub struct GridAdapter {
    uploads: Arc<dyn UploadCoordinator>,
    limiter: Arc<ConcurrencyController>,
    reader: ObjectReader,
    gc: GarbageCollector,
    config: GridConfig,
}

impl GridAdapter {
    /// Create an adapter over a grid store and a session store
    pub fn new<S, SS>(store: S, sessions: SS, config: GridConfig) -> GridResult<Self>
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
    ) -> GridResult<Self> {
        config.validate()?;
        let coordinator = DefaultUploadCoordinator::from_shared(store.clone(), sessions.clone(), config.clone());
        let gc = GarbageCollector::new(
            store.clone(),
            sessions,
            coordinator.sessions().clone(),
            config.gc.clone(),
        );
        Ok(Self {
            uploads: Arc::new(coordinator),
            limiter: Arc::new(ConcurrencyController::new(config.limits.clone())),
            reader: ObjectReader::new(store),
            gc,
            config,
        })
    }

    /// Replace the upload coordinator
    pub fn with_uploads<U: UploadCoordinator + 'static>(mut self, coordinator: U) -> Self {
        self.uploads = Arc::new(coordinator);
        self
    }

    pub async fn create_session(&self, ctx: GridCtx, request: SessionRequest) -> GridResult<UploadSession> {
        self.uploads.create_session(ctx, request).await
    }

    /// Admit the request (rate window, session slot, chunk slot), then store the chunk
    pub async fn upload_chunk(
        &self,
        ctx: GridCtx,
        session_id: &SessionId,
        chunk_number: u64,
        data: Bytes,
        chunk_hash: &str,
    ) -> GridResult<ChunkReceipt> {
        let _permit = ctx
            .run(self.limiter.admit_chunk(&ctx.tenant_id, session_id))
            .await?;
        self.uploads
            .upload_chunk(ctx, session_id, chunk_number, data, chunk_hash)
            .await
    }

    pub async fn finalize(
        &self,
        ctx: GridCtx,
        session_id: &SessionId,
        options: FinalizeOptions,
    ) -> GridResult<FileReceipt> {
        self.uploads.finalize(ctx, session_id, options).await
    }

    pub async fn cancel(&self, ctx: GridCtx, session_id: &SessionId, hard_delete: bool) -> GridResult<()> {
        self.uploads.cancel(ctx, session_id, hard_delete).await
    }

    pub async fn delete_objects(&self, ctx: GridCtx, ids: &[FileId]) -> GridResult<DeleteReport> {
        self.uploads.delete_objects(ctx, ids).await
    }

    pub async fn get_session(&self, ctx: GridCtx, session_id: &SessionId) -> GridResult<UploadSession> {
        self.uploads.get_session(ctx, session_id).await
    }

    /// Progress of an upload, listing the chunks still missing
    pub async fn progress(&self, ctx: GridCtx, session_id: &SessionId) -> GridResult<UploadProgress> {
        Ok(self.get_session(ctx, session_id).await?.progress())
    }

    /// Open bytes `start..=end` of an object
    pub async fn open_range(
        &self,
        ctx: GridCtx,
        id: &FileId,
        start: u64,
        end: Option<u64>,
    ) -> GridResult<OpenedRange> {
        ctx.run(self.reader.open_range(id, start, end)).await
    }

    /// Open an object for an HTTP-style request with an optional `Range` header
    pub async fn open(&self, ctx: GridCtx, id: &FileId, range_header: Option<&str>) -> GridResult<OpenedRange> {
        ctx.run(self.reader.open(id, range_header)).await
    }

    pub fn gc(&self) -> &GarbageCollector {
        &self.gc
    }

    /// Background sweeper on the configured interval
    pub fn reaper(&self) -> GcReaper {
        GcReaper::new(self.gc.clone())
    }

    pub fn limiter(&self) -> &ConcurrencyController {
        &self.limiter
    }

    pub fn config(&self) -> &GridConfig {
        &self.config
    }
}
