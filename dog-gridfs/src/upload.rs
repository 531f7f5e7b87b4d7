use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::receipt::{ChunkReceipt, DeleteReport, FileReceipt};
use crate::{
    FileHash, FileId, GridCtx, GridResult, SessionId, SessionRequest, UploadSession, UploadStatus,
};

/// Drives resumable uploads from session creation to a published object
#[async_trait]
pub trait UploadCoordinator: Send + Sync {
    /// Open a session (or complete it instantly on a content-hash hit)
    async fn create_session(&self, ctx: GridCtx, request: SessionRequest) -> GridResult<UploadSession>;

    /// Accept one client chunk
    async fn upload_chunk(
        &self,
        ctx: GridCtx,
        session_id: &SessionId,
        chunk_number: u64,
        data: Bytes,
        chunk_hash: &str,
    ) -> GridResult<ChunkReceipt>;

    /// Verify completeness, publish the object and complete the session
    async fn finalize(
        &self,
        ctx: GridCtx,
        session_id: &SessionId,
        options: FinalizeOptions,
    ) -> GridResult<FileReceipt>;

    /// Abort the upload and discard its chunks
    async fn cancel(&self, ctx: GridCtx, session_id: &SessionId, hard_delete: bool) -> GridResult<()>;

    /// Release one owner of each object
    async fn delete_objects(&self, ctx: GridCtx, ids: &[FileId]) -> GridResult<DeleteReport>;

    /// Get upload session status
    async fn get_session(&self, ctx: GridCtx, session_id: &SessionId) -> GridResult<UploadSession>;
}

/// Options for [`UploadCoordinator::finalize`]
#[derive(Debug, Clone, Default)]
pub struct FinalizeOptions {
    /// Expected whole-object hash; falls back to the one given at session creation
    pub file_hash: Option<String>,
    /// Trust the declared hash instead of hashing the stored data
    pub skip_hash_validation: bool,
}

impl FinalizeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file_hash<S: Into<String>>(mut self, hash: S) -> Self {
        self.file_hash = Some(hash.into());
        self
    }

    pub fn skip_hash_validation(mut self) -> Self {
        self.skip_hash_validation = true;
        self
    }
}

/// Storage for upload session documents.
///
/// Every mutation after `create` is a single atomic document update
/// (set-add, increment, compare-and-set); callers never read, modify and
/// write a session back.
#[async_trait]
pub trait UploadSessionStore: Send + Sync {
    /// Persist a new session
    async fn create(&self, session: UploadSession) -> GridResult<UploadSession>;

    /// Get a session by id, regardless of status or expiry
    async fn get(&self, session_id: &SessionId) -> GridResult<Option<UploadSession>>;

    /// Delete a session document
    async fn delete(&self, session_id: &SessionId) -> GridResult<bool>;

    /// Add `chunk_number` to the uploaded set and add `byte_length` to the
    /// uploaded size, only if the chunk was not recorded yet and the session
    /// is still in progress. Returns whether the update applied.
    async fn record_chunk(
        &self,
        session_id: &SessionId,
        chunk_number: u64,
        byte_length: u64,
        now: DateTime<Utc>,
    ) -> GridResult<bool>;

    /// Set file id, hash, `Completed` and pin expiry, iff in progress
    async fn complete(
        &self,
        session_id: &SessionId,
        file_id: &FileId,
        file_hash: &FileHash,
        now: DateTime<Utc>,
    ) -> GridResult<CompleteOutcome>;

    /// Move an in-progress session to `Cancelled` or `Expired`
    async fn transition(
        &self,
        session_id: &SessionId,
        to: UploadStatus,
        now: DateTime<Utc>,
    ) -> GridResult<TransitionOutcome>;

    /// In-progress sessions whose expiry has passed
    async fn list_stale(&self, now: DateTime<Utc>) -> GridResult<Vec<UploadSession>>;

    /// File ids targeted by in-progress, unexpired sessions
    async fn live_file_ids(&self, now: DateTime<Utc>) -> GridResult<Vec<FileId>>;

    /// Provision the TTL index on `expiresAt`
    async fn ensure_ttl_index(&self, expire_after: Duration) -> GridResult<()>;

    /// Remove documents past their TTL (the store's TTL monitor); no-op
    /// until a TTL index exists
    async fn purge_expired(&self, now: DateTime<Utc>) -> GridResult<u64>;
}

/// Outcome of the completion compare-and-set
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompleteOutcome {
    Completed,
    /// A concurrent finalize got there first
    AlreadyCompleted(FileId),
    NotInProgress(UploadStatus),
    Missing,
}

/// Outcome of a status compare-and-set
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionOutcome {
    Applied,
    Rejected(UploadStatus),
    Missing,
}
