use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_core::Stream;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::layout::ChunkLayout;
use crate::{GridError, GridResult};

/// Stream of bytes for object content
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send>>;

/// Identifier of a stored object (the `files` record and its sub-chunks)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileId(pub String);

impl FileId {
    /// Generate a new random file ID
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create from existing string
    pub fn from_string(id: String) -> Self {
        Self(id)
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for FileId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for FileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for FileId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Unique identifier for an upload session
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    /// Generate a new random session ID
    pub fn new() -> Self {
        Self(format!("ups_{}", Uuid::new_v4().simple()))
    }

    /// Create from existing string
    pub fn from_string(id: String) -> Self {
        Self(id)
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Lower-cased hex SHA-256 digest of a complete object
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FileHash(String);

impl FileHash {
    /// Hex length of a SHA-256 digest
    pub const HEX_LEN: usize = 64;

    /// Parse and case-normalize a client supplied digest
    pub fn parse(value: &str) -> GridResult<Self> {
        let trimmed = value.trim();
        if trimmed.len() != Self::HEX_LEN || !trimmed.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(GridError::invalid(format!(
                "file hash must be {} hex characters, got {:?}",
                Self::HEX_LEN,
                value
            )));
        }
        Ok(Self(trimmed.to_ascii_lowercase()))
    }

    /// Wrap a digest produced by this crate's own hasher (already lowercase hex)
    pub(crate) fn from_digest(hex: String) -> Self {
        Self(hex)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for FileHash {
    type Err = GridError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for FileHash {
    type Error = GridError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<FileHash> for String {
    fn from(hash: FileHash) -> Self {
        hash.0
    }
}

impl std::fmt::Display for FileHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Context for grid operations (tenant, actor, request and cancellation)
#[derive(Debug, Clone)]
pub struct GridCtx {
    pub tenant_id: String,
    pub actor_id: Option<String>,
    pub request_id: String,
    pub cancel: CancellationToken,
}

impl GridCtx {
    pub fn new(tenant_id: String) -> Self {
        Self {
            tenant_id,
            actor_id: None,
            request_id: Uuid::new_v4().to_string(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_actor(mut self, actor_id: String) -> Self {
        self.actor_id = Some(actor_id);
        self
    }

    pub fn with_request_id(mut self, request_id: String) -> Self {
        self.request_id = request_id;
        self
    }

    /// Tie this context to a caller-owned cancellation signal
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Drive `fut` to completion unless the context is cancelled first.
    pub async fn run<F, T>(&self, fut: F) -> GridResult<T>
    where
        F: Future<Output = GridResult<T>>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(GridError::Cancelled),
            result = fut => result,
        }
    }
}

/// Request to open an upload session
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub filename: String,
    pub total_size: u64,
    pub file_hash: Option<String>,
    pub content_type: Option<String>,
    pub chunk_size: Option<u64>,
    pub ttl: Option<Duration>,
    pub attributes: serde_json::Value,
}

impl SessionRequest {
    pub fn new<S: Into<String>>(filename: S, total_size: u64) -> Self {
        Self {
            filename: filename.into(),
            total_size,
            file_hash: None,
            content_type: None,
            chunk_size: None,
            ttl: None,
            attributes: serde_json::Value::Null,
        }
    }

    pub fn with_file_hash<S: Into<String>>(mut self, hash: S) -> Self {
        self.file_hash = Some(hash.into());
        self
    }

    pub fn with_content_type<S: Into<String>>(mut self, content_type: S) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = Some(chunk_size);
        self
    }

    pub fn with_ttl_hours(mut self, hours: u64) -> Self {
        self.ttl = Some(Duration::from_secs(hours * 3600));
        self
    }

    pub fn with_attribute<K: Into<String>, V: serde::Serialize>(mut self, key: K, value: V) -> Self {
        if self.attributes.is_null() {
            self.attributes = serde_json::Value::Object(serde_json::Map::new());
        }
        if let Some(obj) = self.attributes.as_object_mut() {
            obj.insert(key.into(), serde_json::to_value(value).unwrap_or(serde_json::Value::Null));
        }
        self
    }
}

/// Status of an upload session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UploadStatus {
    InProgress,
    Completed,
    Cancelled,
    Expired,
}

impl UploadStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::InProgress)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "InProgress",
            Self::Completed => "Completed",
            Self::Cancelled => "Cancelled",
            Self::Expired => "Expired",
        }
    }
}

impl std::fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Upload session document
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadSession {
    pub session_id: SessionId,
    pub tenant_id: String,
    pub filename: String,
    pub content_type: Option<String>,

    pub total_size: u64,
    pub chunk_size: u64,
    pub standard_chunk_size: u64,

    pub uploaded_chunks: BTreeSet<u64>,
    pub uploaded_size: u64,

    pub file_hash: Option<FileHash>,
    pub file_id: FileId,
    pub status: UploadStatus,
    pub attributes: serde_json::Value,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// `None` pins the session forever (completed sessions)
    pub expires_at: Option<DateTime<Utc>>,
}

impl UploadSession {
    pub fn layout(&self) -> ChunkLayout {
        ChunkLayout::new(self.total_size, self.chunk_size, self.standard_chunk_size)
    }

    pub fn total_chunks(&self) -> u64 {
        self.layout().total_chunks()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    pub fn is_in_progress(&self) -> bool {
        self.status == UploadStatus::InProgress
    }

    pub fn progress(&self) -> UploadProgress {
        let total_chunks = self.total_chunks();
        let missing_chunks = (0..total_chunks)
            .filter(|i| !self.uploaded_chunks.contains(i))
            .collect();
        let percent = if self.total_size == 0 {
            0.0
        } else {
            (self.uploaded_size.min(self.total_size) as f64 / self.total_size as f64) * 100.0
        };
        UploadProgress {
            uploaded_chunks: self.uploaded_chunks.len() as u64,
            total_chunks,
            uploaded_size: self.uploaded_size,
            total_size: self.total_size,
            missing_chunks,
            percent,
        }
    }
}

/// Progress snapshot used to drive a resume
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadProgress {
    pub uploaded_chunks: u64,
    pub total_chunks: u64,
    pub uploaded_size: u64,
    pub total_size: u64,
    pub missing_chunks: Vec<u64>,
    pub percent: f64,
}

/// Metadata attached to a stored object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMetadata {
    pub file_hash: FileHash,
    pub ref_count: i64,
    pub tenant_id: String,
    pub session_id: Option<SessionId>,
    pub attributes: serde_json::Value,
}

/// The `files` record: one per distinct content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredObject {
    pub id: FileId,
    pub length: u64,
    pub chunk_size: u64,
    pub filename: String,
    pub content_type: Option<String>,
    pub upload_date: DateTime<Utc>,
    pub metadata: ObjectMetadata,
}

/// A fixed-size block of object data, keyed by `(files_id, n)`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubChunk {
    pub files_id: FileId,
    pub n: u64,
    pub data: Bytes,
}

/// Outcome of writing one client chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkWrite {
    /// Every sub-chunk was inserted by this call
    Written,
    /// At least one sub-chunk was already present (retry or concurrent writer)
    AlreadyExists,
}

/// Byte range for partial content requests
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: Option<u64>, // None means "to end of object"
}

impl ByteRange {
    pub fn new(start: u64, end: Option<u64>) -> Self {
        Self { start, end }
    }

    pub fn from_start(start: u64) -> Self {
        Self { start, end: None }
    }

    pub fn length(&self, total_size: u64) -> u64 {
        match self.end {
            Some(end) => end.min(total_size.saturating_sub(1)).saturating_sub(self.start) + 1,
            None => total_size.saturating_sub(self.start),
        }
    }

    pub fn is_valid(&self, total_size: u64) -> bool {
        if self.start >= total_size {
            return false;
        }
        match self.end {
            Some(end) => end >= self.start,
            None => true,
        }
    }
}
