use serde::{Deserialize, Serialize};

use crate::range::RangeReader;
use crate::{ByteRange, ChunkWrite, FileHash, FileId, SessionId, StoredObject, UploadSession};

/// Receipt returned by a successful finalize
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileReceipt {
    pub file_id: FileId,
    pub session_id: SessionId,
    pub file_hash: FileHash,
    pub length: u64,
    /// The content was already stored; this session became another owner
    pub deduplicated: bool,
}

impl FileReceipt {
    pub(crate) fn for_session(session: &UploadSession, file_hash: FileHash, deduplicated: bool) -> Self {
        Self {
            file_id: session.file_id.clone(),
            session_id: session.session_id.clone(),
            file_hash,
            length: session.total_size,
            deduplicated,
        }
    }
}

/// Receipt returned for one uploaded chunk
#[derive(Debug, Clone)]
pub struct ChunkReceipt {
    pub chunk_number: u64,
    pub outcome: ChunkWrite,
    /// Session state after the chunk was recorded
    pub session: UploadSession,
}

/// Resolved, inclusive byte range of an object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedRange {
    pub start: u64,
    pub end: u64,
    pub total_size: u64,
}

impl ResolvedRange {
    /// Clamp `range` to an object of `total_size` bytes. `None` when the
    /// range starts past the end or is inverted.
    pub fn resolve(range: &ByteRange, total_size: u64) -> Option<Self> {
        if !range.is_valid(total_size) {
            return None;
        }
        let last = total_size - 1;
        Some(Self {
            start: range.start,
            end: range.end.map_or(last, |end| end.min(last)),
            total_size,
        })
    }

    pub fn content_length(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn is_full_content(&self) -> bool {
        self.start == 0 && self.end + 1 == self.total_size
    }

    /// `Content-Range` header value, e.g. `bytes 100-199/1000`
    pub fn content_range(&self) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, self.total_size)
    }
}

/// A stored object opened for a bounded read
pub struct OpenedRange {
    pub object: StoredObject,
    pub range: ResolvedRange,
    pub reader: RangeReader,
}

impl OpenedRange {
    pub fn total_length(&self) -> u64 {
        self.range.total_size
    }

    /// HTTP status a transport should answer with: 200 for the whole object, 206 otherwise
    pub fn status_code(&self) -> u16 {
        if self.range.is_full_content() {
            200
        } else {
            206
        }
    }
}

/// Result of releasing a batch of objects
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteReport {
    /// Objects that lost an owner but are still referenced
    pub released: Vec<FileId>,
    /// Objects physically removed
    pub deleted: Vec<FileId>,
    pub missing: Vec<FileId>,
}

impl DeleteReport {
    pub fn total(&self) -> usize {
        self.released.len() + self.deleted.len() + self.missing.len()
    }
}
