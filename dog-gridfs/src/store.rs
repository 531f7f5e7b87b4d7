use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use regex::Regex;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::{FileHash, FileId, GridResult, StoredObject, SubChunk};

/// Backing document store: the `files` and `chunks` collections.
///
/// Implementations must enforce two unique indexes: `(files_id, n)` on chunks
/// and `metadata.fileHash` on files. Violations are reported through the
/// tagged results below, never as errors.
#[async_trait]
pub trait GridStore: Send + Sync {
    /// Insert sub-chunks without stopping at the first duplicate key
    async fn insert_chunks(&self, chunks: Vec<SubChunk>) -> GridResult<ChunkInsert>;

    /// Whether sub-chunk `n` of `files_id` exists
    async fn chunk_exists(&self, files_id: &FileId, n: u64) -> GridResult<bool>;

    /// Sub-chunk indices present for `files_id`, ascending
    async fn chunk_indices(&self, files_id: &FileId) -> GridResult<Vec<u64>>;

    /// Payload of sub-chunk `n`
    async fn read_chunk(&self, files_id: &FileId, n: u64) -> GridResult<Option<Bytes>>;

    /// Delete every sub-chunk of `files_id`, returning how many were removed
    async fn delete_chunks(&self, files_id: &FileId) -> GridResult<u64>;

    /// Distinct `files_id` values present in the chunks collection
    async fn chunk_file_ids(&self) -> GridResult<Vec<FileId>>;

    /// Insert a `files` record
    async fn insert_file(&self, file: StoredObject) -> GridResult<FileInsert>;

    async fn get_file(&self, id: &FileId) -> GridResult<Option<StoredObject>>;

    async fn find_file_by_hash(&self, hash: &FileHash) -> GridResult<Option<StoredObject>>;

    /// Atomically add `delta` to `metadata.refCount`, returning the new value
    async fn adjust_ref_count(&self, id: &FileId, delta: i64) -> GridResult<Option<i64>>;

    /// Atomically increment `metadata.refCount` only while it is positive,
    /// returning the new value. `None` when the record is missing or already
    /// released by its last owner.
    async fn acquire_ref(&self, id: &FileId) -> GridResult<Option<i64>>;

    /// Delete a `files` record (not its chunks), only while its `refCount`
    /// is zero or below
    async fn delete_file_if_unreferenced(&self, id: &FileId) -> GridResult<bool>;

    async fn list_files(&self, filter: &FileFilter) -> GridResult<Vec<StoredObject>>;

    /// Create an index if it does not exist yet
    async fn ensure_index(&self, index: IndexSpec) -> GridResult<()>;

    async fn indexes(&self) -> GridResult<Vec<IndexSpec>>;
}

/// Result of an unordered bulk insert of sub-chunks
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkInsert {
    pub inserted: u64,
    /// Sub-chunk indices rejected by the `(files_id, n)` unique index
    pub duplicates: Vec<u64>,
}

impl ChunkInsert {
    pub fn has_duplicates(&self) -> bool {
        !self.duplicates.is_empty()
    }
}

/// Result of inserting a `files` record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileInsert {
    Inserted,
    /// Another object already holds this content hash
    DuplicateHash(FileId),
    /// A record with the same id already exists
    DuplicateId,
}

/// Collections known to the grid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    Files,
    Chunks,
    Sessions,
}

/// Index definition, including TTL indexes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSpec {
    pub collection: Collection,
    pub name: String,
    pub keys: Vec<String>,
    pub unique: bool,
    pub expire_after: Option<Duration>,
}

impl IndexSpec {
    pub fn new<S: Into<String>>(collection: Collection, name: S, keys: &[&str]) -> Self {
        Self {
            collection,
            name: name.into(),
            keys: keys.iter().map(|k| k.to_string()).collect(),
            unique: false,
            expire_after: None,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn with_ttl(mut self, expire_after: Duration) -> Self {
        self.expire_after = Some(expire_after);
        self
    }
}

/// Query over the `files` collection
#[derive(Debug, Clone, Default)]
pub struct FileFilter {
    pub uploaded_before: Option<DateTime<Utc>>,
    pub filename_pattern: Option<Regex>,
    /// Equality match on `metadata.attributes.<key>`
    pub attributes: BTreeMap<String, serde_json::Value>,
    pub tenant_id: Option<String>,
}

impl FileFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn uploaded_before(mut self, at: DateTime<Utc>) -> Self {
        self.uploaded_before = Some(at);
        self
    }

    pub fn with_filename_pattern(mut self, pattern: Regex) -> Self {
        self.filename_pattern = Some(pattern);
        self
    }

    pub fn with_attribute<K: Into<String>>(mut self, key: K, value: serde_json::Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    pub fn for_tenant<S: Into<String>>(mut self, tenant_id: S) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn matches(&self, file: &StoredObject) -> bool {
        if let Some(before) = self.uploaded_before {
            if file.upload_date >= before {
                return false;
            }
        }
        if let Some(pattern) = &self.filename_pattern {
            if !pattern.is_match(&file.filename) {
                return false;
            }
        }
        if let Some(tenant) = &self.tenant_id {
            if &file.metadata.tenant_id != tenant {
                return false;
            }
        }
        self.attributes
            .iter()
            .all(|(key, expected)| file.metadata.attributes.get(key) == Some(expected))
    }
}
