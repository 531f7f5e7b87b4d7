use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use crate::store::{ChunkInsert, Collection, FileFilter, FileInsert, GridStore, IndexSpec};
use crate::{FileHash, FileId, GridResult, StoredObject, SubChunk};

#[derive(Default)]
struct GridState {
    files: HashMap<FileId, StoredObject>,
    /// Unique index on `metadata.fileHash`
    by_hash: HashMap<FileHash, FileId>,
    /// Unique index on `(files_id, n)`
    chunks: BTreeMap<(FileId, u64), Bytes>,
    indexes: Vec<IndexSpec>,
}

impl GridState {
    fn remove_file(&mut self, id: &FileId) -> bool {
        match self.files.remove(id) {
            Some(file) => {
                if self.by_hash.get(&file.metadata.file_hash) == Some(id) {
                    self.by_hash.remove(&file.metadata.file_hash);
                }
                true
            }
            None => false,
        }
    }
}

/// In-memory `files` + `chunks` collections for tests and single-node use
#[derive(Clone, Default)]
pub struct MemoryGridStore {
    state: Arc<RwLock<GridState>>,
}

impl MemoryGridStore {
    pub fn new() -> Self {
        let store = Self::default();
        {
            let mut state = store.state.write();
            state.indexes.push(
                IndexSpec::new(Collection::Chunks, "files_id_1_n_1", &["files_id", "n"]).unique(),
            );
            state.indexes.push(
                IndexSpec::new(Collection::Files, "metadata.fileHash_1", &["metadata.fileHash"])
                    .unique(),
            );
        }
        store
    }

    /// Number of sub-chunks physically stored
    pub fn chunk_count(&self) -> usize {
        self.state.read().chunks.len()
    }

    /// Number of sub-chunks stored for one object
    pub fn chunk_count_for(&self, files_id: &FileId) -> usize {
        self.state.read().chunks.range(Self::span(files_id)).count()
    }

    /// Number of `files` records
    pub fn file_count(&self) -> usize {
        self.state.read().files.len()
    }

    fn span(files_id: &FileId) -> std::ops::RangeInclusive<(FileId, u64)> {
        (files_id.clone(), 0)..=(files_id.clone(), u64::MAX)
    }
}

#[async_trait]
impl GridStore for MemoryGridStore {
    async fn insert_chunks(&self, chunks: Vec<SubChunk>) -> GridResult<ChunkInsert> {
        let mut state = self.state.write();
        let mut result = ChunkInsert::default();
        for chunk in chunks {
            let key = (chunk.files_id, chunk.n);
            if state.chunks.contains_key(&key) {
                result.duplicates.push(key.1);
                continue;
            }
            state.chunks.insert(key, chunk.data);
            result.inserted += 1;
        }
        Ok(result)
    }

    async fn chunk_exists(&self, files_id: &FileId, n: u64) -> GridResult<bool> {
        Ok(self.state.read().chunks.contains_key(&(files_id.clone(), n)))
    }

    async fn chunk_indices(&self, files_id: &FileId) -> GridResult<Vec<u64>> {
        let state = self.state.read();
        Ok(state.chunks.range(Self::span(files_id)).map(|((_, n), _)| *n).collect())
    }

    async fn read_chunk(&self, files_id: &FileId, n: u64) -> GridResult<Option<Bytes>> {
        Ok(self.state.read().chunks.get(&(files_id.clone(), n)).cloned())
    }

    async fn delete_chunks(&self, files_id: &FileId) -> GridResult<u64> {
        let mut state = self.state.write();
        let keys: Vec<_> = state.chunks.range(Self::span(files_id)).map(|(k, _)| k.clone()).collect();
        for key in &keys {
            state.chunks.remove(key);
        }
        Ok(keys.len() as u64)
    }

    async fn chunk_file_ids(&self) -> GridResult<Vec<FileId>> {
        let state = self.state.read();
        let ids: BTreeSet<FileId> = state.chunks.keys().map(|(id, _)| id.clone()).collect();
        Ok(ids.into_iter().collect())
    }

    async fn insert_file(&self, file: StoredObject) -> GridResult<FileInsert> {
        let mut state = self.state.write();
        if state.files.contains_key(&file.id) {
            return Ok(FileInsert::DuplicateId);
        }
        if let Some(existing) = state.by_hash.get(&file.metadata.file_hash) {
            return Ok(FileInsert::DuplicateHash(existing.clone()));
        }
        state.by_hash.insert(file.metadata.file_hash.clone(), file.id.clone());
        state.files.insert(file.id.clone(), file);
        Ok(FileInsert::Inserted)
    }

    async fn get_file(&self, id: &FileId) -> GridResult<Option<StoredObject>> {
        Ok(self.state.read().files.get(id).cloned())
    }

    async fn find_file_by_hash(&self, hash: &FileHash) -> GridResult<Option<StoredObject>> {
        let state = self.state.read();
        Ok(state.by_hash.get(hash).and_then(|id| state.files.get(id)).cloned())
    }

    async fn adjust_ref_count(&self, id: &FileId, delta: i64) -> GridResult<Option<i64>> {
        let mut state = self.state.write();
        Ok(state.files.get_mut(id).map(|file| {
            file.metadata.ref_count += delta;
            file.metadata.ref_count
        }))
    }

    async fn acquire_ref(&self, id: &FileId) -> GridResult<Option<i64>> {
        let mut state = self.state.write();
        Ok(state
            .files
            .get_mut(id)
            .filter(|file| file.metadata.ref_count > 0)
            .map(|file| {
                file.metadata.ref_count += 1;
                file.metadata.ref_count
            }))
    }

    async fn delete_file_if_unreferenced(&self, id: &FileId) -> GridResult<bool> {
        let mut state = self.state.write();
        match state.files.get(id) {
            Some(file) if file.metadata.ref_count <= 0 => Ok(state.remove_file(id)),
            _ => Ok(false),
        }
    }

    async fn list_files(&self, filter: &FileFilter) -> GridResult<Vec<StoredObject>> {
        let state = self.state.read();
        let mut files: Vec<StoredObject> =
            state.files.values().filter(|f| filter.matches(f)).cloned().collect();
        files.sort_by(|a, b| a.upload_date.cmp(&b.upload_date).then_with(|| a.id.cmp(&b.id)));
        Ok(files)
    }

    async fn ensure_index(&self, index: IndexSpec) -> GridResult<()> {
        let mut state = self.state.write();
        if !state.indexes.iter().any(|existing| existing.name == index.name) {
            state.indexes.push(index);
        }
        Ok(())
    }

    async fn indexes(&self) -> GridResult<Vec<IndexSpec>> {
        Ok(self.state.read().indexes.clone())
    }
}
