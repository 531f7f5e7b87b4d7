use bytes::Bytes;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::debug;

use crate::hash::ContentHasher;
use crate::layout::ChunkLayout;
use crate::store::GridStore;
use crate::{ByteStream, ChunkWrite, FileHash, FileId, GridError, GridResult, SubChunk};

/// Digest of the sub-chunks actually stored for an object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredDigest {
    pub hash: FileHash,
    pub length: u64,
}

/// Translates client chunks into fixed-size sub-chunks of the backing store
#[derive(Clone)]
pub struct ChunkStoreAdapter {
    store: Arc<dyn GridStore>,
    standard_chunk_size: u64,
}

impl ChunkStoreAdapter {
    pub fn new(store: Arc<dyn GridStore>, standard_chunk_size: u64) -> Self {
        Self {
            store,
            standard_chunk_size,
        }
    }

    pub fn standard_chunk_size(&self) -> u64 {
        self.standard_chunk_size
    }

    fn sub_chunks_per_chunk(&self, session_chunk_size: u64) -> GridResult<u64> {
        ChunkLayout::validate_chunk_size(session_chunk_size, self.standard_chunk_size)?;
        Ok(session_chunk_size / self.standard_chunk_size)
    }

    /// Existence probe for one sub-chunk
    pub async fn chunk_exists(&self, files_id: &FileId, sub_chunk: u64) -> GridResult<bool> {
        self.store.chunk_exists(files_id, sub_chunk).await
    }

    /// Split `data` into sub-chunks at the offset of `chunk_number` and insert them.
    ///
    /// Duplicate keys mean another writer (or an earlier attempt) got there
    /// first; missing siblings are still filled in, and the call reports
    /// [`ChunkWrite::AlreadyExists`].
    pub async fn write_chunk(
        &self,
        files_id: &FileId,
        chunk_number: u64,
        session_chunk_size: u64,
        data: Bytes,
    ) -> GridResult<ChunkWrite> {
        let per_chunk = self.sub_chunks_per_chunk(session_chunk_size)?;
        if data.is_empty() || data.len() as u64 > session_chunk_size {
            return Err(GridError::invalid(format!(
                "chunk {} carries {} bytes, expected 1..={}",
                chunk_number,
                data.len(),
                session_chunk_size
            )));
        }

        let first = chunk_number * per_chunk;
        let step = self.standard_chunk_size as usize;
        let sub_chunks: Vec<SubChunk> = (0..data.len())
            .step_by(step)
            .enumerate()
            .map(|(i, offset)| SubChunk {
                files_id: files_id.clone(),
                n: first + i as u64,
                data: data.slice(offset..(offset + step).min(data.len())),
            })
            .collect();

        let result = self.store.insert_chunks(sub_chunks).await?;
        if result.has_duplicates() {
            debug!(
                file_id = %files_id,
                chunk_number,
                duplicates = ?result.duplicates,
                "sub-chunks already present"
            );
            return Ok(ChunkWrite::AlreadyExists);
        }
        Ok(ChunkWrite::Written)
    }

    /// Client chunk indices with at least one stored sub-chunk, ascending
    pub async fn uploaded_chunk_indices(
        &self,
        files_id: &FileId,
        session_chunk_size: u64,
    ) -> GridResult<BTreeSet<u64>> {
        let per_chunk = self.sub_chunks_per_chunk(session_chunk_size)?;
        let present = self.store.chunk_indices(files_id).await?;
        Ok(present.into_iter().map(|n| n / per_chunk).collect())
    }

    /// `[0, total_chunks)` minus [`Self::uploaded_chunk_indices`]
    pub async fn missing_chunks(
        &self,
        files_id: &FileId,
        total_chunks: u64,
        session_chunk_size: u64,
    ) -> GridResult<Vec<u64>> {
        let uploaded = self.uploaded_chunk_indices(files_id, session_chunk_size).await?;
        Ok((0..total_chunks).filter(|i| !uploaded.contains(i)).collect())
    }

    /// Whether every sub-chunk client chunk `chunk_number` needs is stored
    pub async fn chunk_is_complete(
        &self,
        files_id: &FileId,
        layout: &ChunkLayout,
        chunk_number: u64,
    ) -> GridResult<bool> {
        for n in layout.sub_chunk_range(chunk_number) {
            if !self.store.chunk_exists(files_id, n).await? {
                return Ok(false);
            }
        }
        Ok(layout.contains_chunk(chunk_number))
    }

    /// Client chunks whose sub-chunks are all stored, ascending
    pub async fn complete_chunk_indices(
        &self,
        files_id: &FileId,
        layout: &ChunkLayout,
    ) -> GridResult<BTreeSet<u64>> {
        let mut per_chunk: BTreeMap<u64, u64> = BTreeMap::new();
        for n in self.store.chunk_indices(files_id).await? {
            *per_chunk.entry(layout.chunk_of(n)).or_default() += 1;
        }
        Ok(per_chunk
            .into_iter()
            .filter(|(i, count)| layout.contains_chunk(*i) && *count == layout.expected_sub_chunks(*i))
            .map(|(i, _)| i)
            .collect())
    }

    /// Chunks of `layout` that are absent or only partially stored
    pub async fn incomplete_chunks(
        &self,
        files_id: &FileId,
        layout: &ChunkLayout,
    ) -> GridResult<Vec<u64>> {
        let complete = self.complete_chunk_indices(files_id, layout).await?;
        Ok((0..layout.total_chunks())
            .filter(|i| !complete.contains(i))
            .collect())
    }

    /// Hash every stored sub-chunk in ascending `n` order
    pub async fn compute_full_hash(&self, files_id: &FileId) -> GridResult<StoredDigest> {
        let mut hasher = ContentHasher::new();
        for n in self.store.chunk_indices(files_id).await? {
            let data = self
                .store
                .read_chunk(files_id, n)
                .await?
                .ok_or_else(|| GridError::not_found(format!("{}/{}", files_id, n)))?;
            hasher.update(&data);
        }
        let length = hasher.len();
        Ok(StoredDigest {
            hash: hasher.finalize(),
            length,
        })
    }

    /// Delete every sub-chunk of an object
    pub async fn cleanup_temp_data(&self, files_id: &FileId) -> GridResult<u64> {
        let removed = self.store.delete_chunks(files_id).await?;
        debug!(file_id = %files_id, removed, "cleaned up sub-chunks");
        Ok(removed)
    }

    /// Stream bytes `start..=end` of an object whose sub-chunks are `chunk_size` long
    pub fn stream_range(&self, files_id: &FileId, chunk_size: u64, start: u64, end: u64) -> ByteStream {
        let store = self.store.clone();
        let files_id = files_id.clone();
        let stream = async_stream::stream! {
            if chunk_size == 0 || end < start {
                return;
            }
            for n in (start / chunk_size)..=(end / chunk_size) {
                let data = match store.read_chunk(&files_id, n).await {
                    Ok(Some(data)) => data,
                    Ok(None) => {
                        yield Err(std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            format!("sub-chunk {} of {} is missing", n, files_id),
                        ));
                        return;
                    }
                    Err(e) => {
                        yield Err(std::io::Error::other(e));
                        return;
                    }
                };
                let base = n * chunk_size;
                let from = start.saturating_sub(base) as usize;
                let to = ((end - base + 1) as usize).min(data.len());
                if from < to {
                    yield Ok(data.slice(from..to));
                }
            }
        };
        Box::pin(stream)
    }
}
