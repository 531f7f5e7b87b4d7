//! Chunk geometry.
//!
//! A client chunk of `chunk_size = k × standard_chunk_size` bytes maps onto
//! `k` sub-chunks at indices `chunk_number·k … chunk_number·k + k - 1`. The
//! final client chunk may be short, in which case it only spans as many
//! sub-chunks as its bytes need.

use std::ops::Range;

use crate::{GridError, GridResult};

/// Mapping between client chunks and fixed-size sub-chunks for one object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkLayout {
    pub total_size: u64,
    pub chunk_size: u64,
    pub standard_chunk_size: u64,
}

impl ChunkLayout {
    pub fn new(total_size: u64, chunk_size: u64, standard_chunk_size: u64) -> Self {
        Self {
            total_size,
            chunk_size,
            standard_chunk_size,
        }
    }

    /// Validate a `chunk_size` against the store's standard sub-chunk size.
    pub fn validate_chunk_size(chunk_size: u64, standard_chunk_size: u64) -> GridResult<()> {
        if standard_chunk_size == 0 {
            return Err(GridError::invalid("standard chunk size must be positive"));
        }
        if chunk_size == 0 || chunk_size % standard_chunk_size != 0 {
            return Err(GridError::invalid(format!(
                "chunk size {} must be a positive multiple of {}",
                chunk_size, standard_chunk_size
            )));
        }
        Ok(())
    }

    pub fn validate(&self) -> GridResult<()> {
        if self.total_size == 0 {
            return Err(GridError::invalid("total size must be greater than zero"));
        }
        Self::validate_chunk_size(self.chunk_size, self.standard_chunk_size)
    }

    pub fn total_chunks(&self) -> u64 {
        self.total_size.div_ceil(self.chunk_size)
    }

    pub fn sub_chunks_per_chunk(&self) -> u64 {
        self.chunk_size / self.standard_chunk_size
    }

    /// Total sub-chunks of the complete object
    pub fn total_sub_chunks(&self) -> u64 {
        self.total_size.div_ceil(self.standard_chunk_size)
    }

    /// Expected byte length of client chunk `chunk_number`
    pub fn chunk_len(&self, chunk_number: u64) -> u64 {
        let start = chunk_number.saturating_mul(self.chunk_size);
        if start >= self.total_size {
            return 0;
        }
        (self.total_size - start).min(self.chunk_size)
    }

    /// Sub-chunks a complete client chunk `chunk_number` occupies
    pub fn expected_sub_chunks(&self, chunk_number: u64) -> u64 {
        self.chunk_len(chunk_number).div_ceil(self.standard_chunk_size)
    }

    /// First sub-chunk index of client chunk `chunk_number`
    pub fn first_sub_chunk(&self, chunk_number: u64) -> u64 {
        chunk_number * self.sub_chunks_per_chunk()
    }

    pub fn sub_chunk_range(&self, chunk_number: u64) -> Range<u64> {
        let first = self.first_sub_chunk(chunk_number);
        first..first + self.expected_sub_chunks(chunk_number)
    }

    /// Client chunk that owns sub-chunk `n`
    pub fn chunk_of(&self, n: u64) -> u64 {
        n / self.sub_chunks_per_chunk()
    }

    pub fn contains_chunk(&self, chunk_number: u64) -> bool {
        chunk_number < self.total_chunks()
    }
}
