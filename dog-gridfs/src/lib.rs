//! # dog-gridfs: Resumable, deduplicating uploads over a GridFS-style store
//!
//! `dog-gridfs` takes large files in client-sized chunks, in any order and
//! concurrently, stores them as fixed-size sub-chunks, and publishes one
//! content-addressed object per distinct SHA-256. Stored objects are served
//! back through seekable byte-range readers.
//!
//! ## Key Features
//!
//! - **Resumable**: every chunk is recorded in an upload session; after a
//!   crash the client asks for the missing indices and sends only those
//! - **Idempotent**: re-sending a chunk, even concurrently, never stores it twice
//! - **Deduplicated**: identical content is stored once and reference counted
//! - **Range reads**: `AsyncRead + AsyncSeek` views over any byte range
//! - **Backpressure**: per-tenant sliding window plus session and chunk slots
//! - **Storage agnostic**: the `GridStore` and `UploadSessionStore` traits
//!   are all a backend has to provide
//!
//! ## Quick Start
//!
//! ```rust
//! use dog_gridfs::prelude::*;
//! use bytes::Bytes;
//!
//! # #[tokio::main]
//! # async fn main() -> GridResult<()> {
//! let grid = GridAdapter::new(
//!     MemoryGridStore::new(),
//!     MemoryUploadSessionStore::new(),
//!     GridConfig::default(),
//! )?;
//! let ctx = GridCtx::new("my-app".to_string());
//!
//! let data = Bytes::from_static(b"Hello, world!");
//! let session = grid
//!     .create_session(ctx.clone(), SessionRequest::new("hello.txt", data.len() as u64))
//!     .await?;
//! grid.upload_chunk(ctx.clone(), &session.session_id, 0, data.clone(), &sha256_hex(&data))
//!     .await?;
//! let receipt = grid
//!     .finalize(ctx.clone(), &session.session_id, FinalizeOptions::new())
//!     .await?;
//!
//! let opened = grid.open(ctx, &receipt.file_id, Some("bytes=0-4")).await?;
//! assert_eq!(opened.status_code(), 206);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────┐
//! │       Your Service       │  ← Transport and auth
//! ├──────────────────────────┤
//! │       GridAdapter        │  ← Admission, uploads, reads, GC
//! ├────────────┬─────────────┤
//! │ GridStore  │ SessionStore│  ← Storage primitives
//! └────────────┴─────────────┘
//! ```

pub mod adapter;
mod chunks;
pub mod config;
mod coordinator;
mod error;
pub mod gc;
pub mod hash;
pub mod layout;
pub mod limiter;
mod memory_store;
#[cfg(feature = "tracing-basic")]
pub mod observability;
pub mod range;
mod receipt;
mod refs;
mod session_store;
mod sessions;
pub mod store;
mod types;
mod upload;
pub mod wire;

pub use adapter::GridAdapter;
pub use chunks::{ChunkStoreAdapter, StoredDigest};
pub use config::{ChunkSizeTier, ChunkSizeTiers, GcConfig, GridConfig, LimitsConfig};
pub use coordinator::DefaultUploadCoordinator;
pub use error::{GridError, GridResult};
pub use gc::{GarbageCollector, GcCycle, GcReaper, OrphanSweep, StorageStats};
pub use limiter::{ConcurrencyController, SlidingWindowLimiter, UploadPermit};
pub use memory_store::MemoryGridStore;
pub use range::{parse_range_header, ObjectReader, RangeReader};
pub use receipt::{ChunkReceipt, DeleteReport, FileReceipt, OpenedRange, ResolvedRange};
pub use refs::{ObjectRefs, Release};
pub use session_store::MemoryUploadSessionStore;
pub use sessions::UploadSessionManager;
pub use store::{ChunkInsert, FileFilter, FileInsert, GridStore, IndexSpec};
pub use types::{
    ByteRange, ByteStream, ChunkWrite, FileHash, FileId, GridCtx, ObjectMetadata, SessionId,
    SessionRequest, StoredObject, SubChunk, UploadProgress, UploadSession, UploadStatus,
};
pub use upload::{
    CompleteOutcome, FinalizeOptions, TransitionOutcome, UploadCoordinator, UploadSessionStore,
};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::hash::sha256_hex;
    pub use crate::{
        FileId, FinalizeOptions, GridAdapter, GridConfig, GridCtx, GridError, GridResult,
        MemoryGridStore, MemoryUploadSessionStore, SessionId, SessionRequest,
    };
}
