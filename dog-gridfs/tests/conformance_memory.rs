use std::io::SeekFrom;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use proptest::prelude::*;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_test::{assert_err, assert_ok};

use dog_gridfs::hash::sha256_hex;
use dog_gridfs::wire::CreateSessionResponse;
use dog_gridfs::{
    ChunkSizeTiers, ChunkWrite, FileId, FinalizeOptions, GridAdapter, GridConfig, GridCtx,
    GridError, GridStore, LimitsConfig, MemoryGridStore, MemoryUploadSessionStore, SessionRequest,
    UploadSession, UploadStatus,
};

/// Test factory functions
fn create_test_context() -> GridCtx {
    GridCtx::new("test_tenant".to_string())
}

/// Tiny geometry: 4-byte sub-chunks, 8-byte client chunks by default
fn small_config() -> GridConfig {
    GridConfig::default()
        .with_standard_chunk_size(4)
        .with_chunk_size_tiers(ChunkSizeTiers::new(8))
}

fn create_grid(config: GridConfig) -> (MemoryGridStore, GridAdapter) {
    let store = MemoryGridStore::new();
    let grid = GridAdapter::new(store.clone(), MemoryUploadSessionStore::new(), config).unwrap();
    (store, grid)
}

fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

async fn upload_chunk_number(grid: &GridAdapter, session: &UploadSession, content: &[u8], chunk_number: u64) -> ChunkWrite {
    let start = (chunk_number * session.chunk_size) as usize;
    let end = (start + session.chunk_size as usize).min(content.len());
    let part = &content[start..end];
    grid.upload_chunk(
        create_test_context(),
        &session.session_id,
        chunk_number,
        Bytes::copy_from_slice(part),
        &sha256_hex(part),
    )
    .await
    .unwrap()
    .outcome
}

async fn upload_everything(grid: &GridAdapter, content: &[u8], request: SessionRequest) -> FileId {
    let ctx = create_test_context();
    let session = grid.create_session(ctx.clone(), request).await.unwrap();
    for i in 0..session.total_chunks() {
        upload_chunk_number(grid, &session, content, i).await;
    }
    grid.finalize(ctx, &session.session_id, FinalizeOptions::new())
        .await
        .unwrap()
        .file_id
}

async fn read_all(grid: &GridAdapter, id: &FileId, start: u64, end: Option<u64>) -> Vec<u8> {
    let mut opened = grid.open_range(create_test_context(), id, start, end).await.unwrap();
    let mut out = Vec::new();
    opened.reader.read_to_end(&mut out).await.unwrap();
    out
}

/// A1. Idempotent Chunk Upload
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_idempotent_chunk_upload() {
    let (store, grid) = create_grid(small_config());
    let grid = Arc::new(grid);
    let ctx = create_test_context();
    let content = Arc::new(patterned(20));

    // Arrange: one session of 3 client chunks (8, 8, 4 bytes)
    let session = grid
        .create_session(ctx.clone(), SessionRequest::new("a.bin", 20))
        .await
        .unwrap();

    // Act: upload chunk 1 twice in a row, then chunk 0 from several tasks at once
    let first = upload_chunk_number(&grid, &session, &content, 1).await;
    let second = upload_chunk_number(&grid, &session, &content, 1).await;
    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let (grid, session, content) = (grid.clone(), session.clone(), content.clone());
            tokio::spawn(async move { upload_chunk_number(&grid, &session, &content, 0).await })
        })
        .collect();
    let mut outcomes = Vec::new();
    for task in tasks {
        outcomes.push(task.await.unwrap());
    }

    // Assert: one physical copy of each sub-chunk, counted once
    assert_eq!(first, ChunkWrite::Written);
    assert_eq!(second, ChunkWrite::AlreadyExists);
    assert_eq!(outcomes.iter().filter(|o| **o == ChunkWrite::Written).count(), 1);
    assert_eq!(store.chunk_count_for(&session.file_id), 4);

    let session = grid.get_session(ctx, &session.session_id).await.unwrap();
    assert_eq!(session.uploaded_chunks.len(), 2);
    assert_eq!(session.uploaded_size, 16);
}

/// A2. Order Independence
#[test]
fn test_order_independence() {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let content = patterned(18);

    proptest!(ProptestConfig::with_cases(32), |(order in Just((0..5u64).collect::<Vec<_>>()).prop_shuffle())| {
        let read_back = runtime.block_on(async {
            let (_, grid) = create_grid(small_config());
            let ctx = create_test_context();
            let session = grid
                .create_session(ctx.clone(), SessionRequest::new("p.bin", 18).with_chunk_size(4))
                .await
                .unwrap();
            for chunk_number in &order {
                upload_chunk_number(&grid, &session, &content, *chunk_number).await;
            }
            let receipt = grid
                .finalize(ctx, &session.session_id, FinalizeOptions::new())
                .await
                .unwrap();
            read_all(&grid, &receipt.file_id, 0, None).await
        });
        prop_assert_eq!(read_back, content.clone());
    });
}

/// A3. Dedup Convergence
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_dedup_convergence() {
    for _ in 0..16 {
        let (store, grid) = create_grid(small_config());
        let grid = Arc::new(grid);
        let ctx = create_test_context();
        let content = patterned(10);

        // Arrange: sessions carrying the same bytes, all fully uploaded
        let mut sessions = Vec::new();
        for name in ["one", "two", "three"] {
            let session = grid.create_session(ctx.clone(), SessionRequest::new(name, 10)).await.unwrap();
            for i in 0..session.total_chunks() {
                upload_chunk_number(&grid, &session, &content, i).await;
            }
            sessions.push(session);
        }
        assert_eq!(store.chunk_count(), 9);

        // Act: finalize all of them in parallel
        let tasks: Vec<_> = sessions
            .iter()
            .map(|session| {
                let (grid, ctx, id) = (grid.clone(), ctx.clone(), session.session_id.clone());
                tokio::spawn(async move { grid.finalize(ctx, &id, FinalizeOptions::new()).await })
            })
            .collect();
        let mut receipts = Vec::new();
        for task in tasks {
            receipts.push(task.await.unwrap().unwrap());
        }

        // Assert: one object, one owner per session, no leftover sub-chunks from the losers
        let winner = receipts[0].file_id.clone();
        assert!(receipts.iter().all(|r| r.file_id == winner));
        assert_eq!(receipts.iter().filter(|r| !r.deduplicated).count(), 1);
        assert_eq!(store.file_count(), 1);
        let object = store.get_file(&winner).await.unwrap().unwrap();
        assert_eq!(object.metadata.ref_count, 3);
        assert_eq!(store.chunk_count(), 3);
        assert_eq!(store.chunk_count_for(&winner), 3);
    }
}

/// A4. Completeness Precision
#[tokio::test]
async fn test_completeness_precision() {
    let (store, grid) = create_grid(small_config());
    let ctx = create_test_context();
    let content = patterned(18);
    let session = grid
        .create_session(ctx.clone(), SessionRequest::new("gap.bin", 18).with_chunk_size(4))
        .await
        .unwrap();

    // Arrange: every chunk but 3
    for i in [0u64, 1, 2, 4] {
        upload_chunk_number(&grid, &session, &content, i).await;
    }

    // Act
    let err = grid
        .finalize(ctx.clone(), &session.session_id, FinalizeOptions::new())
        .await
        .unwrap_err();

    // Assert: exactly [3] reported, the rest kept for resumption
    match err {
        GridError::IncompleteUpload { missing } => assert_eq!(missing, vec![3]),
        other => panic!("expected IncompleteUpload, got {other:?}"),
    }
    assert_eq!(store.chunk_count_for(&session.file_id), 4);
    let progress = grid.progress(ctx.clone(), &session.session_id).await.unwrap();
    assert_eq!(progress.missing_chunks, vec![3]);

    // Resume with only the missing chunk
    upload_chunk_number(&grid, &session, &content, 3).await;
    let receipt = grid
        .finalize(ctx, &session.session_id, FinalizeOptions::new())
        .await
        .unwrap();
    assert_eq!(read_all(&grid, &receipt.file_id, 0, None).await, content);
}

/// A5. Range Correctness
#[tokio::test]
async fn test_range_correctness() {
    let config = GridConfig::default()
        .with_standard_chunk_size(64)
        .with_chunk_size_tiers(ChunkSizeTiers::new(128));
    let (_, grid) = create_grid(config);
    let content = patterned(1000);
    let id = upload_everything(&grid, &content, SessionRequest::new("r.bin", 1000)).await;

    // Whole object through an explicit range equals a full read
    assert_eq!(read_all(&grid, &id, 0, Some(999)).await, read_all(&grid, &id, 0, None).await);
    assert_eq!(read_all(&grid, &id, 0, None).await, content);

    // Middle slice spanning sub-chunk boundaries
    let slice = read_all(&grid, &id, 100, Some(199)).await;
    assert_eq!(slice.len(), 100);
    assert_eq!(slice, &content[100..200]);

    // Seeking is relative to the range start
    let mut opened = grid.open_range(create_test_context(), &id, 100, Some(199)).await.unwrap();
    assert_eq!(opened.status_code(), 206);
    assert_eq!(opened.range.content_range(), "bytes 100-199/1000");
    opened.reader.seek(SeekFrom::Start(50)).await.unwrap();
    let mut tail = Vec::new();
    opened.reader.read_to_end(&mut tail).await.unwrap();
    assert_eq!(tail, &content[150..200]);

    // Start at or past the end
    let err = grid
        .open_range(create_test_context(), &id, 1000, None)
        .await
        .err()
        .unwrap();
    assert!(matches!(err, GridError::OutOfRange { start: 1000, length: 1000 }));

    let missing = grid
        .open_range(create_test_context(), &FileId::new(), 0, None)
        .await
        .err()
        .unwrap();
    assert!(matches!(missing, GridError::NotFound { .. }));
}

/// A6. Refcount Lifecycle
#[tokio::test]
async fn test_refcount_lifecycle() {
    let (store, grid) = create_grid(small_config());
    let ctx = create_test_context();
    let content = patterned(10);
    let hash = sha256_hex(&content);

    // Arrange: one real upload and two dedup-linked sessions
    let id = upload_everything(&grid, &content, SessionRequest::new("a", 10)).await;
    for name in ["b", "c"] {
        let session = grid
            .create_session(ctx.clone(), SessionRequest::new(name, 10).with_file_hash(hash.clone()))
            .await
            .unwrap();
        assert_eq!(session.status, UploadStatus::Completed);
        assert_eq!(session.file_id, id);
    }
    assert_eq!(store.get_file(&id).await.unwrap().unwrap().metadata.ref_count, 3);

    // Act: delete twice
    let report = grid.delete_objects(ctx.clone(), &[id.clone(), id.clone()]).await.unwrap();

    // Assert: still there with one owner
    assert_eq!(report.released.len(), 2);
    assert!(report.deleted.is_empty());
    assert_eq!(store.get_file(&id).await.unwrap().unwrap().metadata.ref_count, 1);
    assert_eq!(read_all(&grid, &id, 0, None).await, content);

    // Third delete removes object and data
    let report = grid.delete_objects(ctx.clone(), &[id.clone()]).await.unwrap();
    assert_eq!(report.deleted, vec![id.clone()]);
    assert!(store.get_file(&id).await.unwrap().is_none());
    assert_eq!(store.chunk_count(), 0);

    let report = grid.delete_objects(ctx, &[id.clone()]).await.unwrap();
    assert_eq!(report.missing, vec![id]);
}

/// A7. Out-of-order upload of a 5,000,000 byte file in 2 MiB chunks
#[tokio::test]
async fn test_five_megabyte_scenario() {
    let (store, grid) = create_grid(GridConfig::default());
    let ctx = create_test_context();
    let content = patterned(5_000_000);

    let session = grid
        .create_session(
            ctx.clone(),
            SessionRequest::new("movie.mp4", 5_000_000).with_chunk_size(2_097_152),
        )
        .await
        .unwrap();
    assert_eq!(session.total_chunks(), 3);
    assert_eq!(session.layout().expected_sub_chunks(0), 2);
    assert_eq!(session.layout().expected_sub_chunks(2), 1);

    for i in [1u64, 0, 2] {
        upload_chunk_number(&grid, &session, &content, i).await;
    }
    let receipt = grid
        .finalize(
            ctx.clone(),
            &session.session_id,
            FinalizeOptions::new().with_file_hash(sha256_hex(&content)),
        )
        .await
        .unwrap();

    assert_eq!(receipt.length, 5_000_000);
    assert_eq!(store.chunk_count_for(&receipt.file_id), 5);
    let object = store.get_file(&receipt.file_id).await.unwrap().unwrap();
    assert_eq!(object.length, 5_000_000);
    assert_eq!(object.chunk_size, 1_048_576);
    assert_eq!(read_all(&grid, &receipt.file_id, 4_999_990, None).await, &content[4_999_990..]);
}

/// B1. Instant Upload Reports Completion
#[tokio::test]
async fn test_instant_upload_response() {
    let (_, grid) = create_grid(small_config());
    let ctx = create_test_context();
    let content = patterned(10);
    let id = upload_everything(&grid, &content, SessionRequest::new("a", 10)).await;

    let session = grid
        .create_session(ctx, SessionRequest::new("again", 10).with_file_hash(sha256_hex(&content)))
        .await
        .unwrap();
    let response = CreateSessionResponse::from(&session);

    assert_eq!(response.status, UploadStatus::Completed);
    assert_eq!(response.file_id, Some(id));
    assert!(session.expires_at.is_none());
}

/// B2. Cancel Discards Data
#[tokio::test]
async fn test_cancel_discards_data() {
    let (store, grid) = create_grid(small_config());
    let ctx = create_test_context();
    let content = patterned(20);
    let session = grid.create_session(ctx.clone(), SessionRequest::new("c", 20)).await.unwrap();
    upload_chunk_number(&grid, &session, &content, 0).await;
    assert_eq!(store.chunk_count(), 2);

    assert_ok!(grid.cancel(ctx.clone(), &session.session_id, false).await);
    assert_ok!(grid.cancel(ctx.clone(), &session.session_id, false).await);

    assert_eq!(store.chunk_count(), 0);
    let cancelled = grid.get_session(ctx.clone(), &session.session_id).await.unwrap();
    assert_eq!(cancelled.status, UploadStatus::Cancelled);

    let part = &content[8..16];
    let err = grid
        .upload_chunk(ctx.clone(), &session.session_id, 1, Bytes::copy_from_slice(part), &sha256_hex(part))
        .await
        .unwrap_err();
    assert!(matches!(err, GridError::SessionNotInProgress { .. }));

    assert_ok!(grid.cancel(ctx.clone(), &session.session_id, true).await);
    let err = assert_err!(grid.get_session(ctx, &session.session_id).await);
    assert!(matches!(err, GridError::SessionNotFound { .. }));
}

/// B3. Stale Sessions Expire
#[tokio::test]
async fn test_stale_sessions_expire() {
    let (store, grid) = create_grid(small_config());
    let ctx = create_test_context();
    let content = patterned(20);
    let mut request = SessionRequest::new("slow", 20);
    request.ttl = Some(Duration::from_millis(200));
    let session = grid.create_session(ctx.clone(), request).await.unwrap();
    upload_chunk_number(&grid, &session, &content, 0).await;

    tokio::time::sleep(Duration::from_millis(300)).await;
    let expired = grid.gc().expire_stale_sessions().await.unwrap();

    assert_eq!(expired, vec![session.session_id.clone()]);
    assert_eq!(store.chunk_count(), 0);
    let err = grid.get_session(ctx, &session.session_id).await.unwrap_err();
    assert!(matches!(err, GridError::SessionNotFound { .. }));
}

/// B4. Admission Control
#[tokio::test]
async fn test_admission_control() {
    let limits = LimitsConfig::default()
        .with_max_concurrent_sessions(1)
        .with_slot_timeouts(Duration::from_millis(50), Duration::from_millis(50));
    let (_, grid) = create_grid(small_config().with_limits(limits));
    let ctx = create_test_context();
    let content = patterned(20);
    let busy = grid.create_session(ctx.clone(), SessionRequest::new("busy", 20)).await.unwrap();
    let waiting = grid.create_session(ctx.clone(), SessionRequest::new("waiting", 20)).await.unwrap();

    // Hold the only session slot
    let permit = grid
        .limiter()
        .admit_chunk(&ctx.tenant_id, &busy.session_id)
        .await
        .unwrap();

    let part = &content[0..8];
    let err = grid
        .upload_chunk(ctx.clone(), &waiting.session_id, 0, Bytes::copy_from_slice(part), &sha256_hex(part))
        .await
        .unwrap_err();
    assert!(matches!(err, GridError::SlotUnavailable { slot: "session", .. }));
    assert!(err.is_retryable());

    // Chunks of the session already holding the slot still get in
    upload_chunk_number(&grid, &busy, &content, 0).await;

    drop(permit);
    assert_eq!(upload_chunk_number(&grid, &waiting, &content, 0).await, ChunkWrite::Written);
}

/// B5. Sessions Are Tenant Scoped
#[tokio::test]
async fn test_sessions_are_tenant_scoped() {
    let (_, grid) = create_grid(small_config());
    let session = grid
        .create_session(create_test_context(), SessionRequest::new("mine", 20))
        .await
        .unwrap();

    let other = GridCtx::new("other_tenant".to_string());
    let err = grid.get_session(other.clone(), &session.session_id).await.unwrap_err();
    assert!(matches!(err, GridError::SessionNotFound { .. }));
    let err = grid.cancel(other, &session.session_id, true).await.unwrap_err();
    assert!(matches!(err, GridError::SessionNotFound { .. }));
}

/// B6. Cancellation Propagates
#[tokio::test]
async fn test_cancellation_propagates() {
    let (store, grid) = create_grid(small_config());
    let ctx = create_test_context();
    let content = patterned(20);
    let session = grid.create_session(ctx.clone(), SessionRequest::new("x", 20)).await.unwrap();

    ctx.cancel.cancel();
    let part = &content[0..8];
    let err = grid
        .upload_chunk(ctx, &session.session_id, 0, Bytes::copy_from_slice(part), &sha256_hex(part))
        .await
        .unwrap_err();

    assert!(matches!(err, GridError::Cancelled));
    assert!(!err.to_string().is_empty());
    assert_eq!(store.chunk_count(), 0);
    assert_eq!(grid.limiter().active_sessions(), 0);
}

/// B7. Repeated Cancel Keeps Shared Objects
#[tokio::test]
async fn test_repeated_cancel_keeps_shared_objects() {
    let (store, grid) = create_grid(small_config());
    let ctx = create_test_context();
    let content = patterned(10);
    let id = upload_everything(&grid, &content, SessionRequest::new("kept", 10)).await;

    // A session that instantly linked to the object, then a cancelled one that never did
    let linked = grid
        .create_session(ctx.clone(), SessionRequest::new("linked", 10).with_file_hash(sha256_hex(&content)))
        .await
        .unwrap();
    let abandoned = grid.create_session(ctx.clone(), SessionRequest::new("gone", 10)).await.unwrap();
    upload_chunk_number(&grid, &abandoned, &content, 0).await;

    for _ in 0..3 {
        assert_ok!(grid.cancel(ctx.clone(), &abandoned.session_id, false).await);
    }

    assert_eq!(store.get_file(&id).await.unwrap().unwrap().metadata.ref_count, 2);
    assert_eq!(store.chunk_count(), 3);
    assert_eq!(grid.get_session(ctx, &linked.session_id).await.unwrap().file_id, id);
}
