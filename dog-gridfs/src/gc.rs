//! Background cleanup: age and metadata based deletion, orphaned sub-chunk
//! sweeps, session expiry, TTL indexes and storage statistics.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::chunks::ChunkStoreAdapter;
use crate::receipt::DeleteReport;
use crate::refs::{ObjectRefs, Release};
use crate::sessions::UploadSessionManager;
use crate::store::{Collection, FileFilter, GridStore, IndexSpec};
use crate::upload::UploadSessionStore;
use crate::{FileId, GcConfig, GridError, GridResult, SessionId};

/// Size summary of one stored object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectSize {
    pub id: FileId,
    pub filename: String,
    pub length: u64,
    pub ref_count: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageStats {
    pub object_count: u64,
    pub total_bytes: u64,
    /// Largest objects first
    pub largest: Vec<ObjectSize>,
}

/// Result of an orphaned sub-chunk sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrphanSweep {
    pub file_ids: Vec<FileId>,
    pub chunks_deleted: u64,
}

/// One full cleanup pass
#[derive(Debug, Clone, Default)]
pub struct GcCycle {
    pub expired_sessions: Vec<SessionId>,
    pub purged_sessions: u64,
    pub orphans: OrphanSweep,
}

/// Cleanup helper sharing the refcount convention of the upload path
#[derive(Clone)]
pub struct GarbageCollector {
    store: Arc<dyn GridStore>,
    sessions: Arc<dyn UploadSessionStore>,
    manager: UploadSessionManager,
    chunks: ChunkStoreAdapter,
    refs: ObjectRefs,
    config: GcConfig,
}

impl GarbageCollector {
    pub fn new(
        store: Arc<dyn GridStore>,
        sessions: Arc<dyn UploadSessionStore>,
        manager: UploadSessionManager,
        config: GcConfig,
    ) -> Self {
        Self {
            chunks: ChunkStoreAdapter::new(store.clone(), manager.config().standard_chunk_size),
            refs: ObjectRefs::new(store.clone()),
            store,
            sessions,
            manager,
            config,
        }
    }

    /// Release objects uploaded more than `age` ago that also match `filter`
    #[instrument(skip(self, filter))]
    pub async fn delete_older_than(&self, age: Duration, filter: FileFilter) -> GridResult<DeleteReport> {
        let age = chrono::Duration::from_std(age).map_err(|_| GridError::invalid("age is out of range"))?;
        self.release_matching(filter.uploaded_before(Utc::now() - age)).await
    }

    /// Release every object whose metadata matches `filter`
    #[instrument(skip(self, filter))]
    pub async fn delete_by_metadata(&self, filter: FileFilter) -> GridResult<DeleteReport> {
        if filter.attributes.is_empty() && filter.tenant_id.is_none() {
            return Err(GridError::invalid("metadata filter must name at least one field"));
        }
        self.release_matching(filter).await
    }

    async fn release_matching(&self, filter: FileFilter) -> GridResult<DeleteReport> {
        let mut report = DeleteReport::default();
        for object in self.store.list_files(&filter).await? {
            match self.refs.release(&object.id).await? {
                Release::Released { .. } => report.released.push(object.id),
                Release::Deleted { .. } => report.deleted.push(object.id),
                Release::Missing => report.missing.push(object.id),
            }
        }
        info!(
            released = report.released.len(),
            deleted = report.deleted.len(),
            "released matching objects"
        );
        Ok(report)
    }

    /// Delete sub-chunks that belong to neither a `files` record nor a live
    /// in-progress session
    #[instrument(skip(self))]
    pub async fn sweep_orphaned_chunks(&self) -> GridResult<OrphanSweep> {
        let live: HashSet<FileId> = self
            .sessions
            .live_file_ids(Utc::now())
            .await?
            .into_iter()
            .collect();

        let mut sweep = OrphanSweep::default();
        for files_id in self.store.chunk_file_ids().await? {
            if live.contains(&files_id) || self.store.get_file(&files_id).await?.is_some() {
                continue;
            }
            sweep.chunks_deleted += self.chunks.cleanup_temp_data(&files_id).await?;
            sweep.file_ids.push(files_id);
        }
        if !sweep.file_ids.is_empty() {
            info!(objects = sweep.file_ids.len(), chunks = sweep.chunks_deleted, "swept orphaned sub-chunks");
        }
        Ok(sweep)
    }

    pub async fn expire_stale_sessions(&self) -> GridResult<Vec<SessionId>> {
        self.manager.expire_stale().await
    }

    /// Object count, total bytes and the largest objects
    pub async fn storage_stats(&self, largest: Option<usize>) -> GridResult<StorageStats> {
        let mut files = self.store.list_files(&FileFilter::new()).await?;
        let mut stats = StorageStats {
            object_count: files.len() as u64,
            total_bytes: files.iter().map(|f| f.length).sum(),
            largest: Vec::new(),
        };
        files.sort_by(|a, b| b.length.cmp(&a.length));
        stats.largest = files
            .into_iter()
            .take(largest.unwrap_or(self.config.largest_objects))
            .map(|f| ObjectSize {
                id: f.id,
                filename: f.filename,
                length: f.length,
                ref_count: f.metadata.ref_count,
            })
            .collect();
        Ok(stats)
    }

    /// Provision the TTL index on session `expiresAt`
    pub async fn ensure_ttl_indexes(&self) -> GridResult<()> {
        self.store
            .ensure_index(
                IndexSpec::new(Collection::Sessions, "expiresAt_ttl", &["expiresAt"]).with_ttl(Duration::ZERO),
            )
            .await?;
        self.sessions.ensure_ttl_index(Duration::ZERO).await?;
        debug!("ttl indexes ensured");
        Ok(())
    }

    /// One sweep: expire stale sessions, purge TTL'd documents, then remove orphans
    pub async fn run_cycle(&self) -> GridResult<GcCycle> {
        let expired_sessions = self.expire_stale_sessions().await?;
        let purged_sessions = self.sessions.purge_expired(Utc::now()).await?;
        let orphans = self.sweep_orphaned_chunks().await?;
        Ok(GcCycle {
            expired_sessions,
            purged_sessions,
            orphans,
        })
    }
}

/// Runs [`GarbageCollector::run_cycle`] on an interval until cancelled
pub struct GcReaper {
    gc: GarbageCollector,
    interval: Duration,
    shutdown: CancellationToken,
}

impl GcReaper {
    pub fn new(gc: GarbageCollector) -> Self {
        let interval = gc.config.sweep_interval;
        Self {
            gc,
            interval,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Token that stops the loop when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn start(self) -> GridResult<()> {
        self.gc.ensure_ttl_indexes().await?;
        let mut ticker = interval(self.interval);

        info!("Starting grid gc with interval: {:?}", self.interval);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("grid gc stopped");
                    return Ok(());
                }
                _ = ticker.tick() => {}
            }

            match self.gc.run_cycle().await {
                Ok(cycle) => debug!(
                    expired = cycle.expired_sessions.len(),
                    purged = cycle.purged_sessions,
                    orphans = cycle.orphans.file_ids.len(),
                    "gc cycle finished"
                ),
                Err(e) => warn!("Error during gc cycle: {}", e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        FileHash, GridConfig, GridCtx, MemoryGridStore, MemoryUploadSessionStore, ObjectMetadata,
        SessionRequest, StoredObject,
    };
    use bytes::Bytes;
    use regex::Regex;

    struct Fixture {
        store: MemoryGridStore,
        gc: GarbageCollector,
        manager: UploadSessionManager,
    }

    fn fixture() -> Fixture {
        let store = MemoryGridStore::new();
        let sessions: Arc<dyn UploadSessionStore> = Arc::new(MemoryUploadSessionStore::new());
        let manager = UploadSessionManager::new(Arc::new(store.clone()), sessions.clone(), GridConfig::default());
        let gc = GarbageCollector::new(
            Arc::new(store.clone()),
            sessions,
            manager.clone(),
            GcConfig::default().with_largest_objects(2),
        );
        Fixture { store, gc, manager }
    }

    async fn put(store: &MemoryGridStore, name: &str, length: u64, days_old: i64, kind: &str) -> FileId {
        let id = FileId::new();
        store
            .insert_chunks(vec![crate::SubChunk { files_id: id.clone(), n: 0, data: Bytes::from_static(b"x") }])
            .await
            .unwrap();
        store
            .insert_file(StoredObject {
                id: id.clone(),
                length,
                chunk_size: 1_048_576,
                filename: name.to_string(),
                content_type: None,
                upload_date: Utc::now() - chrono::Duration::days(days_old),
                metadata: ObjectMetadata {
                    file_hash: FileHash::parse(&crate::hash::sha256_hex(name.as_bytes())).unwrap(),
                    ref_count: 1,
                    tenant_id: "t".to_string(),
                    session_id: None,
                    attributes: serde_json::json!({ "kind": kind }),
                },
            })
            .await
            .unwrap();
        id
    }

    #[tokio::test]
    async fn age_based_deletion_honours_filename_pattern() {
        let f = fixture();
        let old_log = put(&f.store, "old.log", 10, 30, "log").await;
        put(&f.store, "old.mp4", 10, 30, "video").await;
        put(&f.store, "new.log", 10, 0, "log").await;

        let report = f
            .gc
            .delete_older_than(
                Duration::from_secs(7 * 86_400),
                FileFilter::new().with_filename_pattern(Regex::new(r"\.log$").unwrap()),
            )
            .await
            .unwrap();

        assert_eq!(report.deleted, vec![old_log]);
        assert_eq!(f.store.file_count(), 2);
    }

    #[tokio::test]
    async fn metadata_deletion_requires_a_filter() {
        let f = fixture();
        put(&f.store, "a", 1, 0, "video").await;
        put(&f.store, "b", 1, 0, "audio").await;

        assert!(f.gc.delete_by_metadata(FileFilter::new()).await.is_err());
        let report = f
            .gc
            .delete_by_metadata(FileFilter::new().with_attribute("kind", serde_json::json!("audio")))
            .await
            .unwrap();
        assert_eq!(report.deleted.len(), 1);
        assert_eq!(f.store.file_count(), 1);
    }

    #[tokio::test]
    async fn orphan_sweep_spares_live_sessions_and_records() {
        let f = fixture();
        let kept = put(&f.store, "kept", 1, 0, "x").await;
        let session = f
            .manager
            .create_session(&GridCtx::new("t".to_string()), SessionRequest::new("up", 10))
            .await
            .unwrap();
        let orphan = FileId::new();
        for id in [&session.file_id, &orphan] {
            f.store
                .insert_chunks(vec![crate::SubChunk { files_id: id.clone(), n: 0, data: Bytes::from_static(b"y") }])
                .await
                .unwrap();
        }

        let sweep = f.gc.sweep_orphaned_chunks().await.unwrap();

        assert_eq!(sweep.file_ids, vec![orphan]);
        assert_eq!(sweep.chunks_deleted, 1);
        assert_eq!(f.store.chunk_count_for(&kept), 1);
        assert_eq!(f.store.chunk_count_for(&session.file_id), 1);
    }

    #[tokio::test]
    async fn stats_report_largest_first() {
        let f = fixture();
        put(&f.store, "small", 5, 0, "x").await;
        let big = put(&f.store, "big", 500, 0, "x").await;
        put(&f.store, "mid", 50, 0, "x").await;

        let stats = f.gc.storage_stats(None).await.unwrap();

        assert_eq!(stats.object_count, 3);
        assert_eq!(stats.total_bytes, 555);
        assert_eq!(stats.largest.len(), 2);
        assert_eq!(stats.largest[0].id, big);
        assert_eq!(stats.largest[1].length, 50);
    }

    #[tokio::test]
    async fn ttl_indexes_are_registered() {
        let f = fixture();
        f.gc.ensure_ttl_indexes().await.unwrap();
        let indexes = f.store.indexes().await.unwrap();
        assert!(indexes
            .iter()
            .any(|i| i.collection == Collection::Sessions && i.expire_after == Some(Duration::ZERO)));
    }

    #[tokio::test]
    async fn reaper_stops_on_shutdown() {
        let f = fixture();
        let reaper = GcReaper::new(f.gc.clone()).with_interval(Duration::from_millis(5));
        let token = reaper.shutdown_token();
        let handle = tokio::spawn(reaper.start());
        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();
        assert!(handle.await.unwrap().is_ok());
    }
}
