//! Reference counting over stored objects.
//!
//! An object's data is physically removed only when its `refCount` drops to
//! zero or below. Every deletion path (explicit deletes, GC sweeps, cancel of
//! a half-published upload, losing a finalize race) releases through here.

use std::sync::Arc;
use tracing::{debug, info};

use crate::store::GridStore;
use crate::{FileId, GridResult};

/// Outcome of releasing one reference
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// Other owners remain
    Released { remaining: i64 },
    /// Last owner gone: record and sub-chunks removed
    Deleted { chunks: u64 },
    Missing,
}

/// Acquire and release owners of stored objects
#[derive(Clone)]
pub struct ObjectRefs {
    store: Arc<dyn GridStore>,
}

impl ObjectRefs {
    pub fn new(store: Arc<dyn GridStore>) -> Self {
        Self { store }
    }

    /// Add an owner, returning the new count. `None` if the object is gone
    /// or its last owner already released it.
    pub async fn acquire(&self, id: &FileId) -> GridResult<Option<i64>> {
        let count = self.store.acquire_ref(id).await?;
        debug!(file_id = %id, ?count, "acquired object reference");
        Ok(count)
    }

    /// Drop an owner; delete the object when none remain
    pub async fn release(&self, id: &FileId) -> GridResult<Release> {
        let Some(remaining) = self.store.adjust_ref_count(id, -1).await? else {
            return Ok(Release::Missing);
        };
        if remaining > 0 {
            debug!(file_id = %id, remaining, "released object reference");
            return Ok(Release::Released { remaining });
        }

        if !self.store.delete_file_if_unreferenced(id).await? {
            debug!(file_id = %id, "object already removed by a concurrent release");
            return Ok(Release::Released { remaining });
        }
        let chunks = self.store.delete_chunks(id).await?;
        info!(file_id = %id, chunks, "deleted unreferenced object");
        Ok(Release::Deleted { chunks })
    }
}
