//! Admission and rate control for chunk uploads.
//!
//! Three independent gates, applied in this order:
//! 1. a per-tenant sliding-window request limiter,
//! 2. a global session slot (bounded semaphore, shared by every in-flight
//!    request of the same session),
//! 3. a per-session chunk slot (bounded semaphore per session).
//!
//! Waiting on either semaphore is bounded by a timeout and fails closed.
//! [`UploadPermit`] releases whatever it holds when dropped.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::{GridError, GridResult, LimitsConfig, SessionId};

const MAX_IDLE_WINDOWS: usize = 1024;

/// Counts requests within a trailing time window
#[derive(Debug)]
pub struct SlidingWindowLimiter {
    window: Duration,
    max_requests: usize,
    hits: Mutex<VecDeque<Instant>>,
}

impl SlidingWindowLimiter {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            window,
            max_requests,
            hits: Mutex::new(VecDeque::with_capacity(max_requests.min(1024))),
        }
    }

    pub fn try_acquire(&self) -> bool {
        self.try_acquire_at(Instant::now())
    }

    /// Evict hits older than the window, then admit iff below the ceiling
    pub fn try_acquire_at(&self, now: Instant) -> bool {
        let mut hits = self.hits.lock();
        Self::evict(&mut hits, now, self.window);
        if hits.len() >= self.max_requests {
            return false;
        }
        hits.push_back(now);
        true
    }

    /// Requests still admissible in the current window
    pub fn remaining(&self) -> usize {
        let mut hits = self.hits.lock();
        Self::evict(&mut hits, Instant::now(), self.window);
        self.max_requests.saturating_sub(hits.len())
    }

    pub fn max_requests(&self) -> usize {
        self.max_requests
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    fn is_idle(&self, now: Instant) -> bool {
        let mut hits = self.hits.lock();
        Self::evict(&mut hits, now, self.window);
        hits.is_empty()
    }

    fn evict(hits: &mut VecDeque<Instant>, now: Instant, window: Duration) {
        while let Some(oldest) = hits.front() {
            if now.saturating_duration_since(*oldest) < window {
                break;
            }
            hits.pop_front();
        }
    }
}

struct SessionLane {
    chunks: Arc<Semaphore>,
    _admission: OwnedSemaphorePermit,
    in_flight: usize,
}

type Lanes = Arc<Mutex<HashMap<SessionId, SessionLane>>>;

/// Session admission, per-session fan-out and per-tenant request rate
pub struct ConcurrencyController {
    limits: LimitsConfig,
    admission: Arc<Semaphore>,
    lanes: Lanes,
    windows: Mutex<HashMap<String, Arc<SlidingWindowLimiter>>>,
}

impl ConcurrencyController {
    pub fn new(limits: LimitsConfig) -> Self {
        Self {
            admission: Arc::new(Semaphore::new(limits.max_concurrent_sessions)),
            lanes: Arc::new(Mutex::new(HashMap::new())),
            windows: Mutex::new(HashMap::new()),
            limits,
        }
    }

    pub fn limits(&self) -> &LimitsConfig {
        &self.limits
    }

    /// Sessions currently holding an admission slot
    pub fn active_sessions(&self) -> usize {
        self.limits.max_concurrent_sessions - self.admission.available_permits()
    }

    /// Request-rate gate for one tenant
    pub fn check_rate(&self, tenant_id: &str) -> GridResult<()> {
        let limiter = self.window_for(tenant_id);
        if limiter.try_acquire() {
            return Ok(());
        }
        warn!(tenant_id, "upload request rate limited");
        Err(GridError::RateLimited {
            limit: limiter.max_requests(),
            window_secs: limiter.window().as_secs(),
        })
    }

    /// Run all three gates for one chunk write of `session_id`
    pub async fn admit_chunk(&self, tenant_id: &str, session_id: &SessionId) -> GridResult<UploadPermit> {
        self.check_rate(tenant_id)?;
        let (mut permit, chunks) = self.enter_session(session_id).await?;

        let timeout = self.limits.chunk_slot_timeout;
        match tokio::time::timeout(timeout, chunks.acquire_owned()).await {
            Ok(Ok(chunk)) => {
                permit.chunk = Some(chunk);
                Ok(permit)
            }
            _ => {
                debug!(session_id = %session_id, "no chunk slot available");
                Err(GridError::SlotUnavailable {
                    slot: "chunk",
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Join the session's lane, taking a global admission slot if the
    /// session holds none yet
    async fn enter_session(&self, session_id: &SessionId) -> GridResult<(UploadPermit, Arc<Semaphore>)> {
        if let Some(joined) = self.try_join(session_id) {
            return Ok(joined);
        }

        let timeout = self.limits.session_slot_timeout;
        match tokio::time::timeout(timeout, self.admission.clone().acquire_owned()).await {
            Ok(Ok(admission)) => Ok(self.join_with(session_id, admission)),
            _ => {
                debug!(session_id = %session_id, "no session slot available");
                Err(GridError::SlotUnavailable {
                    slot: "session",
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Join a lane that already holds an admission slot
    fn try_join(&self, session_id: &SessionId) -> Option<(UploadPermit, Arc<Semaphore>)> {
        let mut lanes = self.lanes.lock();
        let lane = lanes.get_mut(session_id)?;
        lane.in_flight += 1;
        Some((self.permit(session_id), lane.chunks.clone()))
    }

    /// Join or open a lane with a freshly acquired admission slot. If another
    /// request opened the lane meanwhile, `admission` is surplus and dropped.
    fn join_with(
        &self,
        session_id: &SessionId,
        admission: OwnedSemaphorePermit,
    ) -> (UploadPermit, Arc<Semaphore>) {
        let mut lanes = self.lanes.lock();
        let per_session = self.limits.max_concurrent_chunks_per_session;
        let lane = lanes.entry(session_id.clone()).or_insert_with(|| SessionLane {
            chunks: Arc::new(Semaphore::new(per_session)),
            _admission: admission,
            in_flight: 0,
        });
        lane.in_flight += 1;
        (self.permit(session_id), lane.chunks.clone())
    }

    fn permit(&self, session_id: &SessionId) -> UploadPermit {
        UploadPermit {
            lanes: self.lanes.clone(),
            session_id: session_id.clone(),
            chunk: None,
        }
    }

    fn window_for(&self, tenant_id: &str) -> Arc<SlidingWindowLimiter> {
        let mut windows = self.windows.lock();
        if windows.len() > MAX_IDLE_WINDOWS {
            let now = Instant::now();
            windows.retain(|_, w| !w.is_idle(now));
        }
        windows
            .entry(tenant_id.to_string())
            .or_insert_with(|| {
                Arc::new(SlidingWindowLimiter::new(
                    self.limits.max_requests_per_window,
                    self.limits.rate_window,
                ))
            })
            .clone()
    }
}

/// Holds a chunk slot and a share of the session's admission slot
pub struct UploadPermit {
    lanes: Lanes,
    session_id: SessionId,
    chunk: Option<OwnedSemaphorePermit>,
}

impl UploadPermit {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }
}

impl Drop for UploadPermit {
    fn drop(&mut self) {
        self.chunk.take();
        let mut lanes = self.lanes.lock();
        let drained = match lanes.get_mut(&self.session_id) {
            Some(lane) => {
                lane.in_flight = lane.in_flight.saturating_sub(1);
                lane.in_flight == 0
            }
            None => false,
        };
        if drained {
            // dropping the lane returns its admission permit
            lanes.remove(&self.session_id);
        }
    }
}
