//! Engine configuration.
//!
//! Everything is passed explicitly at construction; there is no process-wide
//! state. Values can be layered from the environment using the DogRS
//! convention (`PREFIX` + `SECTION__KEY`, lower-cased, `__` → `.`):
//!
//! ```bash
//! export DOG_GRIDFS__STANDARD_CHUNK_SIZE=1048576
//! export DOG_GRIDFS__LIMITS__MAX_CONCURRENT_SESSIONS=20
//! export DOG_GRIDFS__GC__SWEEP_INTERVAL_SECS=600
//! ```

use std::time::Duration;

use crate::layout::ChunkLayout;
use crate::{GridError, GridResult};

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

/// Environment prefix read by [`GridConfig::from_env`]
pub const ENV_PREFIX: &str = "DOG_GRIDFS__";

/// Configuration for the grid engine
#[derive(Debug, Clone)]
pub struct GridConfig {
    /// Fixed sub-chunk size of the backing store
    pub standard_chunk_size: u64,

    /// Absolute max declared size of a single object
    pub max_file_bytes: u64,

    /// How long an in-progress session lives without finishing
    pub session_ttl: Duration,

    /// Default chunk size picked by total size when the client sets none
    pub chunk_size_tiers: ChunkSizeTiers,

    pub limits: LimitsConfig,

    pub gc: GcConfig,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            standard_chunk_size: MIB,
            max_file_bytes: 100 * GIB,
            session_ttl: Duration::from_secs(24 * 3600),
            chunk_size_tiers: ChunkSizeTiers::default(),
            limits: LimitsConfig::default(),
            gc: GcConfig::default(),
        }
    }
}

impl GridConfig {
    /// Create a new config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_standard_chunk_size(mut self, bytes: u64) -> Self {
        self.standard_chunk_size = bytes;
        self
    }

    pub fn with_max_file_bytes(mut self, bytes: u64) -> Self {
        self.max_file_bytes = bytes;
        self
    }

    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = ttl;
        self
    }

    pub fn with_chunk_size_tiers(mut self, tiers: ChunkSizeTiers) -> Self {
        self.chunk_size_tiers = tiers;
        self
    }

    pub fn with_limits(mut self, limits: LimitsConfig) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_gc(mut self, gc: GcConfig) -> Self {
        self.gc = gc;
        self
    }

    /// Check internal consistency (tier sizes align with the sub-chunk size, limits are non-zero)
    pub fn validate(&self) -> GridResult<()> {
        if self.standard_chunk_size == 0 {
            return Err(GridError::invalid("standard_chunk_size must be positive"));
        }
        if self.max_file_bytes == 0 {
            return Err(GridError::invalid("max_file_bytes must be positive"));
        }
        for tier in self.chunk_size_tiers.tiers.iter().map(|t| t.chunk_size) {
            ChunkLayout::validate_chunk_size(tier, self.standard_chunk_size)?;
        }
        ChunkLayout::validate_chunk_size(self.chunk_size_tiers.fallback, self.standard_chunk_size)?;
        self.limits.validate()
    }

    /// Apply `key = value` pairs (dot-separated, lower-case keys) on top of
    /// the defaults. Unknown keys are ignored.
    pub fn from_pairs<I, K, V>(pairs: I) -> GridResult<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = Self::default();
        for (key, value) in pairs {
            config.apply(key.as_ref(), value.as_ref())?;
        }
        config.validate()?;
        Ok(config)
    }

    /// Read `DOG_GRIDFS__*` variables from the process environment
    pub fn from_env() -> GridResult<Self> {
        Self::from_pairs(std::env::vars().filter_map(|(key, value)| {
            key.strip_prefix(ENV_PREFIX)
                .map(|stripped| (stripped.to_lowercase().replace("__", "."), value))
        }))
    }

    fn apply(&mut self, key: &str, value: &str) -> GridResult<()> {
        match key {
            "standard_chunk_size" => self.standard_chunk_size = parse(key, value)?,
            "max_file_bytes" => self.max_file_bytes = parse(key, value)?,
            "session_ttl_hours" => {
                self.session_ttl = Duration::from_secs(parse::<u64>(key, value)? * 3600)
            }
            "limits.max_concurrent_sessions" => {
                self.limits.max_concurrent_sessions = parse(key, value)?
            }
            "limits.max_concurrent_chunks_per_session" => {
                self.limits.max_concurrent_chunks_per_session = parse(key, value)?
            }
            "limits.session_slot_timeout_ms" => {
                self.limits.session_slot_timeout = Duration::from_millis(parse(key, value)?)
            }
            "limits.chunk_slot_timeout_ms" => {
                self.limits.chunk_slot_timeout = Duration::from_millis(parse(key, value)?)
            }
            "limits.rate_window_secs" => {
                self.limits.rate_window = Duration::from_secs(parse(key, value)?)
            }
            "limits.max_requests_per_window" => {
                self.limits.max_requests_per_window = parse(key, value)?
            }
            "gc.sweep_interval_secs" => {
                self.gc.sweep_interval = Duration::from_secs(parse(key, value)?)
            }
            "gc.largest_objects" => self.gc.largest_objects = parse(key, value)?,
            _ => {}
        }
        Ok(())
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> GridResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| GridError::invalid(format!("invalid value {:?} for {}", value, key)))
}

/// Size-tiered default chunk sizes: smaller objects get smaller chunks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkSizeTiers {
    /// Ascending by `max_total_size`
    pub tiers: Vec<ChunkSizeTier>,
    /// Chunk size for objects larger than every tier
    pub fallback: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSizeTier {
    pub max_total_size: u64,
    pub chunk_size: u64,
}

impl Default for ChunkSizeTiers {
    fn default() -> Self {
        Self {
            tiers: vec![
                ChunkSizeTier { max_total_size: 10 * MIB, chunk_size: MIB },
                ChunkSizeTier { max_total_size: 100 * MIB, chunk_size: 2 * MIB },
                ChunkSizeTier { max_total_size: GIB, chunk_size: 5 * MIB },
            ],
            fallback: 10 * MIB,
        }
    }
}

impl ChunkSizeTiers {
    pub fn new(fallback: u64) -> Self {
        Self {
            tiers: Vec::new(),
            fallback,
        }
    }

    /// Add a tier, keeping the table sorted
    pub fn with_tier(mut self, max_total_size: u64, chunk_size: u64) -> Self {
        self.tiers.push(ChunkSizeTier { max_total_size, chunk_size });
        self.tiers.sort_by_key(|t| t.max_total_size);
        self
    }

    pub fn chunk_size_for(&self, total_size: u64) -> u64 {
        self.tiers
            .iter()
            .find(|t| total_size <= t.max_total_size)
            .map(|t| t.chunk_size)
            .unwrap_or(self.fallback)
    }
}

/// Admission and rate control limits
#[derive(Debug, Clone)]
pub struct LimitsConfig {
    /// Sessions allowed to upload at the same time
    pub max_concurrent_sessions: usize,

    /// Chunk writes in flight per session
    pub max_concurrent_chunks_per_session: usize,

    pub session_slot_timeout: Duration,

    pub chunk_slot_timeout: Duration,

    /// Trailing interval of the request limiter
    pub rate_window: Duration,

    /// Requests admitted per tenant within `rate_window`
    pub max_requests_per_window: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_concurrent_sessions: 10,
            max_concurrent_chunks_per_session: 3,
            session_slot_timeout: Duration::from_secs(5),
            chunk_slot_timeout: Duration::from_secs(30),
            rate_window: Duration::from_secs(60),
            max_requests_per_window: 600,
        }
    }
}

impl LimitsConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_concurrent_sessions(mut self, max: usize) -> Self {
        self.max_concurrent_sessions = max;
        self
    }

    pub fn with_max_concurrent_chunks_per_session(mut self, max: usize) -> Self {
        self.max_concurrent_chunks_per_session = max;
        self
    }

    pub fn with_slot_timeouts(mut self, session: Duration, chunk: Duration) -> Self {
        self.session_slot_timeout = session;
        self.chunk_slot_timeout = chunk;
        self
    }

    pub fn with_rate_limit(mut self, max_requests: usize, window: Duration) -> Self {
        self.max_requests_per_window = max_requests;
        self.rate_window = window;
        self
    }

    fn validate(&self) -> GridResult<()> {
        if self.max_concurrent_sessions == 0 || self.max_concurrent_chunks_per_session == 0 {
            return Err(GridError::invalid("concurrency limits must be positive"));
        }
        if self.max_requests_per_window == 0 || self.rate_window.is_zero() {
            return Err(GridError::invalid("rate limit window and ceiling must be positive"));
        }
        Ok(())
    }
}

/// Background cleanup settings
#[derive(Debug, Clone)]
pub struct GcConfig {
    pub sweep_interval: Duration,

    /// How many objects `storage_stats` reports as largest
    pub largest_objects: usize,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(3600),
            largest_objects: 10,
        }
    }
}

impl GcConfig {
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_largest_objects(mut self, n: usize) -> Self {
        self.largest_objects = n;
        self
    }
}
