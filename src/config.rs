//! Configuration for the store, the Smart-HTTP surface, and background jobs.

use serde::{Deserialize, Serialize};

/// Objects larger than this are written to the raw blob bucket instead of
/// the tablet data column.
pub const DEFAULT_INLINE_THRESHOLD: usize = 1024 * 1024;

/// Default GC grace period: protects in-flight pushes whose ref update has
/// not landed yet.
pub const DEFAULT_GC_GRACE_MS: i64 = 14 * 24 * 60 * 60 * 1000;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct StoreConfig {
    /// Per-repository key prefix inside the bucket, e.g. `acme/widgets`.
    pub repo_prefix: String,
    /// Inline-vs-external size cutover in bytes.
    pub inline_threshold: usize,
    /// Flush when the buffer holds at least this many objects.
    pub max_buffer_objects: usize,
    /// Flush when the buffer holds at least this many payload bytes.
    pub max_buffer_bytes: usize,
    pub bloom: BloomConfig,
    pub gc: GcConfig,
    pub chunk: ChunkConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            repo_prefix: "repo".to_string(),
            inline_threshold: DEFAULT_INLINE_THRESHOLD,
            max_buffer_objects: 512,
            max_buffer_bytes: 8 * 1024 * 1024,
            bloom: BloomConfig::default(),
            gc: GcConfig::default(),
            chunk: ChunkConfig::default(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BloomConfig {
    /// Bits per segment vector.
    pub segment_bits: usize,
    /// A new segment is started once the active one holds this many items.
    pub segment_item_threshold: usize,
    /// Older segments are OR-compacted once the count exceeds this.
    pub max_segments: usize,
    /// Maximum resident bytes of the exact cache.
    pub exact_cache_bytes: usize,
    /// When set, an `absent` answer is double-checked against the tablets
    /// and the filter self-heals on a hit.
    pub verify: bool,
}

impl Default for BloomConfig {
    fn default() -> Self {
        Self {
            segment_bits: 1 << 16,
            segment_item_threshold: 4096,
            max_segments: 8,
            exact_cache_bytes: 4 * 1024 * 1024,
            verify: false,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct GcConfig {
    /// Objects must be unreferenced for longer than this before sweep.
    pub grace_period_ms: i64,
    /// Upper bound of deletions per sweep.
    pub max_delete_count: usize,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: DEFAULT_GC_GRACE_MS,
            max_delete_count: 10_000,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ChunkConfig {
    /// Target super-chunk size.
    pub target_chunk_bytes: usize,
    /// Only objects at or below this size are candidates for chunking.
    pub small_object_threshold: usize,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            target_chunk_bytes: 2 * 1024 * 1024,
            small_object_threshold: 64 * 1024,
        }
    }
}

/// Per-session caps for a Smart-HTTP exchange. Breaching any cap aborts the
/// session with a channel-3 error and a non-2xx response.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SessionLimits {
    pub max_wants: usize,
    pub max_haves_per_round: usize,
    pub max_rounds: usize,
    pub max_bytes_in: usize,
    pub deadline_ms: u64,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_wants: 4096,
            max_haves_per_round: 4096,
            max_rounds: 64,
            max_bytes_in: 512 * 1024 * 1024,
            deadline_ms: 10 * 60 * 1000,
        }
    }
}

/// Token-based auth for the HTTP surface. An empty token set means open
/// mode: anonymous access is allowed.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct AuthConfig {
    pub tokens: Vec<String>,
    pub realm: String,
}

impl AuthConfig {
    pub fn open(&self) -> bool {
        self.tokens.is_empty()
    }
}

/// Top-level server configuration.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ServerConfig {
    pub addr: String,
    pub auth: AuthConfig,
    pub limits: SessionLimits,
    /// Base URL advertised in LFS batch responses.
    pub external_base: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8418".to_string(),
            auth: AuthConfig {
                tokens: Vec::new(),
                realm: "git-tablet".to_string(),
            },
            limits: SessionLimits::default(),
            external_base: "http://127.0.0.1:8418".to_string(),
        }
    }
}
