use serde::{Deserialize, Serialize};

/// Top-level configuration for the storage core.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OspreyConfig {
    #[serde(default)]
    pub raft: RaftConfig,
    #[serde(default)]
    pub wal: WalConfig,
    #[serde(default)]
    pub backend: BackendSection,
}

/// Replicated-log tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaftConfig {
    /// Byte cap on the entries handed out by one `next_entries` call.
    #[serde(default = "default_max_committed_size_per_ready")]
    pub max_committed_size_per_ready: u64,
    /// How many entries to retain in the stable store behind a snapshot so
    /// slow followers can catch up without a full snapshot transfer.
    #[serde(default = "default_snapshot_catchup_entries")]
    pub snapshot_catchup_entries: u64,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            max_committed_size_per_ready: default_max_committed_size_per_ready(),
            snapshot_catchup_entries: default_snapshot_catchup_entries(),
        }
    }
}

/// Write-ahead log tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalConfig {
    /// Preallocated size of each segment file in bytes.
    #[serde(default = "default_segment_size_bytes")]
    pub segment_size_bytes: u64,
    /// Skip every fsync. Data loss on crash; for benchmarks only.
    #[serde(default)]
    pub unsafe_no_fsync: bool,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            segment_size_bytes: default_segment_size_bytes(),
            unsafe_no_fsync: false,
        }
    }
}

/// Backend (B-tree store) tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendSection {
    /// Maximum time between two batch-transaction commits, in milliseconds.
    #[serde(default = "default_batch_interval_ms")]
    pub batch_interval_ms: u64,
    /// Maximum mutations coalesced into one batch transaction before it
    /// commits on unlock.
    #[serde(default = "default_batch_limit")]
    pub batch_limit: usize,
    /// In-memory cache budget handed to the store, in bytes.
    #[serde(default = "default_cache_size_bytes")]
    pub cache_size_bytes: usize,
    /// Skip store fsyncs. Data loss on crash; for benchmarks only.
    #[serde(default)]
    pub unsafe_no_fsync: bool,
}

impl Default for BackendSection {
    fn default() -> Self {
        Self {
            batch_interval_ms: default_batch_interval_ms(),
            batch_limit: default_batch_limit(),
            cache_size_bytes: default_cache_size_bytes(),
            unsafe_no_fsync: false,
        }
    }
}

fn default_max_committed_size_per_ready() -> u64 {
    64 * 1024 * 1024
}

fn default_snapshot_catchup_entries() -> u64 {
    10_000
}

fn default_segment_size_bytes() -> u64 {
    64 * 1024 * 1024
}

fn default_batch_interval_ms() -> u64 {
    100
}

fn default_batch_limit() -> usize {
    10_000
}

fn default_cache_size_bytes() -> usize {
    1024 * 1024 * 1024
}
