//! Configuration for ArborDB trees.

use crate::{ArborError, Result};
use serde::{Deserialize, Serialize};

/// Per-commit eviction depth that disables eviction entirely.
pub const EVICT_DISABLED: u8 = 255;

/// Maximum key size accepted at the public API (64 KiB).
pub const MAX_KEY_SIZE: usize = 64 * 1024;

/// Maximum value size accepted at the public API.
pub const MAX_VALUE_SIZE: usize = (2 * 1024 * 1024 * 1024) - 1;

/// Tuning options for a versioned tree and its store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeOptions {
    /// Depth at which per-commit eviction begins; 255 disables it.
    pub evict_depth: u8,
    /// Enables WAL records in `kv.log`.
    pub write_wal: bool,
    /// If true, compaction re-copies kv payload and deduplicates keys;
    /// if false, it reuses the old kv log unchanged.
    pub compact_wal: bool,
    /// Skip all compaction.
    pub disable_compaction: bool,
    /// Minimum orphan/total ratio to trigger compaction.
    pub compaction_orphan_ratio: f64,
    /// Age offset subtracted from the retention bottom when computing
    /// the compaction age target.
    pub compaction_orphan_age: u32,
    /// Number of recent versions retained uncompacted.
    pub retain_versions: u32,
    /// Minimum interval between cleanup cycles, in seconds.
    pub min_compaction_seconds: u64,
    /// Size threshold in bytes at which the active writer is sealed.
    pub changeset_max_target: u64,
    /// Size cap in bytes for a compacted or joined changeset.
    pub compaction_max_target: u64,
    /// Force compaction of any changeset with orphans once it is this
    /// many versions behind; 0 disables the trigger.
    pub compact_after_versions: u32,
    /// Version stride for shared-reader refresh; 0 refreshes on every
    /// version.
    pub reader_update_interval: u32,
    /// Background fsync interval in milliseconds; 0 or negative
    /// disables the fsync loop.
    pub fsync_interval_ms: i64,
    /// Available-memory floor in bytes the memory monitor polls
    /// against; 0 disables the monitor.
    pub evict_threshold_bytes: u64,
}

impl Default for TreeOptions {
    fn default() -> Self {
        Self {
            evict_depth: EVICT_DISABLED,
            write_wal: true,
            compact_wal: true,
            disable_compaction: false,
            compaction_orphan_ratio: 0.6,
            compaction_orphan_age: 0,
            retain_versions: 100,
            min_compaction_seconds: 60,
            changeset_max_target: 128 * 1024 * 1024, // 128 MiB
            compaction_max_target: 1024 * 1024 * 1024, // 1 GiB
            compact_after_versions: 0,
            reader_update_interval: 100,
            fsync_interval_ms: 0,
            evict_threshold_bytes: 0,
        }
    }
}

impl TreeOptions {
    /// Returns the reader refresh stride, mapping 0 to "every version".
    pub fn effective_reader_interval(&self) -> u32 {
        if self.reader_update_interval == 0 {
            1
        } else {
            self.reader_update_interval
        }
    }

    /// Returns true if per-commit depth eviction is enabled.
    pub fn evict_enabled(&self) -> bool {
        self.evict_depth != EVICT_DISABLED
    }

    /// Returns true if the background fsync loop should run.
    pub fn fsync_loop_enabled(&self) -> bool {
        self.fsync_interval_ms > 0
    }

    /// Validates option ranges.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.compaction_orphan_ratio) {
            return Err(ArborError::InvalidOption {
                name: "compaction_orphan_ratio",
                value: self.compaction_orphan_ratio.to_string(),
            });
        }
        if self.changeset_max_target == 0 {
            return Err(ArborError::InvalidOption {
                name: "changeset_max_target",
                value: "0".to_string(),
            });
        }
        if self.compaction_max_target < self.changeset_max_target {
            return Err(ArborError::InvalidOption {
                name: "compaction_max_target",
                value: self.compaction_max_target.to_string(),
            });
        }
        Ok(())
    }
}
