//! Tunables for indexes and parallel scans.

use serde::{Deserialize, Serialize};

/// Per-index layout settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Records a page holds before it is split.
    pub page_capacity: usize,
    /// Leading key fields that identify a row. Cursors store only this prefix.
    pub n_unique: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            page_capacity: 64,
            n_unique: 1,
        }
    }
}

/// Settings of the parallel reader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    /// Ranges are split at runtime only when the partitioned subtree is at least this deep.
    pub split_threshold: usize,
    /// Pages visited between two checks of the transaction interrupt flag.
    pub interrupt_probe_pages: usize,
    /// No-wait attempts to step to the next level-one page before falling back to a blocking
    /// step.
    pub level_one_retries: usize,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            split_threshold: 3,
            interrupt_probe_pages: 50_000,
            level_one_retries: 10,
        }
    }
}
