/// Sync configuration.
///
/// Operational parameters for synchronization: piece sizes, timeouts, retry
/// bounds and filter sizing.
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::serde_utils::{duration_millis, duration_secs};

/// Minimum snapshot blocks per sub-ledger request.
pub const MIN_BLOCKS: u64 = 3600;

/// Maximum snapshot blocks per sub-ledger request.
pub const MAX_BLOCKS: u64 = 10800;

/// Attempts after the first before a request gives up.
pub const MAX_RETRY: u32 = 3;

pub const SUB_LEDGER_TIMEOUT_SECS: u64 = 30;
pub const CHUNK_TIMEOUT_SECS: u64 = 30;
pub const FILE_TIMEOUT_SECS: u64 = 120;

/// Interval between expiration sweeps of the request pool (in milliseconds).
pub const SWEEP_INTERVAL_MILLIS: u64 = 1_000;

/// Upper bound on waiting for a peer's send gate plus the write itself.
pub const SEND_TIMEOUT_SECS: u64 = 10;

/// Capacity of the global received-block filter.
pub const BLOCK_RECORD_CAPACITY: usize = 10_000;

pub const FILTER_FALSE_POSITIVE_RATE: f64 = 0.001;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    pub network_id: u64,
    pub min_blocks: u64,
    pub max_blocks: u64,
    pub max_retry: u32,
    #[serde(with = "duration_secs")]
    pub sub_ledger_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub chunk_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub file_timeout: Duration,
    #[serde(with = "duration_millis")]
    pub sweep_interval: Duration,
    #[serde(with = "duration_secs")]
    pub send_timeout: Duration,
    pub block_record_capacity: usize,
    pub false_positive_rate: f64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            network_id: 1,
            min_blocks: MIN_BLOCKS,
            max_blocks: MAX_BLOCKS,
            max_retry: MAX_RETRY,
            sub_ledger_timeout: Duration::from_secs(SUB_LEDGER_TIMEOUT_SECS),
            chunk_timeout: Duration::from_secs(CHUNK_TIMEOUT_SECS),
            file_timeout: Duration::from_secs(FILE_TIMEOUT_SECS),
            sweep_interval: Duration::from_millis(SWEEP_INTERVAL_MILLIS),
            send_timeout: Duration::from_secs(SEND_TIMEOUT_SECS),
            block_record_capacity: BLOCK_RECORD_CAPACITY,
            false_positive_rate: FILTER_FALSE_POSITIVE_RATE,
        }
    }
}

impl SyncConfig {
    /// Check internal consistency. Returns a description of the first problem.
    pub fn validate(&self) -> Result<(), String> {
        if self.min_blocks == 0 {
            return Err("min_blocks must be positive".into());
        }
        if self.max_blocks < self.min_blocks {
            return Err(format!(
                "max_blocks ({}) must be at least min_blocks ({})",
                self.max_blocks, self.min_blocks
            ));
        }
        if self.sweep_interval.is_zero() {
            return Err("sweep_interval must be positive".into());
        }
        if !(self.false_positive_rate > 0.0 && self.false_positive_rate < 1.0) {
            return Err("false_positive_rate must be in (0, 1)".into());
        }
        Ok(())
    }
}
