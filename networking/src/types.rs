use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use ledger::{AccountBlock, CompressedFileMeta, SnapshotBlock};
use serde::Serialize;

use crate::peer::{Peer, PeerInfo};
use crate::serde_utils::{duration_secs, quoted_u64};
use crate::sync::SyncState;

/// Read access to the local ledger.
pub trait Chain: Send + Sync {
    fn get_latest_snapshot_block(&self) -> Result<SnapshotBlock>;
    fn get_genesis_block(&self) -> Result<SnapshotBlock>;
}

/// Bulk transfer of compressed ledger files, served outside the message
/// protocol.
#[async_trait]
pub trait FileClient: Send + Sync {
    /// Download one file from `peer`. Returns the compressed bytes.
    async fn fetch(&self, peer: &Peer, file: &CompressedFileMeta, nonce: u64) -> Result<Vec<u8>>;
}

/// Destination for blocks downloaded by sync requests.
pub trait BlockSink: Send + Sync {
    /// Blocks belonging to a sync range. Delivered downstream in height order.
    fn receive_batch(&self, batch: BlockBatch);

    /// Blocks fetched on request outside of range sync.
    fn receive_fetched(&self, batch: BlockBatch) {
        self.receive_batch(batch);
    }
}

/// Blocks covering the snapshot heights `[from, to]`, plus the account
/// blocks snapshotted in that range.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockBatch {
    pub from: u64,
    pub to: u64,
    pub snapshot_blocks: Vec<SnapshotBlock>,
    pub account_blocks: Vec<AccountBlock>,
}

impl BlockBatch {
    pub fn len(&self) -> usize {
        self.snapshot_blocks.len() + self.account_blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot_blocks.is_empty() && self.account_blocks.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetStatus {
    pub peers: Vec<PeerInfo>,
    pub running: bool,
    #[serde(with = "duration_secs")]
    pub uptime: Duration,
    pub sync_state: SyncState,
    #[serde(with = "quoted_u64")]
    pub from_height: u64,
    #[serde(with = "quoted_u64")]
    pub target_height: u64,
}
