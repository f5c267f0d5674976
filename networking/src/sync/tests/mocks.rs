use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use ledger::{AccountBlock, Address, CompressedFileMeta, Hash, SnapshotBlock};
use parking_lot::{Mutex, RwLock};

use crate::message::{FileBundle, Msg, MsgCode, SubLedger, encode_file};
use crate::peer::{MsgWriter, Peer};
use crate::sync::SyncConfig;
use crate::types::{BlockBatch, BlockSink, Chain, FileClient};

/// Transport stub that records outbound messages.
#[derive(Default)]
pub struct MockWriter {
    sent: Mutex<Vec<Msg>>,
    fail: bool,
    hang: bool,
}

impl MockWriter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail: true,
            ..Default::default()
        })
    }

    pub fn hanging() -> Arc<Self> {
        Arc::new(Self {
            hang: true,
            ..Default::default()
        })
    }

    pub fn sent(&self) -> Vec<Msg> {
        self.sent.lock().clone()
    }

    pub fn sent_with(&self, code: MsgCode) -> Vec<Msg> {
        self.sent.lock().iter().filter(|m| m.code == code).cloned().collect()
    }
}

#[async_trait]
impl MsgWriter for MockWriter {
    async fn write_msg(&self, msg: Msg) -> Result<()> {
        if self.hang {
            std::future::pending::<()>().await;
        }
        if self.fail {
            bail!("connection reset");
        }
        self.sent.lock().push(msg);
        Ok(())
    }
}

pub fn mock_peer(id: &str, height: u64, writer: Arc<MockWriter>) -> Peer {
    Peer::new(id, Hash::digest(id.as_bytes()), height, writer)
}

/// Sink that keeps every batch it receives.
#[derive(Default)]
pub struct CollectingSink {
    pub batches: Mutex<Vec<BlockBatch>>,
    pub fetched: Mutex<Vec<BlockBatch>>,
}

impl BlockSink for CollectingSink {
    fn receive_batch(&self, batch: BlockBatch) {
        self.batches.lock().push(batch);
    }

    fn receive_fetched(&self, batch: BlockBatch) {
        self.fetched.lock().push(batch);
    }
}

/// File server stub keyed by file name.
#[derive(Default)]
pub struct MockFiles {
    files: RwLock<HashMap<String, Vec<u8>>>,
    /// Peers whose downloads fail.
    broken: RwLock<HashSet<String>>,
    pub fetches: Mutex<Vec<(String, String)>>,
}

impl MockFiles {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Serve the snapshot blocks `[from, to]` as one file and return its meta.
    pub fn serve(&self, from: u64, to: u64) -> CompressedFileMeta {
        let bundle = FileBundle {
            snapshot_blocks: snapshot_blocks(from, to),
            account_blocks: Vec::new(),
        };
        let data = encode_file(&bundle).expect("encode file");
        let meta = CompressedFileMeta {
            filename: format!("subgraph_{from}_{to}"),
            file_size: data.len() as u64,
            start_height: from,
            end_height: to,
            blocks_count: to - from + 1,
            hash: Hash::digest(&data),
        };
        self.files.write().insert(meta.filename.clone(), data);
        meta
    }

    pub fn break_peer(&self, id: &str) {
        self.broken.write().insert(id.to_string());
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.lock().len()
    }
}

#[async_trait]
impl FileClient for MockFiles {
    async fn fetch(&self, peer: &Peer, file: &CompressedFileMeta, _nonce: u64) -> Result<Vec<u8>> {
        self.fetches
            .lock()
            .push((peer.id().to_string(), file.filename.clone()));
        if self.broken.read().contains(peer.id()) {
            bail!("file server of {} unreachable", peer.id());
        }
        match self.files.read().get(&file.filename) {
            Some(data) => Ok(data.clone()),
            None => bail!("no such file {}", file.filename),
        }
    }
}

/// In-memory ledger that grows as snapshot blocks are applied.
pub struct MemoryChain {
    blocks: RwLock<Vec<SnapshotBlock>>,
}

impl MemoryChain {
    pub fn new(height: u64) -> Arc<Self> {
        Arc::new(Self {
            blocks: RwLock::new(snapshot_blocks(0, height)),
        })
    }

    /// Append a block if it extends the head.
    pub fn apply(&self, block: &SnapshotBlock) {
        let mut blocks = self.blocks.write();
        if blocks.last().map(|head| head.height + 1) == Some(block.height) {
            blocks.push(block.clone());
        }
    }

    pub fn height(&self) -> u64 {
        self.blocks.read().last().map_or(0, |b| b.height)
    }
}

impl Chain for MemoryChain {
    fn get_latest_snapshot_block(&self) -> Result<SnapshotBlock> {
        match self.blocks.read().last() {
            Some(block) => Ok(block.clone()),
            None => bail!("empty chain"),
        }
    }

    fn get_genesis_block(&self) -> Result<SnapshotBlock> {
        match self.blocks.read().first() {
            Some(block) => Ok(block.clone()),
            None => bail!("empty chain"),
        }
    }
}

/// Deterministic snapshot blocks for heights `[from, to]`.
///
/// Every height maps to the same block regardless of the range asked for,
/// so blocks built by different helpers agree.
pub fn snapshot_blocks(from: u64, to: u64) -> Vec<SnapshotBlock> {
    (from..=to).map(snapshot_block).collect()
}

pub fn snapshot_block(height: u64) -> SnapshotBlock {
    if height == 0 {
        return SnapshotBlock::genesis();
    }
    SnapshotBlock::new(Hash::digest(&(height - 1).to_be_bytes()), height, height * 1_000)
}

pub fn account_block(seed: u8, height: u64, snapshot_height: u64) -> AccountBlock {
    AccountBlock::new_send(Address([seed; 20]), Hash::zero(), height, 100, snapshot_height)
}

/// `SubLedger` response carrying the snapshot blocks `[from, to]`.
pub fn sub_ledger_reply(id: u64, from: u64, to: u64) -> Msg {
    Msg::new(
        MsgCode::SubLedger,
        id,
        &SubLedger {
            snapshot_blocks: snapshot_blocks(from, to),
            account_blocks: Vec::new(),
        },
    )
    .expect("encode sub-ledger")
}

/// Small limits and timeouts so tests run quickly.
pub fn test_config() -> SyncConfig {
    SyncConfig {
        min_blocks: 10,
        max_blocks: 30,
        max_retry: 3,
        sub_ledger_timeout: Duration::from_millis(300),
        chunk_timeout: Duration::from_millis(300),
        file_timeout: Duration::from_millis(300),
        sweep_interval: Duration::from_millis(20),
        send_timeout: Duration::from_millis(200),
        ..SyncConfig::default()
    }
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually(check: impl Fn() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
