//! In-process stand-ins for the ledger, remote peers and their file servers.

use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use ledger::{AccountBlock, Address, CompressedFileMeta, Hash, SnapshotBlock};
use networking::message::{
    encode_file, AccountBlocks, ExceptionCode, FileBundle, FileList, GetAccountBlocks, GetChunk,
    GetSubLedger, Msg, MsgCode, SubLedger,
};
use networking::{Chain, FileClient, MsgWriter, Net, Peer};
use rand::Rng;
use tracing::{debug, warn};

/// Heights per compressed file served by simulated peers.
const FILE_SPAN: u64 = 3_600;

/// Heights per inline chunk for the remainder after the files.
const CHUNK_SPAN: u64 = 500;

/// Every hundredth snapshot height carries one account block.
const ACCOUNT_BLOCK_INTERVAL: u64 = 100;

/// Deterministic snapshot block at `height`, identical on every simulated node.
pub fn snapshot_at(height: u64) -> SnapshotBlock {
    if height == 0 {
        return SnapshotBlock::genesis();
    }
    SnapshotBlock::new(Hash::digest(&(height - 1).to_be_bytes()), height, height * 1_000)
}

fn account_blocks_in(from: u64, to: u64) -> Vec<AccountBlock> {
    (from..=to)
        .filter(|h| h % ACCOUNT_BLOCK_INTERVAL == 0)
        .map(|h| {
            let address = Address([(h / ACCOUNT_BLOCK_INTERVAL % 256) as u8; 20]);
            AccountBlock::new_send(address, Hash::zero(), h / ACCOUNT_BLOCK_INTERVAL, 1, h)
        })
        .collect()
}

fn bundle(from: u64, to: u64) -> FileBundle {
    FileBundle {
        snapshot_blocks: (from..=to).map(snapshot_at).collect(),
        account_blocks: account_blocks_in(from, to),
    }
}

/// Local ledger that only tracks its head.
pub struct LocalChain {
    head: parking_lot::RwLock<SnapshotBlock>,
}

impl LocalChain {
    pub fn new(height: u64) -> Self {
        Self {
            head: parking_lot::RwLock::new(snapshot_at(height)),
        }
    }

    /// Apply a block if it is above the head.
    pub fn apply(&self, block: &SnapshotBlock) {
        let mut head = self.head.write();
        if block.height > head.height {
            *head = block.clone();
        }
    }

    pub fn height(&self) -> u64 {
        self.head.read().height
    }
}

impl Chain for LocalChain {
    fn get_latest_snapshot_block(&self) -> Result<SnapshotBlock> {
        Ok(self.head.read().clone())
    }

    fn get_genesis_block(&self) -> Result<SnapshotBlock> {
        Ok(SnapshotBlock::genesis())
    }
}

/// File server shared by all simulated peers. Bundles are built on demand.
#[derive(Default)]
pub struct SimFiles;

#[async_trait]
impl FileClient for SimFiles {
    async fn fetch(&self, peer: &Peer, file: &CompressedFileMeta, nonce: u64) -> Result<Vec<u8>> {
        if file.start_height > peer.height() || file.end_height > peer.height() {
            bail!("{} does not hold {}", peer.id(), file.filename);
        }
        debug!(peer = %peer.id(), file = %file.filename, nonce, "Serving file");
        Ok(encode_file(&bundle(file.start_height, file.end_height))?)
    }
}

/// Transport of a simulated remote node. Requests are answered after a short
/// delay by feeding the reply back into the engine.
pub struct SimPeer {
    id: String,
    height: u64,
    net: Weak<Net>,
    latency: Duration,
    drop_rate: f64,
}

impl SimPeer {
    pub fn new(id: &str, height: u64, net: Weak<Net>, latency: Duration, drop_rate: f64) -> Self {
        Self {
            id: id.to_string(),
            height,
            net,
            latency,
            drop_rate,
        }
    }

    fn file_list(&self, from: u64, to: u64) -> FileList {
        let mut list = FileList {
            nonce: rand::thread_rng().gen(),
            ..Default::default()
        };
        let mut start = from;
        while start + FILE_SPAN - 1 <= to {
            let end = start + FILE_SPAN - 1;
            list.files.push(CompressedFileMeta {
                filename: format!("subgraph_{start}_{end}"),
                file_size: 0,
                start_height: start,
                end_height: end,
                blocks_count: FILE_SPAN,
                hash: Hash::zero(),
            });
            start = end + 1;
        }
        while start <= to {
            let end = to.min(start + CHUNK_SPAN - 1);
            list.chunks.push([start, end]);
            start = end + 1;
        }
        list
    }

    fn reply(&self, msg: &Msg) -> Result<Option<Msg>> {
        let reply = match msg.code {
            MsgCode::GetSubLedger => {
                let req: GetSubLedger = msg.decode()?;
                let to = (req.from.height + req.count).saturating_sub(1).min(self.height);
                Msg::new(MsgCode::FileList, msg.id, &self.file_list(req.from.height, to))?
            }
            MsgCode::GetChunk => {
                let req: GetChunk = msg.decode()?;
                if req.end > self.height {
                    let missing = Msg::new(MsgCode::Exception, msg.id, &ExceptionCode::Missing)?;
                    return Ok(Some(missing));
                }
                let FileBundle {
                    snapshot_blocks,
                    account_blocks,
                } = bundle(req.start, req.end);
                Msg::new(
                    MsgCode::SubLedger,
                    msg.id,
                    &SubLedger {
                        snapshot_blocks,
                        account_blocks,
                    },
                )?
            }
            MsgCode::GetAccountBlocks => {
                let req: GetAccountBlocks = msg.decode()?;
                let blocks = account_blocks_in(1, self.height)
                    .into_iter()
                    .filter(|b| b.account_address == req.address)
                    .take(req.count as usize)
                    .collect();
                Msg::new(
                    MsgCode::AccountBlocks,
                    msg.id,
                    &AccountBlocks {
                        address: req.address,
                        blocks,
                    },
                )?
            }
            _ => return Ok(None),
        };
        Ok(Some(reply))
    }
}

#[async_trait]
impl MsgWriter for SimPeer {
    async fn write_msg(&self, msg: Msg) -> Result<()> {
        if self.drop_rate > 0.0 && rand::thread_rng().gen_bool(self.drop_rate.min(1.0)) {
            debug!(peer = %self.id, code = %msg.code, id = msg.id, "Simulated peer dropped request");
            return Ok(());
        }

        let Some(reply) = self.reply(&msg)? else {
            return Ok(());
        };
        let Some(net) = self.net.upgrade() else {
            bail!("engine is gone");
        };

        let id = self.id.clone();
        let latency = self.latency;
        tokio::spawn(async move {
            tokio::time::sleep(latency).await;
            if let Err(err) = net.handle_msg(&id, reply) {
                warn!(peer = %id, error = %err, "Failed to handle simulated reply");
            }
        });
        Ok(())
    }
}
