/// Ordered reassembly of downloaded blocks.
///
/// Sync pieces, files and chunks complete in any order, but downstream
/// consumers expect snapshot heights in ascending order. The [`Assembler`]
/// buffers batches keyed by their first height and releases a batch only
/// once everything below it has been released.
///
/// [`BlockReceiver`] wraps the assembler with the global received-block
/// record and the block feeds. Released batches publish their account blocks
/// first, then their snapshot blocks. The assembler already hands out every
/// height once, so range blocks are always published and only noted in the
/// record; gossiped and fetched blocks are published only if the record has
/// not seen them.
use std::collections::BTreeMap;

use ledger::{AccountBlock, Hash, SnapshotBlock};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::dedup::BlockRecord;
use crate::feed::{Feed, SubscriptionId};
use crate::types::{BlockBatch, BlockSink};

#[derive(Debug, Default)]
pub struct Assembler {
    /// Next snapshot height to release.
    next: u64,
    pending: BTreeMap<u64, BlockBatch>,
}

impl Assembler {
    pub fn new(next: u64) -> Self {
        Self {
            next,
            pending: BTreeMap::new(),
        }
    }

    pub fn next_height(&self) -> u64 {
        self.next
    }

    /// Number of buffered batches waiting for a gap to close.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Lowest missing height, if anything above it is buffered.
    pub fn gap(&self) -> Option<u64> {
        if self.pending.is_empty() {
            None
        } else {
            Some(self.next)
        }
    }

    /// Drop everything buffered and resume releasing at `next`.
    pub fn reset(&mut self, next: u64) {
        self.pending.clear();
        self.next = next;
    }

    /// Buffer a batch and return every batch that is now releasable, in
    /// ascending height order.
    pub fn insert(&mut self, batch: BlockBatch) -> Vec<BlockBatch> {
        if batch.to < self.next {
            trace!(from = batch.from, to = batch.to, next = self.next, "Batch already released");
            return Vec::new();
        }

        match self.pending.get(&batch.from) {
            Some(held) if held.to >= batch.to => {}
            _ => {
                self.pending.insert(batch.from, batch);
            }
        }

        let mut ready = Vec::new();
        while let Some(entry) = self.pending.first_entry() {
            if *entry.key() > self.next {
                break;
            }
            let batch = entry.remove();
            if batch.to < self.next {
                continue;
            }
            let batch = trim_below(batch, self.next);
            self.next = batch.to + 1;
            ready.push(batch);
        }
        ready
    }
}

/// Remove blocks below `height` from a batch that straddles it.
fn trim_below(mut batch: BlockBatch, height: u64) -> BlockBatch {
    if batch.from < height {
        batch.snapshot_blocks.retain(|block| block.height >= height);
        batch.account_blocks.retain(|block| block.snapshot_height >= height);
        batch.from = height;
    }
    batch
}

/// Downstream end of the sync engine.
pub struct BlockReceiver {
    assembler: Mutex<Assembler>,
    record: Mutex<BlockRecord>,
    snapshot_feed: Feed<SnapshotBlock>,
    account_feed: Feed<AccountBlock>,
    /// Held while publishing so releases from different tasks do not
    /// interleave.
    publishing: Mutex<()>,
}

impl BlockReceiver {
    pub fn new(next: u64, record_capacity: usize, false_positive_rate: f64) -> Self {
        Self {
            assembler: Mutex::new(Assembler::new(next)),
            record: Mutex::new(BlockRecord::new(record_capacity, false_positive_rate)),
            snapshot_feed: Feed::new("snapshot_blocks"),
            account_feed: Feed::new("account_blocks"),
            publishing: Mutex::new(()),
        }
    }

    pub fn subscribe_snapshot_blocks<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&SnapshotBlock) + Send + Sync + 'static,
    {
        self.snapshot_feed.subscribe(callback)
    }

    pub fn unsubscribe_snapshot_blocks(&self, id: SubscriptionId) {
        self.snapshot_feed.unsubscribe(id);
    }

    pub fn subscribe_account_blocks<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&AccountBlock) + Send + Sync + 'static,
    {
        self.account_feed.subscribe(callback)
    }

    pub fn unsubscribe_account_blocks(&self, id: SubscriptionId) {
        self.account_feed.unsubscribe(id);
    }

    /// Next snapshot height the range path will release.
    pub fn next_height(&self) -> u64 {
        self.assembler.lock().next_height()
    }

    pub fn gap(&self) -> Option<u64> {
        self.assembler.lock().gap()
    }

    pub fn reset(&self, next: u64) {
        self.assembler.lock().reset(next);
    }

    /// Whether a block hash is already in the global record.
    pub fn has_block(&self, hash: &Hash) -> bool {
        self.record.lock().contains(hash)
    }

    /// Record a block as seen without publishing it.
    pub fn mark_block(&self, hash: &Hash) {
        self.record_block(hash);
    }

    fn record_block(&self, hash: &Hash) -> bool {
        self.record.lock().add(hash)
    }

    /// Publish a single gossiped snapshot block. Returns `false` if it was
    /// already recorded.
    pub fn receive_snapshot_block(&self, block: SnapshotBlock) -> bool {
        let _publishing = self.publishing.lock();
        self.publish_snapshot(&block)
    }

    /// Publish gossiped or fetched account blocks. Returns how many were new.
    pub fn receive_account_blocks(&self, blocks: &[AccountBlock]) -> usize {
        let _publishing = self.publishing.lock();
        blocks.iter().filter(|block| self.publish_account(block)).count()
    }

    fn publish_snapshot(&self, block: &SnapshotBlock) -> bool {
        if !self.record_block(&block.hash) {
            return false;
        }
        self.snapshot_feed.notify(block);
        true
    }

    fn publish_account(&self, block: &AccountBlock) -> bool {
        if !self.record_block(&block.hash) {
            return false;
        }
        self.account_feed.notify(block);
        true
    }

    /// Publish a batch released by the assembler. Every block goes out; the
    /// record only learns the hashes.
    fn publish_released(&self, batch: &BlockBatch) {
        for block in &batch.account_blocks {
            self.record_block(&block.hash);
            self.account_feed.notify(block);
        }
        for block in &batch.snapshot_blocks {
            self.record_block(&block.hash);
            self.snapshot_feed.notify(block);
        }
        debug!(
            from = batch.from,
            to = batch.to,
            snapshots = batch.snapshot_blocks.len(),
            accounts = batch.account_blocks.len(),
            "Published blocks"
        );
    }

    /// Publish a batch that bypassed the assembler, skipping recorded blocks.
    fn publish_unordered(&self, batch: &BlockBatch) {
        let accounts = batch
            .account_blocks
            .iter()
            .filter(|block| self.publish_account(block))
            .count();
        let snapshots = batch
            .snapshot_blocks
            .iter()
            .filter(|block| self.publish_snapshot(block))
            .count();
        debug!(from = batch.from, to = batch.to, snapshots, accounts, "Published fetched blocks");
    }
}

impl BlockSink for BlockReceiver {
    fn receive_batch(&self, batch: BlockBatch) {
        // Order matters: take the publish lock before the assembler so the
        // batches released by one call are published before the next call's.
        let _publishing = self.publishing.lock();
        let ready = self.assembler.lock().insert(batch);
        for batch in &ready {
            self.publish_released(batch);
        }
    }

    fn receive_fetched(&self, mut batch: BlockBatch) {
        let _publishing = self.publishing.lock();
        batch.snapshot_blocks.sort_by_key(|block| block.height);
        self.publish_unordered(&batch);
    }
}
