/// Sync orchestrator.
///
/// [`Net`] is the public entry point of the engine. It coordinates:
/// - PeerRegistry: peers admitted through the handshake
/// - RequestPool: in-flight sub-ledger, file and chunk requests
/// - BlockReceiver: ordered delivery to block subscribers
/// - State machine: NOT_SYNCING -> SYNCING -> SYNC_DONE | SYNC_ERROR
///
/// A sync covers `[local + 1, best peer height]`. The range is split across
/// peers, each piece becomes a sub-ledger request, and the sync ends once
/// every piece has reached a terminal state.
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use anyhow::{Context as _, Result, bail};
use ledger::{AccountBlock, Address, SnapshotBlock};
use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::assembler::BlockReceiver;
use super::config::SyncConfig;
use super::pool::{Context, RequestPool};
use super::request::{Request, RequestError};
use super::splitter::{Candidate, split_sub_ledger};
use super::states::SyncState;
use crate::feed::{Feed, SubscriptionId};
use crate::message::{
    AccountBlocks, GetAccountBlocks, GetSnapshotBlocks, Handshake, Msg, MsgCode, PeerStatus,
};
use crate::peer::{Peer, PeerError, PeerRegistry};
use crate::types::{BlockSink, Chain, FileClient, NetStatus};

/// Outcome bookkeeping for the pieces of one sync.
#[derive(Debug)]
struct SyncRound {
    remaining: AtomicUsize,
    failure: Mutex<Option<RequestError>>,
}

pub struct Net {
    config: SyncConfig,
    chain: Arc<dyn Chain>,
    peers: Arc<PeerRegistry>,
    receiver: Arc<BlockReceiver>,
    pool: Arc<RequestPool>,
    state: RwLock<SyncState>,
    state_feed: Feed<SyncState>,
    /// Serializes state changes with their notifications.
    state_publish: Mutex<()>,
    /// Held while deciding whether to start a sync.
    sync_guard: Mutex<()>,
    /// `(from, target)` of the latest sync.
    heights: RwLock<(u64, u64)>,
    running: AtomicBool,
    started_at: Mutex<Option<Instant>>,
    term: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Net {
    pub fn new(config: SyncConfig, chain: Arc<dyn Chain>, files: Arc<dyn FileClient>) -> Result<Arc<Self>> {
        config
            .validate()
            .map_err(|reason| anyhow::anyhow!("invalid sync config: {reason}"))?;

        let peers = Arc::new(PeerRegistry::new());
        let receiver = Arc::new(BlockReceiver::new(
            0,
            config.block_record_capacity,
            config.false_positive_rate,
        ));
        let term = CancellationToken::new();
        let pool = RequestPool::new(Context {
            config: config.clone(),
            peers: peers.clone(),
            files,
            sink: receiver.clone() as Arc<dyn BlockSink>,
            term: term.clone(),
        });

        Ok(Arc::new(Self {
            config,
            chain,
            peers,
            receiver,
            pool,
            state: RwLock::new(SyncState::default()),
            state_feed: Feed::new("sync_state"),
            state_publish: Mutex::new(()),
            sync_guard: Mutex::new(()),
            heights: RwLock::new((0, 0)),
            running: AtomicBool::new(false),
            started_at: Mutex::new(None),
            term,
            tasks: Mutex::new(Vec::new()),
        }))
    }

    /// Start background tasks. Starting a running engine is a no-op; a
    /// stopped engine cannot be restarted.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.term.is_cancelled() {
            bail!("engine was stopped and cannot be restarted");
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let local = self
            .chain
            .get_latest_snapshot_block()
            .context("failed to read local head")?;
        self.receiver.reset(local.height + 1);
        *self.started_at.lock() = Some(Instant::now());
        self.tasks.lock().push(self.pool.spawn_sweeper());

        info!(height = local.height, network_id = self.config.network_id, "Net started");
        self.sync();
        Ok(())
    }

    /// Stop the engine. Idempotent.
    ///
    /// Closes the termination signal, cancels every in-flight request
    /// (each callback runs once with `Canceled`), disconnects all peers and
    /// waits for background tasks to exit.
    pub async fn stop(&self) {
        self.term.cancel();
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        let canceled = self.pool.cancel_all();
        for peer in self.peers.all() {
            self.peers.remove(peer.id());
        }

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(err) = task.await {
                warn!(error = %err, "Background task failed");
            }
        }

        info!(canceled, "Net stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn peers(&self) -> &Arc<PeerRegistry> {
        &self.peers
    }

    pub fn pool(&self) -> &Arc<RequestPool> {
        &self.pool
    }

    pub fn status(&self) -> NetStatus {
        let (from_height, target_height) = *self.heights.read();
        NetStatus {
            peers: self.peers.snapshot(),
            running: self.is_running(),
            uptime: self
                .started_at
                .lock()
                .map_or(Duration::ZERO, |at| at.elapsed()),
            sync_state: self.sync_state(),
            from_height,
            target_height,
        }
    }

    pub fn sync_state(&self) -> SyncState {
        *self.state.read()
    }

    pub fn syncing(&self) -> bool {
        self.sync_state() == SyncState::Syncing
    }

    /// Change the sync state and publish it to status subscribers.
    pub fn set_sync_state(&self, state: SyncState) {
        let _publish = self.state_publish.lock();
        let previous = {
            let mut current = self.state.write();
            let previous = *current;
            *current = state;
            previous
        };
        if previous == state {
            return;
        }
        if !previous.can_transition_to(state) {
            warn!(from = %previous, to = %state, "Unexpected sync state transition");
        }
        info!(from = %previous, to = %state, "Sync state changed");
        self.state_feed.notify(&state);
    }

    pub fn subscribe_sync_status<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&SyncState) + Send + Sync + 'static,
    {
        self.state_feed.subscribe(callback)
    }

    pub fn unsubscribe_sync_status(&self, id: SubscriptionId) {
        self.state_feed.unsubscribe(id);
    }

    pub fn subscribe_snapshot_blocks<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&SnapshotBlock) + Send + Sync + 'static,
    {
        self.receiver.subscribe_snapshot_blocks(callback)
    }

    pub fn unsubscribe_snapshot_blocks(&self, id: SubscriptionId) {
        self.receiver.unsubscribe_snapshot_blocks(id);
    }

    pub fn subscribe_account_blocks<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&AccountBlock) + Send + Sync + 'static,
    {
        self.receiver.subscribe_account_blocks(callback)
    }

    pub fn unsubscribe_account_blocks(&self, id: SubscriptionId) {
        self.receiver.unsubscribe_account_blocks(id);
    }

    /// Admit a peer after its handshake.
    ///
    /// Peers on another network or with another genesis block are rejected
    /// with a [`PeerError`] before any sync traffic. An admitted peer taller
    /// than the local head triggers a sync.
    pub fn handle_peer(self: &Arc<Self>, peer: Peer, handshake: &Handshake) -> Result<()> {
        if handshake.network_id != self.config.network_id {
            return Err(PeerError::NetworkMismatch {
                ours: self.config.network_id,
                theirs: handshake.network_id,
            }
            .into());
        }

        let genesis = self
            .chain
            .get_genesis_block()
            .context("failed to read genesis block")?;
        if handshake.genesis != genesis.hash {
            return Err(PeerError::GenesisMismatch {
                ours: genesis.hash,
                theirs: handshake.genesis,
            }
            .into());
        }
        if self.term.is_cancelled() {
            return Err(PeerError::Terminated(peer.id().to_string()).into());
        }

        peer.update(handshake.head, handshake.height);
        let peer = Arc::new(peer);
        info!(peer = %peer.id(), height = handshake.height, "Peer admitted");
        self.peers.add(peer);

        self.sync();
        Ok(())
    }

    pub fn remove_peer(&self, id: &str) {
        if self.peers.remove(id).is_some() {
            info!(peer = %id, "Peer disconnected");
        }
    }

    /// Record a peer's new head and sync if it moved past us.
    pub fn on_peer_status(self: &Arc<Self>, id: &str, status: PeerStatus) {
        let Some(peer) = self.peers.get(id) else {
            debug!(peer = %id, "Status from unknown peer, ignored");
            return;
        };
        peer.update(status.head, status.height);
        self.sync();
    }

    /// Dispatch one inbound message from a registered peer.
    pub fn handle_msg(self: &Arc<Self>, peer_id: &str, msg: Msg) -> Result<()> {
        let Some(peer) = self.peers.get(peer_id) else {
            debug!(peer = %peer_id, code = %msg.code, "Message from unknown peer, dropped");
            return Ok(());
        };

        match msg.code {
            MsgCode::FileList | MsgCode::SubLedger | MsgCode::Exception => {
                self.pool.route(msg.id, peer_id, msg);
            }
            MsgCode::Status => {
                let status: PeerStatus = msg.decode()?;
                self.on_peer_status(peer_id, status);
            }
            MsgCode::NewSnapshotBlock => {
                let block: SnapshotBlock = msg.decode()?;
                peer.mark_block(&block.hash);
                if block.height > peer.height() {
                    peer.update(block.hash, block.height);
                }
                self.receiver.receive_snapshot_block(block);
            }
            MsgCode::NewAccountBlock => {
                let block: AccountBlock = msg.decode()?;
                peer.mark_block(&block.hash);
                self.receiver.receive_account_blocks(std::slice::from_ref(&block));
            }
            MsgCode::AccountBlocks => {
                let reply: AccountBlocks = msg.decode()?;
                for block in &reply.blocks {
                    peer.mark_block(&block.hash);
                }
                let fresh = self.receiver.receive_account_blocks(&reply.blocks);
                debug!(peer = %peer_id, address = %reply.address, fresh, "Account blocks received");
            }
            MsgCode::Handshake
            | MsgCode::GetSubLedger
            | MsgCode::GetChunk
            | MsgCode::GetAccountBlocks => {
                debug!(peer = %peer_id, code = %msg.code, "Serving requests is not supported, ignored");
            }
        }
        Ok(())
    }

    /// Start a sync toward the tallest peer if it is ahead of the local
    /// head and no sync is running. Returns whether a sync was started.
    pub fn sync(self: &Arc<Self>) -> bool {
        if !self.is_running() || self.term.is_cancelled() {
            return false;
        }

        let _guard = self.sync_guard.lock();
        if self.syncing() {
            return false;
        }

        let local = match self.chain.get_latest_snapshot_block() {
            Ok(block) => block.height,
            Err(err) => {
                warn!(error = %err, "Failed to read local head, sync skipped");
                return false;
            }
        };
        let Some(best) = self.peers.best_peer() else {
            return false;
        };
        let target = best.height();
        if target <= local {
            return false;
        }

        let from = local + 1;
        let candidates: Vec<Candidate> = self
            .peers
            .all()
            .iter()
            .map(|peer| Candidate::new(peer.id(), peer.height()))
            .collect();
        let pieces = split_sub_ledger(
            from,
            target,
            &candidates,
            self.config.min_blocks,
            self.config.max_blocks,
        );
        if pieces.is_empty() {
            return false;
        }

        *self.heights.write() = (from, target);
        self.receiver.reset(from);
        info!(from, to = target, pieces = pieces.len(), peers = candidates.len(), "Sync started");
        self.set_sync_state(SyncState::Syncing);

        let round = Arc::new(SyncRound {
            remaining: AtomicUsize::new(pieces.len()),
            failure: Mutex::new(None),
        });

        for piece in pieces {
            let id = self.pool.next_id();
            let peer_height = self.peers.get(&piece.peer).map_or(0, |peer| peer.height());
            let net: Weak<Self> = Arc::downgrade(self);
            let round = round.clone();
            let request = Request::sub_ledger(id, piece.from, piece.to, piece.peer, peer_height)
                .on_done(move |id, result| {
                    if let Some(net) = net.upgrade() {
                        net.piece_done(&round, id, result);
                    }
                });
            self.pool.add(request);
        }
        true
    }

    fn piece_done(self: &Arc<Self>, round: &SyncRound, id: u64, result: Result<(), RequestError>) {
        if let Err(err) = result {
            debug!(id, error = %err, "Sync piece failed");
            let mut failure = round.failure.lock();
            if failure.is_none() {
                *failure = Some(err);
            }
        }
        if round.remaining.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        if self.term.is_cancelled() {
            debug!("Sync interrupted by shutdown");
            return;
        }

        let (from, target) = *self.heights.read();
        let failure = round.failure.lock().take().or_else(|| {
            let delivered = self.receiver.next_height().saturating_sub(1);
            (delivered < target).then_some(RequestError::Incomplete { delivered, target })
        });

        match failure {
            Some(err) => {
                warn!(from, to = target, error = %err, "Sync failed");
                self.set_sync_state(SyncState::SyncError);
            }
            None => {
                info!(from, to = target, "Sync done");
                self.set_sync_state(SyncState::SyncDone);
                // Peers may have moved on while we were syncing.
                let net = self.clone();
                tokio::spawn(async move {
                    net.sync();
                });
            }
        }
    }

    /// Announce snapshot blocks to peers that do not know them yet.
    ///
    /// With `propagate` every such peer receives each block; otherwise a
    /// random square-root subset does. Returns the number of sends queued.
    pub fn broadcast_snapshot_blocks(&self, blocks: &[SnapshotBlock], propagate: bool) -> usize {
        blocks
            .iter()
            .map(|block| self.broadcast(MsgCode::NewSnapshotBlock, &block.hash, block, propagate))
            .sum()
    }

    pub fn broadcast_account_blocks(&self, blocks: &[AccountBlock], propagate: bool) -> usize {
        blocks
            .iter()
            .map(|block| self.broadcast(MsgCode::NewAccountBlock, &block.hash, block, propagate))
            .sum()
    }

    fn broadcast<T: serde::Serialize>(
        &self,
        code: MsgCode,
        hash: &ledger::Hash,
        block: &T,
        propagate: bool,
    ) -> usize {
        self.receiver.mark_block(hash);
        if self.term.is_cancelled() {
            return 0;
        }

        let msg = match Msg::new(code, 0, block) {
            Ok(msg) => msg,
            Err(err) => {
                warn!(%code, error = %err, "Failed to encode broadcast");
                return 0;
            }
        };

        let mut targets: Vec<Arc<Peer>> = self
            .peers
            .all()
            .into_iter()
            .filter(|peer| !peer.knows_block(hash))
            .collect();
        if !propagate && !targets.is_empty() {
            let count = ((targets.len() as f64).sqrt() as usize).max(1);
            targets.shuffle(&mut rand::thread_rng());
            targets.truncate(count);
        }

        for peer in &targets {
            peer.mark_block(hash);
            self.spawn_send(peer.clone(), msg.clone());
        }
        debug!(%code, block = %hash, peers = targets.len(), propagate, "Broadcast block");
        targets.len()
    }

    /// Fetch a run of snapshot blocks outside of range sync.
    ///
    /// The blocks reach snapshot subscribers when they arrive. Returns the
    /// id of the request.
    pub fn fetch_snapshot_blocks(self: &Arc<Self>, req: GetSnapshotBlocks) -> Result<u64, RequestError> {
        let (from, to) = req.range().ok_or(RequestError::EmptyRange)?;
        let peer = self
            .peers
            .best_peer()
            .filter(|peer| peer.height() >= to)
            .ok_or(RequestError::MissingPeer)?;

        let id = self.pool.next_id();
        debug!(id, from, to, peer = %peer.id(), "Fetching snapshot blocks");
        let request = Request::fetch(id, from, to, peer.id().to_string(), peer.height()).on_done(
            move |id, result| {
                if let Err(err) = result {
                    warn!(id, from, to, error = %err, "Snapshot block fetch failed");
                }
            },
        );
        self.pool.add(request);
        Ok(id)
    }

    /// Ask the best peer for account blocks, one message per address.
    ///
    /// Replies arrive as `AccountBlocks` messages and reach account block
    /// subscribers. Returns the number of requests queued.
    pub fn fetch_account_blocks(
        &self,
        reqs: HashMap<Address, GetAccountBlocks>,
    ) -> Result<usize, RequestError> {
        let peer = self.peers.best_peer().ok_or(RequestError::MissingPeer)?;

        let mut queued = 0;
        for (address, req) in reqs {
            if req.count == 0 {
                continue;
            }
            let id = self.pool.next_id();
            let msg = Msg::new(MsgCode::GetAccountBlocks, id, &req)?;
            debug!(id, %address, count = req.count, peer = %peer.id(), "Fetching account blocks");
            self.spawn_send(peer.clone(), msg);
            queued += 1;
        }
        Ok(queued)
    }

    fn spawn_send(&self, peer: Arc<Peer>, msg: Msg) {
        let term = self.term.clone();
        let timeout = self.config.send_timeout;
        tokio::spawn(async move {
            let code = msg.code;
            tokio::select! {
                biased;
                _ = term.cancelled() => {
                    debug!(peer = %peer.id(), %code, "Stopped, send dropped");
                }
                res = peer.send_msg(msg, timeout) => {
                    if let Err(err) = res {
                        debug!(peer = %peer.id(), %code, error = %err, "Send failed");
                    }
                }
            }
        });
    }
}

impl std::fmt::Debug for Net {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Net")
            .field("running", &self.is_running())
            .field("state", &self.sync_state())
            .field("peers", &self.peers.count())
            .field("requests", &self.pool.len())
            .finish()
    }
}
