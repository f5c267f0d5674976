/// Connected peers and their observed chain heads.
///
/// A [`Peer`] is created by the transport layer when a connection is
/// established and handed to the registry once its handshake is accepted.
/// Everything that needs a peer later (requests, range pieces, broadcasts)
/// holds its id and resolves it through [`PeerRegistry`] at the moment of
/// use, so a disconnect in the middle of a request is just a failed lookup.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ledger::Hash;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::dedup::DedupFilter;
use crate::message::{CodecError, Msg, MsgCode};
use crate::serde_utils::quoted_u64;

pub type PeerId = String;

/// Expected number of blocks a single peer is tracked as knowing.
pub const PEER_KNOWN_BLOCKS_CAPACITY: usize = 100_000;

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("peer {0} is terminated")]
    Terminated(PeerId),

    #[error("send to peer {peer} timed out after {timeout:?}")]
    SendTimeout { peer: PeerId, timeout: Duration },

    #[error("transport error on peer {peer}: {reason}")]
    Transport { peer: PeerId, reason: String },

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("network id mismatch: ours {ours}, theirs {theirs}")]
    NetworkMismatch { ours: u64, theirs: u64 },

    #[error("genesis mismatch: ours {ours}, theirs {theirs}")]
    GenesisMismatch { ours: Hash, theirs: Hash },
}

/// Outbound half of a peer connection, provided by the transport.
#[async_trait]
pub trait MsgWriter: Send + Sync {
    async fn write_msg(&self, msg: Msg) -> anyhow::Result<()>;
}

/// Read-only projection of a peer for status reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: PeerId,
    pub head: String,
    #[serde(with = "quoted_u64")]
    pub height: u64,
    pub file_address: Option<String>,
}

#[derive(Debug, Clone, Copy)]
struct Altitude {
    head: Hash,
    height: u64,
}

pub struct Peer {
    id: PeerId,
    file_address: Option<String>,
    altitude: RwLock<Altitude>,
    /// Held for the duration of one outbound message.
    sending: tokio::sync::Mutex<()>,
    known_blocks: Mutex<DedupFilter>,
    writer: Arc<dyn MsgWriter>,
    term: CancellationToken,
}

impl Peer {
    pub fn new(
        id: impl Into<PeerId>,
        head: Hash,
        height: u64,
        writer: Arc<dyn MsgWriter>,
    ) -> Self {
        Self {
            id: id.into(),
            file_address: None,
            altitude: RwLock::new(Altitude { head, height }),
            sending: tokio::sync::Mutex::new(()),
            known_blocks: Mutex::new(DedupFilter::new(PEER_KNOWN_BLOCKS_CAPACITY, 0.001)),
            writer,
            term: CancellationToken::new(),
        }
    }

    /// Address of the peer's bulk file server, if it runs one.
    pub fn with_file_address(mut self, addr: impl Into<String>) -> Self {
        self.file_address = Some(addr.into());
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn file_address(&self) -> Option<&str> {
        self.file_address.as_deref()
    }

    pub fn height(&self) -> u64 {
        self.altitude.read().height
    }

    pub fn head(&self) -> Hash {
        self.altitude.read().head
    }

    pub fn altitude(&self) -> (Hash, u64) {
        let a = self.altitude.read();
        (a.head, a.height)
    }

    /// Record a new chain head announced by the peer.
    pub fn update(&self, head: Hash, height: u64) {
        let mut a = self.altitude.write();
        a.head = head;
        a.height = height;
        info!(peer = %self.id, height, head = %head, "Updated peer status");
    }

    pub fn knows_block(&self, hash: &Hash) -> bool {
        self.known_blocks.lock().contains(hash)
    }

    pub fn mark_block(&self, hash: &Hash) {
        self.known_blocks.lock().add(hash);
    }

    pub fn is_alive(&self) -> bool {
        !self.term.is_cancelled()
    }

    /// Close the peer. Idempotent.
    pub fn destroy(&self) {
        self.term.cancel();
    }

    /// Encode and send one message.
    ///
    /// Waits for the peer's send gate, so at most one message per peer is on
    /// the wire at a time. The whole operation, gate wait included, is bounded
    /// by `timeout` and aborted if the peer is destroyed.
    pub async fn send<T: Serialize>(
        &self,
        code: MsgCode,
        id: u64,
        payload: &T,
        timeout: Duration,
    ) -> Result<(), PeerError> {
        let msg = Msg::new(code, id, payload)?;
        self.send_msg(msg, timeout).await
    }

    pub async fn send_msg(&self, msg: Msg, timeout: Duration) -> Result<(), PeerError> {
        if self.term.is_cancelled() {
            return Err(PeerError::Terminated(self.id.clone()));
        }

        let code = msg.code;
        let id = msg.id;
        let write = async {
            let _gate = self.sending.lock().await;
            self.writer.write_msg(msg).await
        };

        tokio::select! {
            biased;
            _ = self.term.cancelled() => Err(PeerError::Terminated(self.id.clone())),
            res = tokio::time::timeout(timeout, write) => match res {
                Err(_) => Err(PeerError::SendTimeout { peer: self.id.clone(), timeout }),
                Ok(Err(err)) => Err(PeerError::Transport {
                    peer: self.id.clone(),
                    reason: format!("{err:#}"),
                }),
                Ok(Ok(())) => {
                    debug!(peer = %self.id, %code, id, "Sent message");
                    Ok(())
                }
            },
        }
    }

    pub fn info(&self) -> PeerInfo {
        let (head, height) = self.altitude();
        PeerInfo {
            id: self.id.clone(),
            head: head.to_string(),
            height,
            file_address: self.file_address.clone(),
        }
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (head, height) = self.altitude();
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("head", &head)
            .field("height", &height)
            .field("alive", &self.is_alive())
            .finish()
    }
}

/// Thread-safe set of live peers keyed by id.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: RwLock<HashMap<PeerId, Arc<Peer>>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a peer, returning any previous peer with the same id.
    pub fn add(&self, peer: Arc<Peer>) -> Option<Arc<Peer>> {
        let id = peer.id().to_string();
        let old = self.peers.write().insert(id.clone(), peer);
        if let Some(old) = &old {
            old.destroy();
        }
        debug!(peer = %id, "Peer registered");
        old
    }

    /// Unregister and destroy a peer.
    pub fn remove(&self, id: &str) -> Option<Arc<Peer>> {
        let peer = self.peers.write().remove(id);
        if let Some(peer) = &peer {
            peer.destroy();
            debug!(peer = %id, "Peer removed");
        }
        peer
    }

    pub fn has(&self, id: &str) -> bool {
        self.peers.read().contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Peer>> {
        self.peers.read().get(id).cloned()
    }

    pub fn count(&self) -> usize {
        self.peers.read().len()
    }

    /// Tallest peer. Ties go to the smallest id so selection is stable.
    pub fn best_peer(&self) -> Option<Arc<Peer>> {
        self.peers
            .read()
            .values()
            .max_by(|a, b| a.height().cmp(&b.height()).then_with(|| b.id().cmp(a.id())))
            .cloned()
    }

    /// All peers strictly taller than `min_height`, ascending by height.
    pub fn pick(&self, min_height: u64) -> Vec<Arc<Peer>> {
        let mut peers: Vec<Arc<Peer>> = self
            .peers
            .read()
            .values()
            .filter(|peer| peer.height() > min_height)
            .cloned()
            .collect();
        sort_by_height(&mut peers);
        peers
    }

    /// Every registered peer, ascending by height.
    pub fn all(&self) -> Vec<Arc<Peer>> {
        let mut peers: Vec<Arc<Peer>> = self.peers.read().values().cloned().collect();
        sort_by_height(&mut peers);
        peers
    }

    pub fn snapshot(&self) -> Vec<PeerInfo> {
        self.all().iter().map(|peer| peer.info()).collect()
    }
}

fn sort_by_height(peers: &mut [Arc<Peer>]) {
    peers.sort_by(|a, b| a.height().cmp(&b.height()).then_with(|| a.id().cmp(b.id())));
}
