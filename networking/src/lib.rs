pub mod dedup;
pub mod feed;
pub mod message;
pub mod peer;
pub mod serde_utils;
pub mod sync;
pub mod types;

pub use dedup::{BlockRecord, DedupFilter};
pub use feed::{Feed, SubscriptionId};
pub use message::{CodecError, Msg, MsgCode};
pub use peer::{MsgWriter, Peer, PeerError, PeerId, PeerInfo, PeerRegistry};
pub use sync::{Net, SyncConfig, SyncState};
pub use types::{BlockBatch, BlockSink, Chain, FileClient, NetStatus};

#[cfg(test)]
mod tests;
