/// Range synchronization for the ledger.
///
/// This module downloads the snapshot heights a node is missing from its
/// peers and hands them to subscribers in height order. It includes:
///
/// - **Splitter**: Cuts the missing range into pieces assigned to peers
/// - **Request**: Lifecycle record for sub-ledger, file and chunk downloads
/// - **Request Pool**: Dispatches requests, routes responses, retries and sweeps
/// - **Assembler**: Buffers completed batches and releases them in order
/// - **Net**: Coordinates all of the above and owns the sync state
///
/// ## Architecture
///
/// 1. A taller peer completes its handshake or announces a new head
/// 2. `[local + 1, best height]` is split into pieces, one sub-ledger request each
/// 3. Each peer answers with a file list; files and chunks become child requests
/// 4. Children download independently and feed the assembler
/// 5. The sync ends once every piece is terminal
///
/// ## State Machine
///
/// - **NOT_SYNCING**: No sync started yet
/// - **SYNCING**: Pieces in flight
/// - **SYNC_DONE**: Every piece delivered in order
/// - **SYNC_ERROR**: A piece failed or the delivered range has a gap
pub mod assembler;
pub mod config;
pub mod pool;
pub mod request;
pub mod service;
pub mod splitter;
pub mod states;

pub use assembler::{Assembler, BlockReceiver};
pub use config::*;
pub use pool::{Context, RequestPool};
pub use request::{DoneCallback, ReqState, Request, RequestError, RequestKind};
pub use service::Net;
pub use splitter::{Candidate, RangePiece, split_sub_ledger};
pub use states::SyncState;

#[cfg(test)]
mod tests;
