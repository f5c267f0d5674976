/// Sync requests and their lifecycle.
///
/// Every unit of download work is a [`Request`]: a common lifecycle record
/// (id, state, retry counter, expiration, assigned peer, completion
/// callback) plus a variant payload:
///
/// - **SubLedger**: a top-level height range. The peer answers with a
///   `FileList` naming compressed files and inline chunks, which become
///   children of the request.
/// - **File**: bulk download of compressed files through the file client,
///   resumable from the highest height already received.
/// - **Chunk**: a short height range fetched inline with `GetChunk`.
///
/// ## State Machine
///
/// ```text
/// waiting --send ok--> pending --response--> respond --consumed--> done
///    |                   |                      |
///    |                   +--expired/bad reply---+--> retry (back to waiting,
///    |                                                new peer, same id)
///    +--send failed--> error
/// any non-terminal --shutdown--> canceled
/// ```
///
/// The lifecycle record is pure data; all I/O happens in the pool.
use std::collections::HashSet;
use std::fmt;
use std::time::{Duration, Instant};

use ledger::{CompressedFileMeta, HashHeight};
use thiserror::Error;

use super::config::SyncConfig;
use crate::message::{CodecError, GetChunk, GetSubLedger, Msg, MsgCode};
use crate::peer::PeerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReqState {
    Waiting,
    Pending,
    Responded,
    Done,
    Error,
    Canceled,
}

impl ReqState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ReqState::Done | ReqState::Error | ReqState::Canceled)
    }
}

impl fmt::Display for ReqState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ReqState::Waiting => "waiting",
            ReqState::Pending => "pending",
            ReqState::Responded => "respond",
            ReqState::Done => "done",
            ReqState::Error => "error",
            ReqState::Canceled => "canceled",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("request missing peer")]
    MissingPeer,

    #[error("max retry exceeded")]
    MaxRetry,

    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("malformed response: {0}")]
    Deserialize(String),

    #[error("send failed: {0}")]
    Send(String),

    #[error("request canceled")]
    Canceled,

    #[error("empty height range")]
    EmptyRange,

    #[error("range incomplete: delivered through {delivered}, target {target}")]
    Incomplete { delivered: u64, target: u64 },
}

impl From<CodecError> for RequestError {
    fn from(err: CodecError) -> Self {
        RequestError::Deserialize(err.to_string())
    }
}

/// Invoked exactly once when a request reaches a terminal state.
pub type DoneCallback = Box<dyn FnOnce(u64, Result<(), RequestError>) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKindTag {
    SubLedger,
    File,
    Chunk,
}

#[derive(Debug, Clone, Default)]
pub struct SubLedgerRequest {
    pub from: u64,
    pub to: u64,
    pub file: Option<u64>,
    pub chunks: Vec<u64>,
    /// Children that have not reached a terminal state.
    pub(crate) outstanding: HashSet<u64>,
    /// First terminal child error, reported once all children finish.
    pub(crate) failure: Option<RequestError>,
}

impl SubLedgerRequest {
    pub fn has_children(&self) -> bool {
        self.file.is_some() || !self.chunks.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct FileRequest {
    /// Files still to download, ascending by start height.
    pub files: Vec<CompressedFileMeta>,
    pub nonce: u64,
    /// Highest height already received; downloads resume after it.
    pub current: u64,
}

impl FileRequest {
    /// Drop files that were fully received by an earlier attempt.
    pub fn truncate_received(&mut self) {
        let current = self.current;
        self.files.retain(|file| file.end_height > current);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkRequest {
    pub from: u64,
    pub to: u64,
    /// Fetched on a caller's behalf rather than as part of a sync range;
    /// delivered as soon as it arrives instead of in height order.
    pub detached: bool,
}

#[derive(Debug, Clone)]
pub enum RequestKind {
    SubLedger(SubLedgerRequest),
    File(FileRequest),
    Chunk(ChunkRequest),
}

impl RequestKind {
    pub fn tag(&self) -> RequestKindTag {
        match self {
            RequestKind::SubLedger(_) => RequestKindTag::SubLedger,
            RequestKind::File(_) => RequestKindTag::File,
            RequestKind::Chunk(_) => RequestKindTag::Chunk,
        }
    }
}

pub struct Request {
    pub(crate) id: u64,
    pub(crate) state: ReqState,
    pub(crate) retry: u32,
    pub(crate) expiration: Instant,
    pub(crate) peer: PeerId,
    /// Height of the assigned peer when it was assigned. Replacement peers
    /// must be taller than this.
    pub(crate) peer_height: u64,
    pub(crate) parent: Option<u64>,
    pub(crate) kind: RequestKind,
    pub(crate) done: Option<DoneCallback>,
}

impl Request {
    fn new(id: u64, peer: PeerId, peer_height: u64, kind: RequestKind) -> Self {
        Self {
            id,
            state: ReqState::Waiting,
            retry: 0,
            expiration: Instant::now(),
            peer,
            peer_height,
            parent: None,
            kind,
            done: None,
        }
    }

    pub fn sub_ledger(id: u64, from: u64, to: u64, peer: PeerId, peer_height: u64) -> Self {
        Self::new(
            id,
            peer,
            peer_height,
            RequestKind::SubLedger(SubLedgerRequest {
                from,
                to,
                ..Default::default()
            }),
        )
    }

    pub fn chunk(id: u64, from: u64, to: u64, peer: PeerId, peer_height: u64) -> Self {
        Self::new(
            id,
            peer,
            peer_height,
            RequestKind::Chunk(ChunkRequest {
                from,
                to,
                detached: false,
            }),
        )
    }

    /// A chunk fetched outside of range sync.
    pub fn fetch(id: u64, from: u64, to: u64, peer: PeerId, peer_height: u64) -> Self {
        Self::new(
            id,
            peer,
            peer_height,
            RequestKind::Chunk(ChunkRequest {
                from,
                to,
                detached: true,
            }),
        )
    }

    pub fn file(
        id: u64,
        mut files: Vec<CompressedFileMeta>,
        nonce: u64,
        peer: PeerId,
        peer_height: u64,
    ) -> Self {
        files.sort_by_key(|file| file.start_height);
        let current = files.first().map_or(0, |file| file.start_height.saturating_sub(1));
        Self::new(
            id,
            peer,
            peer_height,
            RequestKind::File(FileRequest {
                files,
                nonce,
                current,
            }),
        )
    }

    pub fn on_done<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(u64, Result<(), RequestError>) + Send + 'static,
    {
        self.done = Some(Box::new(callback));
        self
    }

    pub(crate) fn with_parent(mut self, parent: u64) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> ReqState {
        self.state
    }

    pub fn retries(&self) -> u32 {
        self.retry
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn parent(&self) -> Option<u64> {
        self.parent
    }

    pub fn kind(&self) -> &RequestKind {
        &self.kind
    }

    /// A dispatched request that has waited past its deadline without a
    /// response.
    pub fn expired(&self, now: Instant) -> bool {
        self.state == ReqState::Pending && now >= self.expiration
    }

    /// How long to wait for a response once dispatched.
    pub(crate) fn timeout(&self, config: &SyncConfig) -> Duration {
        match self.kind {
            RequestKind::SubLedger(_) => config.sub_ledger_timeout,
            RequestKind::Chunk(_) => config.chunk_timeout,
            // The download task enforces its own per-file timeout; the sweep
            // only catches a task that stopped making progress.
            RequestKind::File(_) => config.file_timeout + config.sweep_interval,
        }
    }

    /// Protocol message that starts this request, if it uses one.
    pub(crate) fn outbound(&self) -> Result<Option<Msg>, CodecError> {
        match &self.kind {
            RequestKind::SubLedger(s) => Msg::new(
                MsgCode::GetSubLedger,
                self.id,
                &GetSubLedger {
                    from: HashHeight::at_height(s.from),
                    count: s.to - s.from + 1,
                    forward: true,
                },
            )
            .map(Some),
            RequestKind::Chunk(c) => Msg::new(
                MsgCode::GetChunk,
                self.id,
                &GetChunk {
                    start: c.from,
                    end: c.to,
                },
            )
            .map(Some),
            RequestKind::File(_) => Ok(None),
        }
    }

    /// Move to a terminal state and hand back the callback, if not yet taken.
    pub(crate) fn finish(&mut self, result: &Result<(), RequestError>) -> Option<DoneCallback> {
        self.state = match result {
            Ok(()) => ReqState::Done,
            Err(RequestError::Canceled) => ReqState::Canceled,
            Err(_) => ReqState::Error,
        };
        self.done.take()
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("retry", &self.retry)
            .field("peer", &self.peer)
            .field("parent", &self.parent)
            .field("kind", &self.kind)
            .finish()
    }
}
