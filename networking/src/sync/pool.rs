/// Request pool: owns every in-flight request.
///
/// The pool allocates request ids, dispatches requests to their peers,
/// routes responses back by id, retries failed attempts against taller
/// peers, and finalizes requests exactly once.
///
/// ## Locking
///
/// One short-lived mutex guards the request map. It is never held across an
/// await, while sending, or while running a completion callback. Peer I/O
/// runs in spawned tasks that report back through the map, and every report
/// carries the attempt number it belongs to so results from an abandoned
/// attempt are ignored.
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use ledger::SnapshotBlock;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::config::SyncConfig;
use super::request::{ReqState, Request, RequestError, RequestKind, RequestKindTag};
use crate::message::{ExceptionCode, FileList, Msg, MsgCode, SubLedger, decode_file};
use crate::peer::{Peer, PeerRegistry};
use crate::types::{BlockBatch, BlockSink, FileClient};

/// Everything a request needs from its surroundings.
#[derive(Clone)]
pub struct Context {
    pub config: SyncConfig,
    pub peers: Arc<PeerRegistry>,
    pub files: Arc<dyn FileClient>,
    pub sink: Arc<dyn BlockSink>,
    /// Closed when the owning engine stops.
    pub term: CancellationToken,
}

/// Work a dispatch task performs for one attempt.
enum Dispatch {
    Message(Msg),
    Files { files: Vec<ledger::CompressedFileMeta>, nonce: u64 },
}

/// What to do with a response once it has been decoded.
enum Consumed {
    Children(FileList),
    Blocks(BlockBatch),
}

pub struct RequestPool {
    ctx: Context,
    next_id: AtomicU64,
    requests: Mutex<HashMap<u64, Request>>,
}

impl RequestPool {
    pub fn new(ctx: Context) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            next_id: AtomicU64::new(1),
            requests: Mutex::new(HashMap::new()),
        })
    }

    /// Allocate a request id. Ids start at 1 and are never reused.
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.lock().is_empty()
    }

    pub fn contains(&self, id: u64) -> bool {
        self.requests.lock().contains_key(&id)
    }

    pub fn state(&self, id: u64) -> Option<ReqState> {
        self.requests.lock().get(&id).map(|req| req.state)
    }

    pub fn retries(&self, id: u64) -> Option<u32> {
        self.requests.lock().get(&id).map(|req| req.retry)
    }

    /// Assigned peer of a tracked request.
    pub fn peer_of(&self, id: u64) -> Option<String> {
        self.requests.lock().get(&id).map(|req| req.peer.clone())
    }

    /// Track a request and dispatch it.
    ///
    /// After shutdown the request is refused and its callback runs with
    /// `Canceled`.
    pub fn add(self: &Arc<Self>, mut request: Request) {
        let id = request.id;

        if self.ctx.term.is_cancelled() {
            debug!(id, "Pool stopped, refusing request");
            if let Some(done) = request.finish(&Err(RequestError::Canceled)) {
                done(id, Err(RequestError::Canceled));
            }
            return;
        }

        {
            let mut requests = self.requests.lock();
            if requests.contains_key(&id) {
                warn!(id, "Duplicate request id, refusing request");
                drop(requests);
                let err = RequestError::UnexpectedResponse(format!("duplicate request id {id}"));
                if let Some(done) = request.finish(&Err(err.clone())) {
                    done(id, Err(err));
                }
                return;
            }
            debug!(id, peer = %request.peer, kind = ?request.kind.tag(), "Request added");
            requests.insert(id, request);
        }

        self.dispatch(id);
    }

    /// Re-dispatch a tracked request against a replacement peer.
    ///
    /// The replacement is the shortest peer taller than the one that failed.
    /// Gives up with `MaxRetry` once the retry budget is spent, or with
    /// `MissingPeer` if no peer is taller.
    pub fn retry(self: &Arc<Self>, id: u64) {
        self.retry_attempt(id, None);
    }

    fn retry_attempt(self: &Arc<Self>, id: u64, attempt: Option<u32>) {
        let failure = {
            let mut requests = self.requests.lock();
            let Some(req) = requests.get_mut(&id) else {
                return;
            };
            if req.state.is_terminal() || attempt.is_some_and(|a| a != req.retry) {
                return;
            }
            if let RequestKind::SubLedger(s) = &req.kind {
                if s.has_children() {
                    // Children retry on their own.
                    return;
                }
            }

            if req.retry >= self.ctx.config.max_retry {
                Some(RequestError::MaxRetry)
            } else {
                match self.ctx.peers.pick(req.peer_height).into_iter().next() {
                    None => Some(RequestError::MissingPeer),
                    Some(peer) => {
                        debug!(
                            id,
                            old_peer = %req.peer,
                            new_peer = %peer.id(),
                            retry = req.retry + 1,
                            "Retrying request"
                        );
                        req.peer = peer.id().to_string();
                        req.peer_height = peer.height();
                        req.retry += 1;
                        req.state = ReqState::Waiting;
                        if let RequestKind::File(f) = &mut req.kind {
                            f.truncate_received();
                        }
                        None
                    }
                }
            }
        };

        match failure {
            Some(err) => self.finish(id, Err(err)),
            None => self.dispatch(id),
        }
    }

    /// Deliver an inbound response to the request it answers.
    ///
    /// Responses for unknown ids, from peers other than the assigned one, or
    /// for requests not awaiting a response are dropped.
    pub fn route(self: &Arc<Self>, id: u64, from: &str, msg: Msg) {
        let (tag, attempt, range, detached) = {
            let mut requests = self.requests.lock();
            let Some(req) = requests.get_mut(&id) else {
                debug!(id, peer = %from, code = %msg.code, "No request for response, dropped");
                return;
            };
            if req.peer != from {
                debug!(id, peer = %from, assigned = %req.peer, "Response from unassigned peer, dropped");
                return;
            }
            // A reply may overtake the send confirmation.
            if !matches!(req.state, ReqState::Waiting | ReqState::Pending) {
                debug!(id, state = %req.state, code = %msg.code, "Request not awaiting a response, dropped");
                return;
            }
            req.state = ReqState::Responded;
            let (range, detached) = match &req.kind {
                RequestKind::SubLedger(s) => ((s.from, s.to), false),
                RequestKind::Chunk(c) => ((c.from, c.to), c.detached),
                RequestKind::File(_) => ((0, 0), false),
            };
            (req.kind.tag(), req.retry, range, detached)
        };

        match Self::consume(tag, range, &msg) {
            Ok(Consumed::Children(list)) => self.spawn_children(id, attempt, list),
            Ok(Consumed::Blocks(batch)) => {
                trace!(id, from = batch.from, to = batch.to, detached, "Chunk received");
                if detached {
                    self.ctx.sink.receive_fetched(batch);
                } else {
                    self.ctx.sink.receive_batch(batch);
                }
                self.finish(id, Ok(()));
            }
            Err(err) => {
                warn!(id, peer = %from, error = %err, "Bad response, retrying");
                self.retry_attempt(id, Some(attempt));
            }
        }
    }

    fn consume(tag: RequestKindTag, (from, to): (u64, u64), msg: &Msg) -> Result<Consumed, RequestError> {
        match (tag, msg.code) {
            (RequestKindTag::SubLedger, MsgCode::FileList) => {
                let mut list: FileList = msg.decode()?;
                list.files.sort_by_key(|file| file.start_height);
                list.chunks.retain(|[start, end]| start <= end);
                if list.files.is_empty() && list.chunks.is_empty() {
                    return Err(RequestError::UnexpectedResponse("empty file list".into()));
                }
                Ok(Consumed::Children(list))
            }
            (RequestKindTag::Chunk, MsgCode::SubLedger) => {
                let ledger: SubLedger = msg.decode()?;
                check_chunk(from, to, &ledger.snapshot_blocks)?;
                Ok(Consumed::Blocks(BlockBatch {
                    from,
                    to,
                    snapshot_blocks: ledger.snapshot_blocks,
                    account_blocks: ledger.account_blocks,
                }))
            }
            (_, MsgCode::Exception) => {
                let reason: ExceptionCode = msg.decode()?;
                Err(RequestError::UnexpectedResponse(format!("peer reported {reason:?}")))
            }
            (_, code) => Err(RequestError::UnexpectedResponse(format!(
                "{code} for {tag:?} request"
            ))),
        }
    }

    fn spawn_children(self: &Arc<Self>, parent_id: u64, attempt: u32, list: FileList) {
        let mut children = Vec::new();
        let mut ids = Vec::new();
        {
            let mut requests = self.requests.lock();
            let Some(parent) = requests.get_mut(&parent_id) else {
                return;
            };
            if parent.retry != attempt || parent.state != ReqState::Responded {
                return;
            }
            let peer = parent.peer.clone();
            let peer_height = parent.peer_height;
            let RequestKind::SubLedger(sub) = &mut parent.kind else {
                return;
            };

            if !list.files.is_empty() {
                let id = self.next_id();
                sub.file = Some(id);
                children.push(
                    Request::file(id, list.files, list.nonce, peer.clone(), peer_height)
                        .with_parent(parent_id),
                );
            }
            for [start, end] in list.chunks {
                let id = self.next_id();
                sub.chunks.push(id);
                children.push(
                    Request::chunk(id, start, end, peer.clone(), peer_height).with_parent(parent_id),
                );
            }
            sub.outstanding = children.iter().map(|child| child.id).collect();

            debug!(
                id = parent_id,
                file = ?sub.file,
                chunks = sub.chunks.len(),
                "Sub-ledger answered, requesting children"
            );

            for child in children.drain(..) {
                ids.push(child.id);
                requests.insert(child.id, child);
            }
        }

        for id in ids {
            self.dispatch(id);
        }
    }

    fn dispatch(self: &Arc<Self>, id: u64) {
        let plan = {
            let requests = self.requests.lock();
            let Some(req) = requests.get(&id) else {
                return;
            };
            if req.state != ReqState::Waiting {
                return;
            }
            let dispatch = match req.outbound() {
                Ok(Some(msg)) => Dispatch::Message(msg),
                Ok(None) => match &req.kind {
                    RequestKind::File(f) => Dispatch::Files {
                        files: f.files.clone(),
                        nonce: f.nonce,
                    },
                    _ => return,
                },
                Err(err) => {
                    let err = RequestError::Send(err.to_string());
                    drop(requests);
                    self.finish(id, Err(err));
                    return;
                }
            };
            (req.peer.clone(), req.retry, dispatch)
        };

        let (peer_id, attempt, dispatch) = plan;
        let pool = Arc::clone(self);

        tokio::spawn(async move {
            if pool.ctx.term.is_cancelled() {
                debug!(id, "Pool stopped, request not sent");
                return;
            }
            let Some(peer) = pool.ctx.peers.get(&peer_id) else {
                debug!(id, peer = %peer_id, "Assigned peer is gone");
                pool.retry_attempt(id, Some(attempt));
                return;
            };

            match dispatch {
                Dispatch::Message(msg) => {
                    let timeout = pool.ctx.config.send_timeout;
                    let sent = tokio::select! {
                        biased;
                        _ = pool.ctx.term.cancelled() => Err(RequestError::Canceled),
                        res = peer.send_msg(msg, timeout) => {
                            res.map_err(|err| RequestError::Send(err.to_string()))
                        }
                    };
                    pool.on_sent(id, attempt, sent);
                }
                Dispatch::Files { files, nonce } => {
                    pool.on_sent(id, attempt, Ok(()));
                    pool.download_files(id, attempt, peer, files, nonce).await;
                }
            }
        });
    }

    fn on_sent(self: &Arc<Self>, id: u64, attempt: u32, sent: Result<(), RequestError>) {
        let failed = {
            let mut requests = self.requests.lock();
            let Some(req) = requests.get_mut(&id) else {
                return;
            };
            if req.retry != attempt || req.state != ReqState::Waiting {
                return;
            }
            match sent {
                Ok(()) => {
                    req.state = ReqState::Pending;
                    req.expiration = Instant::now() + req.timeout(&self.ctx.config);
                    trace!(id, peer = %req.peer, "Request pending");
                    None
                }
                Err(err) => Some(err),
            }
        };

        if let Some(err) = failed {
            warn!(id, error = %err, "Request dispatch failed");
            self.finish(id, Err(err));
        }
    }

    async fn download_files(
        self: &Arc<Self>,
        id: u64,
        attempt: u32,
        peer: Arc<Peer>,
        files: Vec<ledger::CompressedFileMeta>,
        nonce: u64,
    ) {
        let timeout = self.ctx.config.file_timeout;

        for meta in files {
            let fetched = tokio::select! {
                biased;
                _ = self.ctx.term.cancelled() => return,
                res = tokio::time::timeout(timeout, self.ctx.files.fetch(&peer, &meta, nonce)) => res,
            };

            let bundle = match fetched {
                Err(_) => Err(format!("timed out after {timeout:?}")),
                Ok(Err(err)) => Err(format!("{err:#}")),
                Ok(Ok(bytes)) => decode_file(&bytes).map_err(|err| err.to_string()),
            };
            let bundle = match bundle {
                Ok(bundle) => bundle,
                Err(reason) => {
                    warn!(id, peer = %peer.id(), file = %meta.filename, %reason, "File download failed");
                    self.retry_attempt(id, Some(attempt));
                    return;
                }
            };

            {
                let mut requests = self.requests.lock();
                let Some(req) = requests.get_mut(&id) else {
                    return;
                };
                if req.retry != attempt || req.state.is_terminal() {
                    return;
                }
                req.expiration = Instant::now() + req.timeout(&self.ctx.config);
                if let RequestKind::File(f) = &mut req.kind {
                    f.current = f.current.max(meta.end_height);
                }
            }

            debug!(
                id,
                file = %meta.filename,
                from = meta.start_height,
                to = meta.end_height,
                "File received"
            );
            self.ctx.sink.receive_batch(BlockBatch {
                from: meta.start_height,
                to: meta.end_height,
                snapshot_blocks: bundle.snapshot_blocks,
                account_blocks: bundle.account_blocks,
            });
        }

        let current = self.requests.lock().get(&id).map(|req| req.retry == attempt);
        if current == Some(true) {
            self.finish(id, Ok(()));
        }
    }

    /// Move a request to its terminal state, run its callback, and report to
    /// its parent. Runs at most once per request.
    fn finish(self: &Arc<Self>, id: u64, result: Result<(), RequestError>) {
        let (done, parent) = {
            let mut requests = self.requests.lock();
            let Some(mut req) = requests.remove(&id) else {
                return;
            };
            let done = req.finish(&result);
            match &result {
                Ok(()) => info!(id, kind = ?req.kind.tag(), retries = req.retry, "Request done"),
                Err(err) => warn!(id, kind = ?req.kind.tag(), state = %req.state, error = %err, "Request failed"),
            }
            (done, req.parent)
        };

        if let Some(done) = done {
            done(id, result.clone());
        }
        if let Some(parent) = parent {
            self.child_finished(parent, id, result);
        }
    }

    fn child_finished(self: &Arc<Self>, parent_id: u64, child_id: u64, result: Result<(), RequestError>) {
        let outcome = {
            let mut requests = self.requests.lock();
            let Some(parent) = requests.get_mut(&parent_id) else {
                return;
            };
            let RequestKind::SubLedger(sub) = &mut parent.kind else {
                return;
            };
            sub.outstanding.remove(&child_id);
            if let Err(err) = result {
                if sub.failure.is_none() {
                    sub.failure = Some(err);
                }
            }
            if sub.outstanding.is_empty() {
                Some(sub.failure.take())
            } else {
                None
            }
        };

        match outcome {
            Some(None) => self.finish(parent_id, Ok(())),
            Some(Some(err)) => self.finish(parent_id, Err(err)),
            None => {}
        }
    }

    /// Retry every request that has waited past its deadline.
    ///
    /// Returns the number of expired requests. Never waits on peer I/O;
    /// re-dispatch happens in spawned tasks.
    pub fn sweep(self: &Arc<Self>) -> usize {
        let now = Instant::now();
        let expired: Vec<(u64, u32)> = self
            .requests
            .lock()
            .values()
            .filter(|req| req.expired(now))
            .map(|req| (req.id, req.retry))
            .collect();

        for &(id, attempt) in &expired {
            debug!(id, "Request expired");
            self.retry_attempt(id, Some(attempt));
        }
        expired.len()
    }

    /// Run `sweep` every `sweep_interval` until the pool is stopped.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(pool.ctx.config.sweep_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = pool.ctx.term.cancelled() => break,
                    _ = ticker.tick() => {
                        pool.sweep();
                    }
                }
            }
            debug!("Request sweeper stopped");
        })
    }

    /// Cancel every tracked request, running each callback once with
    /// `Canceled`.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<Request> = self.requests.lock().drain().map(|(_, req)| req).collect();
        let count = drained.len();
        for mut req in drained {
            let err = Err(RequestError::Canceled);
            if let Some(done) = req.finish(&err) {
                done(req.id, err);
            }
        }
        if count > 0 {
            info!(count, "Canceled in-flight requests");
        }
        count
    }
}

/// A chunk answer must carry exactly the snapshot heights `[from, to]`.
fn check_chunk(from: u64, to: u64, blocks: &[SnapshotBlock]) -> Result<(), RequestError> {
    let expected = to - from + 1;
    if blocks.len() as u64 != expected {
        return Err(RequestError::UnexpectedResponse(format!(
            "expected {expected} blocks for [{from}, {to}], got {}",
            blocks.len()
        )));
    }
    if let Some(block) = blocks.iter().find(|b| b.height < from || b.height > to) {
        return Err(RequestError::UnexpectedResponse(format!(
            "block height {} outside [{from}, {to}]",
            block.height
        )));
    }
    Ok(())
}
