use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use ledger::{CompressedFileMeta, Hash};
use pretty_assertions::assert_eq;
use rstest::rstest;

use crate::message::{GetChunk, GetSubLedger, MsgCode};
use crate::sync::{ReqState, Request, RequestError, RequestKind, SyncConfig};

fn meta(from: u64, to: u64) -> CompressedFileMeta {
    CompressedFileMeta {
        filename: format!("f{from}"),
        file_size: 1,
        start_height: from,
        end_height: to,
        blocks_count: to - from + 1,
        hash: Hash::zero(),
    }
}

#[test]
fn test_new_request_is_waiting() {
    let req = Request::sub_ledger(1, 100, 199, "A".into(), 5_000);
    assert_eq!(req.state(), ReqState::Waiting);
    assert_eq!(req.retries(), 0);
    assert_eq!(req.peer(), "A");
    assert_eq!(req.parent(), None);
}

#[test]
fn test_sub_ledger_outbound() {
    let req = Request::sub_ledger(7, 100, 199, "A".into(), 5_000);
    let msg = req.outbound().expect("encode").expect("message");

    assert_eq!(msg.code, MsgCode::GetSubLedger);
    assert_eq!(msg.id, 7);
    let body: GetSubLedger = msg.decode().expect("decode");
    assert_eq!(body.from.height, 100);
    assert_eq!(body.count, 100);
    assert!(body.forward);
}

#[test]
fn test_chunk_outbound() {
    let req = Request::chunk(9, 5, 8, "A".into(), 100);
    let msg = req.outbound().expect("encode").expect("message");

    assert_eq!(msg.code, MsgCode::GetChunk);
    assert_eq!(msg.decode::<GetChunk>().expect("decode"), GetChunk { start: 5, end: 8 });
}

#[test]
fn test_file_has_no_outbound_message() {
    let req = Request::file(3, vec![meta(1, 10)], 42, "A".into(), 100);
    assert!(req.outbound().expect("encode").is_none());
}

#[test]
fn test_file_request_sorted_and_resumable() {
    let mut req = Request::file(3, vec![meta(21, 30), meta(1, 10), meta(11, 20)], 42, "A".into(), 100);

    let RequestKind::File(file) = &mut req.kind else {
        panic!("not a file request");
    };
    let starts: Vec<u64> = file.files.iter().map(|f| f.start_height).collect();
    assert_eq!(starts, vec![1, 11, 21]);
    assert_eq!(file.current, 0);

    file.current = 20;
    file.truncate_received();
    let starts: Vec<u64> = file.files.iter().map(|f| f.start_height).collect();
    assert_eq!(starts, vec![21]);
}

#[test]
fn test_callback_fires_once() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let mut req = Request::chunk(1, 1, 2, "A".into(), 10).on_done(move |_, _| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    if let Some(done) = req.finish(&Ok(())) {
        done(req.id(), Ok(()));
    }
    assert!(req.finish(&Err(RequestError::MaxRetry)).is_none());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[rstest]
#[case(Ok(()), ReqState::Done)]
#[case(Err(RequestError::Canceled), ReqState::Canceled)]
#[case(Err(RequestError::MissingPeer), ReqState::Error)]
#[case(Err(RequestError::MaxRetry), ReqState::Error)]
fn test_finish_state(#[case] result: Result<(), RequestError>, #[case] expected: ReqState) {
    let mut req = Request::chunk(1, 1, 2, "A".into(), 10);
    req.finish(&result);
    assert_eq!(req.state(), expected);
    assert!(req.state().is_terminal());
}

#[test]
fn test_expired_only_when_pending() {
    let mut req = Request::chunk(1, 1, 2, "A".into(), 10);
    let later = Instant::now() + Duration::from_secs(60);
    assert!(!req.expired(later));

    req.state = ReqState::Pending;
    req.expiration = Instant::now() + Duration::from_secs(30);
    assert!(!req.expired(Instant::now()));
    assert!(req.expired(later));
}

#[test]
fn test_timeout_by_kind() {
    let config = SyncConfig::default();
    let sub = Request::sub_ledger(1, 1, 2, "A".into(), 10);
    let chunk = Request::chunk(2, 1, 2, "A".into(), 10);
    let file = Request::file(3, vec![meta(1, 2)], 0, "A".into(), 10);

    assert_eq!(sub.timeout(&config), config.sub_ledger_timeout);
    assert_eq!(chunk.timeout(&config), config.chunk_timeout);
    assert!(file.timeout(&config) > config.file_timeout);
}

#[rstest]
#[case(ReqState::Waiting, "waiting")]
#[case(ReqState::Pending, "pending")]
#[case(ReqState::Responded, "respond")]
#[case(ReqState::Done, "done")]
#[case(ReqState::Error, "error")]
#[case(ReqState::Canceled, "canceled")]
fn test_state_names(#[case] state: ReqState, #[case] name: &str) {
    assert_eq!(state.to_string(), name);
}
