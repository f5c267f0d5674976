use pretty_assertions::assert_eq;
use rstest::rstest;

use crate::sync::{Candidate, MAX_BLOCKS, MIN_BLOCKS, RangePiece, split_sub_ledger};

fn piece(from: u64, to: u64, peer: &str) -> RangePiece {
    RangePiece {
        from,
        to,
        peer: peer.to_string(),
    }
}

fn split(from: u64, to: u64, peers: &[(&str, u64)]) -> Vec<RangePiece> {
    let candidates: Vec<Candidate> = peers.iter().map(|(id, h)| Candidate::new(*id, *h)).collect();
    split_sub_ledger(from, to, &candidates, MIN_BLOCKS, MAX_BLOCKS)
}

/// Pieces are ascending, contiguous and cover `[from, to]` exactly.
fn assert_covers(pieces: &[RangePiece], from: u64, to: u64) {
    assert!(!pieces.is_empty());
    assert_eq!(pieces[0].from, from);
    assert_eq!(pieces[pieces.len() - 1].to, to);
    for pair in pieces.windows(2) {
        assert_eq!(pair[0].to + 1, pair[1].from, "gap or overlap between {pair:?}");
    }
    for p in pieces {
        assert!(p.from <= p.to);
    }
}

#[test]
fn test_tall_and_short_peer() {
    let pieces = split(0, 15_000, &[("A", 5_000), ("B", 20_000)]);

    assert_eq!(pieces, vec![piece(0, 10_799, "B"), piece(10_800, 15_000, "B")]);
    assert!(pieces.iter().all(|p| p.peer != "A"));
    assert_covers(&pieces, 0, 15_000);
}

#[test]
fn test_small_range_single_piece() {
    let pieces = split(100, 100 + MIN_BLOCKS - 2, &[("A", 50_000), ("B", 90_000)]);
    assert_eq!(pieces, vec![piece(100, 100 + MIN_BLOCKS - 2, "B")]);
}

#[test]
fn test_no_peers() {
    assert!(split(0, 50_000, &[]).is_empty());
}

#[test]
fn test_inverted_range() {
    assert!(split(10, 9, &[("A", 100)]).is_empty());
}

#[test]
fn test_single_height() {
    assert_eq!(split(7, 7, &[("A", 100)]), vec![piece(7, 7, "A")]);
}

#[test]
fn test_no_peer_clears_margin_tallest_takes_all() {
    // Nobody is MIN_BLOCKS above the start, so the whole range falls back.
    let pieces = split(10_000, 14_000, &[("A", 12_000), ("B", 13_000)]);
    assert_eq!(pieces, vec![piece(10_000, 14_000, "B")]);
}

#[test]
fn test_peers_share_range_in_height_order() {
    let peers = [("A", 12_000), ("B", 30_000), ("C", 60_000)];
    let pieces = split(0, 50_000, &peers);

    assert_covers(&pieces, 0, 50_000);
    // Each piece ends MIN_BLOCKS below its peer's head, capped at MAX_BLOCKS.
    assert_eq!(pieces[0], piece(0, 8_400, "A"));
    assert_eq!(pieces[1], piece(8_401, 19_200, "B"));
    assert_eq!(pieces[2], piece(19_201, 30_000, "C"));
    assert!(pieces.iter().skip(3).all(|p| p.peer == "C"));
}

#[test]
fn test_leftover_merged_into_last_piece() {
    // The tail after a full piece would be shorter than MIN_BLOCKS.
    let to = MAX_BLOCKS + MIN_BLOCKS - 2;
    let pieces = split(0, to, &[("A", 100_000)]);
    assert_eq!(pieces, vec![piece(0, to, "A")]);
}

#[rstest]
#[case(0, 15_000, vec![("A", 5_000), ("B", 20_000)])]
#[case(1, 100_000, vec![("A", 8_000), ("B", 40_000), ("C", 41_000), ("D", 120_000)])]
#[case(3_600, 7_199, vec![("A", 7_300)])]
#[case(500, 90_000, vec![("A", 90_000)])]
#[case(0, 7_201, vec![("A", 3_600), ("B", 3_601), ("C", 7_201)])]
#[case(10_000, 60_000, vec![("A", 14_000), ("B", 25_000), ("C", 60_000)])]
fn test_coverage(#[case] from: u64, #[case] to: u64, #[case] peers: Vec<(&str, u64)>) {
    let pieces = split(from, to, &peers);
    assert_covers(&pieces, from, to);

    let tallest = peers.iter().max_by_key(|(_, h)| *h).map(|(id, _)| *id);
    for p in &pieces {
        let height = peers.iter().find(|(id, _)| *id == p.peer).map(|(_, h)| *h);
        // Every piece either respects the margin or is the tallest-peer fallback.
        assert!(
            Some(p.peer.as_str()) == tallest || height.is_some_and(|h| h > p.from + MIN_BLOCKS),
            "{p:?} assigned to a peer without margin"
        );
        // No piece ends within MIN_BLOCKS of its peer's head or above it.
        assert!(
            height.is_some_and(|h| h + MIN_BLOCKS > p.to),
            "{p:?} reaches past its peer's height minus the margin"
        );
    }
}

#[test]
fn test_piece_count() {
    assert_eq!(piece(10, 19, "A").count(), 10);
    assert_eq!(piece(5, 5, "A").count(), 1);
}
