/// Partitioning of a missing height range across peers.
///
/// A large range is cut into contiguous pieces, each assigned to a peer that
/// is tall enough to serve it with a safety margin of `min_blocks` below its
/// advertised head, so the tip of a piece is unlikely to be reorganized
/// before the peer serves it. Pieces are capped at `max_blocks` to spread
/// load; whatever is left after walking the peers goes to the tallest one.
use tracing::trace;

use crate::peer::PeerId;

/// A peer considered for a piece, with its advertised height.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub id: PeerId,
    pub height: u64,
}

impl Candidate {
    pub fn new(id: impl Into<PeerId>, height: u64) -> Self {
        Self {
            id: id.into(),
            height,
        }
    }
}

/// Inclusive height range `[from, to]` assigned to one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangePiece {
    pub from: u64,
    pub to: u64,
    pub peer: PeerId,
}

impl RangePiece {
    /// Number of heights in the piece.
    pub fn count(&self) -> u64 {
        self.to - self.from + 1
    }
}

/// Split `[from, to]` into pieces ordered by ascending `from`.
///
/// Returns no pieces when there are no peers or `from > to`.
pub fn split_sub_ledger(
    from: u64,
    to: u64,
    peers: &[Candidate],
    min_blocks: u64,
    max_blocks: u64,
) -> Vec<RangePiece> {
    let mut peers = peers.to_vec();
    peers.sort_by(|a, b| a.height.cmp(&b.height).then_with(|| a.id.cmp(&b.id)));

    let Some(tallest) = peers.last().cloned() else {
        return Vec::new();
    };
    if from > to {
        return Vec::new();
    }

    let mut pieces = Vec::new();

    // Small ranges are not worth splitting.
    if to - from + 1 < min_blocks {
        pieces.push(RangePiece {
            from,
            to,
            peer: tallest.id,
        });
        return pieces;
    }

    let mut next = Some(from);
    for peer in &peers {
        let Some(start) = next else { break };

        if peer.height <= start.saturating_add(min_blocks) {
            continue;
        }

        let ceiling = peer.height - min_blocks;
        let count = ceiling - start + 1;
        if count < min_blocks {
            // peer not high enough
            continue;
        }

        let mut end = start + count.min(max_blocks) - 1;
        if end > to {
            end = to;
        }
        // Fold a trailing sliver into this piece.
        if to - end < min_blocks {
            end = to;
        }

        trace!(from = start, to = end, peer = %peer.id, "Assigned sub-ledger piece");
        pieces.push(RangePiece {
            from: start,
            to: end,
            peer: peer.id.clone(),
        });

        next = if end >= to { None } else { Some(end + 1) };
    }

    if let Some(start) = next {
        pieces.push(RangePiece {
            from: start,
            to,
            peer: tallest.id,
        });
    }

    pieces
}
