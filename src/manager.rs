use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::peer::SessionId;
use crate::piece::{Block, BlockRequest, BlockState, Piece, PieceBuffer};
use crate::torrent::{HASH_LEN, Torrent};

/// Decides the order in which incomplete pieces are requested.
pub trait PieceSelector: Send {
    /// Orders `candidates`; blocks are requested from the front first.
    fn rank(&self, candidates: Vec<u32>) -> Vec<u32>;
}

/// Requests pieces strictly in file order
#[derive(Debug, Default, Clone, Copy)]
pub struct Sequential;

impl PieceSelector for Sequential {
    fn rank(&self, mut candidates: Vec<u32>) -> Vec<u32> {
        candidates.sort_unstable();
        candidates
    }
}

/// What became of a block handed to [`PieceManager::on_block`]
#[derive(Debug, PartialEq, Eq)]
pub enum BlockOutcome {
    /// Nobody asked for this block; it was dropped
    Discarded,
    /// Stored, the piece is still missing blocks
    Stored,
    /// The piece is complete and matches its hash
    Verified { index: u32, data: Vec<u8> },
    /// The piece is complete but corrupt; all of its blocks are pending again
    Corrupt { index: u32 },
}

#[derive(Debug, Clone, Copy)]
struct Outstanding {
    session:      SessionId,
    length:       u32,
    requested_at: Instant,
}

/// Tracks every block of the torrent from request to verified piece.
pub struct PieceManager {
    pieces:      Vec<Piece>,
    hashes:      Vec<[u8; HASH_LEN]>,
    block_size:  u32,
    outstanding: HashMap<(u32, u32), Outstanding>,
    buffers:     HashMap<u32, PieceBuffer>,
    selector:    Box<dyn PieceSelector>,
}

impl PieceManager {
    pub fn new(torrent: &Torrent, block_size: u32) -> Self {
        Self::with_selector(torrent, block_size, Box::new(Sequential))
    }

    pub fn with_selector(
        torrent:    &Torrent,
        block_size: u32,
        selector:   Box<dyn PieceSelector>,
    ) -> Self {
        let pieces = (0..torrent.pieces_count())
            .map(|i| Piece::new(i as u32, torrent.piece_size(i) as u32, block_size))
            .collect();

        Self {
            pieces,
            hashes: torrent.piece_hashes.clone(),
            block_size,
            outstanding: HashMap::new(),
            buffers: HashMap::new(),
            selector,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.pieces.iter().all(|p| p.verified)
    }

    pub fn verified_count(&self) -> usize {
        self.pieces.iter().filter(|p| p.verified).count()
    }

    /// Bytes still missing from verified output
    pub fn remaining_bytes(&self) -> u64 {
        self.pieces
            .iter()
            .filter(|p| !p.verified)
            .map(|p| p.length as u64)
            .sum()
    }

    pub fn outstanding_for(&self, session: SessionId) -> usize {
        self.outstanding
            .values()
            .filter(|o| o.session == session)
            .count()
    }

    /// Blocks that nobody has been asked for yet
    pub fn pending_blocks(&self) -> usize {
        self.pieces
            .iter()
            .flat_map(|p| p.blocks.iter())
            .filter(|b| b.state == BlockState::NotRequested)
            .count()
    }

    /// Picks blocks for `session` until it has `limit` requests in flight.
    ///
    /// Only pieces for which `available` returns true are considered.
    pub fn next_requests(
        &mut self,
        session:   SessionId,
        available: impl Fn(u32) -> bool,
        limit:     usize,
        now:       Instant,
    ) -> Vec<BlockRequest> {
        let budget = limit.saturating_sub(self.outstanding_for(session));
        if budget == 0 {
            return Vec::new();
        }

        let candidates = self
            .pieces
            .iter()
            .filter(|p| !p.verified && available(p.index))
            .filter(|p| p.blocks.iter().any(|b| b.state == BlockState::NotRequested))
            .map(|p| p.index)
            .collect();

        let mut out = Vec::new();
        'pieces: for index in self.selector.rank(candidates) {
            let Some(piece) = self.pieces.get_mut(index as usize) else {
                continue;
            };
            for block in piece
                .blocks
                .iter_mut()
                .filter(|b| b.state == BlockState::NotRequested)
            {
                block.state = BlockState::Requested;
                self.outstanding.insert(
                    (index, block.offset),
                    Outstanding { session, length: block.length, requested_at: now },
                );
                out.push(BlockRequest { index, begin: block.offset, length: block.length });
                if out.len() == budget {
                    break 'pieces;
                }
            }
        }
        out
    }

    /// Files a received block into its piece buffer, verifying the piece once full.
    pub fn on_block(&mut self, session: SessionId, block: Block) -> BlockOutcome {
        let key = (block.index, block.begin);
        match self.outstanding.get(&key) {
            Some(o) if o.length == block.length() => {}
            _ => {
                debug!(session, piece = block.index, begin = block.begin, "discarding untracked block");
                return BlockOutcome::Discarded;
            }
        }

        let Some(piece) = self.pieces.get_mut(block.index as usize) else {
            return BlockOutcome::Discarded;
        };

        let buffer = self
            .buffers
            .entry(block.index)
            .or_insert_with(|| PieceBuffer::new(piece.index, piece.length, self.block_size));
        if !buffer.write(block.begin, &block.data) {
            debug!(session, piece = block.index, begin = block.begin, "block does not fit its piece");
            return BlockOutcome::Discarded;
        }

        self.outstanding.remove(&key);
        if let Some(span) = piece.block_mut(block.begin) {
            span.state = BlockState::Downloaded;
        }

        if !buffer.is_complete() {
            return BlockOutcome::Stored;
        }

        let Some(buffer) = self.buffers.remove(&block.index) else {
            return BlockOutcome::Stored;
        };
        match buffer.verify(&self.hashes[block.index as usize]) {
            Ok(data) => {
                piece.verified = true;
                BlockOutcome::Verified { index: block.index, data }
            }
            Err(e) => {
                warn!(piece = block.index, error = %e, "piece failed verification, requesting again");
                piece.reset();
                BlockOutcome::Corrupt { index: block.index }
            }
        }
    }

    /// Returns every request held by `session` to the pending pool.
    pub fn release_session(&mut self, session: SessionId) -> Vec<BlockRequest> {
        self.release_where(|o| o.session == session)
            .into_iter()
            .map(|(_, req)| req)
            .collect()
    }

    /// Returns requests older than `timeout` to the pending pool, along with
    /// the session each was issued to.
    pub fn expire(&mut self, now: Instant, timeout: Duration) -> Vec<(SessionId, BlockRequest)> {
        self.release_where(|o| now.saturating_duration_since(o.requested_at) >= timeout)
    }

    /// When the oldest outstanding request will time out, if any is in flight.
    pub fn next_deadline(&self, timeout: Duration) -> Option<Instant> {
        self.outstanding
            .values()
            .map(|o| o.requested_at + timeout)
            .min()
    }

    fn release_where(
        &mut self,
        pred: impl Fn(&Outstanding) -> bool,
    ) -> Vec<(SessionId, BlockRequest)> {
        let keys: Vec<_> = self
            .outstanding
            .iter()
            .filter(|&(_, o)| pred(o))
            .map(|(k, _)| *k)
            .collect();

        let mut released = Vec::with_capacity(keys.len());
        for (index, begin) in keys {
            let Some(o) = self.outstanding.remove(&(index, begin)) else {
                continue;
            };
            if let Some(span) = self
                .pieces
                .get_mut(index as usize)
                .and_then(|p| p.block_mut(begin))
            {
                span.state = BlockState::NotRequested;
            }
            released.push((o.session, BlockRequest { index, begin, length: o.length }));
        }
        released.sort_by_key(|(_, r)| (r.index, r.begin));
        released
    }
}
