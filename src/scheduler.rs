//! Decides which blocks each peer should request next.
//!
//! A block is reserved from the moment it is handed to a peer until the
//! bytes arrive or that peer is lost, and a reservation has exactly one
//! owner, so no two peers ever chase the same block. Piece selection is
//! random among the pieces the peer has and we still need; within a piece
//! blocks go out lowest offset first.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use rand::Rng;

use crate::{
    bitfield::Bitfield, metainfo::Info, peer::PeerId, tcp_wire::BlockInfo,
};

pub struct Scheduler {
    info: Arc<Info>,

    /// Pieces not yet verified.
    needed: HashSet<usize>,

    /// Block begin offsets received per piece, cleared when the piece
    /// verifies or fails.
    received: HashMap<usize, HashSet<usize>>,

    /// In-flight blocks and the peer that owns each.
    reservations: HashMap<(usize, usize), PeerId>,

    /// Peers that fed a piece that failed verification, never assigned
    /// that piece again.
    blacklist: HashMap<usize, HashSet<PeerId>>,
}

impl Scheduler {
    pub fn new(info: Arc<Info>) -> Self {
        let needed = (0..info.pieces()).collect();
        Self {
            info,
            needed,
            received: HashMap::new(),
            reservations: HashMap::new(),
            blacklist: HashMap::new(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.needed.is_empty()
    }

    pub fn missing_pieces(&self) -> usize {
        self.needed.len()
    }

    /// True if the peer has at least one piece we still need.
    pub fn is_interesting(&self, peer_bitfield: &Bitfield) -> bool {
        self.needed
            .iter()
            .any(|&piece| peer_bitfield.get(piece).is_some_and(|b| *b))
    }

    /// Reserve up to `qnt` blocks for `peer` from the pieces its bitfield
    /// advertises.
    pub fn assign(
        &mut self,
        peer: &PeerId,
        peer_bitfield: &Bitfield,
        qnt: usize,
    ) -> Vec<BlockInfo> {
        let mut assigned = Vec::with_capacity(qnt);

        for _ in 0..qnt {
            let candidates: Vec<usize> = self
                .needed
                .iter()
                .copied()
                .filter(|&piece| {
                    peer_bitfield.get(piece).is_some_and(|b| *b)
                        && !self.is_blacklisted(piece, peer)
                        && self.next_free_block(piece).is_some()
                })
                .collect();

            if candidates.is_empty() {
                break;
            }

            let piece =
                candidates[rand::rng().random_range(0..candidates.len())];
            let Some(block) = self.next_free_block(piece) else {
                break;
            };

            self.reservations
                .insert((block.index, block.begin), peer.clone());
            assigned.push(block);
        }

        assigned
    }

    /// The lowest-offset block of `piece` that is neither reserved nor
    /// received.
    fn next_free_block(&self, piece: usize) -> Option<BlockInfo> {
        let received = self.received.get(&piece);

        self.info.blocks_of_piece(piece).into_iter().find(|block| {
            !received.is_some_and(|r| r.contains(&block.begin))
                && !self.reservations.contains_key(&(piece, block.begin))
        })
    }

    /// The bytes of a reserved block arrived.
    pub fn block_received(&mut self, block: &BlockInfo) {
        self.reservations.remove(&(block.index, block.begin));
        self.received
            .entry(block.index)
            .or_default()
            .insert(block.begin);
    }

    /// Hand specific reservations back, the peer was choked or the
    /// requests timed out.
    pub fn release(&mut self, peer: &PeerId, blocks: &[BlockInfo]) {
        for block in blocks {
            let key = (block.index, block.begin);
            if self.reservations.get(&key) == Some(peer) {
                self.reservations.remove(&key);
            }
        }
    }

    /// The peer is gone, garbage-collect everything it held.
    pub fn release_peer(&mut self, peer: &PeerId) {
        self.reservations.retain(|_, owner| owner != peer);
    }

    /// The piece hashed correctly, nothing of it is needed anymore.
    pub fn piece_verified(&mut self, piece: usize) {
        self.needed.remove(&piece);
        self.received.remove(&piece);
        self.reservations.retain(|(p, _), _| *p != piece);
        self.blacklist.remove(&piece);
    }

    /// The piece failed verification, every block of it is needed again.
    pub fn piece_failed(&mut self, piece: usize) {
        self.received.remove(&piece);
        self.reservations.retain(|(p, _), _| *p != piece);
    }

    /// Stop assigning `piece` to `peer`, it fed us a corrupt copy.
    pub fn blacklist(&mut self, piece: usize, peer: PeerId) {
        self.blacklist.entry(piece).or_default().insert(peer);
    }

    fn is_blacklisted(&self, piece: usize, peer: &PeerId) -> bool {
        self.blacklist
            .get(&piece)
            .is_some_and(|peers| peers.contains(peer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{bitfield, tcp_wire::BLOCK_LEN};

    fn info(num_pieces: usize, piece_length: usize, total: usize) -> Arc<Info> {
        Arc::new(Info {
            name: "t".into(),
            piece_length,
            pieces: vec![0; num_pieces * 20],
            file_length: Some(total),
            ..Default::default()
        })
    }

    fn full_bitfield(n: usize) -> Bitfield {
        let mut b = bitfield::from_pieces(n);
        b.fill(true);
        b
    }

    fn peer(byte: u8) -> PeerId {
        PeerId([byte; 20])
    }

    #[test]
    fn assign_respects_the_peer_bitfield() {
        // 2 pieces of one block each
        let mut scheduler = Scheduler::new(info(2, BLOCK_LEN, 2 * BLOCK_LEN));

        let nothing = bitfield::from_pieces(2);
        assert!(scheduler.assign(&peer(1), &nothing, 5).is_empty());

        let mut only_second = bitfield::from_pieces(2);
        only_second.set(1, true);
        let assigned = scheduler.assign(&peer(1), &only_second, 5);
        assert_eq!(
            assigned,
            vec![BlockInfo {
                index: 1,
                begin: 0,
                len: BLOCK_LEN,
            }]
        );
    }

    #[test]
    fn blocks_go_out_lowest_offset_first_and_once() {
        // one piece of 3 blocks
        let mut scheduler = Scheduler::new(info(1, 3 * BLOCK_LEN, 3 * BLOCK_LEN));
        let bits = full_bitfield(1);

        let first = scheduler.assign(&peer(1), &bits, 2);
        assert_eq!(first[0].begin, 0);
        assert_eq!(first[1].begin, BLOCK_LEN);

        // a second peer only gets what is left
        let second = scheduler.assign(&peer(2), &bits, 5);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].begin, 2 * BLOCK_LEN);

        // everything reserved now
        assert!(scheduler.assign(&peer(3), &bits, 5).is_empty());
    }

    #[test]
    fn released_blocks_are_reassignable() {
        let mut scheduler = Scheduler::new(info(1, BLOCK_LEN, BLOCK_LEN));
        let bits = full_bitfield(1);

        let assigned = scheduler.assign(&peer(1), &bits, 1);
        assert_eq!(assigned.len(), 1);
        assert!(scheduler.assign(&peer(2), &bits, 1).is_empty());

        // only the owner's release counts
        scheduler.release(&peer(2), &assigned);
        assert!(scheduler.assign(&peer(2), &bits, 1).is_empty());

        scheduler.release(&peer(1), &assigned);
        assert_eq!(scheduler.assign(&peer(2), &bits, 1).len(), 1);
    }

    #[test]
    fn peer_loss_frees_its_reservations() {
        let mut scheduler = Scheduler::new(info(1, 2 * BLOCK_LEN, 2 * BLOCK_LEN));
        let bits = full_bitfield(1);

        scheduler.assign(&peer(1), &bits, 2);
        scheduler.release_peer(&peer(1));

        assert_eq!(scheduler.assign(&peer(2), &bits, 2).len(), 2);
    }

    #[test]
    fn received_blocks_are_not_reassigned() {
        let mut scheduler = Scheduler::new(info(1, 2 * BLOCK_LEN, 2 * BLOCK_LEN));
        let bits = full_bitfield(1);

        let assigned = scheduler.assign(&peer(1), &bits, 1);
        scheduler.block_received(&assigned[0]);
        scheduler.release_peer(&peer(1));

        // only the second block remains assignable
        let next = scheduler.assign(&peer(2), &bits, 5);
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].begin, BLOCK_LEN);
    }

    #[test]
    fn failed_piece_is_fully_needed_again() {
        let mut scheduler = Scheduler::new(info(1, 2 * BLOCK_LEN, 2 * BLOCK_LEN));
        let bits = full_bitfield(1);

        for block in scheduler.assign(&peer(1), &bits, 2) {
            scheduler.block_received(&block);
        }
        assert!(scheduler.assign(&peer(1), &bits, 1).is_empty());

        scheduler.piece_failed(0);
        assert_eq!(scheduler.assign(&peer(1), &bits, 5).len(), 2);
    }

    #[test]
    fn verified_piece_leaves_the_needed_set() {
        let mut scheduler = Scheduler::new(info(2, BLOCK_LEN, 2 * BLOCK_LEN));
        let bits = full_bitfield(2);

        scheduler.piece_verified(0);
        assert!(!scheduler.is_complete());

        let assigned = scheduler.assign(&peer(1), &bits, 5);
        assert_eq!(assigned.len(), 1);
        assert_eq!(assigned[0].index, 1);
        scheduler.block_received(&assigned[0]);

        scheduler.piece_verified(1);
        assert!(scheduler.is_complete());
    }

    #[test]
    fn blacklisted_peers_are_not_assigned_the_piece() {
        let mut scheduler = Scheduler::new(info(2, BLOCK_LEN, 2 * BLOCK_LEN));
        let bits = full_bitfield(2);

        scheduler.piece_verified(1);
        scheduler.blacklist(0, peer(1));

        assert!(scheduler.assign(&peer(1), &bits, 5).is_empty());
        assert_eq!(scheduler.assign(&peer(2), &bits, 5).len(), 1);
    }

    #[test]
    fn interest_follows_the_needed_set() {
        let mut scheduler = Scheduler::new(info(2, BLOCK_LEN, 2 * BLOCK_LEN));

        let mut bits = bitfield::from_pieces(2);
        bits.set(0, true);
        assert!(scheduler.is_interesting(&bits));

        scheduler.piece_verified(0);
        assert!(!scheduler.is_interesting(&bits));
    }
}
