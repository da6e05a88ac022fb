//! Protocol state of a single connection.

use std::{collections::HashMap, time::Duration};

use tokio::time::Instant;

use crate::tcp_wire::BlockInfo;

/// The choke and interest flags, in both directions.
///
/// Every connection starts the same way: both sides choking, neither
/// interested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct State {
    /// We are choking the remote peer.
    pub am_choking: bool,

    /// We want pieces the remote peer has.
    pub am_interested: bool,

    /// The remote peer is choking us.
    pub peer_choking: bool,

    /// The remote peer wants pieces we have.
    pub peer_interested: bool,
}

impl Default for State {
    fn default() -> Self {
        Self {
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
        }
    }
}

/// The block requests sent to one peer and not yet answered, capped at the
/// pipeline depth.
#[derive(Debug)]
pub struct RequestPipeline {
    in_flight: HashMap<BlockInfo, Instant>,
    depth: usize,
}

impl RequestPipeline {
    pub fn new(depth: usize) -> Self {
        Self {
            in_flight: HashMap::with_capacity(depth),
            depth,
        }
    }

    /// How many more requests fit right now.
    pub fn available(&self) -> usize {
        self.depth.saturating_sub(self.in_flight.len())
    }

    pub fn len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.in_flight.is_empty()
    }

    /// Track a request. False when the pipeline is full or the block is
    /// already in flight, at most one request per block.
    pub fn add(&mut self, block: BlockInfo) -> bool {
        if self.available() == 0 || self.in_flight.contains_key(&block) {
            return false;
        }
        self.in_flight.insert(block, Instant::now());
        true
    }

    /// The block arrived. False if it was not in flight, an unsolicited or
    /// timed-out-and-released block.
    pub fn fulfill(&mut self, block: &BlockInfo) -> bool {
        self.in_flight.remove(block).is_some()
    }

    /// Remove and return every request pending for longer than `timeout`.
    pub fn timed_out(&mut self, timeout: Duration) -> Vec<BlockInfo> {
        let now = Instant::now();
        let expired: Vec<BlockInfo> = self
            .in_flight
            .iter()
            .filter(|(_, sent)| now.duration_since(**sent) >= timeout)
            .map(|(block, _)| *block)
            .collect();

        for block in &expired {
            self.in_flight.remove(block);
        }

        expired
    }

    /// Give every in-flight request back, used on choke and on close.
    pub fn drain(&mut self) -> Vec<BlockInfo> {
        self.in_flight.drain().map(|(block, _)| block).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tcp_wire::BLOCK_LEN;

    fn block(begin: usize) -> BlockInfo {
        BlockInfo {
            index: 0,
            begin,
            len: BLOCK_LEN,
        }
    }

    #[test]
    fn connections_start_choked_and_uninterested() {
        let state = State::default();
        assert!(state.am_choking);
        assert!(state.peer_choking);
        assert!(!state.am_interested);
        assert!(!state.peer_interested);
    }

    #[test]
    fn pipeline_caps_in_flight_requests() {
        let mut pipeline = RequestPipeline::new(2);

        assert!(pipeline.add(block(0)));
        assert!(pipeline.add(block(BLOCK_LEN)));
        assert_eq!(pipeline.available(), 0);
        assert!(!pipeline.add(block(2 * BLOCK_LEN)));

        assert!(pipeline.fulfill(&block(0)));
        assert_eq!(pipeline.available(), 1);
        assert!(pipeline.add(block(2 * BLOCK_LEN)));
    }

    #[test]
    fn at_most_one_request_per_block() {
        let mut pipeline = RequestPipeline::new(5);

        assert!(pipeline.add(block(0)));
        assert!(!pipeline.add(block(0)));
        assert_eq!(pipeline.len(), 1);
    }

    #[test]
    fn unsolicited_blocks_are_not_fulfilled() {
        let mut pipeline = RequestPipeline::new(5);
        assert!(!pipeline.fulfill(&block(0)));
    }

    #[tokio::test(start_paused = true)]
    async fn requests_expire() {
        let mut pipeline = RequestPipeline::new(5);
        pipeline.add(block(0));

        assert!(pipeline.timed_out(Duration::from_secs(60)).is_empty());

        tokio::time::advance(Duration::from_secs(61)).await;

        let expired = pipeline.timed_out(Duration::from_secs(60));
        assert_eq!(expired, vec![block(0)]);
        assert!(pipeline.is_empty());
    }

    #[test]
    fn drain_returns_everything() {
        let mut pipeline = RequestPipeline::new(5);
        pipeline.add(block(0));
        pipeline.add(block(BLOCK_LEN));

        let mut drained = pipeline.drain();
        drained.sort();
        assert_eq!(drained, vec![block(0), block(BLOCK_LEN)]);
        assert!(pipeline.is_empty());
    }
}
