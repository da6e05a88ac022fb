//! The session: one torrent, its tracker, its piece store and all of its
//! peers.
//!
//! Everything mutable lives inside [`Torrent`] and is only touched from
//! its own event loop, peers talk to it over channels. On a
//! current-thread runtime the whole client is cooperative on one thread.

use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    path::Path,
    sync::Arc,
    time::Duration,
};

use tokio::{
    select, spawn,
    sync::{broadcast, mpsc, oneshot},
    time::{interval, sleep_until, Instant},
};
use tracing::{debug, info, warn};

use crate::{
    bitfield::Bitfield,
    config::Config,
    counter::Counter,
    disk::{BlockStatus, Disk},
    error::Error,
    metainfo::{Info, MetaInfo},
    peer::{self, PeerCtx, PeerId, PeerMsg},
    scheduler::Scheduler,
    tcp_wire::{Block, BlockInfo},
    tracker::{Announce, Event, Tracker},
    utils::to_human_readable,
};

/// Shortest wait between two announces, also the first retry backoff.
static MIN_ANNOUNCE_WAIT: Duration = Duration::from_secs(15);

/// Longest backoff a failing tracker can push us to.
static MAX_ANNOUNCE_BACKOFF: Duration = Duration::from_secs(15 * 60);

/// Messages peers send to the session.
#[derive(Debug)]
pub enum TorrentMsg {
    /// The handshake succeeded, register the peer.
    PeerConnected(Arc<PeerCtx>),

    /// A dial failed or a peer's event loop ended.
    PeerGone {
        addr: SocketAddr,
        id: Option<PeerId>,
    },

    /// The peer announced all its pieces at once.
    Bitfield(PeerId, Bitfield),

    /// The peer announced one more piece.
    Have(PeerId, usize),

    /// Reserve up to `qnt` blocks for the peer to request.
    RequestBlocks {
        peer_id: PeerId,
        qnt: usize,
        recipient: oneshot::Sender<Vec<BlockInfo>>,
    },

    /// Reservations handed back on choke or request timeout.
    FreeBlocks(PeerId, Vec<BlockInfo>),

    /// A downloaded block on its way to the store.
    Block { peer_id: PeerId, block: Block },

    /// A remote wants one of our verified blocks.
    ReadBlock {
        block_info: BlockInfo,
        recipient: oneshot::Sender<Result<Block, Error>>,
    },

    /// Our bitfield, sent right after the handshake.
    ReadBitfield(oneshot::Sender<Bitfield>),
}

/// Broadcast to every connected peer.
#[derive(Debug, Clone)]
pub enum PeerBrMsg {
    /// We verified this piece, advertise it.
    HavePiece(usize),

    /// The session is over.
    Quit,
}

/// Context of [`Torrent`] shared with every peer task.
#[derive(Debug)]
pub struct TorrentCtx {
    pub tx: mpsc::Sender<TorrentMsg>,
    pub btx: broadcast::Sender<PeerBrMsg>,
    pub info: Arc<Info>,
    pub local_peer_id: PeerId,
    pub config: Arc<Config>,
}

struct PeerHandle {
    ctx: Arc<PeerCtx>,

    /// Our copy of the remote's bitfield, fed by its bitfield and have
    /// messages.
    pieces: Bitfield,
}

pub struct Torrent {
    pub ctx: Arc<TorrentCtx>,
    rx: mpsc::Receiver<TorrentMsg>,

    disk: Disk,
    scheduler: Scheduler,
    tracker: Tracker,
    counter: Counter,

    /// Peers past the handshake, by id.
    peers: HashMap<PeerId, PeerHandle>,

    /// Addresses the tracker gave us that we are not connected to.
    idle_peers: HashMap<SocketAddr, Option<PeerId>>,

    /// Addresses currently dialing or connected, never dialed twice.
    active_addrs: HashSet<SocketAddr>,

    /// When the tracker wants to hear from us again.
    next_announce: Instant,

    /// Grows on consecutive announce failures, reset on success.
    announce_backoff: Duration,
    announce_failures: u32,

    /// Whether the tracker ever handed us a single peer.
    seen_any_peer: bool,
}

impl Torrent {
    /// Parse the metainfo and prepare a session that will download into
    /// `download_dir`.
    pub fn open(
        metainfo_bytes: &[u8],
        download_dir: &Path,
        config: Config,
    ) -> Result<Self, Error> {
        let metainfo = MetaInfo::from_bytes(metainfo_bytes)?;
        Self::new(metainfo, download_dir, config)
    }

    pub fn new(
        metainfo: MetaInfo,
        download_dir: &Path,
        config: Config,
    ) -> Result<Self, Error> {
        let announce_urls = metainfo
            .announce_urls()
            .into_iter()
            .map(str::to_owned)
            .collect();

        let info = Arc::new(metainfo.info);
        let config = Arc::new(config);
        let local_peer_id = PeerId::generate(&config.peer_id_prefix);

        info!(
            "torrent \"{}\", {} pieces, {}",
            info.name,
            info.pieces(),
            to_human_readable(info.total_size() as f64),
        );

        let tracker = Tracker::new(
            announce_urls,
            info.info_hash.clone(),
            local_peer_id.clone(),
            config.port,
        )?;

        let (tx, rx) = mpsc::channel::<TorrentMsg>(512);
        let (btx, _) = broadcast::channel::<PeerBrMsg>(128);

        let disk = Disk::new(info.clone(), download_dir);
        let scheduler = Scheduler::new(info.clone());

        let ctx = Arc::new(TorrentCtx {
            tx,
            btx,
            info,
            local_peer_id,
            config,
        });

        Ok(Self {
            ctx,
            rx,
            disk,
            scheduler,
            tracker,
            counter: Counter::new(),
            peers: HashMap::new(),
            idle_peers: HashMap::new(),
            active_addrs: HashSet::new(),
            next_announce: Instant::now(),
            announce_backoff: MIN_ANNOUNCE_WAIT,
            announce_failures: 0,
            seen_any_peer: false,
        })
    }

    /// (verified pieces, total pieces, verified bytes)
    pub fn progress(&self) -> (usize, usize, usize) {
        self.disk.progress()
    }

    /// Run until every piece is verified on disk, a fatal error occurs or
    /// the user interrupts.
    pub async fn run(&mut self) -> Result<(), Error> {
        self.announce(Event::Started).await?;

        let mut dial_interval = interval(Duration::from_secs(1));
        let mut stats_interval = interval(Duration::from_secs(5));

        loop {
            select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("interrupted, telling the tracker goodbye");
                    self.shutdown().await;
                    return Err(Error::Interrupted);
                }
                Some(msg) = self.rx.recv() => {
                    self.handle_msg(msg).await?;

                    if self.scheduler.is_complete() {
                        info!("all pieces verified, download complete");
                        let _ = self.try_announce(Event::Completed).await;
                        self.shutdown().await;
                        return Ok(());
                    }
                }
                _ = sleep_until(self.next_announce) => {
                    self.announce(Event::None).await?;
                }
                _ = dial_interval.tick() => {
                    self.dial_idle_peers();

                    // peer set exhausted, go back to the tracker early
                    if self.peers.is_empty()
                        && self.idle_peers.is_empty()
                        && self.next_announce
                            > Instant::now() + MIN_ANNOUNCE_WAIT
                    {
                        self.next_announce =
                            Instant::now() + MIN_ANNOUNCE_WAIT;
                    }
                }
                _ = stats_interval.tick() => {
                    self.log_stats();
                }
            }
        }
    }

    async fn handle_msg(&mut self, msg: TorrentMsg) -> Result<(), Error> {
        match msg {
            TorrentMsg::PeerConnected(ctx) => {
                debug!("{} connected as {}", ctx.remote_addr, ctx.id);
                self.peers.insert(
                    ctx.id.clone(),
                    PeerHandle {
                        pieces: crate::bitfield::from_pieces(
                            self.ctx.info.pieces(),
                        ),
                        ctx,
                    },
                );
            }
            TorrentMsg::PeerGone { addr, id } => {
                debug!("{addr} gone");
                self.active_addrs.remove(&addr);
                if let Some(id) = id {
                    self.scheduler.release_peer(&id);
                    self.peers.remove(&id);
                }
            }
            TorrentMsg::Bitfield(id, pieces) => {
                if let Some(handle) = self.peers.get_mut(&id) {
                    handle.pieces = pieces;
                    self.update_interest(&id);
                }
            }
            TorrentMsg::Have(id, piece) => {
                if let Some(handle) = self.peers.get_mut(&id) {
                    handle.pieces.set(piece, true);
                    self.update_interest(&id);
                }
            }
            TorrentMsg::RequestBlocks {
                peer_id,
                qnt,
                recipient,
            } => {
                let blocks = match self.peers.get(&peer_id) {
                    Some(handle) => {
                        self.scheduler.assign(&peer_id, &handle.pieces, qnt)
                    }
                    None => Vec::new(),
                };

                // the peer may be gone by now; do not leak reservations
                if let Err(blocks) = recipient.send(blocks) {
                    self.scheduler.release(&peer_id, &blocks);
                }
            }
            TorrentMsg::FreeBlocks(peer_id, blocks) => {
                self.scheduler.release(&peer_id, &blocks);
            }
            TorrentMsg::Block { peer_id, block } => {
                self.handle_block(peer_id, block).await?;
            }
            TorrentMsg::ReadBlock {
                block_info,
                recipient,
            } => {
                let result = self
                    .disk
                    .read_block(&block_info)
                    .await
                    .map(|data| Block {
                        index: block_info.index,
                        begin: block_info.begin,
                        block: data,
                    });

                if let Ok(block) = &result {
                    self.counter.record_upload(block.block.len() as u64);
                }
                let _ = recipient.send(result);
            }
            TorrentMsg::ReadBitfield(recipient) => {
                let _ = recipient.send(self.disk.verified().clone());
            }
        }

        Ok(())
    }

    async fn handle_block(
        &mut self,
        peer_id: PeerId,
        block: Block,
    ) -> Result<(), Error> {
        let block_info = BlockInfo::from(&block);
        self.counter.record_download(block.block.len() as u64);

        let status = self
            .disk
            .accept_block(&peer_id, block.index, block.begin, &block.block)
            .await?;

        match status {
            BlockStatus::Accepted => {
                self.scheduler.block_received(&block_info);
            }
            BlockStatus::PieceVerified => {
                self.scheduler.block_received(&block_info);
                self.scheduler.piece_verified(block.index);

                let _ = self
                    .ctx
                    .btx
                    .send(PeerBrMsg::HavePiece(block.index));

                // some peers may have nothing we need anymore
                let ids: Vec<PeerId> = self.peers.keys().cloned().collect();
                for id in ids {
                    self.update_interest(&id);
                }
            }
            BlockStatus::PieceCorrupted => {
                self.scheduler.piece_failed(block.index);
                for peer in self.disk.blacklisted_peers(block.index) {
                    self.scheduler.blacklist(block.index, peer.clone());
                }
            }
            BlockStatus::Duplicate | BlockStatus::OutOfRange => {
                debug!(
                    "wasted block {:?} from {peer_id}: {status:?}",
                    block_info
                );
                // if this peer still held the reservation, let someone
                // else have the block
                self.scheduler.release(&peer_id, &[block_info]);
            }
        }

        Ok(())
    }

    /// Tell the peer whether it has anything we still need.
    fn update_interest(&mut self, peer_id: &PeerId) {
        let Some(handle) = self.peers.get(peer_id) else {
            return;
        };

        let msg = if self.scheduler.is_interesting(&handle.pieces) {
            PeerMsg::Interested
        } else {
            PeerMsg::NotInterested
        };

        // peers apply these idempotently, a dropped one is re-sent on the
        // next bitfield change
        let _ = handle.ctx.tx.try_send(msg);
    }

    /// Dial idle peers while below the connection cap.
    fn dial_idle_peers(&mut self) {
        let capacity = self
            .ctx
            .config
            .max_peers
            .saturating_sub(self.active_addrs.len());

        let addrs: Vec<SocketAddr> =
            self.idle_peers.keys().copied().take(capacity).collect();

        for addr in addrs {
            let expected_id = self.idle_peers.remove(&addr).flatten();
            if !self.active_addrs.insert(addr) {
                continue;
            }

            let torrent_ctx = self.ctx.clone();

            spawn(async move {
                let tx = torrent_ctx.tx.clone();

                match peer::outbound_handshake(addr, expected_id, torrent_ctx)
                    .await
                {
                    Ok(mut peer) => {
                        let id = peer.ctx.id.clone();
                        if let Err(e) = peer.run().await {
                            debug!("{addr} disconnected: {e}");
                        }
                        let _ = tx
                            .send(TorrentMsg::PeerGone {
                                addr,
                                id: Some(id),
                            })
                            .await;
                    }
                    Err(e) => {
                        debug!("{addr} handshake failed: {e}");
                        let _ = tx
                            .send(TorrentMsg::PeerGone { addr, id: None })
                            .await;
                    }
                }
            });
        }
    }

    /// Announce and absorb the response. Failures back off exponentially;
    /// they are only fatal while we have never seen a peer and the backoff
    /// is exhausted.
    async fn announce(&mut self, event: Event) -> Result<(), Error> {
        match self.try_announce(event).await {
            Ok(()) => {
                self.announce_backoff = MIN_ANNOUNCE_WAIT;
                self.announce_failures = 0;
                Ok(())
            }
            Err(e) => {
                warn!("announce failed: {e}");
                self.announce_failures += 1;

                let give_up = self.announce_backoff >= MAX_ANNOUNCE_BACKOFF
                    && !self.seen_any_peer
                    && self.disk.progress().0 == 0;
                if give_up {
                    return Err(e);
                }

                self.next_announce = Instant::now() + self.announce_backoff;
                self.announce_backoff =
                    (self.announce_backoff * 2).min(MAX_ANNOUNCE_BACKOFF);
                Ok(())
            }
        }
    }

    async fn try_announce(&mut self, event: Event) -> Result<(), Error> {
        let (_, _, verified_bytes) = self.disk.progress();
        let left = self.ctx.info.total_size().saturating_sub(verified_bytes);

        let response = self
            .tracker
            .announce(Announce {
                event,
                downloaded: self.counter.total_download(),
                uploaded: self.counter.total_upload(),
                left: left as u64,
            })
            .await?;

        if event == Event::Stopped || event == Event::Completed {
            return Ok(());
        }

        debug!(
            "tracker: {} peer(s), next announce in {}s",
            response.peers.len(),
            response.interval
        );

        for (addr, id) in response.peers {
            self.seen_any_peer = true;
            if !self.active_addrs.contains(&addr) {
                self.idle_peers.entry(addr).or_insert(id);
            }
        }

        self.next_announce = Instant::now()
            + Duration::from_secs(response.interval).max(MIN_ANNOUNCE_WAIT);

        Ok(())
    }

    /// Stop every peer and send the final announce.
    async fn shutdown(&mut self) {
        let _ = self.ctx.btx.send(PeerBrMsg::Quit);

        if let Err(e) = self.try_announce(Event::Stopped).await {
            debug!("stopped announce failed: {e}");
        }
    }

    fn log_stats(&self) {
        self.counter.update_rates();
        for handle in self.peers.values() {
            handle.ctx.counter.update_rates();
        }

        let (verified, total, bytes) = self.disk.progress();
        info!(
            "{verified}/{total} pieces, {} down {} up {}, {} peer(s)",
            to_human_readable(bytes as f64),
            self.counter.download_rate(),
            self.counter.upload_rate(),
            self.peers.len(),
        );
    }
}
