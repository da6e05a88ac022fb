//! A remote peer: dialing, handshake and the per-connection event loop.

pub mod session;

use std::{fmt, net::SocketAddr, sync::Arc, time::Duration};

use futures::{SinkExt, StreamExt};
use rand::{distr::Alphanumeric, Rng};
use tokio::{
    net::TcpStream,
    select,
    sync::{mpsc, oneshot},
    time::{interval, interval_at, timeout, Instant},
};
use tokio_util::codec::Framed;
use tracing::{debug, trace, warn};

use crate::{
    bitfield,
    counter::Counter,
    error::Error,
    tcp_wire::{BlockInfo, Handshake, HandshakeCodec, Message, PeerCodec},
    torrent::{PeerBrMsg, TorrentCtx, TorrentMsg},
};

static DIAL_TIMEOUT: Duration = Duration::from_secs(5);
static HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// The ID of a peer, sent in the handshake.
#[derive(Clone, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct PeerId(pub [u8; 20]);

impl PeerId {
    /// Generate a fresh local id: the client prefix followed by random
    /// alphanumeric bytes.
    pub fn generate(prefix: &str) -> Self {
        let mut id = [0u8; 20];
        let prefix = prefix.as_bytes();
        let n = prefix.len().min(20);
        id[..n].copy_from_slice(&prefix[..n]);

        for byte in id.iter_mut().skip(n) {
            *byte = rand::rng().sample(Alphanumeric);
        }

        PeerId(id)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

/// Messages the session sends to one specific peer.
#[derive(Debug, Clone)]
pub enum PeerMsg {
    /// The peer has pieces we need, declare interest.
    Interested,

    /// Nothing this peer has is needed anymore.
    NotInterested,
}

/// Peer data shared with the session.
#[derive(Debug)]
pub struct PeerCtx {
    pub tx: mpsc::Sender<PeerMsg>,
    pub id: PeerId,
    pub remote_addr: SocketAddr,

    /// Upload and download totals of this connection.
    pub counter: Counter,
}

/// A connected peer, past the handshake, running its event loop.
pub struct Peer {
    pub ctx: Arc<PeerCtx>,
    torrent_ctx: Arc<TorrentCtx>,

    sink: futures::stream::SplitSink<Framed<TcpStream, PeerCodec>, Message>,
    stream: futures::stream::SplitStream<Framed<TcpStream, PeerCodec>>,
    rx: mpsc::Receiver<PeerMsg>,

    state: session::State,
    pipeline: session::RequestPipeline,

    /// A bitfield is only honored as the very first message.
    first_message: bool,

    last_inbound: Instant,
}

/// Dial `addr` and exchange handshakes.
///
/// The connection is dropped when the remote speaks another protocol or
/// another torrent. `expected_id` is the peer id the tracker reported, if
/// it reported one; a mismatch is only worth a warning.
pub async fn outbound_handshake(
    addr: SocketAddr,
    expected_id: Option<PeerId>,
    torrent_ctx: Arc<TorrentCtx>,
) -> Result<Peer, Error> {
    let socket = timeout(DIAL_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| Error::HandshakeTimeout)??;

    let mut socket = Framed::new(socket, HandshakeCodec);

    let ours = Handshake::new(
        torrent_ctx.info.info_hash.clone(),
        torrent_ctx.local_peer_id.clone(),
    );
    socket.send(ours.clone()).await?;

    let theirs = match timeout(HANDSHAKE_TIMEOUT, socket.next()).await {
        Ok(Some(Ok(handshake))) => handshake,
        Ok(Some(Err(_))) => return Err(Error::HandshakeInvalid),
        Ok(None) => return Err(Error::PeerClosedSocket),
        Err(_) => return Err(Error::HandshakeTimeout),
    };

    if !theirs.validate(&ours) {
        debug!("{addr} sent an invalid handshake");
        return Err(Error::HandshakeInvalid);
    }

    if let Some(expected) = expected_id {
        if theirs.peer_id != expected {
            warn!("{addr} identifies as {} but the tracker said {expected}",
                theirs.peer_id);
        }
    }

    let socket = socket.map_codec(|_| PeerCodec);
    let (sink, stream) = socket.split();
    let (tx, rx) = mpsc::channel::<PeerMsg>(64);

    let pipeline_depth = torrent_ctx.config.pipeline_depth;

    Ok(Peer {
        ctx: Arc::new(PeerCtx {
            tx,
            id: theirs.peer_id,
            remote_addr: addr,
            counter: Counter::new(),
        }),
        torrent_ctx,
        sink,
        stream,
        rx,
        state: session::State::default(),
        pipeline: session::RequestPipeline::new(pipeline_depth),
        first_message: true,
        last_inbound: Instant::now(),
    })
}

impl Peer {
    /// Run the event loop until the download completes, the peer
    /// misbehaves or the connection dies.
    pub async fn run(&mut self) -> Result<(), Error> {
        // subscribe before registering so no broadcast can slip between
        let mut brx = self.torrent_ctx.btx.subscribe();

        self.torrent_ctx
            .tx
            .send(TorrentMsg::PeerConnected(self.ctx.clone()))
            .await?;

        // our bitfield goes out first, when there is anything in it
        {
            let (otx, orx) = oneshot::channel();
            self.torrent_ctx
                .tx
                .send(TorrentMsg::ReadBitfield(otx))
                .await?;
            let bitfield = orx.await?;
            if bitfield.count_ones() > 0 {
                self.sink.send(Message::Bitfield(bitfield)).await?;
            }
        }

        // keep the connection alive, and sweep for idleness and request
        // timeouts
        let mut keep_alive_interval = interval_at(
            Instant::now() + Duration::from_secs(60),
            Duration::from_secs(60),
        );
        let mut tick_interval = interval(Duration::from_secs(1));

        loop {
            select! {
                msg = self.stream.next() => {
                    let msg = match msg {
                        Some(Ok(msg)) => msg,
                        Some(Err(e)) => return Err(e),
                        None => return Err(Error::PeerClosedSocket),
                    };
                    self.last_inbound = Instant::now();
                    self.handle_msg(msg).await?;
                }
                Ok(msg) = brx.recv() => {
                    match msg {
                        PeerBrMsg::HavePiece(piece) => {
                            self.sink.send(Message::Have(piece)).await?;
                        }
                        PeerBrMsg::Quit => {
                            debug!("{} quit", self.ctx.remote_addr);
                            return Ok(());
                        }
                    }
                }
                Some(msg) = self.rx.recv() => {
                    match msg {
                        PeerMsg::Interested => self.interested().await?,
                        PeerMsg::NotInterested => self.not_interested().await?,
                    }
                }
                _ = keep_alive_interval.tick() => {
                    self.sink.send(Message::KeepAlive).await?;
                }
                _ = tick_interval.tick() => {
                    self.tick().await?;
                }
            }
        }
    }

    async fn handle_msg(&mut self, msg: Message) -> Result<(), Error> {
        let first_message = self.first_message;
        self.first_message = false;

        let num_pieces = self.torrent_ctx.info.pieces();
        let remote = self.ctx.remote_addr;

        match msg {
            Message::KeepAlive => {
                trace!("{remote} keepalive");
            }
            Message::Choke => {
                debug!("{remote} choked us");
                self.state.peer_choking = true;

                // everything in flight is lost, hand the reservations back
                let released = self.pipeline.drain();
                if !released.is_empty() {
                    self.torrent_ctx
                        .tx
                        .send(TorrentMsg::FreeBlocks(
                            self.ctx.id.clone(),
                            released,
                        ))
                        .await?;
                }
            }
            Message::Unchoke => {
                debug!("{remote} unchoked us");
                self.state.peer_choking = false;
                self.request_blocks().await?;
            }
            Message::Interested => {
                debug!("{remote} is interested");
                self.state.peer_interested = true;

                // no choking algorithm here, an interested peer is served
                if self.state.am_choking {
                    self.state.am_choking = false;
                    self.sink.send(Message::Unchoke).await?;
                }
            }
            Message::NotInterested => {
                debug!("{remote} is not interested");
                self.state.peer_interested = false;
            }
            Message::Have(piece) => {
                if piece >= num_pieces {
                    return Err(Error::PeerProtocolViolation(
                        "have index out of bounds",
                    ));
                }
                self.torrent_ctx
                    .tx
                    .send(TorrentMsg::Have(self.ctx.id.clone(), piece))
                    .await?;
            }
            Message::Bitfield(bitfield) => {
                if !first_message {
                    debug!("{remote} sent a late bitfield, ignoring");
                    return Ok(());
                }
                // exactly ceil(num_pieces / 8) bytes, spare bits zero
                if bitfield.len() != num_pieces.div_ceil(8) * 8
                    || bitfield::has_spare_bits(&bitfield, num_pieces)
                {
                    return Err(Error::PeerProtocolViolation(
                        "bad bitfield length",
                    ));
                }

                let mut bitfield = bitfield;
                bitfield.truncate(num_pieces);

                self.torrent_ctx
                    .tx
                    .send(TorrentMsg::Bitfield(self.ctx.id.clone(), bitfield))
                    .await?;
            }
            Message::Request(block_info) => {
                self.upload_block(block_info).await?;
            }
            Message::Piece(block) => {
                let block_info = BlockInfo::from(&block);
                let solicited = self.pipeline.fulfill(&block_info);

                if !solicited {
                    // either unsolicited or it timed out and was released;
                    // the store decides whether the bytes are still useful
                    trace!("{remote} sent a block we no longer wait for");
                }

                self.ctx.counter.record_download(block.block.len() as u64);
                self.torrent_ctx
                    .tx
                    .send(TorrentMsg::Block {
                        peer_id: self.ctx.id.clone(),
                        block,
                    })
                    .await?;

                self.request_blocks().await?;
            }
            Message::Cancel(block_info) => {
                // blocks are served as the request arrives, nothing queued
                // to cancel
                trace!("{remote} cancel {block_info:?}");
            }
        }

        Ok(())
    }

    /// Periodic housekeeping: idle cut-off and request timeouts.
    async fn tick(&mut self) -> Result<(), Error> {
        if self.last_inbound.elapsed() >= self.torrent_ctx.config.idle_timeout {
            return Err(Error::PeerIdle);
        }

        let expired = self
            .pipeline
            .timed_out(self.torrent_ctx.config.block_timeout);
        if !expired.is_empty() {
            warn!(
                "{} let {} request(s) time out",
                self.ctx.remote_addr,
                expired.len()
            );
            self.torrent_ctx
                .tx
                .send(TorrentMsg::FreeBlocks(self.ctx.id.clone(), expired))
                .await?;
        }

        self.request_blocks().await?;

        Ok(())
    }

    fn can_request(&self) -> bool {
        self.state.am_interested
            && !self.state.peer_choking
            && self.pipeline.available() > 0
    }

    /// Fill the pipeline with fresh assignments from the scheduler.
    async fn request_blocks(&mut self) -> Result<(), Error> {
        if !self.can_request() {
            return Ok(());
        }

        let (otx, orx) = oneshot::channel();
        self.torrent_ctx
            .tx
            .send(TorrentMsg::RequestBlocks {
                peer_id: self.ctx.id.clone(),
                qnt: self.pipeline.available(),
                recipient: otx,
            })
            .await?;

        let blocks = orx.await?;
        let got_any = !blocks.is_empty();

        for block in blocks {
            if self.pipeline.add(block) {
                self.sink.feed(Message::Request(block)).await?;
            }
        }
        if got_any {
            self.sink.flush().await?;
        }

        Ok(())
    }

    /// Serve a block of a verified piece to the remote.
    async fn upload_block(&mut self, block_info: BlockInfo) -> Result<(), Error> {
        if self.state.am_choking {
            trace!("{} requested while choked", self.ctx.remote_addr);
            return Ok(());
        }

        let (otx, orx) = oneshot::channel();
        self.torrent_ctx
            .tx
            .send(TorrentMsg::ReadBlock {
                block_info,
                recipient: otx,
            })
            .await?;

        let block = orx.await??;

        self.ctx.counter.record_upload(block.block.len() as u64);
        self.sink.send(Message::Piece(block)).await?;

        Ok(())
    }

    async fn interested(&mut self) -> Result<(), Error> {
        if !self.state.am_interested {
            self.state.am_interested = true;
            self.sink.send(Message::Interested).await?;
        }
        self.request_blocks().await
    }

    async fn not_interested(&mut self) -> Result<(), Error> {
        if self.state.am_interested {
            self.state.am_interested = false;
            self.sink.send(Message::NotInterested).await?;
        }
        Ok(())
    }
}
