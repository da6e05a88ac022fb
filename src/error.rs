use std::io;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::torrent::TorrentMsg;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid bencode at byte {offset}: {reason}")]
    Bencode { offset: usize, reason: &'static str },

    #[error("invalid metainfo: {0}")]
    MetainfoInvalid(String),

    #[error("tracker refused the announce: {reason}")]
    TrackerFailure { reason: String },

    #[error("could not reach the tracker")]
    TrackerNetwork(#[from] reqwest::Error),

    #[error("the tracker sent a response we cannot parse")]
    TrackerResponse,

    #[error("peer violated the protocol: {0}")]
    PeerProtocolViolation(&'static str),

    #[error("peer I/O failed")]
    PeerIo(#[from] io::Error),

    #[error("the handshake received is not valid")]
    HandshakeInvalid,

    #[error("the peer took too long to complete the handshake")]
    HandshakeTimeout,

    #[error("the peer closed the socket")]
    PeerClosedSocket,

    #[error("the peer sent nothing for too long")]
    PeerIdle,

    #[error("piece {piece} does not have a valid hash")]
    HashMismatch { piece: usize },

    #[error("storage I/O failed")]
    StorageIo(#[source] io::Error),

    #[error("interrupted")]
    Interrupted,

    #[error("could not send message to Torrent")]
    SendErrorTorrent(#[from] mpsc::error::SendError<TorrentMsg>),

    #[error("could not receive message from oneshot")]
    ReceiveErrorOneshot(#[from] oneshot::error::RecvError),
}

impl Error {
    /// Exit code reported by the binary, one per error family.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Bencode { .. } | Error::MetainfoInvalid(_) => 2,
            Error::TrackerFailure { .. }
            | Error::TrackerNetwork(_)
            | Error::TrackerResponse => 3,
            Error::Interrupted => 5,
            _ => 4,
        }
    }
}
