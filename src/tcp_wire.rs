//! The peer wire protocol: handshake and message framing.
//!
//! The handshake has its own codec as its structure differs from every
//! other message and it is only ever exchanged once, at the start of a
//! connection. After both handshakes the stream is switched to
//! [`PeerCodec`] without discarding the underlying buffers.

use std::io::Cursor;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{
    bitfield::Bitfield, error::Error, metainfo::InfoHash, peer::PeerId,
};

/// The block length all clients exchange; the last block of a piece might
/// be smaller.
pub const BLOCK_LEN: usize = 16384;

/// Bytes of the string "BitTorrent protocol", sent during the handshake.
pub const PSTR: [u8; 19] = *b"BitTorrent protocol";

/// A block that a peer sent us, the payload of a `piece` message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    /// The index of the piece this block belongs to.
    pub index: usize,

    /// The zero-based byte offset into the piece.
    pub begin: usize,

    pub block: Vec<u8>,
}

/// The coordinates of a block, the payload of `request` and `cancel`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockInfo {
    /// The index of the piece of which this is a block.
    pub index: usize,

    /// The zero-based byte offset into the piece.
    pub begin: usize,

    /// The block's length in bytes, at most 16 KiB.
    pub len: usize,
}

impl From<&Block> for BlockInfo {
    fn from(block: &Block) -> Self {
        BlockInfo {
            index: block.index,
            begin: block.begin,
            len: block.block.len(),
        }
    }
}

impl BlockInfo {
    pub fn is_valid(&self) -> bool {
        self.len > 0 && self.len <= BLOCK_LEN && self.begin < u32::MAX as usize
    }
}

/// The first message exchanged, in both directions.
///
/// If the remote's protocol string or info hash differs from ours the
/// connection is severed. The peer id identifies the client; a mismatch
/// against the id the tracker reported is only worth a warning.
#[derive(Clone, Debug, PartialEq)]
pub struct Handshake {
    pub pstr: [u8; 19],
    pub reserved: [u8; 8],
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
}

impl Handshake {
    pub const LEN: usize = 68;

    pub fn new(info_hash: InfoHash, peer_id: PeerId) -> Self {
        Self {
            pstr: PSTR,
            reserved: [0u8; 8],
            info_hash,
            peer_id,
        }
    }

    /// True when the remote handshake talks our protocol about our torrent.
    pub fn validate(&self, ours: &Self) -> bool {
        self.pstr == PSTR && self.info_hash == ours.info_hash
    }
}

#[derive(Debug)]
pub struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = Error;

    fn encode(
        &mut self,
        handshake: Handshake,
        buf: &mut BytesMut,
    ) -> Result<(), Error> {
        buf.put_u8(handshake.pstr.len() as u8);
        buf.extend_from_slice(&handshake.pstr);
        buf.extend_from_slice(&handshake.reserved);
        buf.extend_from_slice(&handshake.info_hash.0);
        buf.extend_from_slice(&handshake.peer_id.0);
        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Handshake>, Error> {
        if buf.is_empty() {
            return Ok(None);
        }

        // peek the prefix without advancing, the payload may not be
        // buffered yet
        let pstr_len = buf[0] as usize;
        if pstr_len != PSTR.len() {
            return Err(Error::HandshakeInvalid);
        }

        if buf.remaining() < Handshake::LEN {
            return Ok(None);
        }
        buf.advance(1);

        let mut pstr = [0; 19];
        buf.copy_to_slice(&mut pstr);
        let mut reserved = [0; 8];
        buf.copy_to_slice(&mut reserved);
        let mut info_hash = [0; 20];
        buf.copy_to_slice(&mut info_hash);
        let mut peer_id = [0; 20];
        buf.copy_to_slice(&mut peer_id);

        Ok(Some(Handshake {
            pstr,
            reserved,
            info_hash: InfoHash(info_hash),
            peer_id: PeerId(peer_id),
        }))
    }
}

/// Messages exchanged after a successful handshake.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(usize),
    Bitfield(Bitfield),
    Request(BlockInfo),
    Piece(Block),
    Cancel(BlockInfo),
}

/// The IDs of the [`Message`]s.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq)]
enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
}

impl MessageId {
    fn from_u8(id: u8) -> Option<Self> {
        use MessageId::*;
        Some(match id {
            0 => Choke,
            1 => Unchoke,
            2 => Interested,
            3 => NotInterested,
            4 => Have,
            5 => Bitfield,
            6 => Request,
            7 => Piece,
            8 => Cancel,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone)]
pub struct PeerCodec;

impl Encoder<Message> for PeerCodec {
    type Error = Error;

    fn encode(&mut self, item: Message, buf: &mut BytesMut) -> Result<(), Error> {
        match item {
            Message::KeepAlive => {
                buf.put_u32(0);
            }
            Message::Choke => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Choke as u8);
            }
            Message::Unchoke => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Unchoke as u8);
            }
            Message::Interested => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Interested as u8);
            }
            Message::NotInterested => {
                buf.put_u32(1);
                buf.put_u8(MessageId::NotInterested as u8);
            }
            // <len=0005><id=4><piece index>
            Message::Have(piece) => {
                buf.put_u32(1 + 4);
                buf.put_u8(MessageId::Have as u8);
                buf.put_u32(piece as u32);
            }
            // <len=0001+X><id=5><bitfield>
            Message::Bitfield(bitfield) => {
                let v = bitfield.into_vec();
                buf.put_u32(1 + v.len() as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.extend_from_slice(&v);
            }
            // <len=0013><id=6><index><begin><length>
            Message::Request(block) => {
                buf.put_u32(1 + 4 + 4 + 4);
                buf.put_u8(MessageId::Request as u8);
                buf.put_u32(block.index as u32);
                buf.put_u32(block.begin as u32);
                buf.put_u32(block.len as u32);
            }
            // <len=0009+X><id=7><index><begin><block>
            Message::Piece(block) => {
                buf.put_u32(1 + 4 + 4 + block.block.len() as u32);
                buf.put_u8(MessageId::Piece as u8);
                buf.put_u32(block.index as u32);
                buf.put_u32(block.begin as u32);
                buf.extend_from_slice(&block.block);
            }
            // <len=0013><id=8><index><begin><length>
            Message::Cancel(block) => {
                buf.put_u32(1 + 4 + 4 + 4);
                buf.put_u8(MessageId::Cancel as u8);
                buf.put_u32(block.index as u32);
                buf.put_u32(block.begin as u32);
                buf.put_u32(block.len as u32);
            }
        }
        Ok(())
    }
}

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Message>, Error> {
        // unknown message ids are skipped silently, hence the loop
        loop {
            if buf.remaining() < 4 {
                return Ok(None);
            }

            // peek the length prefix, the body may not be buffered yet
            let mut peek = Cursor::new(&buf[..]);
            let msg_len = peek.get_u32() as usize;

            if buf.remaining() < 4 + msg_len {
                return Ok(None);
            }
            buf.advance(4);

            if msg_len == 0 {
                return Ok(Some(Message::KeepAlive));
            }

            let id = buf.get_u8();
            let Some(id) = MessageId::from_u8(id) else {
                buf.advance(msg_len - 1);
                continue;
            };

            let msg = match id {
                MessageId::Choke => Message::Choke,
                MessageId::Unchoke => Message::Unchoke,
                MessageId::Interested => Message::Interested,
                MessageId::NotInterested => Message::NotInterested,
                MessageId::Have => {
                    if msg_len != 5 {
                        return Err(Error::PeerProtocolViolation(
                            "have with bad length",
                        ));
                    }
                    Message::Have(buf.get_u32() as usize)
                }
                MessageId::Bitfield => {
                    let mut bytes = vec![0; msg_len - 1];
                    buf.copy_to_slice(&mut bytes);
                    Message::Bitfield(Bitfield::from_vec(bytes))
                }
                MessageId::Request | MessageId::Cancel => {
                    if msg_len != 13 {
                        return Err(Error::PeerProtocolViolation(
                            "request with bad length",
                        ));
                    }
                    let info = BlockInfo {
                        index: buf.get_u32() as usize,
                        begin: buf.get_u32() as usize,
                        len: buf.get_u32() as usize,
                    };
                    if id == MessageId::Request {
                        Message::Request(info)
                    } else {
                        Message::Cancel(info)
                    }
                }
                MessageId::Piece => {
                    if msg_len < 9 {
                        return Err(Error::PeerProtocolViolation(
                            "piece with bad length",
                        ));
                    }
                    let index = buf.get_u32() as usize;
                    let begin = buf.get_u32() as usize;
                    let mut block = vec![0; msg_len - 9];
                    buf.copy_to_slice(&mut block);
                    Message::Piece(Block {
                        index,
                        begin,
                        block,
                    })
                }
            };

            return Ok(Some(msg));
        }
    }
}
