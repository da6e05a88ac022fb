//! The piece store: it maps pieces to byte ranges of the torrent's files,
//! buffers blocks until their piece verifies and owns all file I/O.
//!
//! Nothing is written to disk before its piece's hash checks out, and reads
//! only serve verified pieces, so the files never hold bad bytes.

use std::{
    collections::{HashMap, HashSet},
    io::SeekFrom,
    path::PathBuf,
    sync::Arc,
};

use sha1::{Digest, Sha1};
use tokio::{
    fs::{File, OpenOptions},
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
};
use tracing::{debug, warn};

use crate::{
    bitfield::{self, Bitfield},
    error::Error,
    metainfo::Info,
    peer::PeerId,
    tcp_wire::{BlockInfo, BLOCK_LEN},
};

/// Where a file of the torrent lives, in the logical concatenation and on
/// disk.
#[derive(Debug, Clone)]
pub struct FileMetadata {
    pub path: PathBuf,
    pub start_offset: usize,
    pub length: usize,
}

/// A slice of one file that a piece maps onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileSegment {
    pub file_index: usize,
    pub file_offset: usize,
    pub len: usize,
}

/// What happened to a block handed to [`Disk::accept_block`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockStatus {
    /// Buffered, the piece is still incomplete.
    Accepted,

    /// The block completed its piece and the hash matched, the piece is on
    /// disk now.
    PieceVerified,

    /// The block completed its piece but the hash did not match. The
    /// buffer was discarded and the contributing peers are blacklisted for
    /// this piece.
    PieceCorrupted,

    /// Already had it, or the sender is blacklisted for this piece.
    Duplicate,

    /// The block does not sit on the piece's block grid.
    OutOfRange,
}

/// A piece under construction. Buffers live in memory until the piece
/// verifies, allocated on the first block.
struct PieceBuffer {
    buf: Vec<u8>,

    /// One bit per block of this piece.
    received: Bitfield,
    received_bytes: usize,

    /// Who sent blocks into this buffer, charged if the hash fails.
    contributors: HashSet<PeerId>,
}

pub struct Disk {
    info: Arc<Info>,
    file_metadata: Vec<FileMetadata>,

    /// Pieces fully verified and written out.
    verified: Bitfield,
    verified_bytes: usize,

    /// In-memory buffers of pieces being assembled, keyed by piece.
    buffers: HashMap<usize, PieceBuffer>,

    /// Per piece, peers whose blocks are no longer welcome.
    blacklist: HashMap<usize, HashSet<PeerId>>,

    /// Open file handles, created lazily and held until teardown.
    handles: HashMap<usize, File>,
}

impl Disk {
    pub fn new(info: Arc<Info>, download_dir: &std::path::Path) -> Self {
        let mut file_metadata = Vec::new();
        let mut current_offset = 0;
        let base = download_dir.join(&info.name);

        if let Some(files) = &info.files {
            for file in files {
                let mut path = base.clone();
                path.extend(&file.path);
                file_metadata.push(FileMetadata {
                    path,
                    start_offset: current_offset,
                    length: file.length,
                });
                current_offset += file.length;
            }
        } else {
            file_metadata.push(FileMetadata {
                path: base,
                start_offset: 0,
                length: info.file_length.unwrap_or(0),
            });
        }

        let num_pieces = info.pieces();

        Self {
            info,
            file_metadata,
            verified: bitfield::from_pieces(num_pieces),
            verified_bytes: 0,
            buffers: HashMap::new(),
            blacklist: HashMap::new(),
            handles: HashMap::new(),
        }
    }

    pub fn verified(&self) -> &Bitfield {
        &self.verified
    }

    pub fn is_complete(&self) -> bool {
        self.verified.count_ones() == self.info.pieces()
    }

    /// Peers blacklisted for `piece` after a failed verification.
    pub fn blacklisted_peers(
        &self,
        piece: usize,
    ) -> impl Iterator<Item = &PeerId> {
        self.blacklist.get(&piece).into_iter().flatten()
    }

    /// (verified pieces, total pieces, verified bytes)
    pub fn progress(&self) -> (usize, usize, usize) {
        (
            self.verified.count_ones(),
            self.info.pieces(),
            self.verified_bytes,
        )
    }

    /// The ordered file slices the piece maps onto, so one piece write
    /// becomes one write per overlapped file.
    pub fn piece_segments(&self, piece: usize) -> Vec<FileSegment> {
        let piece_start = piece * self.info.piece_length;
        let piece_end = piece_start + self.info.piece_size(piece);

        let mut segments = Vec::with_capacity(1);

        for (file_index, file) in self.file_metadata.iter().enumerate() {
            let file_end = file.start_offset + file.length;
            let overlap_start = piece_start.max(file.start_offset);
            let overlap_end = piece_end.min(file_end);

            if overlap_start >= overlap_end {
                continue;
            }

            segments.push(FileSegment {
                file_index,
                file_offset: overlap_start - file.start_offset,
                len: overlap_end - overlap_start,
            });
        }

        segments
    }

    /// Buffer one block. When it completes its piece the piece is hashed;
    /// a good hash writes every segment to disk, a bad one throws the
    /// buffer away and re-marks the piece missing.
    pub async fn accept_block(
        &mut self,
        peer: &PeerId,
        piece: usize,
        begin: usize,
        data: &[u8],
    ) -> Result<BlockStatus, Error> {
        if piece >= self.info.pieces() {
            return Ok(BlockStatus::OutOfRange);
        }

        let piece_size = self.info.piece_size(piece);

        // blocks sit on the 16 KiB grid, the tail block is exactly the
        // remainder
        if begin % BLOCK_LEN != 0
            || begin >= piece_size
            || data.len() != BLOCK_LEN.min(piece_size - begin)
        {
            return Ok(BlockStatus::OutOfRange);
        }

        // a piece already verified stays verified, late bytes are dropped
        if self.verified[piece] {
            return Ok(BlockStatus::Duplicate);
        }

        if self
            .blacklist
            .get(&piece)
            .is_some_and(|peers| peers.contains(peer))
        {
            debug!("dropping block of piece {piece} from blacklisted peer");
            return Ok(BlockStatus::Duplicate);
        }

        let num_blocks = piece_size.div_ceil(BLOCK_LEN);
        let buffer = self.buffers.entry(piece).or_insert_with(|| PieceBuffer {
            buf: vec![0; piece_size],
            received: bitfield::from_pieces(num_blocks),
            received_bytes: 0,
            contributors: HashSet::new(),
        });

        let block_index = begin / BLOCK_LEN;
        if buffer.received[block_index] {
            return Ok(BlockStatus::Duplicate);
        }

        buffer.buf[begin..begin + data.len()].copy_from_slice(data);
        buffer.received.set(block_index, true);
        buffer.received_bytes += data.len();
        buffer.contributors.insert(peer.clone());

        if buffer.received_bytes < piece_size {
            return Ok(BlockStatus::Accepted);
        }

        // piece complete, verify before anything touches the disk
        let buffer = self.buffers.remove(&piece).unwrap();

        if self.verify_piece(piece, &buffer.buf).is_err() {
            warn!("piece {piece} failed verification, discarding buffer");
            self.blacklist
                .entry(piece)
                .or_default()
                .extend(buffer.contributors);
            return Ok(BlockStatus::PieceCorrupted);
        }

        self.write_piece(piece, &buffer.buf).await?;

        self.verified.set(piece, true);
        self.verified_bytes += piece_size;
        self.blacklist.remove(&piece);
        debug!("piece {piece} verified and written");

        Ok(BlockStatus::PieceVerified)
    }

    /// Read a block of a verified piece back from the files.
    pub async fn read_block(
        &mut self,
        block: &BlockInfo,
    ) -> Result<Vec<u8>, Error> {
        if block.index >= self.info.pieces()
            || !block.is_valid()
            || block.begin + block.len > self.info.piece_size(block.index)
        {
            return Err(Error::PeerProtocolViolation(
                "request outside the piece",
            ));
        }
        if !self.verified[block.index] {
            return Err(Error::PeerProtocolViolation(
                "request for an unverified piece",
            ));
        }

        let block_start =
            block.index * self.info.piece_length + block.begin;

        let segments: Vec<FileSegment> = self
            .file_metadata
            .iter()
            .enumerate()
            .filter_map(|(file_index, file)| {
                let file_end = file.start_offset + file.length;
                let read_start = block_start.max(file.start_offset);
                let read_end = (block_start + block.len).min(file_end);

                (read_start < read_end).then_some(FileSegment {
                    file_index,
                    file_offset: read_start - file.start_offset,
                    len: read_end - read_start,
                })
            })
            .collect();

        let mut out = vec![0; block.len];
        let mut filled = 0;

        for FileSegment {
            file_index,
            file_offset,
            len,
        } in segments
        {
            let handle = self.open_file(file_index).await?;
            handle
                .seek(SeekFrom::Start(file_offset as u64))
                .await
                .map_err(Error::StorageIo)?;
            handle
                .read_exact(&mut out[filled..filled + len])
                .await
                .map_err(Error::StorageIo)?;

            filled += len;
        }

        Ok(out)
    }

    /// Check the assembled bytes of `piece` against its expected digest.
    fn verify_piece(&self, piece: usize, buf: &[u8]) -> Result<(), Error> {
        let mut hasher = Sha1::new();
        hasher.update(buf);
        let hash: [u8; 20] = hasher.finalize().into();

        if hash.as_slice() != self.info.piece_hash(piece) {
            return Err(Error::HashMismatch { piece });
        }
        Ok(())
    }

    async fn write_piece(
        &mut self,
        piece: usize,
        buf: &[u8],
    ) -> Result<(), Error> {
        let mut written = 0;

        for segment in self.piece_segments(piece) {
            let handle = self.open_file(segment.file_index).await?;
            handle
                .seek(SeekFrom::Start(segment.file_offset as u64))
                .await
                .map_err(Error::StorageIo)?;
            handle
                .write_all(&buf[written..written + segment.len])
                .await
                .map_err(Error::StorageIo)?;

            written += segment.len;
        }

        Ok(())
    }

    /// Open (and on first use create, preallocated to its declared length)
    /// the file at `file_index`. Handles stay cached until teardown.
    async fn open_file(&mut self, file_index: usize) -> Result<&mut File, Error> {
        if !self.handles.contains_key(&file_index) {
            let meta = &self.file_metadata[file_index];

            if let Some(parent) = meta.path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(Error::StorageIo)?;
            }

            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&meta.path)
                .await
                .map_err(Error::StorageIo)?;

            // sparse where the platform supports it
            file.set_len(meta.length as u64)
                .await
                .map_err(Error::StorageIo)?;

            self.handles.insert(file_index, file);
        }

        Ok(self.handles.get_mut(&file_index).unwrap())
    }
}
