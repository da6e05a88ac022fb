//! Metainfo is a .torrent file with information about the Torrent.

use std::fmt;

use sha1::{Digest, Sha1};

use crate::{
    bencode::{self, Value},
    error::Error,
    tcp_wire::{BlockInfo, BLOCK_LEN},
};

/// SHA-1 of the bencoded `info` dictionary, the identity of a torrent on the
/// tracker and on the wire.
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct InfoHash(pub [u8; 20]);

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl From<[u8; 20]> for InfoHash {
    fn from(value: [u8; 20]) -> Self {
        Self(value)
    }
}

#[derive(Debug, PartialEq, Clone, Default)]
pub struct MetaInfo {
    pub announce: String,
    pub announce_list: Option<Vec<Vec<String>>>,
    pub comment: Option<String>,
    pub creation_date: Option<i64>,
    pub info: Info,
}

/// The `info` dictionary of a metainfo file.
///
/// In a single file torrent `name` is the file name and `file_length` is
/// set; in a multi file torrent `name` is the directory name and `files`
/// is set.
#[derive(Debug, PartialEq, Clone, Default)]
pub struct Info {
    /// Name of the file, or of the directory in multi file mode.
    pub name: String,

    /// Length in bytes of each piece, the last piece may be smaller.
    pub piece_length: usize,

    /// Concatenation of all 20-byte SHA-1 hash values, one per piece.
    pub pieces: Vec<u8>,

    pub file_length: Option<usize>,
    pub files: Option<Vec<File>>,

    /// Computed over the raw `info` bytes of the source file, never over a
    /// re-encoding.
    pub info_hash: InfoHash,
}

/// Files are relative to the torrent name, which is not part of `path`.
#[derive(Debug, PartialEq, Clone, Default)]
pub struct File {
    pub length: usize,
    pub path: Vec<String>,
}

impl MetaInfo {
    /// Parse the raw bytes of a .torrent file.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, Error> {
        let value = bencode::decode_strict(buf)?;

        let announce = value
            .get(b"announce")
            .and_then(Value::as_str)
            .ok_or_else(|| invalid("missing announce"))?
            .to_owned();

        let announce_list = value.get(b"announce-list").map(parse_announce_list);

        let comment = value
            .get(b"comment")
            .and_then(Value::as_str)
            .map(str::to_owned);

        let creation_date = value.get(b"creation date").and_then(Value::as_int);

        let info_value =
            value.get(b"info").ok_or_else(|| invalid("missing info"))?;
        let raw_info = bencode::raw_entry(buf, b"info")?
            .ok_or_else(|| invalid("missing info"))?;

        let info = Info::from_value(info_value, raw_info)?;

        Ok(MetaInfo {
            announce,
            announce_list,
            comment,
            creation_date,
            info,
        })
    }

    /// All announce URLs, the `announce-list` tiers flattened after the
    /// plain `announce`, without duplicates.
    pub fn announce_urls(&self) -> Vec<&str> {
        let mut urls = vec![self.announce.as_str()];

        for tier in self.announce_list.iter().flatten() {
            for url in tier {
                if !urls.contains(&url.as_str()) {
                    urls.push(url);
                }
            }
        }

        urls
    }
}

fn invalid(reason: &str) -> Error {
    Error::MetainfoInvalid(reason.to_owned())
}

fn parse_announce_list(value: &Value) -> Vec<Vec<String>> {
    // tiers that fail to parse are skipped rather than fatal, the plain
    // announce key is the one that is required
    value
        .as_list()
        .into_iter()
        .flatten()
        .filter_map(|tier| {
            let urls: Vec<String> = tier
                .as_list()?
                .iter()
                .filter_map(|url| url.as_str().map(str::to_owned))
                .collect();
            (!urls.is_empty()).then_some(urls)
        })
        .collect()
}

impl Info {
    fn from_value(value: &Value, raw: &[u8]) -> Result<Self, Error> {
        let name = value
            .get(b"name")
            .and_then(Value::as_str)
            .ok_or_else(|| invalid("missing info.name"))?
            .to_owned();

        let piece_length = value
            .get(b"piece length")
            .and_then(Value::as_int)
            .ok_or_else(|| invalid("missing info.piece length"))?;
        if piece_length <= 0 {
            return Err(invalid("piece length must be positive"));
        }

        let pieces = value
            .get(b"pieces")
            .and_then(Value::as_bytes)
            .ok_or_else(|| invalid("missing info.pieces"))?
            .to_vec();
        if pieces.is_empty() || pieces.len() % 20 != 0 {
            return Err(invalid("pieces is not a multiple of 20 bytes"));
        }

        let file_length = match value.get(b"length") {
            Some(v) => {
                let n = v
                    .as_int()
                    .filter(|n| *n >= 0)
                    .ok_or_else(|| invalid("bad file length"))?;
                Some(n as usize)
            }
            None => None,
        };

        let files = match value.get(b"files") {
            Some(v) => Some(parse_files(v)?),
            None => None,
        };

        match (&file_length, &files) {
            (None, None) => {
                return Err(invalid("torrent has neither length nor files"))
            }
            (Some(_), Some(_)) => {
                return Err(invalid("torrent has both length and files"))
            }
            _ => {}
        }

        let mut hasher = Sha1::new();
        hasher.update(raw);

        let info = Info {
            name,
            piece_length: piece_length as usize,
            pieces,
            file_length,
            files,
            info_hash: InfoHash(hasher.finalize().into()),
        };

        let expected = info.total_size().div_ceil(info.piece_length);
        if info.pieces() != expected {
            return Err(invalid("piece hash count does not match total size"));
        }

        Ok(info)
    }

    /// How many pieces there are.
    #[inline]
    pub fn pieces(&self) -> usize {
        self.pieces.len() / 20
    }

    /// The expected SHA-1 digest of a piece.
    pub fn piece_hash(&self, piece: usize) -> &[u8] {
        &self.pieces[piece * 20..piece * 20 + 20]
    }

    /// Size in bytes of all the files of the torrent.
    pub fn total_size(&self) -> usize {
        match &self.files {
            Some(files) => files.iter().map(|f| f.length).sum(),
            None => self.file_length.unwrap_or(0),
        }
    }

    /// Size in bytes of a piece, the last one may be smaller.
    pub fn piece_size(&self, piece: usize) -> usize {
        if piece == self.pieces() - 1 {
            let remainder = self.total_size() % self.piece_length;
            if remainder == 0 {
                self.piece_length
            } else {
                remainder
            }
        } else {
            self.piece_length
        }
    }

    /// The 16 KiB blocks of one piece, lowest offset first.
    pub fn blocks_of_piece(&self, piece: usize) -> Vec<BlockInfo> {
        let piece_size = self.piece_size(piece);
        let num_blocks = piece_size.div_ceil(BLOCK_LEN);
        let mut blocks = Vec::with_capacity(num_blocks);

        for block in 0..num_blocks {
            let begin = block * BLOCK_LEN;
            blocks.push(BlockInfo {
                index: piece,
                begin,
                len: BLOCK_LEN.min(piece_size - begin),
            });
        }

        blocks
    }
}

fn parse_files(value: &Value) -> Result<Vec<File>, Error> {
    let list = value.as_list().ok_or_else(|| invalid("files is not a list"))?;

    if list.is_empty() {
        return Err(invalid("empty file list"));
    }

    list.iter()
        .map(|entry| {
            let length = entry
                .get(b"length")
                .and_then(Value::as_int)
                .filter(|n| *n >= 0)
                .ok_or_else(|| invalid("bad file length"))?;

            let path: Vec<String> = entry
                .get(b"path")
                .and_then(Value::as_list)
                .ok_or_else(|| invalid("file without path"))?
                .iter()
                .filter_map(|seg| seg.as_str().map(str::to_owned))
                .collect();

            if path.is_empty() {
                return Err(invalid("file with empty path"));
            }
            for segment in &path {
                if segment.is_empty()
                    || segment == ".."
                    || segment.contains(['/', '\\'])
                {
                    return Err(invalid("file path escapes the torrent dir"));
                }
            }

            Ok(File {
                length: length as usize,
                path,
            })
        })
        .collect()
}
