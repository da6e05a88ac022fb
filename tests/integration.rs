//! End-to-end downloads against stub peers speaking the real wire
//! protocol, with a stub HTTP tracker handing out their addresses.

use std::{collections::BTreeMap, net::SocketAddr, path::PathBuf, time::Duration};

use futures::{SinkExt, StreamExt};
use rand::{distr::Alphanumeric, Rng};
use sha1::{Digest, Sha1};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpListener,
    sync::mpsc,
};
use tokio_util::codec::Framed;

use santino::{
    bencode::{self, Value},
    bitfield,
    config::Config,
    metainfo::InfoHash,
    peer::PeerId,
    tcp_wire::{Block, Handshake, HandshakeCodec, Message, PeerCodec},
    torrent::Torrent,
};

fn temp_download_dir() -> PathBuf {
    let name: String = (0..12)
        .map(|_| rand::rng().sample(Alphanumeric) as char)
        .collect();
    std::env::temp_dir().join(format!("santino-it-{name}"))
}

/// Bencode a single-file metainfo for `content`.
fn build_torrent(announce: &str, piece_length: usize, content: &[u8]) -> Vec<u8> {
    let mut pieces = Vec::new();
    for chunk in content.chunks(piece_length) {
        let mut hasher = Sha1::new();
        hasher.update(chunk);
        pieces.extend_from_slice(&hasher.finalize());
    }

    let mut info = BTreeMap::new();
    info.insert(
        b"length".to_vec(),
        Value::Integer(content.len() as i64),
    );
    info.insert(
        b"name".to_vec(),
        Value::ByteString(b"data.bin".to_vec()),
    );
    info.insert(
        b"piece length".to_vec(),
        Value::Integer(piece_length as i64),
    );
    info.insert(b"pieces".to_vec(), Value::ByteString(pieces));

    let mut root = BTreeMap::new();
    root.insert(
        b"announce".to_vec(),
        Value::ByteString(announce.as_bytes().to_vec()),
    );
    root.insert(b"info".to_vec(), Value::Dictionary(info));

    bencode::encode(&Value::Dictionary(root))
}

/// Answer every announce with a compact peer list.
async fn run_stub_tracker(listener: TcpListener, peers: Vec<SocketAddr>) {
    let mut compact = Vec::new();
    for peer in &peers {
        match peer {
            SocketAddr::V4(v4) => {
                compact.extend_from_slice(&v4.ip().octets());
                compact.extend_from_slice(&v4.port().to_be_bytes());
            }
            SocketAddr::V6(_) => unreachable!("stubs are v4"),
        }
    }

    let mut body = b"d8:intervali1800e5:peers".to_vec();
    body.extend_from_slice(format!("{}:", compact.len()).as_bytes());
    body.extend_from_slice(&compact);
    body.push(b'e');

    loop {
        let Ok((mut socket, _)) = listener.accept().await else {
            return;
        };

        let mut request = [0u8; 1024];
        let _ = socket.read(&mut request).await;

        let head = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            body.len()
        );
        let _ = socket.write_all(head.as_bytes()).await;
        let _ = socket.write_all(&body).await;
    }
}

/// A seeder with every piece, identifying as `peer_id`. When
/// `tamper_piece` is set, blocks of that piece are served corrupted.
/// Observed messages go to `log`.
async fn run_stub_seeder(
    listener: TcpListener,
    info_hash: InfoHash,
    peer_id: PeerId,
    content: Vec<u8>,
    piece_length: usize,
    tamper_piece: Option<usize>,
    log: Option<mpsc::UnboundedSender<Message>>,
) {
    let Ok((socket, _)) = listener.accept().await else {
        return;
    };

    let mut socket = Framed::new(socket, HandshakeCodec);
    let theirs = socket.next().await.unwrap().unwrap();
    assert_eq!(theirs.info_hash, info_hash);

    socket
        .send(Handshake::new(info_hash, peer_id))
        .await
        .unwrap();

    let (mut sink, mut stream) = socket.map_codec(|_| PeerCodec).split();

    let num_pieces = content.len().div_ceil(piece_length);
    let mut pieces = bitfield::from_pieces(num_pieces);
    pieces.fill(true);
    sink.send(Message::Bitfield(pieces)).await.unwrap();

    while let Some(Ok(msg)) = stream.next().await {
        if let Some(log) = &log {
            let _ = log.send(msg.clone());
        }

        match msg {
            Message::Interested => {
                sink.send(Message::Unchoke).await.unwrap();
            }
            Message::Request(info) => {
                let start = info.index * piece_length + info.begin;
                let mut data = content[start..start + info.len].to_vec();
                if tamper_piece == Some(info.index) {
                    data[0] ^= 0xff;
                }
                sink.send(Message::Piece(Block {
                    index: info.index,
                    begin: info.begin,
                    block: data,
                }))
                .await
                .unwrap();
            }
            _ => {}
        }
    }
}

/// A full download from one honest seeder: the client declares interest
/// before requesting, requests each piece's blocks lowest offset first,
/// advertises verified pieces and writes the exact bytes.
#[tokio::test]
async fn single_seeder_download() {
    // 2 pieces: 3 blocks, then a short tail piece
    let piece_length = 40960;
    let content: Vec<u8> = (0..piece_length + 1000)
        .map(|i| (i * 31 % 251) as u8)
        .collect();

    let tracker_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let seeder_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let announce =
        format!("http://{}/announce", tracker_listener.local_addr().unwrap());
    let seeder_addr = seeder_listener.local_addr().unwrap();

    let torrent_bytes = build_torrent(&announce, piece_length, &content);
    let info_hash = {
        let raw = bencode::raw_entry(&torrent_bytes, b"info")
            .unwrap()
            .unwrap();
        let mut hasher = Sha1::new();
        hasher.update(raw);
        InfoHash(hasher.finalize().into())
    };

    tokio::spawn(run_stub_tracker(tracker_listener, vec![seeder_addr]));

    let (log_tx, mut log_rx) = mpsc::unbounded_channel();
    tokio::spawn(run_stub_seeder(
        seeder_listener,
        info_hash,
        PeerId([b's'; 20]),
        content.clone(),
        piece_length,
        None,
        Some(log_tx),
    ));

    let dir = temp_download_dir();
    let mut torrent =
        Torrent::open(&torrent_bytes, &dir, Config::default()).unwrap();

    tokio::time::timeout(Duration::from_secs(60), torrent.run())
        .await
        .expect("download timed out")
        .unwrap();

    assert_eq!(torrent.progress(), (2, 2, content.len()));

    let on_disk = std::fs::read(dir.join("data.bin")).unwrap();
    assert_eq!(on_disk, content);

    // inspect what the seeder saw
    let mut saw_interested = false;
    let mut saw_request = false;
    let mut haves = Vec::new();
    let mut last_begin: BTreeMap<usize, usize> = BTreeMap::new();

    while let Some(msg) = log_rx.recv().await {
        match msg {
            Message::Interested => {
                assert!(!saw_request, "interested must precede requests");
                saw_interested = true;
            }
            Message::Request(info) => {
                assert!(saw_interested);
                saw_request = true;

                // within a piece, offsets only grow
                if let Some(previous) = last_begin.get(&info.index) {
                    assert!(info.begin > *previous);
                }
                last_begin.insert(info.index, info.begin);
            }
            Message::Have(piece) => haves.push(piece),
            _ => {}
        }
    }

    haves.sort();
    assert_eq!(haves, vec![0, 1], "verified pieces must be advertised");

    std::fs::remove_dir_all(dir).unwrap();
}

/// One seeder corrupts everything it serves for piece 0. The client must
/// fail verification, blacklist it for that piece and finish the piece
/// from the honest seeder, never writing bad bytes.
#[tokio::test]
async fn tampering_seeder_is_blacklisted() {
    // single-block pieces so each piece has exactly one contributor
    let piece_length = 16384;
    let content: Vec<u8> = (0..piece_length + 500)
        .map(|i| (i * 17 % 249) as u8)
        .collect();

    let tracker_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let evil_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let honest_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let announce =
        format!("http://{}/announce", tracker_listener.local_addr().unwrap());
    let evil_addr = evil_listener.local_addr().unwrap();
    let honest_addr = honest_listener.local_addr().unwrap();

    let torrent_bytes = build_torrent(&announce, piece_length, &content);
    let info_hash = {
        let raw = bencode::raw_entry(&torrent_bytes, b"info")
            .unwrap()
            .unwrap();
        let mut hasher = Sha1::new();
        hasher.update(raw);
        InfoHash(hasher.finalize().into())
    };

    tokio::spawn(run_stub_tracker(
        tracker_listener,
        vec![evil_addr, honest_addr],
    ));
    tokio::spawn(run_stub_seeder(
        evil_listener,
        info_hash.clone(),
        PeerId([b'e'; 20]),
        content.clone(),
        piece_length,
        Some(0),
        None,
    ));
    tokio::spawn(run_stub_seeder(
        honest_listener,
        info_hash,
        PeerId([b'h'; 20]),
        content.clone(),
        piece_length,
        None,
        None,
    ));

    let dir = temp_download_dir();
    let mut torrent =
        Torrent::open(&torrent_bytes, &dir, Config::default()).unwrap();

    tokio::time::timeout(Duration::from_secs(60), torrent.run())
        .await
        .expect("download timed out")
        .unwrap();

    // the verified bytes on disk are the real ones
    let on_disk = std::fs::read(dir.join("data.bin")).unwrap();
    assert_eq!(on_disk, content);

    std::fs::remove_dir_all(dir).unwrap();
}
