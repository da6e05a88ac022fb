//! HTTP tracker client.
//!
//! An announce is a GET on an announce URL; the tracker answers with a
//! bencoded dictionary carrying the re-announce interval and the list of
//! peers, compact (BEP 23) or in dictionary form. When the metainfo names
//! several trackers they are tried in order, sticking with the last one
//! that answered.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use tracing::{debug, warn};

use crate::{
    bencode::{self, Value},
    error::Error,
    metainfo::InfoHash,
    peer::PeerId,
};

/// Seconds between announces when the tracker does not say.
pub const DEFAULT_INTERVAL: u64 = 1800;

static ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(30);

/// Why the client is announcing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Event {
    /// Periodic re-announce, the `event` parameter is omitted.
    #[default]
    None,
    Started,
    Completed,
    Stopped,
}

impl Event {
    fn as_str(&self) -> Option<&'static str> {
        match self {
            Event::None => None,
            Event::Started => Some("started"),
            Event::Completed => Some("completed"),
            Event::Stopped => Some("stopped"),
        }
    }
}

/// The running totals reported on every announce.
#[derive(Debug, Clone, Copy, Default)]
pub struct Announce {
    pub event: Event,
    pub downloaded: u64,
    pub uploaded: u64,
    pub left: u64,
}

#[derive(Debug, Clone, Default)]
pub struct AnnounceResponse {
    /// Seconds until the tracker wants the next announce.
    pub interval: u64,

    /// Peer addresses, with the peer id when the tracker sent the
    /// dictionary form (the compact form has no ids).
    pub peers: Vec<(SocketAddr, Option<PeerId>)>,
}

pub struct Tracker {
    urls: Vec<String>,

    /// Index of the last tracker that answered.
    current: usize,

    info_hash: InfoHash,
    local_peer_id: PeerId,
    port: u16,
    client: reqwest::Client,
}

impl Tracker {
    pub fn new(
        urls: Vec<String>,
        info_hash: InfoHash,
        local_peer_id: PeerId,
        port: u16,
    ) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .timeout(ANNOUNCE_TIMEOUT)
            .build()?;

        Ok(Self {
            urls,
            current: 0,
            info_hash,
            local_peer_id,
            port,
            client,
        })
    }

    /// Announce to the first tracker that can be reached.
    ///
    /// A tracker that answers with a failure reason did answer, that error
    /// is surfaced instead of rotating further.
    pub async fn announce(
        &mut self,
        announce: Announce,
    ) -> Result<AnnounceResponse, Error> {
        let mut last_err = Error::TrackerResponse;

        for i in 0..self.urls.len() {
            let index = (self.current + i) % self.urls.len();
            let url = self.announce_url(&self.urls[index], &announce);
            debug!("announcing {:?} to {url}", announce.event);

            match self.request(&url).await {
                Ok(response) => {
                    self.current = index;
                    return Ok(response);
                }
                Err(e @ Error::TrackerFailure { .. }) => return Err(e),
                Err(e) => {
                    warn!("tracker {} unreachable: {e}", self.urls[index]);
                    last_err = e;
                }
            }
        }

        Err(last_err)
    }

    async fn request(&self, url: &str) -> Result<AnnounceResponse, Error> {
        let response = self.client.get(url).send().await?;
        let body = response.bytes().await?;
        parse_response(&body)
    }

    /// The full GET URL for one announce.
    ///
    /// Built by hand: the info hash and peer id are raw bytes that must be
    /// escaped `%XX` byte by byte, which generic query builders would
    /// double-escape.
    fn announce_url(&self, base: &str, announce: &Announce) -> String {
        let separator = if base.contains('?') { '&' } else { '?' };

        let mut url = format!(
            "{}{}info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1",
            base,
            separator,
            url_encode_bytes(&self.info_hash.0),
            url_encode_bytes(&self.local_peer_id.0),
            self.port,
            announce.uploaded,
            announce.downloaded,
            announce.left,
        );

        if let Some(event) = announce.event.as_str() {
            url.push_str("&event=");
            url.push_str(event);
        }

        url
    }
}

/// Escape raw bytes for a query string, `%XX` for anything outside the
/// RFC 3986 unreserved set.
pub fn url_encode_bytes(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 3);

    for &byte in bytes {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'.' | b'_'
            | b'~' => out.push(byte as char),
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }

    out
}

fn parse_response(buf: &[u8]) -> Result<AnnounceResponse, Error> {
    let (value, _) = bencode::decode(buf).map_err(|_| Error::TrackerResponse)?;

    if let Some(reason) = value.get(b"failure reason") {
        let reason = reason
            .as_bytes()
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .unwrap_or_default();
        return Err(Error::TrackerFailure { reason });
    }

    let interval = value
        .get(b"interval")
        .and_then(Value::as_int)
        .filter(|n| *n > 0)
        .map(|n| n as u64)
        .unwrap_or(DEFAULT_INTERVAL);

    let peers = match value.get(b"peers") {
        Some(Value::ByteString(compact)) => parse_compact_peer_list(compact)?,
        Some(Value::List(dicts)) => parse_peer_dicts(dicts),
        Some(_) => return Err(Error::TrackerResponse),
        None => Vec::new(),
    };

    Ok(AnnounceResponse { interval, peers })
}

/// BEP 23 compact form, 6 bytes per peer: 4 of IPv4 and 2 of big-endian
/// port.
pub fn parse_compact_peer_list(
    buf: &[u8],
) -> Result<Vec<(SocketAddr, Option<PeerId>)>, Error> {
    let chunks = buf.chunks_exact(6);
    if !chunks.remainder().is_empty() {
        return Err(Error::TrackerResponse);
    }

    Ok(chunks
        .map(|hostport| {
            let (ip, port) = hostport.split_at(4);
            let ip = IpAddr::from(Ipv4Addr::new(ip[0], ip[1], ip[2], ip[3]));
            let port = u16::from_be_bytes([port[0], port[1]]);
            ((ip, port).into(), None)
        })
        .collect())
}

/// The original dictionary form, a list of `{"ip", "port", "peer id"}`
/// entries. Entries that do not parse are skipped.
fn parse_peer_dicts(dicts: &[Value]) -> Vec<(SocketAddr, Option<PeerId>)> {
    dicts
        .iter()
        .filter_map(|dict| {
            let ip: IpAddr = dict.get(b"ip")?.as_str()?.parse().ok()?;
            let port = u16::try_from(dict.get(b"port")?.as_int()?).ok()?;

            let id = dict
                .get(b"peer id")
                .and_then(Value::as_bytes)
                .and_then(|b| <[u8; 20]>::try_from(b).ok())
                .map(PeerId);

            Some(((ip, port).into(), id))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(urls: Vec<String>) -> Tracker {
        Tracker::new(urls, InfoHash::default(), PeerId([b'A'; 20]), 6881)
            .unwrap()
    }

    #[test]
    fn escapes_bytes_outside_unreserved() {
        assert_eq!(url_encode_bytes(b"aZ09-._~"), "aZ09-._~");
        assert_eq!(url_encode_bytes(&[0x00, 0x12, 0xff]), "%00%12%FF");
        assert_eq!(url_encode_bytes(b" /+"), "%20%2F%2B");
    }

    #[test]
    fn announce_url_escapes_the_raw_hash() {
        let mut hash = [0u8; 20];
        hash[0] = 0x12;
        hash[19] = 0xab;

        let tracker = Tracker::new(
            vec!["http://tr.example/announce".into()],
            InfoHash(hash),
            PeerId([b'A'; 20]),
            6881,
        )
        .unwrap();

        let url = tracker.announce_url(
            &tracker.urls[0],
            &Announce {
                event: Event::Started,
                downloaded: 1,
                uploaded: 2,
                left: 3,
            },
        );

        assert!(url.starts_with("http://tr.example/announce?info_hash=%12"));
        assert!(url.contains("%AB&peer_id=AAAAAAAAAAAAAAAAAAAA"));
        assert!(url.contains("&port=6881"));
        assert!(url.contains("&uploaded=2&downloaded=1&left=3"));
        assert!(url.contains("&compact=1"));
        assert!(url.ends_with("&event=started"));
    }

    #[test]
    fn periodic_announce_omits_the_event() {
        let tracker = tracker(vec!["http://tr.example/announce".into()]);
        let url =
            tracker.announce_url(&tracker.urls[0], &Announce::default());
        assert!(!url.contains("event="));
    }

    #[test]
    fn parses_compact_response() {
        let mut buf = b"d8:intervali900e5:peers12:".to_vec();
        buf.extend_from_slice(&[127, 0, 0, 1, 0x1a, 0xe1]);
        buf.extend_from_slice(&[10, 0, 0, 2, 0x1a, 0xe2]);
        buf.extend_from_slice(b"e");

        let response = parse_response(&buf).unwrap();

        assert_eq!(response.interval, 900);
        assert_eq!(
            response.peers,
            vec![
                ("127.0.0.1:6881".parse().unwrap(), None),
                ("10.0.0.2:6882".parse().unwrap(), None),
            ]
        );
    }

    #[test]
    fn parses_dictionary_response() {
        let mut buf = b"d8:intervali60e5:peersl".to_vec();
        buf.extend_from_slice(b"d2:ip9:127.0.0.17:peer id20:");
        buf.extend_from_slice(&[b'B'; 20]);
        buf.extend_from_slice(b"4:porti6881ee");
        buf.extend_from_slice(b"ee");

        let response = parse_response(&buf).unwrap();

        assert_eq!(
            response.peers,
            vec![(
                "127.0.0.1:6881".parse().unwrap(),
                Some(PeerId([b'B'; 20])),
            )]
        );
    }

    #[test]
    fn missing_interval_falls_back_to_default() {
        let response = parse_response(b"d5:peers0:e").unwrap();
        assert_eq!(response.interval, DEFAULT_INTERVAL);
        assert!(response.peers.is_empty());
    }

    #[test]
    fn failure_reason_is_surfaced() {
        let err =
            parse_response(b"d14:failure reason9:not todaye").unwrap_err();
        match err {
            Error::TrackerFailure { reason } => assert_eq!(reason, "not today"),
            other => panic!("expected TrackerFailure, got {other:?}"),
        }
    }

    #[test]
    fn rejects_truncated_compact_list() {
        let mut buf = b"d8:intervali900e5:peers5:".to_vec();
        buf.extend_from_slice(&[127, 0, 0, 1, 0x1a]);
        buf.extend_from_slice(b"e");

        assert!(parse_response(&buf).is_err());
    }
}
