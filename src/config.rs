//! Tuning knobs of a session, set by the driver.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    /// Port reported to the tracker. By convention 6881, even though we
    /// never listen on it (incoming connections are out of scope).
    pub port: u16,

    /// Soft cap on concurrent peer connections.
    pub max_peers: usize,

    /// Outstanding block requests kept in flight per peer.
    pub pipeline_depth: usize,

    /// A peer that sends nothing for this long is dropped.
    pub idle_timeout: Duration,

    /// A block request pending this long is handed back to the scheduler.
    pub block_timeout: Duration,

    /// Azureus-style prefix of the generated peer id.
    pub peer_id_prefix: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 6881,
            max_peers: 50,
            pipeline_depth: 5,
            idle_timeout: Duration::from_secs(120),
            block_timeout: Duration::from_secs(60),
            peer_id_prefix: "-PY0001-".to_owned(),
        }
    }
}
