//! A library implementing the BitTorrent protocol V1 for the santino
//! client.
//!
//! The building blocks: [`bencode`] for the serialization metainfo files
//! and trackers speak, [`metainfo`] for the .torrent model, [`tracker`]
//! for peer discovery, [`tcp_wire`] and [`peer`] for the peer wire
//! protocol, [`disk`] for the hash-verified piece store and [`torrent`]
//! for the session that ties them together.
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//!
//! use santino::{config::Config, error::Error, torrent::Torrent};
//!
//! # async fn download() -> Result<(), Error> {
//! let bytes = std::fs::read("debian.torrent").map_err(Error::StorageIo)?;
//! let mut torrent = Torrent::open(&bytes, Path::new("."), Config::default())?;
//! torrent.run().await?;
//! # Ok(())
//! # }
//! ```

pub mod bencode;
pub mod bitfield;
pub mod config;
pub mod counter;
pub mod disk;
pub mod error;
pub mod metainfo;
pub mod peer;
pub mod scheduler;
pub mod tcp_wire;
pub mod torrent;
pub mod tracker;
pub mod utils;
