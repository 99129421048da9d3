//! The peer wire protocol of BitTorrent V1, for clients that want to
//! exchange pieces with a swarm.
//!
//! This crate owns the connections to remote peers and everything that
//! happens on them: the handshake, piece availability, choking and interest,
//! pipelined block requests and traffic shaping. Trackers, metainfo parsing,
//! DHT routing and the files on disk live outside of it and talk to the
//! engine through [`storage::Storage`], [`torrent::TorrentHandle`] and the
//! [`torrent::SwarmEvent`] stream.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use peerwire::{
//!     config::Config,
//!     session::Session,
//!     storage::MemoryStorage,
//!     torrent::{InfoHash, TorrentMeta},
//! };
//!
//! # async fn run(data: Vec<u8>) -> Result<(), peerwire::error::Error> {
//! let (mut session, mut events) = Session::new(Config::default());
//!
//! let meta = TorrentMeta::new(InfoHash([0; 20]), 262_144, data.len() as u64)?;
//! let storage = Arc::new(MemoryStorage::seeded(meta.clone(), data));
//!
//! session.add_torrent(meta, storage).await?;
//! session.start(51413).await?;
//!
//! while let Some(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod bitfield;
pub mod config;
pub mod error;
pub mod peer;
pub mod session;
pub mod shaper;
pub mod storage;
pub mod torrent;
pub mod wire;
