use std::{io, net::SocketAddr};

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::{
    peer::PeerMsg,
    torrent::{InfoHash, TorrentMsg},
    wire::BlockInfo,
};

#[derive(Error, Debug)]
pub enum Error {
    #[error("Peer violated the wire protocol: {0}")]
    ProtocolViolation(String),

    #[error("The peer took to long to send the handshake")]
    HandshakeTimeout,

    #[error("The handshake received is not valid")]
    HandshakeInvalid,

    #[error("The peer asked for a torrent that is not being seeded or leeched")]
    UnknownTorrent,

    #[error("Tried to connect to ourselves")]
    SelfConnection,

    #[error("The request pipeline of the peer is full")]
    PipelineFull,

    #[error("The block {0:?} is not valid for this torrent")]
    InvalidBlock(BlockInfo),

    #[error("Storage reported that piece {0} failed verification")]
    CorruptPiece(u32),

    #[error("Storage does not have the block {0:?}")]
    BlockUnavailable(BlockInfo),

    #[error("The peer closed the socket")]
    PeerClosedSocket,

    #[error("The peer did not send anything for too long")]
    PeerIdle,

    #[error("Could not connect to {0} in time")]
    ConnectTimeout(SocketAddr),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Error when serializing/deserializing")]
    Speedy(#[from] speedy::Error),

    #[error("Could not find torrent for the given info_hash {0:?}")]
    TorrentDoesNotExist(InfoHash),

    #[error("You cannot add a duplicate torrent, only 1 is allowed")]
    NoDuplicateTorrent,

    #[error("The peer is already connected")]
    NoDuplicatePeer,

    #[error("The torrent already has the maximum amount of peers")]
    MaximumPeers,

    #[error("Invalid torrent layout: {0}")]
    InvalidMeta(String),

    #[error("The session is not running")]
    SessionStopped,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(
        "Error while trying to read the configuration file, please make sure \
         it has the correct format: {0}"
    )]
    ConfigDeserialize(#[from] toml::de::Error),

    #[error(
        "Tried to load $HOME but could not find it. Please make sure you have \
         a $HOME env and that this program has the permission to create dirs."
    )]
    HomeInvalid,

    #[error("Could not receive message from oneshot")]
    ReceiveErrorOneshot(#[from] oneshot::error::RecvError),

    #[error("Could not send message to Peer")]
    SendErrorPeer(#[from] mpsc::error::SendError<PeerMsg>),

    #[error("Could not send message to Torrent")]
    SendErrorTorrent(#[from] mpsc::error::SendError<TorrentMsg>),
}

impl Error {
    /// Whether the connection that produced this error must be torn down.
    ///
    /// Local backpressure and storage verification failures are scoped to a
    /// request or a piece, everything else ends the connection.
    pub fn closes_connection(&self) -> bool {
        !matches!(
            self,
            Error::PipelineFull
                | Error::CorruptPiece(_)
                | Error::InvalidBlock(_)
                | Error::BlockUnavailable(_)
        )
    }

    /// Errors that count against the peer. A peer closed for one of these
    /// is never reconnected.
    pub fn is_misbehavior(&self) -> bool {
        matches!(self, Error::ProtocolViolation(_) | Error::SelfConnection)
    }

    /// Handshake failures and transient I/O errors, the coordinator may try
    /// the same address again later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::HandshakeTimeout
                | Error::HandshakeInvalid
                | Error::PeerClosedSocket
                | Error::PeerIdle
                | Error::ConnectTimeout(_)
                | Error::Io(_)
        )
    }

    pub(crate) fn violation(msg: impl Into<String>) -> Self {
        Error::ProtocolViolation(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(!Error::PipelineFull.closes_connection());
        assert!(!Error::CorruptPiece(3).closes_connection());
        assert!(Error::violation("bad").closes_connection());
        assert!(Error::violation("bad").is_misbehavior());
        assert!(!Error::violation("bad").is_retryable());
        assert!(Error::HandshakeTimeout.is_retryable());
        assert!(!Error::UnknownTorrent.is_retryable());
        assert!(Error::SelfConnection.is_misbehavior());
    }
}
