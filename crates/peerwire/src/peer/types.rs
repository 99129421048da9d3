use std::{fmt::Display, net::SocketAddr, sync::Arc};

use rand::{distributions::Alphanumeric, Rng};
use speedy::{Readable, Writable};
use tokio::sync::mpsc;

use crate::{
    bitfield::{Bitfield, Reserved},
    shaper::TrafficShaper,
    wire::BlockInfo,
};

/// The ID of a Peer.
#[derive(Clone, PartialEq, Eq, Hash, Default, Readable, Writable)]
pub struct PeerId(pub [u8; 20]);

impl PeerId {
    /// Azureus-style id, `-PW0100-` followed by 12 random alphanumerics.
    pub fn generate() -> Self {
        let mut peer_id = [0; 20];
        peer_id[..8].copy_from_slice(b"-PW0100-");

        let mut rng = rand::thread_rng();
        for b in peer_id.iter_mut().skip(8) {
            *b = rng.sample(Alphanumeric);
        }

        PeerId(peer_id)
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

impl From<[u8; 20]> for PeerId {
    fn from(value: [u8; 20]) -> Self {
        Self(value)
    }
}

impl From<PeerId> for [u8; 20] {
    fn from(value: PeerId) -> Self {
        value.0
    }
}

impl TryFrom<Vec<u8>> for PeerId {
    type Error = &'static str;

    fn try_from(value: Vec<u8>) -> Result<Self, Self::Error> {
        let buff: [u8; 20] = value
            .try_into()
            .map_err(|_| "The PeerId must have exactly 20 bytes")?;
        Ok(PeerId(buff))
    }
}

/// Who the remote peer is, fixed after the handshake.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerIdentity {
    pub id: PeerId,
    pub addr: SocketAddr,
    /// Extensions the remote advertised in its handshake.
    pub reserved: Reserved,
}

/// Ctx of a connected peer that is shared with the Torrent. Everything in
/// here is either immutable or internally synchronized.
#[derive(Debug)]
pub struct PeerCtx {
    /// The torrent never waits to send to a peer.
    pub tx: mpsc::UnboundedSender<PeerMsg>,
    pub identity: PeerIdentity,
    pub direction: Direction,
    /// Our local addr for this peer.
    pub local_addr: SocketAddr,
    /// Rate limits and speeds of this connection alone.
    pub shaper: Arc<TrafficShaper>,
}

/// Messages used to control the peer state or to make the peer forward a
/// message.
#[derive(Debug)]
pub enum PeerMsg {
    /// The choke policy decided to choke this peer.
    Choke,
    /// The choke policy decided to unchoke this peer.
    Unchoke,
    /// The local peer finished downloading and verifying a piece, send
    /// Have if the remote doesn't have it and recompute interest.
    HavePiece(u32),
    /// Stop requesting this block, its piece was reset.
    CancelBlock(BlockInfo),
    /// Close the connection, returning pending requests to the coordinator.
    Quit,
}

/// Determines who initiated the connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Outbound means the local peer initiated the connection
    Outbound,
    /// Inbound means the remote peer initiated the connection
    Inbound,
}

/// Lifecycle of a connection.
#[derive(Clone, Default, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// TCP is connected but the handshake did not finish.
    #[default]
    HandshakePending,
    /// Handshaked, exchanging messages.
    Established,
    /// Tearing down, pending requests are being returned.
    Closing,
    Closed,
}

/// Immutable copy of the state of one connection, handed to the coordinator
/// and to the choke policy.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerSnapshot {
    pub id: PeerId,
    pub addr: SocketAddr,
    pub am_choking: bool,
    pub am_interested: bool,
    pub peer_choking: bool,
    pub peer_interested: bool,
    pub pieces: Bitfield,
    pub outstanding_requests: usize,
    pub download_rate: u64,
    pub upload_rate: u64,
    pub downloaded: u64,
    pub uploaded: u64,
    /// Timed out requests and unsolicited blocks, read by the eviction
    /// policy.
    pub misbehavior: u32,
}

impl PeerSnapshot {
    pub fn is_seeder(&self) -> bool {
        !self.pieces.is_empty() && self.pieces.all()
    }
}
