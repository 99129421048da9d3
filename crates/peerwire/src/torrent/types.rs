use std::{fmt::Display, net::SocketAddr, sync::Arc};

use speedy::{Readable, Writable};
use tokio::{net::TcpStream, sync::oneshot};
use tokio_util::codec::Framed;

use crate::{
    bitfield::Bitfield,
    error::Error,
    peer::{PeerCtx, PeerId, PeerSnapshot},
    wire::{BlockInfo, Handshake, HandshakeCodec, BLOCK_LEN},
};

#[derive(Clone, Default, PartialEq, Eq, Hash, Readable, Writable)]
pub struct InfoHash(pub [u8; 20]);

impl std::fmt::Debug for InfoHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl Display for InfoHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl From<[u8; 20]> for InfoHash {
    fn from(value: [u8; 20]) -> Self {
        Self(value)
    }
}

impl From<InfoHash> for [u8; 20] {
    fn from(value: InfoHash) -> Self {
        value.0
    }
}

impl TryFrom<&str> for InfoHash {
    type Error = hex::FromHexError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let mut buf = [0u8; 20];
        hex::decode_to_slice(value, &mut buf)?;
        Ok(Self(buf))
    }
}

/// What the engine needs to know about a torrent, taken from its metainfo
/// by the caller. Immutable for the lifetime of the torrent.
#[derive(Debug, Clone, PartialEq)]
pub struct TorrentMeta {
    pub info_hash: InfoHash,
    pub piece_count: u32,
    pub piece_length: u32,
    pub last_piece_length: u32,
}

impl TorrentMeta {
    /// Derive the piece layout from the total size of the content.
    ///
    /// Fails when `piece_length` is zero or the content has more pieces
    /// than fit in a `u32` piece index.
    pub fn new(
        info_hash: InfoHash,
        piece_length: u32,
        total_length: u64,
    ) -> Result<Self, Error> {
        if piece_length == 0 {
            return Err(Error::InvalidMeta("piece length is zero".into()));
        }

        let piece_count = u32::try_from(total_length.div_ceil(piece_length as u64))
            .map_err(|_| {
                Error::InvalidMeta(format!(
                    "{total_length} bytes in pieces of {piece_length} is more than {} pieces",
                    u32::MAX
                ))
            })?;
        let rem = (total_length % piece_length as u64) as u32;
        let last_piece_length = if rem == 0 { piece_length } else { rem };

        Ok(Self { info_hash, piece_count, piece_length, last_piece_length })
    }

    pub fn total_length(&self) -> u64 {
        if self.piece_count == 0 {
            return 0;
        }
        (self.piece_count as u64 - 1) * self.piece_length as u64
            + self.last_piece_length as u64
    }

    /// Length of the given piece, the last one might be shorter.
    pub fn piece_len(&self, index: u32) -> u32 {
        if index + 1 == self.piece_count {
            self.last_piece_length
        } else {
            self.piece_length
        }
    }

    /// Split a piece into block infos of [`BLOCK_LEN`], except for the last
    /// one which might be smaller.
    pub fn block_infos(&self, index: u32) -> Vec<BlockInfo> {
        let len = self.piece_len(index);
        (0..len.div_ceil(BLOCK_LEN))
            .map(|i| {
                let begin = i * BLOCK_LEN;
                BlockInfo::new(index, begin, BLOCK_LEN.min(len - begin))
            })
            .collect()
    }

    pub fn blocks_in_piece(&self, index: u32) -> usize {
        self.piece_len(index).div_ceil(BLOCK_LEN) as usize
    }

    /// If the block info lies inside of its piece and has a valid length.
    pub fn is_valid_block(&self, info: &BlockInfo) -> bool {
        info.index < self.piece_count
            && info.is_valid_len()
            && info.begin as u64 + info.len as u64 <= self.piece_len(info.index) as u64
    }
}

/// Status of the current Torrent.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TorrentStatus {
    #[default]
    Downloading,
    Seeding,
    Stopping,
}

/// Why a connection ended, reported to the coordinator and to the session
/// listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Closed by us, torrent shutdown or eviction.
    Local,
    /// Socket closed, reset or went silent.
    Transport(String),
    /// The peer broke the protocol, never reconnected.
    Misbehavior(String),
}

/// Messages used by Peers to talk with the Torrent and by the Session to
/// control it.
#[derive(Debug)]
pub enum TorrentMsg {
    /// A peer finished its handshake and started its event loop.
    PeerConnected(Arc<PeerCtx>),
    /// The peer task is done, its ctx must be dropped.
    PeerDisconnected {
        id: PeerId,
        addr: SocketAddr,
        reason: DisconnectReason,
        misbehavior: u32,
    },
    /// The connection or the handshake with this address failed. `retry`
    /// if the address may be tried again later. Misbehavior bans it.
    PeerConnectingError { addr: SocketAddr, reason: DisconnectReason, retry: bool },
    /// If a peer with this id is already connected.
    HasPeer(PeerId, oneshot::Sender<bool>),
    /// Latest state of a peer, pushed by the peer every tick and when the
    /// interest of the remote changes.
    PeerSnapshot(PeerSnapshot),
    /// An inbound peer whose handshake was already read and validated
    /// against this torrent.
    InboundPeer {
        socket: Framed<TcpStream, HandshakeCodec>,
        handshake: Handshake,
    },
    /// An address discovered by a tracker, the DHT or PEX.
    NewPeerCandidate(SocketAddr),
    /// The full piece set of a peer.
    PeerBitfield(PeerId, Bitfield),
    /// One piece that a peer has.
    PeerHave(PeerId, u32),
    /// A peer has free slots in its pipeline and asks for blocks to request.
    RequestBlocks { id: PeerId, qnt: usize, recipient: oneshot::Sender<Vec<BlockInfo>> },
    /// Requests that will not be completed by this peer (choke, timeout,
    /// disconnect) and must be assigned to someone else.
    ReturnBlocks(PeerId, Vec<BlockInfo>),
    /// A requested block was received and written to storage.
    BlockStored(PeerId, BlockInfo),
    /// Storage rejected the piece of a block it just received.
    PieceCorrupt(u32),
    /// The remote runs a DHT node on this address.
    DhtNode(SocketAddr),
    ReadBitfield(oneshot::Sender<Bitfield>),
    GetPeers(oneshot::Sender<Vec<PeerSnapshot>>),
    /// Change the rate limits of one connection.
    SetPeerLimits { id: PeerId, write_limit: u64, read_limit: u64 },
    /// Close every connection, wait for all of them and then stop.
    Quit(oneshot::Sender<()>),
}

/// Events emitted by the engine for the layers around it: storage,
/// trackers, DHT and the UI.
#[derive(Debug, Clone, PartialEq)]
pub enum SwarmEvent {
    /// Every block of the piece was stored and the storage accepted it.
    PieceCompleted { info_hash: InfoHash, piece: u32 },
    /// The storage rejected the piece, its progress was discarded.
    PieceCorrupt { info_hash: InfoHash, piece: u32 },
    TorrentComplete { info_hash: InfoHash },
    PeerConnected { info_hash: InfoHash, addr: SocketAddr, peer_id: PeerId },
    /// A connection ended. `peer_id` is `None` when it failed before the
    /// handshake completed.
    PeerDisconnected {
        info_hash: InfoHash,
        addr: SocketAddr,
        peer_id: Option<PeerId>,
        reason: DisconnectReason,
        misbehavior: u32,
    },
    DhtNode(SocketAddr),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_layout() {
        let meta = TorrentMeta::new(InfoHash::default(), 32768, 32768 * 2 + 100).unwrap();
        assert_eq!(meta.piece_count, 3);
        assert_eq!(meta.last_piece_length, 100);
        assert_eq!(meta.total_length(), 32768 * 2 + 100);
        assert_eq!(meta.piece_len(0), 32768);
        assert_eq!(meta.piece_len(2), 100);

        let meta = TorrentMeta::new(InfoHash::default(), 32768, 32768 * 2).unwrap();
        assert_eq!(meta.piece_count, 2);
        assert_eq!(meta.last_piece_length, 32768);
    }

    #[test]
    fn invalid_layouts() {
        assert!(matches!(
            TorrentMeta::new(InfoHash::default(), 0, 100),
            Err(Error::InvalidMeta(_))
        ));

        let meta = TorrentMeta::new(InfoHash::default(), 1, u32::MAX as u64).unwrap();
        assert_eq!(meta.piece_count, u32::MAX);

        assert!(matches!(
            TorrentMeta::new(InfoHash::default(), 1, u32::MAX as u64 + 1),
            Err(Error::InvalidMeta(_))
        ));
    }

    #[test]
    fn block_infos() {
        let meta = TorrentMeta::new(InfoHash::default(), 40000, 40000 + 10).unwrap();

        let blocks = meta.block_infos(0);
        assert_eq!(
            blocks,
            vec![
                BlockInfo::new(0, 0, BLOCK_LEN),
                BlockInfo::new(0, BLOCK_LEN, BLOCK_LEN),
                BlockInfo::new(0, BLOCK_LEN * 2, 40000 - BLOCK_LEN * 2),
            ]
        );
        assert_eq!(meta.blocks_in_piece(0), 3);
        assert_eq!(meta.block_infos(1), vec![BlockInfo::new(1, 0, 10)]);
    }

    #[test]
    fn valid_block() {
        let meta = TorrentMeta::new(InfoHash::default(), 40000, 40000 + 10).unwrap();
        assert!(meta.is_valid_block(&BlockInfo::new(0, 0, BLOCK_LEN)));
        assert!(meta.is_valid_block(&BlockInfo::new(1, 0, 10)));
        assert!(!meta.is_valid_block(&BlockInfo::new(1, 0, 11)));
        assert!(!meta.is_valid_block(&BlockInfo::new(2, 0, 10)));
        assert!(!meta.is_valid_block(&BlockInfo::new(0, 39000, BLOCK_LEN)));
    }

    #[test]
    fn info_hash_hex() {
        let hash = InfoHash::try_from("0123456789abcdef0123456789abcdef01234567")
            .unwrap();
        assert_eq!(hash.0[0], 0x01);
        assert_eq!(hash.to_string(), "0123456789abcdef0123456789abcdef01234567");
        assert!(InfoHash::try_from("xyz").is_err());
    }
}
