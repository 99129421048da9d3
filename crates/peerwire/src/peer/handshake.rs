//! Turns a raw TCP connection into a [`Peer<Connected>`].
use std::{sync::Arc, time::Duration};

use futures::{SinkExt, StreamExt};
use tokio::{
    net::TcpStream,
    sync::{mpsc, oneshot},
    time::timeout,
};
use tokio_util::codec::Framed;
use tracing::{debug, trace};

use super::{Connected, Direction, Idle, Peer, PeerCtx, PeerIdentity, PeerMsg};
use crate::{
    bitfield::Reserved,
    error::Error,
    shaper::TrafficShaper,
    torrent::{TorrentCtx, TorrentMsg},
    wire::{Handshake, HandshakeCodec, MessageCodec},
};

/// Wait for the handshake of the remote, for at most `limit`.
pub async fn read_handshake(
    socket: &mut Framed<TcpStream, HandshakeCodec>,
    limit: Duration,
) -> Result<Handshake, Error> {
    match timeout(limit, socket.next()).await {
        Ok(Some(Ok(handshake))) => Ok(handshake),
        Ok(Some(Err(e))) => Err(e),
        Ok(None) => {
            trace!("peer closed connection during handshake");
            Err(Error::PeerClosedSocket)
        }
        Err(_) => {
            trace!("handshake timeout after {}ms", limit.as_millis());
            Err(Error::HandshakeTimeout)
        }
    }
}

impl Default for Peer<Idle> {
    fn default() -> Self {
        Self::new()
    }
}

impl Peer<Idle> {
    pub fn new() -> Self {
        Self { state: Idle }
    }

    fn local_handshake(torrent_ctx: &TorrentCtx) -> Handshake {
        Handshake::new(
            torrent_ctx.info_hash.clone(),
            torrent_ctx.local_peer_id.clone(),
            Reserved::supported(torrent_ctx.config.dht_port.is_some()),
        )
    }

    /// Checks shared by both directions, after the handshake of the remote
    /// was read.
    async fn validate(
        peer_handshake: &Handshake,
        torrent_ctx: &TorrentCtx,
    ) -> Result<(), Error> {
        if peer_handshake.info_hash != torrent_ctx.info_hash {
            return Err(Error::UnknownTorrent);
        }
        if peer_handshake.peer_id == torrent_ctx.local_peer_id {
            return Err(Error::SelfConnection);
        }

        let (otx, orx) = oneshot::channel();
        torrent_ctx
            .tx
            .send(TorrentMsg::HasPeer(peer_handshake.peer_id.clone(), otx))
            .await?;
        if orx.await? {
            return Err(Error::NoDuplicatePeer);
        }

        Ok(())
    }

    /// Send our handshake, wait for theirs and validate it.
    pub async fn outbound_handshake(
        self,
        socket: TcpStream,
        torrent_ctx: Arc<TorrentCtx>,
    ) -> Result<Peer<Connected>, Error> {
        let remote = socket.peer_addr()?;
        let mut socket = Framed::new(socket, HandshakeCodec);

        debug!("{remote} sending outbound handshake");
        socket.send(Self::local_handshake(&torrent_ctx)).await?;

        let peer_handshake =
            read_handshake(&mut socket, torrent_ctx.config.handshake_timeout())
                .await?;

        Self::validate(&peer_handshake, &torrent_ctx).await?;

        Self::connected(socket, peer_handshake, torrent_ctx, Direction::Outbound)
    }

    /// The remote already sent its handshake, which was read by the session
    /// to find the torrent. Validate it and answer with ours.
    pub async fn inbound_handshake(
        self,
        mut socket: Framed<TcpStream, HandshakeCodec>,
        peer_handshake: Handshake,
        torrent_ctx: Arc<TorrentCtx>,
    ) -> Result<Peer<Connected>, Error> {
        Self::validate(&peer_handshake, &torrent_ctx).await?;

        socket.send(Self::local_handshake(&torrent_ctx)).await?;

        Self::connected(socket, peer_handshake, torrent_ctx, Direction::Inbound)
    }

    fn connected(
        socket: Framed<TcpStream, HandshakeCodec>,
        peer_handshake: Handshake,
        torrent_ctx: Arc<TorrentCtx>,
        direction: Direction,
    ) -> Result<Peer<Connected>, Error> {
        let remote = socket.get_ref().peer_addr()?;
        let local = socket.get_ref().local_addr()?;

        // the read buffer may already hold the first messages of the peer,
        // switch the codec without dropping it.
        let max_frame_len = torrent_ctx.config.max_frame_len;
        let socket = socket.map_codec(|_| MessageCodec::new(max_frame_len));

        let (tx, rx) = mpsc::unbounded_channel::<PeerMsg>();

        let shaper = Arc::new(TrafficShaper::with_parent(
            torrent_ctx.config.peer_upload_limit,
            torrent_ctx.config.peer_download_limit,
            torrent_ctx.shaper.clone(),
        ));

        let ctx = Arc::new(PeerCtx {
            tx,
            identity: PeerIdentity {
                id: peer_handshake.peer_id.clone(),
                addr: remote,
                reserved: peer_handshake.reserved(),
            },
            direction,
            local_addr: local,
            shaper,
        });

        debug!("{remote} handshake done, {direction:?} {:?}", ctx.identity.id);

        Ok(Peer { state: Connected::new(ctx, torrent_ctx, socket, rx) })
    }
}
