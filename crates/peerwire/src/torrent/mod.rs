//! Torrent that is spawned by the Session.
//!
//! A torrent manages multiple peers, peers can send messages to the torrent
//! using [`TorrentMsg`], and the torrent can send messages to the peers using
//! [`PeerMsg`]. The torrent is the only owner of the swarm wide state: which
//! peers are connected, who has which piece and which blocks are being
//! requested from whom.
pub mod choker;
pub mod download;
pub mod picker;
mod types;

// re-exports
pub use choker::{ChokePolicy, UploadSlots};
pub use download::Download;
pub use picker::{PiecePicker, RarestFirst};
pub use types::*;

use std::{net::SocketAddr, sync::Arc};

use hashbrown::{HashMap, HashSet};
use tokio::{
    net::TcpStream,
    select,
    sync::{mpsc, oneshot},
    task::JoinSet,
    time::{interval, interval_at, sleep, timeout, Instant, MissedTickBehavior},
};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::{
    bitfield::{Bitfield, BitfieldExt},
    config::Config,
    error::Error,
    peer::{Connected, Direction, Idle, Peer, PeerCtx, PeerId, PeerMsg, PeerSnapshot},
    shaper::TrafficShaper,
    storage::Storage,
    wire::{Handshake, HandshakeCodec},
};

/// Capacity of the channel of a torrent.
pub const TORRENT_CHANNEL_LEN: usize = 300;

/// Context of [`Torrent`] that is shared with its peers.
pub struct TorrentCtx {
    pub tx: mpsc::Sender<TorrentMsg>,
    pub info_hash: InfoHash,
    pub meta: TorrentMeta,
    pub storage: Arc<dyn Storage>,
    /// Parent of the shaper of every peer of this torrent.
    pub shaper: Arc<TrafficShaper>,
    pub config: Arc<Config>,
    pub local_peer_id: PeerId,
}

impl std::fmt::Debug for TorrentCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TorrentCtx")
            .field("info_hash", &self.info_hash)
            .field("meta", &self.meta)
            .field("local_peer_id", &self.local_peer_id)
            .finish_non_exhaustive()
    }
}

impl From<&Error> for DisconnectReason {
    fn from(value: &Error) -> Self {
        if value.is_misbehavior() {
            DisconnectReason::Misbehavior(value.to_string())
        } else {
            DisconnectReason::Transport(value.to_string())
        }
    }
}

/// The coordinator of one torrent, see the module docs.
pub struct Torrent {
    pub ctx: Arc<TorrentCtx>,
    pub status: TorrentStatus,
    /// Bitfield representing the presence or absence of pieces for our local
    /// peer, where each bit is a piece.
    pub bitfield: Bitfield,
    rx: mpsc::Receiver<TorrentMsg>,
    events: mpsc::UnboundedSender<SwarmEvent>,
    peers: HashMap<PeerId, Arc<PeerCtx>>,
    snapshots: HashMap<PeerId, PeerSnapshot>,
    peer_pieces: HashMap<PeerId, Bitfield>,
    download: Download,
    /// Outbound connections that did not finish the handshake.
    connecting: HashSet<SocketAddr>,
    /// Known addresses waiting for a free connection slot.
    idle: HashSet<SocketAddr>,
    /// Failed connection attempts per address.
    attempts: HashMap<SocketAddr, u32>,
    banned: HashSet<SocketAddr>,
    unchoked: HashSet<PeerId>,
    picker: Box<dyn PiecePicker>,
    choker: Box<dyn ChokePolicy>,
    tasks: JoinSet<()>,
}

/// Cheap to clone handle used to control a [`Torrent`] from the outside.
#[derive(Debug, Clone)]
pub struct TorrentHandle {
    pub info_hash: InfoHash,
    pub tx: mpsc::Sender<TorrentMsg>,
}

impl TorrentHandle {
    /// Connect to a new address when there is room for it.
    pub async fn add_peer(&self, addr: SocketAddr) -> Result<(), Error> {
        self.tx.send(TorrentMsg::NewPeerCandidate(addr)).await?;
        Ok(())
    }

    pub async fn bitfield(&self) -> Result<Bitfield, Error> {
        let (otx, orx) = oneshot::channel();
        self.tx.send(TorrentMsg::ReadBitfield(otx)).await?;
        Ok(orx.await?)
    }

    /// Latest state of every connected peer.
    pub async fn peers(&self) -> Result<Vec<PeerSnapshot>, Error> {
        let (otx, orx) = oneshot::channel();
        self.tx.send(TorrentMsg::GetPeers(otx)).await?;
        Ok(orx.await?)
    }

    /// Rate limits of one connection in bytes per second, 0 is unlimited.
    pub async fn set_peer_limits(
        &self,
        id: PeerId,
        write_limit: u64,
        read_limit: u64,
    ) -> Result<(), Error> {
        self.tx
            .send(TorrentMsg::SetPeerLimits { id, write_limit, read_limit })
            .await?;
        Ok(())
    }

    /// Close every connection and wait for the torrent to stop.
    pub async fn quit(&self) -> Result<(), Error> {
        let (otx, orx) = oneshot::channel();
        self.tx.send(TorrentMsg::Quit(otx)).await?;
        Ok(orx.await?)
    }
}

impl Torrent {
    /// Create a torrent whose local pieces are the ones already in
    /// `storage`. The torrent does nothing until [`Torrent::run`].
    pub async fn new(
        meta: TorrentMeta,
        storage: Arc<dyn Storage>,
        shaper: Arc<TrafficShaper>,
        config: Arc<Config>,
        local_peer_id: PeerId,
        events: mpsc::UnboundedSender<SwarmEvent>,
    ) -> Result<(Self, TorrentHandle), Error> {
        let bitfield = storage.bitfield().await?;
        let (tx, rx) = mpsc::channel(TORRENT_CHANNEL_LEN);

        let status = if meta.piece_count > 0 && bitfield.all() {
            TorrentStatus::Seeding
        } else {
            TorrentStatus::Downloading
        };

        let handle = TorrentHandle { info_hash: meta.info_hash.clone(), tx: tx.clone() };

        let ctx = Arc::new(TorrentCtx {
            tx,
            info_hash: meta.info_hash.clone(),
            meta: meta.clone(),
            storage,
            shaper,
            config: config.clone(),
            local_peer_id,
        });

        let torrent = Self {
            ctx,
            status,
            bitfield,
            rx,
            events,
            peers: HashMap::new(),
            snapshots: HashMap::new(),
            peer_pieces: HashMap::new(),
            download: Download::new(meta),
            connecting: HashSet::new(),
            idle: HashSet::new(),
            attempts: HashMap::new(),
            banned: HashSet::new(),
            unchoked: HashSet::new(),
            picker: Box::new(RarestFirst),
            choker: Box::new(UploadSlots::new(config.upload_slots)),
            tasks: JoinSet::new(),
        };

        Ok((torrent, handle))
    }

    pub fn with_picker(mut self, picker: impl PiecePicker + 'static) -> Self {
        self.picker = Box::new(picker);
        self
    }

    pub fn with_choker(mut self, choker: impl ChokePolicy + 'static) -> Self {
        self.choker = Box::new(choker);
        self
    }

    /// Run the event loop of the torrent until it receives
    /// [`TorrentMsg::Quit`].
    #[tracing::instrument(name = "torrent::run", skip(self), fields(info_hash = %self.ctx.info_hash))]
    pub async fn run(&mut self) -> Result<(), Error> {
        let config = self.ctx.config.clone();
        info!("{} running, status {:?}", self.ctx.info_hash, self.status);

        // choose the best interested peers and unchoke them.
        let mut unchoke_interval = interval_at(
            Instant::now() + config.unchoke_interval(),
            config.unchoke_interval(),
        );
        unchoke_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // try to reconnect with errored peers and to use free slots.
        let mut reconnect_interval = interval(config.reconnect_interval());
        reconnect_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            select! {
                Some(msg) = self.rx.recv() => {
                    if let TorrentMsg::Quit(otx) = msg {
                        self.quit().await;
                        let _ = otx.send(());
                        return Ok(());
                    }
                    self.handle_msg(msg);
                }
                _ = unchoke_interval.tick() => {
                    self.unchoke_round();
                }
                _ = reconnect_interval.tick() => {
                    self.reconnect();
                }
                Some(r) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    if let Err(e) = r {
                        warn!("{} peer task failed: {e}", self.ctx.info_hash);
                    }
                }
            }
        }
    }

    fn emit(&self, event: SwarmEvent) {
        let _ = self.events.send(event);
    }

    fn has_capacity(&self) -> bool {
        self.peers.len() + self.connecting.len()
            < self.ctx.config.max_peers_per_torrent
    }

    fn is_connected_to(&self, addr: &SocketAddr) -> bool {
        self.connecting.contains(addr)
            || self.peers.values().any(|p| p.identity.addr == *addr)
    }

    fn handle_msg(&mut self, msg: TorrentMsg) {
        match msg {
            TorrentMsg::PeerConnected(ctx) => self.peer_connected(ctx),
            TorrentMsg::PeerDisconnected { id, addr, reason, misbehavior } => {
                self.peer_disconnected(id, addr, reason, misbehavior)
            }
            TorrentMsg::PeerConnectingError { addr, reason, retry } => {
                self.connecting_error(addr, reason, retry)
            }
            TorrentMsg::HasPeer(id, otx) => {
                let _ = otx.send(self.peers.contains_key(&id));
            }
            TorrentMsg::PeerSnapshot(snapshot) => self.peer_snapshot(snapshot),
            TorrentMsg::InboundPeer { socket, handshake } => {
                self.inbound_peer(socket, handshake)
            }
            TorrentMsg::NewPeerCandidate(addr) => self.new_candidate(addr),
            TorrentMsg::PeerBitfield(id, bitfield) => {
                if !self.peers.contains_key(&id) {
                    return;
                }
                if let Some(old) = self.peer_pieces.remove(&id) {
                    self.download.remove_availability(&old);
                }
                self.download.add_availability(&bitfield);
                self.peer_pieces.insert(id, bitfield);
            }
            TorrentMsg::PeerHave(id, index) => {
                if !self.peers.contains_key(&id) {
                    return;
                }
                // haves may come without a bitfield
                let piece_count = self.ctx.meta.piece_count as usize;
                let pieces = self
                    .peer_pieces
                    .entry(id)
                    .or_insert_with(|| Bitfield::from_piece(piece_count));

                if (index as usize) < pieces.len() && !pieces.has(index as usize) {
                    pieces.set(index as usize, true);
                    self.download.add_have(index);
                }
            }
            TorrentMsg::RequestBlocks { id, qnt, recipient } => {
                let blocks = match self.peer_pieces.get(&id) {
                    Some(pieces) if self.status == TorrentStatus::Downloading => {
                        self.download.assign(
                            &id,
                            pieces,
                            &self.bitfield,
                            qnt,
                            self.picker.as_mut(),
                        )
                    }
                    _ => Vec::new(),
                };
                if let Err(blocks) = recipient.send(blocks) {
                    self.download.release(&id, &blocks);
                }
            }
            TorrentMsg::ReturnBlocks(id, blocks) => {
                debug!("{} {} blocks returned", self.ctx.info_hash, blocks.len());
                self.download.release(&id, &blocks);
            }
            TorrentMsg::BlockStored(_id, info) => {
                if let Some(piece) = self.download.block_stored(info) {
                    self.piece_completed(piece);
                }
            }
            TorrentMsg::PieceCorrupt(index) => {
                warn!("{} piece {index} failed verification", self.ctx.info_hash);
                for (id, info) in self.download.piece_corrupt(index) {
                    if let Some(peer) = self.peers.get(&id) {
                        let _ = peer.tx.send(PeerMsg::CancelBlock(info));
                    }
                }
                self.emit(SwarmEvent::PieceCorrupt {
                    info_hash: self.ctx.info_hash.clone(),
                    piece: index,
                });
            }
            TorrentMsg::DhtNode(addr) => self.emit(SwarmEvent::DhtNode(addr)),
            TorrentMsg::ReadBitfield(otx) => {
                let _ = otx.send(self.bitfield.clone());
            }
            TorrentMsg::GetPeers(otx) => {
                let _ = otx.send(self.snapshots.values().cloned().collect());
            }
            TorrentMsg::SetPeerLimits { id, write_limit, read_limit } => {
                if let Some(peer) = self.peers.get(&id) {
                    peer.shaper.update(write_limit, read_limit);
                }
            }
            // handled by the event loop
            TorrentMsg::Quit(otx) => {
                let _ = otx.send(());
            }
        }
    }

    fn peer_connected(&mut self, ctx: Arc<PeerCtx>) {
        let id = ctx.identity.id.clone();
        let addr = ctx.identity.addr;

        // two handshakes with the same peer may race each other, the first
        // one to register wins.
        if self.status == TorrentStatus::Stopping || self.peers.contains_key(&id) {
            debug!("{addr} rejecting connection of {id:?}");
            let _ = ctx.tx.send(PeerMsg::Quit);
            return;
        }

        if ctx.direction == Direction::Outbound {
            self.connecting.remove(&addr);
        }
        self.idle.remove(&addr);
        self.attempts.remove(&addr);

        info!("{addr} connected, {} peers", self.peers.len() + 1);

        self.peers.insert(id.clone(), ctx);
        self.emit(SwarmEvent::PeerConnected {
            info_hash: self.ctx.info_hash.clone(),
            addr,
            peer_id: id,
        });
    }

    fn peer_disconnected(
        &mut self,
        id: PeerId,
        addr: SocketAddr,
        reason: DisconnectReason,
        misbehavior: u32,
    ) {
        // the loser of a duplicate connection race has the same id.
        let Some(ctx) = self.peers.get(&id) else { return };
        if ctx.identity.addr != addr {
            return;
        }
        let direction = ctx.direction;

        info!("{addr} disconnected: {reason:?}");

        self.peers.remove(&id);
        self.snapshots.remove(&id);
        if let Some(pieces) = self.peer_pieces.remove(&id) {
            self.download.remove_availability(&pieces);
        }
        self.download.release_peer(&id);

        match &reason {
            DisconnectReason::Misbehavior(_) => {
                self.banned.insert(addr);
            }
            DisconnectReason::Transport(_) if direction == Direction::Outbound => {
                self.retry_later(addr);
            }
            _ => {}
        }

        if self.unchoked.remove(&id) {
            self.fill_upload_slots();
        }

        self.emit(SwarmEvent::PeerDisconnected {
            info_hash: self.ctx.info_hash.clone(),
            addr,
            peer_id: Some(id),
            reason,
            misbehavior,
        });
    }

    fn connecting_error(&mut self, addr: SocketAddr, reason: DisconnectReason, retry: bool) {
        debug!("{addr} could not connect: {reason:?}");

        let outbound = self.connecting.remove(&addr);

        if let DisconnectReason::Misbehavior(_) = reason {
            self.banned.insert(addr);
        } else if retry && outbound {
            self.retry_later(addr);
        }

        self.emit(SwarmEvent::PeerDisconnected {
            info_hash: self.ctx.info_hash.clone(),
            addr,
            peer_id: None,
            reason,
            misbehavior: 0,
        });
    }

    /// Put the address back in the idle set, unless it failed too often.
    fn retry_later(&mut self, addr: SocketAddr) {
        let attempts = self.attempts.entry(addr).or_insert(0);
        *attempts += 1;

        if *attempts > self.ctx.config.max_reconnect_attempts {
            debug!("{addr} giving up after {} attempts", *attempts - 1);
            return;
        }

        if self.status != TorrentStatus::Stopping {
            self.idle.insert(addr);
        }
    }

    fn peer_snapshot(&mut self, snapshot: PeerSnapshot) {
        if !self.peers.contains_key(&snapshot.id) {
            return;
        }
        let id = snapshot.id.clone();
        let wants_slot = snapshot.peer_interested && !self.unchoked.contains(&id);
        self.snapshots.insert(id, snapshot);

        if wants_slot {
            self.fill_upload_slots();
        }
    }

    /// Unchoke interested peers right away while there are free upload
    /// slots, without waiting for the next round.
    fn fill_upload_slots(&mut self) {
        if self.status == TorrentStatus::Stopping {
            return;
        }

        let slots = self.choker.slots();

        for (id, snapshot) in &self.snapshots {
            if self.unchoked.len() >= slots {
                break;
            }
            if !snapshot.peer_interested
                || snapshot.is_seeder()
                || self.unchoked.contains(id)
            {
                continue;
            }
            if let Some(peer) = self.peers.get(id) {
                debug!("{} unchoking into a free slot", peer.identity.addr);
                let _ = peer.tx.send(PeerMsg::Unchoke);
                self.unchoked.insert(id.clone());
            }
        }
    }

    fn unchoke_round(&mut self) {
        let peers: Vec<PeerSnapshot> = self
            .snapshots
            .values()
            .filter(|s| self.peers.contains_key(&s.id))
            .cloned()
            .collect();

        let seeding = self.status == TorrentStatus::Seeding;
        let best = self.choker.unchoke(&peers, seeding);

        for id in self.unchoked.difference(&best) {
            if let Some(peer) = self.peers.get(id) {
                let _ = peer.tx.send(PeerMsg::Choke);
            }
        }

        for id in best.difference(&self.unchoked) {
            if let Some(peer) = self.peers.get(id) {
                let _ = peer.tx.send(PeerMsg::Unchoke);
            }
        }

        debug!(
            "{} unchoke round: {} unchoked of {} peers",
            self.ctx.info_hash,
            best.len(),
            peers.len()
        );

        self.unchoked = best;
    }

    fn piece_completed(&mut self, piece: u32) {
        if self.bitfield.has(piece as usize) {
            return;
        }

        self.bitfield.set(piece as usize, true);
        debug!(
            "{} downloaded piece {piece}, {}/{}",
            self.ctx.info_hash,
            self.bitfield.count_ones(),
            self.bitfield.len()
        );

        for peer in self.peers.values() {
            let _ = peer.tx.send(PeerMsg::HavePiece(piece));
        }

        self.emit(SwarmEvent::PieceCompleted {
            info_hash: self.ctx.info_hash.clone(),
            piece,
        });

        if self.bitfield.all() && self.status == TorrentStatus::Downloading {
            info!("{} downloaded entire torrent, seeding", self.ctx.info_hash);
            self.status = TorrentStatus::Seeding;
            self.emit(SwarmEvent::TorrentComplete { info_hash: self.ctx.info_hash.clone() });
        }
    }

    fn new_candidate(&mut self, addr: SocketAddr) {
        if self.status == TorrentStatus::Stopping
            || self.banned.contains(&addr)
            || self.is_connected_to(&addr)
        {
            return;
        }

        if self.has_capacity() {
            self.connect(addr);
        } else {
            self.idle.insert(addr);
        }
    }

    fn inbound_peer(&mut self, socket: Framed<TcpStream, HandshakeCodec>, handshake: Handshake) {
        let Ok(addr) = socket.get_ref().peer_addr() else { return };

        if self.status == TorrentStatus::Stopping || self.banned.contains(&addr) {
            debug!("{addr} refusing inbound connection");
            return;
        }

        if !self.has_capacity() {
            debug!("{addr} refusing inbound connection: {}", Error::MaximumPeers);
            return;
        }

        let ctx = self.ctx.clone();
        self.tasks.spawn(async move {
            let r = Peer::<Idle>::new().inbound_handshake(socket, handshake, ctx.clone()).await;
            run_peer(ctx, addr, r).await;
        });
    }

    fn connect(&mut self, addr: SocketAddr) {
        self.idle.remove(&addr);
        self.connecting.insert(addr);
        self.tasks.spawn(run_outbound(self.ctx.clone(), addr));
    }

    /// Use the free connection slots on idle addresses.
    fn reconnect(&mut self) {
        if self.status == TorrentStatus::Stopping {
            return;
        }

        let free = (self.ctx.config.max_peers_per_torrent)
            .saturating_sub(self.peers.len() + self.connecting.len());

        let addrs: Vec<SocketAddr> = self
            .idle
            .iter()
            .filter(|a| !self.banned.contains(*a))
            .take(free)
            .copied()
            .collect();

        if !addrs.is_empty() {
            debug!("{} connecting to {} idle peers", self.ctx.info_hash, addrs.len());
        }

        for addr in addrs {
            self.connect(addr);
        }
    }

    /// Ask every peer to quit and wait for all peer tasks, handling the
    /// messages they send meanwhile so none of them blocks on the channel.
    async fn quit(&mut self) {
        info!("{} quitting, closing {} peers", self.ctx.info_hash, self.peers.len());
        self.status = TorrentStatus::Stopping;

        for peer in self.peers.values() {
            let _ = peer.tx.send(PeerMsg::Quit);
        }

        // connections still handshaking quit when they register, but a
        // dial can take up to these timeouts.
        let config = &self.ctx.config;
        let deadline = sleep(config.connect_timeout() + config.handshake_timeout());
        tokio::pin!(deadline);

        loop {
            select! {
                r = self.tasks.join_next() => {
                    match r {
                        Some(Err(e)) => warn!("{} peer task failed: {e}", self.ctx.info_hash),
                        Some(Ok(())) => {}
                        None => break,
                    }
                }
                Some(msg) = self.rx.recv() => {
                    self.handle_msg(msg);
                }
                _ = &mut deadline => {
                    warn!("{} aborting {} peer tasks", self.ctx.info_hash, self.tasks.len());
                    self.tasks.abort_all();
                    while self.tasks.join_next().await.is_some() {}
                    break;
                }
            }
        }

        // drain what the peers sent while closing
        while let Ok(msg) = self.rx.try_recv() {
            self.handle_msg(msg);
        }
    }
}

/// Dial `addr`, handshake and run the peer until it disconnects.
async fn run_outbound(ctx: Arc<TorrentCtx>, addr: SocketAddr) {
    let r = match timeout(ctx.config.connect_timeout(), TcpStream::connect(addr)).await {
        Ok(Ok(socket)) => Peer::<Idle>::new().outbound_handshake(socket, ctx.clone()).await,
        Ok(Err(e)) => Err(Error::Io(e)),
        Err(_) => Err(Error::ConnectTimeout(addr)),
    };
    run_peer(ctx, addr, r).await;
}

async fn run_peer(
    ctx: Arc<TorrentCtx>,
    addr: SocketAddr,
    peer: Result<Peer<Connected>, Error>,
) {
    let mut peer = match peer {
        Ok(peer) => peer,
        Err(e) => {
            debug!("{addr} handshake failed: {e}");
            let _ = ctx
                .tx
                .send(TorrentMsg::PeerConnectingError {
                    addr,
                    reason: DisconnectReason::from(&e),
                    retry: e.is_retryable(),
                })
                .await;
            return;
        }
    };

    let reason = match peer.run().await {
        Ok(()) => DisconnectReason::Local,
        Err(e) => {
            debug!("{addr} peer loop stopped due to an error: {e}");
            DisconnectReason::from(&e)
        }
    };

    peer.disconnect(reason).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        bitfield::Reserved,
        peer::PeerIdentity,
        storage::{piece_hashes, MemoryStorage},
        wire::{BlockInfo, BLOCK_LEN},
    };
    use bitvec::{bitvec, prelude::Msb0};

    fn meta(pieces: u32, blocks_per_piece: u32) -> TorrentMeta {
        let piece_length = BLOCK_LEN * blocks_per_piece;
        TorrentMeta::new(InfoHash([9; 20]), piece_length, piece_length as u64 * pieces as u64)
            .unwrap()
    }

    async fn spawn_torrent(
        meta: TorrentMeta,
        config: Config,
    ) -> (TorrentHandle, mpsc::UnboundedReceiver<SwarmEvent>) {
        let data = vec![7u8; meta.total_length() as usize];
        let hashes = piece_hashes(&data, meta.piece_length);
        let storage = Arc::new(MemoryStorage::new(meta.clone(), hashes));
        let (events_tx, events) = mpsc::unbounded_channel();

        let (mut torrent, handle) = Torrent::new(
            meta,
            storage,
            Arc::new(TrafficShaper::default()),
            Arc::new(config),
            PeerId::generate(),
            events_tx,
        )
        .await
        .unwrap();

        tokio::spawn(async move { torrent.run().await });
        (handle, events)
    }

    fn fake_peer(n: u8) -> (Arc<PeerCtx>, mpsc::UnboundedReceiver<PeerMsg>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let ctx = PeerCtx {
            tx,
            identity: PeerIdentity {
                id: PeerId([n; 20]),
                addr: format!("10.0.0.{n}:6881").parse().unwrap(),
                reserved: Reserved::default(),
            },
            direction: Direction::Inbound,
            local_addr: "127.0.0.1:51413".parse().unwrap(),
            shaper: Arc::new(TrafficShaper::default()),
        };
        (Arc::new(ctx), rx)
    }

    fn snapshot(ctx: &PeerCtx, peer_interested: bool) -> PeerSnapshot {
        PeerSnapshot {
            id: ctx.identity.id.clone(),
            addr: ctx.identity.addr,
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested,
            pieces: Bitfield::new(),
            outstanding_requests: 0,
            download_rate: 0,
            upload_rate: 0,
            downloaded: 0,
            uploaded: 0,
            misbehavior: 0,
        }
    }

    async fn connect(
        handle: &TorrentHandle,
        events: &mut mpsc::UnboundedReceiver<SwarmEvent>,
        ctx: &Arc<PeerCtx>,
        pieces: Bitfield,
    ) {
        handle.tx.send(TorrentMsg::PeerConnected(ctx.clone())).await.unwrap();
        let event = events.recv().await.unwrap();
        assert!(matches!(event, SwarmEvent::PeerConnected { .. }));
        handle
            .tx
            .send(TorrentMsg::PeerBitfield(ctx.identity.id.clone(), pieces))
            .await
            .unwrap();
    }

    async fn request(handle: &TorrentHandle, id: &PeerId, qnt: usize) -> Vec<BlockInfo> {
        let (otx, orx) = oneshot::channel();
        handle
            .tx
            .send(TorrentMsg::RequestBlocks { id: id.clone(), qnt, recipient: otx })
            .await
            .unwrap();
        orx.await.unwrap()
    }

    #[tokio::test]
    async fn completed_pieces_are_announced() {
        let meta = meta(2, 1);
        let info_hash = meta.info_hash.clone();
        let (handle, mut events) = spawn_torrent(meta, Config::default()).await;
        let (a, mut a_rx) = fake_peer(1);

        connect(&handle, &mut events, &a, bitvec![u8, Msb0; 1, 1]).await;

        let blocks = request(&handle, &a.identity.id, 10).await;
        assert_eq!(
            blocks,
            vec![BlockInfo::new(0, 0, BLOCK_LEN), BlockInfo::new(1, 0, BLOCK_LEN)]
        );

        let id = a.identity.id.clone();
        handle.tx.send(TorrentMsg::BlockStored(id.clone(), blocks[0])).await.unwrap();
        assert_eq!(
            events.recv().await,
            Some(SwarmEvent::PieceCompleted { info_hash: info_hash.clone(), piece: 0 })
        );
        assert!(matches!(a_rx.recv().await, Some(PeerMsg::HavePiece(0))));

        handle.tx.send(TorrentMsg::BlockStored(id, blocks[1])).await.unwrap();
        assert_eq!(
            events.recv().await,
            Some(SwarmEvent::PieceCompleted { info_hash: info_hash.clone(), piece: 1 })
        );
        assert_eq!(
            events.recv().await,
            Some(SwarmEvent::TorrentComplete { info_hash })
        );
        assert!(handle.bitfield().await.unwrap().all());

        // nothing left to download
        assert!(request(&handle, &a.identity.id, 10).await.is_empty());
    }

    #[tokio::test]
    async fn disconnect_releases_blocks() {
        let (handle, mut events) = spawn_torrent(meta(1, 2), Config::default()).await;
        let (a, _a_rx) = fake_peer(1);
        let (b, _b_rx) = fake_peer(2);

        connect(&handle, &mut events, &a, bitvec![u8, Msb0; 1]).await;
        connect(&handle, &mut events, &b, bitvec![u8, Msb0; 1]).await;

        let blocks = request(&handle, &a.identity.id, 10).await;
        assert_eq!(blocks.len(), 2);
        assert!(request(&handle, &b.identity.id, 10).await.is_empty());

        handle
            .tx
            .send(TorrentMsg::PeerDisconnected {
                id: a.identity.id.clone(),
                addr: a.identity.addr,
                reason: DisconnectReason::Transport("reset".into()),
                misbehavior: 2,
            })
            .await
            .unwrap();

        match events.recv().await {
            Some(SwarmEvent::PeerDisconnected { peer_id, misbehavior, .. }) => {
                assert_eq!(peer_id, Some(a.identity.id.clone()));
                assert_eq!(misbehavior, 2);
            }
            e => panic!("unexpected event {e:?}"),
        }

        let mut reassigned = request(&handle, &b.identity.id, 10).await;
        reassigned.sort();
        assert_eq!(reassigned, blocks);
    }

    #[tokio::test]
    async fn corrupt_piece_cancels_its_requests() {
        let (handle, mut events) = spawn_torrent(meta(1, 2), Config::default()).await;
        let (a, _a_rx) = fake_peer(1);
        let (b, mut b_rx) = fake_peer(2);

        connect(&handle, &mut events, &a, bitvec![u8, Msb0; 1]).await;
        connect(&handle, &mut events, &b, bitvec![u8, Msb0; 1]).await;

        let first = request(&handle, &a.identity.id, 1).await;
        let second = request(&handle, &b.identity.id, 1).await;
        assert_eq!(first, vec![BlockInfo::new(0, 0, BLOCK_LEN)]);
        assert_eq!(second, vec![BlockInfo::new(0, BLOCK_LEN, BLOCK_LEN)]);

        handle
            .tx
            .send(TorrentMsg::BlockStored(a.identity.id.clone(), first[0]))
            .await
            .unwrap();
        handle.tx.send(TorrentMsg::PieceCorrupt(0)).await.unwrap();

        match b_rx.recv().await {
            Some(PeerMsg::CancelBlock(info)) => assert_eq!(info, second[0]),
            m => panic!("unexpected message {m:?}"),
        }
        assert!(matches!(events.recv().await, Some(SwarmEvent::PieceCorrupt { piece: 0, .. })));

        // the whole piece is downloaded again
        assert_eq!(request(&handle, &a.identity.id, 10).await.len(), 2);
    }

    #[tokio::test]
    async fn interested_peers_fill_free_slots() {
        let config = Config { upload_slots: 1, ..Config::default() };
        let (handle, mut events) = spawn_torrent(meta(1, 1), config).await;
        let (a, mut a_rx) = fake_peer(1);
        let (b, mut b_rx) = fake_peer(2);

        connect(&handle, &mut events, &a, bitvec![u8, Msb0; 0]).await;
        connect(&handle, &mut events, &b, bitvec![u8, Msb0; 0]).await;

        handle.tx.send(TorrentMsg::PeerSnapshot(snapshot(&a, true))).await.unwrap();
        assert!(matches!(a_rx.recv().await, Some(PeerMsg::Unchoke)));

        handle.tx.send(TorrentMsg::PeerSnapshot(snapshot(&b, true))).await.unwrap();
        assert_eq!(handle.peers().await.unwrap().len(), 2);
        assert!(b_rx.try_recv().is_err());

        handle
            .tx
            .send(TorrentMsg::PeerDisconnected {
                id: a.identity.id.clone(),
                addr: a.identity.addr,
                reason: DisconnectReason::Local,
                misbehavior: 0,
            })
            .await
            .unwrap();
        assert!(matches!(b_rx.recv().await, Some(PeerMsg::Unchoke)));
    }

    #[tokio::test]
    async fn duplicate_peer_is_rejected() {
        let (handle, mut events) = spawn_torrent(meta(1, 1), Config::default()).await;
        let (a, _a_rx) = fake_peer(1);
        let (a2, mut a2_rx) = fake_peer(1);

        connect(&handle, &mut events, &a, bitvec![u8, Msb0; 0]).await;

        let (otx, orx) = oneshot::channel();
        handle.tx.send(TorrentMsg::HasPeer(a.identity.id.clone(), otx)).await.unwrap();
        assert!(orx.await.unwrap());

        handle.tx.send(TorrentMsg::PeerConnected(a2)).await.unwrap();
        assert!(matches!(a2_rx.recv().await, Some(PeerMsg::Quit)));
    }

    #[tokio::test]
    async fn quit_closes_every_peer() {
        let (handle, mut events) = spawn_torrent(meta(1, 1), Config::default()).await;
        let (a, mut a_rx) = fake_peer(1);
        connect(&handle, &mut events, &a, bitvec![u8, Msb0; 0]).await;

        handle.quit().await.unwrap();
        assert!(matches!(a_rx.recv().await, Some(PeerMsg::Quit)));
        // the torrent task is gone
        assert!(handle.bitfield().await.is_err());
    }
}
