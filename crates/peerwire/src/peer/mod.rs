//! A remote peer in the network that downloads and uploads data
pub mod availability;
pub mod choke;
pub mod handshake;
pub mod request_pipeline;
mod types;

// re-exports
pub use availability::PieceAvailability;
pub use choke::ChokeState;
pub use request_pipeline::{RequestPipeline, TimedOut};
pub use types::*;

use std::{collections::VecDeque, net::SocketAddr, sync::Arc, time::Duration};

use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use tokio::{
    net::TcpStream,
    select,
    sync::{mpsc, oneshot},
    time::{interval, timeout, Instant, MissedTickBehavior},
};
use tokio_util::codec::Framed;
use tracing::{debug, info, trace, warn};

use crate::{
    bitfield::{Bitfield, BitfieldExt},
    error::Error,
    torrent::{DisconnectReason, TorrentCtx, TorrentMsg},
    wire::{Block, BlockInfo, Message, MessageCodec},
};

/// Time given to the cancels and the FIN of a graceful close.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// A connection with a remote peer, `S` is where it is in its lifecycle.
pub struct Peer<S: PeerState> {
    pub state: S,
}

/// A peer can be: Idle or Connected.
pub trait PeerState {}

/// Nothing was exchanged yet, see the handshake fns.
pub struct Idle;

/// Handshaked, exchanging messages. Everything in here is owned by the task
/// of this connection alone.
pub struct Connected {
    pub ctx: Arc<PeerCtx>,
    pub torrent_ctx: Arc<TorrentCtx>,
    pub sink: SplitSink<Framed<TcpStream, MessageCodec>, Message>,
    pub stream: SplitStream<Framed<TcpStream, MessageCodec>>,
    pub rx: mpsc::UnboundedReceiver<PeerMsg>,
    pub connection: ConnectionState,
    pub choke: ChokeState,
    /// Pieces of the remote.
    pub pieces: PieceAvailability,
    /// Our requests to the remote.
    pub pipeline: RequestPipeline,
    /// Pieces of the local peer, kept in sync by [`PeerMsg::HavePiece`].
    pub local_pieces: Bitfield,
    /// Requests of the remote waiting to be served, in arrival order.
    pub incoming: VecDeque<BlockInfo>,
    pub last_received: Instant,
    pub last_sent: Instant,
    /// Last time a requested block arrived.
    pub last_block: Instant,
    /// Blocks received that were never requested.
    pub unsolicited: u32,
}

impl PeerState for Idle {}
impl PeerState for Connected {}

impl Connected {
    pub fn new(
        ctx: Arc<PeerCtx>,
        torrent_ctx: Arc<TorrentCtx>,
        socket: Framed<TcpStream, MessageCodec>,
        rx: mpsc::UnboundedReceiver<PeerMsg>,
    ) -> Self {
        let (sink, stream) = socket.split();
        let config = &torrent_ctx.config;
        let piece_count = torrent_ctx.meta.piece_count as usize;
        let now = Instant::now();

        Self {
            pipeline: RequestPipeline::new(
                config.max_pipeline_depth,
                config.request_timeout(),
                config.max_request_retries,
            ),
            pieces: PieceAvailability::new(piece_count),
            local_pieces: Bitfield::from_piece(piece_count),
            incoming: VecDeque::new(),
            connection: ConnectionState::HandshakePending,
            choke: ChokeState::default(),
            last_received: now,
            last_sent: now,
            last_block: now,
            unsolicited: 0,
            ctx,
            torrent_ctx,
            sink,
            stream,
            rx,
        }
    }
}

impl Peer<Connected> {
    pub fn id(&self) -> &PeerId {
        &self.state.ctx.identity.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.state.ctx.identity.addr
    }

    /// Timed out requests and unsolicited blocks.
    pub fn misbehavior(&self) -> u32 {
        self.state.pipeline.timed_out_count() + self.state.unsolicited
    }

    pub fn snapshot(&self) -> PeerSnapshot {
        let choke = &self.state.choke;
        let shaper = &self.state.ctx.shaper;

        PeerSnapshot {
            id: self.id().clone(),
            addr: self.remote_addr(),
            am_choking: choke.am_choking,
            am_interested: choke.am_interested,
            peer_choking: choke.peer_choking,
            peer_interested: choke.peer_interested,
            pieces: self.state.pieces.pieces().clone(),
            outstanding_requests: self.state.pipeline.len(),
            download_rate: shaper.download_speed(),
            upload_rate: shaper.upload_speed(),
            downloaded: shaper.downloaded(),
            uploaded: shaper.uploaded(),
            misbehavior: self.misbehavior(),
        }
    }

    /// Start the event loop of the Peer, listen to messages sent by others
    /// on the peer wire protocol.
    ///
    /// Returns `Ok` when the torrent asked the peer to quit, and an error
    /// when the connection must be closed. Either way, the caller must
    /// finish with [`Self::disconnect`].
    pub async fn run(&mut self) -> Result<(), Error> {
        let remote = self.remote_addr();
        let torrent_tx = self.state.torrent_ctx.tx.clone();

        self.state.connection = ConnectionState::Established;
        torrent_tx.send(TorrentMsg::PeerConnected(self.state.ctx.clone())).await?;

        // the torrent replies with the bitfield as it was after it
        // registered this peer, later pieces arrive as HavePiece.
        {
            let (otx, orx) = oneshot::channel();
            torrent_tx.send(TorrentMsg::ReadBitfield(otx)).await?;
            self.state.local_pieces = orx.await?;
        }

        if self.state.local_pieces.any() {
            debug!("{remote} > bitfield");
            self.send(Message::Bitfield(self.state.local_pieces.clone())).await?;
        }

        if let Some(port) = self.state.torrent_ctx.config.dht_port {
            if self.state.ctx.identity.reserved.supports_dht() {
                debug!("{remote} > port {port}");
                self.send(Message::Port(port)).await?;
            }
        }

        // check timeouts, keep-alives and ask for blocks.
        let mut tick_interval = interval(self.state.torrent_ctx.config.tick());
        tick_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            // branches are polled in order: everything the remote already
            // sent is handled before a queued request is served, so a
            // cancel always beats the piece it cancels.
            select! {
                biased;
                _ = tick_interval.tick() => {
                    let r = self.on_tick().await;
                    self.check(r)?;
                }
                msg = self.state.rx.recv() => {
                    match msg {
                        Some(PeerMsg::Quit) | None => {
                            debug!("{remote} quit");
                            return Ok(());
                        }
                        Some(msg) => {
                            let r = self.handle_peer_msg(msg).await;
                            self.check(r)?;
                        }
                    }
                }
                msg = self.state.stream.next() => {
                    match msg {
                        Some(Ok(msg)) => {
                            let r = self.handle_message(msg).await;
                            self.check(r)?;
                        }
                        Some(Err(e)) => return Err(e),
                        None => return Err(Error::PeerClosedSocket),
                    }
                }
                // one request per turn
                _ = std::future::ready(()), if self.can_serve_next() => {
                    let r = self.serve_next().await;
                    self.check(r)?;
                }
            }
        }
    }

    /// Keep the connection open on errors scoped to a request or a piece.
    fn check(&self, r: Result<(), Error>) -> Result<(), Error> {
        match r {
            Err(e) if !e.closes_connection() => {
                debug!("{} {e}", self.remote_addr());
                Ok(())
            }
            r => r,
        }
    }

    /// Write a message to the socket, after the shaper granted its bytes.
    ///
    /// Requests while the peer chokes us and pieces while we choke the peer
    /// are never written, they are logged and dropped.
    pub async fn send(&mut self, msg: Message) -> Result<(), Error> {
        let remote = self.remote_addr();

        if !self.state.choke.allows_outbound(&msg) {
            debug!(
                "{remote} not sending {:?} in state {}",
                msg.id(),
                self.state.choke.log()
            );
            return Ok(());
        }

        self.state.ctx.shaper.acquire_upload(msg.len()).await;
        self.state.sink.send(msg).await?;
        self.state.last_sent = Instant::now();

        Ok(())
    }

    async fn on_tick(&mut self) -> Result<(), Error> {
        let remote = self.remote_addr();
        let config = self.state.torrent_ctx.config.clone();
        let now = Instant::now();

        if now.saturating_duration_since(self.state.last_received)
            >= config.idle_timeout()
        {
            info!("{remote} idle for too long");
            return Err(Error::PeerIdle);
        }

        if now.saturating_duration_since(self.state.last_sent)
            >= config.keep_alive_interval()
        {
            trace!("{remote} > keep_alive");
            self.send(Message::KeepAlive).await?;
        }

        self.check_request_timeout(now).await?;
        self.request_blocks().await?;
        self.send_snapshot().await?;

        Ok(())
    }

    /// Cancel requests that the peer is not answering, send them again once
    /// and then give them back to the torrent.
    async fn check_request_timeout(&mut self, now: Instant) -> Result<(), Error> {
        let remote = self.remote_addr();
        let timed_out =
            self.state.pipeline.take_timed_out(now, self.state.last_block);

        let mut abandoned = Vec::new();

        for t in timed_out {
            match t {
                TimedOut::Retry(info) => {
                    debug!("{remote} re-requesting timed out block {info:?}");
                    self.send(Message::Cancel(info)).await?;
                    self.send(Message::Request(info)).await?;
                }
                TimedOut::Abandon(info) => {
                    debug!("{remote} giving up on block {info:?}");
                    self.send(Message::Cancel(info)).await?;
                    abandoned.push(info);
                }
            }
        }

        self.return_blocks(abandoned).await
    }

    /// Ask the torrent for blocks to fill the free slots of the pipeline.
    pub async fn request_blocks(&mut self) -> Result<(), Error> {
        let choke = &self.state.choke;
        if !choke.am_interested || !choke.can_request() {
            return Ok(());
        }

        let qnt = self.state.pipeline.available_slots();
        if qnt == 0 {
            return Ok(());
        }

        let (otx, orx) = oneshot::channel();
        self.state
            .torrent_ctx
            .tx
            .send(TorrentMsg::RequestBlocks {
                id: self.id().clone(),
                qnt,
                recipient: otx,
            })
            .await?;

        let blocks = orx.await?;
        self.request(blocks).await
    }

    /// Put blocks in the pipeline and send their requests. Blocks that do
    /// not fit go back to the torrent.
    async fn request(&mut self, blocks: Vec<BlockInfo>) -> Result<(), Error> {
        if blocks.is_empty() {
            return Ok(());
        }

        let remote = self.remote_addr();
        let now = Instant::now();
        let mut returned = Vec::new();

        debug!("{remote} > request {} blocks", blocks.len());

        for info in blocks {
            if !self.state.choke.can_request() {
                returned.push(info);
                continue;
            }
            match self.state.pipeline.request_block(info, now) {
                Ok(true) => self.send(Message::Request(info)).await?,
                Ok(false) => {}
                Err(Error::PipelineFull) | Err(Error::InvalidBlock(_)) => {
                    returned.push(info);
                }
                Err(e) => return Err(e),
            }
        }

        self.return_blocks(returned).await
    }

    async fn return_blocks(&mut self, blocks: Vec<BlockInfo>) -> Result<(), Error> {
        if blocks.is_empty() {
            return Ok(());
        }
        self.state
            .torrent_ctx
            .tx
            .send(TorrentMsg::ReturnBlocks(self.id().clone(), blocks))
            .await?;
        Ok(())
    }

    async fn send_snapshot(&mut self) -> Result<(), Error> {
        let snapshot = self.snapshot();
        self.state.torrent_ctx.tx.send(TorrentMsg::PeerSnapshot(snapshot)).await?;
        Ok(())
    }

    /// Send interested or not interested when the answer changed.
    async fn update_interest(&mut self) -> Result<(), Error> {
        let remote = self.remote_addr();
        let interested = self.state.pieces.is_interesting(&self.state.local_pieces);

        if self.state.choke.set_am_interested(interested) {
            if interested {
                debug!("{remote} > interested");
                self.send(Message::Interested).await?;
            } else {
                // sorry, you're not the problem, it's me.
                debug!("{remote} > not_interested");
                self.send(Message::NotInterested).await?;
            }
        }

        Ok(())
    }

    /// Handle a message of the remote peer.
    pub async fn handle_message(&mut self, msg: Message) -> Result<(), Error> {
        let remote = self.remote_addr();

        self.state.last_received = Instant::now();
        self.state.ctx.shaper.acquire_download(msg.len()).await;

        match msg {
            Message::KeepAlive => {
                trace!("{remote} < keep_alive");
            }
            Message::Choke => {
                debug!("{remote} < choke");
                if self.state.choke.remote_choke() {
                    // the remote discards our pending requests when it
                    // chokes, they have to be assigned again.
                    let blocks = self.state.pipeline.drain();
                    self.return_blocks(blocks).await?;
                }
            }
            Message::Unchoke => {
                debug!("{remote} < unchoke");
                if self.state.choke.remote_unchoke() {
                    self.request_blocks().await?;
                }
            }
            Message::Interested => {
                debug!("{remote} < interested");
                if self.state.choke.remote_interested() {
                    self.send_snapshot().await?;
                }
            }
            Message::NotInterested => {
                debug!("{remote} < not_interested");
                if self.state.choke.remote_not_interested() {
                    self.send_snapshot().await?;
                }
            }
            Message::Have(index) => {
                trace!("{remote} < have {index}");
                if self.state.pieces.on_have(index)? {
                    self.state
                        .torrent_ctx
                        .tx
                        .send(TorrentMsg::PeerHave(self.id().clone(), index))
                        .await?;
                    self.update_interest().await?;
                }
            }
            Message::Bitfield(bitfield) => {
                debug!("{remote} < bitfield");
                self.state.pieces.on_bitfield(bitfield)?;
                self.state
                    .torrent_ctx
                    .tx
                    .send(TorrentMsg::PeerBitfield(
                        self.id().clone(),
                        self.state.pieces.pieces().clone(),
                    ))
                    .await?;
                self.update_interest().await?;
            }
            Message::Request(info) => {
                trace!("{remote} < request {info:?}");
                self.on_request(info)?;
            }
            Message::Piece(block) => {
                trace!("{remote} < piece {} {}", block.index, block.begin);
                self.on_piece(block).await?;
            }
            Message::Cancel(info) => {
                trace!("{remote} < cancel {info:?}");
                self.state.incoming.retain(|v| *v != info);
            }
            Message::Port(port) => {
                debug!("{remote} < port {port}");
                self.state
                    .torrent_ctx
                    .tx
                    .send(TorrentMsg::DhtNode(SocketAddr::new(remote.ip(), port)))
                    .await?;
            }
        }

        Ok(())
    }

    /// Queue a request of the remote to be served.
    fn on_request(&mut self, info: BlockInfo) -> Result<(), Error> {
        let remote = self.remote_addr();

        if !self.state.choke.can_serve() {
            debug!("{remote} requested {info:?} while choked, ignoring");
            return Ok(());
        }

        if !self.state.torrent_ctx.meta.is_valid_block(&info) {
            return Err(Error::violation(format!("invalid request {info:?}")));
        }

        if !self.state.local_pieces.has(info.index as usize) {
            return Err(Error::violation(format!(
                "request of piece {} which we don't have",
                info.index
            )));
        }

        if self.state.incoming.contains(&info) {
            return Ok(());
        }

        if self.state.incoming.len() >= self.state.pipeline.max_depth() {
            debug!("{remote} too many queued requests, dropping {info:?}");
            return Ok(());
        }

        self.state.incoming.push_back(info);
        Ok(())
    }

    fn can_serve_next(&self) -> bool {
        !self.state.incoming.is_empty() && self.state.choke.can_serve()
    }

    async fn serve_next(&mut self) -> Result<(), Error> {
        let remote = self.remote_addr();
        let Some(info) = self.state.incoming.pop_front() else { return Ok(()) };

        match self.state.torrent_ctx.storage.read_block(info).await {
            Ok(data) => {
                trace!("{remote} > piece {} {}", info.index, info.begin);
                self.send(Message::Piece(Block::new(info.index, info.begin, data)))
                    .await?;
            }
            Err(e) => {
                warn!("{remote} could not read {info:?} from storage: {e}");
            }
        }

        Ok(())
    }

    /// Handle a new Piece msg from the peer, a Piece msg actually sends
    /// a block, and not a piece.
    async fn on_piece(&mut self, block: Block) -> Result<(), Error> {
        let remote = self.remote_addr();

        let Some(info) = self.state.pipeline.on_block_received(&block) else {
            self.state.unsolicited += 1;
            debug!("{remote} discarding unsolicited block {:?}", block.info());
            return Ok(());
        };

        self.state.last_block = Instant::now();
        let torrent_tx = self.state.torrent_ctx.tx.clone();

        match self.state.torrent_ctx.storage.write_block(block).await {
            Ok(()) => {
                torrent_tx.send(TorrentMsg::BlockStored(self.id().clone(), info)).await?;
            }
            Err(Error::CorruptPiece(index)) => {
                warn!("{remote} piece {index} is corrupted");
                torrent_tx.send(TorrentMsg::PieceCorrupt(index)).await?;
            }
            Err(e) => {
                warn!("{remote} could not write {info:?} to storage: {e}");
                self.return_blocks(vec![info]).await?;
            }
        }

        // refill before the pipeline runs dry
        let pipeline = &self.state.pipeline;
        if pipeline.available_slots() * 2 >= pipeline.max_depth() {
            self.request_blocks().await?;
        }

        Ok(())
    }

    /// Handle a message of the torrent.
    pub async fn handle_peer_msg(&mut self, msg: PeerMsg) -> Result<(), Error> {
        let remote = self.remote_addr();

        match msg {
            PeerMsg::Choke => {
                if self.state.choke.set_am_choking(true) {
                    debug!("{remote} > choke");
                    self.state.incoming.clear();
                    self.send(Message::Choke).await?;
                }
            }
            PeerMsg::Unchoke => {
                if self.state.choke.set_am_choking(false) {
                    debug!("{remote} > unchoke");
                    self.send(Message::Unchoke).await?;
                }
            }
            PeerMsg::HavePiece(index) => {
                self.state.local_pieces.set(index as usize, true);

                if !self.state.pieces.has_piece(index) {
                    trace!("{remote} > have {index}");
                    self.send(Message::Have(index)).await?;
                }
                self.update_interest().await?;
            }
            PeerMsg::CancelBlock(info) => {
                if self.state.pipeline.cancel(info.key()).is_some() {
                    debug!("{remote} > cancel {info:?}");
                    self.send(Message::Cancel(info)).await?;
                }
            }
            // handled by the event loop
            PeerMsg::Quit => {}
        }

        Ok(())
    }

    /// Tear the connection down: give the pending requests back to the
    /// torrent and deregister from it. Safe to call more than once.
    ///
    /// On a local close the remote gets cancels for our pending requests.
    pub async fn disconnect(&mut self, reason: DisconnectReason) {
        if matches!(
            self.state.connection,
            ConnectionState::Closing | ConnectionState::Closed
        ) {
            return;
        }

        let remote = self.remote_addr();
        let torrent_tx = self.state.torrent_ctx.tx.clone();
        self.state.connection = ConnectionState::Closing;

        let blocks = self.state.pipeline.drain();
        self.state.incoming.clear();

        debug!("{remote} disconnecting, freeing {} blocks", blocks.len());

        if reason == DisconnectReason::Local {
            let sink = &mut self.state.sink;
            let _ = timeout(CLOSE_TIMEOUT, async {
                for info in &blocks {
                    sink.feed(Message::Cancel(*info)).await?;
                }
                sink.close().await
            })
            .await;
        }

        if !blocks.is_empty() {
            let _ = torrent_tx
                .send(TorrentMsg::ReturnBlocks(self.id().clone(), blocks))
                .await;
        }

        let _ = torrent_tx
            .send(TorrentMsg::PeerDisconnected {
                id: self.id().clone(),
                addr: remote,
                reason,
                misbehavior: self.misbehavior(),
            })
            .await;

        self.state.connection = ConnectionState::Closed;
    }
}
