//! The session owns the listening socket and every torrent, and routes
//! inbound connections to the torrent they handshaked for.
use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use hashbrown::HashMap;
use tokio::{
    net::{TcpListener, TcpStream},
    select, spawn,
    sync::{mpsc, oneshot, RwLock},
    task::{JoinHandle, JoinSet},
    time::sleep,
};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::{
    config::Config,
    error::Error,
    peer::{handshake::read_handshake, PeerId},
    shaper::TrafficShaper,
    storage::Storage,
    torrent::{InfoHash, SwarmEvent, Torrent, TorrentHandle, TorrentMeta, TorrentMsg},
    wire::HandshakeCodec,
};

/// Context of the [`Session`] that is shared with the accept loop.
pub struct SessionCtx {
    pub config: Arc<Config>,
    pub local_peer_id: PeerId,
    /// Parent of every connection of every torrent.
    pub shaper: Arc<TrafficShaper>,
    /// key: info_hash
    pub torrents: RwLock<HashMap<InfoHash, TorrentHandle>>,
    pub events: mpsc::UnboundedSender<SwarmEvent>,
    /// Set by [`Session::stop`], no torrent can be added or reached after.
    pub stopped: AtomicBool,
}

/// The accept loop of a started session.
struct Listener {
    local_addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Entry point of the engine, see the crate docs for an example.
pub struct Session {
    pub ctx: Arc<SessionCtx>,
    listener: Option<Listener>,
}

impl Session {
    /// Create a session and the stream of the events of all its torrents.
    pub fn new(config: Config) -> (Self, mpsc::UnboundedReceiver<SwarmEvent>) {
        Self::with_peer_id(config, PeerId::generate())
    }

    pub fn with_peer_id(
        config: Config,
        local_peer_id: PeerId,
    ) -> (Self, mpsc::UnboundedReceiver<SwarmEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();

        let ctx = Arc::new(SessionCtx {
            shaper: Arc::new(TrafficShaper::new(
                config.upload_limit,
                config.download_limit,
            )),
            config: Arc::new(config),
            local_peer_id,
            torrents: RwLock::new(HashMap::new()),
            events,
            stopped: AtomicBool::new(false),
        });

        (Self { ctx, listener: None }, events_rx)
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.ctx.local_peer_id
    }

    /// Address of the listener, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().map(|l| l.local_addr)
    }

    fn ensure_running(&self) -> Result<(), Error> {
        if self.ctx.stopped.load(Ordering::Acquire) {
            return Err(Error::SessionStopped);
        }
        Ok(())
    }

    /// Register a torrent and spawn its event loop.
    pub async fn add_torrent(
        &self,
        meta: TorrentMeta,
        storage: Arc<dyn Storage>,
    ) -> Result<TorrentHandle, Error> {
        self.ensure_running()?;

        let info_hash = meta.info_hash.clone();
        let mut torrents = self.ctx.torrents.write().await;

        if torrents.contains_key(&info_hash) {
            return Err(Error::NoDuplicateTorrent);
        }

        let (mut torrent, handle) = Torrent::new(
            meta,
            storage,
            self.ctx.shaper.clone(),
            self.ctx.config.clone(),
            self.ctx.local_peer_id.clone(),
            self.ctx.events.clone(),
        )
        .await?;

        spawn(async move {
            if let Err(e) = torrent.run().await {
                warn!("torrent {} stopped: {e}", torrent.ctx.info_hash);
            }
        });

        info!("added torrent {info_hash}");
        torrents.insert(info_hash, handle.clone());

        Ok(handle)
    }

    pub async fn torrent(&self, info_hash: &InfoHash) -> Option<TorrentHandle> {
        self.ctx.torrents.read().await.get(info_hash).cloned()
    }

    /// Stop a torrent, closing all of its connections.
    pub async fn remove_torrent(&self, info_hash: &InfoHash) -> Result<(), Error> {
        let handle = self
            .ctx
            .torrents
            .write()
            .await
            .remove(info_hash)
            .ok_or_else(|| Error::TorrentDoesNotExist(info_hash.clone()))?;

        handle.quit().await
    }

    /// Give an address to a torrent, to connect to it when there is room.
    pub async fn connect(&self, info_hash: &InfoHash, addr: SocketAddr) -> Result<(), Error> {
        self.ensure_running()?;

        let handle = self
            .torrent(info_hash)
            .await
            .ok_or_else(|| Error::TorrentDoesNotExist(info_hash.clone()))?;

        handle.add_peer(addr).await
    }

    /// Listen for inbound connections on `listen_port` of every interface,
    /// 0 picks a free port. Returns the bound address.
    #[tracing::instrument(name = "session::start", skip(self))]
    pub async fn start(&mut self, listen_port: u16) -> Result<SocketAddr, Error> {
        self.ensure_running()?;
        if let Some(listener) = &self.listener {
            return Ok(listener.local_addr);
        }

        let listener = TcpListener::bind(("0.0.0.0", listen_port)).await?;
        let local_addr = listener.local_addr()?;

        info!("listening on {local_addr}");

        let (shutdown, shutdown_rx) = oneshot::channel();
        let task = spawn(Self::accept_loop(listener, self.ctx.clone(), shutdown_rx));
        self.listener = Some(Listener { local_addr, shutdown, task });

        Ok(local_addr)
    }

    /// Accept connections until `shutdown` fires, then close the listener
    /// and abort the handshakes still being routed.
    async fn accept_loop(
        listener: TcpListener,
        ctx: Arc<SessionCtx>,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        let mut routing = JoinSet::new();

        loop {
            select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok((socket, addr)) => {
                        debug!("{addr} accepted");
                        let ctx = ctx.clone();
                        routing.spawn(async move {
                            if let Err(e) = Self::route_inbound(socket, ctx).await {
                                debug!("{addr} inbound connection refused: {e}");
                            }
                        });
                    }
                    Err(e) => {
                        // usually too many open files, give it some time.
                        warn!("accept failed: {e}");
                        sleep(Duration::from_millis(100)).await;
                    }
                },
                Some(_) = routing.join_next(), if !routing.is_empty() => {}
            }
        }

        drop(listener);
        routing.shutdown().await;
    }

    /// Read the handshake of an inbound connection and hand it to its
    /// torrent. Connections for unknown torrents are dropped.
    async fn route_inbound(socket: TcpStream, ctx: Arc<SessionCtx>) -> Result<(), Error> {
        let mut socket = Framed::new(socket, HandshakeCodec);
        let handshake = read_handshake(&mut socket, ctx.config.handshake_timeout()).await?;

        let handle = ctx
            .torrents
            .read()
            .await
            .get(&handshake.info_hash)
            .cloned()
            .ok_or(Error::UnknownTorrent)?;

        handle.tx.send(TorrentMsg::InboundPeer { socket, handshake }).await?;
        Ok(())
    }

    /// Stop accepting connections and stop every torrent, returning once the
    /// listening socket is released and all connections are closed.
    pub async fn stop(&mut self) {
        self.ctx.stopped.store(true, Ordering::Release);

        if let Some(Listener { shutdown, task, .. }) = self.listener.take() {
            let _ = shutdown.send(());
            if let Err(e) = task.await {
                warn!("accept loop ended abnormally: {e}");
            }
        }

        let torrents: Vec<TorrentHandle> =
            self.ctx.torrents.write().await.drain().map(|(_, h)| h).collect();

        for handle in torrents {
            if let Err(e) = handle.quit().await {
                debug!("torrent {} was already stopped: {e}", handle.info_hash);
            }
        }

        info!("session stopped");
    }

    pub fn shaper(&self) -> &Arc<TrafficShaper> {
        &self.ctx.shaper
    }

    /// Change the global rate limits in bytes per second, 0 is unlimited.
    pub fn set_limits(&self, upload_limit: u64, download_limit: u64) {
        self.ctx.shaper.update(upload_limit, download_limit);
    }

    pub fn download_speed(&self) -> u64 {
        self.ctx.shaper.download_speed()
    }

    pub fn upload_speed(&self) -> u64 {
        self.ctx.shaper.upload_speed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    #[tokio::test]
    async fn duplicate_torrent() {
        let (session, _events) = Session::new(Config::default());
        let meta = TorrentMeta::new(InfoHash([1; 20]), 16384, 16384).unwrap();
        let storage = Arc::new(MemoryStorage::seeded(meta.clone(), vec![0; 16384]));

        session.add_torrent(meta.clone(), storage.clone()).await.unwrap();
        assert!(matches!(
            session.add_torrent(meta.clone(), storage).await,
            Err(Error::NoDuplicateTorrent)
        ));

        let handle = session.torrent(&meta.info_hash).await.unwrap();
        assert!(handle.bitfield().await.unwrap().all());

        session.remove_torrent(&meta.info_hash).await.unwrap();
        assert!(session.torrent(&meta.info_hash).await.is_none());
        assert!(matches!(
            session.connect(&meta.info_hash, "127.0.0.1:1".parse().unwrap()).await,
            Err(Error::TorrentDoesNotExist(_))
        ));
    }

    #[tokio::test]
    async fn start_on_a_free_port() {
        let (mut session, _events) = Session::new(Config::default());
        let addr = session.start(0).await.unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(session.local_addr(), Some(addr));
        session.stop().await;
    }

    #[tokio::test]
    async fn stop_releases_the_listener() {
        use tokio::io::AsyncReadExt;

        let (mut session, _events) = Session::new(Config::default());
        let port = session.start(0).await.unwrap().port();

        // connected but the handshake never arrives, its routing task is
        // still waiting when the session stops.
        let mut half_open = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        sleep(Duration::from_millis(50)).await;

        session.stop().await;
        assert_eq!(session.local_addr(), None);

        // default handshake timeout is 10s, the socket is closed long before
        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(
            Duration::from_secs(2),
            half_open.read(&mut buf),
        )
        .await
        .unwrap();
        assert!(matches!(read, Ok(0) | Err(_)));

        TcpListener::bind(("0.0.0.0", port)).await.unwrap();
    }

    #[tokio::test]
    async fn stopped_session_rejects_work() {
        let (mut session, _events) = Session::new(Config::default());
        session.stop().await;

        let meta = TorrentMeta::new(InfoHash([2; 20]), 16384, 16384).unwrap();
        let storage = Arc::new(MemoryStorage::seeded(meta.clone(), vec![0; 16384]));

        assert!(matches!(
            session.add_torrent(meta.clone(), storage).await,
            Err(Error::SessionStopped)
        ));
        assert!(matches!(
            session.connect(&meta.info_hash, "127.0.0.1:1".parse().unwrap()).await,
            Err(Error::SessionStopped)
        ));
        assert!(matches!(session.start(0).await, Err(Error::SessionStopped)));
    }
}
