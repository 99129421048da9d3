use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::{error::Error, wire::MAX_FRAME_LEN};

/// Tunables of the engine. Every field has a default, so a partial or empty
/// config file is valid.
///
/// Limits are in bytes per second and `0` means unlimited.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Port of the TCP listener for inbound peers.
    pub listen_port: u16,
    /// Frames declaring a bigger length close the connection.
    pub max_frame_len: usize,
    /// Max outstanding block requests per peer.
    pub max_pipeline_depth: usize,
    pub request_timeout_secs: u64,
    /// How many times a timed out request is sent again to the same peer
    /// before it is given to another one.
    pub max_request_retries: u32,
    pub handshake_timeout_secs: u64,
    /// Idle time before a keep-alive is sent, twice this without hearing
    /// from the peer closes the connection.
    pub keep_alive_interval_secs: u64,
    /// Period of the per connection housekeeping, in millis.
    pub tick_millis: u64,
    /// Period of the choke policy.
    pub unchoke_interval_secs: u64,
    /// Number of peers unchoked by the default choke policy, not counting
    /// the optimistic slot.
    pub upload_slots: usize,
    pub max_peers_per_torrent: usize,
    pub connect_timeout_secs: u64,
    pub reconnect_interval_secs: u64,
    pub max_reconnect_attempts: u32,
    /// Session wide upload limit.
    pub upload_limit: u64,
    /// Session wide download limit.
    pub download_limit: u64,
    pub peer_upload_limit: u64,
    pub peer_download_limit: u64,
    /// If set, the DHT bit is advertised and this port is sent to peers
    /// that support it.
    pub dht_port: Option<u16>,
    /// Threads of the runtime of the node binary, tokio decides if unset.
    pub worker_threads: Option<usize>,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_port: 51413,
            max_frame_len: MAX_FRAME_LEN,
            max_pipeline_depth: 250,
            request_timeout_secs: 15,
            max_request_retries: 1,
            handshake_timeout_secs: 10,
            keep_alive_interval_secs: 120,
            tick_millis: 1000,
            unchoke_interval_secs: 10,
            upload_slots: 4,
            max_peers_per_torrent: 50,
            connect_timeout_secs: 5,
            reconnect_interval_secs: 30,
            max_reconnect_attempts: 3,
            upload_limit: 0,
            download_limit: 0,
            peer_upload_limit: 0,
            peer_download_limit: 0,
            dht_port: None,
            worker_threads: None,
            log_level: "info".into(),
        }
    }
}

impl Config {
    /// Path of the config file in the user's config folder,
    /// `<config dir>/peerwire/config.toml`.
    pub fn default_path() -> Result<PathBuf, Error> {
        let dirs =
            ProjectDirs::from("", "", "peerwire").ok_or(Error::HomeInvalid)?;
        Ok(dirs.config_dir().join("config.toml"))
    }

    /// Load the config file from the default path.
    pub async fn load() -> Result<Self, Error> {
        Self::load_from(Self::default_path()?).await
    }

    /// Load the config from `path`. A missing file gives the defaults, a
    /// malformed one is an error.
    pub async fn load_from(path: impl AsRef<Path>) -> Result<Self, Error> {
        match fs::read_to_string(path.as_ref()).await {
            Ok(s) => Self::parse(&s),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn parse(s: &str) -> Result<Self, Error> {
        let config: Config = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), Error> {
        if self.max_pipeline_depth == 0 {
            return Err(Error::Config("max_pipeline_depth must be > 0".into()));
        }
        if self.max_frame_len < crate::wire::BLOCK_LEN as usize + 13 {
            return Err(Error::Config(
                "max_frame_len must fit a piece message of a full block".into(),
            ));
        }
        if self.tick_millis == 0 {
            return Err(Error::Config("tick_millis must be > 0".into()));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_secs(self.keep_alive_interval_secs)
    }

    /// Silence from the peer after which the connection is dead.
    pub fn idle_timeout(&self) -> Duration {
        self.keep_alive_interval() * 2
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_millis)
    }

    pub fn unchoke_interval(&self) -> Duration {
        Duration::from_secs(self.unchoke_interval_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval_secs)
    }
}
