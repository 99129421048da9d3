use std::{net::SocketAddr, path::PathBuf};

use clap::Parser;

/// CLI flags of the daemon. These values take preference over the values
/// of the config file.
#[derive(Parser, Debug)]
#[clap(name = "peerwired")]
#[command(author, version, about, long_about = None)]
pub(crate) struct Args {
    /// Path of the config file, defaults to the config dir of the user.
    #[clap(short, long)]
    pub config: Option<PathBuf>,

    /// Accept peer connections on this port.
    #[clap(short, long)]
    pub listen_port: Option<u16>,

    /// Info hash of the torrent, 40 hex characters.
    #[clap(short, long)]
    pub info_hash: String,

    /// Size of the content in bytes.
    #[clap(long)]
    pub length: u64,

    #[clap(long, default_value_t = 262_144)]
    pub piece_length: u32,

    /// Start with every piece, only upload.
    #[clap(short, long)]
    pub seed: bool,

    /// Connect to this peer, may be repeated.
    #[clap(short, long = "peer")]
    pub peers: Vec<SocketAddr>,

    /// Global upload limit in bytes per second, 0 is unlimited.
    #[clap(long)]
    pub upload_limit: Option<u64>,

    /// Global download limit in bytes per second, 0 is unlimited.
    #[clap(long)]
    pub download_limit: Option<u64>,

    /// Quit once every piece was downloaded.
    #[clap(short, long)]
    pub quit_after_complete: bool,
}
