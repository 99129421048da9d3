//! A single torrent node on top of the engine, with demo content derived
//! from the info hash so that any two nodes agree on the pieces.
use std::{sync::Arc, time::Duration};

use clap::Parser;
use peerwire::{
    config::Config,
    error::Error,
    session::Session,
    storage::{piece_hashes, MemoryStorage},
    torrent::{InfoHash, SwarmEvent, TorrentMeta},
};
use tokio::{select, signal, time::interval};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

mod args;

use args::Args;

fn main() -> Result<(), Error> {
    let args = Args::parse();

    // the number of worker threads comes from the config, so the config is
    // loaded before the runtime that will use it exists.
    let mut config = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?
        .block_on(async {
            match &args.config {
                Some(path) => Config::load_from(path).await,
                None => Config::load().await,
            }
        })?;

    if let Some(port) = args.listen_port {
        config.listen_port = port;
    }
    if let Some(limit) = args.upload_limit {
        config.upload_limit = limit;
    }
    if let Some(limit) = args.download_limit {
        config.download_limit = limit;
    }

    let level = config.log_level.parse::<Level>().unwrap_or(Level::INFO);
    let subscriber = FmtSubscriber::builder()
        .without_time()
        .with_target(false)
        .with_file(false)
        .with_max_level(level)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| Error::Config(e.to_string()))?;

    let mut runtime = tokio::runtime::Builder::new_multi_thread();
    if let Some(n) = config.worker_threads {
        runtime.worker_threads(n);
    }

    runtime.enable_all().build()?.block_on(run(args, config))
}

async fn run(args: Args, config: Config) -> Result<(), Error> {
    let info_hash = InfoHash::try_from(args.info_hash.as_str())
        .map_err(|e| Error::Config(format!("invalid info hash: {e}")))?;

    let meta = TorrentMeta::new(info_hash.clone(), args.piece_length, args.length)?;
    let data = demo_content(&info_hash, args.length);

    let storage = if args.seed {
        MemoryStorage::seeded(meta.clone(), data)
    } else {
        let hashes = piece_hashes(&data, meta.piece_length);
        MemoryStorage::new(meta.clone(), hashes)
    };

    let listen_port = config.listen_port;
    let (mut session, mut events) = Session::new(config);

    let handle = session.add_torrent(meta, Arc::new(storage)).await?;
    session.start(listen_port).await?;

    for peer in args.peers {
        handle.add_peer(peer).await?;
    }

    let mut stats_interval = interval(Duration::from_secs(1));
    let ctrl_c = signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        select! {
            Some(event) = events.recv() => {
                match event {
                    SwarmEvent::TorrentComplete { info_hash } => {
                        info!("{info_hash} complete");
                        if args.quit_after_complete {
                            break;
                        }
                    }
                    SwarmEvent::PieceCompleted { piece, .. } => {
                        info!("piece {piece} downloaded");
                    }
                    event => info!("{event:?}"),
                }
            }
            _ = stats_interval.tick() => {
                info!(
                    "d: {}/s u: {}/s",
                    to_human_readable(session.download_speed() as f64),
                    to_human_readable(session.upload_speed() as f64),
                );
            }
            _ = &mut ctrl_c => {
                info!("ctrl-c received");
                break;
            }
        }
    }

    session.stop().await;

    Ok(())
}

/// Bytes of the demo content, the same for every node of an info hash.
fn demo_content(info_hash: &InfoHash, length: u64) -> Vec<u8> {
    (0..length)
        .map(|i| info_hash.0[(i % 20) as usize] ^ (i / 20) as u8)
        .collect()
}

fn to_human_readable(mut n: f64) -> String {
    let units = ["B", "KB", "MB", "GB", "TB"];
    let mut u = 0;

    while n >= 1000.0 && u < units.len() - 1 {
        n /= 1000.0;
        u += 1;
    }

    if u == 0 {
        format!("{n:.0} {}", units[u])
    } else {
        format!("{n:.2} {}", units[u])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn human_readable() {
        assert_eq!(to_human_readable(999.0), "999 B");
        assert_eq!(to_human_readable(1500.0), "1.50 KB");
        assert_eq!(to_human_readable(2_000_000.0), "2.00 MB");
    }

    #[test]
    fn demo_content_is_deterministic() {
        let hash = InfoHash([3; 20]);
        assert_eq!(demo_content(&hash, 100), demo_content(&hash, 100));
        assert_eq!(demo_content(&hash, 100).len(), 100);
        assert_ne!(demo_content(&hash, 100), demo_content(&InfoHash([4; 20]), 100));
    }
}
