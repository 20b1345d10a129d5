use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use torrentz::{
    config::{Args, Config},
    error::ApplicationError,
    scheduler::Scheduler,
    sink::FileSink,
    torrent::Torrent,
    tracker::{Announce, Tracker},
};

/// Base delay between announces; grows linearly with each attempt
const RETRY_DELAY: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<(), ApplicationError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args   = Args::parse();
    let config = Config::try_from(&args)?;

    // Load torrent file and log what we are about to fetch
    let torrent = Torrent::from_file(&args.torrent)?;
    torrent.log_info();

    let output = args
        .output
        .clone()
        .unwrap_or_else(|| PathBuf::from(&torrent.name));
    let sink = FileSink::create(&output, torrent.total_length, torrent.piece_length)?;

    let tracker       = Tracker::new(config.tracker_timeout)?;
    let mut scheduler = Scheduler::new(&torrent, config.clone(), sink);

    for attempt in 1..=config.announce_attempts {
        let announce = Announce {
            url:        &torrent.announce,
            info_hash:  &torrent.info_hash,
            peer_id:    &config.peer_id,
            port:       config.listen_port,
            uploaded:   0,
            downloaded: torrent.total_length - scheduler.remaining_bytes(),
            left:       scheduler.remaining_bytes(),
        };

        match tracker.announce(&announce).await {
            Ok(peers) if peers.is_empty() => {
                warn!(attempt, "tracker returned no peers");
            }
            Ok(peers) => match scheduler.run(peers).await {
                Ok(()) => {
                    info!(path = %output.display(), "download complete");
                    return Ok(());
                }
                Err(ApplicationError::DownloadStalled) => {
                    warn!(attempt, "download stalled, asking the tracker again");
                }
                Err(e) => return Err(e),
            },
            Err(e) => {
                warn!(attempt, error = %e, "announce failed");
            }
        }

        if attempt < config.announce_attempts {
            tokio::time::sleep(RETRY_DELAY * attempt).await;
        }
    }

    Err(ApplicationError::DownloadStalled)
}
