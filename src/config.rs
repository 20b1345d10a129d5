use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ApplicationError;
use crate::protocol::{MAX_BLOCK_LEN, PROTOCOL_ID, PROTOCOL_ID_LEN};

/// Default size of a block request (16 KiB)
pub const BLOCK_SIZE: u32 = 16 * 1024;

const PEER_ID: [u8; 20] = *b"-RU0001-123456789010";

/// Runtime settings shared by the tracker client, peer sessions and scheduler.
#[derive(Debug, Clone)]
pub struct Config {
    /// Identifier sent in the handshake and to the tracker
    pub peer_id:           [u8; 20],
    /// Protocol string expected in both directions of the handshake
    pub protocol:          [u8; PROTOCOL_ID_LEN],
    /// Port reported to the tracker
    pub listen_port:       u16,
    pub block_size:        u32,
    /// Outstanding requests allowed per peer
    pub pipeline_depth:    usize,
    /// Age after which an unanswered request is issued again
    pub request_timeout:   Duration,
    /// Bound on TCP connect plus handshake
    pub connect_timeout:   Duration,
    /// A session with nothing in flight for this long is dropped
    pub idle_timeout:      Duration,
    pub max_peers:         usize,
    /// Capacity of the channel carrying session events to the scheduler
    pub event_queue_depth: usize,
    /// Reject peers that echo a different info-hash
    pub verify_info_hash:  bool,
    pub tracker_timeout:   Duration,
    pub announce_attempts: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            peer_id:           PEER_ID,
            protocol:          *PROTOCOL_ID,
            listen_port:       6881,
            block_size:        BLOCK_SIZE,
            pipeline_depth:    5,
            request_timeout:   Duration::from_secs(30),
            connect_timeout:   Duration::from_secs(10),
            idle_timeout:      Duration::from_secs(60),
            max_peers:         10,
            event_queue_depth: 64,
            verify_info_hash:  true,
            tracker_timeout:   Duration::from_secs(15),
            announce_attempts: 5,
        }
    }
}

/// Command line arguments of the `torrentz` binary
#[derive(Parser, Debug, Clone)]
#[command(name = "torrentz", about = "Download a single-file torrent", version)]
pub struct Args {
    /// Path to the .torrent file
    pub torrent: PathBuf,

    /// Where to write the file (defaults to the name inside the torrent)
    #[arg(long, short = 'o', value_name = "PATH")]
    pub output: Option<PathBuf>,

    #[arg(long, default_value_t = 6881, help = "Port reported to the tracker")]
    pub port: u16,

    #[arg(long, value_name = "ID", help = "20-byte peer id (ASCII)")]
    pub peer_id: Option<String>,

    #[arg(long, default_value_t = 10, help = "Maximum simultaneous peer connections")]
    pub max_peers: usize,

    #[arg(long, default_value_t = 5, help = "Outstanding block requests per peer")]
    pub pipeline: usize,

    #[arg(long, default_value_t = BLOCK_SIZE, value_name = "BYTES")]
    pub block_size: u32,

    #[arg(long, default_value_t = 30, value_name = "SECS", help = "Re-request blocks unanswered for this long")]
    pub request_timeout: u64,

    #[arg(long, default_value_t = 60, value_name = "SECS", help = "Drop peers that give us nothing to do for this long")]
    pub idle_timeout: u64,

    #[arg(long, default_value_t = 5, help = "Tracker announces before giving up")]
    pub announce_attempts: u32,

    #[arg(long, help = "Accept peers that echo a different info-hash")]
    pub no_verify_info_hash: bool,
}

impl TryFrom<&Args> for Config {
    type Error = ApplicationError;

    fn try_from(args: &Args) -> Result<Self, Self::Error> {
        let mut config = Config {
            listen_port:       args.port,
            max_peers:         args.max_peers,
            pipeline_depth:    args.pipeline,
            block_size:        args.block_size,
            request_timeout:   Duration::from_secs(args.request_timeout),
            idle_timeout:      Duration::from_secs(args.idle_timeout),
            announce_attempts: args.announce_attempts,
            verify_info_hash:  !args.no_verify_info_hash,
            ..Config::default()
        };

        if let Some(id) = &args.peer_id {
            config.peer_id = id.as_bytes().try_into().map_err(|_| {
                ApplicationError::Config(format!(
                    "peer id must be exactly 20 bytes, got {}",
                    id.len()
                ))
            })?;
        }

        config.validate()?;
        Ok(config)
    }
}

impl Config {
    /// Checks the values a download cannot make progress without.
    pub fn validate(&self) -> Result<(), ApplicationError> {
        if self.block_size == 0 || self.pipeline_depth == 0 || self.max_peers == 0 {
            return Err(ApplicationError::Config(
                "block size, pipeline depth and max peers must be positive".into(),
            ));
        }
        if self.block_size > MAX_BLOCK_LEN {
            return Err(ApplicationError::Config(format!(
                "block size {} exceeds the {} bytes peers accept",
                self.block_size, MAX_BLOCK_LEN
            )));
        }
        if self.request_timeout.is_zero() || self.idle_timeout.is_zero() {
            return Err(ApplicationError::Config(
                "request and idle timeouts must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_config_from_args() {
        let args = Args::parse_from([
            "torrentz",
            "file.torrent",
            "--peer-id",
            "-TZ0200-abcdefghijkl",
            "--pipeline",
            "8",
            "--no-verify-info-hash",
        ]);
        let config = Config::try_from(&args).unwrap();
        assert_eq!(&config.peer_id, b"-TZ0200-abcdefghijkl");
        assert_eq!(config.pipeline_depth, 8);
        assert!(!config.verify_info_hash);
        assert_eq!(config.block_size, BLOCK_SIZE);
    }

    #[test]
    fn rejects_short_peer_id() {
        let args = Args::parse_from(["torrentz", "file.torrent", "--peer-id", "short"]);
        assert!(matches!(
            Config::try_from(&args),
            Err(ApplicationError::Config(_))
        ));
    }

    #[test]
    fn rejects_zero_timeouts_and_oversized_blocks() {
        for extra in [
            ["--request-timeout", "0"],
            ["--idle-timeout", "0"],
            ["--block-size", "1048577"],
            ["--block-size", "0"],
        ] {
            let args = Args::parse_from(["torrentz", "file.torrent", extra[0], extra[1]]);
            assert!(
                matches!(Config::try_from(&args), Err(ApplicationError::Config(_))),
                "accepted {:?}",
                extra
            );
        }

        let args = Args::parse_from(["torrentz", "file.torrent", "--block-size", "1048576"]);
        assert_eq!(Config::try_from(&args).unwrap().block_size, MAX_BLOCK_LEN);
    }
}
