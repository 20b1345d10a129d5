use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApplicationError {
    /// Bencode input could not be decoded
    #[error("malformed encoding: {0}")]
    MalformedEncoding(String),

    /// A torrent file is missing a required field or has one of the wrong type
    #[error("invalid metadata: {0}")]
    InvalidMetadata(String),

    /// The remote side answered the handshake with something else
    #[error("protocol mismatch: {0}")]
    ProtocolMismatch(String),

    /// I/O failure or malformed frame on a single peer connection
    #[error("connection error: {0}")]
    ConnectionError(String),

    /// A fully assembled piece did not match its expected digest
    #[error("hash mismatch for piece {index}")]
    HashMismatch { index: u32 },

    #[error("tracker unavailable: {0}")]
    TrackerUnavailable(String),

    /// Every known peer failed and no request can make progress
    #[error("download stalled: no usable peers left")]
    DownloadStalled,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ApplicationError {
    pub(crate) fn connection(e: impl std::fmt::Display) -> Self {
        Self::ConnectionError(e.to_string())
    }
}
