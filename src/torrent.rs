use sha1::{Digest, Sha1};
use std::fs;
use std::path::Path;
use tracing::info;

use crate::bencode::{self, Value};
use crate::error::ApplicationError;

/// Size of a SHA-1 digest, used for both piece hashes and the info-hash
pub const HASH_LEN: usize = 20;

/// Represents a parsed single-file .torrent
#[derive(Debug, Clone)]
pub struct Torrent {
    pub announce:     String,
    pub name:         String,
    pub total_length: u64,
    pub piece_length: u64,
    pub piece_hashes: Vec<[u8; HASH_LEN]>,
    pub info_hash:    [u8; HASH_LEN],
}

impl Torrent {
    /// Reads a `.torrent` file from disk and parses it into a [`Torrent`] struct
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ApplicationError> {
        let data = fs::read(path.as_ref())?;
        Self::from_bytes(&data)
    }

    /// Parses raw torrent-file bytes.
    ///
    /// The info-hash is taken over the canonical re-encoding of the `info`
    /// dictionary, so it does not depend on the key order in the file.
    pub fn from_bytes(data: &[u8]) -> Result<Self, ApplicationError> {
        let root = bencode::decode_exact(data)?;
        if root.as_dict().is_none() {
            return Err(invalid("top level is not a dictionary"));
        }

        let announce = root
            .get(b"announce")
            .and_then(Value::as_str)
            .ok_or_else(|| invalid("missing or mistyped 'announce'"))?
            .to_string();

        let info = root
            .get(b"info")
            .filter(|v| v.as_dict().is_some())
            .ok_or_else(|| invalid("missing or mistyped 'info'"))?;

        if info.get(b"files").is_some() {
            return Err(invalid("multi-file torrents are not supported"));
        }

        let name = info
            .get(b"name")
            .and_then(Value::as_str)
            .ok_or_else(|| invalid("missing or mistyped 'info.name'"))?
            .to_string();

        let total_length = positive(info, "length")?;
        let piece_length = positive(info, "piece length")?;
        // Block offsets inside a piece travel as u32 on the wire
        if piece_length > u32::MAX as u64 {
            return Err(invalid(format!("piece length {} does not fit in 32 bits", piece_length)));
        }

        let pieces = info
            .get(b"pieces")
            .and_then(Value::as_bytes)
            .ok_or_else(|| invalid("missing or mistyped 'info.pieces'"))?;

        if pieces.len() % HASH_LEN != 0 {
            return Err(invalid(format!(
                "'info.pieces' length {} is not a multiple of {}",
                pieces.len(),
                HASH_LEN
            )));
        }

        let piece_hashes: Vec<[u8; HASH_LEN]> = pieces
            .chunks_exact(HASH_LEN)
            .map(|chunk| {
                let mut arr = [0u8; HASH_LEN];
                arr.copy_from_slice(chunk);
                arr
            })
            .collect();

        let expected = total_length.div_ceil(piece_length);
        if piece_hashes.len() as u64 != expected {
            return Err(invalid(format!(
                "{} piece hashes for {} bytes in pieces of {} (expected {})",
                piece_hashes.len(),
                total_length,
                piece_length,
                expected
            )));
        }

        Ok(Torrent {
            announce,
            name,
            total_length,
            piece_length,
            piece_hashes,
            info_hash: info_hash(info),
        })
    }

    /// Returns the SHA1 info hash as a hexadecimal string
    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }

    /// Returns the number of pieces the torrent is divided into
    pub fn pieces_count(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Returns the size of piece `index` in bytes.
    ///
    /// Every piece has the declared length except the last one, which holds
    /// whatever remains of the file.
    pub fn piece_size(&self, index: usize) -> u64 {
        let start = index as u64 * self.piece_length;
        self.piece_length.min(self.total_length.saturating_sub(start))
    }

    pub fn log_info(&self) {
        info!(
            name         = %self.name,
            announce     = %self.announce,
            info_hash    = %self.info_hash_hex(),
            piece_length = self.piece_length,
            pieces       = self.pieces_count(),
            total_size   = self.total_length,
            "loaded torrent"
        );
    }
}

/// Computes the SHA1 hash of the canonically bencoded `info` dictionary
pub fn info_hash(info: &Value) -> [u8; HASH_LEN] {
    let digest = Sha1::digest(bencode::encode(info));
    let mut arr = [0u8; HASH_LEN];
    arr.copy_from_slice(&digest);
    arr
}

fn positive(info: &Value, key: &str) -> Result<u64, ApplicationError> {
    info.get(key.as_bytes())
        .and_then(Value::as_integer)
        .filter(|n| *n > 0)
        .map(|n| n as u64)
        .ok_or_else(|| invalid(format!("missing or mistyped 'info.{}'", key)))
}

fn invalid(msg: impl Into<String>) -> ApplicationError {
    ApplicationError::InvalidMetadata(msg.into())
}
