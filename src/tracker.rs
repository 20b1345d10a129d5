use percent_encoding::{NON_ALPHANUMERIC, percent_encode};
use reqwest::Client;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::bencode::{self, Value};
use crate::error::ApplicationError;
use crate::peer::Peer;

/// Size of one compact peer entry: 4 bytes IPv4 address, 2 bytes port
const COMPACT_PEER_LEN: usize = 6;

/// Handles communication with a BitTorrent tracker
pub struct Tracker {
    client: Client,
}

/// Parameters of one announce request
#[derive(Debug, Clone)]
pub struct Announce<'a> {
    pub url:        &'a str,
    pub info_hash:  &'a [u8; 20],
    pub peer_id:    &'a [u8; 20],
    pub port:       u16,
    pub uploaded:   u64,
    pub downloaded: u64,
    pub left:       u64,
}

/// Represents the response returned by a tracker announce request
#[derive(Debug)]
pub struct AnnounceResponse {
    pub peers:    Vec<Peer>,
    pub interval: Option<i64>,
}

impl AnnounceResponse {
    /// Decodes a bencoded tracker response body.
    pub fn from_bytes(body: &[u8]) -> Result<Self, ApplicationError> {
        let root = bencode::decode_exact(body).map_err(unavailable)?;

        if let Some(reason) = root.get(b"failure reason") {
            return Err(ApplicationError::TrackerUnavailable(format!(
                "tracker refused announce: {}",
                String::from_utf8_lossy(reason.as_bytes().unwrap_or_default())
            )));
        }

        let peers = match root.get(b"peers") {
            Some(Value::Bytes(data)) => compact_peers(data)?,
            Some(Value::List(list)) => dictionary_peers(list),
            _ => {
                return Err(ApplicationError::TrackerUnavailable(
                    "response has no peer list".into(),
                ));
            }
        };

        Ok(AnnounceResponse {
            peers,
            interval: root.get(b"interval").and_then(Value::as_integer),
        })
    }
}

/*
 * Compact mode: one byte string, 6 bytes per peer.
 * 4 bytes IPv4 address followed by a 2 byte big-endian port,
 * so [192, 168, 1, 1, 26, 225] is 192.168.1.1:6881.
 */
fn compact_peers(data: &[u8]) -> Result<Vec<Peer>, ApplicationError> {
    if data.len() % COMPACT_PEER_LEN != 0 {
        return Err(ApplicationError::TrackerUnavailable(format!(
            "compact peer list of {} bytes is not a multiple of {}",
            data.len(),
            COMPACT_PEER_LEN
        )));
    }

    Ok(data
        .chunks_exact(COMPACT_PEER_LEN)
        .filter_map(|chunk| <&[u8; COMPACT_PEER_LEN]>::try_from(chunk).ok())
        .map(Peer::from_compact)
        .collect())
}

/*
 * Non-compact mode: a list of dictionaries with "ip" (dotted
 * string) and "port" (integer). Entries that do not parse are
 * skipped rather than failing the whole announce.
 */
fn dictionary_peers(list: &[Value]) -> Vec<Peer> {
    list.iter()
        .filter_map(|item| {
            let ip = item
                .get(b"ip")
                .and_then(Value::as_str)
                .and_then(|s| s.parse::<Ipv4Addr>().ok())
                .map(IpAddr::V4)?;
            let port = item
                .get(b"port")
                .and_then(Value::as_integer)
                .and_then(|n| u16::try_from(n).ok())?;
            Some(Peer { ip, port })
        })
        .collect()
}

fn unavailable(e: impl std::fmt::Display) -> ApplicationError {
    ApplicationError::TrackerUnavailable(e.to_string())
}

impl Tracker {
    pub fn new(timeout: Duration) -> Result<Self, ApplicationError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(unavailable)?;
        Ok(Self { client })
    }

    /// Builds the announce URL, keeping any query the tracker URL already has.
    pub fn announce_url(announce: &Announce<'_>) -> Result<Url, ApplicationError> {
        let mut url = Url::parse(announce.url).map_err(unavailable)?;

        let params = [
            ("info_hash",  percent_encode(announce.info_hash, NON_ALPHANUMERIC).to_string()),
            ("peer_id",    percent_encode(announce.peer_id, NON_ALPHANUMERIC).to_string()),
            ("port",       announce.port.to_string()),
            ("uploaded",   announce.uploaded.to_string()),
            ("downloaded", announce.downloaded.to_string()),
            ("left",       announce.left.to_string()),
            ("compact",    "1".to_string()),
            ("event",      "started".to_string()),
        ];

        let mut query = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");
        if let Some(existing) = url.query().filter(|q| !q.is_empty()) {
            query = format!("{}&{}", existing, query);
        }
        url.set_query(Some(&query));
        Ok(url)
    }

    /// Sends an announce request to the tracker and returns the list of peers
    pub async fn announce(&self, announce: &Announce<'_>) -> Result<Vec<Peer>, ApplicationError> {
        let url = Self::announce_url(announce)?;
        debug!(url = %url, "announcing");

        let raw = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(unavailable)?
            .bytes()
            .await
            .map_err(unavailable)?;

        let resp = AnnounceResponse::from_bytes(&raw)?;
        debug!(peers = resp.peers.len(), interval = ?resp.interval, "tracker answered");
        Ok(resp.peers)
    }
}
