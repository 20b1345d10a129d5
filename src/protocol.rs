use byteorder::{BigEndian, ReadBytesExt};
use std::io::Read;

use crate::error::ApplicationError;

/// The BitTorrent protocol identifier string
pub const PROTOCOL_ID: &[u8; PROTOCOL_ID_LEN] = b"BitTorrent protocol";

pub const PROTOCOL_ID_LEN: usize = 19;

/// Length of the full handshake message (always 68 bytes)
pub const HANDSHAKE_LEN: usize = 68;

/// Largest block a `piece` message may carry
pub const MAX_BLOCK_LEN: u32 = 1 << 20;

/// Largest frame body accepted from a peer: a full block plus the piece header
pub const MAX_FRAME_LEN: u32 = MAX_BLOCK_LEN + 9;

/// Represents a BitTorrent handshake message.
///
/// A handshake is the first message sent in a connection and is always 68 bytes.
/// It identifies the torrent being requested (`info_hash`) and the client (`peer_id`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// Protocol string, `BitTorrent protocol` unless configured otherwise
    pub protocol: [u8; PROTOCOL_ID_LEN],
    /// SHA-1 hash of the info dictionary from the .torrent file
    pub info_hash: [u8; 20],
    /// 20-byte string used to identify the client
    pub peer_id: [u8; 20],
}

impl Handshake {
    /// Creates a new `Handshake` with the given `info_hash` and `peer_id`.
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Self::with_protocol(*PROTOCOL_ID, info_hash, peer_id)
    }

    pub fn with_protocol(
        protocol:  [u8; PROTOCOL_ID_LEN],
        info_hash: [u8; 20],
        peer_id:   [u8; 20],
    ) -> Self {
        Self { protocol, info_hash, peer_id }
    }

    /// Encodes the handshake into a 68-byte array.
    ///
    /// This array can be written directly to a TCP stream.
    pub fn encode(&self) -> [u8; HANDSHAKE_LEN] {
        let mut buf = [0u8; HANDSHAKE_LEN];
        buf[0] = PROTOCOL_ID_LEN as u8;
        buf[1..20].copy_from_slice(&self.protocol);
        // reserved bytes [20..28] stay zero
        buf[28..48].copy_from_slice(&self.info_hash);
        buf[48..68].copy_from_slice(&self.peer_id);
        buf
    }

    /// Decodes a 68-byte handshake and checks it speaks `expected`.
    pub fn decode(buf: &[u8], expected: &[u8; PROTOCOL_ID_LEN]) -> Result<Self, ApplicationError> {
        if buf.len() != HANDSHAKE_LEN {
            return Err(ApplicationError::ProtocolMismatch(format!(
                "handshake is {} bytes, expected {}",
                buf.len(),
                HANDSHAKE_LEN
            )));
        }

        if buf[0] as usize != PROTOCOL_ID_LEN {
            return Err(ApplicationError::ProtocolMismatch(format!(
                "protocol string length {}",
                buf[0]
            )));
        }

        if &buf[1..20] != expected {
            return Err(ApplicationError::ProtocolMismatch(format!(
                "unknown protocol {:?}",
                String::from_utf8_lossy(&buf[1..20])
            )));
        }

        let mut protocol = [0u8; PROTOCOL_ID_LEN];
        protocol.copy_from_slice(&buf[1..20]);

        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&buf[28..48]);

        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&buf[48..68]);

        Ok(Self { protocol, info_hash, peer_id })
    }
}

/// Represents a protocol message exchanged after the handshake.
///
/// These messages follow the BitTorrent peer wire protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// `choke` message: tells the peer it will not receive requests
    Choke,
    /// `unchoke` message: peer is allowed to request blocks
    Unchoke,
    /// `interested` message: client is interested in pieces from peer
    Interested,
    /// `not interested` message: client is not interested
    NotInterested,
    /// `have` message: peer has a specific piece
    Have(u32),
    /// `bitfield` message: bitmap of pieces the peer has
    Bitfield(Vec<u8>),
    /// `request` message: request a block of data
    Request { index: u32, begin: u32, length: u32 },
    /// `piece` message: sends a block of a piece
    Piece {
        index: u32,
        begin: u32,
        block: Vec<u8>,
    },
    /// `cancel` message: cancels a previously sent request
    Cancel { index: u32, begin: u32, length: u32 },
    /// `port` message: the peer's DHT listen port
    Port(u16),
}

impl Message {
    fn id(&self) -> u8 {
        match self {
            Message::Choke => 0,
            Message::Unchoke => 1,
            Message::Interested => 2,
            Message::NotInterested => 3,
            Message::Have(_) => 4,
            Message::Bitfield(_) => 5,
            Message::Request { .. } => 6,
            Message::Piece { .. } => 7,
            Message::Cancel { .. } => 8,
            Message::Port(_) => 9,
        }
    }

    /// Whether the peer must have unchoked us before this message may go out.
    pub fn requires_unchoke(&self) -> bool {
        matches!(self, Message::Request { .. })
    }

    /// Serializes a `Message` into a length-prefixed frame.
    pub fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        match self {
            Message::Choke | Message::Unchoke | Message::Interested | Message::NotInterested => {}
            Message::Have(index) => payload.extend_from_slice(&index.to_be_bytes()),
            Message::Bitfield(bitfield) => payload.extend_from_slice(bitfield),
            Message::Request { index, begin, length }
            | Message::Cancel { index, begin, length } => {
                payload.extend_from_slice(&index.to_be_bytes());
                payload.extend_from_slice(&begin.to_be_bytes());
                payload.extend_from_slice(&length.to_be_bytes());
            }
            Message::Piece { index, begin, block } => {
                payload.extend_from_slice(&index.to_be_bytes());
                payload.extend_from_slice(&begin.to_be_bytes());
                payload.extend_from_slice(block);
            }
            Message::Port(port) => payload.extend_from_slice(&port.to_be_bytes()),
        }

        let mut buf = Vec::with_capacity(5 + payload.len());
        buf.extend_from_slice(&(1 + payload.len() as u32).to_be_bytes());
        buf.push(self.id());
        buf.extend_from_slice(&payload);
        buf
    }

    /// Parses a frame body (type byte plus payload, without the length prefix).
    ///
    /// Returns `Ok(None)` for an empty body, which is a keep-alive.
    pub fn decode(mut buf: &[u8]) -> Result<Option<Self>, ApplicationError> {
        if buf.is_empty() {
            return Ok(None);
        }

        let id = buf.read_u8().map_err(malformed)?;
        let payload_len = buf.len();

        let expect = |len: usize| {
            if payload_len == len {
                Ok(())
            } else {
                Err(ApplicationError::ConnectionError(format!(
                    "message {} carries {} payload bytes, expected {}",
                    id, payload_len, len
                )))
            }
        };

        let msg = match id {
            0 => expect(0).map(|_| Message::Choke)?,
            1 => expect(0).map(|_| Message::Unchoke)?,
            2 => expect(0).map(|_| Message::Interested)?,
            3 => expect(0).map(|_| Message::NotInterested)?,
            4 => {
                expect(4)?;
                Message::Have(buf.read_u32::<BigEndian>().map_err(malformed)?)
            }
            5 => Message::Bitfield(buf.to_vec()),
            6 | 8 => {
                expect(12)?;
                let index = buf.read_u32::<BigEndian>().map_err(malformed)?;
                let begin = buf.read_u32::<BigEndian>().map_err(malformed)?;
                let length = buf.read_u32::<BigEndian>().map_err(malformed)?;
                if id == 6 {
                    Message::Request { index, begin, length }
                } else {
                    Message::Cancel { index, begin, length }
                }
            }
            7 => {
                if payload_len < 8 {
                    return Err(ApplicationError::ConnectionError(
                        "piece message shorter than its header".into(),
                    ));
                }
                let index = buf.read_u32::<BigEndian>().map_err(malformed)?;
                let begin = buf.read_u32::<BigEndian>().map_err(malformed)?;
                let mut block = vec![0u8; payload_len - 8];
                buf.read_exact(&mut block).map_err(malformed)?;
                Message::Piece { index, begin, block }
            }
            9 => {
                expect(2)?;
                Message::Port(buf.read_u16::<BigEndian>().map_err(malformed)?)
            }
            _ => {
                return Err(ApplicationError::ConnectionError(format!(
                    "unknown message id: {}",
                    id
                )));
            }
        };

        Ok(Some(msg))
    }
}

fn malformed(e: std::io::Error) -> ApplicationError {
    ApplicationError::ConnectionError(format!("protocol: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_layout() {
        let hs = Handshake::new([1; 20], *b"-RU0001-123456789010");
        let buf = hs.encode();
        assert_eq!(buf[0], 19);
        assert_eq!(&buf[1..20], b"BitTorrent protocol");
        assert_eq!(&buf[20..28], &[0u8; 8]);
        assert_eq!(&buf[28..48], &[1u8; 20]);
        assert_eq!(&buf[48..68], b"-RU0001-123456789010");
        assert_eq!(Handshake::decode(&buf, PROTOCOL_ID).unwrap(), hs);
    }

    #[test]
    fn handshake_rejects_wrong_protocol() {
        let mut buf = Handshake::new([1; 20], [2; 20]).encode();
        buf[0] = 18;
        assert!(matches!(
            Handshake::decode(&buf, PROTOCOL_ID),
            Err(ApplicationError::ProtocolMismatch(_))
        ));

        let mut buf = Handshake::new([1; 20], [2; 20]).encode();
        buf[1] = b'b';
        assert!(matches!(
            Handshake::decode(&buf, PROTOCOL_ID),
            Err(ApplicationError::ProtocolMismatch(_))
        ));
    }

    #[test]
    fn encodes_frames() {
        assert_eq!(Message::Unchoke.encode(), vec![0, 0, 0, 1, 1]);
        assert_eq!(Message::Have(258).encode(), vec![0, 0, 0, 5, 4, 0, 0, 1, 2]);
        assert_eq!(
            Message::Request { index: 1, begin: 16384, length: 16384 }.encode(),
            vec![0, 0, 0, 13, 6, 0, 0, 0, 1, 0, 0, 0x40, 0, 0, 0, 0x40, 0]
        );
        assert_eq!(Message::Port(6881).encode(), vec![0, 0, 0, 3, 9, 0x1a, 0xe1]);
    }

    #[test]
    fn decodes_frame_bodies() {
        assert_eq!(Message::decode(&[]).unwrap(), None);
        assert_eq!(Message::decode(&[0]).unwrap(), Some(Message::Choke));
        assert_eq!(
            Message::decode(&[5, 0b1010_0000, 1]).unwrap(),
            Some(Message::Bitfield(vec![0b1010_0000, 1]))
        );
        assert_eq!(
            Message::decode(&[7, 0, 0, 0, 2, 0, 0, 0, 4, 9, 8, 7]).unwrap(),
            Some(Message::Piece { index: 2, begin: 4, block: vec![9, 8, 7] })
        );

        let frame = Message::Cancel { index: 3, begin: 0, length: 7000 }.encode();
        assert_eq!(
            Message::decode(&frame[4..]).unwrap(),
            Some(Message::Cancel { index: 3, begin: 0, length: 7000 })
        );
    }

    #[test]
    fn rejects_bad_frame_bodies() {
        for body in [&[4u8, 0, 0][..], &[6, 0, 0, 0, 1][..], &[7, 0, 0][..], &[1, 0][..], &[42][..]] {
            assert!(matches!(
                Message::decode(body),
                Err(ApplicationError::ConnectionError(_))
            ));
        }
    }
}
