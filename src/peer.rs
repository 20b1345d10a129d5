use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter},
    net::TcpStream,
    sync::{mpsc, watch},
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, trace, warn};

use crate::{
    config::Config,
    error::ApplicationError,
    piece::{Block, BlockRequest},
    protocol::{HANDSHAKE_LEN, Handshake, MAX_FRAME_LEN, Message, PROTOCOL_ID_LEN},
};

/// Identifies a session within one scheduler
pub type SessionId = usize;

/// Represents a peer in the BitTorrent network
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Peer {
    pub ip:   IpAddr,
    pub port: u16,
}

impl Peer {
    /// Builds a peer from a compact tracker entry: 4 bytes IPv4, 2 bytes port (big-endian)
    pub fn from_compact(entry: &[u8; 6]) -> Self {
        Peer {
            ip:   IpAddr::V4(Ipv4Addr::new(entry[0], entry[1], entry[2], entry[3])),
            port: u16::from_be_bytes([entry[4], entry[5]]),
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.socket_addr())
    }
}

impl From<SocketAddr> for Peer {
    fn from(addr: SocketAddr) -> Self {
        Peer { ip: addr.ip(), port: addr.port() }
    }
}

/// Lifecycle of a peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Handshaking,
    Connected { choked: bool },
    Closed,
}

/// Everything a session reports to the scheduler
#[derive(Debug)]
pub enum SessionEvent {
    Choked(SessionId),
    Unchoked(SessionId),
    Have { session: SessionId, index: u32 },
    Bitfield { session: SessionId, bits: Vec<u8> },
    Block { session: SessionId, block: Block },
    /// The connection failed; sent at most once per session
    Closed { session: SessionId, reason: ApplicationError },
}

/// Manages the connection to a peer.
///
/// Two tasks run per session: the receiver reads frames and forwards them as
/// [`SessionEvent`]s, the sender drains the outbound queue in FIFO order and
/// holds back `request` messages while the peer is choking us. The state
/// lives in a watch channel whose only choke writer is the receiver.
///
/// Every queued message is tagged with the request generation current when
/// it was queued; [`PeerSession::discard_queued_requests`] starts a new
/// generation and the sender drops requests from older ones.
pub struct PeerSession {
    id:         SessionId,
    peer:       Peer,
    remote:     Handshake,
    state:      Arc<watch::Sender<SessionState>>,
    generation: Arc<AtomicU64>,
    outbound:   mpsc::UnboundedSender<(Message, u64)>,
    reader:     JoinHandle<()>,
    writer:     JoinHandle<()>,
}

impl PeerSession {
    /// Opens a TCP connection to `peer` and performs the handshake.
    pub async fn connect(
        id:        SessionId,
        peer:      Peer,
        info_hash: [u8; 20],
        config:    &Config,
        events:    mpsc::Sender<SessionEvent>,
    ) -> Result<Self, ApplicationError> {
        let (state, _) = watch::channel(SessionState::Connecting);

        let stream = timeout(config.connect_timeout, TcpStream::connect(peer.socket_addr()))
            .await
            .map_err(|_| ApplicationError::ConnectionError(format!("connect to {} timed out", peer)))?
            .map_err(ApplicationError::connection)?;

        state.send_replace(SessionState::Handshaking);
        Self::start(id, peer, stream, state, info_hash, config, events).await
    }

    /// Runs a session over an already connected stream.
    pub async fn establish<S>(
        id:        SessionId,
        peer:      Peer,
        stream:    S,
        info_hash: [u8; 20],
        config:    &Config,
        events:    mpsc::Sender<SessionEvent>,
    ) -> Result<Self, ApplicationError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (state, _) = watch::channel(SessionState::Handshaking);
        Self::start(id, peer, stream, state, info_hash, config, events).await
    }

    async fn start<S>(
        id:        SessionId,
        peer:      Peer,
        mut stream: S,
        state:     watch::Sender<SessionState>,
        info_hash: [u8; 20],
        config:    &Config,
        events:    mpsc::Sender<SessionEvent>,
    ) -> Result<Self, ApplicationError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let remote = timeout(config.connect_timeout, handshake(&mut stream, info_hash, config))
            .await
            .map_err(|_| ApplicationError::ConnectionError(format!("handshake with {} timed out", peer)))??;

        debug!(
            peer      = %peer,
            remote_id = %String::from_utf8_lossy(&remote.peer_id),
            "handshake completed"
        );

        // Peers start out choking us until they say otherwise
        state.send_replace(SessionState::Connected { choked: true });
        let state = Arc::new(state);
        let generation = Arc::new(AtomicU64::new(0));

        let (rh, wh) = tokio::io::split(stream);
        let (outbound, queue) = mpsc::unbounded_channel();

        let reader = tokio::spawn(receive_loop(
            id,
            BufReader::new(rh),
            state.clone(),
            events.clone(),
        ));
        let writer = tokio::spawn(send_loop(
            id,
            BufWriter::new(wh),
            queue,
            state.clone(),
            generation.clone(),
            events,
        ));

        Ok(PeerSession { id, peer, remote, state, generation, outbound, reader, writer })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    /// Handshake the remote side answered with
    pub fn remote(&self) -> &Handshake {
        &self.remote
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn is_choked(&self) -> bool {
        matches!(self.state(), SessionState::Connected { choked: true })
    }

    /// Queues a message for the sender task. Never waits on the network or
    /// on the choke state.
    pub fn send(&self, msg: Message) -> Result<(), ApplicationError> {
        if self.state() == SessionState::Closed {
            return Err(ApplicationError::ConnectionError(format!("session with {} is closed", self.peer)));
        }
        let generation = self.generation.load(Ordering::Acquire);
        self.outbound
            .send((msg, generation))
            .map_err(|_| ApplicationError::ConnectionError(format!("session with {} is closed", self.peer)))
    }

    pub fn request(&self, req: BlockRequest) -> Result<(), ApplicationError> {
        self.send(Message::Request { index: req.index, begin: req.begin, length: req.length })
    }

    pub fn cancel(&self, req: BlockRequest) -> Result<(), ApplicationError> {
        self.send(Message::Cancel { index: req.index, begin: req.begin, length: req.length })
    }

    /// Drops every `request` still waiting in the outbound queue.
    ///
    /// A choking peer throws away what we asked for, so once its requests are
    /// back in the pool the queued copies must never reach the wire.
    pub fn discard_queued_requests(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        // Wake a sender parked on the choke so it can drop them now
        self.state.send_modify(|_| {});
    }

    /// Shuts the session down. No `Closed` event is emitted for an explicit close.
    pub fn close(&self) {
        mark_closed(&self.state);
        self.reader.abort();
        self.writer.abort();
    }
}

impl Drop for PeerSession {
    fn drop(&mut self) {
        self.close();
    }
}

/// Sends our handshake and validates the answer.
///
/// The length byte is checked before reading the rest, so a peer speaking
/// another protocol is rejected without waiting for 67 more bytes.
pub async fn handshake<S>(
    stream:    &mut S,
    info_hash: [u8; 20],
    config:    &Config,
) -> Result<Handshake, ApplicationError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let ours = Handshake::with_protocol(config.protocol, info_hash, config.peer_id);
    stream
        .write_all(&ours.encode())
        .await
        .map_err(ApplicationError::connection)?;
    stream.flush().await.map_err(ApplicationError::connection)?;

    let mut buf = [0u8; HANDSHAKE_LEN];
    stream
        .read_exact(&mut buf[..1])
        .await
        .map_err(ApplicationError::connection)?;
    if buf[0] as usize != PROTOCOL_ID_LEN {
        return Err(ApplicationError::ProtocolMismatch(format!(
            "protocol string length {}",
            buf[0]
        )));
    }

    stream
        .read_exact(&mut buf[1..])
        .await
        .map_err(ApplicationError::connection)?;

    let theirs = Handshake::decode(&buf, &config.protocol)?;
    if config.verify_info_hash && theirs.info_hash != info_hash {
        return Err(ApplicationError::ProtocolMismatch(format!(
            "info-hash mismatch expected={} received={}",
            hex::encode(info_hash),
            hex::encode(theirs.info_hash)
        )));
    }

    Ok(theirs)
}

/// Reads one frame. Returns `Ok(None)` for keep-alives.
pub async fn read_message<R>(reader: &mut R) -> Result<Option<Message>, ApplicationError>
where
    R: AsyncRead + Unpin,
{
    let size = reader.read_u32().await.map_err(ApplicationError::connection)?;
    if size == 0 {
        return Ok(None);
    }
    if size > MAX_FRAME_LEN {
        return Err(ApplicationError::ConnectionError(format!(
            "frame of {} bytes exceeds limit",
            size
        )));
    }

    let mut body = vec![0u8; size as usize];
    reader
        .read_exact(&mut body)
        .await
        .map_err(ApplicationError::connection)?;

    Message::decode(&body)
}

pub async fn write_message<W>(writer: &mut W, msg: &Message) -> Result<(), ApplicationError>
where
    W: AsyncWrite + Unpin,
{
    writer
        .write_all(&msg.encode())
        .await
        .map_err(ApplicationError::connection)?;
    writer.flush().await.map_err(ApplicationError::connection)
}

/// Moves the session to `Closed`. Only the first caller gets `true`.
fn mark_closed(state: &watch::Sender<SessionState>) -> bool {
    state.send_if_modified(|s| {
        if *s == SessionState::Closed {
            false
        } else {
            *s = SessionState::Closed;
            true
        }
    })
}

fn set_choked(state: &watch::Sender<SessionState>, value: bool) {
    state.send_if_modified(|s| match s {
        SessionState::Connected { choked } if *choked != value => {
            *choked = value;
            true
        }
        _ => false,
    });
}

async fn fail(
    id:     SessionId,
    state:  &watch::Sender<SessionState>,
    events: &mpsc::Sender<SessionEvent>,
    reason: ApplicationError,
) {
    if mark_closed(state) {
        warn!(session = id, error = %reason, "peer session closed");
        let _ = events.send(SessionEvent::Closed { session: id, reason }).await;
    }
}

async fn receive_loop<R>(
    id:     SessionId,
    mut reader: R,
    state:  Arc<watch::Sender<SessionState>>,
    events: mpsc::Sender<SessionEvent>,
) where
    R: AsyncRead + Unpin,
{
    let reason = loop {
        let msg = match read_message(&mut reader).await {
            Ok(Some(msg)) => msg,
            Ok(None) => {
                trace!(session = id, "keep-alive");
                continue;
            }
            Err(e) => break e,
        };

        let event = match msg {
            Message::Choke => {
                set_choked(&state, true);
                SessionEvent::Choked(id)
            }
            Message::Unchoke => {
                set_choked(&state, false);
                SessionEvent::Unchoked(id)
            }
            Message::Have(index) => SessionEvent::Have { session: id, index },
            Message::Bitfield(bits) => SessionEvent::Bitfield { session: id, bits },
            Message::Piece { index, begin, block } => {
                debug!(session = id, piece = index, begin, size = block.len(), "received block");
                SessionEvent::Block {
                    session: id,
                    block:   Block { index, begin, data: block },
                }
            }
            other => {
                trace!(session = id, message = ?other, "ignoring message");
                continue;
            }
        };

        // A full queue blocks here, which is the backpressure we want
        if events.send(event).await.is_err() {
            break ApplicationError::ConnectionError("scheduler is gone".into());
        }
    };

    fail(id, &state, &events, reason).await;
}

async fn send_loop<W>(
    id:         SessionId,
    mut writer: W,
    mut queue:  mpsc::UnboundedReceiver<(Message, u64)>,
    state:      Arc<watch::Sender<SessionState>>,
    generation: Arc<AtomicU64>,
    events:     mpsc::Sender<SessionEvent>,
) where
    W: AsyncWrite + Unpin,
{
    let mut watcher = state.subscribe();

    let reason = loop {
        let (msg, tag) = tokio::select! {
            queued = queue.recv() => match queued {
                Some(queued) => queued,
                None => return,
            },
            _ = wait_closed(&mut watcher) => return,
        };

        if msg.requires_unchoke() {
            if !wait_sendable(&mut watcher, &generation, tag).await {
                return;
            }
            if generation.load(Ordering::Acquire) != tag {
                trace!(session = id, message = ?msg, "dropping request discarded on choke");
                continue;
            }
        }

        trace!(session = id, message = ?msg, "sending");
        if let Err(e) = write_message(&mut writer, &msg).await {
            break e;
        }
    };

    fail(id, &state, &events, reason).await;
}

/// Waits until the peer is not choking us or the request tagged `tag` has
/// been discarded. False means the session closed.
async fn wait_sendable(
    watcher:    &mut watch::Receiver<SessionState>,
    generation: &AtomicU64,
    tag:        u64,
) -> bool {
    match watcher
        .wait_for(|s| {
            !matches!(s, SessionState::Connected { choked: true })
                || generation.load(Ordering::Acquire) != tag
        })
        .await
    {
        Ok(state) => *state != SessionState::Closed,
        Err(_) => false,
    }
}

async fn wait_closed(watcher: &mut watch::Receiver<SessionState>) {
    let _ = watcher.wait_for(|s| *s == SessionState::Closed).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PROTOCOL_ID;
    use std::time::Duration;
    use tokio::io::{DuplexStream, duplex};

    const INFO_HASH: [u8; 20] = [0xab; 20];

    fn config() -> Config {
        Config {
            peer_id: *b"-TZTEST-000000000001",
            connect_timeout: Duration::from_secs(5),
            ..Config::default()
        }
    }

    fn local() -> Peer {
        Peer::from(SocketAddr::from(([127, 0, 0, 1], 6881)))
    }

    /// Reads our handshake on the remote end and answers with `reply`.
    async fn answer(remote: &mut DuplexStream, reply: [u8; HANDSHAKE_LEN]) -> [u8; HANDSHAKE_LEN] {
        let mut ours = [0u8; HANDSHAKE_LEN];
        remote.read_exact(&mut ours).await.unwrap();
        remote.write_all(&reply).await.unwrap();
        ours
    }

    async fn open() -> (PeerSession, DuplexStream, mpsc::Receiver<SessionEvent>) {
        let (local_end, mut remote) = duplex(1 << 20);
        let (events, rx) = mpsc::channel(16);
        let config = config();

        let server = tokio::spawn(async move {
            answer(&mut remote, Handshake::new(INFO_HASH, [9; 20]).encode()).await;
            remote
        });
        let session = PeerSession::establish(1, local(), local_end, INFO_HASH, &config, events)
            .await
            .unwrap();
        (session, server.await.unwrap(), rx)
    }

    async fn read_frame(remote: &mut DuplexStream) -> Message {
        loop {
            if let Some(msg) = read_message(remote).await.unwrap() {
                return msg;
            }
        }
    }

    #[test]
    fn parses_compact_entry() {
        let peer = Peer::from_compact(&[192, 168, 1, 1, 26, 225]);
        assert_eq!(peer.to_string(), "192.168.1.1:6881");
    }

    #[tokio::test]
    async fn handshake_sends_configured_identity() {
        let (mut local_end, mut remote) = duplex(1024);
        let config = config();

        let server = tokio::spawn(async move {
            answer(&mut remote, Handshake::new(INFO_HASH, [9; 20]).encode()).await
        });
        let theirs = handshake(&mut local_end, INFO_HASH, &config).await.unwrap();
        let ours = server.await.unwrap();

        assert_eq!(theirs.peer_id, [9; 20]);
        assert_eq!(
            Handshake::decode(&ours, PROTOCOL_ID).unwrap(),
            Handshake::new(INFO_HASH, config.peer_id)
        );
    }

    #[tokio::test]
    async fn handshake_rejects_bad_length_byte_and_sends_nothing_more() {
        let (mut local_end, mut remote) = duplex(1024);
        let config = config();

        let mut reply = Handshake::new(INFO_HASH, [9; 20]).encode();
        reply[0] = 20;
        let server = tokio::spawn(async move {
            answer(&mut remote, reply).await;
            let mut rest = Vec::new();
            remote.read_to_end(&mut rest).await.unwrap();
            rest
        });

        let result = handshake(&mut local_end, INFO_HASH, &config).await;
        assert!(matches!(result, Err(ApplicationError::ProtocolMismatch(_))));
        drop(local_end);
        assert!(server.await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn handshake_rejects_wrong_identifier_and_info_hash() {
        let config = config();

        let mut reply = Handshake::new(INFO_HASH, [9; 20]).encode();
        reply[5] = b'X';
        let (mut local_end, mut remote) = duplex(1024);
        tokio::spawn(async move { answer(&mut remote, reply).await });
        assert!(matches!(
            handshake(&mut local_end, INFO_HASH, &config).await,
            Err(ApplicationError::ProtocolMismatch(_))
        ));

        let (mut local_end, mut remote) = duplex(1024);
        tokio::spawn(async move {
            answer(&mut remote, Handshake::new([0; 20], [9; 20]).encode()).await
        });
        assert!(matches!(
            handshake(&mut local_end, INFO_HASH, &config).await,
            Err(ApplicationError::ProtocolMismatch(_))
        ));
    }

    #[tokio::test]
    async fn session_starts_choked() {
        let (session, _remote, _rx) = open().await;
        assert_eq!(session.state(), SessionState::Connected { choked: true });
        assert!(session.is_choked());
        assert_eq!(session.remote().peer_id, [9; 20]);
    }

    #[tokio::test]
    async fn request_waits_for_unchoke_and_is_sent_once() {
        let (session, mut remote, mut rx) = open().await;
        let req = BlockRequest { index: 0, begin: 0, length: 16_384 };

        remote.write_all(&Message::Choke.encode()).await.unwrap();
        assert!(matches!(rx.recv().await, Some(SessionEvent::Choked(1))));

        session.request(req).unwrap();
        let early = tokio::time::timeout(Duration::from_millis(100), read_frame(&mut remote)).await;
        assert!(early.is_err(), "request left while choked");

        remote.write_all(&Message::Unchoke.encode()).await.unwrap();
        assert!(matches!(rx.recv().await, Some(SessionEvent::Unchoked(1))));

        assert_eq!(
            read_frame(&mut remote).await,
            Message::Request { index: 0, begin: 0, length: 16_384 }
        );
        let again = tokio::time::timeout(Duration::from_millis(100), read_frame(&mut remote)).await;
        assert!(again.is_err(), "request sent twice");
    }

    #[tokio::test]
    async fn messages_behind_a_held_request_keep_fifo_order() {
        let (session, mut remote, mut rx) = open().await;

        session.send(Message::Interested).unwrap();
        session.request(BlockRequest { index: 1, begin: 0, length: 10 }).unwrap();
        session.send(Message::NotInterested).unwrap();

        assert_eq!(read_frame(&mut remote).await, Message::Interested);
        let held = tokio::time::timeout(Duration::from_millis(100), read_frame(&mut remote)).await;
        assert!(held.is_err());

        remote.write_all(&Message::Unchoke.encode()).await.unwrap();
        assert!(matches!(rx.recv().await, Some(SessionEvent::Unchoked(1))));
        assert_eq!(
            read_frame(&mut remote).await,
            Message::Request { index: 1, begin: 0, length: 10 }
        );
        assert_eq!(read_frame(&mut remote).await, Message::NotInterested);
    }

    #[tokio::test]
    async fn discarded_requests_never_reach_the_wire() {
        let (session, mut remote, mut rx) = open().await;

        session.request(BlockRequest { index: 0, begin: 0, length: 10 }).unwrap();
        session.send(Message::Interested).unwrap();
        session.discard_queued_requests();

        // The held request is gone, so what queued behind it goes out at once
        assert_eq!(read_frame(&mut remote).await, Message::Interested);

        session.request(BlockRequest { index: 0, begin: 10, length: 10 }).unwrap();
        remote.write_all(&Message::Unchoke.encode()).await.unwrap();
        assert!(matches!(rx.recv().await, Some(SessionEvent::Unchoked(1))));

        assert_eq!(
            read_frame(&mut remote).await,
            Message::Request { index: 0, begin: 10, length: 10 }
        );
        let stale = tokio::time::timeout(Duration::from_millis(100), read_frame(&mut remote)).await;
        assert!(stale.is_err(), "discarded request was sent");
    }

    #[tokio::test]
    async fn forwards_blocks_and_availability() {
        let (_session, mut remote, mut rx) = open().await;

        remote.write_all(&[0, 0, 0, 0]).await.unwrap();
        remote.write_all(&Message::Bitfield(vec![0b1100_0000]).encode()).await.unwrap();
        remote.write_all(&Message::Have(7).encode()).await.unwrap();
        remote
            .write_all(&Message::Piece { index: 2, begin: 16_384, block: vec![1, 2, 3] }.encode())
            .await
            .unwrap();

        assert!(matches!(
            rx.recv().await,
            Some(SessionEvent::Bitfield { session: 1, bits }) if bits == vec![0b1100_0000]
        ));
        assert!(matches!(rx.recv().await, Some(SessionEvent::Have { session: 1, index: 7 })));
        match rx.recv().await {
            Some(SessionEvent::Block { session, block }) => {
                assert_eq!(session, 1);
                assert_eq!(block, Block { index: 2, begin: 16_384, data: vec![1, 2, 3] });
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn malformed_frame_closes_the_session_once() {
        let (session, mut remote, mut rx) = open().await;

        remote.write_all(&[0, 0, 0, 2, 4, 0]).await.unwrap();
        assert!(matches!(
            rx.recv().await,
            Some(SessionEvent::Closed { session: 1, reason: ApplicationError::ConnectionError(_) })
        ));
        assert_eq!(session.state(), SessionState::Closed);
        assert!(session.send(Message::Interested).is_err());

        drop(remote);
        let more = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(!matches!(more, Ok(Some(_))));
    }

    #[tokio::test]
    async fn end_of_stream_is_a_connection_error() {
        let (_session, remote, mut rx) = open().await;
        drop(remote);
        assert!(matches!(
            rx.recv().await,
            Some(SessionEvent::Closed { reason: ApplicationError::ConnectionError(_), .. })
        ));
    }

    #[tokio::test]
    async fn explicit_close_is_silent() {
        let (session, _remote, mut rx) = open().await;
        session.close();
        assert_eq!(session.state(), SessionState::Closed);
        let event = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(!matches!(event, Ok(Some(_))));
    }
}
