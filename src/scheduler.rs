use std::collections::{HashMap, HashSet, VecDeque};

use futures::{StreamExt, future::BoxFuture, stream::FuturesUnordered};
use tokio::{
    sync::mpsc,
    time::{Instant, sleep_until},
};
use tracing::{debug, info, warn};

use crate::{
    config::Config,
    error::ApplicationError,
    manager::{BlockOutcome, PieceManager, PieceSelector},
    peer::{Peer, PeerSession, SessionEvent, SessionId},
    piece::Block,
    protocol::Message,
    sink::OutputSink,
    torrent::Torrent,
};

type Connecting = FuturesUnordered<
    BoxFuture<'static, (SessionId, Peer, Result<PeerSession, ApplicationError>)>,
>;

/// Pieces a peer has told us about
#[derive(Debug)]
struct Availability {
    pieces: u32,
    /// False until the first `bitfield` or `have`; until then every piece counts
    known:  bool,
    /// Always exactly one bit per piece, rounded up to whole bytes
    bits:   Vec<u8>,
}

impl Availability {
    fn new(pieces: u32) -> Self {
        Self {
            pieces,
            known: false,
            bits: vec![0; (pieces as usize).div_ceil(8)],
        }
    }

    fn has(&self, index: u32) -> bool {
        if index >= self.pieces {
            return false;
        }
        if !self.known {
            return true;
        }
        self.bits
            .get(index as usize / 8)
            .is_some_and(|byte| byte & (0b1000_0000 >> (index % 8)) != 0)
    }

    /// Takes a peer's bitfield, cut or padded to the torrent's piece count.
    fn set_bitfield(&mut self, mut bits: Vec<u8>) {
        bits.resize((self.pieces as usize).div_ceil(8), 0);
        self.known = true;
        self.bits = bits;
    }

    /// Records a `have`. Returns false for an index past the last piece.
    fn insert(&mut self, index: u32) -> bool {
        if index >= self.pieces {
            return false;
        }
        self.known = true;
        if let Some(byte) = self.bits.get_mut(index as usize / 8) {
            *byte |= 0b1000_0000 >> (index % 8);
        }
        true
    }
}

struct ActiveSession {
    session:      PeerSession,
    choked:       bool,
    /// Set when one of its requests timed out, cleared by the next block it delivers
    snubbed:      bool,
    availability: Availability,
    /// Last time the session was given work or delivered a block
    last_active:  Instant,
}

/// Drives peer sessions until every piece has been verified and written.
///
/// The scheduler is the only owner of the piece manager and the sink; sessions
/// talk to it through a single event channel, so a block can never be handed
/// to two peers at once.
pub struct Scheduler<S: OutputSink> {
    config:    Config,
    info_hash: [u8; 20],
    pieces:    u32,
    manager:   PieceManager,
    sink:      S,
    sessions:  HashMap<SessionId, ActiveSession>,
    failed:    HashSet<Peer>,
    next_id:   SessionId,
    events_tx: mpsc::Sender<SessionEvent>,
    events_rx: mpsc::Receiver<SessionEvent>,
}

impl<S: OutputSink> Scheduler<S> {
    pub fn new(torrent: &Torrent, config: Config, sink: S) -> Self {
        let manager = PieceManager::new(torrent, config.block_size);
        Self::with_manager(torrent, config, sink, manager)
    }

    pub fn with_selector(
        torrent:  &Torrent,
        config:   Config,
        sink:     S,
        selector: Box<dyn PieceSelector>,
    ) -> Self {
        let manager = PieceManager::with_selector(torrent, config.block_size, selector);
        Self::with_manager(torrent, config, sink, manager)
    }

    fn with_manager(torrent: &Torrent, config: Config, sink: S, manager: PieceManager) -> Self {
        let (events_tx, events_rx) = mpsc::channel(config.event_queue_depth.max(1));
        Self {
            info_hash: torrent.info_hash,
            pieces: torrent.pieces_count() as u32,
            manager,
            sink,
            sessions: HashMap::new(),
            failed: HashSet::new(),
            next_id: 0,
            events_tx,
            events_rx,
            config,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.manager.is_complete()
    }

    /// Bytes not yet verified, as reported to the tracker in `left`
    pub fn remaining_bytes(&self) -> u64 {
        self.manager.remaining_bytes()
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    /// Downloads from `peers` until the torrent is complete.
    ///
    /// Fails with [`ApplicationError::DownloadStalled`] once every session has
    /// closed and no address is left to try. Progress is kept, so `run` can be
    /// called again with a fresh peer list. Addresses that failed before are
    /// skipped.
    pub async fn run(&mut self, peers: Vec<Peer>) -> Result<(), ApplicationError> {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<Peer> = peers
            .into_iter()
            .filter(|p| !self.failed.contains(p) && seen.insert(p.clone()))
            .collect();
        let mut connecting = Connecting::new();

        info!(
            peers     = queue.len(),
            remaining = self.manager.remaining_bytes(),
            "starting download"
        );

        loop {
            if self.manager.is_complete() {
                self.close_all();
                info!("all pieces verified");
                return Ok(());
            }

            self.spawn_connects(&mut queue, &mut connecting);
            if self.sessions.is_empty() && connecting.is_empty() {
                warn!(
                    verified = self.manager.verified_count(),
                    remaining = self.manager.remaining_bytes(),
                    "no peers left"
                );
                return Err(ApplicationError::DownloadStalled);
            }

            let deadline = self.next_wakeup();

            // Connections resolve first so a new session is registered
            // before any event its tasks send is handled
            tokio::select! {
                biased;
                Some((id, peer, result)) = connecting.next(), if !connecting.is_empty() => {
                    self.on_connected(id, peer, result);
                }
                Some(event) = self.events_rx.recv() => self.handle_event(event)?,
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.expire_requests();
                    self.drop_idle();
                }
            }
        }
    }

    fn spawn_connects(&mut self, queue: &mut VecDeque<Peer>, connecting: &mut Connecting) {
        while self.sessions.len() + connecting.len() < self.config.max_peers {
            let Some(peer) = queue.pop_front() else {
                break;
            };

            let id        = self.next_id;
            let config    = self.config.clone();
            let events    = self.events_tx.clone();
            let info_hash = self.info_hash;
            self.next_id += 1;

            debug!(session = id, peer = %peer, "connecting");
            connecting.push(Box::pin(async move {
                let result = PeerSession::connect(id, peer.clone(), info_hash, &config, events).await;
                (id, peer, result)
            }));
        }
    }

    fn on_connected(
        &mut self,
        id:     SessionId,
        peer:   Peer,
        result: Result<PeerSession, ApplicationError>,
    ) {
        let session = match result {
            Ok(session) => session,
            Err(e) => {
                warn!(peer = %peer, error = %e, "could not open session");
                self.failed.insert(peer);
                return;
            }
        };

        info!(session = id, peer = %peer, "peer connected");
        let choked = session.is_choked();
        if let Err(e) = session.send(Message::Interested) {
            debug!(session = id, error = %e, "session closed before interested");
        }

        self.sessions.insert(
            id,
            ActiveSession {
                session,
                choked,
                snubbed:      false,
                availability: Availability::new(self.pieces),
                last_active:  Instant::now(),
            },
        );
    }

    fn handle_event(&mut self, event: SessionEvent) -> Result<(), ApplicationError> {
        match event {
            SessionEvent::Unchoked(id) => {
                if let Some(active) = self.sessions.get_mut(&id) {
                    active.choked = false;
                }
                self.fill(id);
            }
            SessionEvent::Choked(id) => {
                // A choking peer drops whatever we had asked it for
                if let Some(active) = self.sessions.get_mut(&id) {
                    active.choked = true;
                    active.session.discard_queued_requests();
                }
                let released = self.manager.release_session(id);
                if !released.is_empty() {
                    debug!(session = id, count = released.len(), "choked, requests returned");
                    self.fill_all();
                }
            }
            SessionEvent::Have { session, index } => {
                if let Some(active) = self.sessions.get_mut(&session) {
                    if !active.availability.insert(index) {
                        warn!(session, index, pieces = self.pieces, "ignoring have past the last piece");
                    }
                }
                self.fill(session);
            }
            SessionEvent::Bitfield { session, bits } => {
                if let Some(active) = self.sessions.get_mut(&session) {
                    active.availability.set_bitfield(bits);
                }
                self.fill(session);
            }
            SessionEvent::Block { session, block } => self.on_block(session, block)?,
            SessionEvent::Closed { session, reason } => self.drop_session(session, reason),
        }
        Ok(())
    }

    fn on_block(&mut self, session: SessionId, block: Block) -> Result<(), ApplicationError> {
        let outcome = self.manager.on_block(session, block);
        if outcome != BlockOutcome::Discarded {
            if let Some(active) = self.sessions.get_mut(&session) {
                active.snubbed = false;
                active.last_active = Instant::now();
            }
        }

        match outcome {
            BlockOutcome::Verified { index, data } => {
                self.sink.write_piece(index, &data)?;
                info!(
                    piece    = index,
                    verified = self.manager.verified_count(),
                    left     = self.manager.remaining_bytes(),
                    "piece verified"
                );
            }
            BlockOutcome::Corrupt { .. } => self.fill_all(),
            BlockOutcome::Stored | BlockOutcome::Discarded => {}
        }

        self.fill(session);
        Ok(())
    }

    fn drop_session(&mut self, id: SessionId, reason: ApplicationError) {
        if let Some(active) = self.sessions.remove(&id) {
            warn!(session = id, peer = %active.session.peer(), error = %reason, "dropping peer");
            self.failed.insert(active.session.peer().clone());
        }

        let released = self.manager.release_session(id);
        if !released.is_empty() {
            debug!(session = id, count = released.len(), "requests returned to pool");
        }
        self.fill_all();
    }

    fn expire_requests(&mut self) {
        let expired = self
            .manager
            .expire(Instant::now(), self.config.request_timeout);
        if expired.is_empty() {
            return;
        }

        warn!(count = expired.len(), "requests timed out");
        for (id, req) in &expired {
            if let Some(active) = self.sessions.get_mut(id) {
                active.snubbed = true;
                let _ = active.session.cancel(*req);
            }
        }
        self.fill_all();
    }

    /// Closes sessions that had nothing in flight for the idle timeout, such
    /// as peers that keep us choked or lack every piece still missing.
    fn drop_idle(&mut self) {
        let now = Instant::now();
        let idle: Vec<_> = self
            .sessions
            .iter()
            .filter(|(id, active)| {
                self.manager.outstanding_for(**id) == 0
                    && now >= active.last_active + self.config.idle_timeout
            })
            .map(|(id, _)| *id)
            .collect();

        for id in idle {
            if let Some(active) = self.sessions.remove(&id) {
                info!(
                    session = id,
                    peer    = %active.session.peer(),
                    choked  = active.choked,
                    "dropping idle peer"
                );
                active.session.close();
            }
        }
    }

    /// Earliest of the next request timeout and the next idle deadline
    fn next_wakeup(&self) -> Option<Instant> {
        let idle = self
            .sessions
            .iter()
            .filter(|(id, _)| self.manager.outstanding_for(**id) == 0)
            .map(|(_, active)| active.last_active + self.config.idle_timeout)
            .min();
        [self.manager.next_deadline(self.config.request_timeout), idle]
            .into_iter()
            .flatten()
            .min()
    }

    /// Tops up the request pipeline of one session.
    fn fill(&mut self, id: SessionId) {
        let Some(active) = self.sessions.get_mut(&id) else {
            return;
        };
        if active.choked {
            return;
        }

        // A peer that let a request time out only gets one at a time
        let limit = if active.snubbed { 1 } else { self.config.pipeline_depth };
        let requests = self.manager.next_requests(
            id,
            |index| active.availability.has(index),
            limit,
            Instant::now(),
        );

        if !requests.is_empty() {
            active.last_active = Instant::now();
        }
        for req in requests {
            if let Err(e) = active.session.request(req) {
                // The session's Closed event returns the requests
                debug!(session = id, error = %e, "could not queue request");
                break;
            }
        }
    }

    /// Fills every pipeline, responsive sessions first.
    fn fill_all(&mut self) {
        let mut ids: Vec<_> = self
            .sessions
            .iter()
            .map(|(id, active)| (active.snubbed, *id))
            .collect();
        ids.sort_unstable();
        for (_, id) in ids {
            self.fill(id);
        }
    }

    fn close_all(&mut self) {
        for (_, active) in self.sessions.drain() {
            active.session.close();
        }
    }
}
