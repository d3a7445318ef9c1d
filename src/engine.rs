//! # Session Engine
//!
//! Per-peer DTLS session lifecycle engine with actor-based architecture.
//! The engine multiplexes UDP datagrams into per-peer state machines,
//! drives handshakes through the crypto backend, routes post-handshake
//! records by connection ID when the source address is unknown, and
//! evicts idle sessions to the session store so they can be resurrected
//! later, possibly at a different address.
//!
//! # Architecture
//!
//! - [`SessionEngine`]: the public handle (cheap to clone, sends commands
//!   to the actor)
//! - `EngineActor`: owns the session table, processes commands sequentially
//! - `EngineCommand`: commands sent from handles to the actor
//!
//! The session table is intentionally unsynchronized: every mutation
//! (including timer expirations) is marshalled onto the single actor
//! task. Timers are spawned sleep tasks
//! that post a `TimerEvent` back into the actor; a monotonically
//! increasing epoch makes stale fires (cancelled timers that raced their
//! abort) detectable.
//!
//! # Inbound Classification
//!
//! For a datagram from `peer`:
//!
//! 1. Existing handshake state → drive the handshake.
//! 2. Existing established state → decrypt.
//! 3. No state, record carries an extractable connection ID →
//!    [`ReceiveResult::CidSessionMissing`]; the caller consults its store
//!    and calls [`SessionEngine::load_session`].
//! 4. Otherwise → start a new handshake.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::crypto::{CryptoError, DtlsBackend, HandshakeCrypto, SessionCrypto, StepOutcome};
use crate::events::{HandshakeOutcome, LifecycleObserver, SessionEndReason};
use crate::store::{SessionStore, StoredSession};
use crate::transport::DatagramSink;

// ============================================================================
// Constants
// ============================================================================

/// Idle timeout for established sessions and hard ceiling for handshakes.
pub const DEFAULT_EXPIRE_AFTER: Duration = Duration::from_secs(60);

/// Maximum per-peer states the engine will track.
/// SECURITY: bounds session table growth from handshake floods.
pub const DEFAULT_MAX_SESSIONS: usize = 10_000;

/// Command mailbox capacity.
const DEFAULT_MAILBOX: usize = 256;

// ============================================================================
// Public Types
// ============================================================================

/// Engine tunables. Collaborators (backend, sink, store, observer) are
/// passed to [`SessionEngine::spawn`] directly.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Idle timeout for established sessions; also the handshake ceiling
    /// when the backend reports no retransmission pending.
    pub expire_after: Duration,
    /// Refuse new handshakes beyond this many tracked peers.
    pub max_sessions: usize,
    /// Capacity of the command and timer mailboxes.
    pub mailbox: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            expire_after: DEFAULT_EXPIRE_AFTER,
            max_sessions: DEFAULT_MAX_SESSIONS,
            mailbox: DEFAULT_MAILBOX,
        }
    }
}

/// Snapshot of session identity attached to every decrypted packet, so
/// downstream consumers can attribute application data to an
/// authenticated peer even as its address changes.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub peer_certificate_subject: Option<String>,
    pub authentication_context: HashMap<String, String>,
    /// Own connection ID if non-empty, otherwise the peer's.
    pub cid: Vec<u8>,
    pub session_start: SystemTime,
}

/// Application plaintext produced by [`SessionEngine::handle_inbound`].
#[derive(Debug, Clone)]
pub struct DecryptedPacket {
    pub peer: SocketAddr,
    pub payload: Vec<u8>,
    pub session: SessionInfo,
}

/// Outcome of dispatching one inbound datagram.
#[derive(Debug)]
pub enum ReceiveResult {
    /// Progressed a handshake, consumed an alert, or produced no plaintext.
    Handled,
    /// Application plaintext with its session context snapshot.
    Decrypted(DecryptedPacket),
    /// The established state failed to decrypt and has been removed.
    DecryptFailed,
    /// No state exists for the source address but the record carries this
    /// connection ID. The caller should fetch the stored session and call
    /// [`SessionEngine::load_session`].
    CidSessionMissing(Vec<u8>),
}

// ============================================================================
// Timers
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    /// Re-enter the handshake with an empty datagram (DTLS retransmission).
    Retransmit,
    /// Give up on a handshake that made no progress.
    HandshakeExpiry,
    /// Evict an idle established session (store-and-close).
    IdleExpiry,
}

struct TimerEvent {
    peer: SocketAddr,
    epoch: u64,
    kind: TimerKind,
}

/// The single pending timer of a per-peer state. Aborts its sleep task on
/// drop, so cancel-and-replace is a plain assignment and every state
/// removal cancels implicitly. The epoch survives for the stale-fire check.
struct TimerHandle {
    task: JoinHandle<()>,
    epoch: u64,
}

impl TimerHandle {
    fn cancel(&self) {
        self.task.abort();
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

// ============================================================================
// Per-Peer State
// ============================================================================

struct HandshakeState {
    ctx: Box<dyn HandshakeCrypto>,
    timer: TimerHandle,
    started_at: SystemTime,
}

struct EstablishedState {
    ctx: Box<dyn SessionCrypto>,
    timer: TimerHandle,
    auth: HashMap<String, String>,
    started_at: SystemTime,
}

impl EstablishedState {
    fn snapshot(&self) -> SessionInfo {
        let own = self.ctx.own_cid().unwrap_or_default();
        let cid = if own.is_empty() {
            self.ctx.peer_cid().unwrap_or_default()
        } else {
            own
        };
        SessionInfo {
            peer_certificate_subject: self.ctx.peer_certificate_subject(),
            authentication_context: self.auth.clone(),
            cid,
            session_start: self.started_at,
        }
    }
}

enum PeerState {
    Handshaking(HandshakeState),
    Established(EstablishedState),
}

impl PeerState {
    fn timer_epoch(&self) -> u64 {
        match self {
            PeerState::Handshaking(hs) => hs.timer.epoch,
            PeerState::Established(es) => es.timer.epoch,
        }
    }
}

// ============================================================================
// Commands sent from Handle to Actor
// ============================================================================

enum EngineCommand {
    Inbound {
        peer: SocketAddr,
        datagram: Vec<u8>,
        reply: oneshot::Sender<ReceiveResult>,
    },
    Connect {
        peer: SocketAddr,
        reply: oneshot::Sender<bool>,
    },
    Encrypt {
        peer: SocketAddr,
        plaintext: Vec<u8>,
        reply: oneshot::Sender<Result<Option<Vec<u8>>, CryptoError>>,
    },
    LoadSession {
        peer: SocketAddr,
        cid: Vec<u8>,
        stored: Option<StoredSession>,
        reply: oneshot::Sender<bool>,
    },
    PutAuthContext {
        peer: SocketAddr,
        key: String,
        value: Option<String>,
        reply: oneshot::Sender<bool>,
    },
    SessionCount {
        reply: oneshot::Sender<usize>,
    },
    CloseAll {
        reply: oneshot::Sender<()>,
    },
    Quit,
}

// ============================================================================
// SessionEngine Handle (public API - cheap to clone)
// ============================================================================

/// Handle to the session engine actor. Cheap to clone.
#[derive(Clone)]
pub struct SessionEngine {
    cmd_tx: mpsc::Sender<EngineCommand>,
}

impl std::fmt::Debug for SessionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionEngine").finish_non_exhaustive()
    }
}

impl SessionEngine {
    /// Spawn the engine actor with its collaborators.
    ///
    /// The connection-ID length for this endpoint is learned once here
    /// from `backend.next_cid()`; an empty CID disables CID routing.
    pub fn spawn(
        backend: Arc<dyn DtlsBackend>,
        sink: Arc<dyn DatagramSink>,
        store: Arc<dyn SessionStore>,
        observer: Arc<dyn LifecycleObserver>,
        config: EngineConfig,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(config.mailbox);
        let (timer_tx, timer_rx) = mpsc::channel(config.mailbox);

        let cid_len = backend.next_cid().len();
        info!(
            cid_len,
            expire_after_ms = config.expire_after.as_millis() as u64,
            max_sessions = config.max_sessions,
            "session engine started"
        );

        let actor = EngineActor {
            backend,
            sink,
            store,
            observer,
            expire_after: config.expire_after,
            max_sessions: config.max_sessions,
            cid_len,
            sessions: HashMap::new(),
            timer_tx,
            next_epoch: 0,
        };
        tokio::spawn(actor.run(cmd_rx, timer_rx));

        Self { cmd_tx }
    }

    /// Classify and dispatch one inbound datagram from `peer`.
    pub async fn handle_inbound(&self, peer: SocketAddr, datagram: Vec<u8>) -> ReceiveResult {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(EngineCommand::Inbound {
                peer,
                datagram,
                reply: reply_tx,
            })
            .await
            .is_err()
        {
            return ReceiveResult::Handled;
        }
        reply_rx.await.unwrap_or(ReceiveResult::Handled)
    }

    /// Initiate a client-role handshake toward `peer`, emitting the first
    /// flight. Returns false if a state already exists for `peer` or the
    /// handshake could not be started.
    pub async fn connect(&self, peer: SocketAddr) -> bool {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(EngineCommand::Connect {
                peer,
                reply: reply_tx,
            })
            .await
            .is_err()
        {
            return false;
        }
        reply_rx.await.unwrap_or(false)
    }

    /// Encrypt application plaintext for `peer`. `Ok(None)` when no
    /// established session exists. A fatal encrypt error removes the
    /// session and is returned to the caller.
    pub async fn encrypt_outbound(
        &self,
        peer: SocketAddr,
        plaintext: Vec<u8>,
    ) -> Result<Option<Vec<u8>>, CryptoError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(EngineCommand::Encrypt {
                peer,
                plaintext,
                reply: reply_tx,
            })
            .await
            .is_err()
        {
            return Ok(None);
        }
        reply_rx.await.unwrap_or(Ok(None))
    }

    /// Resurrect a stored session for `peer` under `cid`. Passing `None`
    /// for `stored` reports the triggering datagram as dropped and returns
    /// false (the CID was unknown to the caller's store).
    pub async fn load_session(
        &self,
        peer: SocketAddr,
        cid: Vec<u8>,
        stored: Option<StoredSession>,
    ) -> bool {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(EngineCommand::LoadSession {
                peer,
                cid,
                stored,
                reply: reply_tx,
            })
            .await
            .is_err()
        {
            return false;
        }
        reply_rx.await.unwrap_or(false)
    }

    /// Set (`Some`) or remove (`None`) an authentication-context entry on
    /// the established session for `peer`. Returns true iff the state was
    /// established; values offered earlier are silently dropped, so
    /// callers retry after `session_started`.
    pub async fn put_auth_context(
        &self,
        peer: SocketAddr,
        key: impl Into<String>,
        value: Option<String>,
    ) -> bool {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(EngineCommand::PutAuthContext {
                peer,
                key: key.into(),
                value,
                reply: reply_tx,
            })
            .await
            .is_err()
        {
            return false;
        }
        reply_rx.await.unwrap_or(false)
    }

    /// Number of per-peer states currently tracked.
    pub async fn session_count(&self) -> usize {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(EngineCommand::SessionCount { reply: reply_tx })
            .await
            .is_err()
        {
            return 0;
        }
        reply_rx.await.unwrap_or(0)
    }

    /// Store-and-close every established session, close every pending
    /// handshake, and clear the table.
    pub async fn close_all(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(EngineCommand::CloseAll { reply: reply_tx })
            .await
            .is_ok()
        {
            let _ = reply_rx.await;
        }
    }

    /// Drain the table and stop the actor.
    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(EngineCommand::Quit).await;
    }
}

// ============================================================================
// EngineActor (owns the session table, processes commands sequentially)
// ============================================================================

struct EngineActor {
    backend: Arc<dyn DtlsBackend>,
    sink: Arc<dyn DatagramSink>,
    store: Arc<dyn SessionStore>,
    observer: Arc<dyn LifecycleObserver>,
    expire_after: Duration,
    max_sessions: usize,
    cid_len: usize,
    sessions: HashMap<SocketAddr, PeerState>,
    timer_tx: mpsc::Sender<TimerEvent>,
    next_epoch: u64,
}

impl EngineActor {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<EngineCommand>,
        mut timer_rx: mpsc::Receiver<TimerEvent>,
    ) {
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(EngineCommand::Inbound { peer, datagram, reply }) => {
                            let _ = reply.send(self.on_inbound(peer, &datagram));
                        }
                        Some(EngineCommand::Connect { peer, reply }) => {
                            let _ = reply.send(self.on_connect(peer));
                        }
                        Some(EngineCommand::Encrypt { peer, plaintext, reply }) => {
                            let _ = reply.send(self.on_encrypt(peer, &plaintext));
                        }
                        Some(EngineCommand::LoadSession { peer, cid, stored, reply }) => {
                            let _ = reply.send(self.on_load_session(peer, &cid, stored));
                        }
                        Some(EngineCommand::PutAuthContext { peer, key, value, reply }) => {
                            let _ = reply.send(self.on_put_auth_context(peer, key, value));
                        }
                        Some(EngineCommand::SessionCount { reply }) => {
                            let _ = reply.send(self.sessions.len());
                        }
                        Some(EngineCommand::CloseAll { reply }) => {
                            self.close_all();
                            let _ = reply.send(());
                        }
                        Some(EngineCommand::Quit) | None => {
                            self.close_all();
                            debug!("session engine actor shutting down");
                            break;
                        }
                    }
                }
                Some(ev) = timer_rx.recv() => self.on_timer(ev),
            }
        }
    }

    // ------------------------------------------------------------------
    // Inbound classification
    // ------------------------------------------------------------------

    fn on_inbound(&mut self, peer: SocketAddr, datagram: &[u8]) -> ReceiveResult {
        match self.sessions.remove(&peer) {
            Some(PeerState::Handshaking(hs)) => {
                self.drive_handshake(peer, hs, datagram);
                ReceiveResult::Handled
            }
            Some(PeerState::Established(es)) => self.drive_established(peer, es, datagram),
            None => {
                if let Some(cid) = self.backend.peek_cid(self.cid_len, datagram) {
                    // Post-handshake record from an address we do not know:
                    // the session may live in external storage under this CID.
                    trace!(
                        peer = %peer,
                        cid = %hex::encode(cid),
                        "cid record without session, deferring to store"
                    );
                    return ReceiveResult::CidSessionMissing(cid.to_vec());
                }
                if let Some(hs) = self.begin_handshake(peer) {
                    self.drive_handshake(peer, hs, datagram);
                }
                ReceiveResult::Handled
            }
        }
    }

    fn on_connect(&mut self, peer: SocketAddr) -> bool {
        if self.sessions.contains_key(&peer) {
            debug!(peer = %peer, "connect ignored, peer already tracked");
            return false;
        }
        match self.begin_handshake(peer) {
            Some(hs) => {
                // An empty datagram makes the context emit its first flight.
                self.drive_handshake(peer, hs, &[]);
                self.sessions.contains_key(&peer)
            }
            None => false,
        }
    }

    /// Create a handshake state for `peer`, enforcing the table bound.
    /// Fires `handshake_started`; on backend failure fires
    /// `handshake_finished(Failed)` and `message_dropped`.
    fn begin_handshake(&mut self, peer: SocketAddr) -> Option<HandshakeState> {
        if self.sessions.len() >= self.max_sessions {
            warn!(peer = %peer, limit = self.max_sessions, "session table full, dropping datagram");
            self.observer.message_dropped(peer);
            return None;
        }
        let started_at = SystemTime::now();
        self.observer.handshake_started(peer);
        match self.backend.new_handshake(peer) {
            Ok(ctx) => {
                debug!(peer = %peer, "handshake started");
                // Placeholder deadline; drive_handshake reschedules after
                // every step.
                let timer = self.schedule(peer, self.expire_after, TimerKind::HandshakeExpiry);
                Some(HandshakeState {
                    ctx,
                    timer,
                    started_at,
                })
            }
            Err(e) => {
                warn!(peer = %peer, error = %e, "handshake context creation failed");
                self.observer.handshake_finished(
                    peer,
                    started_at,
                    SystemTime::now(),
                    HandshakeOutcome::Failed,
                    Some(&e),
                );
                self.observer.message_dropped(peer);
                None
            }
        }
    }

    // ------------------------------------------------------------------
    // Handshake driver
    // ------------------------------------------------------------------

    /// Step a handshake with one datagram (empty for first flight or a
    /// retransmission tick) and reinsert or discard the state by outcome.
    fn drive_handshake(&mut self, peer: SocketAddr, mut hs: HandshakeState, datagram: &[u8]) {
        hs.timer.cancel();

        let sink = Arc::clone(&self.sink);
        let mut send = |flight: &[u8]| sink.send(flight, peer);

        match hs.ctx.step(datagram, &mut send) {
            Ok(StepOutcome::Pending) => {
                let read_timeout = hs.ctx.read_timeout();
                hs.timer = if read_timeout > Duration::ZERO {
                    self.schedule(peer, read_timeout, TimerKind::Retransmit)
                } else {
                    self.schedule(peer, self.expire_after, TimerKind::HandshakeExpiry)
                };
                self.sessions.insert(peer, PeerState::Handshaking(hs));
            }
            Ok(StepOutcome::Complete(ctx)) => {
                let finished_at = SystemTime::now();
                self.observer.handshake_finished(
                    peer,
                    hs.started_at,
                    finished_at,
                    HandshakeOutcome::Succeeded,
                    None,
                );
                let cipher_suite = ctx.cipher_suite();
                let reloaded = ctx.reloaded();
                debug!(
                    peer = %peer,
                    cipher_suite = %cipher_suite,
                    cid = %hex::encode(ctx.own_cid().unwrap_or_default()),
                    "handshake complete"
                );
                let timer = self.schedule(peer, self.expire_after, TimerKind::IdleExpiry);
                self.sessions.insert(
                    peer,
                    PeerState::Established(EstablishedState {
                        ctx,
                        timer,
                        auth: HashMap::new(),
                        started_at: finished_at,
                    }),
                );
                self.observer.session_started(peer, &cipher_suite, reloaded);
            }
            Err(CryptoError::HelloVerifyRequired) => {
                // Expected when the server demands a stateless cookie: the
                // peer retries and the next ClientHello starts fresh.
                debug!(peer = %peer, "hello verify requested, discarding handshake state");
                hs.ctx.close();
                self.observer.handshake_finished(
                    peer,
                    hs.started_at,
                    SystemTime::now(),
                    HandshakeOutcome::Failed,
                    Some(&CryptoError::HelloVerifyRequired),
                );
            }
            Err(e) => {
                warn!(peer = %peer, error = %e, "handshake failed");
                hs.ctx.close();
                self.observer.handshake_finished(
                    peer,
                    hs.started_at,
                    SystemTime::now(),
                    HandshakeOutcome::Failed,
                    Some(&e),
                );
                self.observer.message_dropped(peer);
            }
        }
    }

    // ------------------------------------------------------------------
    // Established driver
    // ------------------------------------------------------------------

    fn drive_established(
        &mut self,
        peer: SocketAddr,
        mut es: EstablishedState,
        datagram: &[u8],
    ) -> ReceiveResult {
        es.timer.cancel();

        let sink = Arc::clone(&self.sink);
        let mut send = |alert: &[u8]| sink.send(alert, peer);

        match es.ctx.decrypt(datagram, &mut send) {
            Ok(plaintext) => {
                es.timer = self.schedule(peer, self.expire_after, TimerKind::IdleExpiry);
                if plaintext.is_empty() {
                    self.sessions.insert(peer, PeerState::Established(es));
                    return ReceiveResult::Handled;
                }
                let session = es.snapshot();
                self.sessions.insert(peer, PeerState::Established(es));
                ReceiveResult::Decrypted(DecryptedPacket {
                    peer,
                    payload: plaintext,
                    session,
                })
            }
            Err(CryptoError::CloseNotify) => {
                debug!(peer = %peer, "peer closed session");
                self.observer
                    .session_finished(peer, SessionEndReason::Closed, None);
                es.ctx.close();
                ReceiveResult::DecryptFailed
            }
            Err(e) => {
                warn!(peer = %peer, error = %e, "decrypt failed, removing session");
                self.observer
                    .session_finished(peer, SessionEndReason::Failed, Some(&e));
                self.observer.message_dropped(peer);
                es.ctx.close();
                ReceiveResult::DecryptFailed
            }
        }
    }

    fn on_encrypt(
        &mut self,
        peer: SocketAddr,
        plaintext: &[u8],
    ) -> Result<Option<Vec<u8>>, CryptoError> {
        match self.sessions.remove(&peer) {
            Some(PeerState::Established(mut es)) => match es.ctx.encrypt(plaintext) {
                Ok(record) => {
                    self.sessions.insert(peer, PeerState::Established(es));
                    Ok(Some(record))
                }
                Err(e) => {
                    warn!(peer = %peer, error = %e, "encrypt failed, removing session");
                    self.observer
                        .session_finished(peer, SessionEndReason::Failed, Some(&e));
                    es.ctx.close();
                    Err(e)
                }
            },
            Some(other) => {
                self.sessions.insert(peer, other);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    // ------------------------------------------------------------------
    // Session restore
    // ------------------------------------------------------------------

    fn on_load_session(
        &mut self,
        peer: SocketAddr,
        cid: &[u8],
        stored: Option<StoredSession>,
    ) -> bool {
        let Some(stored) = stored else {
            debug!(peer = %peer, cid = %hex::encode(cid), "no stored session for cid");
            self.observer.message_dropped(peer);
            return false;
        };
        match self.backend.load_session(cid, &stored.session_blob, peer) {
            Ok(ctx) => {
                // Close-and-replace any state already at this address; its
                // timer dies with it and no lifecycle event fires for it.
                match self.sessions.remove(&peer) {
                    Some(PeerState::Handshaking(mut old)) => old.ctx.close(),
                    Some(PeerState::Established(mut old)) => old.ctx.close(),
                    None => {}
                }
                let cipher_suite = ctx.cipher_suite();
                let reloaded = ctx.reloaded();
                debug!(
                    peer = %peer,
                    cid = %hex::encode(cid),
                    cipher_suite = %cipher_suite,
                    "session resurrected from store"
                );
                let timer = self.schedule(peer, self.expire_after, TimerKind::IdleExpiry);
                self.sessions.insert(
                    peer,
                    PeerState::Established(EstablishedState {
                        ctx,
                        timer,
                        started_at: stored.session_start(),
                        auth: stored.authentication_context,
                    }),
                );
                self.observer.session_started(peer, &cipher_suite, reloaded);
                true
            }
            Err(e) => {
                warn!(peer = %peer, cid = %hex::encode(cid), error = %e, "session restore failed");
                self.observer.message_dropped(peer);
                false
            }
        }
    }

    fn on_put_auth_context(
        &mut self,
        peer: SocketAddr,
        key: String,
        value: Option<String>,
    ) -> bool {
        match self.sessions.get_mut(&peer) {
            Some(PeerState::Established(es)) => {
                match value {
                    Some(value) => {
                        es.auth.insert(key, value);
                    }
                    None => {
                        es.auth.remove(&key);
                    }
                }
                true
            }
            _ => false,
        }
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    fn schedule(&mut self, peer: SocketAddr, delay: Duration, kind: TimerKind) -> TimerHandle {
        self.next_epoch += 1;
        let epoch = self.next_epoch;
        let timer_tx = self.timer_tx.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = timer_tx.send(TimerEvent { peer, epoch, kind }).await;
        });
        TimerHandle { task, epoch }
    }

    fn on_timer(&mut self, ev: TimerEvent) {
        // A fire that raced its cancellation carries a stale epoch; the
        // state it belonged to is gone or has a newer timer.
        let current = match self.sessions.get(&ev.peer) {
            Some(state) => state.timer_epoch(),
            None => {
                trace!(peer = %ev.peer, "timer fired for removed state");
                return;
            }
        };
        if current != ev.epoch {
            trace!(peer = %ev.peer, "stale timer fire ignored");
            return;
        }

        // The epoch matched, so the state at this address is the one that
        // scheduled the timer and its variant agrees with the kind.
        match (ev.kind, self.sessions.remove(&ev.peer)) {
            (TimerKind::Retransmit, Some(PeerState::Handshaking(hs))) => {
                trace!(peer = %ev.peer, "handshake retransmission tick");
                self.drive_handshake(ev.peer, hs, &[]);
            }
            (TimerKind::HandshakeExpiry, Some(PeerState::Handshaking(mut hs))) => {
                debug!(peer = %ev.peer, "handshake expired");
                hs.ctx.close();
                self.observer.handshake_finished(
                    ev.peer,
                    hs.started_at,
                    SystemTime::now(),
                    HandshakeOutcome::Expired,
                    None,
                );
            }
            (TimerKind::IdleExpiry, Some(PeerState::Established(es))) => {
                debug!(peer = %ev.peer, "session idle, evicting");
                self.store_and_close(ev.peer, es);
                self.observer
                    .session_finished(ev.peer, SessionEndReason::Expired, None);
            }
            (kind, Some(state)) => {
                warn!(peer = %ev.peer, kind = ?kind, "timer kind does not match state, ignoring");
                self.sessions.insert(ev.peer, state);
            }
            (_, None) => {}
        }
    }

    // ------------------------------------------------------------------
    // Store-and-close
    // ------------------------------------------------------------------

    /// Persist an established session under its own CID, then close it.
    /// Sessions without a CID cannot be routed back, so they just close.
    fn store_and_close(&mut self, peer: SocketAddr, es: EstablishedState) {
        let EstablishedState {
            ctx,
            timer: _timer,
            auth,
            started_at,
        } = es;

        let cid = ctx.own_cid().unwrap_or_default();
        if cid.is_empty() {
            let mut ctx = ctx;
            ctx.close();
            return;
        }

        match ctx.save_and_close() {
            Ok(blob) => {
                let stored = StoredSession::new(blob, auth, started_at);
                if let Err(e) = self.store.store_session(&cid, stored) {
                    warn!(peer = %peer, cid = %hex::encode(&cid), error = %e, "session store failed");
                } else {
                    debug!(peer = %peer, cid = %hex::encode(&cid), "session stored");
                }
            }
            Err(e) => {
                warn!(peer = %peer, cid = %hex::encode(&cid), error = %e, "session save failed");
            }
        }
    }

    fn close_all(&mut self) {
        let drained: Vec<(SocketAddr, PeerState)> = self.sessions.drain().collect();
        let count = drained.len();
        for (peer, state) in drained {
            match state {
                PeerState::Handshaking(mut hs) => {
                    hs.timer.cancel();
                    hs.ctx.close();
                }
                PeerState::Established(es) => {
                    es.timer.cancel();
                    self.store_and_close(peer, es);
                }
            }
        }
        if count > 0 {
            debug!(closed = count, "closed all sessions");
        }
    }
}
