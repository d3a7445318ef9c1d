//! Lifecycle observer interface.
//!
//! Purely observational callbacks for handshake and session transitions.
//! The engine invokes them synchronously from its actor task, so
//! implementations must return quickly; anything slow belongs behind a
//! channel on the implementor's side.

use std::net::SocketAddr;
use std::time::SystemTime;

use crate::crypto::CryptoError;

/// How a handshake ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeOutcome {
    Succeeded,
    Failed,
    /// No progress within the configured handshake ceiling.
    Expired,
}

/// Why an established session left the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEndReason {
    /// The peer sent `close_notify`.
    Closed,
    /// A fatal decrypt or encrypt error.
    Failed,
    /// No traffic within the idle timeout. The session is stored before
    /// this fires when it carries a connection ID.
    Expired,
}

/// Observer for engine lifecycle transitions.
///
/// All methods default to no-ops; implement only what you need. The same
/// peer address is used as the correlation key across all callbacks.
pub trait LifecycleObserver: Send + Sync {
    /// A handshake state was created for `peer`.
    fn handshake_started(&self, peer: SocketAddr) {
        let _ = peer;
    }

    /// The handshake for `peer` ended. `error` is present for
    /// [`HandshakeOutcome::Failed`] only.
    fn handshake_finished(
        &self,
        peer: SocketAddr,
        started_at: SystemTime,
        finished_at: SystemTime,
        outcome: HandshakeOutcome,
        error: Option<&CryptoError>,
    ) {
        let _ = (peer, started_at, finished_at, outcome, error);
    }

    /// An established session entered the table, either freshly
    /// handshaken (`reloaded == false`) or resurrected from storage.
    fn session_started(&self, peer: SocketAddr, cipher_suite: &str, reloaded: bool) {
        let _ = (peer, cipher_suite, reloaded);
    }

    /// An established session left the table.
    fn session_finished(
        &self,
        peer: SocketAddr,
        reason: SessionEndReason,
        error: Option<&CryptoError>,
    ) {
        let _ = (peer, reason, error);
    }

    /// An inbound datagram or a session-load attempt was discarded.
    fn message_dropped(&self, peer: SocketAddr) {
        let _ = peer;
    }
}

/// Observer that ignores every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullObserver;

impl LifecycleObserver for NullObserver {}
