//! # Crypto Adapter Contract
//!
//! This module defines the seam between the session engine and the DTLS
//! primitive. The engine never touches record-layer cryptography itself:
//! it drives an opaque handshake context until it yields an established
//! session context, then uses that context to encrypt, decrypt, and
//! save/restore sessions.
//!
//! ## Context Model
//!
//! - **Handshake context** (`HandshakeCrypto`): stepped with inbound
//!   datagrams until it completes or fails. Each step may emit outbound
//!   flights through the `send` callback.
//! - **Session context** (`SessionCrypto`): decrypts and encrypts
//!   application records, exposes the negotiated connection IDs, and can
//!   serialize itself to an opaque blob for later resurrection.
//!
//! ## Connection IDs
//!
//! All connection IDs produced by one backend instance share a single
//! length, learned once at engine startup from [`DtlsBackend::next_cid`].
//! [`peek_connection_id`] extracts the CID from a post-handshake record
//! (RFC 9146 `tls12_cid` content type) without any key material, which is
//! what lets the engine route datagrams from unknown source addresses.

use std::net::SocketAddr;
use std::time::Duration;

// ============================================================================
// Error Types
// ============================================================================

/// Failure surface of the DTLS primitive, as seen by the engine.
///
/// The engine classifies these three cases differently (quiet restart,
/// orderly shutdown, fatal), so backends must map their native errors onto
/// them rather than collapsing everything into `Ssl`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// The server demanded a stateless cookie before allocating state.
    /// Expected on the first flight of a server-side handshake; the client
    /// retries with the cookie echoed.
    HelloVerifyRequired,
    /// The peer sent `close_notify`: an orderly shutdown, not a failure.
    CloseNotify,
    /// Any other TLS-level failure (bad PSK, MAC failure, protocol error).
    Ssl(String),
}

impl std::fmt::Display for CryptoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CryptoError::HelloVerifyRequired => write!(f, "hello verify required"),
            CryptoError::CloseNotify => write!(f, "peer sent close_notify"),
            CryptoError::Ssl(msg) => write!(f, "ssl error: {}", msg),
        }
    }
}

impl std::error::Error for CryptoError {}

// ============================================================================
// Context Traits
// ============================================================================

/// Result of driving a handshake context with one datagram.
pub enum StepOutcome {
    /// More flights are required; the context stays in the table.
    Pending,
    /// The handshake completed and produced an established session context.
    Complete(Box<dyn SessionCrypto>),
}

/// An in-progress DTLS handshake.
///
/// `step` consumes one inbound datagram (empty for a locally-initiated
/// flight or a retransmission tick) and may invoke `send` zero or more
/// times with outbound datagrams before returning.
pub trait HandshakeCrypto: Send {
    fn step(
        &mut self,
        datagram: &[u8],
        send: &mut dyn FnMut(&[u8]),
    ) -> Result<StepOutcome, CryptoError>;

    /// Time until the primitive wants to retransmit its last flight.
    /// Zero means no retransmission is currently pending.
    fn read_timeout(&self) -> Duration;

    /// Release the context without completing the handshake.
    fn close(&mut self);
}

/// An established DTLS session.
pub trait SessionCrypto: Send {
    /// Decrypt one record. May invoke `send` (alerts). An empty return
    /// means the record was consumed without producing plaintext.
    fn decrypt(
        &mut self,
        datagram: &[u8],
        send: &mut dyn FnMut(&[u8]),
    ) -> Result<Vec<u8>, CryptoError>;

    /// Encrypt one application payload into a record.
    fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// Serialize the session to an opaque blob and release the context.
    /// The blob must round-trip through [`DtlsBackend::load_session`].
    fn save_and_close(self: Box<Self>) -> Result<Vec<u8>, CryptoError>;

    /// Release the context without saving.
    fn close(&mut self);

    /// The connection ID this endpoint told the peer to send, if any.
    fn own_cid(&self) -> Option<Vec<u8>>;

    /// The connection ID the peer told this endpoint to send, if any.
    fn peer_cid(&self) -> Option<Vec<u8>>;

    fn cipher_suite(&self) -> String;

    fn peer_certificate_subject(&self) -> Option<String>;

    /// Whether this context was resurrected from a stored blob.
    fn reloaded(&self) -> bool;
}

// ============================================================================
// Backend Factory
// ============================================================================

/// Factory for crypto contexts. One backend instance carries the PSK
/// material, role (client/server), cipher-suite list and CID supplier; all
/// of that is opaque to the engine.
pub trait DtlsBackend: Send + Sync {
    /// Produce the next connection ID. Called once at engine startup to
    /// learn the CID length for this endpoint; an empty result disables
    /// CID routing entirely.
    fn next_cid(&self) -> Vec<u8>;

    /// Build a handshake context for a peer.
    fn new_handshake(&self, peer: SocketAddr) -> Result<Box<dyn HandshakeCrypto>, CryptoError>;

    /// Reconstruct an established session context from a stored blob.
    fn load_session(
        &self,
        cid: &[u8],
        blob: &[u8],
        peer: SocketAddr,
    ) -> Result<Box<dyn SessionCrypto>, CryptoError>;

    /// Extract the connection ID from a post-handshake record, if the
    /// datagram carries one of the expected length.
    fn peek_cid<'a>(&self, cid_len: usize, datagram: &'a [u8]) -> Option<&'a [u8]> {
        peek_connection_id(cid_len, datagram)
    }
}

// ============================================================================
// CID Record Peeking
// ============================================================================

/// RFC 9146 `tls12_cid` content type.
pub const CONTENT_TYPE_TLS12_CID: u8 = 25;

/// DTLS record header before the CID: type(1) + version(2) + epoch(2) + seq(6).
const CID_RECORD_CID_OFFSET: usize = 11;

/// Extract the connection ID from a DTLS 1.2 record carrying one.
///
/// Returns `None` unless the datagram starts with a `tls12_cid` record of a
/// plausible DTLS version with at least `cid_len` CID bytes plus the
/// two-byte length field behind them. `cid_len == 0` never matches.
pub fn peek_connection_id(cid_len: usize, datagram: &[u8]) -> Option<&[u8]> {
    if cid_len == 0 {
        return None;
    }
    if datagram.len() < CID_RECORD_CID_OFFSET + cid_len + 2 {
        return None;
    }
    if datagram[0] != CONTENT_TYPE_TLS12_CID {
        return None;
    }
    // DTLS versions on the wire: 0xfeff (1.0) and 0xfefd (1.2).
    if datagram[1] != 0xfe || (datagram[2] != 0xfd && datagram[2] != 0xff) {
        return None;
    }
    Some(&datagram[CID_RECORD_CID_OFFSET..CID_RECORD_CID_OFFSET + cid_len])
}

/// Generate a random connection ID of the given length.
///
/// Suitable as the basis of a backend's CID supplier.
pub fn random_cid(len: usize) -> Result<Vec<u8>, CryptoError> {
    let mut cid = vec![0u8; len];
    getrandom::getrandom(&mut cid)
        .map_err(|e| CryptoError::Ssl(format!("CSPRNG unavailable: {}", e)))?;
    Ok(cid)
}
