//! # Remora - DTLS Session Engine with Connection-ID Roaming
//!
//! Remora provides the session lifecycle machinery of a DTLS endpoint for
//! both client and server roles, built around two capabilities:
//!
//! - **PSK authentication**: the crypto backend carries pre-shared-key
//!   material; no certificate infrastructure is required
//! - **Connection IDs (RFC 9146)**: a peer's session survives
//!   network-address changes and node restarts, routed by the CID
//!   embedded in each post-handshake record
//!
//! ## Architecture
//!
//! The codebase uses the **Actor Pattern** for safe concurrent state:
//! the [`SessionEngine`] handle is cheap to clone and communicates via
//! async channels with an actor task that owns the session table and
//! processes commands sequentially. The DTLS primitive itself is not part
//! of this crate: it is consumed through the [`DtlsBackend`] contract, so
//! any compliant implementation (an mbedTLS wrapper, a pure-Rust stack)
//! substitutes cleanly.
//!
//! ## Session Lifecycle
//!
//! A per-peer state is created on the first unmatched datagram (server
//! role) or on [`SessionEngine::connect`] (client role), driven through
//! the handshake, and established on completion. Established sessions
//! decrypt inbound records and encrypt outbound plaintext; when one sits
//! idle past the configured timeout it is serialized to the
//! [`SessionStore`] under its connection ID and can be resurrected later
//! with [`SessionEngine::load_session`] at the same address or, after a
//! roam, a different one.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `endpoint` | High-level API combining engine, socket and store |
//! | `engine` | Per-peer session state machines, demux, timers, eviction |
//! | `crypto` | Crypto adapter contract over the external DTLS primitive |
//! | `store` | Session persistence contract and bounded in-memory store |
//! | `transport` | Outbound datagram contract over UDP |
//! | `events` | Lifecycle observer callbacks |

mod crypto;
mod endpoint;
mod engine;
mod events;
mod store;
mod transport;

pub use crypto::{
    peek_connection_id, random_cid, CryptoError, DtlsBackend, HandshakeCrypto, SessionCrypto,
    StepOutcome, CONTENT_TYPE_TLS12_CID,
};
pub use endpoint::{Endpoint, EndpointBuilder};
pub use engine::{
    DecryptedPacket, EngineConfig, ReceiveResult, SessionEngine, SessionInfo,
    DEFAULT_EXPIRE_AFTER, DEFAULT_MAX_SESSIONS,
};
pub use events::{HandshakeOutcome, LifecycleObserver, NullObserver, SessionEndReason};
pub use store::{
    MemoryStore, SessionStore, StoredSession, DEFAULT_MEMORY_STORE_CAPACITY,
    MAX_STORED_SESSION_SIZE,
};
pub use transport::{DatagramSink, UdpSink};
