//! # High-Level DTLS Endpoint
//!
//! This module provides the main entry point for using Remora. An
//! [`Endpoint`] combines the underlying components (session engine, UDP
//! socket, session store) into a single unified interface for both
//! client and server roles.
//!
//! ## Quick Start
//!
//! ```ignore
//! // Bind a server endpoint with a backend over your DTLS primitive
//! let endpoint = Endpoint::bind("0.0.0.0:5684", backend).await?;
//!
//! // Receive decrypted application data
//! let mut rx = endpoint.incoming().await.expect("receiver already taken");
//! while let Some(packet) = rx.recv().await {
//!     println!("{} sent {} bytes", packet.peer, packet.payload.len());
//! }
//! ```
//!
//! ## CID Read-Through
//!
//! The inbound pump wires the engine to the store: when a record carries a
//! connection ID for which no state exists at the source address (the peer
//! roamed, or this node restarted), the pump fetches the stored session,
//! resurrects it, and replays the triggering datagram so it decrypts
//! immediately. A record whose CID the store does not know is dropped.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::crypto::DtlsBackend;
use crate::engine::{DecryptedPacket, EngineConfig, ReceiveResult, SessionEngine};
use crate::events::{LifecycleObserver, NullObserver};
use crate::store::{MemoryStore, SessionStore};
use crate::transport::{DatagramSink, UdpSink};

/// Capacity of the decrypted-packet channel handed to the application.
const INCOMING_CAPACITY: usize = 256;

/// Receive buffer size; enough to hold the maximum UDP datagram.
const RECV_BUFFER_SIZE: usize = 1 << 16;

/// A receiver that can be taken exactly once via `.take()`.
/// Used for message receivers that should only have one consumer.
type TakeOnce<T> = tokio::sync::Mutex<Option<mpsc::Receiver<T>>>;

/// Configures and binds an [`Endpoint`].
pub struct EndpointBuilder {
    backend: Arc<dyn DtlsBackend>,
    store: Arc<dyn SessionStore>,
    observer: Arc<dyn LifecycleObserver>,
    config: EngineConfig,
}

impl EndpointBuilder {
    pub fn new(backend: Arc<dyn DtlsBackend>) -> Self {
        Self {
            backend,
            store: Arc::new(MemoryStore::new()),
            observer: Arc::new(NullObserver),
            config: EngineConfig::default(),
        }
    }

    /// External session store (defaults to a bounded in-memory store).
    pub fn store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = store;
        self
    }

    /// Lifecycle observer (defaults to a no-op).
    pub fn observer(mut self, observer: Arc<dyn LifecycleObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Idle timeout for established sessions and handshake ceiling.
    pub fn expire_after(mut self, expire_after: Duration) -> Self {
        self.config.expire_after = expire_after;
        self
    }

    /// Maximum tracked peers.
    pub fn max_sessions(mut self, max_sessions: usize) -> Self {
        self.config.max_sessions = max_sessions;
        self
    }

    /// Bind the UDP socket and spawn the engine and inbound pump.
    pub async fn bind(self, addr: &str) -> Result<Endpoint> {
        let addr: SocketAddr = addr.parse().context("invalid socket address")?;
        let socket = UdpSocket::bind(addr)
            .await
            .context("failed to bind UDP socket")?;
        let local_addr = socket.local_addr()?;
        let socket = Arc::new(socket);

        let sink: Arc<dyn DatagramSink> = Arc::new(UdpSink::new(socket.clone()));
        let engine = SessionEngine::spawn(
            self.backend,
            sink.clone(),
            self.store.clone(),
            self.observer,
            self.config,
        );

        let (incoming_tx, incoming_rx) = mpsc::channel(INCOMING_CAPACITY);
        let pump = tokio::spawn(pump_inbound(
            socket.clone(),
            engine.clone(),
            self.store,
            incoming_tx,
        ));

        info!(addr = %local_addr, "dtls endpoint listening");

        Ok(Endpoint {
            engine,
            sink,
            local_addr,
            incoming_rx: tokio::sync::Mutex::new(Some(incoming_rx)),
            pump,
        })
    }
}

/// A bound DTLS endpoint: engine + socket + store, for client and server
/// roles alike.
pub struct Endpoint {
    engine: SessionEngine,
    sink: Arc<dyn DatagramSink>,
    local_addr: SocketAddr,
    incoming_rx: TakeOnce<DecryptedPacket>,
    pump: tokio::task::JoinHandle<()>,
}

impl Endpoint {
    pub fn builder(backend: Arc<dyn DtlsBackend>) -> EndpointBuilder {
        EndpointBuilder::new(backend)
    }

    /// Bind with default store, observer and configuration.
    pub async fn bind(addr: &str, backend: Arc<dyn DtlsBackend>) -> Result<Self> {
        EndpointBuilder::new(backend).bind(addr).await
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Handle to the underlying engine for advanced use.
    pub fn engine(&self) -> &SessionEngine {
        &self.engine
    }

    /// Take the decrypted-packet receiver.
    ///
    /// Returns `None` if already taken.
    pub async fn incoming(&self) -> Option<mpsc::Receiver<DecryptedPacket>> {
        self.incoming_rx.lock().await.take()
    }

    /// Initiate a client-role handshake toward `peer`.
    pub async fn connect(&self, peer: SocketAddr) -> bool {
        self.engine.connect(peer).await
    }

    /// Encrypt and send application data to `peer`. Returns false when no
    /// established session exists for `peer`.
    pub async fn send(&self, peer: SocketAddr, payload: &[u8]) -> Result<bool> {
        match self.engine.encrypt_outbound(peer, payload.to_vec()).await? {
            Some(record) => {
                self.sink.send(&record, peer);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Annotate the established session for `peer`; see
    /// [`SessionEngine::put_auth_context`].
    pub async fn put_auth_context(
        &self,
        peer: SocketAddr,
        key: impl Into<String>,
        value: Option<String>,
    ) -> bool {
        self.engine.put_auth_context(peer, key, value).await
    }

    pub async fn session_count(&self) -> usize {
        self.engine.session_count().await
    }

    /// Store-and-close every session; the endpoint keeps running.
    pub async fn close_all(&self) {
        self.engine.close_all().await;
    }

    /// Drain all sessions and stop the engine and inbound pump.
    pub async fn shutdown(&self) {
        self.engine.shutdown().await;
        self.pump.abort();
    }
}

/// Inbound datagram pump: socket → engine, with CID read-through.
async fn pump_inbound(
    socket: Arc<UdpSocket>,
    engine: SessionEngine,
    store: Arc<dyn SessionStore>,
    incoming_tx: mpsc::Sender<DecryptedPacket>,
) {
    let mut buf = vec![0u8; RECV_BUFFER_SIZE];
    loop {
        let (len, peer) = match socket.recv_from(&mut buf).await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "udp receive failed");
                continue;
            }
        };
        let datagram = buf[..len].to_vec();

        match engine.handle_inbound(peer, datagram.clone()).await {
            ReceiveResult::Handled | ReceiveResult::DecryptFailed => {}
            ReceiveResult::Decrypted(packet) => {
                // An application that dropped its receiver loses packets;
                // the sessions stay alive regardless.
                let _ = incoming_tx.send(packet).await;
            }
            ReceiveResult::CidSessionMissing(cid) => {
                let stored = match store.load_session(&cid) {
                    Ok(stored) => stored,
                    Err(e) => {
                        warn!(cid = %hex::encode(&cid), error = %e, "session store lookup failed");
                        None
                    }
                };
                if engine.load_session(peer, cid, stored).await {
                    // Replay the datagram that triggered the lookup so the
                    // first roamed record is not lost.
                    if let ReceiveResult::Decrypted(packet) =
                        engine.handle_inbound(peer, datagram).await
                    {
                        let _ = incoming_tx.send(packet).await;
                    }
                }
            }
        }
    }
}
