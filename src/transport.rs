//! Outbound datagram transport.
//!
//! The engine only ever needs a fire-and-forget send: handshake flights,
//! alerts, and encrypted records are handed to a [`DatagramSink`] and
//! forgotten. DTLS tolerates loss by design, so a send that cannot
//! complete immediately is dropped with a trace rather than buffered.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tracing::trace;

/// Fire-and-forget outbound datagram sender. Must be thread-safe: the
/// engine actor and its timer tasks share one sink.
pub trait DatagramSink: Send + Sync {
    fn send(&self, datagram: &[u8], peer: SocketAddr);
}

/// [`DatagramSink`] over a shared tokio UDP socket.
///
/// Uses the non-blocking send path; a socket that is not ready to send
/// loses the datagram (the peer retransmits at the DTLS layer).
pub struct UdpSink {
    socket: Arc<UdpSocket>,
}

impl UdpSink {
    pub fn new(socket: Arc<UdpSocket>) -> Self {
        Self { socket }
    }

    pub fn socket(&self) -> &Arc<UdpSocket> {
        &self.socket
    }
}

impl DatagramSink for UdpSink {
    fn send(&self, datagram: &[u8], peer: SocketAddr) {
        if let Err(e) = self.socket.try_send_to(datagram, peer) {
            trace!(peer = %peer, len = datagram.len(), error = %e, "outbound datagram dropped");
        }
    }
}
