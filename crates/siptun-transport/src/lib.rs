//! Transport abstraction layer for the SIP/RTP tunnel
//!
//! This crate provides the seams between the tunnel manager and the network
//! primitives it drives, so that the control logic does not depend on a
//! specific link implementation:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    Tunnel Manager                        │
//! │   (state machine, auto-detection, RTP/SIP redirection)   │
//! └─────────────────────────────────────────────────────────┘
//!              │ LinkFactory             │ ReachabilityProbe
//!              ↓                         ↓
//! ┌──────────────────────────┐  ┌──────────────────────────┐
//! │ TunnelLink               │  │ UdpMirrorProbe            │
//! │ (siptun-transport-tls)   │  │ (UDP echo round trip)     │
//! └──────────────────────────┘  └──────────────────────────┘
//! ```
//!
//! Media and signaling sockets see both paths through the same
//! [`DatagramTransport`] capability: a direct UDP socket or a tunnel link.

pub mod probe;
pub mod reconnect;
pub mod security;
pub mod udp;

pub use probe::{ProbeCallback, ProbeHandle, ProbeTarget, ReachabilityProbe, UdpMirrorProbe};
pub use reconnect::{Backoff, ReconnectConfig, ReconnectError};
pub use security::{ClientCertificate, HttpProxy, LinkSecurity};
pub use udp::UdpTransport;

use bytes::Bytes;
use siptun_proto::{LinkDirection, ServerEndpoint};
use std::fmt::Debug;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Proxy error: {0}")]
    ProxyError(String),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Timeout")]
    Timeout,

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// A datagram received through a tunnel link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    /// Remote address on the far side of the relay
    pub peer: SocketAddr,
    pub payload: Bytes,
}

/// Non-blocking datagram send/receive capability.
///
/// This is the shape of the hooks a media engine (or a SIP stack) calls for
/// each packet. Implementations must be callable concurrently from any thread.
pub trait DatagramTransport: Send + Sync {
    /// Send one datagram. Returns the number of bytes accepted.
    fn send_to(&self, payload: &[u8], to: SocketAddr) -> io::Result<usize>;

    /// Receive one datagram if one is ready, without blocking.
    fn recv_from(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>>;
}

/// One established (or establishing) tunnel connection.
///
/// The manager owns the link set from its control thread, while media
/// threads call `send_to`/`try_recv` concurrently; implementations are
/// responsible for their own internal synchronization.
pub trait TunnelLink: Send + Sync + Debug {
    /// Unique identifier for logging
    fn link_id(&self) -> &str;

    fn direction(&self) -> LinkDirection;

    fn is_connected(&self) -> bool;

    /// Hand a datagram to the link. Returns `false` when the datagram was
    /// dropped (wrong direction or outbound queue full).
    fn send_to(&self, local_port: u16, peer: SocketAddr, payload: &[u8]) -> bool;

    /// Start accepting inbound datagrams for a virtual local port
    fn open_port(&self, local_port: u16);

    /// Pop the next inbound datagram for a virtual local port
    fn try_recv(&self, local_port: u16) -> Option<Datagram>;

    fn close_port(&self, local_port: u16);

    /// Stop the link; no further connect attempts are made
    fn shutdown(&self);
}

/// Connected/disconnected notification, invoked from the link's own task
pub type LinkObserver = Arc<dyn Fn(LinkDirection, bool) + Send + Sync>;

/// Everything a link needs at creation time
#[derive(Debug, Clone)]
pub struct LinkRequest {
    /// Servers to try, in order
    pub servers: Vec<ServerEndpoint>,
    pub direction: LinkDirection,
    pub security: LinkSecurity,
    pub proxy: Option<HttpProxy>,
    /// `sip:user@domain` announced to the server
    pub identity: Option<String>,
}

/// Creates tunnel links. Opening never fails synchronously: establishment
/// runs in the background and is reported through the observer.
pub trait LinkFactory: Send + Sync {
    fn open(&self, request: LinkRequest, observer: LinkObserver) -> Arc<dyn TunnelLink>;
}
