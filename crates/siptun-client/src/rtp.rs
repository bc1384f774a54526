//! Per-port media interception
//!
//! A binding is handed to the media engine in place of its UDP transport.
//! Each packet looks up the published route once: tunneled packets go
//! through the link set, everything else passes through untouched.

use crate::route::{Route, SharedRoute};
use siptun_transport::DatagramTransport;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::trace;

/// Tunnel side of a virtual local port
#[derive(Clone)]
pub struct TunnelTransport {
    route: SharedRoute,
    port: u16,
}

impl TunnelTransport {
    pub fn new(route: SharedRoute, port: u16) -> Self {
        Self { route, port }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    fn send_via(route: &Route, port: u16, payload: &[u8], to: SocketAddr) -> usize {
        match route {
            Route::Tunneled(links) => {
                if !links.send_link().send_to(port, to, payload) {
                    trace!("Tunnel link dropped datagram from port {}", port);
                }
            }
            Route::Direct => trace!("No tunnel route, dropping datagram from port {}", port),
        }
        // Loss is tolerated; the caller always sees the datagram as sent.
        payload.len()
    }

    fn recv_via(route: &Route, port: u16, buf: &mut [u8]) -> Option<(usize, SocketAddr)> {
        let Route::Tunneled(links) = route else {
            return None;
        };
        let datagram = links.recv_link().try_recv(port)?;
        let len = datagram.payload.len().min(buf.len());
        buf[..len].copy_from_slice(&datagram.payload[..len]);
        Some((len, datagram.peer))
    }
}

impl std::fmt::Debug for TunnelTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelTransport")
            .field("port", &self.port)
            .field("tunneled", &self.route.load().is_tunneled())
            .finish()
    }
}

impl DatagramTransport for TunnelTransport {
    fn send_to(&self, payload: &[u8], to: SocketAddr) -> io::Result<usize> {
        Ok(Self::send_via(&self.route.load(), self.port, payload, to))
    }

    fn recv_from(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        Ok(Self::recv_via(&self.route.load(), self.port, buf))
    }
}

/// Interception state for one media port
pub struct RtpTransportBinding {
    id: u64,
    tunnel: TunnelTransport,
    passthrough: Arc<dyn DatagramTransport>,
}

impl RtpTransportBinding {
    pub(crate) fn new(id: u64, tunnel: TunnelTransport, passthrough: Arc<dyn DatagramTransport>) -> Self {
        Self {
            id,
            tunnel,
            passthrough,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn port(&self) -> u16 {
        self.tunnel.port
    }

    /// Packets currently go through the tunnel
    pub fn is_tunneled(&self) -> bool {
        self.tunnel.route.load().is_tunneled()
    }
}

impl std::fmt::Debug for RtpTransportBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtpTransportBinding")
            .field("id", &self.id)
            .field("port", &self.tunnel.port)
            .finish_non_exhaustive()
    }
}

impl DatagramTransport for RtpTransportBinding {
    fn send_to(&self, payload: &[u8], to: SocketAddr) -> io::Result<usize> {
        let route = self.tunnel.route.load();
        match &**route {
            Route::Direct => self.passthrough.send_to(payload, to),
            tunneled => Ok(TunnelTransport::send_via(
                tunneled,
                self.tunnel.port,
                payload,
                to,
            )),
        }
    }

    fn recv_from(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        let route = self.tunnel.route.load();
        match &**route {
            Route::Direct => self.passthrough.recv_from(buf),
            tunneled => Ok(TunnelTransport::recv_via(tunneled, self.tunnel.port, buf)),
        }
    }
}
