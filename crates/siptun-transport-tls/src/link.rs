//! TLS tunnel link
//!
//! A link owns one background supervisor task. The supervisor walks the
//! server list in order, establishes TCP (optionally through an HTTP proxy)
//! then TLS, announces itself with `Hello`, and pumps framed messages until
//! the session drops. Between passes over the list it backs off.
//!
//! Media threads only touch the lock-light edges: a bounded outbound queue
//! and one small inbound queue per virtual port.

use crate::config::{build_tls_connector, TlsLinkConfig};
use crate::proxy::http_connect;
use bytes::Bytes;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use siptun_proto::{LinkCodec, LinkDirection, LinkMessage, ServerEndpoint, PROTOCOL_VERSION};
use siptun_transport::{
    Backoff, Datagram, LinkObserver, LinkRequest, TransportError, TransportResult, TunnelLink,
};
use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

type LinkFramed = Framed<TlsStream<TcpStream>, LinkCodec>;

/// Inbound datagrams waiting for one virtual port
#[derive(Debug, Default)]
struct PortQueue {
    queue: Mutex<VecDeque<Datagram>>,
}

impl PortQueue {
    /// Returns `true` when the oldest datagram had to be dropped
    fn push(&self, datagram: Datagram, limit: usize) -> bool {
        let Ok(mut queue) = self.queue.lock() else {
            return true;
        };
        let overflow = queue.len() >= limit;
        if overflow {
            queue.pop_front();
        }
        queue.push_back(datagram);
        overflow
    }

    fn pop(&self) -> Option<Datagram> {
        self.queue.lock().ok()?.pop_front()
    }
}

/// State shared between the link handle and its supervisor
struct LinkShared {
    connected: AtomicBool,
    ports: DashMap<u16, PortQueue>,
    port_queue_limit: usize,
    dropped: AtomicU64,
}

/// Tunnel link over TLS, created by [`crate::TlsLinkFactory`]
pub struct TlsTunnelLink {
    link_id: String,
    direction: LinkDirection,
    shared: Arc<LinkShared>,
    outbound: mpsc::Sender<LinkMessage>,
    cancel: CancellationToken,
}

impl TlsTunnelLink {
    /// Create the link and start its supervisor on `runtime`
    pub fn spawn(
        runtime: &Handle,
        config: Arc<TlsLinkConfig>,
        request: LinkRequest,
        observer: LinkObserver,
    ) -> Arc<Self> {
        let link_id = format!("tls-link-{}", uuid::Uuid::new_v4());
        let direction = request.direction;
        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_queue);
        let shared = Arc::new(LinkShared {
            connected: AtomicBool::new(false),
            ports: DashMap::new(),
            port_queue_limit: config.port_queue,
            dropped: AtomicU64::new(0),
        });
        let cancel = CancellationToken::new();

        debug!(
            "[{}] Starting {} link over {} server(s)",
            link_id,
            direction,
            request.servers.len()
        );

        let supervisor = Supervisor {
            link_id: link_id.clone(),
            config,
            request,
            observer,
            shared: shared.clone(),
            outbound: outbound_rx,
            cancel: cancel.clone(),
        };
        runtime.spawn(supervisor.run());

        Arc::new(Self {
            link_id,
            direction,
            shared,
            outbound: outbound_tx,
            cancel,
        })
    }

    /// Datagrams dropped on a full queue, in either direction
    pub fn dropped_datagrams(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for TlsTunnelLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsTunnelLink")
            .field("link_id", &self.link_id)
            .field("direction", &self.direction)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl TunnelLink for TlsTunnelLink {
    fn link_id(&self) -> &str {
        &self.link_id
    }

    fn direction(&self) -> LinkDirection {
        self.direction
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    fn send_to(&self, local_port: u16, peer: SocketAddr, payload: &[u8]) -> bool {
        if !self.direction.can_send() {
            return false;
        }

        match self
            .outbound
            .try_send(LinkMessage::datagram(local_port, peer, payload.to_vec()))
        {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                trace!("[{}] Outbound queue full, dropping datagram", self.link_id);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    fn open_port(&self, local_port: u16) {
        if self.direction.can_recv() {
            self.shared.ports.entry(local_port).or_default();
        }
    }

    fn try_recv(&self, local_port: u16) -> Option<Datagram> {
        self.shared.ports.get(&local_port)?.pop()
    }

    fn close_port(&self, local_port: u16) {
        if self.shared.ports.remove(&local_port).is_some() && self.direction.can_recv() {
            let _ = self.outbound.try_send(LinkMessage::ClosePort { local_port });
        }
    }

    fn shutdown(&self) {
        if !self.cancel.is_cancelled() {
            debug!("[{}] Shutting down", self.link_id);
        }
        self.cancel.cancel();
        self.shared.connected.store(false, Ordering::Release);
    }
}

impl Drop for TlsTunnelLink {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Supervisor {
    link_id: String,
    config: Arc<TlsLinkConfig>,
    request: LinkRequest,
    observer: LinkObserver,
    shared: Arc<LinkShared>,
    outbound: mpsc::Receiver<LinkMessage>,
    cancel: CancellationToken,
}

impl Supervisor {
    async fn run(mut self) {
        if self.request.servers.is_empty() {
            error!("[{}] No tunnel server to connect to", self.link_id);
            return;
        }

        let connector = match build_tls_connector(&self.request.security) {
            Ok(connector) => connector,
            Err(e) => {
                error!("[{}] Cannot configure TLS: {}", self.link_id, e);
                return;
            }
        };

        let mut backoff = Backoff::new(self.config.reconnect.clone());
        let direction = self.request.direction;

        loop {
            for server in self.request.servers.clone() {
                let attempt = tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    result = self.establish(&connector, &server) => result,
                };

                let framed = match attempt {
                    Ok(framed) => framed,
                    Err(e) => {
                        warn!(
                            "[{}] Failed to connect to tunnel server {}: {}",
                            self.link_id, server, e
                        );
                        continue;
                    }
                };

                info!(
                    "[{}] Connected to tunnel server {} ({})",
                    self.link_id, server, direction
                );
                backoff.reset();
                self.shared.connected.store(true, Ordering::Release);
                (self.observer)(direction, true);

                let reason = self.run_session(framed).await;
                self.shared.connected.store(false, Ordering::Release);

                if self.cancel.is_cancelled() {
                    debug!("[{}] Session closed: {}", self.link_id, reason);
                    return;
                }

                warn!(
                    "[{}] Lost tunnel server {}: {}",
                    self.link_id, server, reason
                );
                (self.observer)(direction, false);
                break;
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return,
                waited = backoff.wait() => {
                    if let Err(e) = waited {
                        error!("[{}] Giving up: {}", self.link_id, e);
                        return;
                    }
                }
            }
        }
    }

    async fn establish(
        &self,
        connector: &TlsConnector,
        server: &ServerEndpoint,
    ) -> TransportResult<LinkFramed> {
        let handshake = async {
            let tcp = match &self.request.proxy {
                Some(proxy) => {
                    debug!(
                        "[{}] Reaching {} through HTTP proxy {}:{}",
                        self.link_id, server, proxy.host, proxy.port
                    );
                    let mut tcp = TcpStream::connect((proxy.host.as_str(), proxy.port)).await?;
                    http_connect(&mut tcp, server, proxy).await?;
                    tcp
                }
                None => TcpStream::connect((server.host.as_str(), server.port)).await?,
            };
            tcp.set_nodelay(true)?;

            let server_name = rustls::pki_types::ServerName::try_from(server.host.clone())
                .map_err(|e| {
                    TransportError::TlsError(format!("Invalid server name {}: {}", server.host, e))
                })?;
            let tls = connector
                .connect(server_name, tcp)
                .await
                .map_err(|e| TransportError::TlsError(e.to_string()))?;

            let mut framed = Framed::new(tls, LinkCodec::new());
            framed
                .send(LinkMessage::Hello {
                    version: PROTOCOL_VERSION,
                    direction: self.request.direction,
                    identity: self.request.identity.clone(),
                })
                .await
                .map_err(|e| TransportError::ProtocolError(e.to_string()))?;

            Ok(framed)
        };

        tokio::time::timeout(self.config.connect_timeout, handshake)
            .await
            .map_err(|_| TransportError::Timeout)?
    }

    /// Pump one session; returns why it ended
    async fn run_session(&mut self, framed: LinkFramed) -> String {
        let (mut sink, mut stream) = framed.split();
        let mut keep_alive = tokio::time::interval(self.config.keep_alive_interval);
        keep_alive.tick().await;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = sink.close().await;
                    return "link stopped".to_string();
                }
                outbound = self.outbound.recv() => {
                    let Some(message) = outbound else {
                        return "link handle dropped".to_string();
                    };
                    if let Err(e) = sink.send(message).await {
                        return format!("write failed: {}", e);
                    }
                }
                inbound = stream.next() => {
                    let message = match inbound {
                        Some(Ok(message)) => message,
                        Some(Err(e)) => return format!("read failed: {}", e),
                        None => return "server closed the connection".to_string(),
                    };
                    if let Some(reply) = deliver(&self.link_id, &self.shared, self.request.direction, message) {
                        if let Err(e) = sink.send(reply).await {
                            return format!("write failed: {}", e);
                        }
                    }
                }
                _ = keep_alive.tick() => {
                    if let Err(e) = sink.send(LinkMessage::Ping { timestamp: now_millis() }).await {
                        return format!("keep-alive failed: {}", e);
                    }
                }
            }
        }
    }
}

/// Route one inbound message; returns the reply to send, if any
fn deliver(
    link_id: &str,
    shared: &LinkShared,
    direction: LinkDirection,
    message: LinkMessage,
) -> Option<LinkMessage> {
    match message {
        LinkMessage::Datagram {
            local_port,
            peer,
            payload,
        } => {
            if !direction.can_recv() {
                trace!("[{}] Send-only link, dropping inbound datagram", link_id);
                return None;
            }
            match shared.ports.get(&local_port) {
                Some(queue) => {
                    let datagram = Datagram {
                        peer,
                        payload: Bytes::from(payload),
                    };
                    if queue.push(datagram, shared.port_queue_limit) {
                        shared.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                }
                None => trace!("[{}] No listener on port {}", link_id, local_port),
            }
            None
        }
        LinkMessage::Ping { timestamp } => Some(LinkMessage::Pong { timestamp }),
        LinkMessage::Pong { timestamp } => {
            trace!(
                "[{}] Pong, rtt {} ms",
                link_id,
                now_millis().saturating_sub(timestamp)
            );
            None
        }
        other => {
            debug!("[{}] Ignoring unexpected message: {:?}", link_id, other);
            None
        }
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
