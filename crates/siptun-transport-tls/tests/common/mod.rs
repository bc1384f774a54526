//! In-process tunnel server and HTTP proxy for link tests

#![allow(dead_code)]

use futures::{SinkExt, StreamExt};
use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use siptun_proto::{LinkCodec, LinkDirection, LinkMessage, ServerEndpoint};
use siptun_transport::{LinkObserver, LinkRequest, LinkSecurity, ReconnectConfig};
use siptun_transport_tls::TlsLinkConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_util::codec::Framed;

pub struct TestServer {
    pub addr: SocketAddr,
    pub cert_pem: String,
    /// Every frame received from clients, in order
    pub received: mpsc::UnboundedReceiver<LinkMessage>,
    /// Frames to push to the current client
    pub outbound: mpsc::UnboundedSender<LinkMessage>,
    /// Drops the current client connection
    pub kick: mpsc::UnboundedSender<()>,
    /// One notification per finished client connection
    pub closed: mpsc::UnboundedReceiver<()>,
}

impl TestServer {
    pub fn endpoint(&self) -> ServerEndpoint {
        ServerEndpoint::new("127.0.0.1", self.addr.port())
    }

    pub async fn next_message(&mut self) -> LinkMessage {
        tokio::time::timeout(Duration::from_secs(5), self.received.recv())
            .await
            .expect("server received nothing")
            .expect("server stopped")
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("siptun_transport_tls=debug")
        .with_test_writer()
        .try_init();
}

pub async fn start_server() -> TestServer {
    init_tracing();
    let _ = rustls::crypto::ring::default_provider().install_default();

    let generated = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert_pem = generated.cert.pem();
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(generated.key_pair.serialize_der()));
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![generated.cert.der().clone()], key)
        .unwrap();
    let acceptor = TlsAcceptor::from(Arc::new(config));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let (received_tx, received) = mpsc::unbounded_channel();
    let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<LinkMessage>();
    let (kick, mut kick_rx) = mpsc::unbounded_channel::<()>();
    let (closed_tx, closed) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        loop {
            let Ok((tcp, _)) = listener.accept().await else {
                break;
            };
            let Ok(tls) = acceptor.accept(tcp).await else {
                continue;
            };
            let mut framed = Framed::new(tls, LinkCodec::new());

            loop {
                tokio::select! {
                    inbound = framed.next() => match inbound {
                        Some(Ok(message)) => {
                            let _ = received_tx.send(message);
                        }
                        _ => break,
                    },
                    Some(message) = outbound_rx.recv() => {
                        if framed.send(message).await.is_err() {
                            break;
                        }
                    }
                    Some(()) = kick_rx.recv() => break,
                }
            }
            let _ = closed_tx.send(());
        }
    });

    TestServer {
        addr,
        cert_pem,
        received,
        outbound,
        kick,
        closed,
    }
}

/// Minimal HTTP CONNECT proxy; reports each request head it sees
pub async fn start_proxy() -> (SocketAddr, mpsc::UnboundedReceiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (heads_tx, heads) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((mut client, _)) = listener.accept().await {
            let heads_tx = heads_tx.clone();
            tokio::spawn(async move {
                let mut head = Vec::new();
                let mut byte = [0u8; 1];
                while !head.ends_with(b"\r\n\r\n") {
                    if client.read_exact(&mut byte).await.is_err() {
                        return;
                    }
                    head.push(byte[0]);
                }
                let head = String::from_utf8_lossy(&head).to_string();
                let target = head
                    .split_whitespace()
                    .nth(1)
                    .unwrap_or_default()
                    .to_string();
                let _ = heads_tx.send(head);

                let Ok(mut upstream) = TcpStream::connect(target.as_str()).await else {
                    let _ = client.write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\n").await;
                    return;
                };
                if client
                    .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                    .await
                    .is_err()
                {
                    return;
                }
                let _ = tokio::io::copy_bidirectional(&mut client, &mut upstream).await;
            });
        }
    });

    (addr, heads)
}

pub fn test_config() -> TlsLinkConfig {
    TlsLinkConfig {
        connect_timeout: Duration::from_secs(2),
        ..Default::default()
    }
    .with_reconnect(ReconnectConfig {
        initial_backoff: Duration::from_millis(50),
        max_backoff: Duration::from_millis(200),
        multiplier: 2.0,
        max_attempts: None,
    })
}

pub fn request(servers: Vec<ServerEndpoint>, direction: LinkDirection) -> LinkRequest {
    LinkRequest {
        servers,
        direction,
        security: LinkSecurity::default(),
        proxy: None,
        identity: Some("sip:alice@example.org".to_string()),
    }
}

pub fn recording_observer() -> (LinkObserver, mpsc::UnboundedReceiver<(LinkDirection, bool)>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let observer: LinkObserver = Arc::new(move |direction, connected| {
        let _ = tx.send((direction, connected));
    });
    (observer, rx)
}

pub async fn next_event(
    events: &mut mpsc::UnboundedReceiver<(LinkDirection, bool)>,
) -> (LinkDirection, bool) {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("link never reported")
        .expect("observer dropped")
}
