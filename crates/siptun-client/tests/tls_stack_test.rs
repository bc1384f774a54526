//! Manager driving real TLS links and UDP mirror probes over loopback

mod common;

use common::*;
use futures::{SinkExt, StreamExt};
use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use siptun_client::{TunnelManager, TunnelState};
use siptun_proto::{LinkCodec, LinkMessage, TunnelMode};
use siptun_transport::{DatagramTransport, ReconnectConfig, UdpTransport};
use siptun_transport_tls::TlsLinkConfig;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, UdpSocket};
use tokio::runtime::Handle;
use tokio_rustls::TlsAcceptor;
use tokio_util::codec::Framed;

/// TLS tunnel server that echoes every datagram back to its sender port
async fn start_echo_tunnel_server() -> u16 {
    let _ = rustls::crypto::ring::default_provider().install_default();

    let generated = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(generated.key_pair.serialize_der()));
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![generated.cert.der().clone()], key)
        .unwrap();
    let acceptor = TlsAcceptor::from(Arc::new(config));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        while let Ok((tcp, _)) = listener.accept().await {
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let Ok(tls) = acceptor.accept(tcp).await else {
                    return;
                };
                let mut framed = Framed::new(tls, LinkCodec::new());
                while let Some(Ok(message)) = framed.next().await {
                    if let LinkMessage::Datagram { .. } = message {
                        if framed.send(message).await.is_err() {
                            break;
                        }
                    }
                }
            });
        }
    });

    port
}

async fn start_udp_mirror() -> u16 {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = socket.local_addr().unwrap().port();
    tokio::spawn(async move {
        let mut buf = [0u8; 1500];
        while let Ok((n, from)) = socket.recv_from(&mut buf).await {
            let _ = socket.send_to(&buf[..n], from).await;
        }
    });
    port
}

fn link_config() -> TlsLinkConfig {
    TlsLinkConfig::default().with_reconnect(ReconnectConfig {
        initial_backoff: Duration::from_millis(50),
        max_backoff: Duration::from_millis(200),
        multiplier: 2.0,
        max_attempts: None,
    })
}

async fn pump_until(manager: &mut TunnelManager, what: &str, condition: impl Fn(&TunnelManager) -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        manager.on_iterate();
        if condition(manager) {
            return;
        }
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_media_round_trip_through_tls_tunnel() {
    let server_port = start_echo_tunnel_server().await;
    let host = RecordingHost::new();
    let mut manager = TunnelManager::with_tls(host.clone(), Handle::current(), link_config()).unwrap();

    manager.add_server("127.0.0.1", server_port);
    manager.set_mode(TunnelMode::Enable);
    pump_until(&mut manager, "activation", |m| m.is_activated()).await;
    assert!(manager.is_connected());
    assert_eq!(host.take_calls(), TUNNEL_CYCLE.to_vec());

    let passthrough = Arc::new(UdpTransport::bind("127.0.0.1:0".parse().unwrap()).unwrap());
    let binding = manager.create_rtp_transport(7078, passthrough);
    binding.send_to(b"rtp over tls", peer()).unwrap();

    let mut buf = [0u8; 64];
    let deadline = Instant::now() + Duration::from_secs(5);
    let (n, from) = loop {
        if let Some(received) = binding.recv_from(&mut buf).unwrap() {
            break received;
        }
        assert!(Instant::now() < deadline, "echo never came back");
        tokio::time::sleep(Duration::from_millis(10)).await;
    };
    assert_eq!(&buf[..n], b"rtp over tls");
    assert_eq!(from, peer());

    manager.set_mode(TunnelMode::Disable);
    assert!(!manager.is_activated());
    assert!(!binding.is_tunneled());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_auto_mode_with_answering_mirror_stays_direct() {
    let mirror_port = start_udp_mirror().await;
    let host = RecordingHost::new();
    let mut manager = TunnelManager::with_tls(host.clone(), Handle::current(), link_config()).unwrap();

    manager.add_server_with_probe("127.0.0.1", 1, mirror_port, 1000);
    manager.set_mode(TunnelMode::Auto);
    assert!(manager.holds_background_task());

    pump_until(&mut manager, "detection", |m| !m.holds_background_task()).await;
    assert_eq!(manager.desired_state(), TunnelState::Off);
    assert!(!manager.is_activated());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_auto_mode_with_simulated_loss_tunnels() {
    let mirror_port = start_udp_mirror().await;
    let server_port = start_echo_tunnel_server().await;
    let host = RecordingHost::new();
    let mut manager = TunnelManager::with_tls(host.clone(), Handle::current(), link_config()).unwrap();

    manager.add_server_with_probe("127.0.0.1", server_port, mirror_port, 1000);
    manager.simulate_udp_loss(true);
    manager.set_mode(TunnelMode::Auto);

    pump_until(&mut manager, "activation", |m| m.is_activated()).await;
    assert_eq!(manager.desired_state(), TunnelState::On);

    manager.set_mode(TunnelMode::Disable);
    assert!(!manager.is_activated());
}
