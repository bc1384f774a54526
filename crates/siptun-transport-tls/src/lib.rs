//! TLS tunnel links for the SIP/RTP tunnel
//!
//! This crate implements [`siptun_transport::LinkFactory`] with links that
//! carry [`siptun_proto::LinkMessage`] frames over TLS, optionally through an
//! HTTP proxy (`CONNECT`).
//!
//! # Features
//!
//! - **Ordered failover**: servers are tried in order, then retried with
//!   exponential backoff
//! - **Proxy traversal**: HTTP `CONNECT` with Basic authentication
//! - **Mutual TLS**: optional client certificate
//! - **Keep-alive**: periodic PING/PONG on idle sessions
//! - **Bounded buffering**: excess datagrams are dropped, never queued without limit

pub mod config;
pub mod link;
pub mod proxy;

pub use config::TlsLinkConfig;
pub use link::TlsTunnelLink;
pub use proxy::http_connect;

use siptun_transport::{LinkFactory, LinkObserver, LinkRequest, TransportResult, TunnelLink};
use std::sync::Arc;
use tokio::runtime::Handle;

/// Opens [`TlsTunnelLink`]s on a tokio runtime
#[derive(Debug, Clone)]
pub struct TlsLinkFactory {
    runtime: Handle,
    config: Arc<TlsLinkConfig>,
}

impl TlsLinkFactory {
    pub fn new(runtime: Handle, config: TlsLinkConfig) -> TransportResult<Self> {
        config.validate()?;
        Ok(Self {
            runtime,
            config: Arc::new(config),
        })
    }

    pub fn config(&self) -> &TlsLinkConfig {
        &self.config
    }
}

impl LinkFactory for TlsLinkFactory {
    fn open(&self, request: LinkRequest, observer: LinkObserver) -> Arc<dyn TunnelLink> {
        TlsTunnelLink::spawn(&self.runtime, self.config.clone(), request, observer)
    }
}
