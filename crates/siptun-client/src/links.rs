//! Link topology: one bidirectional link, or a send/receive pair

use siptun_proto::{LinkDirection, ServerEndpoint, ServerEntry};
use siptun_transport::TunnelLink;
use std::sync::Arc;
use tracing::warn;

/// Which links to open for the configured entries
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkPlan {
    /// One link for both directions, failing over across `servers`
    Single { servers: Vec<ServerEndpoint> },
    /// Outbound link failing over across the primaries of every paired
    /// entry, inbound link across their secondaries, in the same order
    Dual {
        send: Vec<ServerEndpoint>,
        recv: Vec<ServerEndpoint>,
    },
}

impl LinkPlan {
    /// `None` when no server is configured. Dual mode without a paired
    /// entry degrades to a single link.
    pub fn for_entries(entries: &[ServerEntry], dual_mode: bool) -> Option<Self> {
        if entries.is_empty() {
            return None;
        }

        if dual_mode {
            let (send, recv): (Vec<_>, Vec<_>) = entries
                .iter()
                .filter_map(|entry| {
                    let recv = entry.secondary.clone()?;
                    Some((entry.primary.clone(), recv))
                })
                .unzip();
            if !send.is_empty() {
                return Some(LinkPlan::Dual { send, recv });
            }
            warn!("Dual mode enabled but no paired server configured, using a single link");
        }

        Some(LinkPlan::Single {
            servers: entries.iter().map(|entry| entry.primary.clone()).collect(),
        })
    }
}

/// The links of one connection attempt
#[derive(Debug)]
pub struct LinkSet {
    generation: u64,
    send: Arc<dyn TunnelLink>,
    recv: Arc<dyn TunnelLink>,
    dual: bool,
}

impl LinkSet {
    pub fn single(generation: u64, link: Arc<dyn TunnelLink>) -> Self {
        Self {
            generation,
            send: link.clone(),
            recv: link,
            dual: false,
        }
    }

    pub fn dual(generation: u64, send: Arc<dyn TunnelLink>, recv: Arc<dyn TunnelLink>) -> Self {
        Self {
            generation,
            send,
            recv,
            dual: true,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_dual(&self) -> bool {
        self.dual
    }

    /// Link carrying outbound traffic
    pub fn send_link(&self) -> &Arc<dyn TunnelLink> {
        &self.send
    }

    /// Link carrying inbound traffic
    pub fn recv_link(&self) -> &Arc<dyn TunnelLink> {
        &self.recv
    }

    /// Every link is connected
    pub fn is_ready(&self) -> bool {
        self.send.is_connected() && self.recv.is_connected()
    }

    pub fn describe(&self, direction: LinkDirection) -> &str {
        match direction {
            LinkDirection::RecvOnly => self.recv.link_id(),
            _ => self.send.link_id(),
        }
    }

    pub fn open_port(&self, port: u16) {
        self.recv.open_port(port);
    }

    pub fn close_port(&self, port: u16) {
        self.recv.close_port(port);
    }

    pub fn shutdown(&self) {
        self.send.shutdown();
        if self.dual {
            self.recv.shutdown();
        }
    }
}
