//! Link protocol message types

use crate::mode::LinkDirection;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Messages exchanged over an established tunnel link
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum LinkMessage {
    /// First message sent by the client after the TLS handshake
    Hello {
        version: u32,
        direction: LinkDirection,
        /// Expected peer identity, `sip:user@domain`
        identity: Option<String>,
    },

    /// One tunneled UDP datagram.
    ///
    /// `local_port` is the virtual local port of the media or signaling
    /// socket; `peer` is the remote address on the far side of the relay.
    Datagram {
        local_port: u16,
        peer: SocketAddr,
        payload: Vec<u8>,
    },

    /// The client no longer listens on this virtual port
    ClosePort {
        local_port: u16,
    },

    Ping {
        timestamp: u64,
    },
    Pong {
        timestamp: u64,
    },
}

impl LinkMessage {
    pub fn datagram(local_port: u16, peer: SocketAddr, payload: impl Into<Vec<u8>>) -> Self {
        LinkMessage::Datagram {
            local_port,
            peer,
            payload: payload.into(),
        }
    }
}
