//! Tunnel Protocol Definitions
//!
//! This crate defines the provisioning model for tunnel servers (including the
//! persisted `server_addresses` entry syntax), the tunnel mode, and the
//! messages exchanged over a tunnel link.

pub mod codec;
pub mod endpoint;
pub mod messages;
pub mod mode;

pub use codec::{CodecError, LinkCodec};
pub use endpoint::{
    format_server_list, parse_server_list, ParseError, ServerEndpoint, ServerEntry,
    DEFAULT_PROBE_DELAY_MS,
};
pub use messages::LinkMessage;
pub use mode::{LinkDirection, TunnelMode};

/// Protocol version announced in the link hello
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum encoded message size (64KB is plenty for RTP and SIP datagrams)
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;
