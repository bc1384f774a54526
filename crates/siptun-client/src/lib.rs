//! SIP/RTP tunnel manager
//!
//! Decides whether signaling and media need to be tunneled, keeps the tunnel
//! link(s) up, and redirects the host's media and signaling transports
//! through them.
//!
//! # Example
//!
//! ```ignore
//! let mut manager = TunnelManager::with_tls(host, runtime.handle().clone(), TlsLinkConfig::default())?;
//! manager.add_server_with_probe("tunnel.example.org", 443, 12345, 1000);
//! manager.set_mode(TunnelMode::Auto);
//!
//! // from the host main loop
//! manager.on_iterate();
//! ```

pub mod config;
pub mod credentials;
pub mod detection;
pub mod event;
pub mod host;
pub mod links;
pub mod manager;
pub mod route;
pub mod rtp;
pub mod sip;
pub mod state;

pub use config::{ConfigError, ConfigStore, MemoryConfigStore, TomlConfigStore, TunnelConfig};
pub use credentials::Credentials;
pub use event::{Event, EventSender};
pub use host::{BackgroundTask, CoreHost, GlobalState};
pub use links::{LinkPlan, LinkSet};
pub use manager::TunnelManager;
pub use rtp::{RtpTransportBinding, TunnelTransport};
pub use sip::{SipPath, SIP_TUNNEL_PORT};
pub use state::TunnelState;

pub use siptun_proto::{ServerEndpoint, ServerEntry, TunnelMode};
