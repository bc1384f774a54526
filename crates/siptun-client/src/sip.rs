//! Signaling path coordination

use crate::host::CoreHost;
use crate::rtp::TunnelTransport;
use tracing::info;

/// Virtual local port used by tunnelized SIP traffic
pub const SIP_TUNNEL_PORT: u16 = 5060;

/// Where the SIP stack should listen and send
#[derive(Debug, Clone)]
pub enum SipPath {
    Direct,
    Tunnel(TunnelTransport),
}

impl SipPath {
    pub fn is_tunnel(&self) -> bool {
        matches!(self, SipPath::Tunnel(_))
    }
}

/// One unregister / apply transports / register cycle
pub(crate) fn reregister(host: &dyn CoreHost, path: SipPath) {
    info!(
        "Re-registering SIP accounts over the {} path",
        if path.is_tunnel() { "tunnel" } else { "direct" }
    );
    host.unregister();
    host.apply_sip_transports(path);
    host.register();
}
