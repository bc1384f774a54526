//! Tunnel mode and link direction

use crate::endpoint::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Configured tunnel mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TunnelMode {
    /// Never tunnel
    #[default]
    Disable,
    /// Always tunnel
    Enable,
    /// Tunnel only when the UDP mirror test shows UDP is blocked
    Auto,
}

impl TunnelMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelMode::Disable => "disable",
            TunnelMode::Enable => "enable",
            TunnelMode::Auto => "auto",
        }
    }
}

impl fmt::Display for TunnelMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TunnelMode {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "disable" => Ok(TunnelMode::Disable),
            "enable" => Ok(TunnelMode::Enable),
            "auto" => Ok(TunnelMode::Auto),
            other => Err(ParseError::InvalidMode(other.to_string())),
        }
    }
}

/// Traffic direction carried by a tunnel link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkDirection {
    /// Single-socket mode: one link carries both directions
    Both,
    /// Dual-socket mode, outbound half
    SendOnly,
    /// Dual-socket mode, inbound half
    RecvOnly,
}

impl LinkDirection {
    pub fn can_send(&self) -> bool {
        matches!(self, LinkDirection::Both | LinkDirection::SendOnly)
    }

    pub fn can_recv(&self) -> bool {
        matches!(self, LinkDirection::Both | LinkDirection::RecvOnly)
    }
}

impl fmt::Display for LinkDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LinkDirection::Both => "both",
            LinkDirection::SendOnly => "send-only",
            LinkDirection::RecvOnly => "recv-only",
        };
        f.write_str(name)
    }
}
