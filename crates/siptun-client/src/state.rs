//! Control-plane tunnel state

use std::fmt;

/// Desired or actual tunnel state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TunnelState {
    /// No link open, traffic goes direct
    #[default]
    Off,
    /// Links established, tunnelized traffic routed through them
    On,
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelState::Off => write!(f, "off"),
            TunnelState::On => write!(f, "on"),
        }
    }
}
