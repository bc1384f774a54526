//! Tunnel server provisioning model
//!
//! A provisioned entry is persisted as a single whitespace-free token:
//!
//! ```text
//! host:port[:mirrorPort:delayMs][/host2:port2]
//! ```
//!
//! e.g. `tunnel.example.org:443:12345:1000/backup.example.org:443`. The
//! `server_addresses` key holds a space separated list of such tokens.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, warn};

/// Default acceptable UDP round trip for the mirror test
pub const DEFAULT_PROBE_DELAY_MS: u32 = 1000;

/// Persisted value meaning "no UDP mirror configured"
const NO_MIRROR_PORT: &str = "-1";

/// Entry syntax errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("missing host")]
    MissingHost,

    #[error("missing port in '{0}'")]
    MissingPort(String),

    #[error("invalid port '{0}'")]
    InvalidPort(String),

    #[error("invalid UDP mirror port '{0}'")]
    InvalidMirrorPort(String),

    #[error("invalid probe delay '{0}'")]
    InvalidDelay(String),

    #[error("too many fields in '{0}'")]
    TooManyFields(String),

    #[error("invalid tunnel mode '{0}'")]
    InvalidMode(String),
}

/// One tunnel server address
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerEndpoint {
    pub host: String,
    pub port: u16,
}

impl ServerEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for ServerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for ServerEndpoint {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields = split_fields(s);
        match fields.as_slice() {
            [] => Err(ParseError::MissingHost),
            [_] => Err(ParseError::MissingPort(s.to_string())),
            [host, port] => Ok(Self::new(*host, parse_port(port)?)),
            _ => Err(ParseError::TooManyFields(s.to_string())),
        }
    }
}

/// A provisioned tunnel server: a primary endpoint, an optional secondary
/// endpoint used by dual-socket mode, and optional UDP mirror parameters
/// that make the entry eligible for auto-detection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerEntry {
    pub primary: ServerEndpoint,
    pub secondary: Option<ServerEndpoint>,
    /// UDP mirror port on the primary host. `None` is persisted as `-1`.
    pub mirror_port: Option<u16>,
    /// Acceptable UDP round trip in milliseconds
    pub probe_delay_ms: u32,
}

impl ServerEntry {
    /// Single server without auto-detection capability
    pub fn single(host: impl Into<String>, port: u16) -> Self {
        Self {
            primary: ServerEndpoint::new(host, port),
            secondary: None,
            mirror_port: None,
            probe_delay_ms: DEFAULT_PROBE_DELAY_MS,
        }
    }

    /// Server pair for dual-socket mode
    pub fn pair(
        host1: impl Into<String>,
        port1: u16,
        host2: impl Into<String>,
        port2: u16,
    ) -> Self {
        Self {
            secondary: Some(ServerEndpoint::new(host2, port2)),
            ..Self::single(host1, port1)
        }
    }

    /// Attach UDP mirror parameters (they always apply to the primary host)
    pub fn with_probe(mut self, mirror_port: u16, delay_ms: u32) -> Self {
        self.mirror_port = Some(mirror_port);
        self.probe_delay_ms = delay_ms;
        self
    }

    pub fn is_probe_eligible(&self) -> bool {
        self.mirror_port.is_some()
    }

    pub fn is_pair(&self) -> bool {
        self.secondary.is_some()
    }

    /// Address of the UDP mirror, if any
    pub fn mirror_endpoint(&self) -> Option<ServerEndpoint> {
        self.mirror_port
            .map(|port| ServerEndpoint::new(self.primary.host.clone(), port))
    }

    pub fn probe_delay(&self) -> Duration {
        Duration::from_millis(u64::from(self.probe_delay_ms))
    }
}

impl fmt::Display for ServerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.primary)?;
        if let Some(mirror) = self.mirror_port {
            write!(f, ":{}:{}", mirror, self.probe_delay_ms)?;
        }
        if let Some(secondary) = &self.secondary {
            write!(f, "/{}", secondary)?;
        }
        Ok(())
    }
}

impl FromStr for ServerEntry {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (first, second) = match s.split_once('/') {
            Some((first, second)) => (first, Some(second)),
            None => (s, None),
        };

        let fields = split_fields(first);
        if fields.is_empty() {
            return Err(ParseError::MissingHost);
        }
        if fields.len() < 2 {
            return Err(ParseError::MissingPort(s.to_string()));
        }
        if fields.len() > 4 {
            return Err(ParseError::TooManyFields(s.to_string()));
        }

        let mut entry = ServerEntry::single(fields[0], parse_port(fields[1])?);
        if let Some(mirror) = fields.get(2) {
            entry.mirror_port = parse_mirror_port(mirror)?;
        }
        if let Some(delay) = fields.get(3) {
            entry.probe_delay_ms = delay
                .parse()
                .map_err(|_| ParseError::InvalidDelay(delay.to_string()))?;
        }

        // A broken secondary never invalidates the primary server.
        if let Some(second) = second.filter(|s| !s.is_empty()) {
            match second.parse::<ServerEndpoint>() {
                Ok(endpoint) => entry.secondary = Some(endpoint),
                Err(e) => warn!("Ignoring secondary tunnel server '{}': {}", second, e),
            }
        }

        Ok(entry)
    }
}

/// Parse a space separated `server_addresses` value.
///
/// Invalid entries are logged and skipped; loading continues with the rest.
pub fn parse_server_list(value: &str) -> Vec<ServerEntry> {
    value
        .split_whitespace()
        .filter_map(|token| match token.parse::<ServerEntry>() {
            Ok(entry) => Some(entry),
            Err(e) => {
                error!(
                    "Tunnel server address incorrectly specified from config: {} ({})",
                    token, e
                );
                None
            }
        })
        .collect()
}

/// Serialize entries to the `server_addresses` value
pub fn format_server_list(entries: &[ServerEntry]) -> String {
    entries
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" ")
}

// Empty fields are skipped, so "host::443" reads as "host:443".
fn split_fields(s: &str) -> Vec<&str> {
    s.split(':').filter(|field| !field.is_empty()).collect()
}

fn parse_port(value: &str) -> Result<u16, ParseError> {
    match value.parse::<u16>() {
        Ok(port) if port != 0 => Ok(port),
        _ => Err(ParseError::InvalidPort(value.to_string())),
    }
}

fn parse_mirror_port(value: &str) -> Result<Option<u16>, ParseError> {
    if value == NO_MIRROR_PORT {
        return Ok(None);
    }
    match value.parse::<u16>() {
        Ok(port) if port != 0 => Ok(Some(port)),
        _ => Err(ParseError::InvalidMirrorPort(value.to_string())),
    }
}
