//! Persisted tunnel configuration
//!
//! Settings live in the `tunnel` section of a sectioned key/value store.
//! [`TomlConfigStore`] maps each section to a TOML table:
//!
//! ```toml
//! [tunnel]
//! mode = "auto"
//! sip = true
//! server_addresses = "tunnel.example.org:443:12345:1000/backup.example.org:443"
//! ```

use siptun_proto::{format_server_list, parse_server_list, ServerEntry, TunnelMode};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use toml::{Table, Value};
use tracing::{debug, error, warn};

/// Persisted store errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Cannot serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Sectioned key/value configuration store
pub trait ConfigStore {
    fn get_string(&self, section: &str, key: &str) -> Option<String>;

    fn get_int(&self, section: &str, key: &str) -> Option<i64>;

    fn get_bool(&self, section: &str, key: &str) -> Option<bool>;

    /// `None` removes the key
    fn set_string(&mut self, section: &str, key: &str, value: Option<&str>);

    fn set_int(&mut self, section: &str, key: &str, value: i64);

    fn set_bool(&mut self, section: &str, key: &str, value: bool);
}

/// In-memory store
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryConfigStore {
    sections: BTreeMap<String, Table>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn value(&self, section: &str, key: &str) -> Option<&Value> {
        self.sections.get(section)?.get(key)
    }

    fn section_mut(&mut self, section: &str) -> &mut Table {
        self.sections.entry(section.to_string()).or_default()
    }
}

impl ConfigStore for MemoryConfigStore {
    fn get_string(&self, section: &str, key: &str) -> Option<String> {
        self.value(section, key)?.as_str().map(str::to_string)
    }

    fn get_int(&self, section: &str, key: &str) -> Option<i64> {
        match self.value(section, key)? {
            Value::Integer(value) => Some(*value),
            Value::String(text) => text.trim().parse().ok(),
            _ => None,
        }
    }

    fn get_bool(&self, section: &str, key: &str) -> Option<bool> {
        match self.value(section, key)? {
            Value::Boolean(value) => Some(*value),
            Value::Integer(value) => Some(*value != 0),
            _ => None,
        }
    }

    fn set_string(&mut self, section: &str, key: &str, value: Option<&str>) {
        let table = self.section_mut(section);
        match value {
            Some(value) => {
                table.insert(key.to_string(), Value::String(value.to_string()));
            }
            None => {
                table.remove(key);
            }
        }
    }

    fn set_int(&mut self, section: &str, key: &str, value: i64) {
        self.section_mut(section)
            .insert(key.to_string(), Value::Integer(value));
    }

    fn set_bool(&mut self, section: &str, key: &str, value: bool) {
        self.section_mut(section)
            .insert(key.to_string(), Value::Boolean(value));
    }
}

/// Store backed by a TOML file
#[derive(Debug, Clone)]
pub struct TomlConfigStore {
    path: PathBuf,
    store: MemoryConfigStore,
}

impl TomlConfigStore {
    /// Open the file at `path`; a missing file yields an empty store
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let sections = if path.exists() {
            let content = fs::read_to_string(&path)?;
            toml::from_str(&content)?
        } else {
            debug!("No configuration at {}, starting empty", path.display());
            BTreeMap::new()
        };

        Ok(Self {
            path,
            store: MemoryConfigStore { sections },
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let content = toml::to_string_pretty(&self.store.sections)?;
        fs::write(&self.path, content)?;
        debug!("Configuration saved to {}", self.path.display());
        Ok(())
    }
}

impl ConfigStore for TomlConfigStore {
    fn get_string(&self, section: &str, key: &str) -> Option<String> {
        self.store.get_string(section, key)
    }

    fn get_int(&self, section: &str, key: &str) -> Option<i64> {
        self.store.get_int(section, key)
    }

    fn get_bool(&self, section: &str, key: &str) -> Option<bool> {
        self.store.get_bool(section, key)
    }

    fn set_string(&mut self, section: &str, key: &str, value: Option<&str>) {
        self.store.set_string(section, key, value)
    }

    fn set_int(&mut self, section: &str, key: &str, value: i64) {
        self.store.set_int(section, key, value)
    }

    fn set_bool(&mut self, section: &str, key: &str, value: bool) {
        self.store.set_bool(section, key, value)
    }
}

/// Snapshot of every persisted tunnel setting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelConfig {
    pub mode: TunnelMode,
    pub sip: bool,
    pub verify_cert: bool,
    pub dual_mode: bool,
    pub username: Option<String>,
    pub domain: Option<String>,
    pub http_proxy_host: Option<String>,
    pub http_proxy_port: u16,
    pub http_proxy_username: Option<String>,
    pub http_proxy_password: Option<String>,
    pub servers: Vec<ServerEntry>,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            mode: TunnelMode::Disable,
            sip: true,
            verify_cert: false,
            dual_mode: false,
            username: None,
            domain: None,
            http_proxy_host: None,
            http_proxy_port: 0,
            http_proxy_username: None,
            http_proxy_password: None,
            servers: Vec::new(),
        }
    }
}

impl TunnelConfig {
    pub const SECTION: &'static str = "tunnel";

    /// Read the `tunnel` section; missing keys take their defaults
    pub fn load(store: &dyn ConfigStore) -> Self {
        let section = Self::SECTION;
        let defaults = Self::default();

        let mode = match store.get_string(section, "mode") {
            Some(text) => text.parse().unwrap_or_else(|e| {
                error!("{}, tunnel disabled", e);
                TunnelMode::Disable
            }),
            None => defaults.mode,
        };

        let http_proxy_port = match store.get_int(section, "http_proxy_port") {
            Some(port) => u16::try_from(port).unwrap_or_else(|_| {
                warn!("Invalid HTTP proxy port {}, ignored", port);
                0
            }),
            None => defaults.http_proxy_port,
        };

        let servers = store
            .get_string(section, "server_addresses")
            .map(|list| parse_server_list(&list))
            .unwrap_or_default();

        Self {
            mode,
            sip: store.get_bool(section, "sip").unwrap_or(defaults.sip),
            verify_cert: store
                .get_bool(section, "verify_cert")
                .unwrap_or(defaults.verify_cert),
            dual_mode: store
                .get_bool(section, "dual_mode")
                .unwrap_or(defaults.dual_mode),
            username: non_empty(store.get_string(section, "username")),
            domain: non_empty(store.get_string(section, "domain")),
            http_proxy_host: non_empty(store.get_string(section, "http_proxy_host")),
            http_proxy_port,
            http_proxy_username: non_empty(store.get_string(section, "http_proxy_username")),
            http_proxy_password: non_empty(store.get_string(section, "http_proxy_password")),
            servers,
        }
    }

    pub fn save(&self, store: &mut dyn ConfigStore) {
        let section = Self::SECTION;

        store.set_string(section, "mode", Some(self.mode.as_str()));
        store.set_bool(section, "sip", self.sip);
        store.set_bool(section, "verify_cert", self.verify_cert);
        store.set_bool(section, "dual_mode", self.dual_mode);
        store.set_string(section, "username", self.username.as_deref());
        store.set_string(section, "domain", self.domain.as_deref());
        store.set_string(section, "http_proxy_host", self.http_proxy_host.as_deref());
        store.set_int(section, "http_proxy_port", i64::from(self.http_proxy_port));
        store.set_string(
            section,
            "http_proxy_username",
            self.http_proxy_username.as_deref(),
        );
        store.set_string(
            section,
            "http_proxy_password",
            self.http_proxy_password.as_deref(),
        );

        let servers = (!self.servers.is_empty()).then(|| format_server_list(&self.servers));
        store.set_string(section, "server_addresses", servers.as_deref());
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}
