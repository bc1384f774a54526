//! Host call-control engine seam

use crate::sip::SipPath;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// Services the embedding call-control engine provides to the manager.
///
/// All methods are invoked from the pump thread.
pub trait CoreHost: Send + Sync {
    fn is_network_reachable(&self) -> bool;

    /// Register SIP accounts on the current transports
    fn register(&self);

    fn unregister(&self);

    /// Rebuild the SIP listening points on the given path
    fn apply_sip_transports(&self, path: SipPath);

    /// Trusted root certificates (PEM bundle) used when verification is on
    fn root_ca(&self) -> Option<PathBuf> {
        None
    }

    /// Ask the platform to keep the process alive. Returns 0 when unsupported.
    fn begin_background_task(&self, _name: &str) -> u64 {
        0
    }

    fn end_background_task(&self, _id: u64) {}
}

/// Host lifecycle notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlobalState {
    On,
    /// Application came back to the foreground
    Resumed,
    /// Host is shutting down
    Off,
}

/// Background-task lease, ended on drop
pub struct BackgroundTask {
    host: Arc<dyn CoreHost>,
    name: &'static str,
    id: u64,
}

impl BackgroundTask {
    pub fn begin(host: Arc<dyn CoreHost>, name: &'static str) -> Self {
        let id = host.begin_background_task(name);
        debug!("Background task '{}' started (id {})", name, id);
        Self { host, name, id }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl fmt::Debug for BackgroundTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackgroundTask")
            .field("name", &self.name)
            .field("id", &self.id)
            .finish()
    }
}

impl Drop for BackgroundTask {
    fn drop(&mut self) {
        if self.id != 0 {
            self.host.end_background_task(self.id);
        }
        debug!("Background task '{}' ended", self.name);
    }
}
