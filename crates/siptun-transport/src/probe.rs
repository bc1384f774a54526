//! UDP reachability probing ("UDP mirror test")
//!
//! A probe sends a token to the mirror port of a tunnel server and waits for
//! the same token to come back before the deadline. Each probe produces
//! exactly one boolean outcome through its callback.

use crate::{TransportError, TransportResult};
use siptun_proto::{ServerEndpoint, ServerEntry};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::net::{lookup_host, UdpSocket};
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tracing::{debug, trace};

/// Interval between token retransmissions while waiting for the echo
const RESEND_INTERVAL: Duration = Duration::from_millis(200);

/// Tokens sent per probe
const MAX_SENDS: usize = 3;

/// One reachability test
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    /// Host and UDP mirror port
    pub mirror: ServerEndpoint,
    /// Acceptable round trip
    pub deadline: Duration,
}

impl ProbeTarget {
    /// Build the probe for an entry; `None` when the entry has no mirror port
    pub fn from_entry(entry: &ServerEntry) -> Option<Self> {
        entry.mirror_endpoint().map(|mirror| Self {
            mirror,
            deadline: entry.probe_delay(),
        })
    }
}

/// Receives the single outcome of a probe (`true` = UDP works)
pub type ProbeCallback = Box<dyn FnOnce(bool) + Send>;

/// Starts reachability probes without blocking the caller
pub trait ReachabilityProbe: Send + Sync {
    fn start(&self, target: &ProbeTarget, on_result: ProbeCallback) -> ProbeHandle;
}

/// Handle on an in-flight probe. Cancelling (or dropping) it suppresses the
/// outcome if the probe has not completed yet.
#[derive(Debug, Default)]
pub struct ProbeHandle {
    task: Option<AbortHandle>,
}

impl ProbeHandle {
    /// A handle with nothing to cancel
    pub fn detached() -> Self {
        Self { task: None }
    }

    pub fn from_task(task: AbortHandle) -> Self {
        Self { task: Some(task) }
    }

    pub fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for ProbeHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Probe implementation over a real UDP socket
#[derive(Debug, Clone)]
pub struct UdpMirrorProbe {
    runtime: Handle,
}

impl UdpMirrorProbe {
    pub fn new(runtime: Handle) -> Self {
        Self { runtime }
    }

    /// Run one mirror test to completion
    pub async fn check(target: &ProbeTarget) -> bool {
        match tokio::time::timeout(target.deadline, round_trip(&target.mirror)).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                debug!("UDP mirror {} unreachable: {}", target.mirror, e);
                false
            }
            Err(_) => {
                debug!(
                    "UDP mirror {} did not answer within {:?}",
                    target.mirror, target.deadline
                );
                false
            }
        }
    }
}

impl ReachabilityProbe for UdpMirrorProbe {
    fn start(&self, target: &ProbeTarget, on_result: ProbeCallback) -> ProbeHandle {
        let target = target.clone();
        let task = self.runtime.spawn(async move {
            let reachable = UdpMirrorProbe::check(&target).await;
            on_result(reachable);
        });
        ProbeHandle::from_task(task.abort_handle())
    }
}

async fn round_trip(mirror: &ServerEndpoint) -> TransportResult<()> {
    let addr = lookup_host((mirror.host.as_str(), mirror.port))
        .await?
        .next()
        .ok_or_else(|| {
            TransportError::ConnectionError(format!("Cannot resolve {}", mirror.host))
        })?;

    let unspecified = match addr {
        SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };
    let socket = UdpSocket::bind(SocketAddr::new(unspecified, 0)).await?;
    socket.connect(addr).await?;

    let token = uuid::Uuid::new_v4();
    let mut resend = tokio::time::interval(RESEND_INTERVAL);
    let mut sent = 0;
    let mut buf = [0u8; 64];

    loop {
        tokio::select! {
            _ = resend.tick(), if sent < MAX_SENDS => {
                socket.send(token.as_bytes()).await?;
                sent += 1;
            }
            received = socket.recv(&mut buf) => {
                let n = received?;
                if &buf[..n] == token.as_bytes() {
                    return Ok(());
                }
                trace!("Ignoring unexpected mirror reply ({} bytes)", n);
            }
        }
    }
}
