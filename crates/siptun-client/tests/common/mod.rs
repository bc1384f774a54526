//! Recording fakes for the manager's collaborators

#![allow(dead_code)]

use bytes::Bytes;
use siptun_client::{CoreHost, SipPath, TunnelManager};
use siptun_proto::LinkDirection;
use siptun_transport::{
    Datagram, DatagramTransport, LinkFactory, LinkObserver, LinkRequest, ProbeCallback,
    ProbeHandle, ProbeTarget, ReachabilityProbe, TunnelLink,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

// ----- Host -----

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostCall {
    Unregister,
    ApplyTransports { tunnel: bool },
    Register,
}

pub const TUNNEL_CYCLE: [HostCall; 3] = [
    HostCall::Unregister,
    HostCall::ApplyTransports { tunnel: true },
    HostCall::Register,
];

pub const DIRECT_CYCLE: [HostCall; 3] = [
    HostCall::Unregister,
    HostCall::ApplyTransports { tunnel: false },
    HostCall::Register,
];

pub struct RecordingHost {
    reachable: AtomicBool,
    calls: Mutex<Vec<HostCall>>,
    next_task: AtomicU64,
    open_tasks: Mutex<HashSet<u64>>,
    root_ca: Mutex<Option<PathBuf>>,
}

impl RecordingHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            reachable: AtomicBool::new(true),
            calls: Mutex::new(Vec::new()),
            next_task: AtomicU64::new(1),
            open_tasks: Mutex::new(HashSet::new()),
            root_ca: Mutex::new(None),
        })
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn set_root_ca(&self, path: Option<PathBuf>) {
        *self.root_ca.lock().unwrap() = path;
    }

    /// Calls recorded since the last take
    pub fn take_calls(&self) -> Vec<HostCall> {
        std::mem::take(&mut *self.calls.lock().unwrap())
    }

    pub fn open_tasks(&self) -> usize {
        self.open_tasks.lock().unwrap().len()
    }

    pub fn tasks_started(&self) -> u64 {
        self.next_task.load(Ordering::SeqCst) - 1
    }
}

impl CoreHost for RecordingHost {
    fn is_network_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    fn register(&self) {
        self.calls.lock().unwrap().push(HostCall::Register);
    }

    fn unregister(&self) {
        self.calls.lock().unwrap().push(HostCall::Unregister);
    }

    fn apply_sip_transports(&self, path: SipPath) {
        self.calls.lock().unwrap().push(HostCall::ApplyTransports {
            tunnel: path.is_tunnel(),
        });
    }

    fn root_ca(&self) -> Option<PathBuf> {
        self.root_ca.lock().unwrap().clone()
    }

    fn begin_background_task(&self, _name: &str) -> u64 {
        let id = self.next_task.fetch_add(1, Ordering::SeqCst);
        self.open_tasks.lock().unwrap().insert(id);
        id
    }

    fn end_background_task(&self, id: u64) {
        assert!(
            self.open_tasks.lock().unwrap().remove(&id),
            "background task {} ended twice",
            id
        );
    }
}

// ----- Links -----

pub struct MockLink {
    id: String,
    pub request: LinkRequest,
    observer: LinkObserver,
    connected: AtomicBool,
    shut_down: AtomicBool,
    sent: Mutex<Vec<(u16, SocketAddr, Vec<u8>)>>,
    inbound: Mutex<HashMap<u16, VecDeque<Datagram>>>,
}

impl MockLink {
    /// Flip the connected flag and notify the manager, as a link task would
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
        (self.observer)(self.request.direction, connected);
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<(u16, SocketAddr, Vec<u8>)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn has_port(&self, port: u16) -> bool {
        self.inbound.lock().unwrap().contains_key(&port)
    }

    pub fn inject(&self, port: u16, peer: SocketAddr, payload: &[u8]) {
        if let Some(queue) = self.inbound.lock().unwrap().get_mut(&port) {
            queue.push_back(Datagram {
                peer,
                payload: Bytes::copy_from_slice(payload),
            });
        }
    }
}

impl fmt::Debug for MockLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockLink").field("id", &self.id).finish()
    }
}

impl TunnelLink for MockLink {
    fn link_id(&self) -> &str {
        &self.id
    }

    fn direction(&self) -> LinkDirection {
        self.request.direction
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn send_to(&self, local_port: u16, peer: SocketAddr, payload: &[u8]) -> bool {
        if !self.request.direction.can_send() || self.is_shut_down() {
            return false;
        }
        self.sent
            .lock()
            .unwrap()
            .push((local_port, peer, payload.to_vec()));
        true
    }

    fn open_port(&self, local_port: u16) {
        self.inbound.lock().unwrap().entry(local_port).or_default();
    }

    fn try_recv(&self, local_port: u16) -> Option<Datagram> {
        self.inbound.lock().unwrap().get_mut(&local_port)?.pop_front()
    }

    fn close_port(&self, local_port: u16) {
        self.inbound.lock().unwrap().remove(&local_port);
    }

    fn shutdown(&self) {
        assert!(
            !self.shut_down.swap(true, Ordering::SeqCst),
            "link {} shut down twice",
            self.id
        );
        self.connected.store(false, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct MockLinkFactory {
    links: Mutex<Vec<Arc<MockLink>>>,
    auto_connect: AtomicBool,
}

impl MockLinkFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Links report connected as soon as they are opened
    pub fn set_auto_connect(&self, enabled: bool) {
        self.auto_connect.store(enabled, Ordering::SeqCst);
    }

    pub fn links(&self) -> Vec<Arc<MockLink>> {
        self.links.lock().unwrap().clone()
    }

    pub fn opened(&self) -> usize {
        self.links.lock().unwrap().len()
    }

    pub fn last(&self) -> Arc<MockLink> {
        self.links.lock().unwrap().last().cloned().expect("no link opened")
    }

    /// Links not shut down yet
    pub fn live(&self) -> Vec<Arc<MockLink>> {
        self.links()
            .into_iter()
            .filter(|link| !link.is_shut_down())
            .collect()
    }

    pub fn shutdowns(&self) -> usize {
        self.links().iter().filter(|link| link.is_shut_down()).count()
    }
}

impl LinkFactory for MockLinkFactory {
    fn open(&self, request: LinkRequest, observer: LinkObserver) -> Arc<dyn TunnelLink> {
        let mut links = self.links.lock().unwrap();
        let link = Arc::new(MockLink {
            id: format!("mock-link-{}", links.len() + 1),
            request,
            observer,
            connected: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
            inbound: Mutex::new(HashMap::new()),
        });
        links.push(link.clone());
        drop(links);

        if self.auto_connect.load(Ordering::SeqCst) {
            link.set_connected(true);
        }
        link
    }
}

// ----- Probe -----

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeBehavior {
    /// Report this outcome immediately
    Reply(bool),
    /// Hold the callback until the test completes it
    Manual,
}

pub struct MockProbe {
    behavior: Mutex<ProbeBehavior>,
    started: Mutex<Vec<ProbeTarget>>,
    pending: Mutex<VecDeque<ProbeCallback>>,
}

impl MockProbe {
    pub fn new(behavior: ProbeBehavior) -> Arc<Self> {
        Arc::new(Self {
            behavior: Mutex::new(behavior),
            started: Mutex::new(Vec::new()),
            pending: Mutex::new(VecDeque::new()),
        })
    }

    pub fn set_behavior(&self, behavior: ProbeBehavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    pub fn started(&self) -> Vec<ProbeTarget> {
        self.started.lock().unwrap().clone()
    }

    /// Deliver the outcome of the oldest held probe
    pub fn complete_next(&self, reachable: bool) {
        let callback = self
            .pending
            .lock()
            .unwrap()
            .pop_front()
            .expect("no pending probe");
        callback(reachable);
    }
}

impl ReachabilityProbe for MockProbe {
    fn start(&self, target: &ProbeTarget, on_result: ProbeCallback) -> ProbeHandle {
        self.started.lock().unwrap().push(target.clone());
        match *self.behavior.lock().unwrap() {
            ProbeBehavior::Reply(reachable) => on_result(reachable),
            ProbeBehavior::Manual => self.pending.lock().unwrap().push_back(on_result),
        }
        ProbeHandle::detached()
    }
}

// ----- Media passthrough -----

#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<(SocketAddr, Vec<u8>)>>,
    inbound: Mutex<VecDeque<(SocketAddr, Vec<u8>)>>,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn sent(&self) -> Vec<(SocketAddr, Vec<u8>)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn inject(&self, from: SocketAddr, payload: &[u8]) {
        self.inbound
            .lock()
            .unwrap()
            .push_back((from, payload.to_vec()));
    }
}

impl DatagramTransport for RecordingTransport {
    fn send_to(&self, payload: &[u8], to: SocketAddr) -> io::Result<usize> {
        self.sent.lock().unwrap().push((to, payload.to_vec()));
        Ok(payload.len())
    }

    fn recv_from(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        let Some((from, payload)) = self.inbound.lock().unwrap().pop_front() else {
            return Ok(None);
        };
        buf[..payload.len()].copy_from_slice(&payload);
        Ok(Some((payload.len(), from)))
    }
}

// ----- Harness -----

pub struct Harness {
    pub manager: TunnelManager,
    pub host: Arc<RecordingHost>,
    pub factory: Arc<MockLinkFactory>,
    pub probe: Arc<MockProbe>,
}

pub fn harness() -> Harness {
    harness_with_probe(ProbeBehavior::Manual)
}

pub fn harness_with_probe(behavior: ProbeBehavior) -> Harness {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("siptun_client=debug")
        .with_test_writer()
        .try_init();

    let host = RecordingHost::new();
    let factory = MockLinkFactory::new();
    let probe = MockProbe::new(behavior);
    let manager = TunnelManager::new(host.clone(), factory.clone(), probe.clone());

    Harness {
        manager,
        host,
        factory,
        probe,
    }
}

pub fn peer() -> SocketAddr {
    "198.51.100.20:7078".parse().unwrap()
}
