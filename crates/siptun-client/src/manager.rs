//! Tunnel manager: the control plane
//!
//! Every method takes `&mut self` and is meant to be called from the host's
//! main loop. Probe outcomes and link notifications arrive from other
//! threads as [`Event`]s and only take effect when [`TunnelManager::on_iterate`]
//! drains them, in order.

use crate::config::TunnelConfig;
use crate::credentials::Credentials;
use crate::detection::{AutoDetector, DetectionStart, DetectionStep};
use crate::event::{Event, EventQueue, EventSender};
use crate::host::{BackgroundTask, CoreHost, GlobalState};
use crate::links::{LinkPlan, LinkSet};
use crate::route::{direct_route, Route, SharedRoute};
use crate::rtp::{RtpTransportBinding, TunnelTransport};
use crate::sip::{self, SipPath, SIP_TUNNEL_PORT};
use crate::state::TunnelState;
use arc_swap::ArcSwap;
use siptun_proto::{LinkDirection, ServerEndpoint, ServerEntry, TunnelMode};
use siptun_transport::{
    ClientCertificate, DatagramTransport, HttpProxy, LinkFactory, LinkObserver, LinkRequest,
    LinkSecurity, ReachabilityProbe, TransportResult, TunnelLink, UdpMirrorProbe,
};
use siptun_transport_tls::{TlsLinkConfig, TlsLinkFactory};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

const DETECTION_TASK: &str = "Tunnel auto detect";
const CONNECTION_TASK: &str = "Tunnel connection";

pub struct TunnelManager {
    host: Arc<dyn CoreHost>,
    link_factory: Arc<dyn LinkFactory>,
    events: EventQueue,
    detector: AutoDetector,

    servers: Vec<ServerEntry>,
    mode: TunnelMode,
    desired: TunnelState,
    actual: TunnelState,
    dual_mode: bool,
    tunnelize_sip: bool,
    verify_server_cert: bool,
    simulate_udp_loss: bool,
    credentials: ArcSwap<Credentials>,

    links: Option<Arc<LinkSet>>,
    link_generation: u64,
    route: SharedRoute,

    rtp_bindings: HashMap<u64, u16>,
    next_binding_id: u64,

    detection_lease: Option<BackgroundTask>,
    connection_lease: Option<BackgroundTask>,
    core_off: bool,
}

impl TunnelManager {
    pub fn new(
        host: Arc<dyn CoreHost>,
        link_factory: Arc<dyn LinkFactory>,
        probe: Arc<dyn ReachabilityProbe>,
    ) -> Self {
        let events = EventQueue::new();
        let detector = AutoDetector::new(probe, events.sender());

        Self {
            host,
            link_factory,
            events,
            detector,
            servers: Vec::new(),
            mode: TunnelMode::Disable,
            desired: TunnelState::Off,
            actual: TunnelState::Off,
            dual_mode: false,
            tunnelize_sip: true,
            verify_server_cert: false,
            simulate_udp_loss: false,
            credentials: ArcSwap::from_pointee(Credentials::default()),
            links: None,
            link_generation: 0,
            route: direct_route(),
            rtp_bindings: HashMap::new(),
            next_binding_id: 1,
            detection_lease: None,
            connection_lease: None,
            core_off: false,
        }
    }

    /// Manager with TLS links and UDP mirror probes running on `runtime`
    pub fn with_tls(
        host: Arc<dyn CoreHost>,
        runtime: Handle,
        link_config: TlsLinkConfig,
    ) -> TransportResult<Self> {
        let factory = TlsLinkFactory::new(runtime.clone(), link_config)?;
        let probe = UdpMirrorProbe::new(runtime);
        Ok(Self::new(host, Arc::new(factory), Arc::new(probe)))
    }

    // ----- Provisioning -----

    pub fn add_server(&mut self, host: &str, port: u16) {
        self.add_server_entry(ServerEntry::single(host, port));
    }

    pub fn add_server_with_probe(&mut self, host: &str, port: u16, mirror_port: u16, delay_ms: u32) {
        self.add_server_entry(ServerEntry::single(host, port).with_probe(mirror_port, delay_ms));
    }

    pub fn add_server_pair(&mut self, host1: &str, port1: u16, host2: &str, port2: u16) {
        self.add_server_entry(ServerEntry::pair(host1, port1, host2, port2));
    }

    /// Probe parameters apply to the primary endpoint only
    pub fn add_server_pair_with_probe(
        &mut self,
        host1: &str,
        port1: u16,
        host2: &str,
        port2: u16,
        mirror_port: u16,
        delay_ms: u32,
    ) {
        self.add_server_entry(
            ServerEntry::pair(host1, port1, host2, port2).with_probe(mirror_port, delay_ms),
        );
    }

    pub fn add_server_entry(&mut self, entry: ServerEntry) {
        debug!("Adding tunnel server {}", entry);
        self.servers.push(entry);
        self.on_servers_changed();
    }

    /// Remove the first entry equal to `entry`
    pub fn remove_server(&mut self, entry: &ServerEntry) -> bool {
        let Some(index) = self.servers.iter().position(|e| e == entry) else {
            return false;
        };
        self.servers.remove(index);
        debug!("Removed tunnel server {}", entry);
        self.on_servers_changed();
        true
    }

    pub fn clean_servers(&mut self) {
        debug!("Clearing tunnel servers");
        self.servers.clear();
        self.stop_auto_detection();
        self.on_servers_changed();
    }

    pub fn servers(&self) -> &[ServerEntry] {
        &self.servers
    }

    fn on_servers_changed(&mut self) {
        if self.mode == TunnelMode::Auto {
            self.start_auto_detection();
        }
    }

    // ----- Mode and state -----

    pub fn set_mode(&mut self, mode: TunnelMode) {
        if self.mode == mode {
            return;
        }
        info!("Switching tunnel mode from {} to {}", self.mode, mode);
        self.mode = mode;
        self.apply_mode();
    }

    pub fn get_mode(&self) -> TunnelMode {
        self.mode
    }

    fn apply_mode(&mut self) {
        match self.mode {
            TunnelMode::Enable => {
                self.stop_auto_detection();
                self.set_desired(TunnelState::On);
            }
            TunnelMode::Disable => {
                self.stop_auto_detection();
                self.set_desired(TunnelState::Off);
            }
            TunnelMode::Auto => self.start_auto_detection(),
        }
    }

    fn set_desired(&mut self, state: TunnelState) {
        self.desired = state;
        self.apply_state();
    }

    fn apply_state(&mut self) {
        if self.core_off || !self.host.is_network_reachable() {
            return;
        }

        match (self.desired, self.actual) {
            (TunnelState::On, TunnelState::Off) => {
                if self.links.is_none() {
                    self.start_links();
                }
                if self.links.as_ref().is_some_and(|links| links.is_ready()) {
                    self.tunnelize();
                }
            }
            (TunnelState::Off, TunnelState::On) => {
                self.untunnelize();
            }
            (TunnelState::Off, TunnelState::Off) => {
                // Links opened for an On that was withdrawn before they connected
                if self.links.is_some() {
                    self.stop_links();
                }
            }
            (TunnelState::On, TunnelState::On) => {}
        }
    }

    fn tunnelize(&mut self) {
        let Some(links) = self.links.clone() else {
            return;
        };
        info!("Entering tunneled mode");
        self.actual = TunnelState::On;
        self.route.store(Arc::new(Route::Tunneled(links)));
        self.connection_lease = None;

        if self.tunnelize_sip {
            sip::reregister(self.host.as_ref(), SipPath::Tunnel(self.sip_transport()));
        }
    }

    /// Route back to direct, tear the links down, then re-register
    fn untunnelize(&mut self) {
        info!("Leaving tunneled mode");
        self.actual = TunnelState::Off;
        self.route.store(Arc::new(Route::Direct));
        self.stop_links();

        if self.tunnelize_sip {
            sip::reregister(self.host.as_ref(), SipPath::Direct);
        }
    }

    pub fn desired_state(&self) -> TunnelState {
        self.desired
    }

    pub fn actual_state(&self) -> TunnelState {
        self.actual
    }

    /// Traffic is routed through the tunnel
    pub fn is_activated(&self) -> bool {
        self.actual == TunnelState::On
    }

    /// Tunneled and every link currently connected. Links that are up while
    /// the tunnel is not activated (still connecting the other half of a
    /// pair, or withdrawn) do not count.
    pub fn is_connected(&self) -> bool {
        self.is_activated() && self.links.as_ref().is_some_and(|links| links.is_ready())
    }

    // ----- Auto-detection -----

    fn start_auto_detection(&mut self) {
        if self.core_off {
            return;
        }
        if !self.host.is_network_reachable() {
            debug!("Network unreachable, auto-detection deferred");
            self.stop_auto_detection();
            return;
        }

        match self.detector.start(&self.servers) {
            DetectionStart::Started => {
                if self.detection_lease.is_none() {
                    self.detection_lease = Some(self.begin_task(DETECTION_TASK));
                }
            }
            DetectionStart::NoCandidates => {
                warn!("No UDP mirror server configured, tunnel stays off");
                self.detection_lease = None;
                self.set_desired(TunnelState::Off);
            }
        }
    }

    fn stop_auto_detection(&mut self) {
        self.detector.cancel();
        self.detection_lease = None;
    }

    /// Force every probe outcome to "unreachable"
    pub fn simulate_udp_loss(&mut self, enabled: bool) {
        self.simulate_udp_loss = enabled;
    }

    // ----- Links -----

    fn start_links(&mut self) {
        let Some(plan) = LinkPlan::for_entries(&self.servers, self.dual_mode) else {
            warn!("No tunnel server configured, cannot start the tunnel");
            return;
        };

        self.link_generation += 1;
        let generation = self.link_generation;
        let observer = link_observer(self.events.sender(), generation);

        let links = match plan {
            LinkPlan::Single { servers } => {
                info!("Starting tunnel link over {} server(s)", servers.len());
                let link = self.open_link(servers, LinkDirection::Both, observer);
                LinkSet::single(generation, link)
            }
            LinkPlan::Dual { send, recv } => {
                info!("Starting dual tunnel links over {} server pair(s)", send.len());
                let send_link = self.open_link(send, LinkDirection::SendOnly, observer.clone());
                let recv_link = self.open_link(recv, LinkDirection::RecvOnly, observer);
                LinkSet::dual(generation, send_link, recv_link)
            }
        };

        links.open_port(SIP_TUNNEL_PORT);
        for port in self.rtp_bindings.values() {
            links.open_port(*port);
        }

        self.links = Some(Arc::new(links));
        self.take_connection_lease();
    }

    fn open_link(
        &self,
        servers: Vec<ServerEndpoint>,
        direction: LinkDirection,
        observer: LinkObserver,
    ) -> Arc<dyn TunnelLink> {
        let credentials = self.credentials.load();
        let request = LinkRequest {
            servers,
            direction,
            security: self.link_security(&credentials),
            proxy: credentials.http_proxy(),
            identity: credentials.identity(),
        };
        let link = self.link_factory.open(request, observer);
        debug!("Opened {} link {}", direction, link.link_id());
        link
    }

    fn link_security(&self, credentials: &Credentials) -> LinkSecurity {
        LinkSecurity {
            verify_server_cert: self.verify_server_cert,
            root_ca: if self.verify_server_cert {
                self.host.root_ca()
            } else {
                None
            },
            client_certificate: credentials.client_certificate.clone(),
        }
    }

    fn stop_links(&mut self) {
        if let Some(links) = self.links.take() {
            debug!("Stopping tunnel links (generation {})", links.generation());
            links.shutdown();
        }
        self.connection_lease = None;
    }

    /// Tear down and re-establish the current links, keeping the mode
    pub fn reconnect(&mut self) {
        let Some(old) = self.links.take() else {
            debug!("No tunnel link to reconnect");
            return;
        };
        info!("Reconnecting tunnel");
        old.shutdown();
        self.start_links();

        if self.actual == TunnelState::On {
            match &self.links {
                Some(links) => self.route.store(Arc::new(Route::Tunneled(links.clone()))),
                None => self.untunnelize(),
            }
        }
    }

    pub fn enable_dual_mode(&mut self, enable: bool) {
        self.dual_mode = enable;
    }

    /// Configured flag, whether or not a paired server exists
    pub fn is_dual_mode_enabled(&self) -> bool {
        self.dual_mode
    }

    // ----- SIP -----

    pub fn tunnelize_sip_packets(&mut self, enable: bool) {
        if self.tunnelize_sip == enable {
            return;
        }
        self.tunnelize_sip = enable;

        if self.actual == TunnelState::On {
            let path = if enable {
                SipPath::Tunnel(self.sip_transport())
            } else {
                SipPath::Direct
            };
            sip::reregister(self.host.as_ref(), path);
        }
    }

    pub fn tunnelize_sip_packets_enabled(&self) -> bool {
        self.tunnelize_sip
    }

    /// Datagram transport the SIP stack uses while tunneled
    pub fn sip_transport(&self) -> TunnelTransport {
        TunnelTransport::new(self.route.clone(), SIP_TUNNEL_PORT)
    }

    // ----- Credentials -----

    pub fn verify_server_certificate(&mut self, enable: bool) {
        self.verify_server_cert = enable;
    }

    pub fn verify_server_certificate_enabled(&self) -> bool {
        self.verify_server_cert
    }

    pub fn set_client_certificate(&mut self, certificate: Option<ClientCertificate>) {
        self.update_credentials(|c| c.client_certificate = certificate);
    }

    pub fn client_certificate(&self) -> Option<ClientCertificate> {
        self.credentials.load().client_certificate.clone()
    }

    /// An empty host removes the proxy
    pub fn set_http_proxy(
        &mut self,
        host: &str,
        port: u16,
        username: Option<&str>,
        password: Option<&str>,
    ) {
        self.update_credentials(|c| {
            c.http_proxy_host = Some(host.to_string()).filter(|h| !h.is_empty());
            c.http_proxy_port = port;
            c.http_proxy_username = username.map(str::to_string);
            c.http_proxy_password = password.map(str::to_string);
        });
    }

    pub fn set_http_proxy_auth_info(&mut self, username: Option<&str>, password: Option<&str>) {
        self.update_credentials(|c| {
            c.http_proxy_username = username.map(str::to_string);
            c.http_proxy_password = password.map(str::to_string);
        });
    }

    pub fn http_proxy(&self) -> Option<HttpProxy> {
        self.credentials.load().http_proxy()
    }

    pub fn set_username(&mut self, username: Option<&str>) {
        self.update_credentials(|c| c.username = username.map(str::to_string));
    }

    pub fn username(&self) -> Option<String> {
        self.credentials.load().username.clone()
    }

    pub fn set_domain(&mut self, domain: Option<&str>) {
        self.update_credentials(|c| c.domain = domain.map(str::to_string));
    }

    pub fn domain(&self) -> Option<String> {
        self.credentials.load().domain.clone()
    }

    fn update_credentials(&self, update: impl FnOnce(&mut Credentials)) {
        let mut next = Credentials::clone(&self.credentials.load());
        update(&mut next);
        self.credentials.store(Arc::new(next));
    }

    // ----- RTP interception -----

    /// Intercept media on `port`; `passthrough` is used while not tunneled
    pub fn create_rtp_transport(
        &mut self,
        port: u16,
        passthrough: Arc<dyn DatagramTransport>,
    ) -> Arc<RtpTransportBinding> {
        let id = self.next_binding_id;
        self.next_binding_id += 1;
        self.rtp_bindings.insert(id, port);

        if let Some(links) = &self.links {
            links.open_port(port);
        }
        debug!("RTP transport {} created on port {}", id, port);

        Arc::new(RtpTransportBinding::new(
            id,
            TunnelTransport::new(self.route.clone(), port),
            passthrough,
        ))
    }

    pub fn close_rtp_transport(&mut self, binding: &RtpTransportBinding) {
        let Some(port) = self.rtp_bindings.remove(&binding.id()) else {
            return;
        };
        let still_used = port == SIP_TUNNEL_PORT || self.rtp_bindings.values().any(|p| *p == port);
        if !still_used {
            if let Some(links) = &self.links {
                links.close_port(port);
            }
        }
        debug!("RTP transport {} closed", binding.id());
    }

    pub fn rtp_binding_count(&self) -> usize {
        self.rtp_bindings.len()
    }

    // ----- Configuration -----

    /// Apply a persisted snapshot; the mode is applied last
    pub fn configure(&mut self, config: &TunnelConfig) {
        self.update_credentials(|c| {
            c.http_proxy_host = config.http_proxy_host.clone();
            c.http_proxy_port = config.http_proxy_port;
            c.http_proxy_username = config.http_proxy_username.clone();
            c.http_proxy_password = config.http_proxy_password.clone();
            c.username = config.username.clone();
            c.domain = config.domain.clone();
        });
        self.enable_dual_mode(config.dual_mode);

        let servers_changed = self.servers != config.servers;
        self.servers = config.servers.clone();

        self.tunnelize_sip_packets(config.sip);
        self.verify_server_certificate(config.verify_cert);

        if config.mode != self.mode {
            self.set_mode(config.mode);
        } else if servers_changed {
            self.on_servers_changed();
        }
    }

    pub fn config_snapshot(&self) -> TunnelConfig {
        let credentials = self.credentials.load();
        TunnelConfig {
            mode: self.mode,
            sip: self.tunnelize_sip,
            verify_cert: self.verify_server_cert,
            dual_mode: self.dual_mode,
            username: credentials.username.clone(),
            domain: credentials.domain.clone(),
            http_proxy_host: credentials.http_proxy_host.clone(),
            http_proxy_port: credentials.http_proxy_port,
            http_proxy_username: credentials.http_proxy_username.clone(),
            http_proxy_password: credentials.http_proxy_password.clone(),
            servers: self.servers.clone(),
        }
    }

    // ----- Pump and host notifications -----

    /// Producer handle for custom probes or links
    pub fn event_sender(&self) -> EventSender {
        self.events.sender()
    }

    /// Drain and process every pending event
    pub fn on_iterate(&mut self) {
        while let Some(event) = self.events.pop() {
            self.process_event(event);
        }
    }

    fn process_event(&mut self, event: Event) {
        match event {
            Event::ProbeResult {
                generation,
                reachable,
            } => match self
                .detector
                .on_result(generation, reachable, self.simulate_udp_loss)
            {
                DetectionStep::Stale => {
                    debug!("Discarding stale probe result (generation {})", generation)
                }
                DetectionStep::Continue => {}
                DetectionStep::Concluded(state) => {
                    info!("Auto-detection concluded, tunnel {}", state);
                    self.detection_lease = None;
                    self.set_desired(state);
                }
            },
            Event::LinkChanged {
                generation,
                direction,
                connected,
            } => {
                let Some(links) = self.links.clone().filter(|l| l.generation() == generation) else {
                    debug!(
                        "Discarding stale link event (generation {}, {} {})",
                        generation,
                        direction,
                        if connected { "up" } else { "down" }
                    );
                    return;
                };

                if connected {
                    info!("Tunnel link {} connected", links.describe(direction));
                    if self.actual == TunnelState::On {
                        if links.is_ready() {
                            self.connection_lease = None;
                        }
                    } else {
                        self.apply_state();
                    }
                } else {
                    warn!("Tunnel link {} disconnected", links.describe(direction));
                    if self.actual == TunnelState::On {
                        self.take_connection_lease();
                    }
                }
            }
        }
    }

    pub fn on_network_reachable(&mut self, reachable: bool) {
        if reachable {
            info!("Network is reachable");
            if self.mode == TunnelMode::Auto {
                self.start_auto_detection();
            } else if self.links.is_some() {
                self.reconnect();
            } else {
                self.apply_state();
            }
        } else {
            info!("Network is unreachable, stopping tunnel");
            self.stop_auto_detection();
            if self.actual == TunnelState::On {
                self.untunnelize();
            } else {
                self.stop_links();
            }
        }
    }

    pub fn on_global_state_changed(&mut self, state: GlobalState) {
        match state {
            GlobalState::Resumed => {
                debug!("Application resumed");
                self.reconnect();
            }
            GlobalState::Off => {
                info!("Host is shutting down, releasing tunnel");
                self.shutdown();
                self.core_off = true;
            }
            GlobalState::On => {}
        }
    }

    fn shutdown(&mut self) {
        self.stop_auto_detection();
        self.route.store(Arc::new(Route::Direct));
        self.actual = TunnelState::Off;
        self.stop_links();
    }

    // ----- Background task leases -----
    //
    // Detection and connection attempts each hold their own lease.

    fn begin_task(&self, name: &'static str) -> BackgroundTask {
        BackgroundTask::begin(self.host.clone(), name)
    }

    fn take_connection_lease(&mut self) {
        if self.connection_lease.is_none() {
            self.connection_lease = Some(self.begin_task(CONNECTION_TASK));
        }
    }

    /// A probe or a connection attempt is in progress
    pub fn holds_background_task(&self) -> bool {
        self.detection_lease.is_some() || self.connection_lease.is_some()
    }
}

impl Drop for TunnelManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn link_observer(events: EventSender, generation: u64) -> LinkObserver {
    Arc::new(move |direction, connected| {
        events.post(Event::LinkChanged {
            generation,
            direction,
            connected,
        })
    })
}
