//! Auto-detection: is a direct UDP path available?
//!
//! Probe-eligible entries (those with a mirror port) are snapshotted when
//! detection starts and probed one after the other. The first echo concludes
//! that the tunnel is not needed; exhausting the list concludes that it is.
//! Every start or cancel bumps the generation so that late results from a
//! superseded run are recognised and dropped.

use crate::event::{Event, EventSender};
use crate::state::TunnelState;
use siptun_proto::ServerEntry;
use siptun_transport::{ProbeHandle, ProbeTarget, ReachabilityProbe};
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionStart {
    Started,
    /// No entry defines a mirror port
    NoCandidates,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionStep {
    /// Result from a superseded or finished run
    Stale,
    /// Next candidate is being probed
    Continue,
    Concluded(TunnelState),
}

pub struct AutoDetector {
    probe: Arc<dyn ReachabilityProbe>,
    events: EventSender,
    targets: Vec<ProbeTarget>,
    cursor: usize,
    generation: u64,
    in_flight: Option<ProbeHandle>,
}

impl AutoDetector {
    pub fn new(probe: Arc<dyn ReachabilityProbe>, events: EventSender) -> Self {
        Self {
            probe,
            events,
            targets: Vec::new(),
            cursor: 0,
            generation: 0,
            in_flight: None,
        }
    }

    /// Start (or restart) detection over `entries`
    pub fn start(&mut self, entries: &[ServerEntry]) -> DetectionStart {
        self.cancel();

        self.targets = entries.iter().filter_map(ProbeTarget::from_entry).collect();
        self.cursor = 0;

        if self.targets.is_empty() {
            return DetectionStart::NoCandidates;
        }

        info!(
            "Starting auto-detection over {} UDP mirror(s)",
            self.targets.len()
        );
        self.launch();
        DetectionStart::Started
    }

    /// Feed a probe outcome. `simulate_loss` forces it to unreachable.
    pub fn on_result(&mut self, generation: u64, reachable: bool, simulate_loss: bool) -> DetectionStep {
        if generation != self.generation || self.in_flight.is_none() {
            return DetectionStep::Stale;
        }
        self.in_flight = None;

        if reachable && !simulate_loss {
            info!(
                "UDP mirror {} answered, direct path available",
                self.targets[self.cursor].mirror
            );
            return DetectionStep::Concluded(TunnelState::Off);
        }

        debug!(
            "UDP mirror {} unreachable{}",
            self.targets[self.cursor].mirror,
            if simulate_loss { " (simulated loss)" } else { "" }
        );

        self.cursor += 1;
        if self.cursor < self.targets.len() {
            self.launch();
            DetectionStep::Continue
        } else {
            info!("No UDP mirror answered, tunnel required");
            DetectionStep::Concluded(TunnelState::On)
        }
    }

    /// Stop any running detection; its pending result becomes stale
    pub fn cancel(&mut self) {
        self.generation += 1;
        if let Some(mut handle) = self.in_flight.take() {
            debug!("Auto-detection cancelled");
            handle.cancel();
        }
    }

    pub fn is_running(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn launch(&mut self) {
        let target = &self.targets[self.cursor];
        let generation = self.generation;
        let events = self.events.clone();

        debug!(
            "Probing UDP mirror {} ({}/{}, deadline {:?})",
            target.mirror,
            self.cursor + 1,
            self.targets.len(),
            target.deadline
        );

        self.in_flight = Some(self.probe.start(
            target,
            Box::new(move |reachable| {
                events.post(Event::ProbeResult {
                    generation,
                    reachable,
                })
            }),
        ));
    }
}
