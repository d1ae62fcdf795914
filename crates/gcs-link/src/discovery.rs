//! Capability discovery for components announcing themselves on the link.
//!
//! Each component runs three independent steps (information, status, live
//! data). Steps complete in any order; the component is complete once all
//! three flags are set. Flags and the completion flag only ever go from
//! false to true. There is no failure state: a component whose retry
//! budgets run out simply stays incomplete.

use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::registry::Registry;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub information_retries: u32,
    pub status_retries: u32,
    pub live_data_retries: u32,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self { information_retries: 6, status_retries: 6, live_data_retries: 3 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DiscoveryStep {
    Information,
    Status,
    LiveData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DiscoveryPhase {
    Unknown,
    AwaitingInformation,
    AwaitingStatus,
    AwaitingLiveData,
    Complete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentDiscoveryState {
    pub(crate) component_id: u8,
    pub(crate) received_information: bool,
    pub(crate) received_status: bool,
    pub(crate) received_live_data: bool,
    pub(crate) information_retries: u32,
    pub(crate) status_retries: u32,
    pub(crate) live_data_retries: u32,
    pub(crate) responsible_id: Option<u8>,
    pub(crate) complete: bool,
}

impl ComponentDiscoveryState {
    pub fn new(component_id: u8, cfg: &DiscoveryConfig) -> Self {
        Self {
            component_id,
            received_information: false,
            received_status: false,
            received_live_data: false,
            information_retries: cfg.information_retries,
            status_retries: cfg.status_retries,
            live_data_retries: cfg.live_data_retries,
            responsible_id: None,
            complete: false,
        }
    }

    pub fn component_id(&self) -> u8 {
        self.component_id
    }

    pub fn received_information(&self) -> bool {
        self.received_information
    }

    pub fn received_status(&self) -> bool {
        self.received_status
    }

    pub fn received_live_data(&self) -> bool {
        self.received_live_data
    }

    pub fn responsible_id(&self) -> Option<u8> {
        self.responsible_id
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn retries_left(&self, step: DiscoveryStep) -> u32 {
        match step {
            DiscoveryStep::Information => self.information_retries,
            DiscoveryStep::Status => self.status_retries,
            DiscoveryStep::LiveData => self.live_data_retries,
        }
    }

    pub fn phase(&self) -> DiscoveryPhase {
        if self.complete {
            DiscoveryPhase::Complete
        } else if !self.received_information {
            DiscoveryPhase::AwaitingInformation
        } else if !self.received_status {
            DiscoveryPhase::AwaitingStatus
        } else {
            DiscoveryPhase::AwaitingLiveData
        }
    }

    fn all_received(&self) -> bool {
        self.received_information && self.received_status && self.received_live_data
    }

    /// Spends one attempt of `step`'s budget. None once it is exhausted.
    fn take_attempt(&mut self, step: DiscoveryStep) -> Option<StepRequest> {
        let target = match step {
            DiscoveryStep::LiveData => self.responsible_id?,
            _ => self.component_id,
        };
        let budget = match step {
            DiscoveryStep::Information => &mut self.information_retries,
            DiscoveryStep::Status => &mut self.status_retries,
            DiscoveryStep::LiveData => &mut self.live_data_retries,
        };
        if *budget == 0 {
            return None;
        }
        *budget -= 1;
        Some(StepRequest { component_id: self.component_id, step, target, final_attempt: *budget == 0 })
    }
}

/// A wire request the session should send to advance discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepRequest {
    pub component_id: u8,
    pub step: DiscoveryStep,
    /// Component to address; the responsible sub-component for live data.
    pub target: u8,
    /// No budget remains after this attempt.
    pub final_attempt: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DiscoveryComplete {
    pub component_id: u8,
    pub responsible_id: Option<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryUpdate {
    pub requests: Vec<StepRequest>,
    pub completed: Option<DiscoveryComplete>,
}

impl DiscoveryUpdate {
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty() && self.completed.is_none()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Discovery {
    cfg: DiscoveryConfig,
}

impl Discovery {
    pub fn new(cfg: DiscoveryConfig) -> Self {
        Self { cfg }
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.cfg
    }

    /// Presence (heartbeat) from `component`. An unseen component starts with
    /// an information request; a known incomplete one has every outstanding
    /// step re-requested while budget remains.
    pub fn on_presence(&self, reg: &mut Registry, component: u8, now: Instant) -> DiscoveryUpdate {
        if self.ensure_state(reg, component, now) {
            debug!(component, "new component, requesting information");
            let requests = reg
                .discovery_mut(component)
                .and_then(|d| d.take_attempt(DiscoveryStep::Information))
                .into_iter()
                .collect();
            return DiscoveryUpdate { requests, completed: None };
        }
        self.advance(reg, component)
    }

    /// Information arrived from `component`, optionally naming its responsible sub-component.
    pub fn on_information(
        &self,
        reg: &mut Registry,
        component: u8,
        responsible: Option<u8>,
        now: Instant,
    ) -> DiscoveryUpdate {
        self.ensure_state(reg, component, now);
        if let Some(d) = reg.discovery_mut(component) {
            d.received_information = true;
        }
        if let Some(resp) = responsible.filter(|&r| r != 0) {
            reg.set_responsible(component, resp);
        }
        self.advance(reg, component)
    }

    /// Status arrived from `component`. A responsible id of 0 is not valid
    /// and the whole message is ignored.
    pub fn on_status(&self, reg: &mut Registry, component: u8, responsible: u8, now: Instant) -> DiscoveryUpdate {
        if responsible == 0 {
            debug!(component, "status without responsible id, ignoring");
            return DiscoveryUpdate::default();
        }
        self.ensure_state(reg, component, now);
        if let Some(d) = reg.discovery_mut(component) {
            d.received_status = true;
        }
        reg.set_responsible(component, responsible);
        self.advance(reg, component)
    }

    /// Live data from the sub-component `device`, matched to its owner
    /// through the responsible index. Unmatched devices are ignored.
    pub fn on_live_data(&self, reg: &mut Registry, device: u8) -> DiscoveryUpdate {
        let Some(owner) = reg.owner_of_responsible(device) else {
            debug!(device, "live data from unclaimed device");
            return DiscoveryUpdate::default();
        };
        if let Some(d) = reg.discovery_mut(owner) {
            if d.received_live_data {
                return DiscoveryUpdate::default();
            }
            d.received_live_data = true;
        }
        self.advance(reg, owner)
    }

    /// Returns true if the state was created.
    fn ensure_state(&self, reg: &mut Registry, component: u8, now: Instant) -> bool {
        if reg.discovery(component).is_some() {
            return false;
        }
        reg.touch(component, now);
        reg.insert_discovery(ComponentDiscoveryState::new(component, &self.cfg))
    }

    fn advance(&self, reg: &mut Registry, component: u8) -> DiscoveryUpdate {
        let Some(d) = reg.discovery_mut(component) else { return DiscoveryUpdate::default() };
        let mut update = DiscoveryUpdate::default();
        if d.complete {
            return update;
        }

        if d.all_received() {
            d.complete = true;
            info!(component, responsible = ?d.responsible_id, "discovery complete");
            update.completed = Some(DiscoveryComplete { component_id: component, responsible_id: d.responsible_id });
            return update;
        }

        if !d.received_information {
            update.requests.extend(d.take_attempt(DiscoveryStep::Information));
        }
        if !d.received_status {
            update.requests.extend(d.take_attempt(DiscoveryStep::Status));
        }
        if !d.received_live_data && d.received_information {
            update.requests.extend(d.take_attempt(DiscoveryStep::LiveData));
        }
        update
    }
}
