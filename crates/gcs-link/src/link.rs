//! Single-writer link state. Everything here is mutated from the session task only.

use std::sync::Arc;
use std::time::{Duration, Instant};

use gcs_proto::ids::{autopilot, cmd, comp, mav_type, mode_flag, msg as msg_id, state};
use gcs_proto::{encode, CommandAckData, HeartbeatData, Message, Payload};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::command::{
    AckDisposition, CommandEngine, CommandHandle, CommandPolicies, CommandRequest, CommandResolution,
    ProgressCallback, ResultCallback,
};
use crate::discovery::{Discovery, DiscoveryStep, DiscoveryUpdate, StepRequest};
use crate::facts::{self, FactSink};
use crate::outbox::Outbox;
use crate::registry::{Registry, RegistrySnapshot};
use crate::state::LinkStatus;
use crate::LinkConfig;

/// Interval asked for on the last status request, in microseconds.
const STATUS_FALLBACK_INTERVAL_US: f32 = 5_000_000.0;

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum LinkEvent {
    DiscoveryComplete { component_id: u8, responsible_id: Option<u8> },
    /// A completion ack arrived after its command was already resolved locally.
    LateCompletion { component: u8, command: u16, ack: CommandAckData },
    TargetLocked { system_id: u8 },
}

pub struct LinkCore {
    pub(crate) registry: Registry,
    pub(crate) engine: CommandEngine,
    pub(crate) discovery: Discovery,
    pub(crate) outbox: Outbox,
    pub(crate) status: LinkStatus,
    events: broadcast::Sender<LinkEvent>,
    facts: Arc<dyn FactSink>,
    now: Instant,
}

impl LinkCore {
    pub fn new(cfg: &LinkConfig, facts: Arc<dyn FactSink>, now: Instant) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let status = LinkStatus { target_system: cfg.target_sys, ..Default::default() };
        Self {
            registry: Registry::new(),
            engine: CommandEngine::new(
                CommandPolicies::default(),
                Duration::from_millis(cfg.command.ack_timeout_ms),
                cfg.target_sys.unwrap_or(0),
            ),
            discovery: Discovery::new(cfg.discovery.clone()),
            outbox: Outbox::new(cfg.sys_id, cfg.comp_id),
            status,
            events,
            facts,
            now,
        }
    }

    pub fn now(&self) -> Instant {
        self.now
    }

    pub(crate) fn set_now(&mut self, now: Instant) {
        self.now = now;
    }

    pub fn status(&self) -> &LinkStatus {
        &self.status
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn engine_mut(&mut self) -> &mut CommandEngine {
        &mut self.engine
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.events.subscribe()
    }

    pub(crate) fn events(&self) -> broadcast::Sender<LinkEvent> {
        self.events.clone()
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        self.registry.snapshot(self.now)
    }

    fn emit(&self, event: LinkEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    /// Filters inbound traffic to the target system, locking onto the first
    /// vehicle heartbeat when no target is configured.
    pub(crate) fn admit(&mut self, msg: &Message) -> bool {
        match self.status.target_system {
            Some(sys) if sys == msg.system_id => {}
            Some(_) => {
                self.status.foreign_dropped += 1;
                return false;
            }
            None => match &msg.payload {
                Payload::Heartbeat(hb) if hb.mav_type != mav_type::GCS => {
                    info!(system = msg.system_id, "locked onto target system");
                    self.status.target_system = Some(msg.system_id);
                    self.engine.set_target_system(msg.system_id);
                    self.emit(LinkEvent::TargetLocked { system_id: msg.system_id });
                }
                _ => {
                    self.status.foreign_dropped += 1;
                    return false;
                }
            },
        }

        self.status.connected = true;
        self.status.messages_in += 1;
        self.status.last_msg = Some(format!("{:?} from {}", msg.kind(), msg.component_id));
        self.registry.touch(msg.component_id, self.now);
        true
    }

    pub fn issue(
        &mut self,
        request: CommandRequest,
        on_result: ResultCallback,
        on_progress: Option<ProgressCallback>,
    ) -> CommandHandle {
        self.engine.issue(&mut self.registry, &mut self.outbox, request, on_result, on_progress, self.now)
    }

    pub fn cancel(&mut self, id: crate::command::CommandId) -> bool {
        self.engine.cancel(&mut self.registry, &mut self.outbox, id, self.now)
    }

    pub fn poll_timeouts(&mut self) -> usize {
        self.engine.poll_timeouts(&mut self.registry, &mut self.outbox, self.now)
    }

    /// Fails every pending command with `LinkClosed`.
    pub fn close_pending(&mut self) -> usize {
        self.engine.close_all(&mut self.registry)
    }

    pub fn queue_heartbeat(&mut self) {
        self.outbox.push(Payload::Heartbeat(HeartbeatData {
            custom_mode: 0,
            mav_type: mav_type::GCS,
            autopilot: autopilot::INVALID,
            base_mode: mode_flag::CUSTOM_MODE_ENABLED,
            system_status: state::ACTIVE,
            mavlink_version: 3,
        }));
    }

    /// Encoded frames waiting for the transport.
    pub fn take_outgoing(&mut self) -> Vec<Vec<u8>> {
        let frames: Vec<Vec<u8>> = self
            .outbox
            .drain()
            .filter_map(|m| match encode(&m) {
                Ok(frame) => Some(frame),
                Err(e) => {
                    warn!(kind = ?m.kind(), error = %e, "link: dropping unencodable message");
                    None
                }
            })
            .collect();
        self.status.messages_out += frames.len() as u64;
        frames
    }

    fn apply(&mut self, update: DiscoveryUpdate) {
        for req in update.requests {
            self.request_step(req);
        }
        if let Some(done) = update.completed {
            self.emit(LinkEvent::DiscoveryComplete {
                component_id: done.component_id,
                responsible_id: done.responsible_id,
            });
        }
    }

    fn request_step(&mut self, req: StepRequest) {
        let request = match req.step {
            DiscoveryStep::Information => CommandRequest::new(req.target, cmd::REQUEST_MESSAGE)
                .param(1, msg_id::GIMBAL_MANAGER_INFORMATION as f32),
            DiscoveryStep::Status => {
                let interval = if req.final_attempt { STATUS_FALLBACK_INTERVAL_US } else { 0.0 };
                CommandRequest::new(req.target, cmd::SET_MESSAGE_INTERVAL)
                    .param(1, msg_id::GIMBAL_MANAGER_STATUS as f32)
                    .param(2, interval)
            }
            DiscoveryStep::LiveData => CommandRequest::new(req.target, cmd::SET_MESSAGE_INTERVAL)
                .param(1, msg_id::GIMBAL_DEVICE_ATTITUDE_STATUS as f32),
        };
        debug!(component = req.component_id, target = req.target, step = ?req.step, "discovery request");
        let step = req.step;
        self.issue(
            request,
            Box::new(move |res: CommandResolution| {
                if !res.result.is_success() {
                    debug!(key = %res.key, ?step, result = %res.result, "discovery request not accepted");
                }
            }),
            None,
        );
    }
}

pub(crate) fn on_heartbeat(msg: &Message, core: &mut LinkCore) {
    let Payload::Heartbeat(hb) = &msg.payload else { return };
    if msg.component_id == comp::AUTOPILOT1 {
        core.status.last_heartbeat = Some(core.now);
        facts::vehicle(core.facts.as_ref(), hb);
    }
    let update = core.discovery.on_presence(&mut core.registry, msg.component_id, core.now);
    core.apply(update);
}

pub(crate) fn on_sys_status(msg: &Message, core: &mut LinkCore) {
    if let Payload::SysStatus(status) = &msg.payload {
        facts::battery(core.facts.as_ref(), status);
    }
}

pub(crate) fn on_command_ack(msg: &Message, core: &mut LinkCore) {
    let Payload::CommandAck(ack) = &msg.payload else { return };
    let ours = (core.outbox.system_id(), core.outbox.component_id());
    // Zero targets come from senders that do not fill them in.
    if ack.target_system != 0 && (ack.target_system, ack.target_component) != ours {
        debug!(target_system = ack.target_system, target_component = ack.target_component, "ack for another station");
        return;
    }
    let disposition = core.engine.handle_ack(&mut core.registry, &mut core.outbox, msg.component_id, ack, core.now);
    if disposition == AckDisposition::LateCompletion {
        core.emit(LinkEvent::LateCompletion { component: msg.component_id, command: ack.command, ack: *ack });
    }
}

pub(crate) fn on_gimbal_information(msg: &Message, core: &mut LinkCore) {
    let Payload::GimbalManagerInformation(info) = &msg.payload else { return };
    let responsible = Some(info.gimbal_device_id).filter(|&id| id != 0);
    let update = core.discovery.on_information(&mut core.registry, msg.component_id, responsible, core.now);
    core.apply(update);
}

pub(crate) fn on_gimbal_status(msg: &Message, core: &mut LinkCore) {
    let Payload::GimbalManagerStatus(status) = &msg.payload else { return };
    let update = core.discovery.on_status(&mut core.registry, msg.component_id, status.gimbal_device_id, core.now);
    core.apply(update);
    if status.gimbal_device_id != 0 {
        let ours = (core.outbox.system_id(), core.outbox.component_id());
        facts::gimbal_control(core.facts.as_ref(), status.gimbal_device_id, status, ours);
    }
}

pub(crate) fn on_gimbal_attitude(msg: &Message, core: &mut LinkCore) {
    let Payload::GimbalDeviceAttitudeStatus(att) = &msg.payload else { return };
    let device = match att.gimbal_device_id {
        0 => msg.component_id,
        id @ 1..=6 => id,
        id => {
            warn!(id, component = msg.component_id, "gimbal device id out of range");
            return;
        }
    };
    let update = core.discovery.on_live_data(&mut core.registry, device);
    core.apply(update);
    facts::gimbal_attitude(core.facts.as_ref(), device, att);
}
