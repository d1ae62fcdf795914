use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use gcs_proto::{Framer, MessageKind};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::command::{
    CommandHandle, CommandId, CommandRequest, PendingCommand, ProgressCallback, ResultCallback,
};
use crate::facts::FactSink;
use crate::link::{self, LinkCore, LinkEvent};
use crate::registry::RegistrySnapshot;
use crate::router::{Router, Subscription};
use crate::state::StatusReport;
use crate::transport::Transport;
use crate::LinkConfig;

const CONTROL_CAPACITY: usize = 32;
const READ_BUF: usize = 4096;

enum Control {
    Issue {
        request: CommandRequest,
        on_result: ResultCallback,
        on_progress: Option<ProgressCallback>,
        reply: oneshot::Sender<CommandHandle>,
    },
    Cancel { id: CommandId, reply: oneshot::Sender<bool> },
    Snapshot { reply: oneshot::Sender<RegistrySnapshot> },
    Status { reply: oneshot::Sender<StatusReport> },
}

/// One link to one remote system: framing, routing and the link core, all
/// driven from a single task.
pub struct Session {
    framer: Framer,
    router: Router<LinkCore>,
    _builtin: Vec<Subscription<LinkCore>>,
    core: LinkCore,
    control_tx: mpsc::Sender<Control>,
    control_rx: mpsc::Receiver<Control>,
    check_interval: Duration,
    heartbeat_interval: Option<Duration>,
}

impl Session {
    pub fn new(cfg: &LinkConfig, facts: Arc<dyn FactSink>) -> Self {
        let mut router = Router::new();
        let builtin = vec![
            router.subscribe(MessageKind::Heartbeat, link::on_heartbeat),
            router.subscribe(MessageKind::SysStatus, link::on_sys_status),
            router.subscribe(MessageKind::CommandAck, link::on_command_ack),
            router.subscribe(MessageKind::GimbalManagerInformation, link::on_gimbal_information),
            router.subscribe(MessageKind::GimbalManagerStatus, link::on_gimbal_status),
            router.subscribe(MessageKind::GimbalDeviceAttitudeStatus, link::on_gimbal_attitude),
        ];
        let (control_tx, control_rx) = mpsc::channel(CONTROL_CAPACITY);
        let hb_hz = cfg.send_heartbeat_hz.unwrap_or(1.0);
        Self {
            framer: Framer::new(),
            router,
            _builtin: builtin,
            core: LinkCore::new(cfg, facts, Instant::now()),
            control_tx,
            control_rx,
            check_interval: Duration::from_millis(cfg.command.check_interval_ms.max(1)),
            heartbeat_interval: (hb_hz > 0.0).then(|| Duration::from_secs_f32(1.0 / hb_hz.max(0.2))),
        }
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle { control: self.control_tx.clone(), events: self.core.events() }
    }

    pub fn core(&self) -> &LinkCore {
        &self.core
    }

    pub fn core_mut(&mut self) -> &mut LinkCore {
        &mut self.core
    }

    /// Extra handlers run after the built-in ones.
    pub fn router_mut(&mut self) -> &mut Router<LinkCore> {
        &mut self.router
    }

    /// Feeds raw link bytes. Decode errors are counted and logged, never
    /// returned. Returns the number of messages dispatched.
    pub fn ingest(&mut self, bytes: &[u8], now: Instant) -> usize {
        self.core.set_now(now);
        self.framer.push(bytes);
        let mut dispatched = 0;
        while let Some(frame) = self.framer.next_frame() {
            match frame {
                Ok(msg) => {
                    if self.core.admit(&msg) {
                        self.router.dispatch(&msg, &mut self.core);
                        dispatched += 1;
                    }
                }
                Err(e) => debug!("link: dropping frame: {}", e),
            }
        }
        self.core.status.framer = self.framer.stats();
        dispatched
    }

    /// Retransmits or expires overdue commands.
    pub fn tick(&mut self, now: Instant) -> usize {
        self.core.set_now(now);
        self.core.poll_timeouts()
    }

    pub fn issue(
        &mut self,
        request: CommandRequest,
        on_result: ResultCallback,
        on_progress: Option<ProgressCallback>,
        now: Instant,
    ) -> CommandHandle {
        self.core.set_now(now);
        self.core.issue(request, on_result, on_progress)
    }

    pub fn take_outgoing(&mut self) -> Vec<Vec<u8>> {
        self.core.take_outgoing()
    }

    fn control(&mut self, ctl: Control, now: Instant) {
        self.core.set_now(now);
        // A caller that went away is not an error.
        match ctl {
            Control::Issue { request, on_result, on_progress, reply } => {
                let _ = reply.send(self.core.issue(request, on_result, on_progress));
            }
            Control::Cancel { id, reply } => {
                let _ = reply.send(self.core.cancel(id));
            }
            Control::Snapshot { reply } => {
                let _ = reply.send(self.core.snapshot());
            }
            Control::Status { reply } => {
                let _ = reply.send(self.core.status().report());
            }
        }
    }

    async fn flush(&mut self, transport: &mut Transport) -> Result<()> {
        for frame in self.core.take_outgoing() {
            transport.send(&frame).await?;
        }
        Ok(())
    }

    /// Drives the link until the transport closes or fails. Commands still
    /// pending at that point resolve with `LinkClosed`.
    pub async fn run(mut self, mut transport: Transport, endpoint: String) -> Result<()> {
        info!(%endpoint, "session: starting");
        self.core.status.endpoint = Some(endpoint);

        let res = self.pump(&mut transport).await;
        self.core.status.connected = false;

        // Requests already queued still get a resolution.
        self.control_rx.close();
        while let Ok(ctl) = self.control_rx.try_recv() {
            self.control(ctl, Instant::now());
        }
        let closed = self.core.close_pending();
        if closed > 0 {
            warn!(closed, "session: pending commands failed with the link");
        }
        res
    }

    async fn pump(&mut self, transport: &mut Transport) -> Result<()> {
        let mut buf = vec![0u8; READ_BUF];
        let mut check = tokio::time::interval(self.check_interval);
        check.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut heartbeat = tokio::time::interval(self.heartbeat_interval.unwrap_or(Duration::from_secs(3600)));
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let send_heartbeat = self.heartbeat_interval.is_some();

        loop {
            tokio::select! {
                read = transport.recv(&mut buf) => {
                    let n = read.context("session recv")?;
                    if n == 0 {
                        info!("session: link closed");
                        return Ok(());
                    }
                    self.ingest(&buf[..n], Instant::now());
                }
                _ = check.tick() => {
                    let expired = self.tick(Instant::now());
                    if expired > 0 {
                        warn!(expired, "session: commands timed out");
                    }
                }
                _ = heartbeat.tick(), if send_heartbeat => {
                    self.core.queue_heartbeat();
                }
                Some(ctl) = self.control_rx.recv() => {
                    self.control(ctl, Instant::now());
                }
            }
            self.flush(transport).await?;
        }
    }

    /// Runs the session on its own task.
    pub fn spawn(self, transport: Transport, endpoint: String) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run(transport, endpoint))
    }
}

/// Cloneable access to a running session. All requests are applied on the
/// session task; readers get copies.
#[derive(Clone)]
pub struct SessionHandle {
    control: mpsc::Sender<Control>,
    events: broadcast::Sender<LinkEvent>,
}

impl SessionHandle {
    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Control) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.control.send(make(tx)).await.map_err(|_| anyhow::anyhow!("session stopped"))?;
        rx.await.context("session stopped")
    }

    pub async fn issue(&self, request: CommandRequest) -> Result<PendingCommand> {
        let (on_result, on_progress, receivers) = PendingCommand::channel();
        let handle = self.issue_with(request, on_result, Some(on_progress)).await?;
        Ok(receivers.with_handle(handle))
    }

    pub async fn issue_with(
        &self,
        request: CommandRequest,
        on_result: ResultCallback,
        on_progress: Option<ProgressCallback>,
    ) -> Result<CommandHandle> {
        self.request(|reply| Control::Issue { request, on_result, on_progress, reply }).await
    }

    pub async fn cancel(&self, id: CommandId) -> Result<bool> {
        self.request(|reply| Control::Cancel { id, reply }).await
    }

    pub async fn snapshot(&self) -> Result<RegistrySnapshot> {
        self.request(|reply| Control::Snapshot { reply }).await
    }

    pub async fn status(&self) -> Result<StatusReport> {
        self.request(|reply| Control::Status { reply }).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.events.subscribe()
    }
}
