//! Command dispatch with acknowledgement correlation, retries and timeouts.
//!
//! Every issued command lives in a [`CommandContext`] owned by the registry
//! under its [`CorrelationKey`] until exactly one terminal result is delivered
//! to its result callback. Contexts are consumed on resolution, so a second
//! resolution cannot be expressed.

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use gcs_proto::ids::{cmd, comp, result, PROGRESS_UNKNOWN};
use gcs_proto::{CommandAckData, CommandLongData, Payload};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::outbox::Outbox;
use crate::registry::{CommandSlot, Registry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct CommandId(u64);

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cmd#{}", self.0)
    }
}

/// Matches an outbound command to its acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct CorrelationKey {
    pub target_component: u8,
    pub command: u16,
}

impl CorrelationKey {
    pub fn new(target_component: u8, command: u16) -> Self {
        Self { target_component, command }
    }
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.command, self.target_component)
    }
}

/// What happens when a command is issued while the same key is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicatePolicy {
    /// Resolve the new command with `DuplicateSuppressed`, nothing is sent.
    Suppress,
    /// Hold the new command until the in-flight one resolves.
    Queue,
    /// Send the new command; the in-flight one resolves with `Superseded`.
    Replace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionPolicy {
    /// Any result other than in-progress is terminal.
    Standard,
    /// The remote reports its step in `result_param2`; accepted and
    /// in-progress acks only finish the command on `final_step` or at 100%.
    Stepped { final_step: i32 },
}

impl CompletionPolicy {
    /// Whether the ack carries a completion marker under this policy.
    pub fn is_final(&self, ack: &CommandAckData) -> bool {
        match *self {
            CompletionPolicy::Standard => false,
            CompletionPolicy::Stepped { final_step } => {
                ack.result_param2 == final_step
                    || (ack.progress >= 100 && ack.progress != PROGRESS_UNKNOWN)
            }
        }
    }

    fn is_stepped(&self) -> bool {
        matches!(self, CompletionPolicy::Stepped { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandPolicy {
    pub duplicates: DuplicatePolicy,
    pub completion: CompletionPolicy,
    /// Retransmissions when the caller does not pick a budget.
    pub default_retries: u32,
}

impl CommandPolicy {
    pub const STANDARD: CommandPolicy = CommandPolicy {
        duplicates: DuplicatePolicy::Suppress,
        completion: CompletionPolicy::Standard,
        default_retries: 0,
    };
}

/// Per command kind policy table.
#[derive(Debug, Clone)]
pub struct CommandPolicies {
    by_command: HashMap<u16, CommandPolicy>,
    fallback: CommandPolicy,
}

impl Default for CommandPolicies {
    fn default() -> Self {
        let mut by_command = HashMap::new();
        // Status requests are safe to repeat over a lossy link; actions are not.
        by_command.insert(cmd::REQUEST_MESSAGE, CommandPolicy { default_retries: 2, ..CommandPolicy::STANDARD });
        by_command.insert(
            cmd::SET_MESSAGE_INTERVAL,
            CommandPolicy { duplicates: DuplicatePolicy::Replace, ..CommandPolicy::STANDARD },
        );
        by_command.insert(
            cmd::DROP_SEQUENCE,
            CommandPolicy {
                duplicates: DuplicatePolicy::Replace,
                completion: CompletionPolicy::Stepped { final_step: crate::drop_sequence::COMPLETE_STEP },
                default_retries: 0,
            },
        );
        Self { by_command, fallback: CommandPolicy::STANDARD }
    }
}

impl CommandPolicies {
    pub fn get(&self, command: u16) -> CommandPolicy {
        self.by_command.get(&command).copied().unwrap_or(self.fallback)
    }

    pub fn set(&mut self, command: u16, policy: CommandPolicy) {
        self.by_command.insert(command, policy);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CommandFailure {
    /// Retry budget exhausted without any acknowledgement.
    Timeout,
    /// Same key already in flight and the policy forbids duplicates.
    DuplicateSuppressed,
    /// Cancelled locally; the remote may still act on it.
    Cancelled,
    /// Replaced by a newer command for the same key.
    Superseded,
    /// Addressed to the broadcast component, which cannot be correlated.
    BroadcastTarget,
    /// The command id is not defined by the dialect, so it cannot be sent.
    UnknownCommand,
    /// The link closed before a terminal acknowledgement arrived.
    LinkClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AckResult {
    InProgress { progress: u8 },
    Accepted,
    Failed { code: u8 },
    Unsupported,
    Denied,
    CommandLevelFailure(CommandFailure),
}

impl AckResult {
    pub fn from_ack(ack: &CommandAckData) -> Self {
        match ack.result {
            result::ACCEPTED => AckResult::Accepted,
            result::IN_PROGRESS => AckResult::InProgress { progress: ack.progress },
            result::DENIED => AckResult::Denied,
            result::UNSUPPORTED => AckResult::Unsupported,
            code => AckResult::Failed { code },
        }
    }

    /// Wire result code for remote-reported outcomes.
    pub fn code(&self) -> Option<u8> {
        match *self {
            AckResult::InProgress { .. } => Some(result::IN_PROGRESS),
            AckResult::Accepted => Some(result::ACCEPTED),
            AckResult::Failed { code } => Some(code),
            AckResult::Unsupported => Some(result::UNSUPPORTED),
            AckResult::Denied => Some(result::DENIED),
            AckResult::CommandLevelFailure(_) => None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, AckResult::Accepted)
    }
}

impl fmt::Display for AckResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AckResult::InProgress { progress } => write!(f, "in progress ({progress}%)"),
            AckResult::Accepted => f.write_str("accepted"),
            AckResult::Failed { code } => write!(f, "failed (result {code})"),
            AckResult::Unsupported => f.write_str("unsupported"),
            AckResult::Denied => f.write_str("denied"),
            AckResult::CommandLevelFailure(failure) => write!(f, "{failure:?}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommandRequest {
    pub target_component: u8,
    pub command: u16,
    pub params: [f32; 7],
    /// Retransmissions after the first send; `None` uses the policy default.
    pub max_retries: Option<u32>,
}

impl CommandRequest {
    pub fn new(target_component: u8, command: u16) -> Self {
        Self { target_component, command, params: [0.0; 7], max_retries: None }
    }

    /// Sets param `index` (1-based, as on the wire). Out of range indices are ignored.
    pub fn param(mut self, index: usize, value: f32) -> Self {
        if let Some(slot) = index.checked_sub(1).and_then(|i| self.params.get_mut(i)) {
            *slot = value;
        }
        self
    }

    pub fn with_params(mut self, params: [f32; 7]) -> Self {
        self.params = params;
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    pub fn key(&self) -> CorrelationKey {
        CorrelationKey::new(self.target_component, self.command)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CommandHandle {
    pub id: CommandId,
    pub key: CorrelationKey,
}

/// Terminal outcome delivered once per issued command.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandResolution {
    pub id: CommandId,
    pub key: CorrelationKey,
    pub result: AckResult,
    pub ack: Option<CommandAckData>,
    pub transmissions: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandProgress {
    pub id: CommandId,
    pub key: CorrelationKey,
    pub progress: u8,
    /// Remote step indicator (`result_param2`).
    pub step: i32,
}

pub type ResultCallback = Box<dyn FnOnce(CommandResolution) + Send>;
pub type ProgressCallback = Box<dyn FnMut(CommandProgress) + Send>;

pub struct CommandContext {
    id: CommandId,
    key: CorrelationKey,
    params: [f32; 7],
    retries_remaining: u32,
    transmissions: u32,
    last_sent: Instant,
    on_result: ResultCallback,
    on_progress: Option<ProgressCallback>,
}

impl fmt::Debug for CommandContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandContext")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("retries_remaining", &self.retries_remaining)
            .field("transmissions", &self.transmissions)
            .finish_non_exhaustive()
    }
}

impl CommandContext {
    pub fn id(&self) -> CommandId {
        self.id
    }

    pub fn key(&self) -> CorrelationKey {
        self.key
    }

    pub fn retries_remaining(&self) -> u32 {
        self.retries_remaining
    }

    pub fn transmissions(&self) -> u32 {
        self.transmissions
    }

    fn report_progress(&mut self, ack: &CommandAckData) {
        if let Some(cb) = self.on_progress.as_mut() {
            cb(CommandProgress { id: self.id, key: self.key, progress: ack.progress, step: ack.result_param2 });
        }
    }

    fn resolve(self, result: AckResult, ack: Option<CommandAckData>) {
        debug!(id = %self.id, key = %self.key, %result, "command resolved");
        (self.on_result)(CommandResolution {
            id: self.id,
            key: self.key,
            result,
            ack,
            transmissions: self.transmissions,
        });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckDisposition {
    /// Progress reported, context still alive.
    Progress,
    Resolved,
    /// No live context, but the ack carries a completion marker for a
    /// stepped command kind; surfaced to listeners instead of dropped.
    LateCompletion,
    Dropped,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CommandConfig {
    /// Silence after a transmission before retrying or timing out.
    pub ack_timeout_ms: u64,
    /// How often the session checks for expired acknowledgements.
    pub check_interval_ms: u64,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self { ack_timeout_ms: 3000, check_interval_ms: 500 }
    }
}

pub struct CommandEngine {
    policies: CommandPolicies,
    ack_timeout: Duration,
    target_system: u8,
    next_id: u64,
}

impl CommandEngine {
    pub fn new(policies: CommandPolicies, ack_timeout: Duration, target_system: u8) -> Self {
        Self { policies, ack_timeout, target_system, next_id: 1 }
    }

    pub fn policies(&self) -> &CommandPolicies {
        &self.policies
    }

    pub fn policies_mut(&mut self) -> &mut CommandPolicies {
        &mut self.policies
    }

    pub fn ack_timeout(&self) -> Duration {
        self.ack_timeout
    }

    pub fn target_system(&self) -> u8 {
        self.target_system
    }

    pub fn set_target_system(&mut self, system_id: u8) {
        self.target_system = system_id;
    }

    /// Transmits the command (or applies the duplicate policy) and returns
    /// immediately. The result callback fires exactly once, possibly before
    /// this returns.
    pub fn issue(
        &mut self,
        reg: &mut Registry,
        out: &mut Outbox,
        request: CommandRequest,
        on_result: ResultCallback,
        on_progress: Option<ProgressCallback>,
        now: Instant,
    ) -> CommandHandle {
        let id = CommandId(self.next_id);
        self.next_id += 1;
        let key = request.key();
        let policy = self.policies.get(request.command);
        let mut ctx = CommandContext {
            id,
            key,
            params: request.params,
            retries_remaining: request.max_retries.unwrap_or(policy.default_retries),
            transmissions: 0,
            last_sent: now,
            on_result,
            on_progress,
        };
        let handle = CommandHandle { id, key };

        if key.target_component == comp::ALL {
            warn!(%key, "refusing command to broadcast component");
            ctx.resolve(AckResult::CommandLevelFailure(CommandFailure::BroadcastTarget), None);
            return handle;
        }
        if !cmd::is_defined(key.command) {
            warn!(%key, "refusing command the dialect does not define");
            ctx.resolve(AckResult::CommandLevelFailure(CommandFailure::UnknownCommand), None);
            return handle;
        }

        match reg.slot_mut(key) {
            None => {
                self.transmit(&mut ctx, out, now);
                reg.register_handle(id, key);
                reg.insert_slot(key, CommandSlot::new(ctx), now);
            }
            Some(slot) => match policy.duplicates {
                DuplicatePolicy::Suppress => {
                    debug!(%key, "command already pending, suppressing duplicate");
                    ctx.resolve(AckResult::CommandLevelFailure(CommandFailure::DuplicateSuppressed), None);
                }
                DuplicatePolicy::Queue => {
                    debug!(%key, queued = slot.queued.len() + 1, "command already pending, queueing");
                    slot.queued.push_back(ctx);
                    reg.register_handle(id, key);
                }
                DuplicatePolicy::Replace => {
                    self.transmit(&mut ctx, out, now);
                    let old = std::mem::replace(&mut slot.active, ctx);
                    reg.release_handle(old.id);
                    reg.register_handle(id, key);
                    old.resolve(AckResult::CommandLevelFailure(CommandFailure::Superseded), None);
                }
            },
        }
        handle
    }

    /// Correlates an acknowledgement from `from_component` with its context.
    pub fn handle_ack(
        &mut self,
        reg: &mut Registry,
        out: &mut Outbox,
        from_component: u8,
        ack: &CommandAckData,
        now: Instant,
    ) -> AckDisposition {
        let key = CorrelationKey::new(from_component, ack.command);
        let policy = self.policies.get(ack.command);
        let result = AckResult::from_ack(ack);
        let is_final = policy.completion.is_final(ack);

        let Some(slot) = reg.slot_mut(key) else {
            if policy.completion.is_stepped() && is_final {
                info!(%key, step = ack.result_param2, progress = ack.progress, "late completion ack accepted");
                return AckDisposition::LateCompletion;
            }
            debug!(%key, %result, "ack for command not pending, dropping");
            return AckDisposition::Dropped;
        };

        // A stepped accept without a step or partial progress is a plain accept.
        let reports_step = ack.result_param2 != 0 || (1..100).contains(&ack.progress);
        let progress_like = match result {
            AckResult::InProgress { .. } => true,
            AckResult::Accepted => policy.completion.is_stepped() && (reports_step || is_final),
            _ => false,
        };
        let terminal = match (result, policy.completion) {
            (AckResult::InProgress { .. }, CompletionPolicy::Standard) => None,
            (AckResult::InProgress { .. }, CompletionPolicy::Stepped { .. }) => is_final.then_some(AckResult::Accepted),
            (AckResult::Accepted, CompletionPolicy::Stepped { .. }) => {
                (is_final || !reports_step).then_some(AckResult::Accepted)
            }
            (other, _) => Some(other),
        };

        if progress_like {
            slot.active.report_progress(ack);
        }

        match terminal {
            None => {
                // The remote heard us: stop retrying, restart the silence timer.
                slot.active.retries_remaining = 0;
                slot.active.last_sent = now;
                AckDisposition::Progress
            }
            Some(result) => {
                if let Some(ctx) = self.retire_active(reg, out, key, now) {
                    reg.release_handle(ctx.id);
                    ctx.resolve(result, Some(*ack));
                }
                AckDisposition::Resolved
            }
        }
    }

    /// Retransmits or times out contexts whose acknowledgement is overdue.
    /// Returns the number of commands resolved with `Timeout`.
    pub fn poll_timeouts(&mut self, reg: &mut Registry, out: &mut Outbox, now: Instant) -> usize {
        let due: Vec<CorrelationKey> = reg
            .command_slots()
            .filter(|(_, slot)| now.saturating_duration_since(slot.active.last_sent) >= self.ack_timeout)
            .map(|(key, _)| key)
            .collect();

        let mut timed_out = 0;
        for key in due {
            let Some(slot) = reg.slot_mut(key) else { continue };
            if slot.active.retries_remaining > 0 {
                slot.active.retries_remaining -= 1;
                debug!(%key, remaining = slot.active.retries_remaining, "no ack, retransmitting");
                self.transmit(&mut slot.active, out, now);
            } else if let Some(ctx) = self.retire_active(reg, out, key, now) {
                warn!(%key, transmissions = ctx.transmissions, "no response to command");
                reg.release_handle(ctx.id);
                ctx.resolve(AckResult::CommandLevelFailure(CommandFailure::Timeout), None);
                timed_out += 1;
            }
        }
        timed_out
    }

    /// Local cancellation. Later acks for the key are dropped; the remote is
    /// not told. Returns false for unknown or already resolved handles.
    pub fn cancel(&mut self, reg: &mut Registry, out: &mut Outbox, id: CommandId, now: Instant) -> bool {
        let Some(key) = reg.key_for(id) else { return false };
        let Some(slot) = reg.slot_mut(key) else {
            reg.release_handle(id);
            return false;
        };

        let cancelled = if slot.active.id == id {
            self.retire_active(reg, out, key, now)
        } else {
            slot.queued.iter().position(|c| c.id == id).and_then(|pos| slot.queued.remove(pos))
        };
        reg.release_handle(id);
        match cancelled {
            Some(ctx) => {
                info!(%key, %id, "command cancelled");
                ctx.resolve(AckResult::CommandLevelFailure(CommandFailure::Cancelled), None);
                true
            }
            None => false,
        }
    }

    /// Resolves every active and queued context with `LinkClosed`, leaving
    /// the registry without pending commands. Returns how many resolved.
    pub fn close_all(&mut self, reg: &mut Registry) -> usize {
        let mut closed = 0;
        for (key, slot) in reg.drain_slots() {
            for ctx in std::iter::once(slot.active).chain(slot.queued) {
                reg.release_handle(ctx.id);
                ctx.resolve(AckResult::CommandLevelFailure(CommandFailure::LinkClosed), None);
                closed += 1;
            }
            debug!(%key, "pending commands closed with the link");
        }
        closed
    }

    /// Removes the active context for `key`, promoting and sending the next
    /// queued one if any.
    fn retire_active(
        &self,
        reg: &mut Registry,
        out: &mut Outbox,
        key: CorrelationKey,
        now: Instant,
    ) -> Option<CommandContext> {
        let slot = reg.slot_mut(key)?;
        match slot.queued.pop_front() {
            Some(mut next) => {
                self.transmit(&mut next, out, now);
                Some(std::mem::replace(&mut slot.active, next))
            }
            None => reg.remove_slot(key).map(|slot| slot.active),
        }
    }

    fn transmit(&self, ctx: &mut CommandContext, out: &mut Outbox, now: Instant) {
        out.push(Payload::CommandLong(CommandLongData {
            params: ctx.params,
            command: ctx.key.command,
            target_system: self.target_system,
            target_component: ctx.key.target_component,
            confirmation: ctx.transmissions.min(u8::MAX as u32) as u8,
        }));
        ctx.transmissions += 1;
        ctx.last_sent = now;
    }
}

/// Channel-backed view of an issued command for async callers.
#[derive(Debug)]
pub struct PendingCommand {
    pub handle: CommandHandle,
    result: oneshot::Receiver<CommandResolution>,
    progress: mpsc::UnboundedReceiver<CommandProgress>,
}

/// Receiving halves created before the handle is known.
#[derive(Debug)]
pub struct PendingReceivers {
    result: oneshot::Receiver<CommandResolution>,
    progress: mpsc::UnboundedReceiver<CommandProgress>,
}

impl PendingReceivers {
    pub fn with_handle(self, handle: CommandHandle) -> PendingCommand {
        PendingCommand { handle, result: self.result, progress: self.progress }
    }
}

impl PendingCommand {
    /// Callbacks feeding a [`PendingCommand`]. A dropped receiver is ignored.
    pub fn channel() -> (ResultCallback, ProgressCallback, PendingReceivers) {
        let (result_tx, result_rx) = oneshot::channel();
        let (progress_tx, progress_rx) = mpsc::unbounded_channel();
        let on_result: ResultCallback = Box::new(move |res| {
            let _ = result_tx.send(res);
        });
        let on_progress: ProgressCallback = Box::new(move |p| {
            let _ = progress_tx.send(p);
        });
        (on_result, on_progress, PendingReceivers { result: result_rx, progress: progress_rx })
    }

    pub fn id(&self) -> CommandId {
        self.handle.id
    }

    /// Next progress report; `None` once the command has resolved.
    pub async fn progress(&mut self) -> Option<CommandProgress> {
        self.progress.recv().await
    }

    pub fn try_resolution(&mut self) -> Option<CommandResolution> {
        self.result.try_recv().ok()
    }

    pub async fn resolution(self) -> anyhow::Result<CommandResolution> {
        self.result
            .await
            .map_err(|_| anyhow::anyhow!("session ended before {} resolved", self.handle.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    const T: Duration = Duration::from_millis(3000);

    struct Rig {
        engine: CommandEngine,
        reg: Registry,
        out: Outbox,
        t0: Instant,
    }

    type Log = Arc<Mutex<Vec<CommandResolution>>>;

    impl Rig {
        fn new() -> Self {
            Self {
                engine: CommandEngine::new(CommandPolicies::default(), T, 1),
                reg: Registry::new(),
                out: Outbox::new(255, 190),
                t0: Instant::now(),
            }
        }

        fn at(&self, ms: u64) -> Instant {
            self.t0 + Duration::from_millis(ms)
        }

        fn issue(&mut self, req: CommandRequest, log: &Log, ms: u64) -> CommandHandle {
            let log = log.clone();
            let now = self.at(ms);
            self.engine.issue(
                &mut self.reg,
                &mut self.out,
                req,
                Box::new(move |r| log.lock().unwrap().push(r)),
                None,
                now,
            )
        }

        fn ack(&mut self, from: u8, command: u16, result: u8, ms: u64) -> AckDisposition {
            let ack = CommandAckData { command, result, ..Default::default() };
            let now = self.at(ms);
            self.engine.handle_ack(&mut self.reg, &mut self.out, from, &ack, now)
        }

        fn sent(&mut self) -> usize {
            self.out.drain().count()
        }
    }

    #[test]
    fn accepted_ack_resolves_once() {
        let mut rig = Rig::new();
        let log = Log::default();
        rig.issue(CommandRequest::new(1, 400).param(1, 1.0), &log, 0);
        assert_eq!(rig.sent(), 1);

        assert_eq!(rig.ack(1, 400, result::ACCEPTED, 100), AckDisposition::Resolved);
        assert_eq!(rig.ack(1, 400, result::ACCEPTED, 200), AckDisposition::Dropped);
        assert_eq!(rig.ack(1, 400, result::FAILED, 300), AckDisposition::Dropped);
        let now = rig.at(100_000);
        rig.engine.poll_timeouts(&mut rig.reg, &mut rig.out, now);

        let log = log.lock().unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].result, AckResult::Accepted);
        assert!(!rig.reg.is_pending(CorrelationKey::new(1, 400)));
    }

    #[test]
    fn retry_budget_bounds_transmissions() {
        let mut rig = Rig::new();
        let log = Log::default();
        rig.issue(CommandRequest::new(1, 400).max_retries(2), &log, 0);

        let mut ms = 0;
        for _ in 0..10 {
            ms += 3000;
            let now = rig.at(ms);
            rig.engine.poll_timeouts(&mut rig.reg, &mut rig.out, now);
        }

        let confirmations: Vec<u8> = rig.out.commands().map(|c| c.confirmation).collect();
        assert_eq!(confirmations, vec![0, 1, 2]);
        let log = log.lock().unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].result, AckResult::CommandLevelFailure(CommandFailure::Timeout));
        assert_eq!(log[0].transmissions, 3);
    }

    #[test]
    fn zero_retries_times_out_after_one_interval() {
        let mut rig = Rig::new();
        let log = Log::default();
        rig.issue(CommandRequest::new(1, 400).max_retries(0), &log, 0);

        let now = rig.at(2999);
        assert_eq!(rig.engine.poll_timeouts(&mut rig.reg, &mut rig.out, now), 0);
        assert!(log.lock().unwrap().is_empty());
        let now = rig.at(3000);
        assert_eq!(rig.engine.poll_timeouts(&mut rig.reg, &mut rig.out, now), 1);

        assert_eq!(rig.sent(), 1);
        assert_eq!(
            log.lock().unwrap()[0].result,
            AckResult::CommandLevelFailure(CommandFailure::Timeout)
        );
    }

    #[test]
    fn negative_results_are_not_retried() {
        let mut rig = Rig::new();
        let log = Log::default();
        rig.issue(CommandRequest::new(1, 400).max_retries(3), &log, 0);
        rig.ack(1, 400, result::DENIED, 10);
        let now = rig.at(60_000);
        rig.engine.poll_timeouts(&mut rig.reg, &mut rig.out, now);

        assert_eq!(rig.sent(), 1);
        assert_eq!(log.lock().unwrap()[0].result, AckResult::Denied);
    }

    #[test]
    fn in_progress_stops_retries_and_reports() {
        let mut rig = Rig::new();
        let log = Log::default();
        let progress = Arc::new(Mutex::new(Vec::new()));
        let p = progress.clone();
        let l = log.clone();
        rig.engine.issue(
            &mut rig.reg,
            &mut rig.out,
            CommandRequest::new(1, 400).max_retries(5),
            Box::new(move |r| l.lock().unwrap().push(r)),
            Some(Box::new(move |pr: CommandProgress| p.lock().unwrap().push(pr.progress))),
            rig.t0,
        );
        let ack = CommandAckData { command: 400, result: result::IN_PROGRESS, progress: 30, ..Default::default() };
        let now = rig.at(2000);
        let d = rig.engine.handle_ack(&mut rig.reg, &mut rig.out, 1, &ack, now);
        assert_eq!(d, AckDisposition::Progress);
        assert_eq!(*progress.lock().unwrap(), vec![30]);

        // Timer restarted at 2000, no retries left after hearing from the remote.
        let now = rig.at(4000);
        assert_eq!(rig.engine.poll_timeouts(&mut rig.reg, &mut rig.out, now), 0);
        let now = rig.at(5000);
        assert_eq!(rig.engine.poll_timeouts(&mut rig.reg, &mut rig.out, now), 1);
        assert_eq!(rig.sent(), 1);
    }

    #[test]
    fn acks_are_matched_by_source_component() {
        let mut rig = Rig::new();
        let log = Log::default();
        rig.issue(CommandRequest::new(1, 400), &log, 0);
        assert_eq!(rig.ack(2, 400, result::ACCEPTED, 5), AckDisposition::Dropped);
        assert_eq!(rig.ack(1, 401, result::ACCEPTED, 5), AckDisposition::Dropped);
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn duplicate_is_suppressed_without_transmission() {
        let mut rig = Rig::new();
        let log = Log::default();
        rig.issue(CommandRequest::new(1, 400), &log, 0);
        rig.issue(CommandRequest::new(1, 400), &log, 1);

        assert_eq!(rig.sent(), 1);
        let log = log.lock().unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].result, AckResult::CommandLevelFailure(CommandFailure::DuplicateSuppressed));
        assert_eq!(log[0].transmissions, 0);
    }

    #[test]
    fn queued_duplicate_is_sent_after_first_resolves() {
        let mut rig = Rig::new();
        rig.engine.policies_mut().set(
            400,
            CommandPolicy { duplicates: DuplicatePolicy::Queue, ..CommandPolicy::STANDARD },
        );
        let log = Log::default();
        let first = rig.issue(CommandRequest::new(1, 400), &log, 0);
        let second = rig.issue(CommandRequest::new(1, 400), &log, 1);
        assert_eq!(rig.sent(), 1);

        rig.ack(1, 400, result::ACCEPTED, 10);
        assert_eq!(rig.sent(), 1, "queued command goes out once the first resolves");
        rig.ack(1, 400, result::FAILED, 20);

        let log = log.lock().unwrap();
        assert_eq!(log.iter().map(|r| r.id).collect::<Vec<_>>(), vec![first.id, second.id]);
        assert_eq!(log[1].result, AckResult::Failed { code: result::FAILED });
    }

    #[test]
    fn replacement_supersedes_in_flight_command() {
        let mut rig = Rig::new();
        let log = Log::default();
        let old = rig.issue(CommandRequest::new(1, cmd::SET_MESSAGE_INTERVAL), &log, 0);
        let new = rig.issue(CommandRequest::new(1, cmd::SET_MESSAGE_INTERVAL), &log, 1);
        assert_eq!(rig.sent(), 2);

        rig.ack(1, cmd::SET_MESSAGE_INTERVAL, result::ACCEPTED, 5);
        let log = log.lock().unwrap();
        assert_eq!(log[0].id, old.id);
        assert_eq!(log[0].result, AckResult::CommandLevelFailure(CommandFailure::Superseded));
        assert_eq!(log[1].id, new.id);
        assert_eq!(log[1].result, AckResult::Accepted);
    }

    #[test]
    fn cancel_makes_context_inert() {
        let mut rig = Rig::new();
        let log = Log::default();
        let h = rig.issue(CommandRequest::new(1, 400), &log, 0);
        let now = rig.at(1);
        assert!(rig.engine.cancel(&mut rig.reg, &mut rig.out, h.id, now));
        let now = rig.at(2);
        assert!(!rig.engine.cancel(&mut rig.reg, &mut rig.out, h.id, now));
        assert_eq!(rig.ack(1, 400, result::ACCEPTED, 3), AckDisposition::Dropped);

        let log = log.lock().unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].result, AckResult::CommandLevelFailure(CommandFailure::Cancelled));
    }

    #[test]
    fn broadcast_target_is_refused() {
        let mut rig = Rig::new();
        let log = Log::default();
        rig.issue(CommandRequest::new(comp::ALL, 400), &log, 0);
        assert_eq!(rig.sent(), 0);
        assert_eq!(
            log.lock().unwrap()[0].result,
            AckResult::CommandLevelFailure(CommandFailure::BroadcastTarget)
        );
    }

    #[test]
    fn stepped_command_stays_alive_until_final_step() {
        let mut rig = Rig::new();
        let log = Log::default();
        let steps = Arc::new(Mutex::new(Vec::new()));
        let s = steps.clone();
        let l = log.clone();
        rig.engine.issue(
            &mut rig.reg,
            &mut rig.out,
            CommandRequest::new(1, cmd::DROP_SEQUENCE),
            Box::new(move |r| l.lock().unwrap().push(r)),
            Some(Box::new(move |p: CommandProgress| s.lock().unwrap().push(p.step))),
            rig.t0,
        );

        for (step, res) in [(1, result::ACCEPTED), (2, result::IN_PROGRESS), (4, result::ACCEPTED)] {
            let ack = CommandAckData { command: cmd::DROP_SEQUENCE, result: res, progress: 10, result_param2: step, ..Default::default() };
            let now = rig.at(step as u64);
            assert_eq!(
                rig.engine.handle_ack(&mut rig.reg, &mut rig.out, 1, &ack, now),
                AckDisposition::Progress
            );
        }
        assert!(log.lock().unwrap().is_empty());

        let done = CommandAckData { command: cmd::DROP_SEQUENCE, result: result::IN_PROGRESS, progress: 100, result_param2: 99, ..Default::default() };
        let now = rig.at(50);
        assert_eq!(rig.engine.handle_ack(&mut rig.reg, &mut rig.out, 1, &done, now), AckDisposition::Resolved);

        assert_eq!(*steps.lock().unwrap(), vec![1, 2, 4, 99]);
        let log = log.lock().unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].result, AckResult::Accepted);
        assert_eq!(log[0].ack.map(|a| a.result_param2), Some(99));
    }

    #[test]
    fn plain_accept_finishes_a_stepped_command() {
        use crate::drop_sequence::{drop_request, DropAction};

        let mut rig = Rig::new();
        let log = Log::default();
        rig.issue(drop_request(DropAction::Stop, 7, 0.0), &log, 0);
        assert_eq!(rig.ack(1, cmd::DROP_SEQUENCE, result::ACCEPTED, 40), AckDisposition::Resolved);

        let log = log.lock().unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].result, AckResult::Accepted);
        assert!(!rig.reg.is_pending(CorrelationKey::new(1, cmd::DROP_SEQUENCE)));
    }

    #[test]
    fn close_all_resolves_active_and_queued() {
        let mut rig = Rig::new();
        rig.engine.policies_mut().set(400, CommandPolicy { duplicates: DuplicatePolicy::Queue, ..CommandPolicy::STANDARD });
        let log = Log::default();
        rig.issue(CommandRequest::new(1, 400), &log, 0);
        rig.issue(CommandRequest::new(1, 400), &log, 1);
        rig.issue(CommandRequest::new(1, cmd::REQUEST_MESSAGE), &log, 2);

        assert_eq!(rig.engine.close_all(&mut rig.reg), 3);
        assert_eq!(rig.reg.pending_count(), 0);
        let log = log.lock().unwrap();
        assert_eq!(log.len(), 3);
        assert!(log.iter().all(|r| r.result == AckResult::CommandLevelFailure(CommandFailure::LinkClosed)));
        assert_eq!(rig.engine.close_all(&mut rig.reg), 0);
    }

    #[test]
    fn undefined_command_is_refused() {
        let mut rig = Rig::new();
        let log = Log::default();
        rig.issue(CommandRequest::new(1, 7), &log, 0);
        assert_eq!(rig.sent(), 0);
        assert_eq!(log.lock().unwrap()[0].result, AckResult::CommandLevelFailure(CommandFailure::UnknownCommand));
    }

    #[test]
    fn late_completion_only_for_stepped_kinds() {
        let mut rig = Rig::new();
        let done = CommandAckData { command: cmd::DROP_SEQUENCE, result: result::ACCEPTED, result_param2: 99, ..Default::default() };
        assert_eq!(rig.engine.handle_ack(&mut rig.reg, &mut rig.out, 1, &done, rig.t0), AckDisposition::LateCompletion);

        let not_final = CommandAckData { result_param2: 3, ..done };
        assert_eq!(rig.engine.handle_ack(&mut rig.reg, &mut rig.out, 1, &not_final, rig.t0), AckDisposition::Dropped);

        let standard = CommandAckData { command: 400, ..done };
        assert_eq!(rig.engine.handle_ack(&mut rig.reg, &mut rig.out, 1, &standard, rig.t0), AckDisposition::Dropped);
    }

    #[test]
    fn unknown_progress_is_not_a_completion_marker() {
        let policy = CompletionPolicy::Stepped { final_step: 99 };
        let ack = CommandAckData { progress: PROGRESS_UNKNOWN, result_param2: 2, ..Default::default() };
        assert!(!policy.is_final(&ack));
        assert!(policy.is_final(&CommandAckData { progress: 100, ..ack }));
    }

    #[test]
    fn result_codes_map_to_variants() {
        let ack = |result| CommandAckData { result, progress: 7, ..Default::default() };
        assert_eq!(AckResult::from_ack(&ack(0)), AckResult::Accepted);
        assert_eq!(AckResult::from_ack(&ack(1)), AckResult::Failed { code: 1 });
        assert_eq!(AckResult::from_ack(&ack(2)), AckResult::Denied);
        assert_eq!(AckResult::from_ack(&ack(3)), AckResult::Unsupported);
        assert_eq!(AckResult::from_ack(&ack(4)), AckResult::Failed { code: 4 });
        assert_eq!(AckResult::from_ack(&ack(5)), AckResult::InProgress { progress: 7 });
        assert_eq!(AckResult::from_ack(&ack(6)), AckResult::Failed { code: 6 });
    }

    #[test]
    fn request_params_are_one_based() {
        let req = CommandRequest::new(1, 400).param(1, 1.5).param(7, 7.5).param(0, 9.0).param(8, 9.0);
        assert_eq!(req.params, [1.5, 0.0, 0.0, 0.0, 0.0, 0.0, 7.5]);
    }

    #[test]
    fn pending_command_receives_resolution() {
        let mut rig = Rig::new();
        let (on_result, on_progress, rx) = PendingCommand::channel();
        let handle = rig.engine.issue(
            &mut rig.reg,
            &mut rig.out,
            CommandRequest::new(1, 400),
            on_result,
            Some(on_progress),
            rig.t0,
        );
        let mut pending = rx.with_handle(handle);
        assert!(pending.try_resolution().is_none());
        rig.ack(1, 400, result::UNSUPPORTED, 10);
        assert_eq!(pending.try_resolution().map(|r| r.result), Some(AckResult::Unsupported));
    }
}
