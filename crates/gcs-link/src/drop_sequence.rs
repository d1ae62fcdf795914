//! Cargo drop sequence run by the autopilot as one long-running command.
//!
//! The autopilot acknowledges the command repeatedly while the sequence runs,
//! reporting its current step in `result_param2`; step 99 or 100% progress
//! marks the end.

use std::fmt;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use gcs_proto::ids::{cmd, comp, result, PROGRESS_UNKNOWN};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::command::{
    AckResult, CommandFailure, CommandHandle, CommandProgress, CommandRequest, CommandResolution, ProgressCallback,
    ResultCallback,
};
use crate::link::LinkEvent;
use crate::session::SessionHandle;

pub const COMPLETE_STEP: i32 = 99;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropAction {
    Start = 1,
    Stop = 2,
}

pub fn drop_request(action: DropAction, tag_id: i32, altitude_m: f32) -> CommandRequest {
    CommandRequest::new(comp::AUTOPILOT1, cmd::DROP_SEQUENCE)
        .param(1, 1.0)
        .param(3, tag_id as f32)
        .param(4, action as u8 as f32)
        .param(5, altitude_m)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DropPhase {
    SequenceStart,
    Descending,
    OpeningBay,
    DroppingCargo,
    ClosingBay,
    Ascending,
    ChangingMode,
}

impl DropPhase {
    pub fn from_step(step: i32) -> Option<Self> {
        Some(match step {
            1 => DropPhase::SequenceStart,
            2 => DropPhase::Descending,
            3 => DropPhase::OpeningBay,
            4 => DropPhase::DroppingCargo,
            5 => DropPhase::ClosingBay,
            6 => DropPhase::Ascending,
            7 => DropPhase::ChangingMode,
            _ => return None,
        })
    }
}

impl fmt::Display for DropPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DropPhase::SequenceStart => "S1 - Sequence Start",
            DropPhase::Descending => "S2 - Descending",
            DropPhase::OpeningBay => "S3 - Opening Bay",
            DropPhase::DroppingCargo => "S4 - Dropping Cargo",
            DropPhase::ClosingBay => "S5 - Closing Bay",
            DropPhase::Ascending => "S6 - Ascending",
            DropPhase::ChangingMode => "S7 - Changing Mode",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DropStatus {
    Idle,
    Phase(DropPhase),
    InProgress,
    Success,
    Complete,
    Stopped,
    Failed,
    Error(u8),
}

impl fmt::Display for DropStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DropStatus::Idle => f.write_str("Idle"),
            DropStatus::Phase(p) => fmt::Display::fmt(p, f),
            DropStatus::InProgress => f.write_str("In Progress"),
            DropStatus::Success => f.write_str("Success"),
            DropStatus::Complete => f.write_str("Complete"),
            DropStatus::Stopped => f.write_str("Stopped"),
            DropStatus::Failed => f.write_str("Failed"),
            DropStatus::Error(code) => write!(f, "Error ({})", code),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DropSequenceTracker {
    pub in_progress: bool,
    /// 0.0 ..= 1.0
    pub progress: f32,
    pub status: DropStatus,
    /// Last step reported by the autopilot.
    pub index: i32,
}

impl Default for DropSequenceTracker {
    fn default() -> Self {
        Self { in_progress: false, progress: 0.0, status: DropStatus::Idle, index: 0 }
    }
}

impl DropSequenceTracker {
    pub fn start(&mut self) {
        *self = Self { in_progress: true, status: DropStatus::InProgress, ..Self::default() };
    }

    pub fn stop(&mut self) {
        self.in_progress = false;
        self.status = DropStatus::Stopped;
    }

    /// Applies a progress report. Reports are taken while the sequence runs,
    /// or at any time when they carry the completion marker. Returns whether
    /// the report was applied.
    pub fn on_progress(&mut self, step: i32, progress: u8) -> bool {
        let known = progress != PROGRESS_UNKNOWN;
        let finished = step == COMPLETE_STEP || (known && progress >= 100);
        if !self.in_progress && !finished {
            return false;
        }

        self.index = step;
        if known {
            self.progress = progress.min(100) as f32 / 100.0;
        }
        self.status = match DropPhase::from_step(step) {
            Some(phase) => DropStatus::Phase(phase),
            None if step == COMPLETE_STEP => DropStatus::Complete,
            None if finished => DropStatus::Success,
            None => DropStatus::InProgress,
        };
        if step == COMPLETE_STEP {
            self.progress = 1.0;
        }
        if finished {
            self.in_progress = false;
        }
        true
    }

    /// Applies the terminal outcome of the start command.
    pub fn on_resolution(&mut self, res: &AckResult) {
        if !self.in_progress {
            return;
        }
        self.status = match *res {
            AckResult::Accepted => {
                self.progress = 1.0;
                DropStatus::Complete
            }
            AckResult::InProgress { .. } => return,
            AckResult::Failed { code } if code == result::FAILED => DropStatus::Failed,
            AckResult::Failed { code } => DropStatus::Error(code),
            AckResult::Denied => DropStatus::Error(result::DENIED),
            AckResult::Unsupported => DropStatus::Error(result::UNSUPPORTED),
            // A newer drop command took over; it reports for itself.
            AckResult::CommandLevelFailure(CommandFailure::Superseded | CommandFailure::Cancelled) => return,
            AckResult::CommandLevelFailure(_) => DropStatus::Failed,
        };
        self.in_progress = false;
    }
}

/// Runs drop sequences through a session and keeps a shared tracker current.
#[derive(Clone)]
pub struct DropSequence {
    session: SessionHandle,
    tracker: Arc<Mutex<DropSequenceTracker>>,
}

impl DropSequence {
    pub fn new(session: SessionHandle) -> Self {
        Self { session, tracker: Arc::new(Mutex::new(DropSequenceTracker::default())) }
    }

    pub fn state(&self) -> DropSequenceTracker {
        self.tracker.lock().map(|t| t.clone()).unwrap_or_default()
    }

    pub async fn start(&self, tag_id: i32, altitude_m: f32) -> Result<CommandHandle> {
        self.update(DropSequenceTracker::start);
        info!(tag_id, altitude_m, "drop sequence: start");

        let on_result: ResultCallback = {
            let tracker = self.tracker.clone();
            Box::new(move |res: CommandResolution| {
                if let Ok(mut t) = tracker.lock() {
                    t.on_resolution(&res.result);
                }
            })
        };
        let on_progress: ProgressCallback = {
            let tracker = self.tracker.clone();
            Box::new(move |p: CommandProgress| {
                if let Ok(mut t) = tracker.lock() {
                    t.on_progress(p.step, p.progress);
                }
            })
        };
        self.session
            .issue_with(drop_request(DropAction::Start, tag_id, altitude_m), on_result, Some(on_progress))
            .await
    }

    /// Sends the stop action, which replaces an in-flight start.
    pub async fn stop(&self, tag_id: i32, altitude_m: f32) -> Result<CommandHandle> {
        self.update(DropSequenceTracker::stop);
        info!(tag_id, "drop sequence: stop");
        self.session
            .issue_with(
                drop_request(DropAction::Stop, tag_id, altitude_m),
                Box::new(|res: CommandResolution| {
                    if !res.result.is_success() {
                        warn!(result = %res.result, "drop sequence: stop not confirmed");
                    }
                }),
                None,
            )
            .await
    }

    /// Feeds completion acks that arrive after the start command resolved.
    pub fn watch_late_completions(&self) -> JoinHandle<()> {
        let mut events = self.session.subscribe();
        let tracker = self.tracker.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(LinkEvent::LateCompletion { command, ack, .. }) if command == cmd::DROP_SEQUENCE => {
                        if let Ok(mut t) = tracker.lock() {
                            t.on_progress(ack.result_param2, ack.progress);
                        }
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(n, "drop sequence: missed link events");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    fn update(&self, f: impl FnOnce(&mut DropSequenceTracker)) {
        if let Ok(mut t) = self.tracker.lock() {
            f(&mut t);
        }
    }
}
