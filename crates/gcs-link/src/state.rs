use std::time::{Duration, Instant};

use gcs_proto::FramerStats;
use serde::Serialize;

#[derive(Debug, Clone, Default)]
pub struct LinkStatus {
    pub connected: bool,
    pub endpoint: Option<String>,
    /// Remote system we talk to, locked on the first heartbeat if not configured.
    pub target_system: Option<u8>,
    pub last_heartbeat: Option<Instant>,
    pub last_msg: Option<String>,
    pub messages_in: u64,
    pub messages_out: u64,
    pub foreign_dropped: u64,
    pub framer: FramerStats,
}

impl LinkStatus {
    pub fn hb_age(&self) -> Option<Duration> {
        self.last_heartbeat.map(|t| t.elapsed())
    }

    pub fn report(&self) -> StatusReport {
        StatusReport {
            connected: self.connected,
            endpoint: self.endpoint.clone(),
            target_system: self.target_system,
            heartbeat_age_ms: self.hb_age().map(|d| d.as_millis() as u64),
            last_msg: self.last_msg.clone(),
            messages_in: self.messages_in,
            messages_out: self.messages_out,
            foreign_dropped: self.foreign_dropped,
            frames: self.framer.frames,
            decode_errors: self.framer.decode_errors,
            bytes_discarded: self.framer.bytes_discarded,
        }
    }
}

/// Serialisable view of [`LinkStatus`] for the CLI and other readers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub connected: bool,
    pub endpoint: Option<String>,
    pub target_system: Option<u8>,
    pub heartbeat_age_ms: Option<u64>,
    pub last_msg: Option<String>,
    pub messages_in: u64,
    pub messages_out: u64,
    pub foreign_dropped: u64,
    pub frames: u64,
    pub decode_errors: u64,
    pub bytes_discarded: u64,
}
