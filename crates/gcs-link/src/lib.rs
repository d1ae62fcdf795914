pub mod autodetect;
pub mod command;
pub mod discovery;
pub mod doctor;
pub mod drop_sequence;
pub mod facts;
pub mod link;
pub mod outbox;
pub mod registry;
pub mod router;
pub mod session;
pub mod state;
pub mod transport;

use serde::Deserialize;

pub use command::{AckResult, CommandFailure, CommandHandle, CommandRequest, PendingCommand};
pub use link::{LinkCore, LinkEvent};
pub use session::{Session, SessionHandle};
pub use transport::{Transport, TransportConfig};

use command::CommandConfig;
use discovery::DiscoveryConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct LinkConfig {
    pub transport: TransportConfig,

    /// Ids we use on the link (ground station side)
    pub sys_id: u8,
    pub comp_id: u8,

    /// Remote system to talk to. Unset: lock onto the first vehicle heartbeat.
    pub target_sys: Option<u8>,

    /// Outbound heartbeat rate. Default 1 Hz, 0 disables.
    pub send_heartbeat_hz: Option<f32>,

    #[serde(default)]
    pub command: CommandConfig,

    #[serde(default)]
    pub discovery: DiscoveryConfig,
}

impl LinkConfig {
    /// Ground station defaults (255/190) for the given transport.
    pub fn new(transport: TransportConfig) -> Self {
        Self {
            transport,
            sys_id: 255,
            comp_id: gcs_proto::ids::comp::MISSIONPLANNER,
            target_sys: None,
            send_heartbeat_hz: None,
            command: CommandConfig::default(),
            discovery: DiscoveryConfig::default(),
        }
    }
}
