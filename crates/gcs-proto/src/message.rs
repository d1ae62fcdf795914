use serde::Serialize;

use crate::error::PayloadError;
use crate::ids::msg;

/// Largest payload a frame can declare.
pub const MAX_PAYLOAD_LEN: usize = u8::MAX as usize;
const MAX_MSG_ID: u32 = 0x00FF_FFFF;

/// A decoded frame. Immutable once built by the codec.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Message {
    pub sequence: u8,
    pub system_id: u8,
    pub component_id: u8,
    pub payload: Payload,
}

impl Message {
    pub fn new(system_id: u8, component_id: u8, payload: Payload) -> Self {
        Self { sequence: 0, system_id, component_id, payload }
    }

    pub fn kind(&self) -> MessageKind {
        self.payload.kind()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum MessageKind {
    Heartbeat,
    SysStatus,
    CommandLong,
    CommandAck,
    GimbalManagerInformation,
    GimbalManagerStatus,
    GimbalDeviceAttitudeStatus,
    Unknown(u32),
}

impl MessageKind {
    pub fn from_id(id: u32) -> Self {
        match id {
            msg::HEARTBEAT => Self::Heartbeat,
            msg::SYS_STATUS => Self::SysStatus,
            msg::COMMAND_LONG => Self::CommandLong,
            msg::COMMAND_ACK => Self::CommandAck,
            msg::GIMBAL_MANAGER_INFORMATION => Self::GimbalManagerInformation,
            msg::GIMBAL_MANAGER_STATUS => Self::GimbalManagerStatus,
            msg::GIMBAL_DEVICE_ATTITUDE_STATUS => Self::GimbalDeviceAttitudeStatus,
            other => Self::Unknown(other),
        }
    }

    pub fn id(self) -> u32 {
        match self {
            Self::Heartbeat => msg::HEARTBEAT,
            Self::SysStatus => msg::SYS_STATUS,
            Self::CommandLong => msg::COMMAND_LONG,
            Self::CommandAck => msg::COMMAND_ACK,
            Self::GimbalManagerInformation => msg::GIMBAL_MANAGER_INFORMATION,
            Self::GimbalManagerStatus => msg::GIMBAL_MANAGER_STATUS,
            Self::GimbalDeviceAttitudeStatus => msg::GIMBAL_DEVICE_ATTITUDE_STATUS,
            Self::Unknown(id) => id,
        }
    }

    /// Whether the kind has a typed payload in this build.
    pub fn is_typed(self) -> bool {
        !matches!(self, Self::Unknown(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Payload {
    Heartbeat(HeartbeatData),
    SysStatus(SysStatusData),
    CommandLong(CommandLongData),
    CommandAck(CommandAckData),
    GimbalManagerInformation(GimbalManagerInformationData),
    GimbalManagerStatus(GimbalManagerStatusData),
    GimbalDeviceAttitudeStatus(GimbalDeviceAttitudeStatusData),
    Unknown(UnknownPayload),
}

impl Payload {
    pub fn kind(&self) -> MessageKind {
        match self {
            Payload::Heartbeat(_) => MessageKind::Heartbeat,
            Payload::SysStatus(_) => MessageKind::SysStatus,
            Payload::CommandLong(_) => MessageKind::CommandLong,
            Payload::CommandAck(_) => MessageKind::CommandAck,
            Payload::GimbalManagerInformation(_) => MessageKind::GimbalManagerInformation,
            Payload::GimbalManagerStatus(_) => MessageKind::GimbalManagerStatus,
            Payload::GimbalDeviceAttitudeStatus(_) => MessageKind::GimbalDeviceAttitudeStatus,
            Payload::Unknown(u) => MessageKind::Unknown(u.msg_id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct HeartbeatData {
    pub custom_mode: u32,
    pub mav_type: u8,
    pub autopilot: u8,
    pub base_mode: u8,
    pub system_status: u8,
    pub mavlink_version: u8,
}


#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct SysStatusData {
    pub sensors_present: u32,
    pub sensors_enabled: u32,
    pub sensors_health: u32,
    pub load: u16,
    /// Millivolts, `u16::MAX` when unknown.
    pub voltage_battery: u16,
    /// Centiamps, -1 when unknown.
    pub current_battery: i16,
    pub drop_rate_comm: u16,
    pub errors_comm: u16,
    pub errors_count: [u16; 4],
    /// Percent, -1 when unknown.
    pub battery_remaining: i8,
}


#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct CommandLongData {
    pub params: [f32; 7],
    pub command: u16,
    pub target_system: u8,
    pub target_component: u8,
    /// 0 on first transmission, incremented on every retransmission.
    pub confirmation: u8,
}


#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct CommandAckData {
    pub command: u16,
    pub result: u8,
    pub progress: u8,
    pub result_param2: i32,
    pub target_system: u8,
    pub target_component: u8,
}


#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct GimbalManagerInformationData {
    pub time_boot_ms: u32,
    pub cap_flags: u32,
    pub roll_min: f32,
    pub roll_max: f32,
    pub pitch_min: f32,
    pub pitch_max: f32,
    pub yaw_min: f32,
    pub yaw_max: f32,
    /// Component id of the gimbal device this manager drives, 0 if unknown.
    pub gimbal_device_id: u8,
}


#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct GimbalManagerStatusData {
    pub time_boot_ms: u32,
    pub flags: u32,
    pub gimbal_device_id: u8,
    pub primary_control_sysid: u8,
    pub primary_control_compid: u8,
    pub secondary_control_sysid: u8,
    pub secondary_control_compid: u8,
}


#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct GimbalDeviceAttitudeStatusData {
    pub time_boot_ms: u32,
    /// Attitude quaternion, w x y z.
    pub q: [f32; 4],
    pub angular_velocity_x: f32,
    pub angular_velocity_y: f32,
    pub angular_velocity_z: f32,
    pub failure_flags: u32,
    pub flags: u16,
    pub target_system: u8,
    pub target_component: u8,
    /// 0 means "the sending component", 1..=6 name a non-MAVLink device.
    pub gimbal_device_id: u8,
}

impl GimbalDeviceAttitudeStatusData {
    /// Roll, pitch, yaw in degrees.
    pub fn euler_deg(&self) -> (f32, f32, f32) {
        let [w, x, y, z] = self.q;
        let roll = (2.0 * (w * x + y * z)).atan2(1.0 - 2.0 * (x * x + y * y));
        let pitch = (2.0 * (w * y - z * x)).clamp(-1.0, 1.0).asin();
        let yaw = (2.0 * (w * z + x * y)).atan2(1.0 - 2.0 * (y * y + z * z));
        (roll.to_degrees(), pitch.to_degrees(), yaw.to_degrees())
    }
}


/// Payload of a dialect message this build has no typed form for, kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnknownPayload {
    msg_id: u32,
    bytes: Vec<u8>,
}

impl UnknownPayload {
    pub fn new(msg_id: u32, bytes: Vec<u8>) -> Result<Self, PayloadError> {
        if msg_id > MAX_MSG_ID {
            return Err(PayloadError::IdOutOfRange(msg_id));
        }
        if MessageKind::from_id(msg_id).is_typed() {
            return Err(PayloadError::KnownKind(msg_id));
        }
        if bytes.len() > MAX_PAYLOAD_LEN {
            return Err(PayloadError::TooLarge(bytes.len()));
        }
        Ok(Self { msg_id, bytes })
    }

    pub(crate) fn from_frame(msg_id: u32, bytes: &[u8]) -> Self {
        Self { msg_id, bytes: bytes.to_vec() }
    }

    pub fn msg_id(&self) -> u32 {
        self.msg_id
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}
