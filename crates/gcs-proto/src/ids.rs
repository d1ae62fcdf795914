//! Numeric identifiers carried on the wire, taken from the common dialect.

use mavlink::common::{
    GimbalDeviceFlags, MavAutopilot, MavCmd, MavComponent, MavModeFlag, MavResult, MavState, MavType,
};

pub mod msg {
    pub const HEARTBEAT: u32 = 0;
    pub const SYS_STATUS: u32 = 1;
    pub const COMMAND_LONG: u32 = 76;
    pub const COMMAND_ACK: u32 = 77;
    pub const GIMBAL_MANAGER_INFORMATION: u32 = 280;
    pub const GIMBAL_MANAGER_STATUS: u32 = 281;
    pub const GIMBAL_DEVICE_ATTITUDE_STATUS: u32 = 285;
}

pub mod cmd {
    use super::MavCmd;

    pub const SET_MESSAGE_INTERVAL: u16 = MavCmd::MAV_CMD_SET_MESSAGE_INTERVAL as u16;
    pub const REQUEST_MESSAGE: u16 = MavCmd::MAV_CMD_REQUEST_MESSAGE as u16;
    /// Vendor command driving the cargo drop sequence on the autopilot.
    pub const DROP_SEQUENCE: u16 = MavCmd::MAV_CMD_USER_1 as u16;

    /// Whether the dialect defines `command`; others cannot be encoded.
    pub fn is_defined(command: u16) -> bool {
        <MavCmd as num_traits::FromPrimitive>::from_u16(command).is_some()
    }
}

/// Acknowledgement result codes.
pub mod result {
    use super::MavResult;

    pub const ACCEPTED: u8 = MavResult::MAV_RESULT_ACCEPTED as u8;
    pub const TEMPORARILY_REJECTED: u8 = MavResult::MAV_RESULT_TEMPORARILY_REJECTED as u8;
    pub const DENIED: u8 = MavResult::MAV_RESULT_DENIED as u8;
    pub const UNSUPPORTED: u8 = MavResult::MAV_RESULT_UNSUPPORTED as u8;
    pub const FAILED: u8 = MavResult::MAV_RESULT_FAILED as u8;
    pub const IN_PROGRESS: u8 = MavResult::MAV_RESULT_IN_PROGRESS as u8;
    pub const CANCELLED: u8 = MavResult::MAV_RESULT_CANCELLED as u8;
}

pub mod comp {
    use super::MavComponent;

    /// Broadcast address; commands cannot be correlated against it.
    pub const ALL: u8 = MavComponent::MAV_COMP_ID_ALL as u8;
    pub const AUTOPILOT1: u8 = MavComponent::MAV_COMP_ID_AUTOPILOT1 as u8;
    pub const MISSIONPLANNER: u8 = MavComponent::MAV_COMP_ID_MISSIONPLANNER as u8;
}

pub mod gimbal_flags {
    use super::GimbalDeviceFlags;

    pub const RETRACT: u16 = GimbalDeviceFlags::GIMBAL_DEVICE_FLAGS_RETRACT.bits() as u16;
    pub const NEUTRAL: u16 = GimbalDeviceFlags::GIMBAL_DEVICE_FLAGS_NEUTRAL.bits() as u16;
    pub const YAW_LOCK: u16 = GimbalDeviceFlags::GIMBAL_DEVICE_FLAGS_YAW_LOCK.bits() as u16;
}

pub mod mav_type {
    pub const GCS: u8 = super::MavType::MAV_TYPE_GCS as u8;
}

pub mod autopilot {
    pub const INVALID: u8 = super::MavAutopilot::MAV_AUTOPILOT_INVALID as u8;
}

pub mod mode_flag {
    use super::MavModeFlag;

    pub const CUSTOM_MODE_ENABLED: u8 = MavModeFlag::MAV_MODE_FLAG_CUSTOM_MODE_ENABLED.bits() as u8;
    pub const SAFETY_ARMED: u8 = MavModeFlag::MAV_MODE_FLAG_SAFETY_ARMED.bits() as u8;
}

pub mod state {
    pub const ACTIVE: u8 = super::MavState::MAV_STATE_ACTIVE as u8;
}

/// Progress value meaning "not reported".
pub const PROGRESS_UNKNOWN: u8 = u8::MAX;
