//! Field-by-field mapping between our payloads and the generated common dialect types.
//!
//! Payload structs keep raw integers so that decoded telemetry can be stored and
//! compared as-is; enum and flag fields are only checked against the dialect here.

use mavlink::common::{
    self as mav, GimbalDeviceErrorFlags, GimbalDeviceFlags, GimbalManagerCapFlags, GimbalManagerFlags,
    MavAutopilot, MavCmd, MavMessage, MavModeFlag, MavResult, MavState, MavSysStatusSensor, MavType,
};
use num_traits::FromPrimitive;

use crate::error::EncodeError;
use crate::message::*;

fn enum_value<T: FromPrimitive>(field: &'static str, value: u32) -> Result<T, EncodeError> {
    T::from_u32(value).ok_or(EncodeError::OutOfDialect { field, value })
}

fn flags_value<T>(field: &'static str, value: u32, from_bits: impl FnOnce() -> Option<T>) -> Result<T, EncodeError> {
    from_bits().ok_or(EncodeError::OutOfDialect { field, value })
}

/// Builds the dialect message for a typed payload.
pub(crate) fn to_mav(payload: &Payload) -> Result<MavMessage, EncodeError> {
    let msg = match payload {
        Payload::Heartbeat(p) => MavMessage::HEARTBEAT(mav::HEARTBEAT_DATA {
            custom_mode: p.custom_mode,
            mavtype: enum_value::<MavType>("heartbeat.mav_type", p.mav_type.into())?,
            autopilot: enum_value::<MavAutopilot>("heartbeat.autopilot", p.autopilot.into())?,
            base_mode: flags_value("heartbeat.base_mode", p.base_mode.into(), || {
                MavModeFlag::from_bits(p.base_mode as _)
            })?,
            system_status: enum_value::<MavState>("heartbeat.system_status", p.system_status.into())?,
            mavlink_version: p.mavlink_version,
        }),
        Payload::SysStatus(p) => {
            let sensors = |field, bits: u32| flags_value(field, bits, || MavSysStatusSensor::from_bits(bits as _));
            MavMessage::SYS_STATUS(mav::SYS_STATUS_DATA {
                onboard_control_sensors_present: sensors("sys_status.sensors_present", p.sensors_present)?,
                onboard_control_sensors_enabled: sensors("sys_status.sensors_enabled", p.sensors_enabled)?,
                onboard_control_sensors_health: sensors("sys_status.sensors_health", p.sensors_health)?,
                load: p.load,
                voltage_battery: p.voltage_battery,
                current_battery: p.current_battery,
                drop_rate_comm: p.drop_rate_comm,
                errors_comm: p.errors_comm,
                errors_count1: p.errors_count[0],
                errors_count2: p.errors_count[1],
                errors_count3: p.errors_count[2],
                errors_count4: p.errors_count[3],
                battery_remaining: p.battery_remaining,
                ..Default::default()
            })
        }
        Payload::CommandLong(p) => {
            let [param1, param2, param3, param4, param5, param6, param7] = p.params;
            MavMessage::COMMAND_LONG(mav::COMMAND_LONG_DATA {
                param1,
                param2,
                param3,
                param4,
                param5,
                param6,
                param7,
                command: enum_value::<MavCmd>("command_long.command", p.command.into())?,
                target_system: p.target_system,
                target_component: p.target_component,
                confirmation: p.confirmation,
            })
        }
        Payload::CommandAck(p) => MavMessage::COMMAND_ACK(mav::COMMAND_ACK_DATA {
            command: enum_value::<MavCmd>("command_ack.command", p.command.into())?,
            result: enum_value::<MavResult>("command_ack.result", p.result.into())?,
            progress: p.progress,
            result_param2: p.result_param2,
            target_system: p.target_system,
            target_component: p.target_component,
            ..Default::default()
        }),
        Payload::GimbalManagerInformation(p) => {
            MavMessage::GIMBAL_MANAGER_INFORMATION(mav::GIMBAL_MANAGER_INFORMATION_DATA {
                time_boot_ms: p.time_boot_ms,
                cap_flags: flags_value("gimbal_manager_information.cap_flags", p.cap_flags, || {
                    GimbalManagerCapFlags::from_bits(p.cap_flags as _)
                })?,
                roll_min: p.roll_min,
                roll_max: p.roll_max,
                pitch_min: p.pitch_min,
                pitch_max: p.pitch_max,
                yaw_min: p.yaw_min,
                yaw_max: p.yaw_max,
                gimbal_device_id: p.gimbal_device_id,
                ..Default::default()
            })
        }
        Payload::GimbalManagerStatus(p) => MavMessage::GIMBAL_MANAGER_STATUS(mav::GIMBAL_MANAGER_STATUS_DATA {
            time_boot_ms: p.time_boot_ms,
            flags: flags_value("gimbal_manager_status.flags", p.flags, || GimbalManagerFlags::from_bits(p.flags as _))?,
            gimbal_device_id: p.gimbal_device_id,
            primary_control_sysid: p.primary_control_sysid,
            primary_control_compid: p.primary_control_compid,
            secondary_control_sysid: p.secondary_control_sysid,
            secondary_control_compid: p.secondary_control_compid,
            ..Default::default()
        }),
        Payload::GimbalDeviceAttitudeStatus(p) => {
            MavMessage::GIMBAL_DEVICE_ATTITUDE_STATUS(mav::GIMBAL_DEVICE_ATTITUDE_STATUS_DATA {
                time_boot_ms: p.time_boot_ms,
                q: p.q,
                angular_velocity_x: p.angular_velocity_x,
                angular_velocity_y: p.angular_velocity_y,
                angular_velocity_z: p.angular_velocity_z,
                failure_flags: flags_value("gimbal_device_attitude_status.failure_flags", p.failure_flags, || {
                    GimbalDeviceErrorFlags::from_bits(p.failure_flags as _)
                })?,
                flags: flags_value("gimbal_device_attitude_status.flags", p.flags.into(), || {
                    GimbalDeviceFlags::from_bits(p.flags as _)
                })?,
                target_system: p.target_system,
                target_component: p.target_component,
                gimbal_device_id: p.gimbal_device_id,
                ..Default::default()
            })
        }
        Payload::Unknown(u) => return Err(EncodeError::UnknownKind(u.msg_id())),
    };
    Ok(msg)
}

/// Typed payload for a parsed dialect message, `None` when this build keeps it verbatim.
pub(crate) fn from_mav(msg: &MavMessage) -> Option<Payload> {
    let payload = match msg {
        MavMessage::HEARTBEAT(d) => Payload::Heartbeat(HeartbeatData {
            custom_mode: d.custom_mode,
            mav_type: d.mavtype as u8,
            autopilot: d.autopilot as u8,
            base_mode: d.base_mode.bits() as u8,
            system_status: d.system_status as u8,
            mavlink_version: d.mavlink_version,
        }),
        MavMessage::SYS_STATUS(d) => Payload::SysStatus(SysStatusData {
            sensors_present: d.onboard_control_sensors_present.bits() as u32,
            sensors_enabled: d.onboard_control_sensors_enabled.bits() as u32,
            sensors_health: d.onboard_control_sensors_health.bits() as u32,
            load: d.load,
            voltage_battery: d.voltage_battery,
            current_battery: d.current_battery,
            drop_rate_comm: d.drop_rate_comm,
            errors_comm: d.errors_comm,
            errors_count: [d.errors_count1, d.errors_count2, d.errors_count3, d.errors_count4],
            battery_remaining: d.battery_remaining,
        }),
        MavMessage::COMMAND_LONG(d) => Payload::CommandLong(CommandLongData {
            params: [d.param1, d.param2, d.param3, d.param4, d.param5, d.param6, d.param7],
            command: d.command as u16,
            target_system: d.target_system,
            target_component: d.target_component,
            confirmation: d.confirmation,
        }),
        MavMessage::COMMAND_ACK(d) => Payload::CommandAck(CommandAckData {
            command: d.command as u16,
            result: d.result as u8,
            progress: d.progress,
            result_param2: d.result_param2,
            target_system: d.target_system,
            target_component: d.target_component,
        }),
        MavMessage::GIMBAL_MANAGER_INFORMATION(d) => Payload::GimbalManagerInformation(GimbalManagerInformationData {
            time_boot_ms: d.time_boot_ms,
            cap_flags: d.cap_flags.bits() as u32,
            roll_min: d.roll_min,
            roll_max: d.roll_max,
            pitch_min: d.pitch_min,
            pitch_max: d.pitch_max,
            yaw_min: d.yaw_min,
            yaw_max: d.yaw_max,
            gimbal_device_id: d.gimbal_device_id,
        }),
        MavMessage::GIMBAL_MANAGER_STATUS(d) => Payload::GimbalManagerStatus(GimbalManagerStatusData {
            time_boot_ms: d.time_boot_ms,
            flags: d.flags.bits() as u32,
            gimbal_device_id: d.gimbal_device_id,
            primary_control_sysid: d.primary_control_sysid,
            primary_control_compid: d.primary_control_compid,
            secondary_control_sysid: d.secondary_control_sysid,
            secondary_control_compid: d.secondary_control_compid,
        }),
        MavMessage::GIMBAL_DEVICE_ATTITUDE_STATUS(d) => {
            Payload::GimbalDeviceAttitudeStatus(GimbalDeviceAttitudeStatusData {
                time_boot_ms: d.time_boot_ms,
                q: d.q,
                angular_velocity_x: d.angular_velocity_x,
                angular_velocity_y: d.angular_velocity_y,
                angular_velocity_z: d.angular_velocity_z,
                failure_flags: d.failure_flags.bits() as u32,
                flags: d.flags.bits() as u16,
                target_system: d.target_system,
                target_component: d.target_component,
                gimbal_device_id: d.gimbal_device_id,
            })
        }
        _ => return None,
    };
    Some(payload)
}
