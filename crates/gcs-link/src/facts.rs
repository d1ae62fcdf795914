//! Named value sink for telemetry, plus the handlers that feed it.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Mutex;

use gcs_proto::ids::{gimbal_flags, mode_flag};
use gcs_proto::{GimbalDeviceAttitudeStatusData, GimbalManagerStatusData, HeartbeatData, SysStatusData};
use serde::Serialize;
use time::OffsetDateTime;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FactValue {
    Float(f64),
    Int(i64),
    Bool(bool),
    Text(String),
}

impl fmt::Display for FactValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FactValue::Float(v) => write!(f, "{v:.3}"),
            FactValue::Int(v) => write!(f, "{v}"),
            FactValue::Bool(v) => write!(f, "{v}"),
            FactValue::Text(v) => f.write_str(v),
        }
    }
}

/// Receives decoded values by name. Implementations must be cheap; they are
/// called from the session task.
pub trait FactSink: Send + Sync {
    fn set(&self, name: &str, value: FactValue);
}

#[derive(Debug, Default)]
pub struct NullFacts;

impl FactSink for NullFacts {
    fn set(&self, _name: &str, _value: FactValue) {}
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Fact {
    pub value: FactValue,
    #[serde(with = "time::serde::rfc3339")]
    pub updated: OffsetDateTime,
}

/// Keeps the latest value of every fact with its update time.
#[derive(Debug, Default)]
pub struct MemoryFacts {
    facts: Mutex<BTreeMap<String, Fact>>,
}

impl MemoryFacts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<FactValue> {
        self.facts.lock().ok()?.get(name).map(|f| f.value.clone())
    }

    pub fn snapshot(&self) -> BTreeMap<String, Fact> {
        self.facts.lock().map(|f| f.clone()).unwrap_or_default()
    }
}

impl FactSink for MemoryFacts {
    fn set(&self, name: &str, value: FactValue) {
        if let Ok(mut facts) = self.facts.lock() {
            let updated = OffsetDateTime::now_utc();
            facts.insert(name.to_string(), Fact { value, updated });
        }
    }
}

pub(crate) fn battery(sink: &dyn FactSink, status: &SysStatusData) {
    // millivolts, u16::MAX when unknown
    if status.voltage_battery != u16::MAX {
        sink.set("battery.voltage_v", FactValue::Float(status.voltage_battery as f64 / 1000.0));
    }
    // centiamps, -1 when unknown
    if status.current_battery != -1 {
        sink.set("battery.current_a", FactValue::Float(status.current_battery as f64 / 100.0));
    }
    if (0..=100).contains(&status.battery_remaining) {
        sink.set("battery.remaining_pct", FactValue::Int(status.battery_remaining as i64));
    }
}

pub(crate) fn vehicle(sink: &dyn FactSink, hb: &HeartbeatData) {
    sink.set("vehicle.system_status", FactValue::Int(hb.system_status as i64));
    sink.set("vehicle.custom_mode", FactValue::Int(hb.custom_mode as i64));
    sink.set("vehicle.armed", FactValue::Bool(hb.base_mode & mode_flag::SAFETY_ARMED != 0));
}

/// `ours` is the (system, component) pair of this station.
pub(crate) fn gimbal_control(sink: &dyn FactSink, device: u8, status: &GimbalManagerStatusData, ours: (u8, u8)) {
    let primary = (status.primary_control_sysid, status.primary_control_compid);
    let have_control = primary == ours;
    let others = primary != (0, 0) && !have_control;
    sink.set(&format!("gimbal.{device}.have_control"), FactValue::Bool(have_control));
    sink.set(&format!("gimbal.{device}.others_have_control"), FactValue::Bool(others));
}

pub(crate) fn gimbal_attitude(sink: &dyn FactSink, device: u8, att: &GimbalDeviceAttitudeStatusData) {
    let (roll, pitch, yaw) = att.euler_deg();
    sink.set(&format!("gimbal.{device}.roll_deg"), FactValue::Float(roll as f64));
    sink.set(&format!("gimbal.{device}.pitch_deg"), FactValue::Float(pitch as f64));
    sink.set(&format!("gimbal.{device}.yaw_deg"), FactValue::Float(yaw as f64));
    sink.set(&format!("gimbal.{device}.retracted"), FactValue::Bool(att.flags & gimbal_flags::RETRACT != 0));
    sink.set(&format!("gimbal.{device}.neutral"), FactValue::Bool(att.flags & gimbal_flags::NEUTRAL != 0));
    sink.set(&format!("gimbal.{device}.yaw_lock"), FactValue::Bool(att.flags & gimbal_flags::YAW_LOCK != 0));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn battery_skips_sentinels() {
        let facts = MemoryFacts::new();
        let status = SysStatusData {
            voltage_battery: u16::MAX,
            current_battery: -1,
            battery_remaining: -1,
            ..Default::default()
        };
        battery(&facts, &status);
        assert!(facts.snapshot().is_empty());

        let status = SysStatusData { voltage_battery: 12_600, current_battery: 250, battery_remaining: 87, ..status };
        battery(&facts, &status);
        assert_eq!(facts.get("battery.voltage_v"), Some(FactValue::Float(12.6)));
        assert_eq!(facts.get("battery.current_a"), Some(FactValue::Float(2.5)));
        assert_eq!(facts.get("battery.remaining_pct"), Some(FactValue::Int(87)));
    }

    #[test]
    fn armed_flag_from_base_mode() {
        let facts = MemoryFacts::new();
        vehicle(&facts, &HeartbeatData { base_mode: mode_flag::SAFETY_ARMED | 1, ..Default::default() });
        assert_eq!(facts.get("vehicle.armed"), Some(FactValue::Bool(true)));
    }

    #[test]
    fn gimbal_control_ownership() {
        let facts = MemoryFacts::new();
        let mut status = GimbalManagerStatusData { primary_control_sysid: 255, primary_control_compid: 190, ..Default::default() };
        gimbal_control(&facts, 6, &status, (255, 190));
        assert_eq!(facts.get("gimbal.6.have_control"), Some(FactValue::Bool(true)));
        assert_eq!(facts.get("gimbal.6.others_have_control"), Some(FactValue::Bool(false)));

        status.primary_control_compid = 191;
        gimbal_control(&facts, 6, &status, (255, 190));
        assert_eq!(facts.get("gimbal.6.have_control"), Some(FactValue::Bool(false)));
        assert_eq!(facts.get("gimbal.6.others_have_control"), Some(FactValue::Bool(true)));
    }

    #[test]
    fn attitude_flags() {
        let facts = MemoryFacts::new();
        let att = GimbalDeviceAttitudeStatusData {
            q: [1.0, 0.0, 0.0, 0.0],
            flags: gimbal_flags::RETRACT | gimbal_flags::YAW_LOCK,
            ..Default::default()
        };
        gimbal_attitude(&facts, 6, &att);
        assert_eq!(facts.get("gimbal.6.retracted"), Some(FactValue::Bool(true)));
        assert_eq!(facts.get("gimbal.6.neutral"), Some(FactValue::Bool(false)));
        assert_eq!(facts.get("gimbal.6.yaw_lock"), Some(FactValue::Bool(true)));
        assert_eq!(facts.get("gimbal.6.yaw_deg"), Some(FactValue::Float(0.0)));
    }
}
