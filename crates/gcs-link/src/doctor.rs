use std::net::SocketAddr;

use anyhow::Result;

use crate::transport::TransportConfig;
use crate::LinkConfig;

pub fn check_link(cfg: &LinkConfig) -> Result<()> {
    anyhow::ensure!(cfg.sys_id != 0, "link.sys_id 0 is the broadcast id");
    anyhow::ensure!(cfg.comp_id != 0, "link.comp_id 0 is the broadcast id");
    anyhow::ensure!(cfg.target_sys != Some(0), "link.target_sys 0 is the broadcast id; leave unset to lock on first heartbeat");
    if let Some(hz) = cfg.send_heartbeat_hz {
        anyhow::ensure!(hz.is_finite() && hz <= 10.0, "link.send_heartbeat_hz should be <= 10 (0 disables)");
    }
    check_timing(cfg.command.ack_timeout_ms, cfg.command.check_interval_ms)?;
    check_transport(&cfg.transport)
}

pub fn check_timing(ack_timeout_ms: u64, check_interval_ms: u64) -> Result<()> {
    anyhow::ensure!(ack_timeout_ms >= 100, "command.ack_timeout_ms too small; set >= 100");
    anyhow::ensure!(check_interval_ms >= 10, "command.check_interval_ms too small; set >= 10");
    anyhow::ensure!(
        check_interval_ms <= ack_timeout_ms,
        "command.check_interval_ms should not exceed ack_timeout_ms"
    );
    Ok(())
}

pub fn check_transport(cfg: &TransportConfig) -> Result<()> {
    match cfg {
        TransportConfig::Serial(s) => {
            if s.autodetect {
                if let Some(devs) = &s.candidate_devs {
                    anyhow::ensure!(!devs.is_empty(), "serial.candidate_devs is empty");
                }
                if let Some(bauds) = &s.candidate_bauds {
                    anyhow::ensure!(bauds.iter().all(|b| *b > 0), "serial.candidate_bauds has a zero baud");
                }
            } else {
                anyhow::ensure!(s.dev.as_ref().map(|d| !d.is_empty()).unwrap_or(false), "serial.dev missing");
                anyhow::ensure!(s.baud.unwrap_or(0) > 0, "serial.baud invalid");
            }
        }
        TransportConfig::Tcp { addr } => {
            anyhow::ensure!(addr.contains(':'), "tcp.addr should be host:port, got {}", addr);
        }
        TransportConfig::Udp { bind, .. } => {
            anyhow::ensure!(bind.parse::<SocketAddr>().is_ok(), "udp.bind is not a socket address: {}", bind);
        }
    }
    Ok(())
}
