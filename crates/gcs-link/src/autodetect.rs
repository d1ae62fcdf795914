use std::time::{Duration, Instant};

use anyhow::Result;
use gcs_proto::{Framer, Payload};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize)]
pub struct AttemptResult {
    pub dev: String,
    pub baud: u32,
    pub hb_seen: bool,
    pub elapsed_ms: u64,
    pub note: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AutodetectResult {
    pub chosen: Option<(String, u32)>,
    pub attempts: Vec<AttemptResult>,
}

pub fn default_candidate_devs() -> Vec<String> {
    vec![
        "/dev/serial0".into(),
        "/dev/ttyAMA0".into(),
        "/dev/ttyS0".into(),
        "/dev/ttyUSB0".into(),
        "/dev/ttyUSB1".into(),
        "/dev/ttyACM0".into(),
        "/dev/ttyACM1".into(),
    ]
}

pub fn default_candidate_bauds() -> Vec<u32> {
    vec![57600, 115200, 230400, 921600]
}

/// Tries every device × baud pair and stops at the first one that yields a
/// decodable heartbeat.
pub async fn autodetect_serial(
    candidate_devs: Vec<String>,
    candidate_bauds: Vec<u32>,
    heartbeat_timeout: Duration,
) -> Result<AutodetectResult> {
    let mut attempts = Vec::new();

    for dev in candidate_devs {
        for &baud in &candidate_bauds {
            let start = Instant::now();
            let (hb_seen, note) = match tokio_serial::new(&dev, baud).open_native_async() {
                Ok(mut port) => wait_for_heartbeat(&mut port, heartbeat_timeout).await,
                Err(e) => {
                    warn!("autodetect attempt failed dev={} baud={} err={}", dev, baud, e);
                    (false, format!("open failed: {}", e))
                }
            };

            attempts.push(AttemptResult {
                dev: dev.clone(),
                baud,
                hb_seen,
                elapsed_ms: start.elapsed().as_millis() as u64,
                note,
            });
            if hb_seen {
                info!("autodetect: OK {} @ {}", dev, baud);
                return Ok(AutodetectResult { chosen: Some((dev, baud)), attempts });
            }
        }
    }

    Ok(AutodetectResult { chosen: None, attempts })
}

/// Reads until a heartbeat frame decodes or `timeout` passes. At the wrong
/// baud rate the bytes are noise and every frame fails its checksum.
pub async fn wait_for_heartbeat<R>(reader: &mut R, timeout: Duration) -> (bool, String)
where
    R: AsyncRead + Unpin,
{
    let deadline = tokio::time::Instant::now() + timeout;
    let mut framer = Framer::new();
    let mut buf = [0u8; 512];

    loop {
        let n = match tokio::time::timeout_at(deadline, reader.read(&mut buf)).await {
            Err(_) => break,
            Ok(Ok(0)) => return (false, "closed".into()),
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return (false, format!("read failed: {}", e)),
        };
        framer.push(&buf[..n]);
        while let Some(frame) = framer.next_frame() {
            match frame {
                Ok(msg) if matches!(msg.payload, Payload::Heartbeat(_)) => {
                    return (true, format!("heartbeat from {}/{}", msg.system_id, msg.component_id));
                }
                Ok(_) => {}
                Err(e) => debug!("autodetect: {}", e),
            }
        }
    }

    let stats = framer.stats();
    if stats.decode_errors > 0 {
        (false, format!("no heartbeat ({} bad frames)", stats.decode_errors))
    } else {
        (false, "no heartbeat".into())
    }
}
