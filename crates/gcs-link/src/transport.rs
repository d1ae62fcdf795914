use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::{lookup_host, TcpStream, UdpSocket};
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{info, trace};

use crate::autodetect::{autodetect_serial, default_candidate_bauds, default_candidate_devs};

#[derive(Debug, Clone, Deserialize)]
pub struct SerialConfig {
    /// If true, try candidate ports/bauds and pick the first that yields a heartbeat.
    #[serde(default)]
    pub autodetect: bool,

    /// When autodetect=false: fixed port config
    pub dev: Option<String>,
    pub baud: Option<u32>,

    /// Autodetect candidate paths, e.g. ["/dev/ttyUSB0","/dev/ttyACM0"]
    pub candidate_devs: Option<Vec<String>>,
    pub candidate_bauds: Option<Vec<u32>>,

    /// Heartbeat wait per attempt
    pub heartbeat_timeout_ms: Option<u64>,
}

impl SerialConfig {
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms.unwrap_or(1500))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TransportConfig {
    Serial(SerialConfig),
    Tcp { addr: String },
    /// Listens on `bind`; replies go to `remote`, or to the last sender if unset.
    Udp { bind: String, remote: Option<String> },
}

/// Byte pipe to the remote system. One session owns one transport.
pub enum Transport {
    Serial(SerialStream),
    Tcp(TcpStream),
    Udp { socket: UdpSocket, remote: Option<SocketAddr> },
    Memory(DuplexStream),
}

impl Transport {
    /// Opens the configured transport, returning it with a printable endpoint.
    pub async fn open(cfg: &TransportConfig) -> Result<(Self, String)> {
        match cfg {
            TransportConfig::Serial(serial) => {
                let (dev, baud) = resolve_serial_port(serial).await?;
                let stream = tokio_serial::new(&dev, baud)
                    .open_native_async()
                    .with_context(|| format!("open serial device {}", dev))?;
                Ok((Transport::Serial(stream), format!("{}@{}", dev, baud)))
            }
            TransportConfig::Tcp { addr } => {
                let stream = TcpStream::connect(addr).await.with_context(|| format!("tcp connect {}", addr))?;
                stream.set_nodelay(true).context("tcp nodelay")?;
                Ok((Transport::Tcp(stream), format!("tcp:{}", addr)))
            }
            TransportConfig::Udp { bind, remote } => {
                let socket = UdpSocket::bind(bind).await.with_context(|| format!("udp bind {}", bind))?;
                let remote = match remote {
                    Some(r) => Some(
                        lookup_host(r)
                            .await
                            .with_context(|| format!("resolve {}", r))?
                            .next()
                            .with_context(|| format!("no address for {}", r))?,
                    ),
                    None => None,
                };
                Ok((Transport::Udp { socket, remote }, format!("udp:{}", bind)))
            }
        }
    }

    /// Reads the next chunk. `Ok(0)` means the peer closed the link.
    pub async fn recv(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = match self {
            Transport::Serial(s) => s.read(buf).await.context("serial read")?,
            Transport::Tcp(s) => s.read(buf).await.context("tcp read")?,
            Transport::Memory(s) => s.read(buf).await.context("memory read")?,
            Transport::Udp { socket, remote } => {
                let (n, from) = socket.recv_from(buf).await.context("udp recv")?;
                if remote.is_none() {
                    info!(%from, "udp peer learned");
                    *remote = Some(from);
                }
                n
            }
        };
        Ok(n)
    }

    pub async fn send(&mut self, frame: &[u8]) -> Result<()> {
        match self {
            Transport::Serial(s) => s.write_all(frame).await.context("serial write")?,
            Transport::Tcp(s) => s.write_all(frame).await.context("tcp write")?,
            Transport::Memory(s) => s.write_all(frame).await.context("memory write")?,
            Transport::Udp { socket, remote } => match remote {
                Some(to) => {
                    socket.send_to(frame, *to).await.context("udp send")?;
                }
                None => trace!("udp: no peer yet, dropping outbound frame"),
            },
        }
        Ok(())
    }
}

pub async fn resolve_serial_port(cfg: &SerialConfig) -> Result<(String, u32)> {
    if !cfg.autodetect {
        let dev = cfg.dev.clone().context("serial.dev missing")?;
        let baud = cfg.baud.context("serial.baud missing")?;
        return Ok((dev, baud));
    }

    let devs = cfg.candidate_devs.clone().unwrap_or_else(default_candidate_devs);
    let bauds = cfg.candidate_bauds.clone().unwrap_or_else(default_candidate_bauds);
    let res = autodetect_serial(devs, bauds, cfg.heartbeat_timeout()).await?;
    res.chosen.context("serial autodetect: no heartbeat on any candidate port")
}
