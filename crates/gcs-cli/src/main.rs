use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use gcs_link::autodetect::{autodetect_serial, default_candidate_bauds, default_candidate_devs};
use gcs_link::doctor as link_doctor;
use gcs_link::drop_sequence::DropSequence;
use gcs_link::facts::MemoryFacts;
use gcs_link::{CommandRequest, LinkConfig, LinkEvent, Session, SessionHandle, Transport, TransportConfig};

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

#[derive(Debug, Parser)]
#[command(name = "gcs", version, about = "Ground link: telemetry, commands and component discovery")]
struct Cli {
    #[arg(long)]
    config: String,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Validate the config file.
    Doctor,
    /// Scan serial ports/bauds for heartbeats.
    Scan,
    /// Keep the link up, logging events and facts until Ctrl-C.
    Run {
        /// Seconds between fact dumps.
        #[arg(long, default_value_t = 5)]
        facts_every: u64,
    },
    /// Send one command and wait for its result.
    Command {
        #[arg(long, default_value_t = 1)]
        target_comp: u8,
        command: u16,
        /// Up to seven params, in order.
        #[arg(long, num_args = 1..=7, value_delimiter = ',')]
        params: Vec<f32>,
        #[arg(long)]
        retries: Option<u32>,
    },
    Drop { #[command(subcommand)] cmd: DropCmd },
    /// Connect for a while and print link status and discovered components.
    Status {
        #[arg(long, default_value_t = 3)]
        wait_secs: u64,
    },
}

#[derive(Debug, Subcommand)]
enum DropCmd {
    Start {
        #[arg(long)]
        tag: i32,
        #[arg(long)]
        alt: f32,
    },
    Stop {
        #[arg(long)]
        tag: i32,
        #[arg(long, default_value_t = 0.0)]
        alt: f32,
    },
}

#[derive(Debug, serde::Deserialize)]
struct Config {
    link: LinkConfig,
    connect: Option<ConnectCfg>,
}

#[derive(Debug, serde::Deserialize)]
struct ConnectCfg {
    /// How long one-shot commands wait for the vehicle heartbeat.
    heartbeat_wait_ms: Option<u64>,
}

fn load_config(path: &str) -> Result<Config> {
    let s = std::fs::read_to_string(path).context("read config")?;
    Ok(toml::from_str(&s).context("parse config toml")?)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let cfg = load_config(&cli.config)?;

    match cli.cmd {
        Command::Doctor => doctor(&cfg).await?,
        Command::Scan => scan(&cfg).await?,
        Command::Run { facts_every } => run(&cfg, facts_every).await?,
        Command::Command { target_comp, command, params, retries } => {
            send_command(&cfg, target_comp, command, params, retries).await?
        }
        Command::Drop { cmd } => drop_cmd(&cfg, cmd).await?,
        Command::Status { wait_secs } => status(&cfg, wait_secs).await?,
    }
    Ok(())
}

async fn doctor(cfg: &Config) -> Result<()> {
    info!("doctor: starting");
    link_doctor::check_link(&cfg.link)?;
    if let TransportConfig::Serial(s) = &cfg.link.transport {
        if s.autodetect {
            info!("doctor: serial autodetect enabled (OK)");
        }
    }
    info!("doctor: OK");
    Ok(())
}

async fn scan(cfg: &Config) -> Result<()> {
    let TransportConfig::Serial(serial) = &cfg.link.transport else {
        anyhow::bail!("scan needs a serial transport");
    };
    let res = autodetect_serial(
        serial.candidate_devs.clone().unwrap_or_else(default_candidate_devs),
        serial.candidate_bauds.clone().unwrap_or_else(default_candidate_bauds),
        serial.heartbeat_timeout(),
    )
    .await?;
    if let Some((dev, baud)) = res.chosen {
        println!("CHOSEN: {} @ {}", dev, baud);
    } else {
        println!("CHOSEN: none");
    }
    for p in res.attempts {
        println!("attempt dev={} baud={} hb={} {}ms note={}", p.dev, p.baud, p.hb_seen, p.elapsed_ms, p.note);
    }
    Ok(())
}

async fn open_session(cfg: &Config, facts: Arc<MemoryFacts>) -> Result<(SessionHandle, JoinHandle<Result<()>>)> {
    let (transport, endpoint) = Transport::open(&cfg.link.transport).await.context("open link")?;
    let session = Session::new(&cfg.link, facts);
    let handle = session.handle();
    Ok((handle, session.spawn(transport, endpoint)))
}

/// Opens the link and waits until the target system is known.
async fn connect(cfg: &Config) -> Result<(SessionHandle, JoinHandle<Result<()>>)> {
    let (handle, task) = open_session(cfg, Arc::new(MemoryFacts::new())).await?;
    let wait = cfg.connect.as_ref().and_then(|c| c.heartbeat_wait_ms).unwrap_or(5000);
    let deadline = tokio::time::Instant::now() + Duration::from_millis(wait);

    while handle.status().await?.target_system.is_none() {
        anyhow::ensure!(tokio::time::Instant::now() < deadline, "no vehicle heartbeat within {}ms", wait);
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    Ok((handle, task))
}

async fn send_command(cfg: &Config, target_comp: u8, command: u16, params: Vec<f32>, retries: Option<u32>) -> Result<()> {
    let (handle, _task) = connect(cfg).await?;

    let mut req = CommandRequest::new(target_comp, command);
    for (i, p) in params.into_iter().enumerate() {
        req = req.param(i + 1, p);
    }
    if let Some(r) = retries {
        req = req.max_retries(r);
    }

    let mut pending = handle.issue(req).await?;
    info!("command {} sent to component {}", command, target_comp);
    while let Some(p) = pending.progress().await {
        println!("progress {}% step={}", p.progress, p.step);
    }
    let res = pending.resolution().await?;
    println!("result={} transmissions={}", res.result, res.transmissions);
    anyhow::ensure!(res.result.is_success(), "command {} not accepted: {}", command, res.result);
    Ok(())
}

async fn drop_cmd(cfg: &Config, cmd: DropCmd) -> Result<()> {
    let (handle, _task) = connect(cfg).await?;
    let seq = DropSequence::new(handle.clone());
    let _watch = seq.watch_late_completions();

    match cmd {
        DropCmd::Start { tag, alt } => {
            seq.start(tag, alt).await?;
            let mut last = None;
            loop {
                let st = seq.state();
                if last.as_ref() != Some(&st.status) {
                    println!("drop: {} ({:.0}%)", st.status, st.progress * 100.0);
                    last = Some(st.status);
                }
                if !st.in_progress {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
        }
        DropCmd::Stop { tag, alt } => {
            seq.stop(tag, alt).await?;
            // Give the stop command a chance to leave before the link closes.
            tokio::time::sleep(Duration::from_millis(500)).await;
            println!("drop: {}", seq.state().status);
        }
    }
    Ok(())
}

async fn status(cfg: &Config, wait_secs: u64) -> Result<()> {
    let facts = Arc::new(MemoryFacts::new());
    let (handle, _task) = open_session(cfg, facts.clone()).await?;
    tokio::time::sleep(Duration::from_secs(wait_secs)).await;

    let st = handle.status().await?;
    println!("connected={}", st.connected);
    println!("endpoint={:?} target_system={:?}", st.endpoint, st.target_system);
    println!("last_heartbeat_age_ms={:?}", st.heartbeat_age_ms);
    println!("last_msg={:?}", st.last_msg);
    println!("in={} out={} decode_errors={}", st.messages_in, st.messages_out, st.decode_errors);
    println!("{}", serde_json::to_string_pretty(&handle.snapshot().await?)?);
    println!("{}", serde_json::to_string_pretty(&facts.snapshot())?);
    Ok(())
}

async fn run(cfg: &Config, facts_every: u64) -> Result<()> {
    info!("run: starting");
    let facts = Arc::new(MemoryFacts::new());
    let (handle, mut task) = open_session(cfg, facts.clone()).await?;
    let mut events = handle.subscribe();
    let mut dump = tokio::time::interval(Duration::from_secs(facts_every.max(1)));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("run: interrupted");
                break;
            }
            res = &mut task => {
                res.context("session task")??;
                warn!("run: link closed");
                break;
            }
            ev = events.recv() => match ev {
                Ok(LinkEvent::DiscoveryComplete { component_id, responsible_id }) => {
                    info!(component_id, ?responsible_id, "component discovered");
                }
                Ok(LinkEvent::LateCompletion { component, command, ack }) => {
                    info!(component, command, step = ack.result_param2, "late completion");
                }
                Ok(LinkEvent::TargetLocked { system_id }) => info!(system_id, "vehicle connected"),
                Err(broadcast::error::RecvError::Lagged(n)) => warn!("run: missed {} events", n),
                Err(broadcast::error::RecvError::Closed) => {
                    (&mut task).await.context("session task")??;
                    warn!("run: link closed");
                    break;
                }
            },
            _ = dump.tick() => {
                println!("{}", serde_json::to_string(&facts.snapshot())?);
            }
        }
    }
    Ok(())
}
