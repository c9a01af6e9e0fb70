//! Intercom relay CLI.
//!
//! `serve` runs the broker until ctrl-c. `call` opens a point-to-point
//! session to a single device and streams silence, which makes it a handy
//! smoke test for device firmware without a browser in the loop.

mod config;

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::info;

use config::Config;
use intercom_bridge::{BridgeConfig, BridgeEvent, BridgeSession, StartState};
use intercom_broker::{Broker, Event};
use intercom_proto::{BRIDGE_PORT, FRAME_BYTES, FRAME_DURATION_MS};

/// Intercom relay - signalling and audio routing for PCM intercom calls
#[derive(Parser)]
#[command(name = "intercomd")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Enable debug output (implies --verbose)
    #[arg(short, long)]
    debug: bool,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay broker
    Serve {
        /// Listen address
        #[arg(long)]
        bind: Option<IpAddr>,

        /// Listen port
        #[arg(long)]
        port: Option<u16>,
    },

    /// Open a point-to-point session to a device and stream silence
    Call {
        /// Device host name or address
        #[arg(required = true)]
        host: String,

        /// Device port
        #[arg(long, default_value_t = BRIDGE_PORT)]
        port: u16,

        /// Skip the device's local ring and stream immediately
        #[arg(long)]
        no_ring: bool,
    },
}

fn init_tracing(cli: &Cli) {
    let default_directive = if cli.debug {
        "debug"
    } else if cli.verbose {
        "info"
    } else {
        "warn"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);

    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    match cli.command {
        Commands::Serve { bind, port } => serve(&config, bind, port).await,
        Commands::Call {
            host,
            port,
            no_ring,
        } => call(&host, port, no_ring).await,
    }
}

async fn serve(config: &Config, bind: Option<IpAddr>, port: Option<u16>) -> anyhow::Result<()> {
    let mut broker_config = config.broker_config();
    if let Some(bind) = bind {
        broker_config.bind_addr.set_ip(bind);
    }
    if let Some(port) = port {
        broker_config.bind_addr.set_port(port);
    }

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let broker = Broker::with_events(broker_config, events_tx);
    broker.start().await.context("starting broker")?;

    let event_log = tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            match event {
                Event::DeviceUp { id } => info!(%id, "device up"),
                Event::DeviceDown { id } => info!(%id, "device down"),
                Event::CallUp {
                    call_id,
                    caller,
                    callee,
                } => info!(call_id, %caller, %callee, "call up"),
                Event::CallDown { call_id } => info!(call_id, "call down"),
            }
        }
    });

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    broker.stop().await;
    event_log.abort();
    let _ = event_log.await;
    Ok(())
}

async fn call(host: &str, port: u16, no_ring: bool) -> anyhow::Result<()> {
    let addr = tokio::net::lookup_host((host, port))
        .await
        .with_context(|| format!("resolving {host}:{port}"))?
        .next()
        .with_context(|| format!("no address for {host}:{port}"))?;

    let (mut session, mut events) = BridgeSession::connect(addr, BridgeConfig::default())
        .await
        .context("connecting to device")?;

    match session.start(no_ring).await.context("starting session")? {
        StartState::Streaming => println!("streaming"),
        StartState::Ringing => println!("ringing, waiting for local answer"),
    }

    static SILENCE: [u8; FRAME_BYTES] = [0u8; FRAME_BYTES];
    let mut cadence = tokio::time::interval(Duration::from_millis(FRAME_DURATION_MS));
    let mut rx_frames: u64 = 0;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                println!("interrupted");
                break;
            }
            event = events.recv() => match event {
                Some(BridgeEvent::Answered) => println!("answered, streaming"),
                Some(BridgeEvent::Ringing) => println!("ringing"),
                Some(BridgeEvent::Audio(frame)) => {
                    rx_frames += 1;
                    if rx_frames % 64 == 0 {
                        println!("received {rx_frames} audio frames (last {} bytes)", frame.len());
                    }
                }
                Some(BridgeEvent::Error(code)) => println!("device error: {code:?}"),
                Some(BridgeEvent::Disconnected) | None => {
                    println!("session ended by device");
                    break;
                }
            },
            _ = cadence.tick() => {
                session.send_audio(Bytes::from_static(&SILENCE));
            }
        }
    }

    session.stop().await;
    println!("done, received {rx_frames} audio frames");
    Ok(())
}
