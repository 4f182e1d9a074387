//! Starts a single, behavior-less Constellation satellite process: CHIRP
//! discovery, CSCP command dispatch, and the lifecycle FSM, all driven by
//! the standard command set. Concrete data-acquisition behavior is out of
//! scope here: a real satellite links against `constellation-core`
//! directly and supplies its own `SatelliteBehavior`.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use constellation_core::{ClosureBehavior, Satellite, SatelliteEndpoints, SatelliteIdentity};
use constellation_proto::chirp::{CHIRP_PORT, ServiceIdentifier};

/// Run a Constellation satellite.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Satellite name, unique within its group.
    #[arg(long)]
    name: String,

    /// CHIRP discovery group this satellite belongs to.
    #[arg(long)]
    group: String,

    /// Network interface CHIRP/CSCP/heartbeat sockets bind on.
    #[arg(long, default_value = "0.0.0.0")]
    interface: String,

    /// UDP port for CHIRP broadcast discovery.
    #[arg(long, default_value_t = CHIRP_PORT)]
    chirp_port: u16,

    /// TCP port for the CSCP command socket.
    #[arg(long, default_value_t = 23999)]
    cmd_port: u16,

    /// TCP port the heartbeat PUB socket binds on.
    #[arg(long, default_value_t = 24000)]
    hb_port: u16,

    /// Log level passed to `tracing-subscriber`'s `EnvFilter` (overridden by
    /// `RUST_LOG` if set).
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    let identity = SatelliteIdentity::new(cli.name.clone(), cli.group.clone(), cli.interface.clone());
    let endpoints = SatelliteEndpoints {
        chirp_port: cli.chirp_port,
        cscp_endpoint: format!("tcp://{}:{}", cli.interface, cli.cmd_port),
        heartbeat_endpoint: format!("tcp://{}:{}", cli.interface, cli.hb_port),
    };

    let satellite = Satellite::new(identity, endpoints, Arc::new(ClosureBehavior::default())).context("failed to start satellite")?;

    satellite.advertise(ServiceIdentifier::Control, cli.cmd_port);
    satellite.advertise(ServiceIdentifier::Heartbeat, cli.hb_port);

    tracing::info!(name = %cli.name, group = %cli.group, cmd_port = cli.cmd_port, hb_port = cli.hb_port, "satellite ready");

    satellite.run();
    Ok(())
}

fn init_logging(default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
