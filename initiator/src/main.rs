//! tgpunch initiator
//!
//! Discovers its own public endpoint, posts a punching request to the hub
//! channel, waits for a responder to answer with its endpoint and punches
//! toward it.

use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use ring::rand::SystemRandom;

use tgpunch::config::{self, DiscoveryArgs, HubArgs, PunchArgs};
use tgpunch::roles::{Initiator, PeerLink};

#[derive(Debug, Parser)]
#[command(name = "tgpunch-initiator", version, about = "Request a UDP hole punch through a Telegram channel")]
struct Cli {
    #[command(flatten)]
    hub: HubArgs,

    #[command(flatten)]
    discovery: DiscoveryArgs,

    #[command(flatten)]
    punch: PunchArgs,

    /// Give up if no responder answers within this many seconds
    #[arg(long, value_name = "SECS")]
    wait: Option<u64>,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info"),
    )
    .init();

    let cli = Cli::parse();

    match run(&cli) {
        Ok(link) => {
            println!("{}", link.remote_endpoint);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> anyhow::Result<PeerLink> {
    log::info!("tgpunch initiator starting...");
    log::info!("  Chat: {}", cli.hub.chat);
    log::info!("  STUN: {}", cli.discovery.stun_server);

    let settings = config::settings(&cli.hub, &cli.discovery, &cli.punch)
        .context("cannot resolve STUN server")?;
    let hub = cli.hub.connect().context("cannot create Bot API client")?;

    let initiator = Initiator::new(hub, SystemRandom::new(), settings)
        .with_wait(cli.wait.map(Duration::from_secs));
    let link = initiator.run()?;

    log::info!(
        "Punched {} -> {} (serial {}, {} probes sent, {} heard)",
        link.local_endpoint,
        link.remote_endpoint,
        link.serial,
        link.punch.probes_sent,
        link.punch.peer_markers_seen
    );
    Ok(link)
}
