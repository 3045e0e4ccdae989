//! tgpunch responder
//!
//! Watches the hub channel for punching requests. For each one it discovers
//! a fresh public endpoint, answers with it and punches toward the requester.
//! Runs until SIGINT/SIGTERM; a second signal exits immediately.

use std::process::ExitCode;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use ring::rand::SystemRandom;
use signal_hook::consts::TERM_SIGNALS;
use signal_hook::flag;

use tgpunch::config::{self, DiscoveryArgs, HubArgs, PunchArgs};
use tgpunch::roles::Responder;

#[derive(Debug, Parser)]
#[command(name = "tgpunch-responder", version, about = "Answer UDP hole punch requests posted to a Telegram channel")]
struct Cli {
    #[command(flatten)]
    hub: HubArgs,

    #[command(flatten)]
    discovery: DiscoveryArgs,

    #[command(flatten)]
    punch: PunchArgs,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info"),
    )
    .init();

    let cli = Cli::parse();

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn install_signal_handlers() -> anyhow::Result<Arc<AtomicBool>> {
    let shutdown = Arc::new(AtomicBool::new(false));
    for &signal in TERM_SIGNALS {
        // Second signal while shutting down terminates at once
        flag::register_conditional_shutdown(signal, 1, Arc::clone(&shutdown))?;
        flag::register(signal, Arc::clone(&shutdown))?;
    }
    Ok(shutdown)
}

fn run(cli: &Cli) -> anyhow::Result<()> {
    log::info!("tgpunch responder starting...");
    log::info!("  Chat: {}", cli.hub.chat);
    log::info!("  STUN: {}", cli.discovery.stun_server);

    let shutdown = install_signal_handlers().context("cannot install signal handlers")?;

    let settings = config::settings(&cli.hub, &cli.discovery, &cli.punch)
        .context("cannot resolve STUN server")?;
    let hub = cli.hub.connect().context("cannot create Bot API client")?;

    let mut responder = Responder::new(hub, SystemRandom::new(), settings);
    responder.run(&shutdown)?;
    Ok(())
}
