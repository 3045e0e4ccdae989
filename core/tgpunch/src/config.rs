//! Command line configuration shared by the role binaries
//!
//! Each binary flattens these groups into its own `clap` parser.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use clap::Args;

use crate::hub::ChannelError;
use crate::p2p::discovery::{resolve_server, RetryPolicy, DEFAULT_MAX_RETRIES, DEFAULT_STUN_SERVER};
use crate::p2p::hole_punch::{PunchPolicy, DEFAULT_PROBES};
use crate::roles::Settings;
use crate::tgapi::TelegramHub;

/// Rendezvous hub access
#[derive(Debug, Clone, Args)]
pub struct HubArgs {
    /// Telegram Bot API token
    #[arg(short = 't', long = "api-token", env = "TGPUNCH_API_TOKEN", hide_env_values = true)]
    pub api_token: String,

    /// Identifier of the channel used as the hub (usually negative)
    #[arg(short = 'c', long = "chat", allow_negative_numbers = true)]
    pub chat: i64,

    /// Proxy URL for Bot API requests (http, https or socks5)
    #[arg(short = 'x', long = "proxy")]
    pub proxy: Option<String>,
}

impl HubArgs {
    pub fn connect(&self) -> Result<TelegramHub, ChannelError> {
        TelegramHub::new(&self.api_token, self.proxy.as_deref())
    }
}

/// Public endpoint discovery
#[derive(Debug, Clone, Args)]
pub struct DiscoveryArgs {
    /// STUN server as host:port
    #[arg(long, default_value = DEFAULT_STUN_SERVER)]
    pub stun_server: String,

    /// Time to wait for each STUN response
    #[arg(long, default_value_t = 1000)]
    pub stun_timeout_ms: u64,

    /// Resends after the first STUN request
    #[arg(long, default_value_t = DEFAULT_MAX_RETRIES)]
    pub stun_retries: u32,

    /// Local address for the UDP socket
    #[arg(long, default_value = "0.0.0.0:0")]
    pub bind: SocketAddr,
}

impl DiscoveryArgs {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            timeout: Duration::from_millis(self.stun_timeout_ms),
            max_retries: self.stun_retries,
        }
    }
}

/// Hole punching
#[derive(Debug, Clone, Args)]
pub struct PunchArgs {
    /// Probes sent toward the peer
    #[arg(long, default_value_t = DEFAULT_PROBES)]
    pub probes: u32,

    /// Delay between probes
    #[arg(long, default_value_t = 200)]
    pub probe_interval_ms: u64,
}

impl PunchArgs {
    pub fn policy(&self) -> PunchPolicy {
        PunchPolicy {
            probes: self.probes,
            spacing: Duration::from_millis(self.probe_interval_ms),
        }
    }
}

/// Build role settings, resolving the STUN server once
pub fn settings(hub: &HubArgs, discovery: &DiscoveryArgs, punch: &PunchArgs) -> io::Result<Settings> {
    let stun_server = resolve_server(&discovery.stun_server)?;
    log::info!("Using STUN server {} ({})", discovery.stun_server, stun_server);

    Ok(Settings {
        bind: discovery.bind,
        retry: discovery.retry_policy(),
        punch: punch.policy(),
        ..Settings::new(hub.chat, stun_server)
    })
}
