//! Minimal Binding Server for E2E Testing
//!
//! Answers every STUN binding request with the source address it was seen
//! from. Run it on a host between two NATs to try punching without a public
//! STUN server.

use std::net::{SocketAddr, UdpSocket};

use clap::Parser;

use tgpunch::p2p::stun::{decode_binding_request, encode_binding_response};

#[derive(Debug, Parser)]
#[command(name = "stun-server", about = "Answer STUN binding requests")]
struct Cli {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0:3478")]
    listen: SocketAddr,
}

fn main() -> std::io::Result<()> {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info"),
    )
    .init();

    let cli = Cli::parse();
    let socket = UdpSocket::bind(cli.listen)?;
    log::info!("Binding server listening on {}", socket.local_addr()?);

    let mut buf = [0u8; 1500];

    loop {
        match socket.recv_from(&mut buf) {
            Ok((len, src)) => match decode_binding_request(&buf[..len]) {
                Ok(txn) => {
                    log::info!("Binding request from {}", src);
                    if let Err(e) = socket.send_to(&encode_binding_response(&txn, src), src) {
                        log::warn!("Failed to send response to {}: {}", src, e);
                    }
                }
                Err(e) => log::debug!("Ignoring {} bytes from {}: {}", len, src, e),
            },
            Err(e) => {
                log::warn!("Receive error: {}", e);
            }
        }
    }
}
