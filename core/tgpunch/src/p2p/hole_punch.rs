//! UDP hole punching toward a discovered peer endpoint
//!
//! Probes go out from the socket that ran discovery, so the NAT mapping
//! already created toward the discovery server is reused for the peer.
//!
//! # Timing
//!
//! ```text
//!   probe ─► listen ─► probe ─► listen ─► ... (policy.probes times)
//!            └─ spacing ─┘
//! ```
//!
//! The two peers start at different times and either side's first probes
//! may be dropped by the other NAT. Repeating raises the odds that mappings
//! on both ends exist when a probe crosses. Hearing the peer's marker is
//! reported but not required.

use std::io;
use std::net::SocketAddr;
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;

use super::transport::{is_timeout, DatagramSocket};

// ============================================================================
// Constants
// ============================================================================

/// Probe payload sent by the initiator
pub const INITIATOR_MARKER: &[u8] = b"client";

/// Probe payload sent by the responder
pub const RESPONDER_MARKER: &[u8] = b"server";

pub const DEFAULT_PROBES: u32 = 5;

pub const DEFAULT_PROBE_SPACING: Duration = Duration::from_millis(200);

/// Pause after a receive error so an ICMP storm does not spin the loop
const ERROR_BACKOFF: Duration = Duration::from_millis(10);

// ============================================================================
// Types
// ============================================================================

/// How many probes to send and how far apart
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PunchPolicy {
    pub probes: u32,
    pub spacing: Duration,
}

impl Default for PunchPolicy {
    fn default() -> Self {
        Self {
            probes: DEFAULT_PROBES,
            spacing: DEFAULT_PROBE_SPACING,
        }
    }
}

/// Outcome of a punch run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PunchReport {
    pub probes_sent: u32,
    /// Datagrams from the remote endpoint carrying the expected marker
    pub peer_markers_seen: u32,
}

impl PunchReport {
    pub fn peer_heard(&self) -> bool {
        self.peer_markers_seen > 0
    }
}

#[derive(Debug, Error)]
pub enum PunchError {
    #[error("failed to send probe to {remote}")]
    Transport {
        remote: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("probe to {remote} truncated ({sent} of {len} bytes sent)")]
    TruncatedSend {
        remote: SocketAddr,
        sent: usize,
        len: usize,
    },
}

// ============================================================================
// Punching
// ============================================================================

/// Send `local_marker` to `remote` repeatedly, listening for `expected_marker`
///
/// At least one probe is always sent. Send failures abort; receive failures
/// during the listening windows are logged and ignored.
pub fn punch<S: DatagramSocket>(
    socket: &S,
    remote: SocketAddr,
    local_marker: &[u8],
    expected_marker: &[u8],
    policy: &PunchPolicy,
) -> Result<PunchReport, PunchError> {
    log::info!(
        "Punching toward {} ({} probes, {:?} apart)",
        remote,
        policy.probes.max(1),
        policy.spacing
    );

    let mut report = PunchReport::default();
    let outcome = run_probes(socket, remote, local_marker, expected_marker, policy, &mut report);

    if let Err(e) = socket.set_read_timeout(None) {
        log::warn!("Failed to restore blocking mode after punching: {}", e);
    }
    outcome?;

    if report.peer_heard() {
        log::info!(
            "Heard {} probe(s) from {} after sending {}",
            report.peer_markers_seen,
            remote,
            report.probes_sent
        );
    } else {
        log::info!("Sent {} probe(s) to {}, none heard back", report.probes_sent, remote);
    }
    Ok(report)
}

fn run_probes<S: DatagramSocket>(
    socket: &S,
    remote: SocketAddr,
    local_marker: &[u8],
    expected_marker: &[u8],
    policy: &PunchPolicy,
    report: &mut PunchReport,
) -> Result<(), PunchError> {
    let mut buf = [0u8; 512];

    for _ in 0..policy.probes.max(1) {
        let sent = socket
            .send_to(local_marker, remote)
            .map_err(|source| PunchError::Transport { remote, source })?;
        if sent != local_marker.len() {
            return Err(PunchError::TruncatedSend {
                remote,
                sent,
                len: local_marker.len(),
            });
        }
        report.probes_sent += 1;
        log::trace!("Probe {} sent to {}", report.probes_sent, remote);

        let window_end = Instant::now() + policy.spacing;
        loop {
            let remaining = window_end.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            if let Err(e) = socket.set_read_timeout(Some(remaining)) {
                log::debug!("Cannot listen for peer probes: {}", e);
                thread::sleep(remaining);
                break;
            }

            match socket.recv_from(&mut buf) {
                Ok((len, from)) if from == remote && &buf[..len] == expected_marker => {
                    report.peer_markers_seen += 1;
                    log::debug!("Peer probe received from {}", from);
                }
                Ok((len, from)) => {
                    log::debug!("Ignoring {} bytes from {} while punching", len, from);
                }
                Err(e) if is_timeout(&e) => {}
                Err(e) => {
                    log::debug!("Receive error while punching {}: {}", remote, e);
                    thread::sleep(ERROR_BACKOFF.min(remaining));
                }
            }
        }
    }
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
