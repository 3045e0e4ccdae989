//! Rendezvous handshake over a shared channel
//!
//! Both peers learn each other's public endpoint by posting JSON messages to
//! the same channel.
//!
//! # Protocol Overview
//!
//! ```text
//! Initiator                  Channel                  Responder
//!   │                           │                          │
//!   │  (discover E1)            │                          │
//!   │── StartPunchingRequest ──►│                          │
//!   │     {serial: S, E1}       │── poll ─────────────────►│
//!   │                           │                          │ (discover E2)
//!   │                           │◄─ StartPunchingResponse ─│
//!   │◄──────────────── poll ────│     {serial: S, E2}      │
//!   │                           │                          │
//!   │◄════════════ punch E1 ◄─► E2 ═══════════════════════►│
//! ```
//!
//! # Message Format
//!
//! ```text
//! {"type": "start_punching_request", "serial": 42,
//!  "public_endpoint": {"address": "203.0.113.7", "port": 61000}}
//! ```
//!
//! Any number of responders may listen, so requests are accepted regardless
//! of serial; responses are only accepted when the serial matches the one the
//! initiator generated.

use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use ring::rand::SecureRandom;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::hub::{Channel, ChannelEntry, ChannelError};

// ============================================================================
// Constants
// ============================================================================

/// How long the channel may hold a poll open when nothing is new
pub const LONG_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Shortest poll issued while waiting against a deadline
///
/// Channels may count long polls in whole seconds; anything shorter would
/// degrade into back-to-back zero-timeout requests.
pub const MIN_LONG_POLL: Duration = Duration::from_secs(1);

// ============================================================================
// Messages
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Initiator announces its endpoint and asks to be punched to
    StartPunchingRequest,
    /// Responder answers with its own endpoint
    StartPunchingResponse,
}

/// Public endpoint as carried in a message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub address: String,
    pub port: u16,
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self {
            address: addr.ip().to_string(),
            port: addr.port(),
        }
    }
}

impl TryFrom<&Endpoint> for SocketAddr {
    type Error = SignalingError;

    fn try_from(endpoint: &Endpoint) -> Result<Self, Self::Error> {
        let ip: IpAddr = endpoint
            .address
            .parse()
            .map_err(|_| SignalingError::InvalidEndpoint(endpoint.address.clone()))?;
        Ok(SocketAddr::new(ip, endpoint.port))
    }
}

/// Handshake message posted as the text of a channel entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HubMessage {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub serial: u64,
    pub public_endpoint: Option<Endpoint>,
}

impl HubMessage {
    pub fn request(serial: u64, endpoint: SocketAddr) -> Self {
        Self {
            kind: MessageKind::StartPunchingRequest,
            serial,
            public_endpoint: Some(endpoint.into()),
        }
    }

    pub fn response(serial: u64, endpoint: SocketAddr) -> Self {
        Self {
            kind: MessageKind::StartPunchingResponse,
            serial,
            public_endpoint: Some(endpoint.into()),
        }
    }

    pub fn encode(&self) -> Result<String, SignalingError> {
        serde_json::to_string(self).map_err(SignalingError::Encode)
    }

    pub fn decode(text: &str) -> Result<Self, SignalingError> {
        serde_json::from_str(text).map_err(SignalingError::Parse)
    }

    /// The carried endpoint, which every usable message must have
    pub fn endpoint(&self) -> Result<SocketAddr, SignalingError> {
        let endpoint = self.public_endpoint.as_ref().ok_or(SignalingError::MissingEndpoint)?;
        SocketAddr::try_from(endpoint)
    }
}

/// An accepted message from the other side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerOffer {
    pub serial: u64,
    pub endpoint: SocketAddr,
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("malformed handshake message")]
    Parse(#[source] serde_json::Error),

    #[error("failed to encode handshake message")]
    Encode(#[source] serde_json::Error),

    #[error("handshake message carries no endpoint")]
    MissingEndpoint,

    #[error("invalid endpoint address '{0}'")]
    InvalidEndpoint(String),

    #[error("rendezvous channel error")]
    Channel(#[from] ChannelError),

    #[error("no matching response before the deadline")]
    Timeout,

    #[error("failed to generate serial")]
    Rng,
}

/// Draw a correlation serial for one handshake
pub fn generate_serial(rng: &dyn SecureRandom) -> Result<u64, SignalingError> {
    let mut bytes = [0u8; 8];
    rng.fill(&mut bytes).map_err(|_| SignalingError::Rng)?;
    Ok(u64::from_be_bytes(bytes))
}

/// Post a message to `scope`; returns the channel's identifier for the post
pub fn publish<C: Channel + ?Sized>(
    channel: &C,
    scope: i64,
    message: &HubMessage,
) -> Result<i64, SignalingError> {
    let text = message.encode()?;
    let id = channel.publish(scope, &text)?;
    log::debug!("Published {:?} serial={} as post {}", message.kind, message.serial, id);
    Ok(id)
}

// ============================================================================
// Subscription
// ============================================================================

/// Cursor-tracking reader of one scope
pub struct Subscription {
    scope: i64,
    cursor: i64,
    long_poll: Duration,
}

impl Subscription {
    pub fn new(scope: i64, cursor: i64) -> Self {
        Self {
            scope,
            cursor,
            long_poll: LONG_POLL_INTERVAL,
        }
    }

    /// Start reading after the newest existing entry, ignoring history
    pub fn at_tail<C: Channel + ?Sized>(channel: &C, scope: i64) -> Result<Self, ChannelError> {
        let tail = channel.tail()?;
        log::debug!("Subscription cursor positioned at {}", tail);
        Ok(Self::new(scope, tail))
    }

    pub fn with_long_poll(mut self, long_poll: Duration) -> Self {
        self.long_poll = long_poll;
        self
    }

    pub fn cursor(&self) -> i64 {
        self.cursor
    }

    /// Poll once and return the accepted messages of `kind`, in order
    ///
    /// The cursor moves to the highest identifier seen whether or not
    /// anything matched.
    pub fn next_batch<C: Channel + ?Sized>(
        &mut self,
        channel: &C,
        kind: MessageKind,
    ) -> Result<Vec<PeerOffer>, ChannelError> {
        self.poll_batch(channel, kind, self.long_poll)
    }

    fn poll_batch<C: Channel + ?Sized>(
        &mut self,
        channel: &C,
        kind: MessageKind,
        long_poll: Duration,
    ) -> Result<Vec<PeerOffer>, ChannelError> {
        let entries = channel.poll(self.cursor, long_poll)?;

        let mut accepted = Vec::new();
        for entry in entries {
            if entry.id <= self.cursor {
                continue;
            }
            self.cursor = entry.id;
            if let Some(offer) = self.accept(&entry, kind) {
                accepted.push(offer);
            }
        }
        Ok(accepted)
    }

    fn accept(&self, entry: &ChannelEntry, kind: MessageKind) -> Option<PeerOffer> {
        if entry.scope != Some(self.scope) {
            log::debug!("Skipping entry {}: scope {:?} is not {}", entry.id, entry.scope, self.scope);
            return None;
        }
        let Some(text) = entry.text.as_deref() else {
            log::debug!("Skipping entry {}: no text", entry.id);
            return None;
        };

        let message: HubMessage = match serde_json::from_str(text) {
            Ok(m) => m,
            Err(e) => {
                log::debug!("Skipping entry {}: not a handshake message ({})", entry.id, e);
                return None;
            }
        };
        if message.kind != kind {
            log::trace!("Skipping entry {}: {:?}", entry.id, message.kind);
            return None;
        }
        match message.endpoint() {
            Ok(endpoint) => Some(PeerOffer {
                serial: message.serial,
                endpoint,
            }),
            Err(e) => {
                log::warn!("Skipping entry {} (serial {}): {}", entry.id, message.serial, e);
                None
            }
        }
    }

    /// Block until a response carrying `serial` is seen
    ///
    /// `deadline` of `None` waits indefinitely. Each poll lasts at least
    /// [`MIN_LONG_POLL`], so the deadline may be overshot by up to that much.
    pub fn await_response<C: Channel + ?Sized>(
        &mut self,
        channel: &C,
        serial: u64,
        deadline: Option<Instant>,
    ) -> Result<PeerOffer, SignalingError> {
        loop {
            let long_poll = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(SignalingError::Timeout);
                    }
                    remaining.min(self.long_poll).max(MIN_LONG_POLL)
                }
                None => self.long_poll.max(MIN_LONG_POLL),
            };

            for offer in self.poll_batch(channel, MessageKind::StartPunchingResponse, long_poll)? {
                if offer.serial == serial {
                    log::info!("Received response for serial {} from {}", serial, offer.endpoint);
                    return Ok(offer);
                }
                log::debug!("Ignoring response for foreign serial {}", offer.serial);
            }
        }
    }

    /// Requests posted since the last call, any serial
    pub fn next_requests<C: Channel + ?Sized>(
        &mut self,
        channel: &C,
    ) -> Result<Vec<PeerOffer>, ChannelError> {
        self.next_batch(channel, MessageKind::StartPunchingRequest)
    }
}

// ============================================================================
// Tests
// ============================================================================
