//! Initiator and responder drivers
//!
//! Each handshake run owns one UDP socket from bind to drop. The same socket
//! performs discovery and then hole punching, so the NAT mapping observed by
//! the STUN server is the one the peer is told about.
//!
//! ```text
//! Initiator:  serial ─► discover ─► publish request ─► await response ─► punch
//! Responder:  self-test ─► tail ─► loop { poll ─► per request:
//!                                         discover ─► publish response ─► punch }
//! ```

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use ring::rand::SecureRandom;
use thiserror::Error;

use crate::hub::{Channel, ChannelError};
use crate::p2p::discovery::{discover, DiscoveryError, RetryPolicy};
use crate::p2p::hole_punch::{punch, PunchError, PunchPolicy, PunchReport, INITIATOR_MARKER, RESPONDER_MARKER};
use crate::p2p::signaling::{
    self, generate_serial, HubMessage, PeerOffer, SignalingError, Subscription, LONG_POLL_INTERVAL,
};
use crate::p2p::transport;

// ============================================================================
// Settings
// ============================================================================

/// Parameters common to both roles
#[derive(Debug, Clone)]
pub struct Settings {
    /// Channel identity both peers post to
    pub scope: i64,
    pub stun_server: SocketAddr,
    /// Local address for each run's socket
    pub bind: SocketAddr,
    pub retry: RetryPolicy,
    pub punch: PunchPolicy,
    pub long_poll: Duration,
}

impl Settings {
    pub fn new(scope: i64, stun_server: SocketAddr) -> Self {
        Self {
            scope,
            stun_server,
            bind: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            retry: RetryPolicy::default(),
            punch: PunchPolicy::default(),
            long_poll: LONG_POLL_INTERVAL,
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum RoleError {
    #[error("cannot create UDP socket")]
    Socket(#[source] io::Error),

    #[error("cannot get public endpoint")]
    Discovery(#[from] DiscoveryError),

    #[error("hub self-test failed")]
    SelfTest(#[source] ChannelError),

    #[error("rendezvous channel error")]
    Channel(#[from] ChannelError),

    #[error("handshake failed")]
    Signaling(#[from] SignalingError),

    #[error("no response for serial {serial} within {waited:?}")]
    ResponseTimeout { serial: u64, waited: Duration },

    #[error("hole punching failed")]
    Punch(#[from] PunchError),
}

/// Result of one completed handshake run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerLink {
    pub serial: u64,
    /// Our endpoint as seen by the STUN server
    pub local_endpoint: SocketAddr,
    /// The peer's endpoint as it announced it
    pub remote_endpoint: SocketAddr,
    pub punch: PunchReport,
}

// ============================================================================
// Initiator
// ============================================================================

/// Asks the hub for a peer and punches toward the first one that answers
pub struct Initiator<C, R> {
    channel: C,
    rng: R,
    settings: Settings,
    /// Bound on waiting for a response; `None` waits forever
    wait: Option<Duration>,
}

impl<C: Channel, R: SecureRandom> Initiator<C, R> {
    pub fn new(channel: C, rng: R, settings: Settings) -> Self {
        Self {
            channel,
            rng,
            settings,
            wait: None,
        }
    }

    pub fn with_wait(mut self, wait: Option<Duration>) -> Self {
        self.wait = wait;
        self
    }

    pub fn run(&self) -> Result<PeerLink, RoleError> {
        let serial = generate_serial(&self.rng)?;
        let socket = transport::bind(self.settings.bind).map_err(RoleError::Socket)?;

        let local = discover(&socket, self.settings.stun_server, &self.rng, self.settings.retry)?;
        log::info!("Our public endpoint is {}", local);

        let mut subscription =
            Subscription::new(self.settings.scope, 0).with_long_poll(self.settings.long_poll);
        signaling::publish(&self.channel, self.settings.scope, &HubMessage::request(serial, local))?;
        log::info!("Sent punching request with serial {}", serial);

        let deadline = self.wait.map(|wait| Instant::now() + wait);
        let offer = subscription
            .await_response(&self.channel, serial, deadline)
            .map_err(|e| match e {
                SignalingError::Timeout => RoleError::ResponseTimeout {
                    serial,
                    waited: self.wait.unwrap_or_default(),
                },
                other => other.into(),
            })?;
        log::info!("Remote public endpoint is {}", offer.endpoint);

        let report = punch(
            &socket,
            offer.endpoint,
            INITIATOR_MARKER,
            RESPONDER_MARKER,
            &self.settings.punch,
        )?;

        Ok(PeerLink {
            serial,
            local_endpoint: local,
            remote_endpoint: offer.endpoint,
            punch: report,
        })
    }
}

// ============================================================================
// Responder
// ============================================================================

/// Serves punching requests posted to the hub until told to stop
pub struct Responder<C, R> {
    channel: C,
    rng: R,
    settings: Settings,
    subscription: Option<Subscription>,
}

impl<C: Channel, R: SecureRandom> Responder<C, R> {
    pub fn new(channel: C, rng: R, settings: Settings) -> Self {
        Self {
            channel,
            rng,
            settings,
            subscription: None,
        }
    }

    /// Check hub credentials and skip everything already posted
    pub fn prepare(&mut self) -> Result<(), RoleError> {
        let identity = self.channel.self_test().map_err(RoleError::SelfTest)?;
        log::info!("Hub self-test passed as {}", identity);

        let subscription = Subscription::at_tail(&self.channel, self.settings.scope)?
            .with_long_poll(self.settings.long_poll);
        log::info!("Listening for requests after entry {}", subscription.cursor());
        self.subscription = Some(subscription);
        Ok(())
    }

    /// Poll once and serve every request in the batch
    pub fn serve_once(&mut self) -> Result<Vec<PeerLink>, RoleError> {
        if self.subscription.is_none() {
            self.prepare()?;
        }
        let offers = match self.subscription.as_mut() {
            Some(subscription) => subscription.next_requests(&self.channel)?,
            None => Vec::new(),
        };

        offers.iter().map(|offer| self.serve(offer)).collect()
    }

    /// Serve requests until `shutdown` is set
    ///
    /// The flag is checked between polls, so stopping may take up to one
    /// long-poll interval.
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<(), RoleError> {
        if self.subscription.is_none() {
            self.prepare()?;
        }
        while !shutdown.load(Ordering::Relaxed) {
            self.serve_once()?;
        }
        log::info!("Responder stopped");
        Ok(())
    }

    fn serve(&self, offer: &PeerOffer) -> Result<PeerLink, RoleError> {
        log::info!("Punching request serial {} from {}", offer.serial, offer.endpoint);
        let socket = transport::bind(self.settings.bind).map_err(RoleError::Socket)?;

        let local = discover(&socket, self.settings.stun_server, &self.rng, self.settings.retry)?;
        log::info!("Our public endpoint is {}", local);

        signaling::publish(
            &self.channel,
            self.settings.scope,
            &HubMessage::response(offer.serial, local),
        )?;

        let report = punch(
            &socket,
            offer.endpoint,
            RESPONDER_MARKER,
            INITIATOR_MARKER,
            &self.settings.punch,
        )?;

        Ok(PeerLink {
            serial: offer.serial,
            local_endpoint: local,
            remote_endpoint: offer.endpoint,
            punch: report,
        })
    }
}
