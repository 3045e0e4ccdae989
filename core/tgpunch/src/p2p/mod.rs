//! P2P module for direct UDP connectivity through NAT
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                      P2P Module Structure                      │
//! ├───────────────────────────────────────────────────────────────┤
//! │                                                                │
//! │  stun.rs       - Binding request/response wire codec          │
//! │  transport.rs  - Datagram socket seam                         │
//! │  discovery.rs  - Public endpoint discovery with retries       │
//! │  signaling.rs  - Endpoint exchange over the hub channel       │
//! │  hole_punch.rs - Probe bursts toward the peer endpoint        │
//! │                                                                │
//! └───────────────────────────────────────────────────────────────┘
//! ```

pub mod discovery;
pub mod hole_punch;
pub mod signaling;
pub mod stun;
pub mod transport;

// Re-export commonly used types
pub use discovery::{discover, resolve_server, DiscoveryError, RetryPolicy, DEFAULT_STUN_SERVER};

pub use hole_punch::{
    punch,
    PunchError,
    PunchPolicy,
    PunchReport,
    INITIATOR_MARKER,
    RESPONDER_MARKER,
};

pub use signaling::{
    generate_serial,
    HubMessage,
    MessageKind,
    PeerOffer,
    SignalingError,
    Subscription,
};

pub use stun::{StunError, TransactionId};

pub use transport::DatagramSocket;
