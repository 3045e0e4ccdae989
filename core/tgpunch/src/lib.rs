//! tgpunch core
//!
//! This crate provides everything both peers need to open a direct UDP path
//! through their NATs:
//! - public endpoint discovery against a STUN server
//! - endpoint exchange over a Telegram channel acting as rendezvous hub
//! - hole punching from the socket that ran discovery
//! - the initiator and responder drivers sequencing the three

// ============================================================================
// Modules
// ============================================================================

/// Command line configuration shared by the role binaries
pub mod config;

/// Rendezvous channel abstraction
pub mod hub;

/// P2P module for direct connectivity via NAT traversal
pub mod p2p;

/// Initiator and responder drivers
pub mod roles;

/// Telegram Bot API channel
pub mod tgapi;

pub use hub::{Channel, ChannelEntry, ChannelError};
pub use roles::{Initiator, PeerLink, Responder, RoleError};
pub use tgapi::TelegramHub;
