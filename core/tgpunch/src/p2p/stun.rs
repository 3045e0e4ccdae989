//! STUN binding codec used for reflexive address discovery
//!
//! Implements the subset of RFC 5389 needed to learn our public endpoint:
//! a header-only Binding Request and the XOR-MAPPED-ADDRESS attribute of a
//! Binding Response. Pure functions, no I/O.
//!
//! # Message Header
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |0 0|     STUN Message Type     |         Message Length        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                         Magic Cookie                          |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                     Transaction ID (96 bits)                  |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Attributes follow as `(type: u16, length: u16, value)` with no padding.
//!
//! # XOR-MAPPED-ADDRESS
//!
//! ```text
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |x x x x x x x x|    Family     |         X-Port                |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                X-Address (32 or 128 bits)
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use ring::rand::SecureRandom;
use thiserror::Error;

// ============================================================================
// Constants
// ============================================================================

/// Fixed value of the magic cookie field
pub const MAGIC_COOKIE: u32 = 0x2112_A442;

/// Size of the message header in bytes
pub const HEADER_LEN: usize = 20;

/// Size of the transaction ID in bytes
pub const TRANSACTION_ID_LEN: usize = 12;

/// Binding method, request class
pub const BINDING_REQUEST: u16 = 0x0001;

/// Binding method, success response class
pub const BINDING_SUCCESS_RESPONSE: u16 = 0x0101;

/// XOR-MAPPED-ADDRESS attribute type
pub const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;

const ATTR_HEADER_LEN: usize = 4;

const FAMILY_IPV4: u8 = 0x01;
const FAMILY_IPV6: u8 = 0x02;

/// Attribute types reserved by RFC 5389 (formerly RFC 3489 attributes)
const RESERVED_ATTRIBUTES: [u16; 7] = [0x0000, 0x0002, 0x0003, 0x0004, 0x0005, 0x0007, 0x000b];

// ============================================================================
// Transaction ID
// ============================================================================

/// 96-bit identifier echoed by the server in its response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionId([u8; TRANSACTION_ID_LEN]);

impl TransactionId {
    /// Draw a fresh transaction ID from the given CSPRNG
    pub fn random(rng: &dyn SecureRandom) -> Result<Self, ring::error::Unspecified> {
        let mut id = [0u8; TRANSACTION_ID_LEN];
        rng.fill(&mut id)?;
        Ok(Self(id))
    }

    pub const fn from_bytes(bytes: [u8; TRANSACTION_ID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; TRANSACTION_ID_LEN] {
        &self.0
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Reasons a STUN datagram is rejected
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StunError {
    #[error("STUN message header truncated ({0} bytes)")]
    Truncated(usize),

    #[error("STUN message header malformed: {0}")]
    MalformedHeader(&'static str),

    #[error("incomplete STUN message: header declares {declared} bytes, got {actual}")]
    Incomplete { declared: usize, actual: usize },

    #[error("trailing data: header declares {declared} bytes, got {actual}")]
    TrailingData { declared: usize, actual: usize },

    #[error("transaction ID mismatch")]
    TransactionMismatch,

    #[error("attribute truncated")]
    AttributeTruncated,

    #[error("unknown comprehension-required attribute: 0x{0:04x}")]
    UnknownRequiredAttribute(u16),

    #[error("invalid attribute length for address family 0x{family:02x}: {len}")]
    InvalidAddressLength { family: u8, len: usize },

    #[error("unsupported address family: 0x{0:02x}")]
    UnsupportedFamily(u8),

    #[error("more than one XOR-MAPPED-ADDRESS attribute")]
    DuplicateAddressAttribute,

    #[error("no XOR-MAPPED-ADDRESS attribute found in STUN message")]
    NoAddressAttribute,

    #[error("not a binding request (type 0x{0:04x})")]
    NotBindingRequest(u16),
}

// ============================================================================
// Encoding
// ============================================================================

/// Build a Binding Request: header only, message length 0
pub fn encode_binding_request(transaction_id: &TransactionId) -> [u8; HEADER_LEN] {
    let mut buf = [0u8; HEADER_LEN];
    write_header(&mut buf, BINDING_REQUEST, 0, transaction_id);
    buf
}

/// Build a Binding Success Response carrying `mapped` as XOR-MAPPED-ADDRESS.
///
/// This is the server side of the exchange; the client never sends it.
pub fn encode_binding_response(transaction_id: &TransactionId, mapped: SocketAddr) -> Vec<u8> {
    let (family, address): (u8, Vec<u8>) = match mapped.ip() {
        IpAddr::V4(ip) => (FAMILY_IPV4, ip.octets().to_vec()),
        IpAddr::V6(ip) => (FAMILY_IPV6, ip.octets().to_vec()),
    };
    let key = xor_key(transaction_id);

    let mut value = Vec::with_capacity(4 + address.len());
    value.push(0);
    value.push(family);
    value.extend_from_slice(&(mapped.port() ^ cookie_high_bits()).to_be_bytes());
    value.extend(address.iter().zip(key.iter()).map(|(a, k)| a ^ k));

    let payload_len = ATTR_HEADER_LEN + value.len();
    let mut buf = vec![0u8; HEADER_LEN];
    write_header(&mut buf, BINDING_SUCCESS_RESPONSE, payload_len as u16, transaction_id);
    buf.extend_from_slice(&ATTR_XOR_MAPPED_ADDRESS.to_be_bytes());
    buf.extend_from_slice(&(value.len() as u16).to_be_bytes());
    buf.extend_from_slice(&value);
    buf
}

fn write_header(buf: &mut [u8], message_type: u16, length: u16, transaction_id: &TransactionId) {
    buf[0..2].copy_from_slice(&message_type.to_be_bytes());
    buf[2..4].copy_from_slice(&length.to_be_bytes());
    buf[4..8].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
    buf[8..HEADER_LEN].copy_from_slice(transaction_id.as_bytes());
}

// ============================================================================
// Decoding
// ============================================================================

/// Validated message header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Header {
    message_type: u16,
    transaction_id: TransactionId,
}

/// Check the header fields in wire order: size, zero prefix, cookie, length
fn parse_header(buf: &[u8]) -> Result<Header, StunError> {
    if buf.len() < HEADER_LEN {
        return Err(StunError::Truncated(buf.len()));
    }

    let message_type = u16::from_be_bytes([buf[0], buf[1]]);
    if message_type & 0xC000 != 0 {
        return Err(StunError::MalformedHeader("first two bits are not zero"));
    }

    let cookie = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
    if cookie != MAGIC_COOKIE {
        return Err(StunError::MalformedHeader("magic cookie mismatch"));
    }

    let declared = u16::from_be_bytes([buf[2], buf[3]]) as usize;
    let actual = buf.len() - HEADER_LEN;
    if actual < declared {
        return Err(StunError::Incomplete { declared, actual });
    }
    if actual > declared {
        return Err(StunError::TrailingData { declared, actual });
    }

    let mut transaction_id = [0u8; TRANSACTION_ID_LEN];
    transaction_id.copy_from_slice(&buf[8..HEADER_LEN]);

    Ok(Header {
        message_type,
        transaction_id: TransactionId(transaction_id),
    })
}

/// Extract the reflexive endpoint from a Binding Response.
///
/// `expected` is the transaction ID of the request in flight; a response for
/// any other transaction is rejected.
pub fn decode_binding_response(
    response: &[u8],
    expected: &TransactionId,
) -> Result<SocketAddr, StunError> {
    let header = parse_header(response)?;
    if header.transaction_id != *expected {
        return Err(StunError::TransactionMismatch);
    }

    let mut mapped = None;
    for attr in Attributes::new(&response[HEADER_LEN..]) {
        let attr = attr?;

        if attr.is_comprehension_optional() || RESERVED_ATTRIBUTES.contains(&attr.kind) {
            log::trace!("Skipping attribute 0x{:04x} ({} bytes)", attr.kind, attr.value.len());
            continue;
        }

        if attr.kind != ATTR_XOR_MAPPED_ADDRESS {
            return Err(StunError::UnknownRequiredAttribute(attr.kind));
        }

        if mapped.is_some() {
            return Err(StunError::DuplicateAddressAttribute);
        }
        mapped = Some(decode_xor_mapped_address(attr.value, &header.transaction_id)?);
    }

    mapped.ok_or(StunError::NoAddressAttribute)
}

/// Validate a Binding Request and return its transaction ID (server side)
pub fn decode_binding_request(request: &[u8]) -> Result<TransactionId, StunError> {
    let header = parse_header(request)?;
    if header.message_type != BINDING_REQUEST {
        return Err(StunError::NotBindingRequest(header.message_type));
    }
    Ok(header.transaction_id)
}

fn decode_xor_mapped_address(
    value: &[u8],
    transaction_id: &TransactionId,
) -> Result<SocketAddr, StunError> {
    if value.len() < 4 {
        return Err(StunError::InvalidAddressLength {
            family: value.get(1).copied().unwrap_or(0),
            len: value.len(),
        });
    }

    let family = value[1];
    let expected_len = match family {
        FAMILY_IPV4 => 8,
        FAMILY_IPV6 => 20,
        other => return Err(StunError::UnsupportedFamily(other)),
    };
    if value.len() != expected_len {
        return Err(StunError::InvalidAddressLength {
            family,
            len: value.len(),
        });
    }

    let port = u16::from_be_bytes([value[2], value[3]]) ^ cookie_high_bits();
    let key = xor_key(transaction_id);

    let ip = if family == FAMILY_IPV4 {
        let mut octets = [0u8; 4];
        for (i, octet) in octets.iter_mut().enumerate() {
            *octet = value[4 + i] ^ key[i];
        }
        IpAddr::V4(Ipv4Addr::from(octets))
    } else {
        let mut octets = [0u8; 16];
        for (i, octet) in octets.iter_mut().enumerate() {
            *octet = value[4 + i] ^ key[i];
        }
        IpAddr::V6(Ipv6Addr::from(octets))
    };

    Ok(SocketAddr::new(ip, port))
}

/// Magic cookie followed by the transaction ID
fn xor_key(transaction_id: &TransactionId) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
    key[4..].copy_from_slice(transaction_id.as_bytes());
    key
}

fn cookie_high_bits() -> u16 {
    (MAGIC_COOKIE >> 16) as u16
}

// ============================================================================
// Attribute Iteration
// ============================================================================

struct Attribute<'a> {
    kind: u16,
    value: &'a [u8],
}

impl Attribute<'_> {
    /// Types 0x8000-0xFFFF may be ignored by agents that don't understand them
    fn is_comprehension_optional(&self) -> bool {
        self.kind & 0x8000 != 0
    }
}

/// Walks the payload one attribute at a time; stops after the first error
struct Attributes<'a> {
    payload: &'a [u8],
}

impl<'a> Attributes<'a> {
    fn new(payload: &'a [u8]) -> Self {
        Self { payload }
    }
}

impl<'a> Iterator for Attributes<'a> {
    type Item = Result<Attribute<'a>, StunError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.payload.is_empty() {
            return None;
        }

        if self.payload.len() < ATTR_HEADER_LEN {
            self.payload = &[];
            return Some(Err(StunError::AttributeTruncated));
        }

        let kind = u16::from_be_bytes([self.payload[0], self.payload[1]]);
        let len = u16::from_be_bytes([self.payload[2], self.payload[3]]) as usize;
        let rest = &self.payload[ATTR_HEADER_LEN..];

        if len > rest.len() {
            self.payload = &[];
            return Some(Err(StunError::AttributeTruncated));
        }

        let (value, remaining) = rest.split_at(len);
        self.payload = remaining;
        Some(Ok(Attribute { kind, value }))
    }
}

// ============================================================================
// Tests
// ============================================================================
