//! Core type definitions for ChessLink
//!
//! These types are shared by the resolver, the rendezvous client and the
//! negotiator. None of them perform I/O.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

use crate::error::{FailureReason, IdentifierError};
use crate::identifier::Identifier;
use crate::words::WORD_COUNT;

/// An externally visible UDP endpoint
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerAddress(SocketAddr);

impl PeerAddress {
    pub const fn new(ip: IpAddr, port: u16) -> Self {
        Self(SocketAddr::new(ip, port))
    }

    pub fn ip(&self) -> IpAddr {
        self.0.ip()
    }

    pub fn port(&self) -> u16 {
        self.0.port()
    }

    pub fn socket_addr(&self) -> SocketAddr {
        self.0
    }

    /// Whether a datagram source is this address
    ///
    /// IPv4-mapped IPv6 sources (as seen on dual-stack sockets) match their
    /// IPv4 form.
    pub fn matches(&self, source: SocketAddr) -> bool {
        self.port() == source.port() && canonical_ip(self.ip()) == canonical_ip(source.ip())
    }
}

fn canonical_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        },
        v4 => v4,
    }
}

impl From<SocketAddr> for PeerAddress {
    fn from(addr: SocketAddr) -> Self {
        Self(addr)
    }
}

impl From<PeerAddress> for SocketAddr {
    fn from(addr: PeerAddress) -> Self {
        addr.0
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Numeric session key registered with the rendezvous server
///
/// Valid tokens lie in `[0, W³)` so that every token has exactly one
/// three-word identifier.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u64", into = "u64")]
pub struct SessionToken(u64);

impl SessionToken {
    /// Number of distinct tokens (2^33)
    pub const SPACE: u64 = (WORD_COUNT as u64) * (WORD_COUNT as u64) * (WORD_COUNT as u64);

    /// Create a token, rejecting values outside the identifier range
    pub const fn new(value: u64) -> Option<Self> {
        if value < Self::SPACE {
            Some(Self(value))
        } else {
            None
        }
    }

    pub(crate) const fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Draw a random token from the system entropy source
    pub fn generate() -> Result<Self, getrandom::Error> {
        let mut bytes = [0u8; 8];
        getrandom::fill(&mut bytes)?;
        // SPACE is a power of two, so the reduction is unbiased
        Ok(Self(u64::from_le_bytes(bytes) % Self::SPACE))
    }

    pub const fn value(self) -> u64 {
        self.0
    }

    /// Human-speakable form of this token
    pub fn identifier(self) -> Identifier {
        Identifier::from_token(self)
    }
}

impl TryFrom<u64> for SessionToken {
    type Error = IdentifierError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        Self::new(value).ok_or(IdentifierError::TokenOutOfRange(value))
    }
}

impl From<SessionToken> for u64 {
    fn from(token: SessionToken) -> Self {
        token.0
    }
}

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Progress of a single connection negotiation
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    ResolvingAddress,
    Registering,
    /// Host only: registered and waiting for the joiner to show up
    AwaitingPeer { identifier: Identifier },
    /// Joiner only
    LookingUp,
    Probing { peer: PeerAddress },
    Connected { peer: PeerAddress },
    Failed { reason: FailureReason },
}

impl ConnectionState {
    /// Connected and Failed are final
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connected { .. } | ConnectionState::Failed { .. }
        )
    }

    pub fn failure(&self) -> Option<FailureReason> {
        match self {
            ConnectionState::Failed { reason } => Some(*reason),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Idle => write!(f, "idle"),
            ConnectionState::ResolvingAddress => write!(f, "resolving address"),
            ConnectionState::Registering => write!(f, "registering"),
            ConnectionState::AwaitingPeer { identifier } => {
                write!(f, "awaiting peer ({})", identifier)
            }
            ConnectionState::LookingUp => write!(f, "looking up host"),
            ConnectionState::Probing { peer } => write!(f, "probing {}", peer),
            ConnectionState::Connected { peer } => write!(f, "connected to {}", peer),
            ConnectionState::Failed { reason } => write!(f, "failed: {}", reason),
        }
    }
}
