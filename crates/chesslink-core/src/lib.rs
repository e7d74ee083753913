//! ChessLink Core - Shared types, identifier codec, and wire definitions
//!
//! This crate contains the foundational types used across all ChessLink components.
//! It has no dependencies on networking code.

pub mod config;
pub mod error;
pub mod identifier;
pub mod protocol;
pub mod types;
pub mod words;

pub use config::{
    Config, ConfigError, NetworkConfig, ProbeConfig, RendezvousConfig, SessionConfig, StunConfig,
};
pub use error::*;
pub use identifier::{decode, encode, Identifier, IDENTIFIER_WORDS};
pub use protocol::{Control, PollResponse};
pub use types::*;

/// Largest application datagram a session sends or delivers
pub const MAX_DATAGRAM_SIZE: usize = 1500;

/// Receive buffer size; holds any UDP payload so oversize datagrams are
/// detected instead of truncated
pub const RECV_BUFFER_SIZE: usize = 65_535;
