//! ChessLink Net - NAT traversal and peer sessions
//!
//! This crate provides:
//! - STUN address discovery over the caller's socket
//! - An HTTP client for the rendezvous server
//! - The connection negotiator that drives hole punching
//! - The UDP session handed to the game once connected
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Game / UI loop (any thread)                │
//! │  polls NegotiationHandle::state(), reads Session::incoming  │
//! └─────────────────────────────┬───────────────────────────────┘
//!                               │ watch / broadcast / mpsc
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Tokio Runtime (async)                      │
//! │  - Negotiator task: STUN → rendezvous → probing             │
//! │  - Session pump: filter, keepalive, forward datagrams       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! One UDP socket is bound per attempt and used from STUN through to the
//! session, so the public mapping the peer was told about stays valid.

pub mod negotiator;
pub mod rendezvous;
pub mod session;
pub mod stun;

#[cfg(test)]
mod test_support;

pub use negotiator::{Canceller, NegotiationHandle, Negotiator, Role};
pub use rendezvous::{RendezvousClient, RendezvousError};
pub use session::{Incoming, Session, SessionError};
pub use stun::{ResolveError, StunResolver};
