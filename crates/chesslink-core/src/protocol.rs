//! Wire definitions
//!
//! JSON bodies exchanged with the rendezvous server, and the fixed control
//! datagrams peers send each other over the punched UDP path.

use serde::{Deserialize, Serialize};

use crate::types::{PeerAddress, SessionToken};

/// Sent by both peers while hole punching
pub const PROBE: &[u8] = b"CHESSLINK/PROBE";

/// Reply to a probe once the peer's address is confirmed
pub const PROBE_ACK: &[u8] = b"CHESSLINK/PROBE-ACK";

/// Sent periodically on an idle session to hold the NAT binding open
pub const KEEPALIVE: &[u8] = b"CHESSLINK/KEEPALIVE";

/// Control datagram kinds
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Control {
    Probe,
    ProbeAck,
    Keepalive,
}

impl Control {
    /// Classify a datagram; only exact matches count as control traffic
    pub fn parse(datagram: &[u8]) -> Option<Self> {
        match datagram {
            d if d == PROBE => Some(Control::Probe),
            d if d == PROBE_ACK => Some(Control::ProbeAck),
            d if d == KEEPALIVE => Some(Control::Keepalive),
            _ => None,
        }
    }

    pub fn as_bytes(self) -> &'static [u8] {
        match self {
            Control::Probe => PROBE,
            Control::ProbeAck => PROBE_ACK,
            Control::Keepalive => KEEPALIVE,
        }
    }
}

/// `POST /sessions`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub token: SessionToken,
    pub address: PeerAddress,
}

/// `GET /sessions/{token}/peer`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PollResponse {
    Pending,
    Found { address: PeerAddress },
}

/// `POST /sessions/{token}/join`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRequest {
    pub address: PeerAddress,
}

/// Response to a join: the host's address
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinResponse {
    pub address: PeerAddress,
}

/// Path of the registration endpoint, relative to the base URL
pub fn register_path() -> &'static str {
    "sessions"
}

/// Path of the poll endpoint for a token
pub fn poll_path(token: SessionToken) -> String {
    format!("sessions/{}/peer", token)
}

/// Path of the join endpoint for a token
pub fn join_path(token: SessionToken) -> String {
    format!("sessions/{}/join", token)
}
