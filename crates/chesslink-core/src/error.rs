//! Error types shared by every ChessLink component

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a negotiation attempt ended without a session
///
/// Every reason is terminal for the attempt it belongs to. The caller may
/// start a fresh negotiation afterwards.
#[derive(Error, Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    #[error("timed out waiting for a STUN response")]
    ResolutionTimeout,

    #[error("no STUN server could be used")]
    ResolutionUnavailable,

    #[error("rendezvous server unreachable")]
    RendezvousUnreachable,

    #[error("session token not found")]
    TokenNotFound,

    #[error("peer unreachable")]
    PeerUnreachable,

    #[error("connection attempt deadline exceeded")]
    DeadlineExceeded,

    #[error("cancelled")]
    Cancelled,
}

impl FailureReason {
    /// Short guidance suitable for showing to the player
    pub fn hint(self) -> &'static str {
        match self {
            FailureReason::TokenNotFound => "check the address was typed correctly",
            FailureReason::PeerUnreachable | FailureReason::DeadlineExceeded => {
                "connection could not be established, try again"
            }
            FailureReason::RendezvousUnreachable => "server unreachable",
            FailureReason::ResolutionTimeout | FailureReason::ResolutionUnavailable => {
                "could not determine your public address, check your internet connection"
            }
            FailureReason::Cancelled => "connection cancelled",
        }
    }
}

/// Errors from decoding a typed identifier
///
/// These come from user input and are never retried.
#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum IdentifierError {
    #[error("expected 3 words, got {words}")]
    MalformedIdentifier { words: usize },

    #[error("unknown word: {0}")]
    UnknownWord(String),

    #[error("token {0} is outside the identifier range")]
    TokenOutOfRange(u64),
}

impl IdentifierError {
    /// Short guidance suitable for showing to the player
    pub fn hint(&self) -> &'static str {
        "check the address was typed correctly"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_reason_hints() {
        assert_eq!(
            FailureReason::TokenNotFound.hint(),
            IdentifierError::UnknownWord("QUEEN".into()).hint()
        );
        assert_eq!(FailureReason::RendezvousUnreachable.hint(), "server unreachable");
        assert!(FailureReason::PeerUnreachable.hint().contains("try again"));
    }

    #[test]
    fn test_failure_reason_serialization() {
        let json = serde_json::to_string(&FailureReason::TokenNotFound).unwrap();
        assert_eq!(json, r#""token_not_found""#);
    }

    #[test]
    fn test_identifier_error_display() {
        let e = IdentifierError::MalformedIdentifier { words: 2 };
        assert_eq!(e.to_string(), "expected 3 words, got 2");
    }
}
