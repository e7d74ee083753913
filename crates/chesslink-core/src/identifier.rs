//! Three-word identifiers
//!
//! A [`SessionToken`] is written as three base-2048 digits, most significant
//! first, and each digit is replaced by the word at that index in
//! [`WORDS`](crate::words::WORDS). The mapping is a bijection between
//! `[0, 2048³)` and word triples.
//!
//! ```text
//! token = i0 * 2048² + i1 * 2048 + i2   <->   "WORDS[i0] WORDS[i1] WORDS[i2]"
//! ```

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::error::IdentifierError;
use crate::types::SessionToken;
use crate::words::{index_of, WORDS, WORD_COUNT};

/// Number of words in an identifier
pub const IDENTIFIER_WORDS: usize = 3;

const BASE: u64 = WORD_COUNT as u64;

/// A human-speakable session identifier, e.g. `BASK DAWN ALAN`
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub struct Identifier {
    indices: [u16; IDENTIFIER_WORDS],
}

impl Identifier {
    /// Encode a token
    pub fn from_token(token: SessionToken) -> Self {
        let value = token.value();
        let indices = [
            (value / (BASE * BASE)) as u16,
            ((value / BASE) % BASE) as u16,
            (value % BASE) as u16,
        ];
        Self { indices }
    }

    /// Decode back to the token
    pub fn token(&self) -> SessionToken {
        let value = self
            .indices
            .iter()
            .fold(0u64, |acc, &digit| acc * BASE + digit as u64);
        // Three digits below BASE always land inside the token space
        SessionToken::from_raw(value)
    }

    /// The three words, uppercase
    pub fn words(&self) -> [&'static str; IDENTIFIER_WORDS] {
        self.indices.map(|i| WORDS[i as usize])
    }
}

/// Encode a token into its identifier
pub fn encode(token: SessionToken) -> Identifier {
    Identifier::from_token(token)
}

/// Decode typed text into a token
pub fn decode(text: &str) -> Result<SessionToken, IdentifierError> {
    text.parse::<Identifier>().map(|id| id.token())
}

/// Encode a raw value, checking the range first
pub fn encode_value(value: u64) -> Result<Identifier, IdentifierError> {
    SessionToken::new(value)
        .map(Identifier::from_token)
        .ok_or(IdentifierError::TokenOutOfRange(value))
}

impl FromStr for Identifier {
    type Err = IdentifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split_whitespace().collect();
        if parts.len() != IDENTIFIER_WORDS {
            return Err(IdentifierError::MalformedIdentifier { words: parts.len() });
        }

        let mut indices = [0u16; IDENTIFIER_WORDS];
        for (slot, word) in indices.iter_mut().zip(parts) {
            let index = index_of(word).ok_or_else(|| IdentifierError::UnknownWord(word.to_string()))?;
            *slot = index as u16;
        }
        Ok(Self { indices })
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c] = self.words();
        write!(f, "{} {} {}", a, b, c)
    }
}

impl Serialize for Identifier {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}
