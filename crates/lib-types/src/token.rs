//! Token identifiers, generation input and output.

use crate::session::FinishReason;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Vocabulary index of a token.
///
/// Host code uses an unsigned id; the C ABI carries a signed 32-bit value,
/// so ids above `i32::MAX` cannot cross the boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TokenId(pub u32);

impl TokenId {
    #[inline]
    pub fn get(self) -> u32 {
        self.0
    }
}

impl From<u32> for TokenId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Input submitted to a session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Input {
    /// Prompt text, tokenized by the runtime.
    Text(String),
    /// Pre-tokenized prompt.
    Tokens(Vec<TokenId>),
}

impl Input {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Text(t) => t.is_empty(),
            Self::Tokens(t) => t.is_empty(),
        }
    }
}

impl From<&str> for Input {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<Vec<TokenId>> for Input {
    fn from(tokens: Vec<TokenId>) -> Self {
        Self::Tokens(tokens)
    }
}

/// One unit of incrementally produced output.
///
/// `text` holds the complete UTF-8 characters released by this token. It is
/// empty when the token only contributed part of a multi-byte character.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputUnit {
    pub token: TokenId,
    pub text: String,
}

/// Result of a complete (non-streaming) generation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Generation {
    /// Concatenated output text.
    pub text: String,
    /// Generated token ids, in order.
    pub tokens: Vec<TokenId>,
    /// Number of prompt tokens submitted before generation.
    pub prompt_tokens: usize,
    /// Why generation stopped.
    pub finish_reason: FinishReason,
}

impl Generation {
    pub fn completion_tokens(&self) -> usize {
        self.tokens.len()
    }
}
