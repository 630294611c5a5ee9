//! Session state and bookkeeping types.

use serde::{Deserialize, Serialize};

/// Execution session state.
///
/// ```text
/// Created -> Ready <-> Executing -> Failed
///              |                      |
///              +------> Closed <------+
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum SessionState {
    /// Session object exists, native context not yet created.
    Created = 0,
    /// Context created and idle; calls are admitted.
    Ready = 1,
    /// A call is in flight against the context.
    Executing = 2,
    /// The native runtime reported an unrecoverable error.
    Failed = 3,
    /// Context released; the session is no longer usable.
    Closed = 4,
}

impl SessionState {
    /// Decode a state stored in an atomic.
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Created),
            1 => Some(Self::Ready),
            2 => Some(Self::Executing),
            3 => Some(Self::Failed),
            4 => Some(Self::Closed),
            _ => None,
        }
    }

    /// Whether a new call may be admitted from this state.
    pub fn accepts_calls(self) -> bool {
        self == Self::Ready
    }
}

/// Why a generation stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// The runtime produced its end-of-sequence token.
    EndOfSequence,
    /// The `max_tokens` budget was exhausted.
    MaxTokens,
    /// The caller cancelled the generation.
    Cancelled,
}

/// Counters collected over a session's lifetime.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    /// Calls admitted into the native context.
    pub calls: u64,
    /// Calls rejected because another call was in flight.
    pub busy_rejections: u64,
    /// Tokens produced by the runtime.
    pub tokens_generated: u64,
    /// Generations that ended through cancellation.
    pub cancellations: u64,
}
