//! Error types for the engine crate.
//!
//! Errors are designed for layered context using rootcause:
//! - `TurnError`: A turn was aborted
//! - `EmitError`: An event could not be delivered (never fatal to a turn)

use colloquy_core::{ConversationId, UserId};
use std::fmt;

/// Errors that abort a turn.
///
/// Tool failures, malformed model output and the round ceiling are not
/// errors; they are recorded in the conversation or in the turn outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnError {
    /// History could not be loaded.
    LoadFailed {
        conversation_id: ConversationId,
        reason: String,
    },
    /// The new messages could not be persisted.
    PersistFailed {
        conversation_id: ConversationId,
        reason: String,
    },
    /// The completion service failed.
    CompletionFailed { round: u32, reason: String },
    /// The conversation belongs to another user.
    ConversationNotOwned {
        conversation_id: ConversationId,
        user_id: UserId,
    },
    /// The caller cancelled the turn.
    Cancelled { round: u32 },
}

impl fmt::Display for TurnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LoadFailed {
                conversation_id,
                reason,
            } => write!(f, "failed to load conversation {conversation_id}: {reason}"),
            Self::PersistFailed {
                conversation_id,
                reason,
            } => write!(f, "failed to persist conversation {conversation_id}: {reason}"),
            Self::CompletionFailed { round, reason } => {
                write!(f, "completion failed in round {round}: {reason}")
            }
            Self::ConversationNotOwned {
                conversation_id,
                user_id,
            } => write!(f, "conversation {conversation_id} is not owned by {user_id}"),
            Self::Cancelled { round } => write!(f, "turn cancelled in round {round}"),
        }
    }
}

impl std::error::Error for TurnError {}

/// Errors from event emission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmitError {
    /// The consumer went away.
    Closed,
    /// The sink refused the event.
    Rejected { event: &'static str, reason: String },
}

impl fmt::Display for EmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "event consumer closed"),
            Self::Rejected { event, reason } => write!(f, "event '{event}' rejected: {reason}"),
        }
    }
}

impl std::error::Error for EmitError {}
