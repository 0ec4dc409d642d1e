//! Error types for the conversation crate.
//!
//! Errors are designed for layered context using rootcause:
//! - `HistoryError`: Errors from history store operations
//! - `ToolError`: Errors from tool execution

use colloquy_core::{ConversationId, UserId};
use std::fmt;

/// Errors from history store operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoryError {
    /// Loading a conversation failed.
    LoadFailed {
        conversation_id: ConversationId,
        reason: String,
    },
    /// Appending messages failed.
    AppendFailed {
        conversation_id: ConversationId,
        reason: String,
    },
    /// Listing conversations failed.
    ListFailed { user_id: UserId, reason: String },
    /// The conversation belongs to another user.
    NotOwned {
        conversation_id: ConversationId,
        user_id: UserId,
    },
    /// Stored data could not be decoded.
    Corrupt {
        conversation_id: ConversationId,
        reason: String,
    },
}

impl fmt::Display for HistoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LoadFailed {
                conversation_id,
                reason,
            } => write!(f, "failed to load conversation {conversation_id}: {reason}"),
            Self::AppendFailed {
                conversation_id,
                reason,
            } => write!(f, "failed to append to conversation {conversation_id}: {reason}"),
            Self::ListFailed { user_id, reason } => {
                write!(f, "failed to list conversations for {user_id}: {reason}")
            }
            Self::NotOwned {
                conversation_id,
                user_id,
            } => write!(f, "conversation {conversation_id} is not owned by {user_id}"),
            Self::Corrupt {
                conversation_id,
                reason,
            } => write!(f, "conversation {conversation_id} has corrupt data: {reason}"),
        }
    }
}

impl std::error::Error for HistoryError {}

/// Errors from tool execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolError {
    /// Tool not found.
    NotFound { name: String },
    /// Tool execution failed.
    ExecutionFailed { name: String, reason: String },
    /// Invalid tool input.
    InvalidInput { name: String, reason: String },
    /// The tool needs login context the request did not carry.
    MissingLoginContext { name: String },
}

impl fmt::Display for ToolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { name } => write!(f, "tool not found: {name}"),
            Self::ExecutionFailed { name, reason } => {
                write!(f, "tool '{name}' execution failed: {reason}")
            }
            Self::InvalidInput { name, reason } => {
                write!(f, "invalid input for tool '{name}': {reason}")
            }
            Self::MissingLoginContext { name } => {
                write!(f, "tool '{name}' requires login context")
            }
        }
    }
}

impl std::error::Error for ToolError {}

impl ToolError {
    /// Returns the message fed back to the model when a call fails.
    ///
    /// Execution failures report only the executor's reason; every other
    /// variant reports its full description.
    #[must_use]
    pub fn message(&self) -> String {
        match self {
            Self::ExecutionFailed { reason, .. } => reason.clone(),
            other => other.to_string(),
        }
    }
}
