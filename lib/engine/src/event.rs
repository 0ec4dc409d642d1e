//! Events pushed to the caller while a streaming turn runs.

use crate::error::EmitError;
use colloquy_conversation::{ToolArgs, ToolCallRequest};
use rootcause::prelude::Report;
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Why a streaming turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DoneReason {
    /// The model produced a final answer.
    Completed,
    /// The round ceiling was reached while the model still wanted tools.
    ToolRoundLimit,
    /// The model asked for tools but no call could be recovered.
    NoToolDetails,
}

impl DoneReason {
    /// Returns the wire name of the reason.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::ToolRoundLimit => "tool_round_limit",
            Self::NoToolDetails => "no_tool_details",
        }
    }
}

impl std::fmt::Display for DoneReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event emitted during a streaming turn.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    /// A fragment of assistant text.
    Delta { text: String },
    /// The model asked for tools in this round.
    ToolCallStart {
        round: u32,
        tool_calls: Vec<ToolCallRequest>,
    },
    /// A tool is about to run.
    ToolCall {
        round: u32,
        name: String,
        args: ToolArgs,
    },
    /// A tool finished, successfully or not.
    ToolResult {
        round: u32,
        name: String,
        result: String,
    },
    /// The turn is over. Always the last event of a turn that did not fail.
    Done { reason: DoneReason },
}

impl TurnEvent {
    /// Returns the wire event name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Delta { .. } => "delta",
            Self::ToolCallStart { .. } => "tool_call_start",
            Self::ToolCall { .. } => "tool_call",
            Self::ToolResult { .. } => "tool_result",
            Self::Done { .. } => "done",
        }
    }

    /// Returns the wire payload.
    #[must_use]
    pub fn payload(&self) -> JsonValue {
        match self {
            Self::Delta { text } => json!({ "text": text }),
            Self::ToolCallStart { round, tool_calls } => {
                json!({ "round": round, "tool_calls": tool_calls })
            }
            Self::ToolCall { round, name, args } => {
                json!({ "round": round, "name": name, "args": args })
            }
            Self::ToolResult {
                round,
                name,
                result,
            } => json!({ "round": round, "name": name, "result": result }),
            Self::Done { reason } => json!({ "reason": reason }),
        }
    }
}

/// Sink for streaming turn events.
///
/// Called inline from the turn; implementations should hand the event off
/// rather than block on a slow consumer.
pub trait EventEmitter: Send + Sync {
    /// Delivers one event.
    ///
    /// # Errors
    ///
    /// Returns an error if the event could not be delivered. The turn logs
    /// the failure and carries on.
    fn emit(&self, event: TurnEvent) -> Result<(), Report<EmitError>>;
}

/// Emitter that forwards events into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelEmitter {
    tx: mpsc::UnboundedSender<TurnEvent>,
}

impl ChannelEmitter {
    /// Creates an emitter and the stream its events arrive on.
    #[must_use]
    pub fn new() -> (Self, UnboundedReceiverStream<TurnEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, UnboundedReceiverStream::new(rx))
    }
}

impl EventEmitter for ChannelEmitter {
    fn emit(&self, event: TurnEvent) -> Result<(), Report<EmitError>> {
        self.tx.send(event).map_err(|_| EmitError::Closed)?;
        Ok(())
    }
}
