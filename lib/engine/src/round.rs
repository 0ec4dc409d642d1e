//! State of a single model round.
//!
//! A round collects the assistant text and tool calls the model produced
//! for one completion request, whether they arrived whole (blocking) or in
//! chunks (streaming), and then resolves into either tool work or a final
//! answer.

use crate::event::DoneReason;
use colloquy_ai::{Choice, CompletionChunk, FinishReason, ToolCallDelta};
use colloquy_conversation::ToolCallRequest;
use std::collections::BTreeMap;

#[derive(Debug, Default)]
struct PartialCall {
    id: String,
    name: String,
    arguments: String,
}

/// Reassembles streamed tool call fragments by their index.
#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    calls: BTreeMap<usize, PartialCall>,
}

impl ToolCallAccumulator {
    /// Creates an empty accumulator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges one fragment.
    pub fn apply(&mut self, delta: &ToolCallDelta) {
        let call = self.calls.entry(delta.index).or_default();
        if let Some(id) = delta.id.as_deref().filter(|id| !id.is_empty()) {
            call.id = id.to_string();
        }
        if let Some(name) = delta.name.as_deref().filter(|name| !name.is_empty()) {
            call.name = name.to_string();
        }
        if let Some(arguments) = &delta.arguments {
            call.arguments.push_str(arguments);
        }
    }

    /// Returns true if no fragment has been merged.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Returns the assembled calls in index order.
    ///
    /// Calls that never received a name cannot be dispatched and are dropped.
    /// Calls without an id get one derived from the round and index.
    #[must_use]
    pub fn finish(self, round: u32) -> Vec<ToolCallRequest> {
        self.calls
            .into_iter()
            .filter(|(_, call)| !call.name.is_empty())
            .map(|(index, call)| {
                let id = if call.id.is_empty() {
                    format!("call_{round}_{index}")
                } else {
                    call.id
                };
                ToolCallRequest::new(id, call.name, call.arguments)
            })
            .collect()
    }
}

/// What a round resolved to.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// The model wants these tools run before it continues.
    Tools {
        text: String,
        calls: Vec<ToolCallRequest>,
    },
    /// The turn ends with this text.
    Final { text: String, reason: DoneReason },
}

/// One iteration of the round loop.
#[derive(Debug)]
pub struct Round {
    index: u32,
    text: String,
    calls: ToolCallAccumulator,
    finish_reason: Option<FinishReason>,
}

impl Round {
    /// Starts round `index` (1-based).
    #[must_use]
    pub fn new(index: u32) -> Self {
        Self {
            index,
            text: String::new(),
            calls: ToolCallAccumulator::new(),
            finish_reason: None,
        }
    }

    /// Builds a round from a whole blocking choice.
    ///
    /// Each call goes through the accumulator as a complete fragment, so
    /// blocking calls get the same id and name handling as streamed ones.
    #[must_use]
    pub fn from_choice(index: u32, choice: Choice) -> Self {
        let mut calls = ToolCallAccumulator::new();
        for (position, call) in choice.tool_calls.into_iter().enumerate() {
            calls.apply(&ToolCallDelta {
                index: position,
                id: Some(call.id),
                name: Some(call.name),
                arguments: Some(call.arguments),
            });
        }
        Self {
            index,
            text: choice.text,
            calls,
            finish_reason: Some(choice.finish_reason),
        }
    }

    /// Returns the round index.
    #[must_use]
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Returns the text accumulated so far.
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Merges a streamed chunk.
    pub fn apply(&mut self, chunk: &CompletionChunk) {
        self.text.push_str(&chunk.text);
        for delta in &chunk.tool_calls {
            self.calls.apply(delta);
        }
        if let Some(reason) = &chunk.finish_reason {
            self.finish_reason = Some(reason.clone());
        }
    }

    /// Returns true once the service has signalled it wants tools.
    ///
    /// A streaming consumer stops reading at this point.
    #[must_use]
    pub fn tool_signal(&self) -> bool {
        self.finish_reason.as_ref().is_some_and(FinishReason::wants_tools)
    }

    /// Resolves the round.
    ///
    /// Tools are needed only when the service signalled it and at least one
    /// call was recovered. A signal with no recoverable call ends the turn
    /// with [`DoneReason::NoToolDetails`].
    #[must_use]
    pub fn resolve(self) -> Resolution {
        let signalled = self.tool_signal();
        let calls = self.calls.finish(self.index);

        match (signalled, calls.is_empty()) {
            (true, false) => Resolution::Tools {
                text: self.text,
                calls,
            },
            (true, true) => Resolution::Final {
                text: self.text,
                reason: DoneReason::NoToolDetails,
            },
            (false, _) => Resolution::Final {
                text: self.text,
                reason: DoneReason::Completed,
            },
        }
    }
}
