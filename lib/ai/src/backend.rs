//! Completion service abstraction.
//!
//! Provides one interface over chat-completion providers, in a blocking form
//! that returns a whole response and a streaming form that yields chunks.

use crate::error::CompletionError;
use async_trait::async_trait;
use colloquy_conversation::{Message, ToolCallRequest, ToolDefinition};
use futures::stream::BoxStream;
use rootcause::prelude::Report;
use serde::{Deserialize, Serialize};

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

/// Generation options passed through to the service.
///
/// Optional values are only sent when set, leaving the service default in
/// place otherwise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionOptions {
    /// Model identifier.
    #[serde(default = "default_model")]
    pub model: String,
    /// Maximum tokens to generate.
    #[serde(default)]
    pub max_tokens: Option<u32>,
    /// Sampling temperature.
    #[serde(default)]
    pub temperature: Option<f32>,
    /// Nucleus sampling mass.
    #[serde(default)]
    pub top_p: Option<f32>,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self {
            model: default_model(),
            max_tokens: None,
            temperature: None,
            top_p: None,
        }
    }
}

impl CompletionOptions {
    /// Creates options for a model with service defaults for everything else.
    #[must_use]
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Self::default()
        }
    }

    /// Sets the max tokens.
    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Sets the temperature.
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Sets top-p.
    #[must_use]
    pub fn with_top_p(mut self, top_p: f32) -> Self {
        self.top_p = Some(top_p);
        self
    }
}

/// A request to the completion service.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    /// Full conversation history, oldest first.
    pub messages: Vec<Message>,
    /// Tools the model may call. Empty means tools are not offered.
    pub tools: Vec<ToolDefinition>,
    /// Generation options.
    pub options: CompletionOptions,
}

impl CompletionRequest {
    /// Creates a request with no tools.
    #[must_use]
    pub fn new(messages: Vec<Message>, options: CompletionOptions) -> Self {
        Self {
            messages,
            tools: Vec::new(),
            options,
        }
    }

    /// Offers tools to the model.
    #[must_use]
    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }
}

/// Why the service stopped generating.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FinishReason {
    /// Natural end of output.
    Stop,
    /// Output hit the token limit.
    Length,
    /// The model wants tools called before it continues.
    ToolCalls,
    /// Output was filtered.
    ContentFilter,
    /// Any reason this client does not recognise.
    Other(String),
}

impl FinishReason {
    /// Maps a wire finish reason.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        match raw {
            "stop" => Self::Stop,
            "length" => Self::Length,
            "tool_calls" | "function_call" => Self::ToolCalls,
            "content_filter" => Self::ContentFilter,
            other => Self::Other(other.to_string()),
        }
    }

    /// Returns true if the model signalled that it wants tools.
    #[must_use]
    pub fn wants_tools(&self) -> bool {
        matches!(self, Self::ToolCalls)
    }
}

/// The first choice of a blocking completion.
#[derive(Debug, Clone, PartialEq)]
pub struct Choice {
    /// Generated text, possibly empty.
    pub text: String,
    /// Tool calls requested by the model.
    pub tool_calls: Vec<ToolCallRequest>,
    /// Why generation stopped.
    pub finish_reason: FinishReason,
}

/// A blocking completion response.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionResponse {
    /// The first choice, or `None` if the service returned no choices.
    pub choice: Option<Choice>,
    /// Token usage statistics.
    pub usage: TokenUsage,
    /// Model that generated the response.
    pub model: String,
}

/// Token usage statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Number of input tokens.
    pub input_tokens: u32,
    /// Number of output tokens.
    pub output_tokens: u32,
}

impl TokenUsage {
    /// Returns the total number of tokens.
    #[must_use]
    pub fn total(&self) -> u32 {
        self.input_tokens.saturating_add(self.output_tokens)
    }
}

/// A fragment of one streamed tool call.
///
/// Fragments with the same `index` belong to the same call; `id` and `name`
/// usually arrive once and `arguments` arrives in pieces.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolCallDelta {
    /// Position of the call within the round.
    pub index: usize,
    /// Call id, when this fragment carries it.
    pub id: Option<String>,
    /// Tool name, when this fragment carries it.
    pub name: Option<String>,
    /// Next piece of argument text.
    pub arguments: Option<String>,
}

/// One increment of a streamed completion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompletionChunk {
    /// Text fragment, possibly empty.
    pub text: String,
    /// Tool call fragments.
    pub tool_calls: Vec<ToolCallDelta>,
    /// Set on the chunk that ends the choice.
    pub finish_reason: Option<FinishReason>,
}

impl CompletionChunk {
    /// Creates a text-only chunk.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    /// Creates a chunk that only carries a finish reason.
    #[must_use]
    pub fn finish(reason: FinishReason) -> Self {
        Self {
            finish_reason: Some(reason),
            ..Self::default()
        }
    }
}

/// Stream of completion chunks. Dropping it closes the underlying request.
pub type ChunkStream = BoxStream<'static, Result<CompletionChunk, Report<CompletionError>>>;

/// Trait for completion services.
#[async_trait]
pub trait CompletionService: Send + Sync {
    /// Generates a whole response.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the response cannot be read.
    async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, Report<CompletionError>>;

    /// Starts a streamed response.
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be started. Failures after the
    /// stream has begun arrive as stream items.
    async fn stream(&self, request: &CompletionRequest)
    -> Result<ChunkStream, Report<CompletionError>>;
}
