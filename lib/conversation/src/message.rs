//! Message types for conversations.
//!
//! A [`Message`] is an identified, timestamped [`MessageBody`]; the body is a
//! sum type over the four roles so that role-specific data (multimodal
//! content, tool call requests, tool call ids) cannot be attached to the
//! wrong role.

use chrono::{DateTime, Utc};
use colloquy_core::MessageId;
use serde::{Deserialize, Serialize};

/// The role of a message sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// System priming message.
    System,
    /// User/human message.
    User,
    /// Assistant/AI message.
    Assistant,
    /// Tool result message.
    Tool,
}

impl MessageRole {
    /// Returns the wire name of the role.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message identifier.
    pub id: MessageId,
    /// When the message was created.
    pub timestamp: DateTime<Utc>,
    /// Role-tagged content.
    #[serde(flatten)]
    pub body: MessageBody,
}

/// Role-tagged message content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum MessageBody {
    /// System priming text.
    System { content: String },
    /// User input, plain or multimodal.
    User { content: UserContent },
    /// Model output. Carries tool call requests when the model asked for tools.
    Assistant {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolCallRequest>,
    },
    /// Result of one tool call, keyed to the originating request.
    Tool {
        tool_call_id: String,
        content: String,
    },
}

impl Message {
    fn with_body(body: MessageBody) -> Self {
        Self {
            id: MessageId::new(),
            timestamp: Utc::now(),
            body,
        }
    }

    /// Creates a system message.
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self::with_body(MessageBody::System {
            content: content.into(),
        })
    }

    /// Creates a plain-text user message.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self::with_body(MessageBody::User {
            content: UserContent::Text(content.into()),
        })
    }

    /// Creates a user message from already-built content.
    #[must_use]
    pub fn user_content(content: UserContent) -> Self {
        Self::with_body(MessageBody::User { content })
    }

    /// Creates an assistant message with text and no tool calls.
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_body(MessageBody::Assistant {
            content: Some(content.into()),
            tool_calls: Vec::new(),
        })
    }

    /// Creates an assistant message carrying the tool calls of one round.
    #[must_use]
    pub fn assistant_tool_calls(tool_calls: Vec<ToolCallRequest>) -> Self {
        Self::assistant_reply(None, tool_calls)
    }

    /// Creates an assistant message with optional text alongside tool calls.
    #[must_use]
    pub fn assistant_reply(content: Option<String>, tool_calls: Vec<ToolCallRequest>) -> Self {
        Self::with_body(MessageBody::Assistant {
            content,
            tool_calls,
        })
    }

    /// Creates a tool result message.
    #[must_use]
    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::with_body(MessageBody::Tool {
            tool_call_id: tool_call_id.into(),
            content: content.into(),
        })
    }

    /// Returns the role of this message.
    #[must_use]
    pub fn role(&self) -> MessageRole {
        match self.body {
            MessageBody::System { .. } => MessageRole::System,
            MessageBody::User { .. } => MessageRole::User,
            MessageBody::Assistant { .. } => MessageRole::Assistant,
            MessageBody::Tool { .. } => MessageRole::Tool,
        }
    }

    /// Returns the tool calls requested by an assistant message.
    #[must_use]
    pub fn tool_calls(&self) -> &[ToolCallRequest] {
        match &self.body {
            MessageBody::Assistant { tool_calls, .. } => tool_calls,
            _ => &[],
        }
    }

    /// Returns true if this message has tool calls.
    #[must_use]
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls().is_empty()
    }

    /// Returns the plain text of the message, if it has any.
    ///
    /// For multimodal user content this is the first text part.
    #[must_use]
    pub fn text(&self) -> Option<&str> {
        match &self.body {
            MessageBody::System { content } | MessageBody::Tool { content, .. } => {
                Some(content.as_str())
            }
            MessageBody::User { content } => content.text(),
            MessageBody::Assistant { content, .. } => content.as_deref(),
        }
    }
}

/// Content of a user message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UserContent {
    /// Plain text.
    Text(String),
    /// Ordered content parts (text and images).
    Parts(Vec<ContentPart>),
}

impl UserContent {
    /// Returns the plain text, or the first text part of multimodal content.
    #[must_use]
    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text.as_str()),
            Self::Parts(parts) => parts.iter().find_map(|part| match part {
                ContentPart::Text { text } => Some(text.as_str()),
                ContentPart::ImageUrl { .. } => None,
            }),
        }
    }

    /// Returns true if the content carries more than plain text.
    #[must_use]
    pub fn is_multimodal(&self) -> bool {
        matches!(self, Self::Parts(_))
    }
}

/// One part of multimodal user content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    /// A text part.
    Text { text: String },
    /// An image, inlined as a data URL.
    ImageUrl { image_url: ImageUrl },
}

/// Image reference understood by the completion service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageUrl {
    /// `data:<mime>;base64,<payload>` URL.
    pub url: String,
}

/// A tool call requested by the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    /// Identifier of this call, unique within the round.
    pub id: String,
    /// The tool name.
    pub name: String,
    /// Raw argument text as emitted by the model. Not guaranteed to be JSON.
    pub arguments: String,
}

impl ToolCallRequest {
    /// Creates a new tool call request.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments: arguments.into(),
        }
    }
}

/// Checks the tool-call pairing invariant over a message sequence.
///
/// Every assistant message with tool calls must be followed immediately by
/// one tool message per request, in request order, and every tool message
/// must answer such a request. Returns the index of the first offending
/// message.
pub fn check_tool_pairing(messages: &[Message]) -> Result<(), usize> {
    let mut i = 0;
    while i < messages.len() {
        match &messages[i].body {
            MessageBody::Assistant { tool_calls, .. } if !tool_calls.is_empty() => {
                for (offset, call) in tool_calls.iter().enumerate() {
                    let at = i + 1 + offset;
                    match messages.get(at).map(|m| &m.body) {
                        Some(MessageBody::Tool { tool_call_id, .. }) if *tool_call_id == call.id => {}
                        // Trailing requests with no answers yet are tolerated only at the end.
                        None => return Ok(()),
                        Some(_) => return Err(at),
                    }
                }
                i += 1 + tool_calls.len();
            }
            MessageBody::Tool { .. } => return Err(i),
            _ => i += 1,
        }
    }
    Ok(())
}
