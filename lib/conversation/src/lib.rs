//! Conversation model for colloquy.
//!
//! This crate provides:
//!
//! - **Messages**: role-tagged messages, multimodal user content and tool call requests
//! - **Content builder**: user messages from text and optional image bytes
//! - **Tool arguments**: normalization of model-emitted argument text
//! - **History store**: conversation records and the append-only store contract
//! - **Tool registry**: tools available during a turn

pub mod args;
pub mod content;
pub mod error;
pub mod history;
pub mod login;
pub mod message;
pub mod tool;

pub use args::ToolArgs;
pub use content::build_user_message;
pub use error::{HistoryError, ToolError};
pub use history::{Conversation, ConversationSummary, HistoryStore, InMemoryHistoryStore};
pub use login::LoginContext;
pub use message::{ContentPart, ImageUrl, Message, MessageBody, MessageRole, ToolCallRequest, UserContent};
pub use tool::{Tool, ToolDefinition, ToolExecutor, ToolRegistry};
