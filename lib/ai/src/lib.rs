//! Completion primitives for colloquy.
//!
//! This crate provides:
//!
//! - **Completion service**: the blocking and streaming interface the engine drives
//! - **OpenAI client**: an implementation for OpenAI-compatible HTTP endpoints
//! - **SSE decoding**: mapping of streamed completion events to chunks

pub mod backend;
pub mod error;
pub mod openai;
pub mod sse;

pub use backend::{
    ChunkStream, Choice, CompletionChunk, CompletionOptions, CompletionRequest, CompletionResponse,
    CompletionService, FinishReason, TokenUsage, ToolCallDelta,
};
pub use error::CompletionError;
pub use openai::{OpenAiClient, ProviderConfig};
pub use sse::{DONE_MARKER, completion_chunks};
