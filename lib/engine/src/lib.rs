//! Tool-calling conversation engine for colloquy.
//!
//! This crate provides:
//!
//! - **Orchestrator**: runs a turn in blocking or streaming mode, looping over
//!   model rounds and tool calls until the model answers or the round ceiling
//!   is hit
//! - **Dispatch**: routes tool calls to the login lookup or the tool executor
//! - **Events**: the ordered event sequence of a streaming turn
//! - **Transcript**: the working message list and its unpersisted suffix

pub mod config;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod orchestrator;
pub mod round;
pub mod transcript;

pub use config::{DEFAULT_MAX_ROUNDS, EngineConfig};
pub use dispatch::{Dispatched, LOGIN_TOOL_NAME, TOOL_ERROR_PREFIX, ToolDispatcher, parse_arguments};
pub use error::{EmitError, TurnError};
pub use event::{ChannelEmitter, DoneReason, EventEmitter, TurnEvent};
pub use orchestrator::{
    ChatReply, EMPTY_RESPONSE_NOTICE, Orchestrator, ROUND_LIMIT_NOTICE, TurnOutcome, TurnRequest,
};
pub use round::{Resolution, Round, ToolCallAccumulator};
pub use transcript::Transcript;
