//! Core domain types and utilities for colloquy.
//!
//! This crate provides the identifiers and error handling shared by the
//! conversation, completion and orchestration crates.

pub mod error;
pub mod id;

pub use error::Result;
pub use id::{ConversationId, MessageId, ParseIdError, UserId};
