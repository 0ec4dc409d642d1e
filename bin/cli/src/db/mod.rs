//! Database repositories for the colloquy CLI.
//!
//! This module provides data access for:
//! - Conversations and their message history

pub mod conversation;

pub use conversation::PgHistoryStore;
