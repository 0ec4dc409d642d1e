//! In-memory history of one turn.

use colloquy_conversation::Message;

/// The history a turn works on, split at the point the turn began.
///
/// Everything before `base_len` was loaded from the store; everything after
/// it was produced by this turn and is the only part handed back for
/// persistence.
#[derive(Debug, Clone, Default)]
pub struct Transcript {
    messages: Vec<Message>,
    base_len: usize,
}

impl Transcript {
    /// Starts a turn on top of stored history.
    #[must_use]
    pub fn resume(stored: Vec<Message>) -> Self {
        Self {
            base_len: stored.len(),
            messages: stored,
        }
    }

    /// Appends a message produced by this turn.
    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// Returns the whole history.
    #[must_use]
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Returns the number of messages loaded from the store.
    #[must_use]
    pub fn base_len(&self) -> usize {
        self.base_len
    }

    /// Returns the messages produced by this turn.
    #[must_use]
    pub fn new_messages(&self) -> &[Message] {
        &self.messages[self.base_len..]
    }
}
