//! Conversation records and the history store contract.
//!
//! A conversation is an append-only, ordered list of messages owned by one
//! user. The engine loads it at the start of a turn and hands back only the
//! messages produced during the turn; stores merge that suffix into the
//! record, creating it on first use.

use crate::error::HistoryError;
use crate::message::{Message, MessageBody};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use colloquy_core::{ConversationId, MessageId, UserId};
use rootcause::prelude::Report;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, instrument};

/// Maximum number of characters kept from the first user message in a title.
pub const TITLE_MAX_CHARS: usize = 30;

/// Title used when no user text is available.
pub const DEFAULT_TITLE: &str = "New conversation";

/// A stored conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    /// Conversation identifier.
    pub id: ConversationId,
    /// Owner of the conversation.
    pub user_id: UserId,
    /// Display title.
    pub title: String,
    /// Whether an external summarizer has condensed this conversation.
    pub summarized: bool,
    /// Messages in conversation order.
    pub messages: Vec<Message>,
    /// When the conversation was created.
    pub created_at: DateTime<Utc>,
    /// When messages were last appended.
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    /// Creates a conversation from its first batch of messages.
    #[must_use]
    pub fn new(id: ConversationId, user_id: UserId, messages: Vec<Message>) -> Self {
        let now = Utc::now();
        Self {
            title: derive_title(&messages),
            id,
            user_id,
            summarized: false,
            messages,
            created_at: now,
            updated_at: now,
        }
    }

    /// Rejects access by anyone but the owner.
    pub fn ensure_owner(&self, user_id: &UserId) -> Result<(), HistoryError> {
        if &self.user_id == user_id {
            Ok(())
        } else {
            Err(HistoryError::NotOwned {
                conversation_id: self.id.clone(),
                user_id: user_id.clone(),
            })
        }
    }

    /// Appends messages not already present, returning how many were added.
    pub fn merge(&mut self, messages: &[Message]) -> usize {
        let known: HashSet<MessageId> = self.messages.iter().map(|m| m.id).collect();
        let before = self.messages.len();
        self.messages
            .extend(messages.iter().filter(|m| !known.contains(&m.id)).cloned());
        let added = self.messages.len() - before;
        if added > 0 {
            self.updated_at = Utc::now();
            if self.title == DEFAULT_TITLE {
                self.title = derive_title(&self.messages);
            }
        }
        added
    }

    /// Returns the listing summary of this conversation.
    #[must_use]
    pub fn summary(&self) -> ConversationSummary {
        ConversationSummary {
            id: self.id.clone(),
            title: self.title.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Listing entry for a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSummary {
    /// Conversation identifier.
    pub id: ConversationId,
    /// Display title.
    pub title: String,
    /// When the conversation was created.
    pub created_at: DateTime<Utc>,
    /// When messages were last appended.
    pub updated_at: DateTime<Utc>,
}

/// Derives a title from the first user message with text.
#[must_use]
pub fn derive_title(messages: &[Message]) -> String {
    let first = messages.iter().find_map(|m| match &m.body {
        MessageBody::User { content } => content.text().filter(|t| !t.trim().is_empty()),
        _ => None,
    });
    match first {
        Some(text) => truncate_title(text.trim()),
        None => DEFAULT_TITLE.to_string(),
    }
}

fn truncate_title(text: &str) -> String {
    match text.char_indices().nth(TITLE_MAX_CHARS) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

/// Durable storage of conversation history.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Loads a conversation, or `None` if it does not exist yet.
    async fn load(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Option<Conversation>, Report<HistoryError>>;

    /// Appends the messages produced by one turn.
    ///
    /// Creates the conversation for `user_id` when absent. Messages whose id
    /// is already stored are skipped, so retrying with the same batch is safe.
    async fn append_new(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
        messages: &[Message],
    ) -> Result<(), Report<HistoryError>>;

    /// Lists a user's conversations, most recently updated first.
    async fn list_for_user(
        &self,
        user_id: &UserId,
    ) -> Result<Vec<ConversationSummary>, Report<HistoryError>>;
}

/// History store kept in process memory.
///
/// Clones share the same underlying map.
#[derive(Debug, Clone, Default)]
pub struct InMemoryHistoryStore {
    conversations: Arc<RwLock<HashMap<ConversationId, Conversation>>>,
}

impl InMemoryHistoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the store with an existing conversation.
    pub async fn insert(&self, conversation: Conversation) {
        self.conversations
            .write()
            .await
            .insert(conversation.id.clone(), conversation);
    }
}

#[async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn load(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Option<Conversation>, Report<HistoryError>> {
        Ok(self.conversations.read().await.get(conversation_id).cloned())
    }

    #[instrument(skip(self, messages), fields(conversation_id = %conversation_id, count = messages.len()))]
    async fn append_new(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
        messages: &[Message],
    ) -> Result<(), Report<HistoryError>> {
        let mut conversations = self.conversations.write().await;
        match conversations.get_mut(conversation_id) {
            Some(existing) => {
                existing.ensure_owner(user_id)?;
                let added = existing.merge(messages);
                debug!(added, "merged messages into conversation");
            }
            None => {
                let mut conversation =
                    Conversation::new(conversation_id.clone(), user_id.clone(), Vec::new());
                conversation.merge(messages);
                debug!(title = %conversation.title, "created conversation");
                conversations.insert(conversation_id.clone(), conversation);
            }
        }
        Ok(())
    }

    async fn list_for_user(
        &self,
        user_id: &UserId,
    ) -> Result<Vec<ConversationSummary>, Report<HistoryError>> {
        let conversations = self.conversations.read().await;
        let mut summaries: Vec<_> = conversations
            .values()
            .filter(|c| &c.user_id == user_id)
            .map(Conversation::summary)
            .collect();
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(summaries)
    }
}
