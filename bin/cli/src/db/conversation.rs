//! Postgres-backed history store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use colloquy_conversation::history::{DEFAULT_TITLE, derive_title};
use colloquy_conversation::{Conversation, ConversationSummary, HistoryError, HistoryStore, Message};
use colloquy_core::{ConversationId, UserId};
use rootcause::prelude::Report;
use sqlx::{FromRow, PgPool};
use tracing::{debug, instrument};

/// Row type for conversation queries.
#[derive(FromRow)]
struct ConversationRow {
    id: String,
    user_id: String,
    title: String,
    summarized: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl ConversationRow {
    fn into_summary(self) -> ConversationSummary {
        ConversationSummary {
            id: ConversationId::new(self.id),
            title: self.title,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    fn into_conversation(self, messages: Vec<Message>) -> Conversation {
        Conversation {
            id: ConversationId::new(self.id),
            user_id: UserId::new(self.user_id),
            title: self.title,
            summarized: self.summarized,
            messages,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Row type for message queries.
#[derive(FromRow)]
struct MessageRow {
    id: String,
    body: serde_json::Value,
}

impl MessageRow {
    fn try_into_message(self, conversation_id: &ConversationId) -> Result<Message, HistoryError> {
        serde_json::from_value(self.body).map_err(|e| HistoryError::Corrupt {
            conversation_id: conversation_id.clone(),
            reason: format!("invalid message '{}': {e}", self.id),
        })
    }
}

/// History store persisting conversations in Postgres.
///
/// Each message is stored once, keyed by its id, so a retried append never
/// duplicates history.
#[derive(Debug, Clone)]
pub struct PgHistoryStore {
    pool: PgPool,
}

impl PgHistoryStore {
    /// Creates a new store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn load_failed(conversation_id: &ConversationId, err: sqlx::Error) -> HistoryError {
    HistoryError::LoadFailed {
        conversation_id: conversation_id.clone(),
        reason: err.to_string(),
    }
}

fn append_failed(conversation_id: &ConversationId, err: impl std::fmt::Display) -> HistoryError {
    HistoryError::AppendFailed {
        conversation_id: conversation_id.clone(),
        reason: err.to_string(),
    }
}

#[async_trait]
impl HistoryStore for PgHistoryStore {
    #[instrument(skip(self), fields(conversation_id = %conversation_id))]
    async fn load(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Option<Conversation>, Report<HistoryError>> {
        let row: Option<ConversationRow> = sqlx::query_as(
            r#"
            SELECT id, user_id, title, summarized, created_at, updated_at
            FROM conversations
            WHERE id = $1
            "#,
        )
        .bind(conversation_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| load_failed(conversation_id, e))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let message_rows: Vec<MessageRow> = sqlx::query_as(
            r#"
            SELECT id, body
            FROM conversation_messages
            WHERE conversation_id = $1
            ORDER BY position ASC
            "#,
        )
        .bind(conversation_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| load_failed(conversation_id, e))?;

        let messages = message_rows
            .into_iter()
            .map(|r| r.try_into_message(conversation_id))
            .collect::<Result<Vec<_>, _>>()?;
        debug!(messages = messages.len(), "loaded conversation");

        Ok(Some(row.into_conversation(messages)))
    }

    #[instrument(skip(self, messages), fields(conversation_id = %conversation_id, count = messages.len()))]
    async fn append_new(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
        messages: &[Message],
    ) -> Result<(), Report<HistoryError>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| append_failed(conversation_id, e))?;

        let existing: Option<(String, String)> = sqlx::query_as(
            r#"
            SELECT user_id, title
            FROM conversations
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(conversation_id.as_str())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| append_failed(conversation_id, e))?;

        let title = derive_title(messages);
        match existing {
            Some((owner, _)) if owner != user_id.as_str() => {
                return Err(HistoryError::NotOwned {
                    conversation_id: conversation_id.clone(),
                    user_id: user_id.clone(),
                }
                .into());
            }
            Some((_, current)) => {
                if current == DEFAULT_TITLE && title != DEFAULT_TITLE {
                    sqlx::query("UPDATE conversations SET title = $2 WHERE id = $1")
                        .bind(conversation_id.as_str())
                        .bind(&title)
                        .execute(&mut *tx)
                        .await
                        .map_err(|e| append_failed(conversation_id, e))?;
                }
            }
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO conversations (id, user_id, title)
                    VALUES ($1, $2, $3)
                    "#,
                )
                .bind(conversation_id.as_str())
                .bind(user_id.as_str())
                .bind(&title)
                .execute(&mut *tx)
                .await
                .map_err(|e| append_failed(conversation_id, e))?;
                debug!(%title, "created conversation");
            }
        }

        let (mut position,): (i32,) = sqlx::query_as(
            r#"
            SELECT COALESCE(MAX(position) + 1, 0)
            FROM conversation_messages
            WHERE conversation_id = $1
            "#,
        )
        .bind(conversation_id.as_str())
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| append_failed(conversation_id, e))?;

        let mut added = 0;
        for message in messages {
            let body = serde_json::to_value(message).map_err(|e| append_failed(conversation_id, e))?;
            let result = sqlx::query(
                r#"
                INSERT INTO conversation_messages (id, conversation_id, position, body, created_at)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (id) DO NOTHING
                "#,
            )
            .bind(message.id.to_string())
            .bind(conversation_id.as_str())
            .bind(position)
            .bind(&body)
            .bind(message.timestamp)
            .execute(&mut *tx)
            .await
            .map_err(|e| append_failed(conversation_id, e))?;

            if result.rows_affected() > 0 {
                position += 1;
                added += 1;
            }
        }

        if added > 0 {
            sqlx::query("UPDATE conversations SET updated_at = NOW() WHERE id = $1")
                .bind(conversation_id.as_str())
                .execute(&mut *tx)
                .await
                .map_err(|e| append_failed(conversation_id, e))?;
        }

        tx.commit()
            .await
            .map_err(|e| append_failed(conversation_id, e))?;
        debug!(added, "appended messages");
        Ok(())
    }

    async fn list_for_user(
        &self,
        user_id: &UserId,
    ) -> Result<Vec<ConversationSummary>, Report<HistoryError>> {
        let rows: Vec<ConversationRow> = sqlx::query_as(
            r#"
            SELECT id, user_id, title, summarized, created_at, updated_at
            FROM conversations
            WHERE user_id = $1
            ORDER BY updated_at DESC
            "#,
        )
        .bind(user_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| HistoryError::ListFailed {
            user_id: user_id.clone(),
            reason: e.to_string(),
        })?;

        Ok(rows.into_iter().map(ConversationRow::into_summary).collect())
    }
}
