//! Conversation and message persistence.
//!
//! Messages are an append-only log: immutable once written, strictly
//! ordered by creation time. Appends for one conversation are serialized
//! through [`ConversationLocks`] so two concurrent turns cannot interleave
//! their persisted order; different conversations never contend.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use sqlx::{Row, SqlitePool};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::models::{Conversation, Message, MessageRole, SourceCitation};

/// Conversation titles derive from the first user message, truncated.
const TITLE_MAX_CHARS: usize = 50;

/// Owner recorded on conversations in this single-user deployment.
const LOCAL_OWNER: &str = "local";

/// One async mutex per conversation id, handed out on demand.
#[derive(Default)]
pub struct ConversationLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ConversationLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock guarding appends to `conversation_id`.
    pub async fn for_conversation(&self, conversation_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(conversation_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

pub struct ConversationStore {
    pool: SqlitePool,
}

impl ConversationStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create a conversation titled after the opening message.
    pub async fn create(&self, first_message: &str) -> Result<Conversation> {
        let conversation = Conversation {
            id: Uuid::new_v4().to_string(),
            owner: LOCAL_OWNER.to_string(),
            title: derive_title(first_message),
            created_at: Utc::now().timestamp(),
        };

        sqlx::query("INSERT INTO conversations (id, owner, title, created_at) VALUES (?, ?, ?, ?)")
            .bind(&conversation.id)
            .bind(&conversation.owner)
            .bind(&conversation.title)
            .bind(conversation.created_at)
            .execute(&self.pool)
            .await?;

        Ok(conversation)
    }

    pub async fn get(&self, id: &str) -> Result<Option<Conversation>> {
        let row = sqlx::query("SELECT id, owner, title, created_at FROM conversations WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| Conversation {
            id: r.get("id"),
            owner: r.get("owner"),
            title: r.get("title"),
            created_at: r.get("created_at"),
        }))
    }

    /// Newest-first page of conversations.
    pub async fn list(&self, skip: i64, limit: i64) -> Result<Vec<Conversation>> {
        let rows = sqlx::query(
            "SELECT id, owner, title, created_at FROM conversations ORDER BY created_at DESC, id LIMIT ? OFFSET ?",
        )
        .bind(limit)
        .bind(skip)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|r| Conversation {
                id: r.get("id"),
                owner: r.get("owner"),
                title: r.get("title"),
                created_at: r.get("created_at"),
            })
            .collect())
    }

    /// Append one message. Callers hold the conversation's append lock.
    pub async fn append_message(
        &self,
        conversation_id: &str,
        role: MessageRole,
        content: &str,
        sources: Option<&[SourceCitation]>,
        charts: Option<&serde_json::Value>,
    ) -> Result<Message> {
        let message = Message {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            role,
            content: content.to_string(),
            sources: sources.map(|s| s.to_vec()),
            charts: charts.cloned(),
            created_at: Utc::now().timestamp_millis(),
        };

        let sources_json = message
            .sources
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let charts_json = message
            .charts
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            "INSERT INTO messages (id, conversation_id, role, content, sources_json, charts_json, created_at) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&message.id)
        .bind(&message.conversation_id)
        .bind(message.role.as_str())
        .bind(&message.content)
        .bind(sources_json)
        .bind(charts_json)
        .bind(message.created_at)
        .execute(&self.pool)
        .await?;

        Ok(message)
    }

    /// Oldest-first page of one conversation's messages.
    pub async fn list_messages(
        &self,
        conversation_id: &str,
        skip: i64,
        limit: i64,
    ) -> Result<Vec<Message>> {
        let rows = sqlx::query(
            r#"
            SELECT id, conversation_id, role, content, sources_json, charts_json, created_at
            FROM messages
            WHERE conversation_id = ?
            ORDER BY created_at, rowid
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(conversation_id)
        .bind(limit)
        .bind(skip)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_message).collect()
    }

    /// The most recent `limit` messages in chronological order, for model
    /// history.
    pub async fn recent_messages(&self, conversation_id: &str, limit: i64) -> Result<Vec<Message>> {
        let rows = sqlx::query(
            r#"
            SELECT id, conversation_id, role, content, sources_json, charts_json, created_at
            FROM messages
            WHERE conversation_id = ?
            ORDER BY created_at DESC, rowid DESC
            LIMIT ?
            "#,
        )
        .bind(conversation_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut messages: Vec<Message> = rows
            .iter()
            .map(row_to_message)
            .collect::<Result<Vec<_>>>()?;
        messages.reverse();
        Ok(messages)
    }

    /// Delete a conversation and its messages atomically. Returns false
    /// when the conversation does not exist.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let exists: bool =
            sqlx::query_scalar("SELECT COUNT(*) > 0 FROM conversations WHERE id = ?")
                .bind(id)
                .fetch_one(&mut *tx)
                .await?;
        if !exists {
            return Ok(false);
        }

        sqlx::query("DELETE FROM messages WHERE conversation_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM conversations WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }
}

fn row_to_message(row: &sqlx::sqlite::SqliteRow) -> Result<Message> {
    let role: String = row.get("role");
    let sources_json: Option<String> = row.get("sources_json");
    let charts_json: Option<String> = row.get("charts_json");

    Ok(Message {
        id: row.get("id"),
        conversation_id: row.get("conversation_id"),
        role: MessageRole::parse(&role)
            .ok_or_else(|| anyhow::anyhow!("unknown message role: {}", role))?,
        content: row.get("content"),
        sources: sources_json
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?,
        charts: charts_json
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?,
        created_at: row.get("created_at"),
    })
}

fn derive_title(first_message: &str) -> String {
    let trimmed = first_message.trim();
    if trimmed.chars().count() <= TITLE_MAX_CHARS {
        trimmed.to_string()
    } else {
        let cut: String = trimmed.chars().take(TITLE_MAX_CHARS).collect();
        format!("{}...", cut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::{db, migrate};

    async fn store() -> (tempfile::TempDir, ConversationStore) {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = Config::with_db_path(tmp.path().join("test.sqlite"));
        let pool = db::connect(&config).await.unwrap();
        migrate::apply_schema(&pool).await.unwrap();
        (tmp, ConversationStore::new(pool))
    }

    #[test]
    fn title_truncates_long_messages() {
        let long = "a".repeat(80);
        let title = derive_title(&long);
        assert_eq!(title.chars().count(), TITLE_MAX_CHARS + 3);
        assert!(title.ends_with("..."));

        assert_eq!(derive_title("short question"), "short question");
    }

    #[tokio::test]
    async fn messages_are_ordered_and_paginated() {
        let (_tmp, store) = store().await;
        let conv = store.create("hello").await.unwrap();

        for i in 0..5 {
            store
                .append_message(
                    &conv.id,
                    if i % 2 == 0 {
                        MessageRole::User
                    } else {
                        MessageRole::Assistant
                    },
                    &format!("message {}", i),
                    None,
                    None,
                )
                .await
                .unwrap();
        }

        let all = store.list_messages(&conv.id, 0, 50).await.unwrap();
        assert_eq!(all.len(), 5);
        for (i, m) in all.iter().enumerate() {
            assert_eq!(m.content, format!("message {}", i));
        }

        let page = store.list_messages(&conv.id, 2, 2).await.unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].content, "message 2");
    }

    #[tokio::test]
    async fn recent_messages_returns_tail_in_order() {
        let (_tmp, store) = store().await;
        let conv = store.create("hi").await.unwrap();
        for i in 0..6 {
            store
                .append_message(&conv.id, MessageRole::User, &format!("m{}", i), None, None)
                .await
                .unwrap();
        }

        let recent = store.recent_messages(&conv.id, 3).await.unwrap();
        assert_eq!(
            recent.iter().map(|m| m.content.as_str()).collect::<Vec<_>>(),
            vec!["m3", "m4", "m5"]
        );
    }

    #[tokio::test]
    async fn sources_round_trip() {
        let (_tmp, store) = store().await;
        let conv = store.create("q").await.unwrap();

        let citations = vec![SourceCitation {
            document_id: "d1".to_string(),
            chunk_id: "c1".to_string(),
            score: 0.87,
            display_name: "report.pdf".to_string(),
        }];
        store
            .append_message(
                &conv.id,
                MessageRole::Assistant,
                "grounded answer",
                Some(citations.as_slice()),
                None,
            )
            .await
            .unwrap();

        let messages = store.list_messages(&conv.id, 0, 10).await.unwrap();
        let sources = messages[0].sources.as_ref().unwrap();
        assert_eq!(sources[0].document_id, "d1");
        assert!((sources[0].score - 0.87).abs() < 1e-9);
    }

    #[tokio::test]
    async fn delete_cascades_to_messages() {
        let (_tmp, store) = store().await;
        let conv = store.create("bye").await.unwrap();
        store
            .append_message(&conv.id, MessageRole::User, "bye", None, None)
            .await
            .unwrap();

        assert!(store.delete(&conv.id).await.unwrap());
        assert!(store.get(&conv.id).await.unwrap().is_none());
        assert!(store.list_messages(&conv.id, 0, 10).await.unwrap().is_empty());
        assert!(!store.delete(&conv.id).await.unwrap());
    }

    #[tokio::test]
    async fn concurrent_appends_serialize_under_lock() {
        let (_tmp, store) = store().await;
        let store = Arc::new(store);
        let conv = store.create("race").await.unwrap();
        let locks = Arc::new(ConversationLocks::new());

        let mut handles = Vec::new();
        for i in 0..4 {
            let store = Arc::clone(&store);
            let locks = Arc::clone(&locks);
            let conv_id = conv.id.clone();
            handles.push(tokio::spawn(async move {
                let lock = locks.for_conversation(&conv_id).await;
                let _guard = lock.lock().await;
                // User then assistant, atomically from the log's view.
                store
                    .append_message(&conv_id, MessageRole::User, &format!("u{}", i), None, None)
                    .await
                    .unwrap();
                store
                    .append_message(
                        &conv_id,
                        MessageRole::Assistant,
                        &format!("a{}", i),
                        None,
                        None,
                    )
                    .await
                    .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let messages = store.list_messages(&conv.id, 0, 50).await.unwrap();
        assert_eq!(messages.len(), 8);
        // Turns never interleave: each user message is immediately followed
        // by its assistant reply.
        for pair in messages.chunks(2) {
            assert_eq!(pair[0].role, MessageRole::User);
            assert_eq!(pair[1].role, MessageRole::Assistant);
            assert_eq!(
                pair[0].content.trim_start_matches('u'),
                pair[1].content.trim_start_matches('a')
            );
        }
    }
}
