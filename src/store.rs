//! Conversation persistence.
//!
//! The [`ChatStore`] trait defines the write/read contract the relay and the
//! HTTP surface need: append messages, manage conversation titles, and read
//! conversations back scoped to their owning identity. Two backends:
//!
//! - [`SqliteStore`] — production backend over the pool from [`crate::db`].
//! - [`InMemoryStore`] — `HashMap` behind `std::sync::RwLock`, used by tests.
//!
//! Writes are best-effort relative to the user-visible stream: the relay
//! logs persistence failures and keeps streaming, so none of these
//! operations may be assumed to have happened by the time a client sees an
//! event.

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::models::{Citation, Conversation, Message, Role};

/// Storage contract for conversations and messages.
#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn create_conversation(&self, owner: &str) -> Result<Conversation>;

    /// Fetch a conversation, scoped to its owner. `None` when it does not
    /// exist or belongs to someone else.
    async fn get_conversation(&self, owner: &str, id: &str) -> Result<Option<Conversation>>;

    /// All conversations for one owner, most recently updated first.
    async fn list_conversations(&self, owner: &str) -> Result<Vec<Conversation>>;

    /// Append a message and advance the conversation's `updated_at`.
    async fn append_message(
        &self,
        conversation_id: &str,
        role: Role,
        content: &str,
        citations: &[Citation],
    ) -> Result<Message>;

    /// Messages of a conversation in append order.
    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>>;

    /// Set the title if none has been set yet. Returns whether the write
    /// applied; the automatic title transition happens at most once.
    async fn set_title_if_unset(&self, conversation_id: &str, title: &str) -> Result<bool>;

    /// Unconditionally rename (user edit after the automatic transition).
    async fn set_title(&self, conversation_id: &str, title: &str) -> Result<()>;

    /// Returns whether a conversation was deleted.
    async fn delete_conversation(&self, owner: &str, id: &str) -> Result<bool>;
}

// ============ SQLite backend ============

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn row_to_conversation(row: &sqlx::sqlite::SqliteRow) -> Conversation {
    Conversation {
        id: row.get("id"),
        owner: row.get("owner"),
        title: row.get("title"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn row_to_message(row: &sqlx::sqlite::SqliteRow) -> Message {
    let role_str: String = row.get("role");
    let citations_json: String = row.get("citations_json");
    Message {
        id: row.get("id"),
        conversation_id: row.get("conversation_id"),
        role: Role::parse(&role_str).unwrap_or(Role::Assistant),
        content: row.get("content"),
        citations: serde_json::from_str(&citations_json).unwrap_or_default(),
        created_at: row.get("created_at"),
    }
}

#[async_trait]
impl ChatStore for SqliteStore {
    async fn create_conversation(&self, owner: &str) -> Result<Conversation> {
        let conversation = Conversation {
            id: Uuid::new_v4().to_string(),
            owner: owner.to_string(),
            title: None,
            created_at: Utc::now().timestamp(),
            updated_at: Utc::now().timestamp(),
        };

        sqlx::query(
            "INSERT INTO conversations (id, owner, title, created_at, updated_at) VALUES (?, ?, NULL, ?, ?)",
        )
        .bind(&conversation.id)
        .bind(&conversation.owner)
        .bind(conversation.created_at)
        .bind(conversation.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(conversation)
    }

    async fn get_conversation(&self, owner: &str, id: &str) -> Result<Option<Conversation>> {
        let row = sqlx::query(
            "SELECT id, owner, title, created_at, updated_at FROM conversations WHERE id = ? AND owner = ?",
        )
        .bind(id)
        .bind(owner)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(row_to_conversation))
    }

    async fn list_conversations(&self, owner: &str) -> Result<Vec<Conversation>> {
        let rows = sqlx::query(
            "SELECT id, owner, title, created_at, updated_at FROM conversations WHERE owner = ? ORDER BY updated_at DESC",
        )
        .bind(owner)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(row_to_conversation).collect())
    }

    async fn append_message(
        &self,
        conversation_id: &str,
        role: Role,
        content: &str,
        citations: &[Citation],
    ) -> Result<Message> {
        let message = Message {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            role,
            content: content.to_string(),
            citations: citations.to_vec(),
            created_at: Utc::now().timestamp(),
        };

        sqlx::query(
            "INSERT INTO messages (id, conversation_id, role, content, citations_json, created_at) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&message.id)
        .bind(conversation_id)
        .bind(role.as_str())
        .bind(content)
        .bind(serde_json::to_string(citations)?)
        .bind(message.created_at)
        .execute(&self.pool)
        .await?;

        sqlx::query("UPDATE conversations SET updated_at = ? WHERE id = ?")
            .bind(message.created_at)
            .bind(conversation_id)
            .execute(&self.pool)
            .await?;

        Ok(message)
    }

    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>> {
        let rows = sqlx::query(
            "SELECT id, conversation_id, role, content, citations_json, created_at FROM messages WHERE conversation_id = ? ORDER BY created_at ASC, rowid ASC",
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(row_to_message).collect())
    }

    async fn set_title_if_unset(&self, conversation_id: &str, title: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE conversations SET title = ?, updated_at = ? WHERE id = ? AND title IS NULL",
        )
        .bind(title)
        .bind(Utc::now().timestamp())
        .bind(conversation_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn set_title(&self, conversation_id: &str, title: &str) -> Result<()> {
        sqlx::query("UPDATE conversations SET title = ?, updated_at = ? WHERE id = ?")
            .bind(title)
            .bind(Utc::now().timestamp())
            .bind(conversation_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_conversation(&self, owner: &str, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM conversations WHERE id = ? AND owner = ?")
            .bind(id)
            .bind(owner)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

// ============ In-memory backend ============

/// In-memory store for tests.
pub struct InMemoryStore {
    conversations: RwLock<HashMap<String, Conversation>>,
    messages: RwLock<Vec<Message>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            conversations: RwLock::new(HashMap::new()),
            messages: RwLock::new(Vec::new()),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChatStore for InMemoryStore {
    async fn create_conversation(&self, owner: &str) -> Result<Conversation> {
        let conversation = Conversation {
            id: Uuid::new_v4().to_string(),
            owner: owner.to_string(),
            title: None,
            created_at: Utc::now().timestamp(),
            updated_at: Utc::now().timestamp(),
        };
        self.conversations
            .write()
            .unwrap()
            .insert(conversation.id.clone(), conversation.clone());
        Ok(conversation)
    }

    async fn get_conversation(&self, owner: &str, id: &str) -> Result<Option<Conversation>> {
        Ok(self
            .conversations
            .read()
            .unwrap()
            .get(id)
            .filter(|c| c.owner == owner)
            .cloned())
    }

    async fn list_conversations(&self, owner: &str) -> Result<Vec<Conversation>> {
        let mut list: Vec<Conversation> = self
            .conversations
            .read()
            .unwrap()
            .values()
            .filter(|c| c.owner == owner)
            .cloned()
            .collect();
        list.sort_by_key(|c| std::cmp::Reverse(c.updated_at));
        Ok(list)
    }

    async fn append_message(
        &self,
        conversation_id: &str,
        role: Role,
        content: &str,
        citations: &[Citation],
    ) -> Result<Message> {
        let message = Message {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            role,
            content: content.to_string(),
            citations: citations.to_vec(),
            created_at: Utc::now().timestamp(),
        };
        self.messages.write().unwrap().push(message.clone());
        if let Some(c) = self
            .conversations
            .write()
            .unwrap()
            .get_mut(conversation_id)
        {
            c.updated_at = message.created_at;
        }
        Ok(message)
    }

    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>> {
        Ok(self
            .messages
            .read()
            .unwrap()
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect())
    }

    async fn set_title_if_unset(&self, conversation_id: &str, title: &str) -> Result<bool> {
        let mut conversations = self.conversations.write().unwrap();
        match conversations.get_mut(conversation_id) {
            Some(c) if c.title.is_none() => {
                c.title = Some(title.to_string());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_title(&self, conversation_id: &str, title: &str) -> Result<()> {
        if let Some(c) = self.conversations.write().unwrap().get_mut(conversation_id) {
            c.title = Some(title.to_string());
        }
        Ok(())
    }

    async fn delete_conversation(&self, owner: &str, id: &str) -> Result<bool> {
        let removed = {
            let mut conversations = self.conversations.write().unwrap();
            let owned = conversations.get(id).is_some_and(|c| c.owner == owner);
            if owned {
                conversations.remove(id);
            }
            owned
        };
        if removed {
            self.messages
                .write()
                .unwrap()
                .retain(|m| m.conversation_id != id);
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db, migrate};

    async fn sqlite_store() -> (tempfile::TempDir, SqliteStore) {
        let tmp = tempfile::TempDir::new().unwrap();
        let pool = db::connect(&tmp.path().join("atlas.sqlite")).await.unwrap();
        migrate::run_migrations(&pool).await.unwrap();
        (tmp, SqliteStore::new(pool))
    }

    fn citation(id: u32, title: &str) -> Citation {
        Citation {
            id,
            source_title: title.to_string(),
            source_uri: Some(format!("https://example.com/{}", title)),
            text: None,
        }
    }

    #[tokio::test]
    async fn test_append_and_list_messages_roundtrip() {
        let (_tmp, store) = sqlite_store().await;
        let conv = store.create_conversation("alice").await.unwrap();

        store
            .append_message(&conv.id, Role::User, "hello", &[])
            .await
            .unwrap();
        store
            .append_message(
                &conv.id,
                Role::Assistant,
                "hi there",
                &[citation(1, "Doc.pdf")],
            )
            .await
            .unwrap();

        let messages = store.list_messages(&conv.id).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[1].content, "hi there");
        assert_eq!(messages[1].citations, vec![citation(1, "Doc.pdf")]);
    }

    #[tokio::test]
    async fn test_append_advances_updated_at() {
        let (_tmp, store) = sqlite_store().await;
        let conv = store.create_conversation("alice").await.unwrap();

        store
            .append_message(&conv.id, Role::User, "hello", &[])
            .await
            .unwrap();

        let reloaded = store
            .get_conversation("alice", &conv.id)
            .await
            .unwrap()
            .unwrap();
        assert!(reloaded.updated_at >= conv.updated_at);
    }

    #[tokio::test]
    async fn test_title_transitions_once_then_renames() {
        let (_tmp, store) = sqlite_store().await;
        let conv = store.create_conversation("alice").await.unwrap();

        assert!(store.set_title_if_unset(&conv.id, "First").await.unwrap());
        assert!(!store.set_title_if_unset(&conv.id, "Second").await.unwrap());

        let reloaded = store
            .get_conversation("alice", &conv.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reloaded.title.as_deref(), Some("First"));

        store.set_title(&conv.id, "Renamed").await.unwrap();
        let reloaded = store
            .get_conversation("alice", &conv.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reloaded.title.as_deref(), Some("Renamed"));
    }

    #[tokio::test]
    async fn test_owner_scoping() {
        let (_tmp, store) = sqlite_store().await;
        let conv = store.create_conversation("alice").await.unwrap();

        assert!(store
            .get_conversation("mallory", &conv.id)
            .await
            .unwrap()
            .is_none());
        assert!(!store.delete_conversation("mallory", &conv.id).await.unwrap());
        assert!(store.delete_conversation("alice", &conv.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_cascades_messages() {
        let (_tmp, store) = sqlite_store().await;
        let conv = store.create_conversation("alice").await.unwrap();
        store
            .append_message(&conv.id, Role::User, "hello", &[])
            .await
            .unwrap();

        store.delete_conversation("alice", &conv.id).await.unwrap();
        assert!(store.list_messages(&conv.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_in_memory_store_matches_contract() {
        let store = InMemoryStore::new();
        let conv = store.create_conversation("bob").await.unwrap();

        store
            .append_message(&conv.id, Role::User, "q", &[])
            .await
            .unwrap();
        assert_eq!(store.list_messages(&conv.id).await.unwrap().len(), 1);

        assert!(store.set_title_if_unset(&conv.id, "T").await.unwrap());
        assert!(!store.set_title_if_unset(&conv.id, "T2").await.unwrap());
        assert_eq!(
            store.list_conversations("bob").await.unwrap()[0]
                .title
                .as_deref(),
            Some("T")
        );
    }
}
