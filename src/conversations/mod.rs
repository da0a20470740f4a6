//! SQLite-backed conversation store for multi-turn, multi-model threads.
//!
//! Messages are immutable once written; the store never updates past rows.
//! Retrieval is strict timestamp order, tie-broken by insertion order so
//! same-timestamp appends stay FIFO.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use serde_json::Value;
use std::path::Path;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct ConversationSummary {
    pub id: String,
    pub name: String,
    pub created_at: f64,
    pub updated_at: f64,
    pub metadata: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoredMessage {
    pub role: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub timestamp: f64,
    pub metadata: Value,
}

/// Projection of a stored message for replay into a chat request.
#[derive(Debug, Clone, Serialize)]
pub struct LlmMessage {
    pub role: String,
    pub content: String,
}

fn unix_now() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

pub struct ConversationStore {
    conn: std::sync::Mutex<Connection>,
}

impl ConversationStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create database directory: {}", parent.display())
                })?;
            }
        }
        let conn = Connection::open(db_path).with_context(|| {
            format!(
                "failed to open conversation database: {}",
                db_path.display()
            )
        })?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA busy_timeout=3000;
             PRAGMA foreign_keys=ON;",
        )?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                name TEXT,
                created_at REAL,
                updated_at REAL,
                metadata TEXT
            );
            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                conversation_id TEXT,
                role TEXT,
                content TEXT,
                model TEXT,
                timestamp REAL,
                metadata TEXT,
                FOREIGN KEY (conversation_id) REFERENCES conversations(id)
            );
            CREATE INDEX IF NOT EXISTS idx_messages_conversation
                ON messages(conversation_id, timestamp);",
        )?;
        info!("conversation store ready at {}", db_path.display());
        Ok(Self {
            conn: std::sync::Mutex::new(conn),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn create(&self, name: &str, metadata: Option<Value>) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let now = unix_now();
        self.lock().execute(
            "INSERT INTO conversations (id, name, created_at, updated_at, metadata)
             VALUES (?1, ?2, ?3, ?3, ?4)",
            params![
                id,
                name,
                now,
                metadata.unwrap_or_else(|| Value::Object(Default::default())).to_string()
            ],
        )?;
        info!("created conversation '{name}' ({id})");
        Ok(id)
    }

    /// Append a message and bump the conversation's `updated_at`, atomically.
    pub fn append(
        &self,
        conversation_id: &str,
        role: &str,
        content: &str,
        model: Option<&str>,
        metadata: Option<Value>,
    ) -> Result<String> {
        let message_id = Uuid::new_v4().to_string();
        let now = unix_now();
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;

        let known: Option<String> = tx
            .query_row(
                "SELECT id FROM conversations WHERE id=?1",
                params![conversation_id],
                |row| row.get(0),
            )
            .optional()?;
        if known.is_none() {
            anyhow::bail!("conversation not found: {conversation_id}");
        }

        tx.execute(
            "INSERT INTO messages (id, conversation_id, role, content, model, timestamp, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                message_id,
                conversation_id,
                role,
                content,
                model,
                now,
                metadata.unwrap_or_else(|| Value::Object(Default::default())).to_string()
            ],
        )?;
        tx.execute(
            "UPDATE conversations SET updated_at=?1 WHERE id=?2",
            params![now, conversation_id],
        )?;
        tx.commit()?;
        debug!("appended {role} message to conversation {conversation_id}");
        Ok(message_id)
    }

    /// Messages in chronological order. `limit` returns the tail window (the
    /// most recent N), still in chronological order.
    pub fn get(&self, conversation_id: &str, limit: Option<usize>) -> Result<Vec<StoredMessage>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT role, content, model, timestamp, metadata
             FROM messages WHERE conversation_id=?1
             ORDER BY timestamp ASC, rowid ASC",
        )?;
        let mut messages = stmt
            .query_map(params![conversation_id], |row| {
                let metadata_raw: String = row.get(4)?;
                Ok(StoredMessage {
                    role: row.get(0)?,
                    content: row.get(1)?,
                    model: row.get(2)?,
                    timestamp: row.get(3)?,
                    metadata: serde_json::from_str(&metadata_raw).unwrap_or(Value::Null),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        if let Some(limit) = limit {
            let skip = messages.len().saturating_sub(limit);
            messages.drain(..skip);
        }
        Ok(messages)
    }

    /// Project to `{role, content}` pairs for replay into a request.
    pub fn for_llm(&self, conversation_id: &str, limit: Option<usize>) -> Result<Vec<LlmMessage>> {
        Ok(self
            .get(conversation_id, limit)?
            .into_iter()
            .map(|m| LlmMessage {
                role: m.role,
                content: m.content,
            })
            .collect())
    }

    /// Discovery by name pattern, participating model, and/or age.
    pub fn search(
        &self,
        name_pattern: Option<&str>,
        model: Option<&str>,
        days_ago: Option<u64>,
    ) -> Result<Vec<ConversationSummary>> {
        let conn = self.lock();

        let mut sql = String::from(
            "SELECT DISTINCT c.id, c.name, c.created_at, c.updated_at, c.metadata
             FROM conversations c",
        );
        let mut clauses: Vec<String> = Vec::new();
        let mut args: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if let Some(model) = model {
            sql.push_str(" JOIN messages m ON c.id = m.conversation_id");
            clauses.push(format!("m.model = ?{}", args.len() + 1));
            args.push(Box::new(model.to_string()));
        }
        if let Some(pattern) = name_pattern {
            clauses.push(format!("c.name LIKE ?{}", args.len() + 1));
            args.push(Box::new(format!("%{pattern}%")));
        }
        if let Some(days) = days_ago {
            clauses.push(format!("c.created_at >= ?{}", args.len() + 1));
            args.push(Box::new(unix_now() - (days as f64) * 86_400.0));
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY c.updated_at DESC");

        let mut stmt = conn.prepare(&sql)?;
        let params_ref: Vec<&dyn rusqlite::types::ToSql> =
            args.iter().map(|arg| arg.as_ref()).collect();
        let rows = stmt
            .query_map(params_ref.as_slice(), |row| {
                let metadata_raw: String = row.get(4)?;
                Ok(ConversationSummary {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    created_at: row.get(2)?,
                    updated_at: row.get(3)?,
                    metadata: serde_json::from_str(&metadata_raw).unwrap_or(Value::Null),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}
