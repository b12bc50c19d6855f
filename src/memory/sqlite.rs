//! SQLite-backed conversation memory.
//!
//! A single-table store: one row per persisted turn, queried by user id
//! in recency order. Thread-safe via an internal `Mutex<Connection>`;
//! operations are short single statements, so blocking the async
//! executor for their duration is acceptable.

use super::{MemoryStore, TurnRole};
use crate::error::{CompanionError, Result};
use async_trait::async_trait;
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Mutex;
use tracing::info;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS conversation_turns (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id  TEXT NOT NULL,
    user_id     TEXT NOT NULL,
    role        TEXT NOT NULL,
    text        TEXT NOT NULL,
    created_at  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_turns_user_created
    ON conversation_turns (user_id, id);
";

/// SQLite conversation memory store.
pub struct SqliteMemoryStore {
    conn: Mutex<Connection>,
}

impl SqliteMemoryStore {
    /// Open (creating if needed) the database at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file or schema cannot be created.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .map_err(|e| CompanionError::Memory(format!("open failed: {e}")))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| CompanionError::Memory(format!("schema failed: {e}")))?;
        info!(path = %path.display(), "memory store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// An in-memory store (tests, demos without persistence).
    ///
    /// # Errors
    ///
    /// Returns an error if the in-memory database cannot be created.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| CompanionError::Memory(format!("open failed: {e}")))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| CompanionError::Memory(format!("schema failed: {e}")))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Total persisted turns (test helper).
    pub fn turn_count(&self) -> Result<usize> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM conversation_turns", [], |row| {
                row.get(0)
            })
            .map_err(|e| CompanionError::Memory(format!("count failed: {e}")))?;
        Ok(count as usize)
    }
}

#[async_trait]
impl MemoryStore for SqliteMemoryStore {
    async fn save_turn(
        &self,
        session_id: &str,
        user_id: &str,
        role: TurnRole,
        text: &str,
    ) -> Result<()> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(());
        }
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO conversation_turns (session_id, user_id, role, text, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                session_id,
                user_id,
                role.as_str(),
                text,
                chrono::Utc::now().to_rfc3339(),
            ],
        )
        .map_err(|e| CompanionError::Memory(format!("insert failed: {e}")))?;
        Ok(())
    }

    async fn recent_context(&self, user_id: &str, limit: usize) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn
            .prepare(
                "SELECT role, text FROM conversation_turns
                 WHERE user_id = ?1 ORDER BY id DESC LIMIT ?2",
            )
            .map_err(|e| CompanionError::Memory(format!("prepare failed: {e}")))?;
        let rows = stmt
            .query_map(params![user_id, limit as i64], |row| {
                let role: String = row.get(0)?;
                let text: String = row.get(1)?;
                Ok(format!("{role}: {text}"))
            })
            .map_err(|e| CompanionError::Memory(format!("query failed: {e}")))?;

        let mut lines: Vec<String> = Vec::new();
        for row in rows {
            lines.push(row.map_err(|e| CompanionError::Memory(format!("row failed: {e}")))?);
        }
        // Query returns newest first; context reads oldest first.
        lines.reverse();
        Ok(lines)
    }
}
