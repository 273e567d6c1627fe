use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use log::info;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::types::Json;
use sqlx::Row;
use uuid::Uuid;

use crate::models::conversation::{
    derive_title, ConversationThread, NewTurn, ResultRow, Turn, TurnMetadata, TurnRole,
};

const SCHEMA: &[&str] = &[
    r"
    CREATE TABLE IF NOT EXISTS chat_threads (
        id BLOB PRIMARY KEY,
        user_id TEXT NOT NULL,
        title TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS chat_turns (
        id BLOB PRIMARY KEY,
        thread_id BLOB NOT NULL REFERENCES chat_threads(id) ON DELETE CASCADE,
        role TEXT NOT NULL,
        content TEXT NOT NULL,
        query_generated TEXT,
        query_results TEXT,
        metadata TEXT,
        created_at TEXT NOT NULL
    )
    ",
    "CREATE INDEX IF NOT EXISTS idx_chat_turns_thread ON chat_turns(thread_id)",
];

/// Chat transcripts in SQLite
#[derive(Clone, Debug)]
pub struct SqliteChatStore {
    pool: SqlitePool,
}

impl SqliteChatStore {
    /// Open (creating if needed) the transcript database and its tables
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("invalid chat database URL '{}'", database_url))?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("failed to open chat database")?;

        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&pool)
                .await
                .context("failed to create chat tables")?;
        }
        info!("Chat transcript store ready");
        Ok(Self { pool })
    }

    pub async fn create_thread(&self, user_id: &str, title: Option<String>) -> Result<ConversationThread> {
        let thread = ConversationThread::new(user_id.to_string(), title);
        sqlx::query(
            "INSERT INTO chat_threads (id, user_id, title, created_at, updated_at) VALUES ($1, $2, $3, $4, $4)",
        )
        .bind(thread.id)
        .bind(&thread.user_id)
        .bind(&thread.title)
        .bind(thread.created_at)
        .execute(&self.pool)
        .await
        .context("Failed to create thread")?;
        Ok(thread)
    }

    pub async fn get_thread(&self, thread_id: Uuid) -> Result<Option<ConversationThread>> {
        let row = sqlx::query("SELECT id, user_id, title, created_at, updated_at FROM chat_threads WHERE id = $1")
            .bind(thread_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to get thread")?;

        row.map(|r| -> Result<ConversationThread> {
            Ok(ConversationThread {
                id: r.try_get("id")?,
                user_id: r.try_get("user_id")?,
                title: r.try_get("title")?,
                created_at: r.try_get::<DateTime<Utc>, _>("created_at")?,
                updated_at: r.try_get::<DateTime<Utc>, _>("updated_at")?,
            })
        })
        .transpose()
    }

    pub async fn delete_thread(&self, thread_id: Uuid) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM chat_turns WHERE thread_id = $1")
            .bind(thread_id)
            .execute(&mut *tx)
            .await
            .context("Failed to delete turns")?;
        let deleted = sqlx::query("DELETE FROM chat_threads WHERE id = $1")
            .bind(thread_id)
            .execute(&mut *tx)
            .await
            .context("Failed to delete thread")?
            .rows_affected();
        tx.commit().await?;
        Ok(deleted > 0)
    }

    pub async fn clear_turns(&self, thread_id: Uuid) -> Result<()> {
        if self.get_thread(thread_id).await?.is_none() {
            return Err(anyhow!("Thread {} not found", thread_id));
        }
        sqlx::query("DELETE FROM chat_turns WHERE thread_id = $1")
            .bind(thread_id)
            .execute(&self.pool)
            .await
            .context("Failed to clear turns")?;
        Ok(())
    }

    pub async fn append_turn(&self, thread_id: Uuid, new_turn: NewTurn) -> Result<Turn> {
        new_turn.validate().map_err(|e| anyhow!(e))?;
        let mut tx = self.pool.begin().await?;

        let title: Option<Option<String>> = sqlx::query_scalar("SELECT title FROM chat_threads WHERE id = $1")
            .bind(thread_id)
            .fetch_optional(&mut *tx)
            .await
            .context("Failed to look up thread")?;
        let title = title.ok_or_else(|| anyhow!("Thread {} not found", thread_id))?;

        let new_title = match title {
            None if new_turn.role == TurnRole::User => derive_title(&new_turn.content),
            existing => existing,
        };

        let turn = new_turn.into_turn(thread_id);
        sqlx::query("UPDATE chat_threads SET title = $1, updated_at = $2 WHERE id = $3")
            .bind(&new_title)
            .bind(turn.created_at)
            .bind(thread_id)
            .execute(&mut *tx)
            .await
            .context("Failed to touch thread")?;

        sqlx::query(
            r"
            INSERT INTO chat_turns (id, thread_id, role, content, query_generated, query_results, metadata, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ",
        )
        .bind(turn.id)
        .bind(thread_id)
        .bind(turn.role.as_str())
        .bind(&turn.content)
        .bind(&turn.query_generated)
        .bind(turn.query_results.as_ref().map(Json))
        .bind(turn.metadata.as_ref().map(Json))
        .bind(turn.created_at)
        .execute(&mut *tx)
        .await
        .context("Failed to append turn")?;

        tx.commit().await?;
        Ok(turn)
    }

    pub async fn list_turns(&self, thread_id: Uuid) -> Result<Vec<Turn>> {
        let rows = sqlx::query(
            r"
            SELECT id, thread_id, role, content, query_generated, query_results, metadata, created_at
            FROM chat_turns
            WHERE thread_id = $1
            ORDER BY rowid ASC
            ",
        )
        .bind(thread_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list turns")?;

        rows.iter().map(turn_from_row).collect()
    }

    pub async fn last_turn(&self, thread_id: Uuid, role: Option<TurnRole>) -> Result<Option<Turn>> {
        let row = sqlx::query(
            r"
            SELECT id, thread_id, role, content, query_generated, query_results, metadata, created_at
            FROM chat_turns
            WHERE thread_id = $1 AND ($2 IS NULL OR role = $2)
            ORDER BY rowid DESC
            LIMIT 1
            ",
        )
        .bind(thread_id)
        .bind(role.map(|r| r.as_str()))
        .fetch_optional(&self.pool)
        .await
        .context("Failed to get last turn")?;

        row.as_ref().map(turn_from_row).transpose()
    }
}

fn turn_from_row(row: &SqliteRow) -> Result<Turn> {
    let role: String = row.try_get("role")?;
    let query_results: Option<Json<Vec<ResultRow>>> = row.try_get("query_results")?;
    let metadata: Option<Json<TurnMetadata>> = row.try_get("metadata")?;
    Ok(Turn {
        id: row.try_get("id")?,
        thread_id: row.try_get("thread_id")?,
        role: TurnRole::parse(&role).ok_or_else(|| anyhow!("unknown turn role '{}'", role))?,
        content: row.try_get("content")?,
        query_generated: row.try_get("query_generated")?,
        query_results: query_results.map(|j| j.0),
        metadata: metadata.map(|j| j.0),
        created_at: row.try_get("created_at")?,
    })
}
