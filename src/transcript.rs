//! Append-only conversation transcripts, partitioned into sessions by inactivity

use crate::error::{MemoryError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Who produced a turn
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "user" => Ok(Role::User),
            "assistant" | "ai" => Ok(Role::Assistant),
            "system" => Ok(Role::System),
            other => Err(MemoryError::Validation(format!("unknown role: {other}"))),
        }
    }
}

/// Consolidation status of a turn
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    Pending,
    Consolidated,
    Failed,
}

impl TurnStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnStatus::Pending => "pending",
            TurnStatus::Consolidated => "consolidated",
            TurnStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for TurnStatus {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(TurnStatus::Pending),
            "consolidated" => Ok(TurnStatus::Consolidated),
            "failed" => Ok(TurnStatus::Failed),
            other => Err(MemoryError::Validation(format!("unknown turn status: {other}"))),
        }
    }
}

/// One logged message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TranscriptTurn {
    /// Global append order
    pub seq: i64,
    pub turn_id: String,
    pub user_id: String,
    pub session_id: String,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub status: TurnStatus,
    pub failure_reason: Option<String>,
}

impl TranscriptTurn {
    /// `role: content` line used for chunk text
    pub fn line(&self) -> String {
        format!("{}: {}", self.role, self.content)
    }
}

/// Transcript settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscriptConfig {
    /// Inactivity gap that starts a new session
    pub session_timeout_secs: i64,
}

impl Default for TranscriptConfig {
    fn default() -> Self {
        Self {
            session_timeout_secs: 30 * 60,
        }
    }
}

#[async_trait]
pub trait TranscriptLog: Send + Sync {
    async fn append(
        &self,
        user_id: &str,
        role: Role,
        content: &str,
        at: DateTime<Utc>,
    ) -> Result<TranscriptTurn>;

    /// Users with at least one pending turn
    async fn pending_users(&self) -> Result<Vec<String>>;

    /// Pending turns of a user, in append order
    async fn unconsolidated(&self, user_id: &str) -> Result<Vec<TranscriptTurn>>;

    async fn mark_consolidated(&self, turn_ids: &[String], at: DateTime<Utc>) -> Result<()>;

    async fn mark_failed(&self, turn_ids: &[String], reason: &str, at: DateTime<Utc>)
        -> Result<()>;

    /// Failed turns of a user kept for review
    async fn failed(&self, user_id: &str) -> Result<Vec<TranscriptTurn>>;
}

/// SQLite transcript log
#[derive(Clone)]
pub struct SqliteTranscriptLog {
    pool: SqlitePool,
    config: TranscriptConfig,
}

impl std::fmt::Debug for SqliteTranscriptLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteTranscriptLog")
            .field("pool", &"<SqlitePool>")
            .field("config", &self.config)
            .finish()
    }
}

const TURN_COLUMNS: &str =
    "seq, turn_id, user_id, session_id, role, content, created_at, status, failure_reason";

impl SqliteTranscriptLog {
    pub async fn open(path: impl AsRef<Path>, config: TranscriptConfig) -> Result<Arc<Self>> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| MemoryError::Connectivity(format!("failed to open transcripts: {e}")))?;

        Self::with_pool(pool, config).await
    }

    /// Create an in-memory log for testing
    pub async fn in_memory(config: TranscriptConfig) -> Result<Arc<Self>> {
        let options = SqliteConnectOptions::new()
            .in_memory(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        Self::with_pool(pool, config).await
    }

    async fn with_pool(pool: SqlitePool, config: TranscriptConfig) -> Result<Arc<Self>> {
        sqlx::migrate!("./migrations/transcript").run(&pool).await?;
        Ok(Arc::new(Self { pool, config }))
    }

    async fn turns_with_status(&self, user_id: &str, status: TurnStatus) -> Result<Vec<TranscriptTurn>> {
        let query_str = format!(
            "SELECT {TURN_COLUMNS} FROM transcript_turns \
             WHERE user_id = ? AND status = ? ORDER BY seq"
        );
        let rows = sqlx::query(&query_str)
            .bind(user_id)
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(row_to_turn).collect()
    }

    async fn set_status(
        &self,
        turn_ids: &[String],
        status: TurnStatus,
        reason: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        if turn_ids.is_empty() {
            return Ok(());
        }
        let placeholders = vec!["?"; turn_ids.len()].join(",");
        let query_str = format!(
            "UPDATE transcript_turns SET status = ?, failure_reason = ?, resolved_at = ? \
             WHERE status = 'pending' AND turn_id IN ({placeholders})"
        );
        let mut query = sqlx::query(&query_str)
            .bind(status.as_str())
            .bind(reason)
            .bind(at);
        for id in turn_ids {
            query = query.bind(id);
        }
        let result = query.execute(&self.pool).await?;
        debug!(
            status = status.as_str(),
            turns = result.rows_affected(),
            "transcript turns marked"
        );
        Ok(())
    }
}

#[async_trait]
impl TranscriptLog for SqliteTranscriptLog {
    async fn append(
        &self,
        user_id: &str,
        role: Role,
        content: &str,
        at: DateTime<Utc>,
    ) -> Result<TranscriptTurn> {
        let mut tx = self.pool.begin().await?;

        let last = sqlx::query(
            "SELECT session_id, created_at FROM transcript_turns \
             WHERE user_id = ? ORDER BY seq DESC LIMIT 1",
        )
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?;

        let timeout = Duration::seconds(self.config.session_timeout_secs);
        let current = match last {
            Some(row) => {
                let last_at: DateTime<Utc> = row.try_get("created_at")?;
                if at - last_at > timeout {
                    None
                } else {
                    Some(row.try_get::<String, _>("session_id")?)
                }
            }
            None => None,
        };

        let session_id = match current {
            Some(session_id) => {
                sqlx::query("UPDATE transcript_sessions SET last_turn_at = ? WHERE session_id = ?")
                    .bind(at)
                    .bind(&session_id)
                    .execute(&mut *tx)
                    .await?;
                session_id
            }
            None => {
                let session_id = Uuid::new_v4().to_string();
                sqlx::query(
                    "INSERT INTO transcript_sessions (session_id, user_id, started_at, last_turn_at) \
                     VALUES (?, ?, ?, ?)",
                )
                .bind(&session_id)
                .bind(user_id)
                .bind(at)
                .bind(at)
                .execute(&mut *tx)
                .await?;
                debug!(user_id, session_id = %session_id, "transcript session started");
                session_id
            }
        };

        let turn_id = Uuid::new_v4().to_string();
        let result = sqlx::query(
            r#"
            INSERT INTO transcript_turns (turn_id, user_id, session_id, role, content, created_at, status)
            VALUES (?, ?, ?, ?, ?, ?, 'pending')
            "#,
        )
        .bind(&turn_id)
        .bind(user_id)
        .bind(&session_id)
        .bind(role.as_str())
        .bind(content)
        .bind(at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(TranscriptTurn {
            seq: result.last_insert_rowid(),
            turn_id,
            user_id: user_id.to_string(),
            session_id,
            role,
            content: content.to_string(),
            created_at: at,
            status: TurnStatus::Pending,
            failure_reason: None,
        })
    }

    async fn pending_users(&self) -> Result<Vec<String>> {
        let users = sqlx::query_scalar(
            "SELECT DISTINCT user_id FROM transcript_turns WHERE status = 'pending' ORDER BY user_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(users)
    }

    async fn unconsolidated(&self, user_id: &str) -> Result<Vec<TranscriptTurn>> {
        self.turns_with_status(user_id, TurnStatus::Pending).await
    }

    async fn mark_consolidated(&self, turn_ids: &[String], at: DateTime<Utc>) -> Result<()> {
        self.set_status(turn_ids, TurnStatus::Consolidated, None, at)
            .await
    }

    async fn mark_failed(
        &self,
        turn_ids: &[String],
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.set_status(turn_ids, TurnStatus::Failed, Some(reason), at)
            .await
    }

    async fn failed(&self, user_id: &str) -> Result<Vec<TranscriptTurn>> {
        self.turns_with_status(user_id, TurnStatus::Failed).await
    }
}

/// Helper: Convert database row to TranscriptTurn
fn row_to_turn(row: &SqliteRow) -> Result<TranscriptTurn> {
    let role: String = row.try_get("role")?;
    let status: String = row.try_get("status")?;

    Ok(TranscriptTurn {
        seq: row.try_get("seq")?,
        turn_id: row.try_get("turn_id")?,
        user_id: row.try_get("user_id")?,
        session_id: row.try_get("session_id")?,
        role: role.parse()?,
        content: row.try_get("content")?,
        created_at: row.try_get("created_at")?,
        status: status.parse()?,
        failure_reason: row.try_get("failure_reason").unwrap_or_default(),
    })
}
