use chrono::{DateTime, Utc};
use shared_types::{ConversationId, RuntimeSelection};
use sqlx::SqlitePool;
use tracing::debug;

/// Last known backend session per conversation, plus an optional pinned
/// runtime.
///
/// Schema (created on [`SessionRegistry::migrate`]):
/// ```sql
/// CREATE TABLE IF NOT EXISTS conversation_sessions (
///     conversation_id TEXT PRIMARY KEY,
///     session_id      TEXT,            -- NULL until the first frame
///     runtime         TEXT,            -- RuntimeSelection as JSON, NULL = default
///     updated_at      TEXT NOT NULL
/// );
/// ```
///
/// The stored session id may be stale; the worker revalidates it.
#[derive(Debug, Clone)]
pub struct SessionRegistry {
    pool: SqlitePool,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct SessionRecord {
    pub conversation_id: ConversationId,
    pub session_id: Option<String>,
    pub runtime: Option<RuntimeSelection>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("session registry query failed: {0}")]
    Db(#[from] sqlx::Error),
    #[error("stored runtime for {conversation_id} is unreadable: {source}")]
    CorruptRuntime {
        conversation_id: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode runtime selection: {0}")]
    Encode(#[from] serde_json::Error),
}

impl SessionRegistry {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the table if it does not exist.
    pub async fn migrate(&self) -> Result<(), RegistryError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS conversation_sessions (
                conversation_id TEXT PRIMARY KEY,
                session_id      TEXT,
                runtime         TEXT,
                updated_at      TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// `None` for a conversation that has never had a turn.
    pub async fn get(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Option<SessionRecord>, RegistryError> {
        let row: Option<(Option<String>, Option<String>, DateTime<Utc>)> = sqlx::query_as(
            "SELECT session_id, runtime, updated_at
             FROM conversation_sessions WHERE conversation_id = ?",
        )
        .bind(conversation_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        let Some((session_id, runtime_json, updated_at)) = row else {
            return Ok(None);
        };
        let runtime = runtime_json
            .map(|raw| serde_json::from_str::<RuntimeSelection>(&raw))
            .transpose()
            .map_err(|source| RegistryError::CorruptRuntime {
                conversation_id: conversation_id.to_string(),
                source,
            })?;

        Ok(Some(SessionRecord {
            conversation_id: conversation_id.clone(),
            session_id,
            runtime,
            updated_at,
        }))
    }

    /// Store the session id reported by a result frame.
    pub async fn record_session(
        &self,
        conversation_id: &ConversationId,
        session_id: &str,
    ) -> Result<(), RegistryError> {
        sqlx::query(
            "INSERT INTO conversation_sessions (conversation_id, session_id, updated_at)
             VALUES (?, ?, ?)
             ON CONFLICT(conversation_id) DO UPDATE
             SET session_id = excluded.session_id, updated_at = excluded.updated_at",
        )
        .bind(conversation_id.as_str())
        .bind(session_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        debug!(%conversation_id, session_id, "session recorded");
        Ok(())
    }

    /// Pin a conversation to a runtime; applies from its next worker launch.
    pub async fn set_runtime(
        &self,
        conversation_id: &ConversationId,
        runtime: &RuntimeSelection,
    ) -> Result<(), RegistryError> {
        let encoded = serde_json::to_string(runtime)?;
        sqlx::query(
            "INSERT INTO conversation_sessions (conversation_id, runtime, updated_at)
             VALUES (?, ?, ?)
             ON CONFLICT(conversation_id) DO UPDATE
             SET runtime = excluded.runtime, updated_at = excluded.updated_at",
        )
        .bind(conversation_id.as_str())
        .bind(encoded)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        debug!(%conversation_id, runtime = runtime.name(), "runtime pinned");
        Ok(())
    }
}
