//! Relational-table queue storage.
//!
//! All queues share one message table and one session table, partitioned by
//! the `queue` column. Deletion is logical: a grabbed or polled record has
//! `valid = 0`. Size and byte totals are live aggregates, so no cache is kept.
//!
//! Every invalidation goes through a conditional
//! `UPDATE ... WHERE message_id = $2 AND valid = 1` and checks the affected
//! row count, so two consumers racing for the same record never both win.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::AnyPool;

use crate::infrastructure::database::is_valid_identifier;
use crate::message::Message;

use super::backend::{BackendError, MessageId, SessionCursorStore, StorageBackend};

/// Queue storage in a relational table.
///
/// Table structure:
/// - message table: `message_id, queue, payload, content_type, created_at,
///   options, bytes, valid`
/// - session table: `queue, session_id, last_message_id, last_used`
pub struct SqlBackend {
    /// Queue name used to partition the shared tables
    queue: String,
    pool: Option<AnyPool>,
    table: Option<String>,
    session_table: Option<String>,
}

impl SqlBackend {
    /// Create a backend for `queue`.
    ///
    /// Missing pieces are not an error here; operations fail with
    /// [`BackendError::NotConfigured`] until they are provided. Table names
    /// that are not plain identifiers are treated as missing.
    pub fn new(
        queue: impl Into<String>,
        pool: Option<AnyPool>,
        table: Option<String>,
        session_table: Option<String>,
    ) -> Self {
        let queue = queue.into();
        let checked = |name: Option<String>| {
            name.filter(|n| {
                let ok = is_valid_identifier(n);
                if !ok {
                    tracing::warn!(queue = %queue, table = %n, "Ignoring invalid table name");
                }
                ok
            })
        };
        let table = checked(table);
        let session_table = checked(session_table);

        Self {
            queue,
            pool,
            table,
            session_table,
        }
    }

    fn pool(&self) -> Result<&AnyPool, BackendError> {
        self.pool.as_ref().ok_or(BackendError::NotConfigured {
            backend: "database",
            missing: "database connection",
        })
    }

    fn table(&self) -> Result<(&AnyPool, &str), BackendError> {
        let table = self.table.as_deref().ok_or(BackendError::NotConfigured {
            backend: "database",
            missing: "table_name",
        })?;
        Ok((self.pool()?, table))
    }

    fn session_table(&self) -> Result<(&AnyPool, &str), BackendError> {
        let table = self
            .session_table
            .as_deref()
            .ok_or(BackendError::NotConfigured {
                backend: "database",
                missing: "session_table",
            })?;
        Ok((self.pool()?, table))
    }

    /// Invalidate one record if it is still valid.
    async fn invalidate(&self, id: MessageId) -> Result<bool, BackendError> {
        let (pool, table) = self.table()?;
        let result = sqlx::query(&format!(
            "UPDATE {table} SET valid = 0 WHERE queue = $1 AND message_id = $2 AND valid = 1"
        ))
        .bind(self.queue.as_str())
        .bind(id.value())
        .execute(pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl StorageBackend for SqlBackend {
    fn kind(&self) -> &'static str {
        "database"
    }

    async fn locate_next(&self) -> Result<Option<MessageId>, BackendError> {
        let (pool, table) = self.table()?;
        let row: Option<(i64,)> = sqlx::query_as(&format!(
            "SELECT message_id FROM {table} WHERE queue = $1 AND valid = 1 \
             ORDER BY message_id LIMIT 1"
        ))
        .bind(self.queue.as_str())
        .fetch_optional(pool)
        .await?;

        Ok(row.map(|(id,)| MessageId(id)))
    }

    async fn persist(&self, message: &Message) -> Result<MessageId, BackendError> {
        let (pool, table) = self.table()?;
        let options = serde_json::to_string(&message.options).unwrap_or_else(|_| "{}".into());

        let (id,): (i64,) = sqlx::query_as(&format!(
            "INSERT INTO {table} (queue, payload, content_type, created_at, options, bytes, valid) \
             VALUES ($1, $2, $3, $4, $5, $6, 1) RETURNING message_id"
        ))
        .bind(self.queue.as_str())
        .bind(message.payload.clone())
        .bind(message.content_type.clone())
        .bind(message.created_at.timestamp_micros())
        .bind(options)
        .bind(message.bytes() as i64)
        .fetch_one(pool)
        .await?;

        tracing::trace!(queue = %self.queue, message_id = id, "Message inserted");
        Ok(MessageId(id))
    }

    async fn read(&self, id: MessageId, delete: bool) -> Result<Option<Message>, BackendError> {
        let (pool, table) = self.table()?;
        let row: Option<(Vec<u8>, String, i64, String)> = sqlx::query_as(&format!(
            "SELECT payload, content_type, created_at, options FROM {table} \
             WHERE queue = $1 AND message_id = $2 AND valid = 1"
        ))
        .bind(self.queue.as_str())
        .bind(id.value())
        .fetch_optional(pool)
        .await?;

        let Some((payload, content_type, created_at, options)) = row else {
            return Ok(None);
        };

        let options: BTreeMap<String, String> =
            serde_json::from_str(&options).map_err(|e| BackendError::Corrupt {
                id,
                reason: format!("options: {}", e),
            })?;
        let created_at =
            DateTime::<Utc>::from_timestamp_micros(created_at).ok_or_else(|| {
                BackendError::Corrupt {
                    id,
                    reason: format!("created_at out of range: {}", created_at),
                }
            })?;

        if delete && !self.invalidate(id).await? {
            // Another consumer invalidated it between our select and update
            return Ok(None);
        }

        Ok(Some(Message {
            payload,
            content_type,
            created_at,
            options,
        }))
    }

    async fn clear(&self) -> Result<(), BackendError> {
        let (pool, table) = self.table()?;
        let result = sqlx::query(&format!(
            "UPDATE {table} SET valid = 0 WHERE queue = $1 AND valid = 1"
        ))
        .bind(self.queue.as_str())
        .execute(pool)
        .await?;

        tracing::debug!(
            queue = %self.queue,
            removed = result.rows_affected(),
            "Cleared queue table rows"
        );
        Ok(())
    }

    async fn size(&self) -> Result<u64, BackendError> {
        let (pool, table) = self.table()?;
        let (size,): (i64,) = sqlx::query_as(&format!(
            "SELECT COUNT(*) FROM {table} WHERE queue = $1 AND valid = 1"
        ))
        .bind(self.queue.as_str())
        .fetch_one(pool)
        .await?;

        Ok(size.max(0) as u64)
    }

    async fn bytes(&self) -> Result<u64, BackendError> {
        let (pool, table) = self.table()?;
        let (bytes,): (i64,) = sqlx::query_as(&format!(
            "SELECT CAST(COALESCE(SUM(bytes), 0) AS BIGINT) FROM {table} \
             WHERE queue = $1 AND valid = 1"
        ))
        .bind(self.queue.as_str())
        .fetch_one(pool)
        .await?;

        Ok(bytes.max(0) as u64)
    }

    fn cursors(&self) -> Option<&dyn SessionCursorStore> {
        Some(self)
    }
}

#[async_trait]
impl SessionCursorStore for SqlBackend {
    async fn load_watermark(&self, session_id: &str) -> Result<MessageId, BackendError> {
        let (pool, sessions) = self.session_table()?;

        sqlx::query(&format!(
            "INSERT INTO {sessions} (queue, session_id, last_message_id, last_used) \
             VALUES ($1, $2, 0, $3) ON CONFLICT (queue, session_id) DO NOTHING"
        ))
        .bind(self.queue.as_str())
        .bind(session_id)
        .bind(Utc::now().timestamp_micros())
        .execute(pool)
        .await?;

        let (last,): (i64,) = sqlx::query_as(&format!(
            "SELECT last_message_id FROM {sessions} WHERE queue = $1 AND session_id = $2"
        ))
        .bind(self.queue.as_str())
        .bind(session_id)
        .fetch_one(pool)
        .await?;

        Ok(MessageId(last))
    }

    async fn locate_after(&self, after: MessageId) -> Result<Option<MessageId>, BackendError> {
        let (pool, table) = self.table()?;
        let row: Option<(i64,)> = sqlx::query_as(&format!(
            "SELECT message_id FROM {table} WHERE queue = $1 AND valid = 1 AND message_id > $2 \
             ORDER BY message_id LIMIT 1"
        ))
        .bind(self.queue.as_str())
        .bind(after.value())
        .fetch_optional(pool)
        .await?;

        Ok(row.map(|(id,)| MessageId(id)))
    }

    async fn store_watermark(&self, session_id: &str, id: MessageId) -> Result<(), BackendError> {
        let (pool, sessions) = self.session_table()?;

        sqlx::query(&format!(
            "UPDATE {sessions} SET last_message_id = $3, last_used = $4 \
             WHERE queue = $1 AND session_id = $2"
        ))
        .bind(self.queue.as_str())
        .bind(session_id)
        .bind(id.value())
        .bind(Utc::now().timestamp_micros())
        .execute(pool)
        .await?;

        Ok(())
    }

    async fn grab(&self, id: MessageId) -> Result<bool, BackendError> {
        self.invalidate(id).await
    }
}
