//! Database connection pool shared by every database-backed queue.

use std::time::Duration;

use sqlx::any::AnyPoolOptions;
use sqlx::AnyPool;
use thiserror::Error;

use crate::config::DatabaseConfig;

/// Errors that can occur with the database pool.
#[derive(Debug, Error)]
pub enum DatabasePoolError {
    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Unsupported database URL scheme: {0}")]
    UnsupportedUrl(String),

    #[error("Invalid table name: {0}")]
    InvalidTableName(String),
}

/// SQL dialect behind the pool. Only DDL differs between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Postgres,
    Sqlite,
}

impl Dialect {
    /// Detect the dialect from a connection URL.
    pub fn from_url(url: &str) -> Option<Self> {
        let scheme = url.split(':').next()?;
        match scheme {
            "postgres" | "postgresql" => Some(Dialect::Postgres),
            "sqlite" => Some(Dialect::Sqlite),
            _ => None,
        }
    }

    fn message_table_ddl(self, table: &str) -> String {
        let (id_column, payload_type) = match self {
            Dialect::Postgres => ("message_id BIGSERIAL PRIMARY KEY", "BYTEA"),
            Dialect::Sqlite => ("message_id INTEGER PRIMARY KEY AUTOINCREMENT", "BLOB"),
        };
        format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                {id_column},
                queue TEXT NOT NULL,
                payload {payload_type} NOT NULL,
                content_type TEXT NOT NULL,
                created_at BIGINT NOT NULL,
                options TEXT NOT NULL,
                bytes BIGINT NOT NULL,
                valid SMALLINT NOT NULL DEFAULT 1
            )"
        )
    }
}

/// Table and column names are spliced into SQL text, so only plain
/// identifiers are accepted.
pub fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Database connection pool.
#[derive(Clone)]
pub struct DatabasePool {
    pool: AnyPool,
    dialect: Dialect,
    /// Database URL (for logging purposes)
    database_url: String,
}

impl DatabasePool {
    /// Create a new pool from configuration.
    pub async fn new(config: &DatabaseConfig) -> Result<Self, DatabasePoolError> {
        let dialect = Dialect::from_url(&config.url)
            .ok_or_else(|| DatabasePoolError::UnsupportedUrl(mask_url(&config.url)))?;

        sqlx::any::install_default_drivers();

        let pool = AnyPoolOptions::new()
            .max_connections(config.pool_size)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_seconds))
            .idle_timeout(Duration::from_secs(config.idle_timeout_seconds))
            .connect(&config.url)
            .await?;

        tracing::info!(
            pool_size = config.pool_size,
            dialect = ?dialect,
            url = %mask_url(&config.url),
            "Database connection pool created"
        );

        Ok(Self {
            pool,
            dialect,
            database_url: config.url.clone(),
        })
    }

    /// Get a reference to the underlying pool.
    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Create the message and session tables if they do not exist yet.
    pub async fn ensure_schema(
        &self,
        table: &str,
        session_table: &str,
    ) -> Result<(), DatabasePoolError> {
        for name in [table, session_table] {
            if !is_valid_identifier(name) {
                return Err(DatabasePoolError::InvalidTableName(name.to_string()));
            }
        }

        sqlx::query(&self.dialect.message_table_ddl(table))
            .execute(&self.pool)
            .await?;

        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS {table}_queue_idx ON {table} (queue, valid, message_id)"
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {session_table} (
                queue TEXT NOT NULL,
                session_id TEXT NOT NULL,
                last_message_id BIGINT NOT NULL,
                last_used BIGINT NOT NULL,
                PRIMARY KEY (queue, session_id)
            )"
        ))
        .execute(&self.pool)
        .await?;

        tracing::debug!(table = %table, session_table = %session_table, "Queue tables ready");
        Ok(())
    }

    /// Get the database URL (masked for logging).
    pub fn database_url_masked(&self) -> String {
        mask_url(&self.database_url)
    }

    /// Close the pool gracefully.
    pub async fn close(&self) {
        self.pool.close().await;
        tracing::info!("Database connection pool closed");
    }
}

/// Mask the password in a connection URL.
fn mask_url(url: &str) -> String {
    if let Some(at_pos) = url.find('@') {
        if let Some(colon_pos) = url[..at_pos].rfind(':') {
            let prefix = &url[..colon_pos + 1];
            let suffix = &url[at_pos..];
            return format!("{}***{}", prefix, suffix);
        }
    }
    url.to_string()
}
