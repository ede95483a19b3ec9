//! Storage backend factory

use std::sync::Arc;

use crate::config::{BackendKind, QueueDefinition};
use crate::infrastructure::database::DatabasePool;

use super::backend::{BackendError, StorageBackend};
use super::file_backend::FileBackend;
use super::memory_backend::MemoryBackend;
use super::sql_backend::SqlBackend;

/// Create the storage backend a queue definition asks for.
///
/// - `File`: opens (and creates) the definition's folder
/// - `Database`: uses the shared pool; without one the backend is built
///   unconfigured and reports that on first use
/// - `Memory`: an empty in-memory store
///
/// # Errors
///
/// Returns `BackendError::Io` if an existing file queue folder cannot be
/// created or scanned.
pub async fn create_backend(
    definition: &QueueDefinition,
    database: Option<&DatabasePool>,
) -> Result<Arc<dyn StorageBackend>, BackendError> {
    match definition.backend {
        BackendKind::File => {
            tracing::info!(
                backend = "file",
                queue = %definition.path,
                folder = ?definition.folder,
                "Creating file queue backend"
            );
            Ok(Arc::new(FileBackend::open(definition.folder.clone()).await?))
        }
        BackendKind::Database => {
            if database.is_none() {
                tracing::warn!(
                    queue = %definition.path,
                    "Database backend requested but no database is configured"
                );
            }
            tracing::info!(
                backend = "database",
                queue = %definition.path,
                table = ?definition.table_name,
                "Creating database queue backend"
            );
            Ok(Arc::new(SqlBackend::new(
                definition.path.clone(),
                database.map(|db| db.pool().clone()),
                definition.table_name.clone(),
                definition.session_table.clone(),
            )))
        }
        BackendKind::Memory => {
            tracing::info!(backend = "memory", queue = %definition.path, "Creating memory queue backend");
            Ok(Arc::new(MemoryBackend::new()))
        }
    }
}
