//! Health endpoint.

use axum::{extract::State, Json};
use serde::Serialize;

use crate::server::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<DatabaseHealthResponse>,
    pub queues: Vec<QueueHealthResponse>,
}

#[derive(Debug, Serialize)]
pub struct DatabaseHealthResponse {
    pub url: String,
    pub pool_size: u32,
    pub idle_connections: u32,
}

#[derive(Debug, Serialize)]
pub struct QueueHealthResponse {
    pub path: String,
    pub backend: String,
    pub listeners: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// GET /_fmq/health
///
/// Reports `degraded` when any queue fails to produce its statistics.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let mut queues = Vec::new();
    for path in state.manager.queue_names() {
        // Deleted since the names were listed
        let Ok(managed) = state.manager.queue(&path) else {
            continue;
        };
        let queue = managed.queue();

        let (size, bytes, error) = match queue.stats().await {
            Ok(stats) => (Some(stats.size), Some(stats.bytes), None),
            Err(e) => (None, None, Some(e.to_string())),
        };
        queues.push(QueueHealthResponse {
            path,
            backend: queue.backend_kind().to_string(),
            listeners: managed.accepts_listeners(),
            size,
            bytes,
            error,
        });
    }

    let database = state.database.as_ref().map(|db| DatabaseHealthResponse {
        url: db.database_url_masked(),
        pool_size: db.pool().size(),
        idle_connections: db.pool().num_idle() as u32,
    });

    let status = if queues.iter().any(|q| q.error.is_some()) {
        "degraded"
    } else {
        "healthy"
    };

    Json(HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        database,
        queues,
    })
}
