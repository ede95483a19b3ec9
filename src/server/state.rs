use std::sync::Arc;
use std::time::Instant;

use crate::config::Settings;
use crate::infrastructure::database::DatabasePool;
use crate::manager::QueueManager;

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub manager: Arc<QueueManager>,
    pub database: Option<DatabasePool>,
    pub start_time: Instant,
}

impl AppState {
    /// State with an empty queue manager built from `settings`.
    pub fn new(settings: Settings, database: Option<DatabasePool>) -> Self {
        let manager = Arc::new(QueueManager::from_settings(&settings, database.clone()));
        Self::with_manager(settings, manager, database)
    }

    pub fn with_manager(
        settings: Settings,
        manager: Arc<QueueManager>,
        database: Option<DatabasePool>,
    ) -> Self {
        Self {
            settings: Arc::new(settings),
            manager,
            database,
            start_time: Instant::now(),
        }
    }
}
