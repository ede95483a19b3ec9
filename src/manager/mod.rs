//! Registry of named queues.
//!
//! Queues are addressed by request path. They are registered at startup from
//! configuration or created on first put from the default template, and
//! looked up concurrently at request time.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;

use crate::config::{BackendKind, QueueDefaults, QueueDefinition, Settings};
use crate::infrastructure::database::{DatabasePool, DatabasePoolError};
use crate::listener::{Delivery, ListenerRegistry, TcpNotifier, WakeupNotifier};
use crate::message::Message;
use crate::metrics::QueueMetrics;
use crate::queue::{GrabOutcome, PeekedMessage, Queue, QueueError, QueueLimits, QueueStats};
use crate::storage::{create_backend, BackendError, MessageId};

/// Path prefix reserved for the broker's own endpoints.
pub const RESERVED_PREFIX: &str = "/_fmq";

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("Queue '{0}' does not exist")]
    QueueNotFound(String),

    #[error("Queue '{0}' already exists")]
    QueueExists(String),

    #[error("Invalid queue path '{path}': {reason}")]
    InvalidQueuePath { path: String, reason: &'static str },

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("Database setup failed: {0}")]
    Database(#[from] DatabasePoolError),
}

/// A registered queue, with or without listener support.
pub enum ManagedQueue {
    Plain(Queue),
    Listening(ListenerRegistry),
}

impl ManagedQueue {
    pub fn queue(&self) -> &Queue {
        match self {
            ManagedQueue::Plain(queue) => queue,
            ManagedQueue::Listening(registry) => registry.queue(),
        }
    }

    pub fn accepts_listeners(&self) -> bool {
        matches!(self, ManagedQueue::Listening(_))
    }

    /// Poll, registering `listener` if the queue is empty and listening.
    pub async fn poll(&self, listener: Option<SocketAddr>) -> Result<Delivery<Message>, QueueError> {
        match self {
            ManagedQueue::Plain(queue) => Ok(queue.poll().await?.map_or(Delivery::Empty, Delivery::Message)),
            ManagedQueue::Listening(registry) => registry.poll(listener).await,
        }
    }

    pub async fn peek(
        &self,
        session_id: &str,
        listener: Option<SocketAddr>,
    ) -> Result<Delivery<PeekedMessage>, QueueError> {
        match self {
            ManagedQueue::Plain(queue) => Ok(queue
                .peek(session_id)
                .await?
                .map_or(Delivery::Empty, Delivery::Message)),
            ManagedQueue::Listening(registry) => registry.peek(session_id, listener).await,
        }
    }

    pub async fn put(&self, message: Message) -> Result<MessageId, QueueError> {
        match self {
            ManagedQueue::Plain(queue) => queue.put(message).await,
            ManagedQueue::Listening(registry) => registry.put(message).await,
        }
    }
}

/// Concurrent map from queue path to queue.
pub struct QueueManager {
    queues: DashMap<String, Arc<ManagedQueue>>,
    defaults: QueueDefaults,
    database: Option<DatabasePool>,
    notifier: Arc<dyn WakeupNotifier>,
}

impl QueueManager {
    pub fn new(
        defaults: QueueDefaults,
        database: Option<DatabasePool>,
        notifier: Arc<dyn WakeupNotifier>,
    ) -> Self {
        Self {
            queues: DashMap::new(),
            defaults,
            database,
            notifier,
        }
    }

    /// Manager with a TCP notifier using the configured wakeup timeout.
    pub fn from_settings(settings: &Settings, database: Option<DatabasePool>) -> Self {
        let notifier = TcpNotifier::new(Duration::from_millis(settings.listener.connect_timeout_ms));
        Self::new(settings.defaults.clone(), database, Arc::new(notifier))
    }

    /// Register a queue.
    ///
    /// Database queues get their tables created when the pool is available
    /// and both table names are set. Otherwise the backend reports its
    /// missing configuration on first use.
    pub async fn setup_queue(
        &self,
        definition: &QueueDefinition,
    ) -> Result<Arc<ManagedQueue>, ManagerError> {
        validate_path(&definition.path)?;
        if self.queues.contains_key(&definition.path) {
            return Err(ManagerError::QueueExists(definition.path.clone()));
        }

        let queue = self.build_queue(definition).await?;
        tracing::debug!(
            queue = %definition.path,
            max_messages = ?definition.max_messages,
            max_size = ?definition.max_size,
            "Queue limits"
        );
        self.register(queue, definition.listeners)
    }

    /// Register an already built queue under its name.
    pub fn register(&self, queue: Queue, listeners: bool) -> Result<Arc<ManagedQueue>, ManagerError> {
        validate_path(queue.name())?;
        let path = queue.name().to_string();
        let backend = queue.backend_kind();

        let managed = Arc::new(if listeners {
            ManagedQueue::Listening(ListenerRegistry::new(queue, self.notifier.clone()))
        } else {
            ManagedQueue::Plain(queue)
        });

        match self.queues.entry(path.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(ManagerError::QueueExists(path));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(managed.clone());
            }
        }

        QueueMetrics::set_registered_queues(self.queues.len());
        tracing::info!(
            queue = %path,
            backend = backend,
            listeners = listeners,
            "Queue registered"
        );
        Ok(managed)
    }

    async fn build_queue(&self, definition: &QueueDefinition) -> Result<Queue, ManagerError> {
        if definition.backend == BackendKind::Database {
            if let (Some(db), Some(table), Some(sessions)) = (
                &self.database,
                &definition.table_name,
                &definition.session_table,
            ) {
                db.ensure_schema(table, sessions).await?;
            }
        }

        let backend = create_backend(definition, self.database.as_ref()).await?;
        let limits = QueueLimits {
            max_messages: definition.max_messages,
            max_size: definition.max_size,
        };
        Ok(Queue::new(definition.path.clone(), limits, backend))
    }

    pub fn queue(&self, path: &str) -> Result<Arc<ManagedQueue>, ManagerError> {
        self.queues
            .get(path)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ManagerError::QueueNotFound(path.to_string()))
    }

    /// Registered queue paths, sorted.
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.queues.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }

    pub async fn poll(
        &self,
        path: &str,
        listener: Option<SocketAddr>,
    ) -> Result<Delivery<Message>, ManagerError> {
        Ok(self.queue(path)?.poll(listener).await?)
    }

    /// Put a message, creating the queue from the defaults if allowed.
    pub async fn put(&self, path: &str, message: Message) -> Result<MessageId, ManagerError> {
        Ok(self.queue_for_put(path).await?.put(message).await?)
    }

    /// The queue at `path`, created from the defaults if it is missing and
    /// auto-creation is enabled.
    pub async fn queue_for_put(&self, path: &str) -> Result<Arc<ManagedQueue>, ManagerError> {
        match self.queue(path) {
            Err(ManagerError::QueueNotFound(_)) if self.defaults.auto_create => {
                self.auto_create(path).await
            }
            other => other,
        }
    }

    async fn auto_create(&self, path: &str) -> Result<Arc<ManagedQueue>, ManagerError> {
        let definition = self.defaults.definition_for(path);
        match self.setup_queue(&definition).await {
            Ok(queue) => {
                tracing::info!(queue = %path, "Queue created on first put");
                Ok(queue)
            }
            // Another request created it first
            Err(ManagerError::QueueExists(_)) => self.queue(path),
            Err(e) => Err(e),
        }
    }

    pub async fn peek(
        &self,
        path: &str,
        session_id: &str,
        listener: Option<SocketAddr>,
    ) -> Result<Delivery<PeekedMessage>, ManagerError> {
        Ok(self.queue(path)?.peek(session_id, listener).await?)
    }

    pub async fn peek_grab(
        &self,
        path: &str,
        session_id: &str,
        id: MessageId,
    ) -> Result<GrabOutcome, ManagerError> {
        Ok(self.queue(path)?.queue().peek_grab(session_id, id).await?)
    }

    pub async fn clear_queue(&self, path: &str) -> Result<(), ManagerError> {
        Ok(self.queue(path)?.queue().clear().await?)
    }

    /// Unregister a queue. Stored messages stay in the backend.
    pub fn delete_queue(&self, path: &str) -> Result<(), ManagerError> {
        self.queues
            .remove(path)
            .ok_or_else(|| ManagerError::QueueNotFound(path.to_string()))?;

        QueueMetrics::set_registered_queues(self.queues.len());
        tracing::info!(queue = %path, "Queue deleted");
        Ok(())
    }

    pub async fn stats(&self, path: &str) -> Result<QueueStats, ManagerError> {
        Ok(self.queue(path)?.queue().stats().await?)
    }
}

/// Check that `path` can address a queue.
pub fn validate_path(path: &str) -> Result<(), ManagerError> {
    let invalid = |reason| ManagerError::InvalidQueuePath {
        path: path.to_string(),
        reason,
    };

    if !path.starts_with('/') {
        return Err(invalid("must start with '/'"));
    }
    if path.len() == 1 {
        return Err(invalid("must name a queue"));
    }
    if path == RESERVED_PREFIX || path.starts_with(&format!("{}/", RESERVED_PREFIX)) {
        return Err(invalid("prefix is reserved"));
    }
    if path.split('/').any(|segment| segment == "..") {
        return Err(invalid("must not contain '..' segments"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use async_trait::async_trait;

    struct NoopNotifier;

    #[async_trait]
    impl WakeupNotifier for NoopNotifier {
        async fn notify(&self, _addr: SocketAddr) -> bool {
            true
        }
    }

    fn memory_defaults() -> QueueDefaults {
        QueueDefaults {
            backend: BackendKind::Memory,
            listeners: false,
            ..Default::default()
        }
    }

    fn manager(defaults: QueueDefaults) -> QueueManager {
        QueueManager::new(defaults, None, Arc::new(NoopNotifier))
    }

    #[test]
    fn test_path_validation() {
        assert!(validate_path("/mail_box/threez").is_ok());
        assert!(validate_path("relative").is_err());
        assert!(validate_path("/").is_err());
        assert!(validate_path("/_fmq").is_err());
        assert!(validate_path("/_fmq/health").is_err());
        assert!(validate_path("/_fmqueue").is_ok());
        assert!(validate_path("/a/../etc").is_err());
    }

    #[tokio::test]
    async fn test_put_auto_creates_queue() {
        let mgr = manager(memory_defaults());
        mgr.put("/auto", Message::new("x", "text/plain")).await.unwrap();

        assert_eq!(mgr.queue_names(), vec!["/auto".to_string()]);
        let delivery = mgr.poll("/auto", None).await.unwrap();
        assert_eq!(delivery.into_message().unwrap().payload, b"x");
    }

    #[tokio::test]
    async fn test_unknown_queue_without_auto_create() {
        let mgr = manager(QueueDefaults {
            auto_create: false,
            ..memory_defaults()
        });

        let err = mgr.put("/nope", Message::new("x", "x")).await.unwrap_err();
        assert!(matches!(err, ManagerError::QueueNotFound(_)));
        assert!(matches!(mgr.poll("/nope", None).await, Err(ManagerError::QueueNotFound(_))));
        assert!(matches!(mgr.stats("/nope").await, Err(ManagerError::QueueNotFound(_))));
    }

    #[tokio::test]
    async fn test_poll_does_not_auto_create() {
        let mgr = manager(memory_defaults());
        assert!(mgr.poll("/missing", None).await.is_err());
        assert_eq!(mgr.queue_count(), 0);
    }

    #[tokio::test]
    async fn test_setup_rejects_duplicates_and_bad_paths() {
        let mgr = manager(memory_defaults());
        let def = QueueDefinition::new("/dup", BackendKind::Memory);

        mgr.setup_queue(&def).await.unwrap();
        assert!(matches!(mgr.setup_queue(&def).await, Err(ManagerError::QueueExists(_))));

        let reserved = QueueDefinition::new("/_fmq/metrics", BackendKind::Memory);
        assert!(matches!(
            mgr.setup_queue(&reserved).await,
            Err(ManagerError::InvalidQueuePath { .. })
        ));
    }

    #[tokio::test]
    async fn test_listening_queue_registers_listener() {
        let mgr = manager(memory_defaults());
        let mut def = QueueDefinition::new("/listen", BackendKind::Memory);
        def.listeners = true;
        let queue = mgr.setup_queue(&def).await.unwrap();
        assert!(queue.accepts_listeners());

        let addr = SocketAddr::from(([127, 0, 0, 1], 7000));
        assert_eq!(mgr.poll("/listen", Some(addr)).await.unwrap(), Delivery::Pending);

        // Plain queues ignore the address
        mgr.setup_queue(&QueueDefinition::new("/plain", BackendKind::Memory))
            .await
            .unwrap();
        assert_eq!(mgr.poll("/plain", Some(addr)).await.unwrap(), Delivery::Empty);
    }

    #[tokio::test]
    async fn test_delete_keeps_messages_in_backend_and_unregisters() {
        let mgr = manager(memory_defaults());
        mgr.put("/gone", Message::new("x", "x")).await.unwrap();

        mgr.delete_queue("/gone").unwrap();
        assert!(mgr.queue_names().is_empty());
        assert!(matches!(mgr.delete_queue("/gone"), Err(ManagerError::QueueNotFound(_))));
    }

    #[tokio::test]
    async fn test_register_prebuilt_queue() {
        let mgr = manager(memory_defaults());
        let queue = Queue::new(
            "/custom",
            QueueLimits::default(),
            Arc::new(crate::storage::MemoryBackend::new()),
        );
        mgr.register(queue, true).unwrap();
        assert!(mgr.queue("/custom").unwrap().accepts_listeners());

        let again = Queue::new(
            "/custom",
            QueueLimits::default(),
            Arc::new(crate::storage::MemoryBackend::new()),
        );
        assert!(matches!(mgr.register(again, false), Err(ManagerError::QueueExists(_))));
    }

    #[tokio::test]
    async fn test_resolved_queue_outlives_delete() {
        let mgr = manager(memory_defaults());
        let queue = mgr.queue_for_put("/handle").await.unwrap();
        queue.put(Message::new("kept", "x")).await.unwrap();

        mgr.delete_queue("/handle").unwrap();

        // A request holding the handle still finishes against the same queue
        assert_eq!(queue.queue().stats().await.unwrap(), QueueStats { size: 1, bytes: 4 });
        let delivery = queue.poll(None).await.unwrap();
        assert_eq!(delivery.into_message().unwrap().payload, b"kept");
    }

    #[tokio::test]
    async fn test_clear_and_stats() {
        let mgr = manager(memory_defaults());
        mgr.put("/s", Message::new("abc", "x")).await.unwrap();
        mgr.put("/s", Message::new("de", "x")).await.unwrap();

        assert_eq!(mgr.stats("/s").await.unwrap(), QueueStats { size: 2, bytes: 5 });
        mgr.clear_queue("/s").await.unwrap();
        assert_eq!(mgr.stats("/s").await.unwrap(), QueueStats::default());
    }

    #[tokio::test]
    async fn test_database_queue_creates_schema_on_setup() {
        let db = DatabasePool::new(&DatabaseConfig::in_memory()).await.unwrap();
        let defaults = QueueDefaults {
            backend: BackendKind::Database,
            listeners: false,
            ..Default::default()
        };
        let mgr = QueueManager::new(defaults, Some(db), Arc::new(NoopNotifier));

        mgr.put("/db/jobs", Message::new("row", "text/plain")).await.unwrap();
        let peeked = mgr.peek("/db/jobs", "session", None).await.unwrap();
        let peeked = peeked.into_message().unwrap();
        assert_eq!(peeked.message.payload, b"row");

        assert_eq!(
            mgr.peek_grab("/db/jobs", "session", peeked.id).await.unwrap(),
            GrabOutcome::Grabbed
        );
        assert_eq!(mgr.stats("/db/jobs").await.unwrap().size, 0);
    }
}
