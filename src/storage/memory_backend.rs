//! In-memory queue storage.
//!
//! Messages live in an ordered map keyed by a process-local counter and are
//! lost on restart. Useful for scratch queues and for tests of everything
//! above the storage layer.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::message::Message;

use super::backend::{BackendError, MessageId, SessionCursorStore, StorageBackend};

/// In-memory queue storage with session cursor support.
pub struct MemoryBackend {
    /// id -> message, ordered so the first entry is the queue head
    messages: Mutex<BTreeMap<MessageId, Message>>,
    /// session_id -> (watermark, last used)
    sessions: DashMap<String, (MessageId, DateTime<Utc>)>,
    next_id: AtomicI64,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            messages: Mutex::new(BTreeMap::new()),
            sessions: DashMap::new(),
            next_id: AtomicI64::new(1),
        }
    }

    /// Number of sessions that have peeked at this queue.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn locate_next(&self) -> Result<Option<MessageId>, BackendError> {
        Ok(self.messages.lock().await.keys().next().copied())
    }

    async fn persist(&self, message: &Message) -> Result<MessageId, BackendError> {
        // Allocated under the lock so ids enter the map in increasing order
        let mut messages = self.messages.lock().await;
        let id = MessageId(self.next_id.fetch_add(1, Ordering::SeqCst));
        messages.insert(id, message.clone());
        drop(messages);

        tracing::trace!(message_id = %id, bytes = message.bytes(), "Message stored in memory");
        Ok(id)
    }

    async fn read(&self, id: MessageId, delete: bool) -> Result<Option<Message>, BackendError> {
        let mut messages = self.messages.lock().await;
        if delete {
            Ok(messages.remove(&id))
        } else {
            Ok(messages.get(&id).cloned())
        }
    }

    async fn clear(&self) -> Result<(), BackendError> {
        let mut messages = self.messages.lock().await;
        let removed = messages.len();
        messages.clear();

        tracing::debug!(removed = removed, "Cleared in-memory queue");
        Ok(())
    }

    async fn size(&self) -> Result<u64, BackendError> {
        Ok(self.messages.lock().await.len() as u64)
    }

    async fn bytes(&self) -> Result<u64, BackendError> {
        Ok(self.messages.lock().await.values().map(Message::bytes).sum())
    }

    fn cursors(&self) -> Option<&dyn SessionCursorStore> {
        Some(self)
    }
}

#[async_trait]
impl SessionCursorStore for MemoryBackend {
    async fn load_watermark(&self, session_id: &str) -> Result<MessageId, BackendError> {
        let entry = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| (MessageId::ORIGIN, Utc::now()));
        Ok(entry.0)
    }

    async fn locate_after(&self, after: MessageId) -> Result<Option<MessageId>, BackendError> {
        let messages = self.messages.lock().await;
        Ok(messages
            .range((std::ops::Bound::Excluded(after), std::ops::Bound::Unbounded))
            .next()
            .map(|(id, _)| *id))
    }

    async fn store_watermark(&self, session_id: &str, id: MessageId) -> Result<(), BackendError> {
        self.sessions
            .insert(session_id.to_string(), (id, Utc::now()));
        Ok(())
    }

    async fn grab(&self, id: MessageId) -> Result<bool, BackendError> {
        Ok(self.messages.lock().await.remove(&id).is_some())
    }
}
