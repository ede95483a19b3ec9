//! FIFO queue over a pluggable storage backend.
//!
//! A [`Queue`] owns one [`StorageBackend`], its name and its limits. It
//! provides destructive reads (`poll`), limit-checked writes (`put`), and the
//! session-cursor protocol (`peek` / `peek_grab`) for backends that keep
//! cursors.
//!
//! # Peek and grab
//!
//! `peek` returns the first valid message after the session's watermark and
//! advances the watermark to it, without removing the message. The same
//! session never sees that message again from `peek`; other sessions and
//! `poll` still do until someone grabs it. `peek_grab` removes exactly the
//! given id if it is still valid, so grabbing twice is a harmless no-op.

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::message::Message;
use crate::metrics::QueueMetrics;
use crate::storage::{BackendError, MessageId, StorageBackend};

/// Errors raised by queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// Accepting the message would exceed a configured limit
    #[error("Queue '{queue}' is full: {limit} limit of {max} would be exceeded")]
    QueueFull {
        queue: String,
        limit: &'static str,
        max: u64,
        /// Statistics at the time of rejection
        stats: QueueStats,
    },

    /// The backend keeps no session cursors
    #[error("Queue '{queue}' uses the {backend} backend, which does not support PEEK")]
    PeekUnsupported {
        queue: String,
        backend: &'static str,
    },
}

/// Configured limits. `None` means unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueLimits {
    pub max_messages: Option<u64>,
    pub max_size: Option<u64>,
}

/// Current queue statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Number of valid messages
    pub size: u64,
    /// Total payload bytes of valid messages
    pub bytes: u64,
}

/// A message returned by peek, with the id needed to grab it.
#[derive(Debug, Clone, PartialEq)]
pub struct PeekedMessage {
    pub id: MessageId,
    pub message: Message,
}

/// Result of a grab.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrabOutcome {
    /// This call removed the message
    Grabbed,
    /// Already grabbed or never existed
    Nothing,
}

/// A named FIFO queue.
pub struct Queue {
    name: String,
    limits: QueueLimits,
    backend: Arc<dyn StorageBackend>,
    /// Serializes check-then-persist on limited queues
    put_lock: Mutex<()>,
}

impl Queue {
    pub fn new(name: impl Into<String>, limits: QueueLimits, backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            name: name.into(),
            limits,
            backend,
            put_lock: Mutex::new(()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn backend_kind(&self) -> &'static str {
        self.backend.kind()
    }

    /// Remove and return the oldest message.
    ///
    /// When another consumer wins the race for the located message, the next
    /// one is located instead, so each message reaches exactly one poller.
    pub async fn poll(&self) -> Result<Option<Message>, QueueError> {
        loop {
            let Some(id) = self.backend.locate_next().await? else {
                return Ok(None);
            };

            if let Some(message) = self.backend.read(id, true).await? {
                QueueMetrics::record_polled();
                tracing::debug!(queue = %self.name, message_id = %id, "Message polled");
                return Ok(Some(message));
            }

            tracing::trace!(queue = %self.name, message_id = %id, "Lost poll race, locating next");
        }
    }

    /// Store a message, rejecting it if a limit would be exceeded.
    ///
    /// A rejected message is never persisted and older messages are never
    /// evicted to make room.
    pub async fn put(&self, message: Message) -> Result<MessageId, QueueError> {
        let _guard = if self.is_limited() {
            Some(self.put_lock.lock().await)
        } else {
            None
        };

        self.check_limits(&message).await?;
        let id = self.backend.persist(&message).await?;
        QueueMetrics::record_put();

        tracing::debug!(
            queue = %self.name,
            message_id = %id,
            bytes = message.bytes(),
            "Message put"
        );
        Ok(id)
    }

    fn is_limited(&self) -> bool {
        self.limits != QueueLimits::default()
    }

    async fn check_limits(&self, message: &Message) -> Result<(), QueueError> {
        if !self.is_limited() {
            return Ok(());
        }

        let stats = self.stats().await?;
        if let Some(max) = self.limits.max_messages {
            if stats.size + 1 > max {
                return Err(self.reject("max_messages", max, stats));
            }
        }
        if let Some(max) = self.limits.max_size {
            if stats.bytes + message.bytes() > max {
                return Err(self.reject("max_size", max, stats));
            }
        }
        Ok(())
    }

    fn reject(&self, limit: &'static str, max: u64, stats: QueueStats) -> QueueError {
        QueueMetrics::record_rejected(limit);
        tracing::warn!(queue = %self.name, limit = limit, max = max, "Put rejected, queue full");
        QueueError::QueueFull {
            queue: self.name.clone(),
            limit,
            max,
            stats,
        }
    }

    /// Remove every message.
    pub async fn clear(&self) -> Result<(), QueueError> {
        self.backend.clear().await?;
        tracing::info!(queue = %self.name, "Queue cleared");
        Ok(())
    }

    /// Return the next message after the session's watermark without
    /// removing it, and advance the watermark to it.
    pub async fn peek(&self, session_id: &str) -> Result<Option<PeekedMessage>, QueueError> {
        let cursors = self.backend.cursors().ok_or_else(|| QueueError::PeekUnsupported {
            queue: self.name.clone(),
            backend: self.backend.kind(),
        })?;

        let mut watermark = cursors.load_watermark(session_id).await?;
        loop {
            let Some(id) = cursors.locate_after(watermark).await? else {
                // Nothing new; still touch the session
                cursors.store_watermark(session_id, watermark).await?;
                return Ok(None);
            };

            cursors.store_watermark(session_id, id).await?;
            if let Some(message) = self.backend.read(id, false).await? {
                QueueMetrics::record_peeked();
                tracing::debug!(
                    queue = %self.name,
                    session_id = %session_id,
                    message_id = %id,
                    "Message peeked"
                );
                return Ok(Some(PeekedMessage { id, message }));
            }

            // Grabbed between locate and read
            watermark = id;
        }
    }

    /// Remove a previously peeked message if it is still there.
    pub async fn peek_grab(
        &self,
        session_id: &str,
        id: MessageId,
    ) -> Result<GrabOutcome, QueueError> {
        let cursors = self.backend.cursors().ok_or_else(|| QueueError::PeekUnsupported {
            queue: self.name.clone(),
            backend: self.backend.kind(),
        })?;

        if cursors.grab(id).await? {
            QueueMetrics::record_grabbed();
            tracing::debug!(queue = %self.name, session_id = %session_id, message_id = %id, "Message grabbed");
            Ok(GrabOutcome::Grabbed)
        } else {
            tracing::debug!(queue = %self.name, session_id = %session_id, message_id = %id, "Nothing to grab");
            Ok(GrabOutcome::Nothing)
        }
    }

    pub async fn size(&self) -> Result<u64, QueueError> {
        Ok(self.backend.size().await?)
    }

    pub async fn bytes(&self) -> Result<u64, QueueError> {
        Ok(self.backend.bytes().await?)
    }

    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        Ok(QueueStats {
            size: self.size().await?,
            bytes: self.bytes().await?,
        })
    }
}
