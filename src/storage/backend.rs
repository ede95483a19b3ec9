//! Backend trait for queue storage.
//!
//! This module defines the contract every persistence implementation
//! (file system, relational table, memory) fulfils for a single queue, so
//! that a `Queue` can be written once against `dyn StorageBackend`.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use thiserror::Error;

use crate::message::Message;

/// Errors that can occur during storage backend operations.
///
/// "Nothing there" is never an error; it is reported as `None`.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The backend is missing a required setting (folder, table name, pool)
    #[error("{backend} backend is not configured: {missing} must be specified")]
    NotConfigured {
        backend: &'static str,
        missing: &'static str,
    },

    /// File system operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Relational store operation failed
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A stored record could not be decoded
    #[error("Corrupt message record {id}: {reason}")]
    Corrupt { id: MessageId, reason: String },
}

/// Order-preserving message key.
///
/// Within one queue a smaller id always means an earlier arrival.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct MessageId(pub i64);

impl MessageId {
    /// Watermark of a session that has not seen anything yet.
    pub const ORIGIN: MessageId = MessageId(0);

    pub fn value(self) -> i64 {
        self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MessageId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(MessageId)
    }
}

/// Per-session read cursors used by peek and grab.
///
/// Only backends that can keep a durable watermark per `(queue, session)`
/// expose one of these through [`StorageBackend::cursors`].
#[async_trait]
pub trait SessionCursorStore: Send + Sync {
    /// Return the session's watermark, creating the session at
    /// [`MessageId::ORIGIN`] if it has never been seen.
    async fn load_watermark(&self, session_id: &str) -> Result<MessageId, BackendError>;

    /// Smallest valid message id strictly greater than `after`.
    async fn locate_after(&self, after: MessageId) -> Result<Option<MessageId>, BackendError>;

    /// Move the session's watermark and refresh its last-used time.
    async fn store_watermark(&self, session_id: &str, id: MessageId) -> Result<(), BackendError>;

    /// Invalidate exactly `id` if it is still valid.
    ///
    /// Returns `true` only for the one caller whose update took effect.
    async fn grab(&self, id: MessageId) -> Result<bool, BackendError>;
}

/// Backend trait for the storage of one queue.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`; a queue is shared by every request
/// task addressing its path and calls are not serialized by the caller.
///
/// # Races
///
/// `read(id, true)` must hand a message to at most one caller. When a
/// concurrent reader already removed the record, the loser gets `Ok(None)`
/// and is expected to locate again.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Short backend type identifier for logs and health output.
    fn kind(&self) -> &'static str;

    /// Smallest valid message id, or `None` when the queue is empty.
    ///
    /// Fails with [`BackendError::NotConfigured`] when the backend lacks its
    /// folder or table.
    async fn locate_next(&self) -> Result<Option<MessageId>, BackendError>;

    /// Durably store `message` under a fresh id greater than every existing one.
    async fn persist(&self, message: &Message) -> Result<MessageId, BackendError>;

    /// Materialize the message stored under `id`, invalidating it when
    /// `delete` is set.
    async fn read(&self, id: MessageId, delete: bool) -> Result<Option<Message>, BackendError>;

    /// Invalidate every record of the queue.
    async fn clear(&self) -> Result<(), BackendError>;

    /// Number of valid messages.
    async fn size(&self) -> Result<u64, BackendError>;

    /// Sum of the payload lengths of valid messages.
    async fn bytes(&self) -> Result<u64, BackendError>;

    /// Session cursor support, if the backend has any.
    fn cursors(&self) -> Option<&dyn SessionCursorStore> {
        None
    }
}
