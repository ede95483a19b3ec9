//! Pluggable queue persistence.
//!
//! # Architecture
//!
//! Every queue owns one backend implementing [`StorageBackend`]:
//!
//! - `FileBackend`: one file per message under a configured folder
//! - `SqlBackend`: rows in a shared message table, with session cursors
//! - `MemoryBackend`: non-persistent ordered map, with session cursors
//!
//! Use `create_backend()` to build the backend a queue definition asks for.

pub mod backend;
mod factory;
pub mod file_backend;
pub mod memory_backend;
pub mod sql_backend;

pub use backend::{BackendError, MessageId, SessionCursorStore, StorageBackend};
pub use factory::create_backend;
pub use file_backend::FileBackend;
pub use memory_backend::MemoryBackend;
pub use sql_backend::SqlBackend;
