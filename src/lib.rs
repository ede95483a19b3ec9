// Infrastructure layer (shared components)
pub mod infrastructure;

// Re-export infrastructure modules at the crate root
pub use infrastructure::config;
pub use infrastructure::database;
pub use infrastructure::error;
pub use infrastructure::metrics;

// Domain layer (queue engine)
pub mod listener;
pub mod manager;
pub mod message;
pub mod queue;
pub mod storage;

// Application layer
pub mod api;
pub mod protocol;
pub mod server;
