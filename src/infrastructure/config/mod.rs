mod settings;

pub use settings::{
    BackendKind, DatabaseConfig, ListenerConfig, LogFormat, LoggingConfig, QueueDefaults,
    QueueDefinition, ServerConfig, Settings,
};
