use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::path::PathBuf;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerConfig,
    /// Shared connection for every database-backed queue
    #[serde(default)]
    pub database: Option<DatabaseConfig>,
    /// Queues registered at startup
    #[serde(default)]
    pub queues: Vec<QueueDefinition>,
    /// Template for queues created implicitly on first put
    #[serde(default)]
    pub defaults: QueueDefaults,
    #[serde(default)]
    pub listener: ListenerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Largest accepted request body in bytes
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    /// Value of the SERVER header on every response
    #[serde(default = "default_server_header")]
    pub server_header: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// `postgres://...` or `sqlite:...`
    pub url: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: u64,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_seconds: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    File,
    Database,
    Memory,
}

/// One queue registered at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueDefinition {
    /// Request path addressing the queue, e.g. `/mail_box/threez`
    pub path: String,
    #[serde(default)]
    pub backend: BackendKind,
    /// Message folder (file backend)
    #[serde(default)]
    pub folder: Option<PathBuf>,
    /// Message table (database backend)
    #[serde(default)]
    pub table_name: Option<String>,
    /// Session cursor table (database backend)
    #[serde(default)]
    pub session_table: Option<String>,
    /// Maximum number of messages; unbounded when absent
    #[serde(default)]
    pub max_messages: Option<u64>,
    /// Maximum total payload bytes; unbounded when absent
    #[serde(default)]
    pub max_size: Option<u64>,
    /// Accept long-poll listener registrations
    #[serde(default)]
    pub listeners: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueDefaults {
    /// Create unknown queues on first put
    #[serde(default = "default_true")]
    pub auto_create: bool,
    #[serde(default)]
    pub backend: BackendKind,
    /// File backend queues live in `<folder_root>/<queue path>`
    #[serde(default = "default_folder_root")]
    pub folder_root: PathBuf,
    #[serde(default = "default_table_name")]
    pub table_name: String,
    #[serde(default = "default_session_table")]
    pub session_table: String,
    #[serde(default)]
    pub max_messages: Option<u64>,
    #[serde(default)]
    pub max_size: Option<u64>,
    #[serde(default = "default_true")]
    pub listeners: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListenerConfig {
    /// Connect timeout for a wakeup attempt in milliseconds
    #[serde(default = "default_listener_timeout")]
    pub connect_timeout_ms: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    5884
}

fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024 // 10 MiB
}

fn default_server_header() -> String {
    format!("fmq-broker/{}", env!("CARGO_PKG_VERSION"))
}

fn default_pool_size() -> u32 {
    5
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_idle_timeout() -> u64 {
    300 // 5 minutes
}

fn default_true() -> bool {
    true
}

fn default_folder_root() -> PathBuf {
    PathBuf::from("data/queues")
}

fn default_table_name() -> String {
    "fmq_messages".to_string()
}

fn default_session_table() -> String {
    "fmq_sessions".to_string()
}

fn default_listener_timeout() -> u64 {
    500
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if exists
        let _ = dotenvy::dotenv();

        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            // Start with default values
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 5884)?
            .set_default("defaults.auto_create", true)?
            .set_default("listener.connect_timeout_ms", 500)?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // Load from environment variables
            // FMQ_SERVER__PORT, FMQ_DATABASE__URL, FMQ_DEFAULTS__BACKEND, etc.
            .add_source(
                Environment::with_prefix("FMQ")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject queue definitions that could never be addressed.
    ///
    /// Missing folders and table names are deliberately not checked here; the
    /// queue reports them when it is used.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for queue in &self.queues {
            if !queue.path.starts_with('/') {
                return Err(ConfigError::Message(format!(
                    "queue path '{}' must start with '/'",
                    queue.path
                )));
            }
            if queue.backend == BackendKind::Database && self.database.is_none() {
                tracing::warn!(
                    queue = %queue.path,
                    "Database queue configured without a [database] section"
                );
            }
        }
        Ok(())
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

impl DatabaseConfig {
    /// Private in-memory SQLite database, one connection.
    pub fn in_memory() -> Self {
        Self {
            url: "sqlite::memory:".to_string(),
            pool_size: 1,
            connect_timeout_seconds: default_connect_timeout(),
            idle_timeout_seconds: default_idle_timeout(),
        }
    }
}

impl QueueDefinition {
    /// Unbounded, listener-less queue of the given kind with no storage
    /// location configured yet.
    pub fn new(path: impl Into<String>, backend: BackendKind) -> Self {
        Self {
            path: path.into(),
            backend,
            folder: None,
            table_name: None,
            session_table: None,
            max_messages: None,
            max_size: None,
            listeners: false,
        }
    }
}

impl QueueDefaults {
    /// Definition used when `path` is created implicitly.
    pub fn definition_for(&self, path: &str) -> QueueDefinition {
        let relative = path.trim_start_matches('/');
        QueueDefinition {
            path: path.to_string(),
            backend: self.backend,
            folder: Some(self.folder_root.join(relative)),
            table_name: Some(self.table_name.clone()),
            session_table: Some(self.session_table.clone()),
            max_messages: self.max_messages,
            max_size: self.max_size,
            listeners: self.listeners,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_body_bytes: default_max_body_bytes(),
            server_header: default_server_header(),
        }
    }
}

impl Default for QueueDefaults {
    fn default() -> Self {
        Self {
            auto_create: true,
            backend: BackendKind::default(),
            folder_root: default_folder_root(),
            table_name: default_table_name(),
            session_table: default_session_table(),
            max_messages: None,
            max_size: None,
            listeners: true,
        }
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_listener_timeout(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let server = ServerConfig::default();
        assert_eq!(server.host, "0.0.0.0");
        assert_eq!(server.port, 5884);
        assert!(server.server_header.starts_with("fmq-broker/"));

        let defaults = QueueDefaults::default();
        assert!(defaults.auto_create);
        assert_eq!(defaults.backend, BackendKind::File);
        assert_eq!(ListenerConfig::default().connect_timeout_ms, 500);
    }

    #[test]
    fn test_definition_for_nests_folder_under_root() {
        let defaults = QueueDefaults {
            folder_root: PathBuf::from("/var/fmq"),
            ..Default::default()
        };

        let def = defaults.definition_for("/mail_box/threez");
        assert_eq!(def.folder, Some(PathBuf::from("/var/fmq/mail_box/threez")));
        assert_eq!(def.table_name.as_deref(), Some("fmq_messages"));
        assert!(def.listeners);
    }

    #[test]
    fn test_queue_definitions_deserialize() {
        let raw = r#"
            [[queues]]
            path = "/jobs"
            backend = "database"
            table_name = "messages"
            max_messages = 1000

            [[queues]]
            path = "/scratch"
            backend = "memory"
            listeners = true
        "#;

        let settings: Settings = Config::builder()
            .add_source(File::from_str(raw, config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(settings.queues.len(), 2);
        assert_eq!(settings.queues[0].backend, BackendKind::Database);
        assert_eq!(settings.queues[0].max_messages, Some(1000));
        assert_eq!(settings.queues[0].max_size, None);
        assert_eq!(settings.queues[1].backend, BackendKind::Memory);
        assert!(settings.queues[1].listeners);
        assert!(settings.database.is_none());
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_relative_paths() {
        let settings = Settings {
            queues: vec![QueueDefinition::new("jobs", BackendKind::Memory)],
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }
}
