//! Application configuration.
//!
//! Aggregates configuration from all modules into a single Config struct
//! that can be loaded from YAML files or environment variables.

mod messaging;
mod processor;
mod search;
mod server;

pub use messaging::{AmqpConfig, NatsConfig, QueueType};
pub use processor::{ProcessorConfig, RedeliveryConfig};
pub use search::{SearchConfig, WriteMode};
pub use server::HttpConfig;

/// Default configuration file name (without extension).
pub const DEFAULT_CONFIG_FILE: &str = "orderflow";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "ORDERFLOW_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "ORDERFLOW";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "ORDERFLOW_LOG";

/// Single-name environment variables and the config keys they override.
///
/// Empty values are treated as unset.
pub const LEGACY_ENV_VARS: &[(&str, &str)] = &[
    ("HTTP_ADDR", "http.addr"),
    ("NATS_URL", "nats.url"),
    ("NATS_SUBJECT", "nats.subscribe_subject"),
    ("NATS_QUEUE_GROUP", "nats.queue_group"),
    ("RABBITMQ_URL", "amqp.url"),
    ("RABBITMQ_QUEUE", "amqp.queue"),
    ("ES_URL", "search.url"),
    ("ES_INDEX", "search.index"),
    ("ES_USER", "search.username"),
    ("ES_PASS", "search.password"),
];

use serde::Deserialize;

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    Load(#[from] ::config::ConfigError),
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP listener for the ingress API.
    pub http: HttpConfig,
    /// Broadcast bus.
    pub nats: NatsConfig,
    /// Durable work queue.
    pub amqp: AmqpConfig,
    /// Search/index store.
    pub search: SearchConfig,
    /// Order processor behavior.
    pub processor: ProcessorConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `orderflow.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix, `__` separated
    /// 5. `LEGACY_ENV_VARS`
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix(CONFIG_ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        for (var, key) in LEGACY_ENV_VARS {
            let value = std::env::var(var).ok().filter(|v| !v.is_empty());
            builder = builder.set_override_option(*key, value)?;
        }

        let config: Config = builder.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Create config for testing.
    pub fn for_test() -> Self {
        Self::default()
    }
}
