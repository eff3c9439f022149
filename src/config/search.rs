//! Search/index store configuration.

use std::time::Duration;

use serde::Deserialize;

/// How processed records are written to the index.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteMode {
    /// Auto-generated document id; a redelivered order produces another
    /// document.
    #[default]
    Insert,
    /// Document id is the order id; a redelivered order replaces its record.
    Upsert,
}

/// Elasticsearch configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Base URL of the cluster.
    pub url: String,
    /// Target index.
    pub index: String,
    /// Basic auth username.
    pub username: Option<String>,
    /// Basic auth password.
    pub password: Option<String>,
    /// Upper bound on a single document write.
    pub timeout_ms: u64,
    pub write_mode: WriteMode,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:9200".to_string(),
            index: "orders".to_string(),
            username: None,
            password: None,
            timeout_ms: 3000,
            write_mode: WriteMode::Insert,
        }
    }
}

impl SearchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}
