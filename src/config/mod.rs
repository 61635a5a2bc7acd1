/// Configuration management for the Cymphony engine
///
/// Handles server, store, protocol defaults and background loop intervals.
/// `Default` reads `CYMPHONY_*` environment variables for container deployment.

use crate::compiler::CompileLimits;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub protocol: ProtocolConfig,
    pub monitor: MonitorConfig,
    pub pipeline: PipelineConfig,
    pub provider: ProviderConfig,
    pub notification: NotificationConfig,
    /// tracing filter level (e.g. "info", "debug")
    pub log_level: String,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server bind address (e.g., "0.0.0.0")
    pub host: String,
    pub port: u16,
}

/// SQLite store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Base directory for the database file and run directories (default: "data")
    pub data_dir: String,
    pub file_name: String,
    pub max_connections: u32,
    /// How long a writer queues for the write lock before failing
    pub busy_timeout_secs: u64,
}

/// Compile-time ceilings and protocol defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// Assignment timeout when a label statement sets none
    pub default_timeout_secs: i64,
    pub max_headers: usize,
    pub max_rows: usize,
    /// Export every automatic operator's output table to CSV for audit
    pub materialize_outputs: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    pub interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Base URL of the provider HTTP endpoint; `label_amt` jobs fail without one
    pub url: Option<String>,
    pub poll_secs: u64,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    pub timeout_secs: u64,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Default for Config {
    /// Default configuration with ENV_VAR support for k8s/container deployment
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: env_or("CYMPHONY_HOST", "0.0.0.0".to_string()),
                port: env_or("CYMPHONY_PORT", 3004),
            },
            database: DatabaseConfig {
                data_dir: env_or("CYMPHONY_DATA_DIR", "data".to_string()),
                file_name: env_or("CYMPHONY_DB_FILE", "cymphony.db".to_string()),
                max_connections: env_or("CYMPHONY_DB_MAX_CONNECTIONS", 16),
                busy_timeout_secs: env_or("CYMPHONY_DB_BUSY_TIMEOUT_SECS", 30),
            },
            protocol: ProtocolConfig {
                default_timeout_secs: env_or("CYMPHONY_DEFAULT_TIMEOUT_SECS", 600),
                max_headers: env_or("CYMPHONY_MAX_HEADERS", 64),
                max_rows: env_or("CYMPHONY_MAX_ROWS", 100_000),
                materialize_outputs: env_or("CYMPHONY_MATERIALIZE_OUTPUTS", false),
            },
            monitor: MonitorConfig {
                interval_secs: env_or("CYMPHONY_MONITOR_INTERVAL_SECS", 30),
            },
            pipeline: PipelineConfig {
                interval_secs: env_or("CYMPHONY_PIPELINE_INTERVAL_SECS", 10),
            },
            provider: ProviderConfig {
                url: std::env::var("CYMPHONY_PROVIDER_URL").ok().filter(|u| !u.is_empty()),
                poll_secs: env_or("CYMPHONY_PROVIDER_POLL_SECS", 60),
                timeout_secs: 30,
            },
            notification: NotificationConfig {
                timeout_secs: env_or("CYMPHONY_NOTIFY_TIMEOUT_SECS", 10),
            },
            log_level: env_or("CYMPHONY_LOG", "info".to_string()),
        }
    }
}

impl Config {
    /// Isolated configuration rooted at `dir`, with short loop intervals.
    /// Ignores the environment.
    pub fn for_data_dir(dir: &Path) -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 0,
            },
            database: DatabaseConfig {
                data_dir: dir.to_string_lossy().into_owned(),
                file_name: "cymphony.db".to_string(),
                max_connections: 8,
                busy_timeout_secs: 30,
            },
            protocol: ProtocolConfig {
                default_timeout_secs: 600,
                max_headers: 64,
                max_rows: 100_000,
                materialize_outputs: false,
            },
            monitor: MonitorConfig { interval_secs: 1 },
            pipeline: PipelineConfig { interval_secs: 1 },
            provider: ProviderConfig {
                url: None,
                poll_secs: 1,
                timeout_secs: 5,
            },
            notification: NotificationConfig { timeout_secs: 2 },
            log_level: "debug".to_string(),
        }
    }

    pub fn limits(&self) -> CompileLimits {
        CompileLimits {
            max_headers: self.protocol.max_headers,
            max_rows: self.protocol.max_rows,
            default_timeout_secs: self.protocol.default_timeout_secs,
        }
    }

    pub fn data_dir(&self) -> &Path {
        Path::new(&self.database.data_dir)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor.interval_secs.max(1))
    }

    pub fn pipeline_interval(&self) -> Duration {
        Duration::from_secs(self.pipeline.interval_secs.max(1))
    }

    pub fn provider_poll_interval(&self) -> Duration {
        Duration::from_secs(self.provider.poll_secs.max(1))
    }
}
