//! Typed configuration schema.

use std::{collections::BTreeMap, path::PathBuf};

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SynchroConfig {
    pub server: ServerConfig,
    pub scheduler: SchedulerConfig,
    pub storage: StorageConfig,
    /// Command-backed job handlers, one per job name.
    pub handlers: Vec<HandlerConfig>,
}

/// HTTP API server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to. Defaults to "127.0.0.1".
    pub bind: String,
    /// Port to listen on. Defaults to 8787.
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".into(),
            port: 8787,
        }
    }
}

/// Timers and limits of the scheduling engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Dispatcher tick: how often manually requested jobs are picked up.
    pub poll_interval_secs: u64,
    /// How often the stale-run sweep runs.
    pub reaper_interval_secs: u64,
    /// Age after which an open run record is force-failed.
    pub stale_threshold_secs: u64,
    /// Per-run timeout for manual runs and batches without their own timeout.
    pub default_timeout_secs: u64,
    /// First retry delay for failed batch scripts; doubles per attempt.
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    /// Run records kept per job.
    pub history_limit: usize,
    /// Timezone for batches that do not name one.
    pub default_timezone: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 300,
            reaper_interval_secs: 86_400,
            stale_threshold_secs: 3 * 86_400,
            default_timeout_secs: 3_600,
            retry_base_delay_ms: 1_000,
            retry_max_delay_ms: 60_000,
            history_limit: 100,
            default_timezone: "UTC".into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    File,
    #[default]
    Sqlite,
}

/// Where jobs and batches are persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Directory for the file backend. Defaults to the user data dir.
    pub path: Option<PathBuf>,
    /// Connection string for the sqlite backend. Defaults to
    /// `sqlite://<data dir>/synchro.db?mode=rwc`.
    pub database_url: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Sqlite,
            path: None,
            database_url: None,
        }
    }
}

/// An external command exposed as a job handler.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HandlerConfig {
    /// Job name the handler answers to.
    pub name: String,
    pub description: Option<String>,
    pub command: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
}
