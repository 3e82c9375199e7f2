//! Configuration for lyph store instances.
//!
//! Loaded from the `[store]` and `[log]` sections of `lyph.toml` or
//! `LYPH__STORE__*` / `LYPH__LOG__*` environment variables.

use serde::Deserialize;

/// Settings of a `ResourceGraphStore` instance.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct StoreConfig {
    /// Base URL used to build resource hrefs.
    #[serde(default = "default_host")]
    pub host: String,

    /// Path of the JSON resource/relationship manifest.
    #[serde(default = "default_manifest")]
    pub manifest: String,

    /// How many times to try taking the id counter lock before giving up.
    #[serde(default = "default_id_lock_attempts")]
    pub id_lock_attempts: u32,

    /// Pause between id counter lock attempts, in milliseconds.
    #[serde(default = "default_id_lock_backoff_ms")]
    pub id_lock_backoff_ms: u64,
}

/// Log output settings for the binaries.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct LogConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub filter: String,

    /// Emit JSON log lines instead of human-readable ones.
    #[serde(default)]
    pub json: bool,
}

fn default_host() -> String {
    "http://localhost:8888".to_string()
}

fn default_manifest() -> String {
    "manifests/lyph-templates.json".to_string()
}

fn default_id_lock_attempts() -> u32 {
    20
}

fn default_id_lock_backoff_ms() -> u64 {
    50
}

fn default_log_filter() -> String {
    "warn".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            manifest: default_manifest(),
            id_lock_attempts: default_id_lock_attempts(),
            id_lock_backoff_ms: default_id_lock_backoff_ms(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            json: false,
        }
    }
}
