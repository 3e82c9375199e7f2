//! Layered configuration for the `lyph` binary.
//!
//! Sources, later ones winning: `{prefix}.toml` (optional), then
//! `LYPH__SECTION__KEY` environment variables.

use serde::Deserialize;

use lyph_core::{LogConfig, StoreConfig};
use lyph_graph::GraphConfig;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LyphConfig {
    #[serde(default)]
    pub neo4j: GraphConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub log: LogConfig,
}

/// Load configuration from `{file_prefix}.toml` and the environment.
pub fn load(file_prefix: &str) -> Result<LyphConfig, config::ConfigError> {
    let cfg = config::Config::builder()
        .add_source(config::File::with_name(file_prefix).required(false))
        .add_source(
            config::Environment::with_prefix("LYPH")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    cfg.try_deserialize()
}
