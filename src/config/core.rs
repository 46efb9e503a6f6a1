use anyhow::{Context, Result, bail};
use figment::{
    Figment,
    providers::{Env, Format, Json, Toml, Yaml},
};
use std::path::Path;

use super::Settings;
use super::smart_load;

// Embed the default config at compile time
const DEFAULT_CONFIG: &str = include_str!("../../default-config.toml");

/// Environment variable prefix; `__` separates nested keys
pub const ENV_PREFIX: &str = "BLOCKPROC_";

pub struct BlockprocConfig {
    figment: Figment,
}

impl BlockprocConfig {
    pub fn load() -> Result<Self> {
        Self::load_with_custom_config(None)
    }

    pub fn load_with_custom_config(custom_config: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new().merge(Toml::string(DEFAULT_CONFIG)); // Embedded defaults

        // If custom config is specified, use only that + defaults + env vars
        if let Some(custom_path) = custom_config {
            if !custom_path.exists() {
                bail!("Config file not found: {}", custom_path.display());
            }
            tracing::debug!("Loading config from {}", custom_path.display());
            figment = figment.merge(smart_load::auto(custom_path));
        } else {
            figment = figment
                // User config
                .merge(Toml::file(Self::user_config_path()))
                // Project config - support multiple formats
                .merge(Toml::file("blockproc.toml"))
                .merge(Json::file("blockproc.json"))
                .merge(Yaml::file("blockproc.yaml"))
                .merge(Yaml::file("blockproc.yml"));
        }

        // Environment variables always have highest priority
        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        Ok(BlockprocConfig { figment })
    }

    /// Typed, validated settings
    pub fn settings(&self) -> Result<Settings> {
        let settings: Settings = self
            .figment
            .extract()
            .context("Failed to parse blockproc configuration")?;
        settings.validate()?;
        Ok(settings)
    }

    /// Get a nested object/section as JSON
    pub fn get_section(&self, path: &str) -> Result<serde_json::Value> {
        Ok(self.figment.extract_inner(path)?)
    }

    fn user_config_path() -> String {
        match std::env::var("HOME") {
            Ok(home) => format!("{}/.config/blockproc/config.toml", home),
            Err(_) => "~/.config/blockproc/config.toml".to_string(),
        }
    }
}
