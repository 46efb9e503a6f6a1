use anyhow::{Result, anyhow};
use clap::{Args, Subcommand, ValueEnum};
use std::path::Path;

use crate::config::BlockprocConfig;

#[derive(Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Display current merged configuration
    Show {
        /// Output format
        #[arg(short, long, value_enum, default_value_t = ConfigFormat::Json)]
        format: ConfigFormat,
    },
    /// Get configuration value
    Get { key: String },
    /// Validate the merged configuration
    Validate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ConfigFormat {
    Json,
    Toml,
    Yaml,
}

pub fn execute(args: ConfigArgs, custom_config: Option<&Path>) -> Result<()> {
    let config = BlockprocConfig::load_with_custom_config(custom_config)?;

    match args.command {
        ConfigCommand::Show { format } => {
            let settings = config.settings()?;
            let rendered = match format {
                ConfigFormat::Json => serde_json::to_string_pretty(&settings)?,
                ConfigFormat::Toml => toml::to_string(&settings)?,
                ConfigFormat::Yaml => serde_yml::to_string(&settings)?,
            };
            println!("{}", rendered.trim_end());
        }
        ConfigCommand::Get { key } => {
            let value = config
                .get_section(&key)
                .map_err(|_| anyhow!("Configuration key '{}' not found", key))?;
            match value {
                serde_json::Value::String(s) => println!("{}", s),
                serde_json::Value::Object(_) | serde_json::Value::Array(_) => {
                    println!("{}", serde_json::to_string_pretty(&value)?)
                }
                other => println!("{}", other),
            }
        }
        ConfigCommand::Validate => {
            config.settings()?;
            println!("Configuration is valid");
        }
    }

    Ok(())
}
