//! Command implementations for the CHIMP CLI.

pub mod datasets;
pub mod models;
pub mod plugins;
pub mod runs;
pub mod serve;

use std::path::PathBuf;

use anyhow::{Context as _, Result};
use chimp_core::{ChimpConfig, ChimpServices};
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};

/// Where the CLI reads its configuration from.
#[derive(Debug, Clone)]
pub struct Context {
    config_path: Option<PathBuf>,
}

impl Context {
    pub fn new(config_path: Option<PathBuf>) -> Self {
        Self { config_path }
    }

    pub fn config(&self) -> Result<ChimpConfig> {
        let config = match &self.config_path {
            Some(path) => {
                if !path.is_file() {
                    anyhow::bail!("Configuration file not found: {}", path.display());
                }
                ChimpConfig::load_from(path)
            }
            None => ChimpConfig::load(),
        };
        config.context("Failed to load configuration")
    }

    /// Opens the configured stores and loads the built-in plugins.
    pub fn services(&self) -> Result<ChimpServices> {
        ChimpServices::from_config(self.config()?).context("Failed to open stores")
    }
}

/// Parses `key=value`; the value may itself contain `=`.
pub fn parse_key_value(raw: &str) -> std::result::Result<(String, String), String> {
    let (key, value) =
        raw.split_once('=').ok_or_else(|| format!("expected key=value, got '{raw}'"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty key in '{raw}'"));
    }
    Ok((key.to_string(), value.to_string()))
}

pub(crate) fn table(header: &[&str]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(header.to_vec());
    table
}

pub(crate) fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_key_value() {
        assert_eq!(parse_key_value("epochs=5"), Ok(("epochs".to_string(), "5".to_string())));
        assert_eq!(parse_key_value("q=a=b"), Ok(("q".to_string(), "a=b".to_string())));
        assert!(parse_key_value("novalue").is_err());
        assert!(parse_key_value("=x").is_err());
    }
}
