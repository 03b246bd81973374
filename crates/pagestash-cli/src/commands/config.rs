//! Print the effective configuration

use anyhow::{Context, Result};
use colored::Colorize;
use pagestash_core::Config;
use pagestash_core::storage::Directories;

use crate::output::{OutputFormat, print_json};

/// Execute the config command
pub fn execute_config(config: &Config, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => print_json(config)?,
        OutputFormat::Text => {
            if let Ok(dir) = Directories::default_config_dir() {
                let path = dir.join(pagestash_core::config::CONFIG_FILE_NAME);
                let note = if path.exists() { "" } else { " (not present, using defaults)" };
                println!("{}", format!("# {}{note}", path.display()).dimmed());
            }
            let rendered =
                toml::to_string_pretty(config).context("Failed to render configuration")?;
            print!("{rendered}");
        },
    }
    Ok(())
}
