//! Configuration view and validation commands: `los config`.

use std::path::Path;

use anyhow::Result;

use super::super::ConfigCommands;
use los::config::{CliOverrides, DEFAULT_CONFIG_FILE, LosToml};

fn describe_source(config_path: Option<&Path>) -> String {
    match config_path {
        Some(p) => p.display().to_string(),
        None if Path::new(DEFAULT_CONFIG_FILE).exists() => DEFAULT_CONFIG_FILE.to_string(),
        None => "none (defaults + environment)".to_string(),
    }
}

pub fn cmd_config(config_path: Option<&Path>, command: Option<ConfigCommands>) -> Result<()> {
    let raw = LosToml::layered(config_path, &CliOverrides::default())?;

    match command {
        None | Some(ConfigCommands::Show) => {
            println!("# Config file: {}", describe_source(config_path));
            println!("# Effective values (file + environment), secrets redacted");
            println!();
            print!("{}", raw.redacted().to_toml_string()?);
        }
        Some(ConfigCommands::Validate) => {
            let warnings = raw.warnings();
            raw.resolve()?;

            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration is valid, with warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
        }
    }

    Ok(())
}
