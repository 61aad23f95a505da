//! Database bootstrap command: `los init-db`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use los::config::{CliOverrides, LosToml};
use los::server::db::LosDb;

/// Resolve the database path from file, environment and `--db-path`.
/// Secrets are not required here.
pub fn resolve_db_path(config_path: Option<&Path>, db_path: Option<PathBuf>) -> Result<PathBuf> {
    let overrides = CliOverrides {
        db_path,
        ..Default::default()
    };
    Ok(LosToml::layered(config_path, &overrides)?.database.path)
}

pub fn cmd_init_db(config_path: Option<&Path>, db_path: Option<PathBuf>) -> Result<()> {
    let db_path = resolve_db_path(config_path, db_path)?;
    if let Some(parent) = db_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    LosDb::new(&db_path)?;
    tracing::info!(db = %db_path.display(), "database initialized");
    println!("Database initialized at {}", db_path.display());
    Ok(())
}
