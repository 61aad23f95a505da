//! HTTP server command: `los serve`.

use std::path::{Path, PathBuf};

use anyhow::Result;

use los::config::{CliOverrides, LosConfig};
use los::server::server::{ServerOptions, start_server};

pub async fn cmd_serve(
    config_path: Option<&Path>,
    host: Option<String>,
    port: Option<u16>,
    db_path: Option<PathBuf>,
    dev: bool,
) -> Result<()> {
    let overrides = CliOverrides {
        host,
        port,
        db_path,
    };
    let config = LosConfig::load(config_path, &overrides)?;
    if config.vapid.is_none() {
        tracing::warn!("VAPID keys not configured; push notifications are disabled");
    }
    start_server(config, ServerOptions { dev }).await
}
