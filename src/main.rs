use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use los::logging::{self, LogFormat};

mod cmd;

#[derive(Parser)]
#[command(name = "los")]
#[command(version, about = "Life organization service: goals, tasks and daily reminders")]
pub struct Cli {
    /// Path to los.toml (defaults to ./los.toml when present)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Console log format
    #[arg(long, value_enum, default_value_t = LogFormat::Pretty, global = true)]
    pub log_format: LogFormat,

    /// Also write daily-rolling log files to this directory
    #[arg(long, global = true)]
    pub log_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP/WebSocket server and the reminder scheduler
    Serve {
        /// Interface to bind
        #[arg(long)]
        host: Option<String>,

        /// Port to serve on
        #[arg(short, long)]
        port: Option<u16>,

        /// Database path
        #[arg(long)]
        db_path: Option<PathBuf>,

        /// Enable dev mode (CORS permissive for a local frontend dev server)
        #[arg(long)]
        dev: bool,
    },
    /// Create the database and run migrations
    InitDb {
        /// Database path
        #[arg(long)]
        db_path: Option<PathBuf>,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
    /// Manage user roles offline
    Admin {
        /// Database path
        #[arg(long, global = true)]
        db_path: Option<PathBuf>,

        #[command(subcommand)]
        command: AdminCommands,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Print the effective configuration with secrets redacted
    Show,
    /// Check that the configuration resolves and report warnings
    Validate,
}

#[derive(Subcommand)]
pub enum AdminCommands {
    /// Grant the admin role to a user
    Promote { email: String },
    /// Return an admin to the user role
    Demote { email: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let _log_guard = logging::init(cli.log_format, cli.log_dir.as_deref())?;
    let config_path = cli.config.as_deref();

    match cli.command {
        Commands::Serve {
            host,
            port,
            db_path,
            dev,
        } => {
            cmd::cmd_serve(config_path, host, port, db_path, dev).await?;
        }
        Commands::InitDb { db_path } => {
            cmd::cmd_init_db(config_path, db_path)?;
        }
        Commands::Config { command } => {
            cmd::cmd_config(config_path, command)?;
        }
        Commands::Admin { db_path, command } => {
            cmd::cmd_admin(config_path, db_path, command)?;
        }
    }

    Ok(())
}
