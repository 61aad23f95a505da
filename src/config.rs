//! Layered configuration for the LOS service.
//!
//! Values resolve in this order (later wins):
//! built-in defaults → `los.toml` → environment (and `.env`) → CLI flags.
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 8000
//! cors_origins = ["http://localhost:5173"]
//!
//! [database]
//! path = ".los/los.db"
//!
//! [auth]
//! secret_key = "change-me"
//! refresh_secret_key = "change-me-too"
//! algorithm = "HS256"
//! access_token_expire_minutes = 30
//! refresh_token_expire_days = 7
//! refresh_token_rotation = true
//!
//! [notifications]
//! vapid_private_key_pem = "/etc/los/vapid_private.pem"
//! vapid_public_key = "BNc..."
//! vapid_claim_email = "mailto:ops@example.com"
//!
//! [reminders]
//! check_interval_minutes = 5
//! utc_offset_hours = 8
//! lead_minutes = 15
//! ```

use std::path::{Path, PathBuf};

use jsonwebtoken::Algorithm;
use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;

pub const DEFAULT_CONFIG_FILE: &str = "los.toml";

/// One year. Keeps `now + ttl` far inside chrono's range.
const MAX_ACCESS_TOKEN_MINUTES: i64 = 525_600;
const MAX_REFRESH_TOKEN_DAYS: i64 = 3650;
/// One day, for both the scheduler interval and the reminder lead.
const MAX_REMINDER_MINUTES: i64 = 1440;

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_cors_origins() -> Vec<String> {
    vec![
        "http://localhost:5173".to_string(),
        "http://localhost:4100".to_string(),
        "https://los.studiodtw.net".to_string(),
    ]
}

fn default_db_path() -> PathBuf {
    PathBuf::from(".los/los.db")
}

fn default_algorithm() -> String {
    "HS256".to_string()
}

fn default_access_minutes() -> i64 {
    30
}

fn default_refresh_days() -> i64 {
    7
}

fn default_true() -> bool {
    true
}

fn default_interval_minutes() -> u64 {
    5
}

fn default_utc_offset() -> i32 {
    8
}

fn default_lead_minutes() -> i64 {
    15
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origins: default_cors_origins(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSection {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthSection {
    #[serde(default)]
    pub secret_key: Option<String>,
    #[serde(default)]
    pub refresh_secret_key: Option<String>,
    #[serde(default = "default_algorithm")]
    pub algorithm: String,
    #[serde(default = "default_access_minutes")]
    pub access_token_expire_minutes: i64,
    #[serde(default = "default_refresh_days")]
    pub refresh_token_expire_days: i64,
    #[serde(default = "default_true")]
    pub refresh_token_rotation: bool,
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            secret_key: None,
            refresh_secret_key: None,
            algorithm: default_algorithm(),
            access_token_expire_minutes: default_access_minutes(),
            refresh_token_expire_days: default_refresh_days(),
            refresh_token_rotation: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationsSection {
    /// PEM text, or a path to a PEM file.
    #[serde(default)]
    pub vapid_private_key_pem: Option<String>,
    #[serde(default)]
    pub vapid_public_key: Option<String>,
    #[serde(default)]
    pub vapid_claim_email: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemindersSection {
    #[serde(default = "default_interval_minutes")]
    pub check_interval_minutes: u64,
    #[serde(default = "default_utc_offset")]
    pub utc_offset_hours: i32,
    #[serde(default = "default_lead_minutes")]
    pub lead_minutes: i64,
}

impl Default for RemindersSection {
    fn default() -> Self {
        Self {
            check_interval_minutes: default_interval_minutes(),
            utc_offset_hours: default_utc_offset(),
            lead_minutes: default_lead_minutes(),
        }
    }
}

/// Raw, unvalidated configuration as read from `los.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LosToml {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub database: DatabaseSection,
    #[serde(default)]
    pub auth: AuthSection,
    #[serde(default)]
    pub notifications: NotificationsSection,
    #[serde(default)]
    pub reminders: RemindersSection,
}

/// Flags passed on the command line; `None` leaves the lower layer alone.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub db_path: Option<PathBuf>,
}

impl LosToml {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFailed {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::ParseFailed {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load the given file, or `los.toml` in the working directory if present.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(p) => Self::load(p),
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_FILE);
                if default_path.exists() {
                    Self::load(default_path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    /// File, then process environment, then CLI flags; not yet validated.
    /// Commands that only touch the database use this so they work
    /// without secrets.
    pub fn layered(path: Option<&Path>, cli: &CliOverrides) -> Result<Self, ConfigError> {
        let mut raw = Self::load_or_default(path)?;
        raw.apply_env(|k| std::env::var(k).ok())?;
        raw.apply_cli(cli);
        Ok(raw)
    }

    /// Overlay environment variables. `lookup` is `std::env::var` in
    /// production and a map in tests.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("LOS_HOST") {
            self.server.host = v;
        }
        if let Some(v) = lookup("LOS_PORT") {
            self.server.port = parse_env("LOS_PORT", &v)?;
        }
        if let Some(v) = lookup("LOS_CORS_ORIGINS") {
            self.server.cors_origins = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(v) = lookup("LOS_DB_PATH") {
            self.database.path = PathBuf::from(v);
        }
        if let Some(v) = lookup("SECRET_KEY") {
            self.auth.secret_key = Some(v);
        }
        if let Some(v) = lookup("REFRESH_SECRET_KEY") {
            self.auth.refresh_secret_key = Some(v);
        }
        if let Some(v) = lookup("ALGORITHM") {
            self.auth.algorithm = v;
        }
        if let Some(v) = lookup("ACCESS_TOKEN_EXPIRE_MINUTES") {
            self.auth.access_token_expire_minutes = parse_env("ACCESS_TOKEN_EXPIRE_MINUTES", &v)?;
        }
        if let Some(v) = lookup("REFRESH_TOKEN_EXPIRE_DAYS") {
            self.auth.refresh_token_expire_days = parse_env("REFRESH_TOKEN_EXPIRE_DAYS", &v)?;
        }
        if let Some(v) = lookup("REFRESH_TOKEN_ROTATION") {
            self.auth.refresh_token_rotation = parse_bool("REFRESH_TOKEN_ROTATION", &v)?;
        }
        if let Some(v) = lookup("VAPID_PRIVATE_KEY") {
            self.notifications.vapid_private_key_pem = Some(v);
        }
        if let Some(v) = lookup("VAPID_PUBLIC_KEY") {
            self.notifications.vapid_public_key = Some(v);
        }
        if let Some(v) = lookup("VAPID_CLAIM_EMAIL") {
            self.notifications.vapid_claim_email = Some(v);
        }
        if let Some(v) = lookup("LOS_REMINDER_INTERVAL_MINUTES") {
            self.reminders.check_interval_minutes = parse_env("LOS_REMINDER_INTERVAL_MINUTES", &v)?;
        }
        if let Some(v) = lookup("LOS_REMINDER_UTC_OFFSET_HOURS") {
            self.reminders.utc_offset_hours = parse_env("LOS_REMINDER_UTC_OFFSET_HOURS", &v)?;
        }
        Ok(())
    }

    pub fn apply_cli(&mut self, cli: &CliOverrides) {
        if let Some(ref host) = cli.host {
            self.server.host = host.clone();
        }
        if let Some(port) = cli.port {
            self.server.port = port;
        }
        if let Some(ref path) = cli.db_path {
            self.database.path = path.clone();
        }
    }

    /// Non-fatal problems worth reporting to the operator.
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        let n = &self.notifications;
        if n.vapid_private_key_pem.is_none() || n.vapid_public_key.is_none() {
            warnings.push(
                "VAPID keys not configured; push notifications and reminders are disabled"
                    .to_string(),
            );
        } else if n.vapid_claim_email.is_none() {
            warnings.push("VAPID_CLAIM_EMAIL not set; push services may reject requests".to_string());
        }
        if self.server.cors_origins.is_empty() {
            warnings.push("No CORS origins configured; browsers will block the SPA".to_string());
        }
        warnings
    }

    /// Copy with secrets masked, for `los config show`.
    pub fn redacted(&self) -> Self {
        let mask = |v: &Option<String>| v.as_ref().map(|_| "********".to_string());
        let mut out = self.clone();
        out.auth.secret_key = mask(&self.auth.secret_key);
        out.auth.refresh_secret_key = mask(&self.auth.refresh_secret_key);
        out.notifications.vapid_private_key_pem = mask(&self.notifications.vapid_private_key_pem);
        out
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        use anyhow::Context;
        toml::to_string_pretty(self).context("Failed to serialize configuration")
    }

    /// Validate and freeze into the runtime configuration.
    pub fn resolve(self) -> Result<LosConfig, ConfigError> {
        let secret_key = require_secret(self.auth.secret_key, "auth.secret_key", "SECRET_KEY")?;
        let refresh_secret_key = require_secret(
            self.auth.refresh_secret_key,
            "auth.refresh_secret_key",
            "REFRESH_SECRET_KEY",
        )?;
        if secret_key == refresh_secret_key {
            return Err(ConfigError::InvalidValue {
                key: "auth.refresh_secret_key".into(),
                message: "must differ from auth.secret_key".into(),
            });
        }

        let algorithm = match self.auth.algorithm.to_uppercase().as_str() {
            "HS256" => Algorithm::HS256,
            "HS384" => Algorithm::HS384,
            "HS512" => Algorithm::HS512,
            other => {
                return Err(ConfigError::InvalidValue {
                    key: "auth.algorithm".into(),
                    message: format!("unsupported algorithm '{}'; use HS256, HS384 or HS512", other),
                });
            }
        };

        let access_token_ttl = within(
            "auth.access_token_expire_minutes",
            self.auth.access_token_expire_minutes,
            1..=MAX_ACCESS_TOKEN_MINUTES,
        )
        .and_then(|m| minutes("auth.access_token_expire_minutes", m))?;
        let refresh_token_ttl = within(
            "auth.refresh_token_expire_days",
            self.auth.refresh_token_expire_days,
            1..=MAX_REFRESH_TOKEN_DAYS,
        )
        .and_then(|d| {
            chrono::Duration::try_days(d).ok_or_else(|| ConfigError::InvalidValue {
                key: "auth.refresh_token_expire_days".into(),
                message: format!("{} days is out of range", d),
            })
        })?;
        let interval_minutes = self.reminders.check_interval_minutes;
        let check_interval = i64::try_from(interval_minutes)
            .ok()
            .filter(|m| (1..=MAX_REMINDER_MINUTES).contains(m))
            .and_then(|_| interval_minutes.checked_mul(60))
            .map(std::time::Duration::from_secs)
            .ok_or_else(|| ConfigError::InvalidValue {
                key: "reminders.check_interval_minutes".into(),
                message: format!("must be between 1 and {}", MAX_REMINDER_MINUTES),
            })?;
        let lead = within(
            "reminders.lead_minutes",
            self.reminders.lead_minutes,
            0..=MAX_REMINDER_MINUTES,
        )
        .and_then(|m| minutes("reminders.lead_minutes", m))?;
        let utc_offset = if (-12..=14).contains(&self.reminders.utc_offset_hours) {
            chrono::FixedOffset::east_opt(self.reminders.utc_offset_hours * 3600)
        } else {
            None
        }
        .ok_or_else(|| ConfigError::InvalidValue {
            key: "reminders.utc_offset_hours".into(),
            message: format!("{} is outside -12..=14", self.reminders.utc_offset_hours),
        })?;

        let vapid = match (
            self.notifications.vapid_private_key_pem,
            self.notifications.vapid_public_key,
        ) {
            (Some(private), Some(public)) => Some(VapidConfig {
                private_key_pem: read_pem(&private)?,
                public_key: public,
                claim_email: self.notifications.vapid_claim_email,
            }),
            _ => None,
        };

        Ok(LosConfig {
            host: self.server.host,
            port: self.server.port,
            cors_origins: self.server.cors_origins,
            db_path: self.database.path,
            auth: AuthConfig {
                secret_key,
                refresh_secret_key,
                algorithm,
                access_token_ttl,
                refresh_token_ttl,
                refresh_token_rotation: self.auth.refresh_token_rotation,
            },
            vapid,
            reminders: ReminderConfig {
                check_interval,
                utc_offset,
                lead,
            },
        })
    }
}

fn within(
    key: &str,
    value: i64,
    range: std::ops::RangeInclusive<i64>,
) -> Result<i64, ConfigError> {
    if range.contains(&value) {
        Ok(value)
    } else {
        Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("must be between {} and {}", range.start(), range.end()),
        })
    }
}

fn minutes(key: &str, value: i64) -> Result<chrono::Duration, ConfigError> {
    chrono::Duration::try_minutes(value).ok_or_else(|| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("{} minutes is out of range", value),
    })
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("cannot parse '{}'", value),
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected a boolean, got '{}'", value),
        }),
    }
}

fn require_secret(value: Option<String>, key: &str, env: &str) -> Result<String, ConfigError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(ConfigError::Missing {
            key: key.to_string(),
            env: env.to_string(),
        }),
    }
}

fn read_pem(value: &str) -> Result<String, ConfigError> {
    if value.trim_start().starts_with("-----BEGIN") {
        return Ok(value.to_string());
    }
    let path = PathBuf::from(value);
    std::fs::read_to_string(&path).map_err(|source| ConfigError::ReadFailed { path, source })
}

/// Token signing settings.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub secret_key: String,
    pub refresh_secret_key: String,
    pub algorithm: Algorithm,
    pub access_token_ttl: chrono::Duration,
    pub refresh_token_ttl: chrono::Duration,
    pub refresh_token_rotation: bool,
}

#[derive(Debug, Clone)]
pub struct VapidConfig {
    pub private_key_pem: String,
    pub public_key: String,
    pub claim_email: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ReminderConfig {
    pub check_interval: std::time::Duration,
    /// Offset of the users' local clock, used to read "HH:MM AM/PM" deadlines.
    pub utc_offset: chrono::FixedOffset,
    pub lead: chrono::Duration,
}

/// Validated runtime configuration.
#[derive(Debug, Clone)]
pub struct LosConfig {
    pub host: String,
    pub port: u16,
    pub cors_origins: Vec<String>,
    pub db_path: PathBuf,
    pub auth: AuthConfig,
    pub vapid: Option<VapidConfig>,
    pub reminders: ReminderConfig,
}

impl LosConfig {
    /// Full resolution: file → env → CLI, then validation.
    pub fn load(config_path: Option<&Path>, cli: &CliOverrides) -> Result<Self, ConfigError> {
        LosToml::layered(config_path, cli)?.resolve()
    }

    /// Configuration for tests: fixed secrets, no VAPID.
    pub fn for_tests() -> Self {
        let mut raw = LosToml::default();
        raw.auth.secret_key = Some("test-access-secret".into());
        raw.auth.refresh_secret_key = Some("test-refresh-secret".into());
        raw.database.path = PathBuf::from(":memory:");
        match raw.resolve() {
            Ok(cfg) => cfg,
            Err(e) => panic!("test configuration must be valid: {}", e),
        }
    }
}
