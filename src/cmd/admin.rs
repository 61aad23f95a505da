//! Offline role management: `los admin promote|demote`.

use std::path::{Path, PathBuf};

use anyhow::{Result, bail};

use super::super::AdminCommands;
use super::db::resolve_db_path;
use los::server::auth::normalize_email;
use los::server::db::LosDb;
use los::server::models::Role;

pub fn cmd_admin(
    config_path: Option<&Path>,
    db_path: Option<PathBuf>,
    command: AdminCommands,
) -> Result<()> {
    let db_path = resolve_db_path(config_path, db_path)?;
    if !db_path.exists() {
        bail!(
            "No database at {}; run 'los init-db' first",
            db_path.display()
        );
    }
    let db = LosDb::new(&db_path)?;

    let (email, role) = match command {
        AdminCommands::Promote { email } => (email, Role::Admin),
        AdminCommands::Demote { email } => (email, Role::User),
    };
    let email = normalize_email(&email);
    let Some(user) = db.get_user_by_email(&email)? else {
        bail!("No user with email {}", email);
    };

    if user.role == role {
        println!("{} already has role '{}'", email, role.as_str());
        return Ok(());
    }
    db.set_user_role(user.id, role)?;
    tracing::info!(user = %email, role = role.as_str(), "role changed from CLI");
    println!("{} now has role '{}'", email, role.as_str());
    Ok(())
}
