use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};

use super::models::*;

/// Async-safe handle to the LOS database.
///
/// Wraps `LosDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so synchronous SQLite I/O
/// never ties up async worker threads. A closure passed to `call` runs
/// under the lock, which makes check-then-write sequences atomic.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<LosDb>>,
}

impl DbHandle {
    pub fn new(db: LosDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&LosDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. Never from a request path.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, LosDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

pub struct LosDb {
    conn: Connection,
}

const USER_COLUMNS: &str = "id, email, name, role, hashed_password, morning_deadline, \
     evening_deadline, notifications_enabled, language, created_at";

const GOAL_COLUMNS: &str = "id, user_id, title, description, category, status, target_date, \
     completed_at, created_at, updated_at";

const TASK_COLUMNS: &str = "id, user_id, goal_id, title, status, created_at";

struct UserRow {
    id: i64,
    email: String,
    name: Option<String>,
    role: String,
    hashed_password: String,
    morning_deadline: String,
    evening_deadline: String,
    notifications_enabled: bool,
    language: String,
    created_at: DateTime<Utc>,
}

impl UserRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            email: row.get(1)?,
            name: row.get(2)?,
            role: row.get(3)?,
            hashed_password: row.get(4)?,
            morning_deadline: row.get(5)?,
            evening_deadline: row.get(6)?,
            notifications_enabled: row.get(7)?,
            language: row.get(8)?,
            created_at: row.get(9)?,
        })
    }

    fn into_user(self) -> Result<User> {
        Ok(User {
            id: self.id,
            email: self.email,
            name: self.name,
            role: Role::from_str(&self.role).map_err(|e| anyhow::anyhow!(e))?,
            hashed_password: self.hashed_password,
            preferences: Preferences {
                morning_deadline: self.morning_deadline,
                evening_deadline: self.evening_deadline,
                notifications_enabled: self.notifications_enabled,
                language: self.language,
            },
            created_at: self.created_at,
        })
    }
}

struct GoalRow {
    id: i64,
    user_id: i64,
    title: String,
    description: Option<String>,
    category: String,
    status: String,
    target_date: Option<NaiveDate>,
    completed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl GoalRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            user_id: row.get(1)?,
            title: row.get(2)?,
            description: row.get(3)?,
            category: row.get(4)?,
            status: row.get(5)?,
            target_date: row.get(6)?,
            completed_at: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
        })
    }

    fn into_goal(self) -> Result<Goal> {
        Ok(Goal {
            id: self.id,
            user_id: self.user_id,
            title: self.title,
            description: self.description,
            category: GoalCategory::from_str(&self.category).map_err(|e| anyhow::anyhow!(e))?,
            status: GoalStatus::from_str(&self.status).map_err(|e| anyhow::anyhow!(e))?,
            target_date: self.target_date,
            completed_at: self.completed_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
            days_remaining: None,
        })
    }
}

struct TaskRow {
    id: i64,
    user_id: i64,
    goal_id: i64,
    title: String,
    status: String,
    created_at: DateTime<Utc>,
}

impl TaskRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            user_id: row.get(1)?,
            goal_id: row.get(2)?,
            title: row.get(3)?,
            status: row.get(4)?,
            created_at: row.get(5)?,
        })
    }

    fn into_task(self) -> Result<Task> {
        Ok(Task {
            id: self.id,
            user_id: self.user_id,
            goal_id: self.goal_id,
            title: self.title,
            status: TaskStatus::from_str(&self.status).map_err(|e| anyhow::anyhow!(e))?,
            created_at: self.created_at,
        })
    }
}

/// Escape `%`, `_` and `\` for a `LIKE ... ESCAPE '\'` pattern.
fn like_pattern(needle: &str) -> String {
    let mut out = String::with_capacity(needle.len() + 2);
    out.push('%');
    for c in needle.to_lowercase().chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('%');
    out
}

impl LosDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS users (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    email TEXT NOT NULL UNIQUE,
                    name TEXT,
                    role TEXT NOT NULL DEFAULT 'user',
                    hashed_password TEXT NOT NULL,
                    morning_deadline TEXT NOT NULL DEFAULT '09:00 AM',
                    evening_deadline TEXT NOT NULL DEFAULT '10:00 PM',
                    notifications_enabled INTEGER NOT NULL DEFAULT 0,
                    language TEXT NOT NULL DEFAULT 'en',
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS refresh_tokens (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                    token_hash TEXT NOT NULL UNIQUE,
                    expires_at TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS goals (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                    title TEXT NOT NULL,
                    description TEXT,
                    category TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'active',
                    target_date TEXT,
                    completed_at TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS tasks (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                    goal_id INTEGER NOT NULL REFERENCES goals(id) ON DELETE CASCADE,
                    title TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'pending',
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS push_subscriptions (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    user_id INTEGER NOT NULL UNIQUE REFERENCES users(id) ON DELETE CASCADE,
                    endpoint TEXT NOT NULL,
                    p256dh TEXT NOT NULL,
                    auth TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS reminder_deliveries (
                    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                    kind TEXT NOT NULL,
                    local_date TEXT NOT NULL,
                    sent_at TEXT NOT NULL,
                    PRIMARY KEY (user_id, kind, local_date)
                );

                CREATE INDEX IF NOT EXISTS idx_refresh_tokens_user ON refresh_tokens(user_id);
                CREATE INDEX IF NOT EXISTS idx_goals_user ON goals(user_id, status);
                CREATE INDEX IF NOT EXISTS idx_goals_category ON goals(user_id, category, status);
                CREATE INDEX IF NOT EXISTS idx_tasks_user ON tasks(user_id);
                CREATE INDEX IF NOT EXISTS idx_tasks_goal ON tasks(goal_id);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Users ─────────────────────────────────────────────────────────

    /// Insert a user. Returns `None` when the email is already registered.
    pub fn create_user(
        &self,
        email: &str,
        name: Option<&str>,
        hashed_password: &str,
    ) -> Result<Option<User>> {
        if self.get_user_by_email(email)?.is_some() {
            return Ok(None);
        }
        self.conn
            .execute(
                "INSERT INTO users (email, name, hashed_password, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![email, name, hashed_password, Utc::now()],
            )
            .context("Failed to insert user")?;
        let id = self.conn.last_insert_rowid();
        self.get_user(id)
    }

    pub fn get_user(&self, id: i64) -> Result<Option<User>> {
        let sql = format!("SELECT {} FROM users WHERE id = ?1", USER_COLUMNS);
        let row = self
            .conn
            .query_row(&sql, params![id], UserRow::from_row)
            .optional()
            .context("Failed to query user")?;
        row.map(UserRow::into_user).transpose()
    }

    pub fn get_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let sql = format!("SELECT {} FROM users WHERE email = ?1", USER_COLUMNS);
        let row = self
            .conn
            .query_row(&sql, params![email], UserRow::from_row)
            .optional()
            .context("Failed to query user by email")?;
        row.map(UserRow::into_user).transpose()
    }

    pub fn update_user_name(&self, id: i64, name: &str) -> Result<User> {
        self.conn
            .execute("UPDATE users SET name = ?1 WHERE id = ?2", params![name, id])
            .context("Failed to update user name")?;
        self.get_user(id)?.context("User not found after name update")
    }

    pub fn set_user_role(&self, id: i64, role: Role) -> Result<User> {
        self.conn
            .execute(
                "UPDATE users SET role = ?1 WHERE id = ?2",
                params![role.as_str(), id],
            )
            .context("Failed to update user role")?;
        self.get_user(id)?.context("User not found after role update")
    }

    /// Replace the password hash and drop every refresh token in one
    /// transaction, so no session outlives a password change.
    pub fn update_password(&self, id: i64, hashed_password: &str) -> Result<()> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        tx.execute(
            "UPDATE users SET hashed_password = ?1 WHERE id = ?2",
            params![hashed_password, id],
        )
        .context("Failed to update password")?;
        tx.execute("DELETE FROM refresh_tokens WHERE user_id = ?1", params![id])
            .context("Failed to revoke refresh tokens")?;
        tx.commit().context("Failed to commit password change")?;
        Ok(())
    }

    /// Delete a user; goals, tasks, tokens and subscriptions cascade.
    pub fn delete_user(&self, id: i64) -> Result<bool> {
        let count = self
            .conn
            .execute("DELETE FROM users WHERE id = ?1", params![id])
            .context("Failed to delete user")?;
        Ok(count > 0)
    }

    pub fn list_users(&self, query: &UserQuery) -> Result<Vec<AdminUserSummary>> {
        let limit = query.limit.max(1) as i64;
        let offset = (query.page.max(1) as i64 - 1) * limit;
        let search = query
            .search
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .map(|s| like_pattern(s.trim()));
        let role = query
            .role
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .map(|s| s.trim().to_lowercase());

        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, email, name, role, created_at FROM users
                 WHERE (?1 IS NULL OR lower(email) LIKE ?1 ESCAPE '\\'
                        OR lower(COALESCE(name, '')) LIKE ?1 ESCAPE '\\')
                   AND (?2 IS NULL OR lower(role) = ?2)
                 ORDER BY id
                 LIMIT ?3 OFFSET ?4",
            )
            .context("Failed to prepare list_users")?;
        let rows = stmt
            .query_map(params![search, role, limit, offset], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, DateTime<Utc>>(4)?,
                ))
            })
            .context("Failed to query users")?;
        let mut users = Vec::new();
        for row in rows {
            let (id, email, name, role, created_at) = row.context("Failed to read user row")?;
            users.push(AdminUserSummary {
                id,
                email,
                name,
                role: Role::from_str(&role).map_err(|e| anyhow::anyhow!(e))?,
                created_at,
            });
        }
        Ok(users)
    }

    pub fn get_user_details(&self, id: i64) -> Result<Option<AdminUserDetails>> {
        let Some(user) = self.get_user(id)? else {
            return Ok(None);
        };
        let (goal_count, active_goal_count): (i64, i64) = self
            .conn
            .query_row(
                "SELECT COUNT(*), COALESCE(SUM(status = 'active'), 0) FROM goals WHERE user_id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .context("Failed to count goals")?;
        let task_count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM tasks WHERE user_id = ?1",
                params![id],
                |row| row.get(0),
            )
            .context("Failed to count tasks")?;
        let has_push_subscription = self.get_push_subscription(id)?.is_some();
        Ok(Some(AdminUserDetails {
            user: AdminUserSummary {
                id: user.id,
                email: user.email,
                name: user.name,
                role: user.role,
                created_at: user.created_at,
            },
            preferences: user.preferences,
            goal_count,
            active_goal_count,
            task_count,
            has_push_subscription,
        }))
    }

    /// Apply a partial preferences update. Callers validate first.
    pub fn update_preferences(&self, id: i64, update: &PreferencesUpdate) -> Result<Preferences> {
        self.conn
            .execute(
                "UPDATE users SET
                    morning_deadline = COALESCE(?1, morning_deadline),
                    evening_deadline = COALESCE(?2, evening_deadline),
                    notifications_enabled = COALESCE(?3, notifications_enabled),
                    language = COALESCE(?4, language)
                 WHERE id = ?5",
                params![
                    update.morning_deadline,
                    update.evening_deadline,
                    update.notifications_enabled,
                    update.language,
                    id
                ],
            )
            .context("Failed to update preferences")?;
        let user = self
            .get_user(id)?
            .context("User not found after preferences update")?;
        Ok(user.preferences)
    }

    /// Users who opted into notifications and have a push subscription.
    pub fn list_reminder_candidates(&self) -> Result<Vec<User>> {
        let sql = format!(
            "SELECT {} FROM users u
             WHERE notifications_enabled = 1
               AND EXISTS (SELECT 1 FROM push_subscriptions p WHERE p.user_id = u.id)
             ORDER BY id",
            USER_COLUMNS
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare list_reminder_candidates")?;
        let rows = stmt
            .query_map([], UserRow::from_row)
            .context("Failed to query reminder candidates")?;
        let mut users = Vec::new();
        for row in rows {
            users.push(row.context("Failed to read user row")?.into_user()?);
        }
        Ok(users)
    }

    // ── Refresh tokens ────────────────────────────────────────────────

    pub fn store_refresh_token(
        &self,
        user_id: i64,
        token_hash: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO refresh_tokens (user_id, token_hash, expires_at, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![user_id, token_hash, expires_at, Utc::now()],
            )
            .context("Failed to store refresh token")?;
        Ok(())
    }

    /// Expiry of a stored refresh token, if the user still holds it.
    pub fn find_refresh_token(
        &self,
        user_id: i64,
        token_hash: &str,
    ) -> Result<Option<DateTime<Utc>>> {
        self.conn
            .query_row(
                "SELECT expires_at FROM refresh_tokens WHERE user_id = ?1 AND token_hash = ?2",
                params![user_id, token_hash],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query refresh token")
    }

    /// Swap one refresh token for another atomically.
    pub fn rotate_refresh_token(
        &self,
        user_id: i64,
        old_hash: &str,
        new_hash: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let removed = tx
            .execute(
                "DELETE FROM refresh_tokens WHERE user_id = ?1 AND token_hash = ?2",
                params![user_id, old_hash],
            )
            .context("Failed to revoke old refresh token")?;
        if removed == 0 {
            return Ok(false);
        }
        tx.execute(
            "INSERT INTO refresh_tokens (user_id, token_hash, expires_at, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![user_id, new_hash, expires_at, Utc::now()],
        )
        .context("Failed to store rotated refresh token")?;
        tx.commit().context("Failed to commit token rotation")?;
        Ok(true)
    }

    pub fn revoke_all_refresh_tokens(&self, user_id: i64) -> Result<usize> {
        self.conn
            .execute(
                "DELETE FROM refresh_tokens WHERE user_id = ?1",
                params![user_id],
            )
            .context("Failed to revoke refresh tokens")
    }

    pub fn count_refresh_tokens(&self, user_id: i64) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM refresh_tokens WHERE user_id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .context("Failed to count refresh tokens")
    }

    /// Drop expired refresh tokens; returns how many were removed.
    pub fn purge_expired_refresh_tokens(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, expires_at FROM refresh_tokens")
            .context("Failed to prepare token scan")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, DateTime<Utc>>(1)?))
            })
            .context("Failed to scan refresh tokens")?;
        let mut expired = Vec::new();
        for row in rows {
            let (id, expires_at) = row.context("Failed to read refresh token row")?;
            if expires_at <= now {
                expired.push(id);
            }
        }
        for id in &expired {
            self.conn
                .execute("DELETE FROM refresh_tokens WHERE id = ?1", params![id])
                .context("Failed to delete expired refresh token")?;
        }
        Ok(expired.len())
    }

    // ── Goals ─────────────────────────────────────────────────────────

    pub fn count_active_goals(
        &self,
        user_id: i64,
        category: GoalCategory,
        excluding: Option<i64>,
    ) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM goals
                 WHERE user_id = ?1 AND category = ?2 AND status = 'active'
                   AND (?3 IS NULL OR id != ?3)",
                params![user_id, category.as_str(), excluding],
                |row| row.get(0),
            )
            .context("Failed to count active goals")
    }

    pub fn create_goal(
        &self,
        user_id: i64,
        title: &str,
        description: Option<&str>,
        category: GoalCategory,
        status: GoalStatus,
        target_date: Option<NaiveDate>,
    ) -> Result<Goal> {
        let now = Utc::now();
        let completed_at = (status == GoalStatus::Completed).then_some(now);
        self.conn
            .execute(
                "INSERT INTO goals (user_id, title, description, category, status, target_date,
                                    completed_at, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
                params![
                    user_id,
                    title,
                    description,
                    category.as_str(),
                    status.as_str(),
                    target_date,
                    completed_at,
                    now
                ],
            )
            .context("Failed to insert goal")?;
        let id = self.conn.last_insert_rowid();
        self.get_goal(id)?.context("Goal not found after insert")
    }

    pub fn get_goal(&self, id: i64) -> Result<Option<Goal>> {
        let sql = format!("SELECT {} FROM goals WHERE id = ?1", GOAL_COLUMNS);
        let row = self
            .conn
            .query_row(&sql, params![id], GoalRow::from_row)
            .optional()
            .context("Failed to query goal")?;
        row.map(GoalRow::into_goal).transpose()
    }

    pub fn list_goals(&self, user_id: i64, status: Option<GoalStatus>) -> Result<Vec<Goal>> {
        let sql = format!(
            "SELECT {} FROM goals WHERE user_id = ?1 AND (?2 IS NULL OR status = ?2) ORDER BY id",
            GOAL_COLUMNS
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare list_goals")?;
        let rows = stmt
            .query_map(
                params![user_id, status.map(|s| s.as_str())],
                GoalRow::from_row,
            )
            .context("Failed to query goals")?;
        let mut goals = Vec::new();
        for row in rows {
            let r = row.context("Failed to read goal row")?;
            let id = r.id;
            // Rows whose enum columns no longer parse are skipped, not fatal.
            match r.into_goal() {
                Ok(goal) => goals.push(goal),
                Err(e) => tracing::warn!(goal_id = id, error = %e, "skipping unreadable goal"),
            }
        }
        Ok(goals)
    }

    /// Write the merged goal back. `completed_at` is written as given.
    pub fn save_goal(&self, goal: &Goal) -> Result<Goal> {
        self.conn
            .execute(
                "UPDATE goals SET title = ?1, description = ?2, status = ?3, target_date = ?4,
                                  completed_at = ?5, updated_at = ?6
                 WHERE id = ?7",
                params![
                    goal.title,
                    goal.description,
                    goal.status.as_str(),
                    goal.target_date,
                    goal.completed_at,
                    Utc::now(),
                    goal.id
                ],
            )
            .context("Failed to update goal")?;
        self.get_goal(goal.id)?.context("Goal not found after update")
    }

    pub fn delete_goal(&self, id: i64) -> Result<bool> {
        let count = self
            .conn
            .execute("DELETE FROM goals WHERE id = ?1", params![id])
            .context("Failed to delete goal")?;
        Ok(count > 0)
    }

    // ── Tasks ─────────────────────────────────────────────────────────

    pub fn create_task(
        &self,
        user_id: i64,
        goal_id: i64,
        title: &str,
        status: TaskStatus,
    ) -> Result<Task> {
        self.conn
            .execute(
                "INSERT INTO tasks (user_id, goal_id, title, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![user_id, goal_id, title, status.as_str(), Utc::now()],
            )
            .context("Failed to insert task")?;
        let id = self.conn.last_insert_rowid();
        self.get_task(id)?.context("Task not found after insert")
    }

    pub fn get_task(&self, id: i64) -> Result<Option<Task>> {
        let sql = format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS);
        let row = self
            .conn
            .query_row(&sql, params![id], TaskRow::from_row)
            .optional()
            .context("Failed to query task")?;
        row.map(TaskRow::into_task).transpose()
    }

    pub fn list_tasks(
        &self,
        user_id: i64,
        goal_id: Option<i64>,
        status: Option<TaskStatus>,
    ) -> Result<Vec<Task>> {
        let sql = format!(
            "SELECT {} FROM tasks
             WHERE user_id = ?1 AND (?2 IS NULL OR goal_id = ?2) AND (?3 IS NULL OR status = ?3)
             ORDER BY id",
            TASK_COLUMNS
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare list_tasks")?;
        let rows = stmt
            .query_map(
                params![user_id, goal_id, status.map(|s| s.as_str())],
                TaskRow::from_row,
            )
            .context("Failed to query tasks")?;
        let mut tasks = Vec::new();
        for row in rows {
            let r = row.context("Failed to read task row")?;
            let id = r.id;
            match r.into_task() {
                Ok(task) => tasks.push(task),
                Err(e) => tracing::warn!(task_id = id, error = %e, "skipping unreadable task"),
            }
        }
        Ok(tasks)
    }

    pub fn update_task(
        &self,
        id: i64,
        title: Option<&str>,
        status: Option<TaskStatus>,
    ) -> Result<Task> {
        self.conn
            .execute(
                "UPDATE tasks SET title = COALESCE(?1, title), status = COALESCE(?2, status)
                 WHERE id = ?3",
                params![title, status.map(|s| s.as_str()), id],
            )
            .context("Failed to update task")?;
        self.get_task(id)?.context("Task not found after update")
    }

    pub fn delete_task(&self, id: i64) -> Result<bool> {
        let count = self
            .conn
            .execute("DELETE FROM tasks WHERE id = ?1", params![id])
            .context("Failed to delete task")?;
        Ok(count > 0)
    }

    // ── Progress ──────────────────────────────────────────────────────

    /// Goal and task counts per category, in `GoalCategory::ALL` order.
    pub fn category_progress(&self, user_id: i64) -> Result<Vec<CategoryProgress>> {
        let mut progress: Vec<CategoryProgress> = GoalCategory::ALL
            .iter()
            .map(|c| CategoryProgress {
                category: c.as_str().to_string(),
                ..Default::default()
            })
            .collect();
        let slot = |progress: &[CategoryProgress], category: &str| {
            progress.iter().position(|p| p.category == category)
        };

        let mut stmt = self
            .conn
            .prepare(
                "SELECT category, status, COUNT(*) FROM goals WHERE user_id = ?1
                 GROUP BY category, status",
            )
            .context("Failed to prepare goal progress")?;
        let rows = stmt
            .query_map(params![user_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })
            .context("Failed to query goal progress")?;
        for row in rows {
            let (category, status, count) = row.context("Failed to read goal progress row")?;
            if let Some(i) = slot(&progress, &category) {
                match status.as_str() {
                    "active" => progress[i].active_goals += count,
                    "completed" => progress[i].completed_goals += count,
                    _ => {}
                }
            }
        }

        let mut stmt = self
            .conn
            .prepare(
                "SELECT g.category, t.status, COUNT(*) FROM tasks t
                 JOIN goals g ON g.id = t.goal_id
                 WHERE t.user_id = ?1
                 GROUP BY g.category, t.status",
            )
            .context("Failed to prepare task progress")?;
        let rows = stmt
            .query_map(params![user_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })
            .context("Failed to query task progress")?;
        for row in rows {
            let (category, status, count) = row.context("Failed to read task progress row")?;
            if let Some(i) = slot(&progress, &category) {
                match status.as_str() {
                    "pending" => progress[i].pending_tasks += count,
                    "complete" => progress[i].complete_tasks += count,
                    "incomplete" => progress[i].incomplete_tasks += count,
                    _ => {}
                }
            }
        }
        Ok(progress)
    }

    // ── Push subscriptions ────────────────────────────────────────────

    /// One subscription per user; a second subscribe replaces the keys.
    pub fn upsert_push_subscription(
        &self,
        user_id: i64,
        endpoint: &str,
        p256dh: &str,
        auth: &str,
    ) -> Result<PushSubscription> {
        let now = Utc::now();
        self.conn
            .execute(
                "INSERT INTO push_subscriptions (user_id, endpoint, p256dh, auth, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)
                 ON CONFLICT(user_id) DO UPDATE SET
                    endpoint = excluded.endpoint,
                    p256dh = excluded.p256dh,
                    auth = excluded.auth,
                    updated_at = excluded.updated_at",
                params![user_id, endpoint, p256dh, auth, now],
            )
            .context("Failed to upsert push subscription")?;
        self.get_push_subscription(user_id)?
            .context("Push subscription not found after upsert")
    }

    pub fn get_push_subscription(&self, user_id: i64) -> Result<Option<PushSubscription>> {
        self.conn
            .query_row(
                "SELECT id, user_id, endpoint, p256dh, auth, created_at, updated_at
                 FROM push_subscriptions WHERE user_id = ?1",
                params![user_id],
                |row| {
                    Ok(PushSubscription {
                        id: row.get(0)?,
                        user_id: row.get(1)?,
                        endpoint: row.get(2)?,
                        p256dh: row.get(3)?,
                        auth: row.get(4)?,
                        created_at: row.get(5)?,
                        updated_at: row.get(6)?,
                    })
                },
            )
            .optional()
            .context("Failed to query push subscription")
    }

    pub fn delete_push_subscription(&self, user_id: i64) -> Result<bool> {
        let count = self
            .conn
            .execute(
                "DELETE FROM push_subscriptions WHERE user_id = ?1",
                params![user_id],
            )
            .context("Failed to delete push subscription")?;
        Ok(count > 0)
    }

    // ── Reminder deliveries ───────────────────────────────────────────

    pub fn reminder_already_sent(
        &self,
        user_id: i64,
        kind: ReminderKind,
        local_date: NaiveDate,
    ) -> Result<bool> {
        let exists: bool = self
            .conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM reminder_deliveries
                               WHERE user_id = ?1 AND kind = ?2 AND local_date = ?3)",
                params![user_id, kind.as_str(), local_date],
                |row| row.get(0),
            )
            .context("Failed to query reminder deliveries")?;
        Ok(exists)
    }

    pub fn record_reminder_sent(
        &self,
        user_id: i64,
        kind: ReminderKind,
        local_date: NaiveDate,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR IGNORE INTO reminder_deliveries (user_id, kind, local_date, sent_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![user_id, kind.as_str(), local_date, Utc::now()],
            )
            .context("Failed to record reminder delivery")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn db_with_user() -> (LosDb, User) {
        let db = LosDb::new_in_memory().unwrap();
        let user = db
            .create_user("ada@example.com", Some("Ada"), "hash")
            .unwrap()
            .unwrap();
        (db, user)
    }

    fn goal(db: &LosDb, user_id: i64, title: &str, category: GoalCategory) -> Goal {
        db.create_goal(user_id, title, None, category, GoalStatus::Active, None)
            .unwrap()
    }

    #[test]
    fn test_create_user_with_default_preferences() -> Result<()> {
        let (db, user) = db_with_user();
        assert_eq!(user.email, "ada@example.com");
        assert_eq!(user.name.as_deref(), Some("Ada"));
        assert_eq!(user.role, Role::User);
        assert_eq!(user.preferences, Preferences::default());
        assert!(db.get_user_by_email("ada@example.com")?.is_some());
        Ok(())
    }

    #[test]
    fn test_create_user_rejects_duplicate_email() -> Result<()> {
        let (db, _) = db_with_user();
        assert!(db.create_user("ada@example.com", None, "other")?.is_none());
        Ok(())
    }

    #[test]
    fn test_update_password_revokes_tokens() -> Result<()> {
        let (db, user) = db_with_user();
        let exp = Utc::now() + Duration::days(7);
        db.store_refresh_token(user.id, "h1", exp)?;
        db.store_refresh_token(user.id, "h2", exp)?;
        assert_eq!(db.count_refresh_tokens(user.id)?, 2);

        db.update_password(user.id, "newhash")?;
        assert_eq!(db.count_refresh_tokens(user.id)?, 0);
        assert_eq!(db.get_user(user.id)?.unwrap().hashed_password, "newhash");
        Ok(())
    }

    #[test]
    fn test_rotate_refresh_token() -> Result<()> {
        let (db, user) = db_with_user();
        let exp = Utc::now() + Duration::days(7);
        db.store_refresh_token(user.id, "old", exp)?;

        assert!(db.rotate_refresh_token(user.id, "old", "new", exp)?);
        assert!(db.find_refresh_token(user.id, "old")?.is_none());
        assert!(db.find_refresh_token(user.id, "new")?.is_some());

        // Replaying the old token must not mint another one.
        assert!(!db.rotate_refresh_token(user.id, "old", "newer", exp)?);
        assert!(db.find_refresh_token(user.id, "newer")?.is_none());
        Ok(())
    }

    #[test]
    fn test_purge_expired_refresh_tokens() -> Result<()> {
        let (db, user) = db_with_user();
        let now = Utc::now();
        db.store_refresh_token(user.id, "stale", now - Duration::minutes(1))?;
        db.store_refresh_token(user.id, "fresh", now + Duration::days(1))?;
        assert_eq!(db.purge_expired_refresh_tokens(now)?, 1);
        assert!(db.find_refresh_token(user.id, "fresh")?.is_some());
        Ok(())
    }

    #[test]
    fn test_delete_user_cascades() -> Result<()> {
        let (db, user) = db_with_user();
        let g = goal(&db, user.id, "Run", GoalCategory::Health);
        let t = db.create_task(user.id, g.id, "Jog", TaskStatus::Pending)?;
        db.store_refresh_token(user.id, "h", Utc::now() + Duration::days(1))?;
        db.upsert_push_subscription(user.id, "https://push.test/1", "p", "a")?;

        assert!(db.delete_user(user.id)?);
        assert!(db.get_goal(g.id)?.is_none());
        assert!(db.get_task(t.id)?.is_none());
        assert!(db.get_push_subscription(user.id)?.is_none());
        assert_eq!(db.count_refresh_tokens(user.id)?, 0);
        assert!(!db.delete_user(user.id)?);
        Ok(())
    }

    #[test]
    fn test_goal_crud_and_status_filter() -> Result<()> {
        let (db, user) = db_with_user();
        let a = goal(&db, user.id, "Run", GoalCategory::Health);
        let b = goal(&db, user.id, "Ship", GoalCategory::Work);

        let mut done = b.clone();
        done.status = GoalStatus::Completed;
        done.completed_at = Some(Utc::now());
        let saved = db.save_goal(&done)?;
        assert_eq!(saved.status, GoalStatus::Completed);
        assert!(saved.completed_at.is_some());

        let active = db.list_goals(user.id, Some(GoalStatus::Active))?;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, a.id);
        assert_eq!(db.list_goals(user.id, None)?.len(), 2);

        assert!(db.delete_goal(a.id)?);
        assert!(db.get_goal(a.id)?.is_none());
        Ok(())
    }

    #[test]
    fn test_count_active_goals_per_category() -> Result<()> {
        let (db, user) = db_with_user();
        let g1 = goal(&db, user.id, "One", GoalCategory::Family);
        goal(&db, user.id, "Two", GoalCategory::Family);
        goal(&db, user.id, "Other", GoalCategory::Work);
        assert_eq!(db.count_active_goals(user.id, GoalCategory::Family, None)?, 2);
        assert_eq!(
            db.count_active_goals(user.id, GoalCategory::Family, Some(g1.id))?,
            1
        );
        assert_eq!(db.count_active_goals(user.id, GoalCategory::Health, None)?, 0);
        Ok(())
    }

    #[test]
    fn test_goal_target_date_round_trips() -> Result<()> {
        let (db, user) = db_with_user();
        let date = NaiveDate::from_ymd_opt(2026, 12, 31);
        let g = db.create_goal(
            user.id,
            "Year end",
            Some("wrap up"),
            GoalCategory::Personal,
            GoalStatus::Active,
            date,
        )?;
        assert_eq!(db.get_goal(g.id)?.unwrap().target_date, date);
        Ok(())
    }

    #[test]
    fn test_delete_goal_removes_its_tasks() -> Result<()> {
        let (db, user) = db_with_user();
        let g = goal(&db, user.id, "Run", GoalCategory::Health);
        let t = db.create_task(user.id, g.id, "Jog", TaskStatus::Pending)?;
        db.delete_goal(g.id)?;
        assert!(db.get_task(t.id)?.is_none());
        Ok(())
    }

    #[test]
    fn test_task_filters_and_update() -> Result<()> {
        let (db, user) = db_with_user();
        let g1 = goal(&db, user.id, "Run", GoalCategory::Health);
        let g2 = goal(&db, user.id, "Read", GoalCategory::Personal);
        let t1 = db.create_task(user.id, g1.id, "Jog", TaskStatus::Pending)?;
        db.create_task(user.id, g2.id, "Chapter", TaskStatus::Pending)?;

        assert_eq!(db.list_tasks(user.id, Some(g1.id), None)?.len(), 1);

        let updated = db.update_task(t1.id, None, Some(TaskStatus::Complete))?;
        assert_eq!(updated.status, TaskStatus::Complete);
        assert_eq!(updated.title, "Jog");

        let complete = db.list_tasks(user.id, None, Some(TaskStatus::Complete))?;
        assert_eq!(complete.len(), 1);
        assert_eq!(complete[0].id, t1.id);
        Ok(())
    }

    #[test]
    fn test_lists_skip_rows_with_unknown_enum_values() -> Result<()> {
        let (db, user) = db_with_user();
        let g1 = goal(&db, user.id, "Run", GoalCategory::Health);
        let g2 = goal(&db, user.id, "Read", GoalCategory::Personal);
        let t1 = db.create_task(user.id, g1.id, "Jog", TaskStatus::Pending)?;
        let t2 = db.create_task(user.id, g1.id, "Sprint", TaskStatus::Pending)?;

        db.conn
            .execute("UPDATE goals SET status = 'archived' WHERE id = ?1", params![g2.id])?;
        db.conn
            .execute("UPDATE tasks SET status = 'done' WHERE id = ?1", params![t2.id])?;

        let goals = db.list_goals(user.id, None)?;
        assert_eq!(goals.iter().map(|g| g.id).collect::<Vec<_>>(), vec![g1.id]);
        let tasks = db.list_tasks(user.id, None, None)?;
        assert_eq!(tasks.iter().map(|t| t.id).collect::<Vec<_>>(), vec![t1.id]);
        Ok(())
    }

    #[test]
    fn test_category_progress_counts() -> Result<()> {
        let (db, user) = db_with_user();
        let g = goal(&db, user.id, "Run", GoalCategory::Health);
        let t = db.create_task(user.id, g.id, "Jog", TaskStatus::Pending)?;
        db.create_task(user.id, g.id, "Swim", TaskStatus::Pending)?;
        db.update_task(t.id, None, Some(TaskStatus::Complete))?;

        let progress = db.category_progress(user.id)?;
        assert_eq!(progress.len(), 4);
        let health = progress.iter().find(|p| p.category == "Health").unwrap();
        assert_eq!(health.active_goals, 1);
        assert_eq!(health.complete_tasks, 1);
        assert_eq!(health.pending_tasks, 1);
        let work = progress.iter().find(|p| p.category == "Work").unwrap();
        assert_eq!(work.active_goals, 0);
        Ok(())
    }

    #[test]
    fn test_preferences_partial_update() -> Result<()> {
        let (db, user) = db_with_user();
        let prefs = db.update_preferences(
            user.id,
            &PreferencesUpdate {
                notifications_enabled: Some(true),
                ..Default::default()
            },
        )?;
        assert!(prefs.notifications_enabled);
        assert_eq!(prefs.morning_deadline, "09:00 AM");
        Ok(())
    }

    #[test]
    fn test_push_subscription_upsert_keeps_one_row() -> Result<()> {
        let (db, user) = db_with_user();
        let first = db.upsert_push_subscription(user.id, "https://push.test/a", "k1", "a1")?;
        let second = db.upsert_push_subscription(user.id, "https://push.test/b", "k2", "a2")?;
        assert_eq!(first.id, second.id);
        assert_eq!(second.endpoint, "https://push.test/b");
        assert!(db.delete_push_subscription(user.id)?);
        assert!(!db.delete_push_subscription(user.id)?);
        Ok(())
    }

    #[test]
    fn test_reminder_candidates_need_opt_in_and_subscription() -> Result<()> {
        let (db, user) = db_with_user();
        assert!(db.list_reminder_candidates()?.is_empty());
        db.update_preferences(
            user.id,
            &PreferencesUpdate {
                notifications_enabled: Some(true),
                ..Default::default()
            },
        )?;
        assert!(db.list_reminder_candidates()?.is_empty());
        db.upsert_push_subscription(user.id, "https://push.test/a", "k", "a")?;
        assert_eq!(db.list_reminder_candidates()?.len(), 1);
        Ok(())
    }

    #[test]
    fn test_reminder_delivery_is_recorded_once_per_day() -> Result<()> {
        let (db, user) = db_with_user();
        let day = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        assert!(!db.reminder_already_sent(user.id, ReminderKind::Morning, day)?);
        db.record_reminder_sent(user.id, ReminderKind::Morning, day)?;
        db.record_reminder_sent(user.id, ReminderKind::Morning, day)?;
        assert!(db.reminder_already_sent(user.id, ReminderKind::Morning, day)?);
        assert!(!db.reminder_already_sent(user.id, ReminderKind::Evening, day)?);
        Ok(())
    }

    #[test]
    fn test_list_users_search_role_and_paging() -> Result<()> {
        let db = LosDb::new_in_memory()?;
        for i in 0..5 {
            db.create_user(&format!("user{}@example.com", i), Some("Plain"), "h")?;
        }
        let admin = db
            .create_user("boss@corp.test", Some("The_Boss"), "h")?
            .unwrap();
        db.set_user_role(admin.id, Role::Admin)?;

        let page = |page, limit| UserQuery {
            page,
            limit,
            ..Default::default()
        };
        assert_eq!(db.list_users(&page(1, 4))?.len(), 4);
        assert_eq!(db.list_users(&page(2, 4))?.len(), 2);

        let found = db.list_users(&UserQuery {
            page: 1,
            limit: 10,
            search: Some("BOSS".into()),
            role: None,
        })?;
        assert_eq!(found.len(), 1);

        // `_` is literal, not a wildcard.
        let underscore = db.list_users(&UserQuery {
            page: 1,
            limit: 10,
            search: Some("e_b".into()),
            role: None,
        })?;
        assert_eq!(underscore.len(), 1);

        let admins = db.list_users(&UserQuery {
            page: 1,
            limit: 10,
            search: None,
            role: Some("ADMIN".into()),
        })?;
        assert_eq!(admins.len(), 1);
        assert_eq!(admins[0].role, Role::Admin);
        Ok(())
    }

    #[test]
    fn test_user_details_counts() -> Result<()> {
        let (db, user) = db_with_user();
        let g = goal(&db, user.id, "Run", GoalCategory::Health);
        db.create_task(user.id, g.id, "Jog", TaskStatus::Pending)?;
        let details = db.get_user_details(user.id)?.unwrap();
        assert_eq!(details.goal_count, 1);
        assert_eq!(details.active_goal_count, 1);
        assert_eq!(details.task_count, 1);
        assert!(!details.has_push_subscription);
        assert!(db.get_user_details(999)?.is_none());
        Ok(())
    }

    #[test]
    fn test_like_pattern_escapes_wildcards() {
        assert_eq!(like_pattern("A%b_c"), "%a\\%b\\_c%");
    }

    #[tokio::test]
    async fn test_db_handle_call_runs_closure() -> Result<()> {
        let handle = DbHandle::new(LosDb::new_in_memory()?);
        let user = handle
            .call(|db| db.create_user("x@example.com", None, "h"))
            .await?
            .unwrap();
        let fetched = handle.call(move |db| db.get_user(user.id)).await?;
        assert_eq!(fetched.unwrap().email, "x@example.com");
        Ok(())
    }
}
