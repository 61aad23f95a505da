use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveTime, Timelike, Utc};
use serde::{Deserialize, Deserializer, Serialize};

pub const MAX_ACTIVE_GOALS_PER_CATEGORY: i64 = 3;
pub const MAX_TITLE_LEN: usize = 100;
pub const MAX_DESCRIPTION_LEN: usize = 500;
pub const MIN_PASSWORD_LEN: usize = 8;

// ── Users ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Admin => "admin",
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "user" => Ok(Self::User),
            "admin" => Ok(Self::Admin),
            _ => Err(format!("Invalid role: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: i64,
    pub email: String,
    pub name: Option<String>,
    pub role: Role,
    #[serde(skip_serializing)]
    pub hashed_password: String,
    pub preferences: Preferences,
    pub created_at: DateTime<Utc>,
}

/// Response body of register / login / refresh.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    pub token_type: String,
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

// ── Preferences ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Preferences {
    pub morning_deadline: String,
    pub evening_deadline: String,
    pub notifications_enabled: bool,
    pub language: String,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            morning_deadline: "09:00 AM".to_string(),
            evening_deadline: "10:00 PM".to_string(),
            notifications_enabled: false,
            language: "en".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PreferencesUpdate {
    pub morning_deadline: Option<String>,
    pub evening_deadline: Option<String>,
    pub notifications_enabled: Option<bool>,
    pub language: Option<String>,
}

impl PreferencesUpdate {
    pub fn is_empty(&self) -> bool {
        self.morning_deadline.is_none()
            && self.evening_deadline.is_none()
            && self.notifications_enabled.is_none()
            && self.language.is_none()
    }

    /// Check every provided field; returns the first problem found.
    pub fn validate(&self) -> Result<(), String> {
        if let Some(ref m) = self.morning_deadline {
            let t: ClockTime = m.parse()?;
            if !t.is_morning() {
                return Err("Morning deadline must be before 12:00 PM".to_string());
            }
        }
        if let Some(ref e) = self.evening_deadline {
            let t: ClockTime = e.parse()?;
            if t.is_morning() {
                return Err("Evening deadline must be at or after 12:00 PM".to_string());
            }
        }
        if let Some(ref lang) = self.language {
            let ok = (2..=10).contains(&lang.len())
                && lang.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');
            if !ok {
                return Err(format!("Invalid language code: {}", lang));
            }
        }
        Ok(())
    }
}

/// A wall-clock time written as "HH:MM AM/PM".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockTime(NaiveTime);

impl ClockTime {
    pub fn time(&self) -> NaiveTime {
        self.0
    }

    pub fn is_morning(&self) -> bool {
        self.0.hour() < 12
    }
}

impl FromStr for ClockTime {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || format!("Invalid time '{}': expected HH:MM AM/PM", s);
        let mut parts = s.split_whitespace();
        let (Some(clock), Some(meridiem), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(invalid());
        };
        let (h, m) = clock.split_once(':').ok_or_else(invalid)?;
        let hour: u32 = h.parse().map_err(|_| invalid())?;
        let minute: u32 = m.parse().map_err(|_| invalid())?;
        if !(1..=12).contains(&hour) || minute > 59 || m.len() != 2 {
            return Err(invalid());
        }
        let hour24 = match meridiem.to_uppercase().as_str() {
            "AM" => hour % 12,
            "PM" => hour % 12 + 12,
            _ => return Err(invalid()),
        };
        NaiveTime::from_hms_opt(hour24, minute, 0)
            .map(ClockTime)
            .ok_or_else(invalid)
    }
}

// ── Goals ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum GoalCategory {
    Family,
    Work,
    Health,
    Personal,
}

impl GoalCategory {
    pub const ALL: [GoalCategory; 4] = [Self::Family, Self::Work, Self::Health, Self::Personal];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Family => "Family",
            Self::Work => "Work",
            Self::Health => "Health",
            Self::Personal => "Personal",
        }
    }
}

impl FromStr for GoalCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Family" => Ok(Self::Family),
            "Work" => Ok(Self::Work),
            "Health" => Ok(Self::Health),
            "Personal" => Ok(Self::Personal),
            _ => Err(format!(
                "Category must be one of: Family, Work, Health, Personal (got '{}')",
                s
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GoalStatus {
    Active,
    Completed,
}

impl GoalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
        }
    }
}

impl FromStr for GoalStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            _ => Err(format!("Invalid goal status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Goal {
    pub id: i64,
    pub user_id: i64,
    pub title: String,
    pub description: Option<String>,
    pub category: GoalCategory,
    pub status: GoalStatus,
    pub target_date: Option<NaiveDate>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub days_remaining: Option<i64>,
}

impl Goal {
    /// Fill `days_remaining` relative to `today`; negative once overdue.
    pub fn with_days_remaining(mut self, today: NaiveDate) -> Self {
        self.days_remaining = self.target_date.map(|d| (d - today).num_days());
        self
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateGoalRequest {
    pub title: String,
    pub description: Option<String>,
    pub category: String,
    pub status: Option<GoalStatus>,
    pub target_date: Option<NaiveDate>,
}

/// Partial update. Category is immutable: a `category` key in the body is
/// dropped like any other unknown field.
///
/// For the nullable fields an absent key is `None` and an explicit `null`
/// is `Some(None)`, which clears the stored value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateGoalRequest {
    pub title: Option<String>,
    #[serde(default, deserialize_with = "present")]
    pub description: Option<Option<String>>,
    pub status: Option<GoalStatus>,
    #[serde(default, deserialize_with = "present")]
    pub target_date: Option<Option<NaiveDate>>,
}

/// Marks a key as present, keeping `null` distinct from a missing key.
fn present<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

pub fn validate_title(title: &str) -> Result<(), String> {
    let len = title.trim().chars().count();
    if len == 0 {
        return Err("Title must not be empty".to_string());
    }
    if len > MAX_TITLE_LEN {
        return Err(format!("Title must be at most {} characters", MAX_TITLE_LEN));
    }
    Ok(())
}

pub fn validate_description(description: &str) -> Result<(), String> {
    if description.chars().count() > MAX_DESCRIPTION_LEN {
        return Err(format!(
            "Description must be at most {} characters",
            MAX_DESCRIPTION_LEN
        ));
    }
    Ok(())
}

// ── Tasks ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    #[serde(alias = "completed")]
    Complete,
    Incomplete,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 3] = [Self::Pending, Self::Complete, Self::Incomplete];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Complete => "complete",
            Self::Incomplete => "incomplete",
        }
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "complete" | "completed" => Ok(Self::Complete),
            "incomplete" => Ok(Self::Incomplete),
            _ => Err(format!(
                "Invalid status value: {}. Allowed values are pending, complete, incomplete",
                s
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub user_id: i64,
    pub goal_id: i64,
    pub title: String,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateTaskRequest {
    pub goal_id: i64,
    pub title: String,
    pub status: Option<TaskStatus>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateTaskRequest {
    pub title: Option<String>,
    pub status: Option<TaskStatus>,
}

// ── Progress ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CategoryProgress {
    pub category: String,
    pub active_goals: i64,
    pub completed_goals: i64,
    pub pending_tasks: i64,
    pub complete_tasks: i64,
    pub incomplete_tasks: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProgressSummary {
    pub categories: Vec<CategoryProgress>,
    pub tasks_today: i64,
    pub tasks_completed_today: i64,
    /// `tasks_completed_today / tasks_today`, or 0 with no tasks today.
    pub completion_rate_today: f64,
}

// ── Notifications ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct PushSubscriptionRequest {
    pub endpoint: String,
    pub p256dh: String,
    pub auth: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushSubscription {
    pub id: i64,
    pub user_id: i64,
    pub endpoint: String,
    pub p256dh: String,
    pub auth: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// What gets shown on the user's device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Notification {
    pub title: String,
    pub body: String,
    pub icon: String,
    pub badge: String,
    pub tag: String,
}

impl Notification {
    pub fn new(title: &str, body: &str, tag: &str) -> Self {
        Self {
            title: title.to_string(),
            body: body.to_string(),
            icon: "/losicon.svg".to_string(),
            badge: "/losicon.svg".to_string(),
            tag: tag.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReminderKind {
    Morning,
    Evening,
}

impl ReminderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Morning => "morning",
            Self::Evening => "evening",
        }
    }

    pub fn notification(&self) -> Notification {
        match self {
            Self::Morning => Notification::new(
                "🌅 Good Morning!",
                "Time to set your tasks for today! Don't forget to plan your day ahead.",
                "morning-reminder",
            ),
            Self::Evening => Notification::new(
                "🌙 Good Evening!",
                "Time to review your task status for today. How did you do?",
                "evening-reminder",
            ),
        }
    }

    pub fn test_notification(&self) -> Notification {
        match self {
            Self::Morning => Notification::new(
                "🧪 Test Morning Reminder",
                "This is a test morning reminder notification.",
                "test-reminder",
            ),
            Self::Evening => Notification::new(
                "🧪 Test Evening Reminder",
                "This is a test evening reminder notification.",
                "test-reminder",
            ),
        }
    }
}

// ── Admin views ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminUserSummary {
    pub id: i64,
    pub email: String,
    pub name: Option<String>,
    pub role: Role,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminUserDetails {
    #[serde(flatten)]
    pub user: AdminUserSummary,
    pub preferences: Preferences,
    pub goal_count: i64,
    pub active_goal_count: i64,
    pub task_count: i64,
    pub has_push_subscription: bool,
}

#[derive(Debug, Clone, Default)]
pub struct UserQuery {
    pub page: u32,
    pub limit: u32,
    pub search: Option<String>,
    pub role: Option<String>,
}
