//! Morning/evening reminder scheduler.
//!
//! Every check interval, each opted-in user with a push subscription is
//! tested against their two deadlines. A reminder is due when local time
//! falls in `[deadline - lead, deadline - lead + interval)`; with checks
//! every `interval` that window is hit by exactly one check. Deliveries are
//! recorded per local date so a restart or a slow tick cannot repeat one.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Utc};

use super::api::SharedState;
use super::db::DbHandle;
use super::models::{ClockTime, Preferences, ReminderKind};
use super::push::PushSender;
use crate::config::ReminderConfig;

/// Which reminders are due at `now_local`, keyed by the local date of the
/// deadline they announce.
pub fn due_reminders(
    prefs: &Preferences,
    now_local: NaiveDateTime,
    lead: Duration,
    interval: Duration,
) -> Vec<(ReminderKind, NaiveDate)> {
    let mut due = Vec::new();
    for (kind, deadline) in [
        (ReminderKind::Morning, &prefs.morning_deadline),
        (ReminderKind::Evening, &prefs.evening_deadline),
    ] {
        let Ok(clock) = deadline.parse::<ClockTime>() else {
            continue;
        };
        // A lead can push the window back across midnight, so tomorrow's
        // deadline is checked too.
        let today = now_local.date();
        for date in [today, today + Duration::days(1)] {
            let start = date.and_time(clock.time()) - lead;
            if now_local >= start && now_local < start + interval {
                due.push((kind, date));
            }
        }
    }
    due
}

/// Counters for one scheduler pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReminderRun {
    pub sent: usize,
    pub failed: usize,
    pub already_sent: usize,
}

/// Run one reminder pass at `now`.
pub async fn run_reminder_check(
    db: &DbHandle,
    push: &dyn PushSender,
    cfg: &ReminderConfig,
    now: DateTime<Utc>,
) -> Result<ReminderRun> {
    let now_local = now.with_timezone(&cfg.utc_offset).naive_local();
    let interval = Duration::from_std(cfg.check_interval)?;
    let users = db.call(|db| db.list_reminder_candidates()).await?;
    let mut run = ReminderRun::default();

    for user in users {
        let due = due_reminders(&user.preferences, now_local, cfg.lead, interval);
        if due.is_empty() {
            continue;
        }
        let user_id = user.id;
        let Some(subscription) = db.call(move |db| db.get_push_subscription(user_id)).await? else {
            continue;
        };

        for (kind, date) in due {
            if db
                .call(move |db| db.reminder_already_sent(user_id, kind, date))
                .await?
            {
                run.already_sent += 1;
                continue;
            }
            match push.send(&subscription, &kind.notification()).await {
                Ok(()) => {
                    db.call(move |db| db.record_reminder_sent(user_id, kind, date))
                        .await?;
                    tracing::info!(user = %user.email, kind = kind.as_str(), %date, "reminder sent");
                    run.sent += 1;
                }
                Err(e) if e.is_gone() => {
                    tracing::info!(user = %user.email, "push subscription gone; removing it");
                    db.call(move |db| db.delete_push_subscription(user_id))
                        .await?;
                    run.failed += 1;
                    break;
                }
                Err(e) => {
                    tracing::warn!(user = %user.email, kind = kind.as_str(), error = %e, "reminder delivery failed");
                    run.failed += 1;
                }
            }
        }
    }
    Ok(run)
}

/// Start the periodic scheduler. Each tick also purges expired refresh
/// tokens.
pub fn spawn_scheduler(state: SharedState) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(state.config.reminders.check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let push: Arc<dyn PushSender> = state.push.clone();
            match run_reminder_check(&state.db, push.as_ref(), &state.config.reminders, Utc::now())
                .await
            {
                Ok(run) => tracing::debug!(
                    sent = run.sent,
                    failed = run.failed,
                    already_sent = run.already_sent,
                    "reminder check finished"
                ),
                Err(e) => tracing::error!(error = %format!("{:#}", e), "reminder check failed"),
            }
            match state
                .db
                .call(|db| db.purge_expired_refresh_tokens(Utc::now()))
                .await
            {
                Ok(0) => {}
                Ok(n) => tracing::info!(purged = n, "expired refresh tokens removed"),
                Err(e) => tracing::error!(error = %format!("{:#}", e), "token purge failed"),
            }
        }
    })
}
