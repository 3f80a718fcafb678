//! Heartbeat scheduler.
//!
//! Configured heartbeats are cron-driven synthetic user turns: at each
//! firing the gateway feeds the heartbeat's prompt through the
//! orchestrator under a synthetic session and delivers the result as a
//! notification.  The tick loop evaluates schedules on a 30-second
//! granularity; `heartbeat-list` / `heartbeat-toggle` commands inspect
//! and flip entries at runtime.

use std::{
    str::FromStr,
    sync::{Arc, Mutex},
    time::Duration,
};

use chrono::{DateTime, Utc};
use cron::Schedule;

use crate::config::schema::HeartbeatConfig;

/// Tick period of the scheduler loop.
pub const TICK_PERIOD: Duration = Duration::from_secs(30);

struct Entry {
    config: HeartbeatConfig,
    schedule: Schedule,
    next: Option<DateTime<Utc>>,
}

// ─── HeartbeatScheduler ───────────────────────────────────────────────────────

pub struct HeartbeatScheduler {
    entries: Mutex<Vec<Entry>>,
}

impl HeartbeatScheduler {
    /// Parse the configured heartbeats.  Entries with an invalid cron
    /// expression are skipped with a warning.
    pub fn new(configs: &[HeartbeatConfig]) -> Arc<Self> {
        let now = Utc::now();
        let entries = configs
            .iter()
            .filter_map(|config| match Schedule::from_str(&config.schedule) {
                Ok(schedule) => {
                    let next = schedule.after(&now).next();
                    Some(Entry {
                        config: config.clone(),
                        schedule,
                        next,
                    })
                }
                Err(e) => {
                    log::warn!(
                        "heartbeat '{}': invalid schedule '{}': {e}",
                        config.name,
                        config.schedule
                    );
                    None
                }
            })
            .collect();
        Arc::new(Self {
            entries: Mutex::new(entries),
        })
    }

    /// Heartbeats due at `now`.  Each returned entry has its next firing
    /// advanced, so a slot fires at most once per evaluation.
    pub fn due(&self, now: DateTime<Utc>) -> Vec<HeartbeatConfig> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let mut fired = Vec::new();
        for entry in entries.iter_mut() {
            if !entry.config.enabled {
                continue;
            }
            if let Some(next) = entry.next
                && next <= now
            {
                fired.push(entry.config.clone());
                entry.next = entry.schedule.after(&now).next();
            }
        }
        fired
    }

    /// All heartbeats with their current enabled state.
    pub fn list(&self) -> Vec<HeartbeatConfig> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|e| e.config.clone())
            .collect()
    }

    /// Flip a heartbeat's enabled state.  Returns `false` when no entry
    /// has that name.
    pub fn toggle(&self, name: &str, enabled: bool) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match entries.iter_mut().find(|e| e.config.name == name) {
            Some(entry) => {
                entry.config.enabled = enabled;
                if enabled && entry.next.is_none() {
                    entry.next = entry.schedule.after(&Utc::now()).next();
                }
                true
            }
            None => false,
        }
    }

    /// Spawn the tick loop.  `on_fire` runs for each due heartbeat.
    pub fn spawn(
        self: &Arc<Self>,
        on_fire: impl Fn(HeartbeatConfig) + Send + Sync + 'static,
    ) -> tokio::task::JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(TICK_PERIOD);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                for heartbeat in scheduler.due(Utc::now()) {
                    log::info!("heartbeat '{}' fired", heartbeat.name);
                    on_fire(heartbeat);
                }
            }
        })
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn heartbeat(name: &str, schedule: &str, enabled: bool) -> HeartbeatConfig {
        HeartbeatConfig {
            name: name.to_string(),
            schedule: schedule.to_string(),
            prompt: "check in".to_string(),
            enabled,
            channel: None,
        }
    }

    #[test]
    fn invalid_schedules_are_skipped() {
        let scheduler =
            HeartbeatScheduler::new(&[heartbeat("bad", "not a cron line", true)]);
        assert!(scheduler.list().is_empty());
    }

    #[test]
    fn nothing_due_before_next_firing() {
        let scheduler = HeartbeatScheduler::new(&[heartbeat("hourly", "0 0 * * * *", true)]);
        // Immediately after construction nothing has come due yet.
        assert!(scheduler.due(Utc::now()).is_empty());
    }

    #[test]
    fn due_fires_once_and_advances() {
        let scheduler = HeartbeatScheduler::new(&[heartbeat("minutely", "0 * * * * *", true)]);
        // Jump a day ahead: the slot is due exactly once for that instant.
        let future = Utc::now() + chrono::Duration::days(1);
        let fired = scheduler.due(future);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].name, "minutely");
        assert!(scheduler.due(future).is_empty(), "same instant fires once");
    }

    #[test]
    fn disabled_heartbeats_do_not_fire() {
        let scheduler = HeartbeatScheduler::new(&[heartbeat("off", "0 * * * * *", false)]);
        let future = Utc::now() + chrono::Duration::days(1);
        assert!(scheduler.due(future).is_empty());
    }

    #[test]
    fn toggle_flips_and_reports_missing() {
        let scheduler = HeartbeatScheduler::new(&[heartbeat("hb", "0 * * * * *", true)]);
        assert!(scheduler.toggle("hb", false));
        assert!(!scheduler.list()[0].enabled);
        assert!(scheduler.toggle("hb", true));
        assert!(scheduler.list()[0].enabled);
        assert!(!scheduler.toggle("ghost", true));
    }

    #[test]
    fn re_enabled_heartbeat_fires_later() {
        let scheduler = HeartbeatScheduler::new(&[heartbeat("hb", "0 * * * * *", false)]);
        scheduler.toggle("hb", true);
        let future = Utc::now() + chrono::Duration::days(1);
        assert_eq!(scheduler.due(future).len(), 1);
    }
}
