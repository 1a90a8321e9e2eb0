//! Orders applications for a pass according to the schedule policy.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};

use tagpilot_core::types::AppName;
use tagpilot_core::SchedulePolicy;

use crate::run_state::RunStats;

/// Weight of one recorded failure under `FailFirst`.
pub const FAIL_WEIGHT: i64 = 1_000_000;

/// Score subtracted from apps that succeeded within the cooldown window:
/// one minute of LRU age.
pub const COOLDOWN_PENALTY: i64 = 60_000;

#[derive(Debug, Clone, Copy)]
pub struct ApplicationSelector {
    pub policy: SchedulePolicy,
    pub cooldown: Duration,
}

impl ApplicationSelector {
    pub fn new(policy: SchedulePolicy, cooldown: Duration) -> Self {
        Self { policy, cooldown }
    }

    /// Order `items` by descending score, breaking ties by name. `Default`
    /// keeps the input order.
    pub fn order<T, F>(
        &self,
        items: Vec<T>,
        name: F,
        stats: &HashMap<AppName, RunStats>,
        now: DateTime<Utc>,
    ) -> Vec<T>
    where
        F: Fn(&T) -> &AppName,
    {
        if self.policy == SchedulePolicy::Default {
            return items;
        }
        let mut scored: Vec<(i64, T)> = items
            .into_iter()
            .map(|item| {
                let score = self.score(stats.get(name(&item)), now);
                (score, item)
            })
            .collect();
        scored.sort_by(|(sa, a), (sb, b)| sb.cmp(sa).then_with(|| name(a).cmp(name(b))));
        scored.into_iter().map(|(_, item)| item).collect()
    }

    pub fn score(&self, stats: Option<&RunStats>, now: DateTime<Utc>) -> i64 {
        let stats = stats.copied().unwrap_or_default();
        let age_ms = |at: Option<DateTime<Utc>>| {
            at.map(|t| (now - t).num_milliseconds()).unwrap_or(0)
        };
        let mut score = match self.policy {
            SchedulePolicy::Default => return 0,
            SchedulePolicy::Lru => -age_ms(stats.last_success),
            SchedulePolicy::FailFirst => {
                i64::from(stats.fail_count) * FAIL_WEIGHT - age_ms(stats.last_attempt)
            }
        };
        if self.in_cooldown(&stats, now) {
            score -= COOLDOWN_PENALTY;
        }
        score
    }

    fn in_cooldown(&self, stats: &RunStats, now: DateTime<Utc>) -> bool {
        if self.cooldown.is_zero() {
            return false;
        }
        match (stats.last_success, chrono::Duration::from_std(self.cooldown)) {
            (Some(success), Ok(window)) => now - success < window,
            _ => false,
        }
    }
}
