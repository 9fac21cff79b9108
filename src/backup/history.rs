use bon::Builder;
use chrono::{DateTime, Utc};
use derive_more::Display;
use getset::Getters;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use uuid::Uuid;
use validator::Validate;

use std::time::Duration;

#[derive(Clone, Copy, Debug, Display, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    #[display("success")]
    Success,
    #[display("failed")]
    Failed,
}

/// One scheduled or on-demand run, as kept in `run_history.json`.
/// On-demand runs have no schedule id.
#[skip_serializing_none]
#[derive(Clone, Debug, Builder, Getters, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
#[getset(get = "pub")]
pub struct RunHistoryEntry {
    id: Uuid,
    schedule_id: Option<Uuid>,
    triggered_at: DateTime<Utc>,
    completed_at: DateTime<Utc>,
    outcome: RunOutcome,
    backup_record_id: Option<Uuid>,
    #[builder(into)]
    error_detail: Option<String>,
}

/// Bounds on the run history, by entry count, by age, or both. An empty
/// retention keeps everything.
#[skip_serializing_none]
#[derive(Clone, Debug, Default, Builder, Getters, Validate, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
#[getset(get = "pub")]
pub struct HistoryRetention {
    #[validate(range(min = 1))]
    max_entries: Option<usize>,
    /// Human-readable duration in config files, e.g. `30d` or `12h 30m`.
    #[serde(default, with = "humantime_serde")]
    max_age: Option<Duration>,
}

impl HistoryRetention {
    /// Drops entries beyond the configured bounds, oldest first. Returns
    /// how many were removed and leaves the survivors sorted oldest first.
    pub fn prune(&self, entries: &mut Vec<RunHistoryEntry>, now: DateTime<Utc>) -> usize {
        let before = entries.len();
        entries.sort_by(|a, b| a.triggered_at().cmp(b.triggered_at()));
        if let Some(max_age) = self.max_age {
            let max_age =
                chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);
            entries.retain(|e| now.signed_duration_since(*e.triggered_at()) <= max_age);
        }
        if let Some(max_entries) = self.max_entries {
            let overflow = entries.len().saturating_sub(max_entries);
            entries.drain(..overflow);
        }
        before - entries.len()
    }
}
