use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};

use crate::config::ScheduleConfig;
use crate::snapshot::{parse_snapshot_name, parse_timestamp};
use crate::state::SubvolumeState;

/// Backup decision for one subvolume.
#[derive(Debug, Clone, PartialEq)]
pub enum Plan {
    Skip {
        reason: &'static str,
    },
    Full {
        reason: &'static str,
    },
    Incremental {
        parent_snapshot: PathBuf,
        parent_manifest: String,
    },
}

impl Plan {
    pub fn describe(&self) -> &'static str {
        match self {
            Plan::Skip { .. } => "skip",
            Plan::Full { .. } => "full",
            Plan::Incremental { .. } => "incremental",
        }
    }
}

/// Decide full vs. incremental vs. skip for one subvolume.
///
/// The rules are evaluated top to bottom:
/// 1. without `--once`, skip when neither cadence is due;
/// 2. no recorded full backup, or the full cadence elapsed: full;
/// 3. parent manifest or parent snapshot unusable: full (fallback);
/// 4. otherwise incremental against the last snapshot.
pub fn plan_subvolume(
    subvolume: &str,
    sub_state: Option<&SubvolumeState>,
    schedule: &ScheduleConfig,
    now: DateTime<Utc>,
    once: bool,
    snapshot_on_disk: &dyn Fn(&Path) -> bool,
) -> Plan {
    let last_full_at = sub_state
        .and_then(|s| s.last_full_at.as_deref())
        .and_then(parse_timestamp);
    let full_due = match last_full_at {
        None => true,
        Some(at) => days_since(schedule, at, now) >= i64::from(schedule.full_every_days),
    };

    let parent_name = sub_state.and_then(|s| s.last_snapshot.as_deref());
    let inc_due = match parent_name.and_then(parse_snapshot_name) {
        Some((_, created_at, _)) => {
            days_since(schedule, created_at, now) >= i64::from(schedule.incremental_every_days)
        }
        None => true,
    };

    if !once && !full_due && !inc_due {
        return Plan::Skip { reason: "not_due" };
    }
    if last_full_at.is_none() {
        return Plan::Full {
            reason: "no_previous_full",
        };
    }
    if full_due {
        return Plan::Full { reason: "full_due" };
    }

    let Some(parent_manifest) = sub_state.and_then(|s| s.last_manifest.clone()) else {
        tracing::info!(subvolume, "falling back to full: last manifest missing");
        return Plan::Full {
            reason: "missing_parent_manifest",
        };
    };
    let parent_path = sub_state
        .and_then(|s| s.last_snapshot_path.as_deref())
        .map(PathBuf::from);
    let Some(parent_path) = parent_path else {
        tracing::info!(subvolume, "falling back to full: parent snapshot path unrecorded");
        return Plan::Full {
            reason: "missing_parent_snapshot",
        };
    };
    if !snapshot_on_disk(&parent_path) {
        tracing::info!(
            subvolume,
            parent = %parent_path.display(),
            "falling back to full: parent snapshot missing on disk"
        );
        return Plan::Full {
            reason: "missing_parent_snapshot",
        };
    }

    Plan::Incremental {
        parent_snapshot: parent_path,
        parent_manifest,
    }
}

/// Whole days between two instants, anchored at the configured `run_at`
/// time of day. A scheduler firing seconds before the exact interval still
/// counts the cadence as due.
fn days_since(schedule: &ScheduleConfig, earlier: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    let (hour, minute) = schedule.run_at_hm().unwrap_or((0, 0));
    let shift = Duration::hours(i64::from(hour)) + Duration::minutes(i64::from(minute));
    ((now - shift).date_naive() - (earlier - shift).date_naive()).num_days()
}
