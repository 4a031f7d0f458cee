//! # Content Change
//! The record produced when a scheduled check detects a difference at or
//! above the monitor's threshold, and the review workflow it moves through.
//!
//! Status workflow: `NEW` → `UNDER_REVIEW` → terminal `APPROVED` / `REJECTED`.
//! Listing is policy, not storage truncation: a change still in `NEW` is
//! listed regardless of age, anything else only within a rolling recency
//! window (7 days by default).

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::diff::SnapshotDiff;
use crate::snapshot::Snapshot;

/// Default rolling recency window for the listing policy.
pub fn default_listing_window() -> Duration {
    Duration::days(7)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeStatus {
    New,
    UnderReview,
    Approved,
    Rejected,
}

impl ChangeStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Approved | Self::Rejected)
    }

    /// Legal workflow transitions. Re-entering the same state is allowed so
    /// re-evaluation of a pending change is not a transition error.
    pub fn can_transition(self, to: ChangeStatus) -> bool {
        match (self, to) {
            (a, b) if a == b => true,
            (Self::New, Self::UnderReview) => true,
            (Self::UnderReview, Self::Approved | Self::Rejected) => true,
            _ => false,
        }
    }
}

/// One detected difference between consecutive snapshots of a monitored
/// source. `snapshot_after`, `snapshot_diff`, `difference`, and `status` are
/// mutable on re-evaluation of the same pending change; everything else is
/// fixed at creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentChange {
    pub id: u64,
    /// Organisation/source code.
    pub code: String,
    pub monitor_id: u64,
    pub snapshot_before: Snapshot,
    pub snapshot_after: Snapshot,
    /// Derived; always re-derivable from the two snapshots.
    pub snapshot_diff: SnapshotDiff,
    /// Duration of the check, in milliseconds.
    pub execution_time_ms: u64,
    /// Integer percentage, 0–100.
    pub difference: u8,
    pub status: ChangeStatus,
    /// Distribution sites affected by the change.
    pub sites: Vec<String>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

impl ContentChange {
    /// Listing policy: `NEW` is retained indefinitely, anything else only
    /// within the recency window.
    pub fn is_listable(&self, now: DateTime<Utc>, window: Duration) -> bool {
        self.status == ChangeStatus::New || self.created_at >= now - window
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change(status: ChangeStatus, age_days: i64, now: DateTime<Utc>) -> ContentChange {
        ContentChange {
            id: 1,
            code: "acme".to_string(),
            monitor_id: 7,
            snapshot_before: Snapshot::new(),
            snapshot_after: Snapshot::new(),
            snapshot_diff: SnapshotDiff::default(),
            execution_time_ms: 12,
            difference: 10,
            status,
            sites: vec!["main".to_string()],
            created_by: "pagewatch".to_string(),
            created_at: now - Duration::days(age_days),
        }
    }

    #[test]
    fn new_is_listed_regardless_of_age() {
        let now = Utc::now();
        let c = change(ChangeStatus::New, 10, now);
        assert!(c.is_listable(now, default_listing_window()));
    }

    #[test]
    fn old_terminal_change_is_not_listed() {
        let now = Utc::now();
        let c = change(ChangeStatus::Approved, 10, now);
        assert!(!c.is_listable(now, default_listing_window()));
    }

    #[test]
    fn recent_terminal_change_is_listed() {
        let now = Utc::now();
        let c = change(ChangeStatus::Rejected, 2, now);
        assert!(c.is_listable(now, default_listing_window()));
    }

    #[test]
    fn workflow_transitions() {
        use ChangeStatus::*;
        assert!(New.can_transition(UnderReview));
        assert!(UnderReview.can_transition(Approved));
        assert!(UnderReview.can_transition(Rejected));
        assert!(New.can_transition(New)); // re-evaluation
        assert!(!New.can_transition(Approved));
        assert!(!Approved.can_transition(New));
        assert!(Approved.is_terminal());
        assert!(!UnderReview.is_terminal());
    }
}
