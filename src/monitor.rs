//! # Content Monitor
//! Per-source check configuration and the registry that owns scheduling
//! state.
//!
//! The registry is an explicit object constructed once by the application
//! context and passed by handle to consumers; there is no process-wide
//! global. Content types are a closed enum: source references are built by
//! enum dispatch, with no runtime type lookup.
//!
//! Schedule state machine per monitor: INACTIVE → ACTIVE (enable) → DUE
//! (interval elapsed) → CHECKING (in flight) → ACTIVE. The DUE→CHECKING
//! transition is an exclusive test-and-set keyed by monitor id, so one
//! monitor never has two concurrent checks while distinct monitors run in
//! parallel. The claim is an RAII guard: dropping it without completing
//! (failure, or the check future cancelled mid-fetch) releases the flag and
//! leaves the schedule untouched, so the monitor goes back to DUE.

use std::collections::BTreeMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CheckError, StoreError};
use crate::snapshot::{Snapshot, SortOrder};

/// Closed set of monitored source kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    /// A web page; the guid is its URL.
    Page,
    /// A syndication feed; the guid is the feed URL.
    Feed,
    /// A channel listing; requires a channel id.
    Channel,
}

/// What the content fetcher is asked to retrieve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRef {
    pub content_type: ContentType,
    pub locator: String,
}

impl std::fmt::Display for SourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}:{}", self.content_type, self.locator)
    }
}

/// A configured, recurring check of one content source.
/// `(content_type, guid)` is the natural key; `id` the surrogate one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentMonitor {
    /// Stable surrogate key. 0 means "assign on insert".
    pub id: u64,
    /// Logical source identity used for de-duplication.
    pub guid: String,
    pub content_type: ContentType,
    /// Required for `ContentType::Channel` sources.
    pub channel_id: Option<u64>,
    /// Organisation/source code carried onto recorded changes.
    pub code: String,
    /// Name of the resolved channel template used for extraction.
    pub template: String,
    pub active: bool,
    /// Minutes between checks.
    pub interval_minutes: u32,
    /// Minimum difference percentage for a change to be recorded.
    pub min_difference: u8,
    pub sort: SortOrder,
    /// Cap on list-type results per check; 0 means unlimited.
    pub max_results: usize,
    /// Distribution sites affected by changes of this source.
    pub sites: Vec<String>,
}

impl ContentMonitor {
    /// Build the fetcher reference for this monitor's content type.
    pub fn source_ref(&self) -> Result<SourceRef, CheckError> {
        let locator = match self.content_type {
            ContentType::Page | ContentType::Feed => self.guid.clone(),
            ContentType::Channel => {
                let channel_id = self.channel_id.ok_or_else(|| CheckError::BadSource {
                    monitor_id: self.id,
                    reason: "channel-type monitor without channel_id".to_string(),
                })?;
                format!("channel:{channel_id}")
            }
        };
        Ok(SourceRef {
            content_type: self.content_type,
            locator,
        })
    }

    fn natural_key(&self) -> (ContentType, String) {
        (self.content_type, self.guid.clone())
    }
}

/// Observable schedule state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Inactive,
    Active,
    Due,
    Checking,
}

#[derive(Debug)]
struct Entry {
    monitor: ContentMonitor,
    last_checked: Option<DateTime<Utc>>,
    in_flight: bool,
    /// Snapshot of the previous successful check; the diff baseline.
    last_snapshot: Option<Snapshot>,
}

impl Entry {
    fn is_due(&self, now: DateTime<Utc>) -> bool {
        if !self.monitor.active {
            return false;
        }
        match self.last_checked {
            None => true,
            Some(last) => now - last >= Duration::minutes(i64::from(self.monitor.interval_minutes)),
        }
    }

    fn state(&self, now: DateTime<Utc>) -> MonitorState {
        if !self.monitor.active {
            MonitorState::Inactive
        } else if self.in_flight {
            MonitorState::Checking
        } else if self.is_due(now) {
            MonitorState::Due
        } else {
            MonitorState::Active
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    next_id: u64,
    entries: BTreeMap<u64, Entry>,
}

impl Inner {
    fn find_by_key(&self, key: &(ContentType, String)) -> Option<u64> {
        self.entries
            .values()
            .find(|e| e.monitor.natural_key() == *key)
            .map(|e| e.monitor.id)
    }
}

/// Registry of monitors plus their schedule state. The one lock covers both
/// the "last checked" timestamp and the in-flight flag, so claim/complete are
/// atomic relative to a check's lifetime.
#[derive(Debug, Default)]
pub struct MonitorRegistry {
    inner: Mutex<Inner>,
}

impl MonitorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new monitor. Fails with [`StoreError::Conflict`] when the
    /// `(content_type, guid)` key already exists.
    pub fn insert(&self, mut monitor: ContentMonitor) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().expect("monitor registry mutex poisoned");
        if let Some(existing) = inner.find_by_key(&monitor.natural_key()) {
            return Err(StoreError::Conflict(format!(
                "monitor {existing} already holds ({:?}, {})",
                monitor.content_type, monitor.guid
            )));
        }
        if monitor.id == 0 {
            inner.next_id += 1;
            monitor.id = inner.next_id;
        } else {
            inner.next_id = inner.next_id.max(monitor.id);
        }
        let id = monitor.id;
        inner.entries.insert(
            id,
            Entry {
                monitor,
                last_checked: None,
                in_flight: false,
                last_snapshot: None,
            },
        );
        Ok(id)
    }

    /// Replace an existing monitor in place by id, preserving its schedule
    /// state. Monitors are never merged.
    pub fn set(&self, monitor: ContentMonitor) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("monitor registry mutex poisoned");
        if let Some(other) = inner.find_by_key(&monitor.natural_key()) {
            if other != monitor.id {
                return Err(StoreError::Conflict(format!(
                    "monitor {other} already holds ({:?}, {})",
                    monitor.content_type, monitor.guid
                )));
            }
        }
        match inner.entries.get_mut(&monitor.id) {
            Some(entry) => {
                entry.monitor = monitor;
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("monitor {}", monitor.id))),
        }
    }

    /// Insert, or on a natural-key conflict replace the existing entry.
    pub fn upsert(&self, mut monitor: ContentMonitor) -> Result<u64, StoreError> {
        match self.insert(monitor.clone()) {
            Ok(id) => Ok(id),
            Err(StoreError::Conflict(_)) => {
                let existing = {
                    let inner = self.inner.lock().expect("monitor registry mutex poisoned");
                    inner.find_by_key(&monitor.natural_key())
                };
                let id = existing.ok_or_else(|| {
                    StoreError::NotFound(format!("monitor guid {}", monitor.guid))
                })?;
                debug!(monitor = id, guid = %monitor.guid, "monitor exists, updating in place");
                monitor.id = id;
                self.set(monitor)?;
                Ok(id)
            }
            Err(e) => Err(e),
        }
    }

    pub fn get(&self, id: u64) -> Option<ContentMonitor> {
        let inner = self.inner.lock().expect("monitor registry mutex poisoned");
        inner.entries.get(&id).map(|e| e.monitor.clone())
    }

    pub fn monitors(&self) -> Vec<ContentMonitor> {
        let inner = self.inner.lock().expect("monitor registry mutex poisoned");
        inner.entries.values().map(|e| e.monitor.clone()).collect()
    }

    pub fn state(&self, id: u64, now: DateTime<Utc>) -> Option<MonitorState> {
        let inner = self.inner.lock().expect("monitor registry mutex poisoned");
        inner.entries.get(&id).map(|e| e.state(now))
    }

    pub fn last_checked(&self, id: u64) -> Option<DateTime<Utc>> {
        let inner = self.inner.lock().expect("monitor registry mutex poisoned");
        inner.entries.get(&id).and_then(|e| e.last_checked)
    }

    /// Ids of monitors that are due and not already in flight.
    pub fn due_ids(&self, now: DateTime<Utc>) -> Vec<u64> {
        let inner = self.inner.lock().expect("monitor registry mutex poisoned");
        inner
            .entries
            .values()
            .filter(|e| e.is_due(now) && !e.in_flight)
            .map(|e| e.monitor.id)
            .collect()
    }

    /// Atomically claim the DUE→CHECKING transition. Returns `None` when the
    /// monitor is inactive, not yet due, already checking, or unknown.
    pub fn begin_check(&self, id: u64, now: DateTime<Utc>) -> Option<CheckClaim<'_>> {
        let mut inner = self.inner.lock().expect("monitor registry mutex poisoned");
        let entry = inner.entries.get_mut(&id)?;
        if entry.in_flight || !entry.is_due(now) {
            return None;
        }
        entry.in_flight = true;
        let monitor = entry.monitor.clone();
        let baseline = entry.last_snapshot.clone();
        drop(inner);
        Some(CheckClaim {
            registry: self,
            id,
            monitor,
            baseline,
            completed: false,
        })
    }

    /// Successful completion: advance `last_checked`, store the new baseline,
    /// release the in-flight flag. One lock, so the update is atomic relative
    /// to the check's completion.
    fn finish_success(&self, id: u64, now: DateTime<Utc>, snapshot: Snapshot) {
        let mut inner = self.inner.lock().expect("monitor registry mutex poisoned");
        if let Some(entry) = inner.entries.get_mut(&id) {
            entry.in_flight = false;
            entry.last_checked = Some(now);
            entry.last_snapshot = Some(snapshot);
        }
    }

    /// Release the flag without touching `last_checked` or the baseline, so
    /// the same interval is retried.
    fn release(&self, id: u64) {
        let mut inner = self.inner.lock().expect("monitor registry mutex poisoned");
        if let Some(entry) = inner.entries.get_mut(&id) {
            entry.in_flight = false;
        }
    }
}

/// Exclusive in-flight claim on one monitor's check, handed out by
/// [`MonitorRegistry::begin_check`]. [`CheckClaim::complete`] consumes the
/// claim and advances the schedule; dropping it any other way (fetch failure,
/// the check future cancelled while awaiting) releases the flag and leaves
/// the schedule untouched, so the monitor never wedges in CHECKING.
#[must_use]
pub struct CheckClaim<'a> {
    registry: &'a MonitorRegistry,
    id: u64,
    monitor: ContentMonitor,
    baseline: Option<Snapshot>,
    completed: bool,
}

impl CheckClaim<'_> {
    pub fn monitor(&self) -> &ContentMonitor {
        &self.monitor
    }

    /// Snapshot of the previous successful check, if any.
    pub fn take_baseline(&mut self) -> Option<Snapshot> {
        self.baseline.take()
    }

    /// Finish the check successfully with its new baseline snapshot.
    pub fn complete(mut self, now: DateTime<Utc>, snapshot: Snapshot) {
        self.completed = true;
        self.registry.finish_success(self.id, now, snapshot);
    }
}

impl Drop for CheckClaim<'_> {
    fn drop(&mut self) {
        if !self.completed {
            self.registry.release(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor(guid: &str) -> ContentMonitor {
        ContentMonitor {
            id: 0,
            guid: guid.to_string(),
            content_type: ContentType::Page,
            channel_id: None,
            code: "acme".to_string(),
            template: "acme-daily".to_string(),
            active: true,
            interval_minutes: 15,
            min_difference: 5,
            sort: SortOrder::Document,
            max_results: 0,
            sites: vec![],
        }
    }

    #[test]
    fn insert_assigns_ids_and_rejects_duplicate_guid() {
        let reg = MonitorRegistry::new();
        let a = reg.insert(monitor("http://a")).unwrap();
        let b = reg.insert(monitor("http://b")).unwrap();
        assert_ne!(a, b);
        assert!(matches!(
            reg.insert(monitor("http://a")),
            Err(StoreError::Conflict(_))
        ));
    }

    #[test]
    fn same_guid_different_type_is_not_a_conflict() {
        let reg = MonitorRegistry::new();
        reg.insert(monitor("http://a")).unwrap();
        let mut feed = monitor("http://a");
        feed.content_type = ContentType::Feed;
        assert!(reg.insert(feed).is_ok());
    }

    #[test]
    fn upsert_replaces_existing_by_natural_key() {
        let reg = MonitorRegistry::new();
        let id = reg.insert(monitor("http://a")).unwrap();
        let mut updated = monitor("http://a");
        updated.interval_minutes = 60;
        let upserted = reg.upsert(updated).unwrap();
        assert_eq!(upserted, id);
        assert_eq!(reg.get(id).unwrap().interval_minutes, 60);
    }

    #[test]
    fn due_and_claim_lifecycle() {
        let reg = MonitorRegistry::new();
        let id = reg.insert(monitor("http://a")).unwrap();
        let t0 = Utc::now();

        // Never checked: due immediately.
        assert_eq!(reg.state(id, t0), Some(MonitorState::Due));

        let mut claim = reg.begin_check(id, t0).expect("claimable");
        assert_eq!(claim.monitor().id, id);
        assert!(claim.take_baseline().is_none());
        assert_eq!(reg.state(id, t0), Some(MonitorState::Checking));

        // Second concurrent claim is refused.
        assert!(reg.begin_check(id, t0).is_none());

        claim.complete(t0, Snapshot::new());
        assert_eq!(reg.state(id, t0), Some(MonitorState::Active));

        // Due again once the interval elapses.
        let later = t0 + Duration::minutes(15);
        assert_eq!(reg.state(id, later), Some(MonitorState::Due));
    }

    #[test]
    fn dropped_claim_keeps_monitor_due() {
        let reg = MonitorRegistry::new();
        let id = reg.insert(monitor("http://a")).unwrap();
        let t0 = Utc::now();

        let claim = reg.begin_check(id, t0).unwrap();
        drop(claim);

        assert!(reg.last_checked(id).is_none());
        assert_eq!(reg.state(id, t0), Some(MonitorState::Due));
        // And it is immediately claimable again.
        assert!(reg.begin_check(id, t0).is_some());
    }

    #[test]
    fn dropped_claim_releases_checking_after_prior_success() {
        let reg = MonitorRegistry::new();
        let id = reg.insert(monitor("http://a")).unwrap();
        let t0 = Utc::now();

        let mut snap = Snapshot::new();
        snap.insert("title", "one");
        reg.begin_check(id, t0).unwrap().complete(t0, snap);

        // Next check claimed, then dropped without completing.
        let t1 = t0 + Duration::minutes(15);
        let claim = reg.begin_check(id, t1).unwrap();
        assert_eq!(reg.state(id, t1), Some(MonitorState::Checking));
        drop(claim);

        // Schedule and baseline untouched by the abandoned claim.
        assert_eq!(reg.state(id, t1), Some(MonitorState::Due));
        assert_eq!(reg.last_checked(id), Some(t0));
        let mut retry = reg.begin_check(id, t1).expect("claimable again");
        assert_eq!(
            retry.take_baseline().and_then(|s| s.get("title").map(str::to_string)),
            Some("one".to_string())
        );
    }

    #[test]
    fn inactive_monitor_is_never_due() {
        let reg = MonitorRegistry::new();
        let mut m = monitor("http://a");
        m.active = false;
        let id = reg.insert(m).unwrap();
        let now = Utc::now();
        assert_eq!(reg.state(id, now), Some(MonitorState::Inactive));
        assert!(reg.begin_check(id, now).is_none());
        assert!(reg.due_ids(now).is_empty());
    }

    #[test]
    fn channel_source_ref_requires_channel_id() {
        let mut m = monitor("vid-123");
        m.content_type = ContentType::Channel;
        assert!(m.source_ref().is_err());
        m.channel_id = Some(42);
        assert_eq!(m.source_ref().unwrap().locator, "channel:42");
    }

    #[test]
    fn set_replaces_in_place_and_guards_key() {
        let reg = MonitorRegistry::new();
        let a = reg.insert(monitor("http://a")).unwrap();
        let _b = reg.insert(monitor("http://b")).unwrap();

        let mut renamed = monitor("http://b");
        renamed.id = a;
        assert!(matches!(reg.set(renamed), Err(StoreError::Conflict(_))));

        let mut ok = monitor("http://a");
        ok.id = a;
        ok.min_difference = 30;
        reg.set(ok).unwrap();
        assert_eq!(reg.get(a).unwrap().min_difference, 30);
    }
}
