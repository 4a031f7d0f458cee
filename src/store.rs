//! # External Collaborators
//! Narrow interfaces the engine consumes: content fetching, change
//! persistence, and the clock. In-memory reference implementations back the
//! tests and the demo binary; production wires real adapters behind the same
//! traits.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::change::{ChangeStatus, ContentChange};
use crate::diff::compare;
use crate::error::{CheckError, StoreError};
use crate::monitor::SourceRef;

/// Supplies the raw text extractors operate on. Implementations own all
/// network I/O; the engine only awaits them.
#[async_trait]
pub trait ContentFetcher: Send + Sync {
    async fn fetch(&self, source: &SourceRef) -> Result<String, CheckError>;
    fn name(&self) -> &str;
}

/// Wall-clock abstraction for interval/"due" computation and recency
/// windowing.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Settable clock for tests and offline evaluation.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().expect("manual clock mutex poisoned") = to;
    }

    pub fn advance(&self, by: Duration) {
        let mut guard = self.now.lock().expect("manual clock mutex poisoned");
        *guard += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("manual clock mutex poisoned")
    }
}

/// Persistence for [`ContentChange`] records. `upsert` carries the
/// conflict-as-update semantics: a pending (`NEW`) change for the same
/// monitor is re-evaluated in place rather than duplicated.
pub trait ChangeStore: Send + Sync {
    fn upsert(&self, change: ContentChange) -> Result<u64, StoreError>;
    fn get(&self, id: u64) -> Option<ContentChange>;
    fn set_status(&self, id: u64, status: ChangeStatus) -> Result<(), StoreError>;
    /// List changes honoring the status filter and the "recent OR NEW"
    /// windowing rule.
    fn list(
        &self,
        status: Option<ChangeStatus>,
        now: DateTime<Utc>,
        window: Duration,
    ) -> Vec<ContentChange>;
}

#[derive(Default)]
struct MemoryInner {
    next_id: u64,
    changes: BTreeMap<u64, ContentChange>,
}

/// In-memory [`ChangeStore`].
#[derive(Default)]
pub struct MemoryChangeStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryChangeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock().expect("change store mutex poisoned");
        inner.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ChangeStore for MemoryChangeStore {
    fn upsert(&self, change: ContentChange) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().expect("change store mutex poisoned");

        // Re-evaluation of a pending change before review: the after-side and
        // timing move; the before-side and creation data stay fixed. The
        // delta is rederived from this record's own snapshot pair, because
        // the caller diffed against its advanced baseline, not against the
        // before-side retained here.
        let pending = inner
            .changes
            .values()
            .find(|c| c.monitor_id == change.monitor_id && c.status == ChangeStatus::New)
            .map(|c| c.id);
        if let Some(id) = pending {
            let existing = inner.changes.get_mut(&id).expect("pending change present");
            existing.snapshot_after = change.snapshot_after;
            let (diff, difference) = compare(&existing.snapshot_before, &existing.snapshot_after);
            existing.snapshot_diff = diff;
            existing.difference = difference;
            existing.execution_time_ms = change.execution_time_ms;
            existing.sites = change.sites;
            return Ok(id);
        }

        let mut change = change;
        inner.next_id += 1;
        change.id = inner.next_id;
        let id = change.id;
        inner.changes.insert(id, change);
        Ok(id)
    }

    fn get(&self, id: u64) -> Option<ContentChange> {
        let inner = self.inner.lock().expect("change store mutex poisoned");
        inner.changes.get(&id).cloned()
    }

    fn set_status(&self, id: u64, status: ChangeStatus) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("change store mutex poisoned");
        let change = inner
            .changes
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("change {id}")))?;
        if !change.status.can_transition(status) {
            return Err(StoreError::InvalidTransition {
                from: change.status,
                to: status,
            });
        }
        change.status = status;
        Ok(())
    }

    fn list(
        &self,
        status: Option<ChangeStatus>,
        now: DateTime<Utc>,
        window: Duration,
    ) -> Vec<ContentChange> {
        let inner = self.inner.lock().expect("change store mutex poisoned");
        inner
            .changes
            .values()
            .filter(|c| status.map_or(true, |s| c.status == s))
            .filter(|c| c.is_listable(now, window))
            .cloned()
            .collect()
    }
}

/// Fetcher that replays a scripted sequence of results, then repeats the
/// last one. Used by tests and the demo binary.
pub struct SequenceFetcher {
    name: String,
    script: Mutex<VecDeque<Result<String, String>>>,
    last: Mutex<Option<String>>,
}

impl SequenceFetcher {
    pub fn new(name: &str, script: Vec<Result<String, String>>) -> Self {
        Self {
            name: name.to_string(),
            script: Mutex::new(script.into_iter().collect()),
            last: Mutex::new(None),
        }
    }
}

#[async_trait]
impl ContentFetcher for SequenceFetcher {
    async fn fetch(&self, source: &SourceRef) -> Result<String, CheckError> {
        let next = {
            let mut script = self.script.lock().expect("fetcher script mutex poisoned");
            script.pop_front()
        };
        match next {
            Some(Ok(body)) => {
                *self.last.lock().expect("fetcher last mutex poisoned") = Some(body.clone());
                Ok(body)
            }
            Some(Err(reason)) => Err(CheckError::Fetch {
                source_ref: source.to_string(),
                reason,
            }),
            None => {
                let last = self.last.lock().expect("fetcher last mutex poisoned");
                last.clone().ok_or_else(|| CheckError::Fetch {
                    source_ref: source.to_string(),
                    reason: "script exhausted".to_string(),
                })
            }
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}
