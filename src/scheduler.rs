//! # Monitor Scheduler
//! Drives scheduled checks: fetch, capture, compare, gate on the monitor's
//! threshold, and record a [`ContentChange`] when warranted.
//!
//! Checks for distinct monitors run as independent spawned tasks with no
//! ordering guarantee between them; within one monitor, the registry's
//! in-flight flag serializes checks. A failed check leaves `last_checked`
//! untouched, so the monitor stays due and the same interval is retried.

use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use once_cell::sync::OnceCell;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::change::{ChangeStatus, ContentChange};
use crate::diff::compare;
use crate::error::CheckError;
use crate::monitor::{ContentMonitor, MonitorRegistry};
use crate::snapshot::{capture, ResultPolicy, Snapshot};
use crate::store::{ChangeStore, Clock, ContentFetcher};
use crate::template::TemplateHandle;

/// One-time metrics registration (so series show up on the exporter side).
fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("watch_checks_total", "Scheduled checks started.");
        describe_counter!("watch_check_failures_total", "Checks that failed and will retry.");
        describe_counter!("watch_changes_total", "Content changes recorded.");
        describe_counter!(
            "watch_below_threshold_total",
            "Checks whose difference fell below the monitor threshold."
        );
        describe_histogram!("watch_check_ms", "Wall time of one check in milliseconds.");
        describe_gauge!("watch_last_tick_ts", "Unix ts of the last scheduler tick.");
    });
}

/// Outcome of a single check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    /// The monitor was not claimable (inactive, not due, or already checking).
    Skipped,
    /// First successful check; the snapshot becomes the diff baseline.
    Baseline,
    /// Snapshots were identical.
    NoChange,
    /// A difference was detected but stayed under `min_difference`.
    BelowThreshold { difference: u8 },
    /// A change record was created or re-evaluated.
    ChangeRecorded { change_id: u64, difference: u8 },
}

/// The wired-up engine: registry, resolved templates, and collaborators.
/// Cheap to clone; every check task carries one.
#[derive(Clone)]
pub struct Engine {
    pub registry: Arc<MonitorRegistry>,
    pub templates: TemplateHandle,
    pub fetcher: Arc<dyn ContentFetcher>,
    pub store: Arc<dyn ChangeStore>,
    pub clock: Arc<dyn Clock>,
}

impl Engine {
    /// Run one check for `monitor_id`, if it is due and not in flight.
    pub async fn run_check(&self, monitor_id: u64) -> Result<CheckOutcome, CheckError> {
        ensure_metrics_described();

        let now = self.clock.now();
        let Some(mut claim) = self.registry.begin_check(monitor_id, now) else {
            return Ok(CheckOutcome::Skipped);
        };
        counter!("watch_checks_total").increment(1);

        // The claim travels with this future: if the check is cancelled while
        // awaiting the fetch, dropping it releases the monitor back to due.
        let started = Instant::now();
        let monitor = claim.monitor().clone();
        let baseline = claim.take_baseline();
        match self.check_claimed(&monitor, baseline, started).await {
            Ok((outcome, snapshot)) => {
                claim.complete(self.clock.now(), snapshot);
                histogram!("watch_check_ms").record(started.elapsed().as_millis() as f64);
                Ok(outcome)
            }
            Err(e) => {
                // Dropping the claim leaves the schedule unchanged: the
                // monitor stays due and retries.
                drop(claim);
                counter!("watch_check_failures_total").increment(1);
                warn!(monitor = monitor_id, error = %e, "check failed, will retry next tick");
                Err(e)
            }
        }
    }

    async fn check_claimed(
        &self,
        monitor: &ContentMonitor,
        baseline: Option<Snapshot>,
        started: Instant,
    ) -> Result<(CheckOutcome, Snapshot), CheckError> {
        let cfg = self.templates.channel(&monitor.template).ok_or_else(|| {
            CheckError::MissingTemplate {
                monitor_id: monitor.id,
                template: monitor.template.clone(),
            }
        })?;

        let source = monitor.source_ref()?;
        let raw = self.fetcher.fetch(&source).await?;

        let policy = ResultPolicy {
            sort: monitor.sort,
            max_results: monitor.max_results,
        };
        let after = capture(&cfg, &raw, &policy);

        let Some(before) = baseline else {
            info!(monitor = monitor.id, fields = after.len(), "baseline snapshot captured");
            return Ok((CheckOutcome::Baseline, after));
        };

        if before.content_hash() == after.content_hash() {
            return Ok((CheckOutcome::NoChange, after));
        }

        let (diff, difference) = compare(&before, &after);
        if difference == 0 {
            return Ok((CheckOutcome::NoChange, after));
        }
        if difference < monitor.min_difference {
            counter!("watch_below_threshold_total").increment(1);
            return Ok((CheckOutcome::BelowThreshold { difference }, after));
        }

        let change = ContentChange {
            id: 0,
            code: monitor.code.clone(),
            monitor_id: monitor.id,
            snapshot_before: before,
            snapshot_after: after.clone(),
            snapshot_diff: diff,
            execution_time_ms: started.elapsed().as_millis() as u64,
            difference,
            status: ChangeStatus::New,
            sites: monitor.sites.clone(),
            created_by: self.fetcher.name().to_string(),
            created_at: self.clock.now(),
        };

        // A detected difference at or above threshold must be recorded or
        // the failure reported; the store error propagates into a retry.
        let change_id = self
            .store
            .upsert(change)
            .map_err(|e| CheckError::Record {
                monitor_id: monitor.id,
                reason: e.to_string(),
            })?;
        counter!("watch_changes_total").increment(1);
        info!(
            monitor = monitor.id,
            change = change_id,
            difference,
            "content change recorded"
        );

        Ok((CheckOutcome::ChangeRecorded { change_id, difference }, after))
    }
}

/// Spawn the background loop: every `tick`, each due monitor is checked on
/// its own task.
pub fn spawn_scheduler(engine: Engine, tick: std::time::Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        ensure_metrics_described();
        let mut ticker = tokio::time::interval(tick);
        loop {
            ticker.tick().await;
            let now = engine.clock.now();
            gauge!("watch_last_tick_ts").set(now.timestamp() as f64);

            for id in engine.registry.due_ids(now) {
                let eng = engine.clone();
                tokio::spawn(async move {
                    match eng.run_check(id).await {
                        Ok(outcome) => {
                            tracing::debug!(monitor = id, ?outcome, "check finished")
                        }
                        Err(e) => tracing::warn!(monitor = id, error = %e, "check errored"),
                    }
                });
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::default_listing_window;
    use crate::monitor::{ContentType, MonitorState, SourceRef};
    use crate::snapshot::SortOrder;
    use crate::store::{ManualClock, MemoryChangeStore, SequenceFetcher};
    use crate::template::{ChannelConfig, TemplateSet};
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};

    const TEMPLATE: &str = r#"
name = "page"

[fields.title]
expr = '<title>(.*?)</title>'

[fields.body]
expr = '<body>(.*?)</body>'
"#;

    fn engine(script: Vec<Result<String, String>>) -> (Engine, u64, Arc<ManualClock>) {
        let mut set = TemplateSet::default();
        set.add_channel(ChannelConfig::parse_toml(TEMPLATE).unwrap());

        let registry = Arc::new(MonitorRegistry::new());
        let id = registry
            .insert(ContentMonitor {
                id: 0,
                guid: "http://example.test/".to_string(),
                content_type: ContentType::Page,
                channel_id: None,
                code: "acme".to_string(),
                template: "page".to_string(),
                active: true,
                interval_minutes: 10,
                min_difference: 5,
                sort: SortOrder::Document,
                max_results: 0,
                sites: vec!["main".to_string()],
            })
            .unwrap();

        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap(),
        ));
        let engine = Engine {
            registry,
            templates: TemplateHandle::new(set.resolve_all()),
            fetcher: Arc::new(SequenceFetcher::new("seq", script)),
            store: Arc::new(MemoryChangeStore::new()),
            clock: clock.clone(),
        };
        (engine, id, clock)
    }

    fn page(title: &str, body: &str) -> String {
        format!("<title>{title}</title><body>{body}</body>")
    }

    #[tokio::test]
    async fn first_check_is_baseline_without_change() {
        let (engine, id, _clock) = engine(vec![Ok(page("t", "b"))]);
        let outcome = engine.run_check(id).await.unwrap();
        assert_eq!(outcome, CheckOutcome::Baseline);
        let now = engine.clock.now();
        assert!(engine
            .store
            .list(None, now, default_listing_window())
            .is_empty());
    }

    #[tokio::test]
    async fn threshold_gates_change_creation() {
        let (engine, id, clock) = engine(vec![
            Ok(page("headline", "stable body text")),
            // Change both fields substantially: well above 5%.
            Ok(page("different headline", "completely new body")),
        ]);

        assert_eq!(engine.run_check(id).await.unwrap(), CheckOutcome::Baseline);

        clock.advance(chrono::Duration::minutes(10));
        let outcome = engine.run_check(id).await.unwrap();
        let CheckOutcome::ChangeRecorded { change_id, difference } = outcome else {
            panic!("expected a recorded change, got {outcome:?}");
        };
        assert!(difference >= 5);

        let change = engine.store.get(change_id).unwrap();
        assert_eq!(change.status, ChangeStatus::New);
        assert_eq!(change.monitor_id, id);
        assert_eq!(change.sites, vec!["main".to_string()]);
        assert!(!change.snapshot_diff.is_empty());
    }

    #[tokio::test]
    async fn below_threshold_records_nothing_but_advances_schedule() {
        let (engine, id, clock) = engine(vec![
            Ok(page(
                "a very long stable headline that barely moves at all",
                "a very long stable body that barely moves at all either",
            )),
            Ok(page(
                "a very long stable headline that barely moves at all!",
                "a very long stable body that barely moves at all either",
            )),
        ]);
        // Raise the bar so the tiny edit stays under it.
        let mut m = engine.registry.get(id).unwrap();
        m.min_difference = 40;
        engine.registry.set(m).unwrap();

        engine.run_check(id).await.unwrap();
        clock.advance(chrono::Duration::minutes(10));

        let outcome = engine.run_check(id).await.unwrap();
        assert!(matches!(outcome, CheckOutcome::BelowThreshold { .. }));
        let now = engine.clock.now();
        assert!(engine
            .store
            .list(None, now, default_listing_window())
            .is_empty());
        // Schedule advanced: not due again until the interval elapses.
        assert_eq!(engine.run_check(id).await.unwrap(), CheckOutcome::Skipped);
    }

    #[tokio::test]
    async fn fetch_failure_leaves_monitor_due() {
        let (engine, id, _clock) = engine(vec![Err("connection refused".to_string()), Ok(page("t", "b"))]);

        let err = engine.run_check(id).await.unwrap_err();
        assert!(matches!(err, CheckError::Fetch { .. }));
        assert!(engine.registry.last_checked(id).is_none());

        // Immediately retryable, no interval wait.
        assert_eq!(engine.run_check(id).await.unwrap(), CheckOutcome::Baseline);
    }

    #[tokio::test]
    async fn identical_content_is_no_change() {
        let (engine, id, clock) = engine(vec![Ok(page("t", "b"))]);
        engine.run_check(id).await.unwrap();
        clock.advance(chrono::Duration::minutes(10));
        // Script exhausted: fetcher repeats the same body.
        assert_eq!(engine.run_check(id).await.unwrap(), CheckOutcome::NoChange);
    }

    #[tokio::test]
    async fn missing_template_is_a_check_failure() {
        let (engine, id, _clock) = engine(vec![Ok(page("t", "b"))]);
        let mut m = engine.registry.get(id).unwrap();
        m.template = "nonexistent".to_string();
        engine.registry.set(m).unwrap();

        let err = engine.run_check(id).await.unwrap_err();
        assert!(matches!(err, CheckError::MissingTemplate { .. }));
        assert!(engine.registry.last_checked(id).is_none());
    }

    #[tokio::test]
    async fn reevaluation_updates_the_pending_change() {
        let (engine, id, clock) = engine(vec![
            Ok(page("one", "first body")),
            Ok(page("two", "second body")),
            Ok(page("three", "third body")),
        ]);

        engine.run_check(id).await.unwrap();
        clock.advance(chrono::Duration::minutes(10));
        let first = engine.run_check(id).await.unwrap();
        clock.advance(chrono::Duration::minutes(10));
        let second = engine.run_check(id).await.unwrap();

        let (CheckOutcome::ChangeRecorded { change_id: a, .. },
             CheckOutcome::ChangeRecorded { change_id: b, .. }) = (first, second)
        else {
            panic!("expected two recorded changes");
        };
        // Same pending record, re-evaluated in place.
        assert_eq!(a, b);
        let change = engine.store.get(a).unwrap();
        assert_eq!(change.snapshot_before.get("title"), Some("one"));
        assert_eq!(change.snapshot_after.get("title"), Some("three"));

        // The record's delta stays derivable from its own snapshot pair even
        // though the second check diffed against the advanced baseline.
        let (diff, difference) = compare(&change.snapshot_before, &change.snapshot_after);
        assert_eq!(change.snapshot_diff, diff);
        assert_eq!(change.difference, difference);
    }

    /// Fetcher that never resolves; stands in for a hung upstream.
    struct StallingFetcher;

    #[async_trait]
    impl ContentFetcher for StallingFetcher {
        async fn fetch(&self, _source: &SourceRef) -> Result<String, CheckError> {
            std::future::pending().await
        }

        fn name(&self) -> &str {
            "stalled"
        }
    }

    #[tokio::test]
    async fn aborted_check_releases_the_monitor() {
        let (mut engine, id, clock) = engine(vec![]);
        engine.fetcher = Arc::new(StallingFetcher);

        let task = {
            let eng = engine.clone();
            tokio::spawn(async move { eng.run_check(id).await })
        };

        let now = clock.now();
        for _ in 0..100 {
            if engine.registry.state(id, now) == Some(MonitorState::Checking) {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(engine.registry.state(id, now), Some(MonitorState::Checking));

        // Cancel the check while it is parked on the fetch.
        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());

        // The claim dropped with the future: schedule untouched, monitor due
        // and immediately claimable.
        assert_eq!(engine.registry.state(id, now), Some(MonitorState::Due));
        assert!(engine.registry.last_checked(id).is_none());

        engine.fetcher = Arc::new(SequenceFetcher::new("seq", vec![Ok(page("t", "b"))]));
        assert_eq!(engine.run_check(id).await.unwrap(), CheckOutcome::Baseline);
    }
}
