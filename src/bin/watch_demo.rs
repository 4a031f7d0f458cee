//! Demo that wires the engine against a scripted fetcher and walks one
//! monitor through baseline, change detection, and the review listing.

use std::sync::Arc;

use pagewatch::{
    default_listing_window, ChangeStatus, ChangeStore, ChannelConfig, ContentMonitor, ContentType,
    Engine, MemoryChangeStore, MonitorRegistry, SequenceFetcher, SortOrder, SystemClock,
    TemplateHandle, TemplateSet,
};

const PROVIDER: &str = r#"
name = "generic-news"

[fields.title]
expr = '<title>(.*?)</title>'
filters = [{ kind = "collapse_whitespace" }, { kind = "trim" }]

[fields.summary]
expr = '<meta name="description" content="(.*?)"'
"#;

const CHANNEL: &str = r#"
name = "acme-daily"
provider = "generic-news"

[fields.title]
filters = [{ kind = "truncate", max = 80 }]
"#;

const PAGE_V1: &str = r#"<html><head><title> Acme Daily — Morning Edition </title>
<meta name="description" content="All the news."></head></html>"#;

const PAGE_V2: &str = r#"<html><head><title> Acme Daily — BREAKING: Merger Announced </title>
<meta name="description" content="All the news, and a merger."></head></html>"#;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt().with_target(false).init();

    let mut set = TemplateSet::default();
    set.add_provider(ChannelConfig::parse_toml(PROVIDER)?);
    set.add_channel(ChannelConfig::parse_toml(CHANNEL)?);

    let registry = Arc::new(MonitorRegistry::new());
    let monitor_id = registry.insert(ContentMonitor {
        id: 0,
        guid: "https://acme.example/daily".to_string(),
        content_type: ContentType::Page,
        channel_id: None,
        code: "acme".to_string(),
        template: "acme-daily".to_string(),
        active: true,
        interval_minutes: 0, // demo: due on every tick
        min_difference: 5,
        sort: SortOrder::Document,
        max_results: 0,
        sites: vec!["www".to_string()],
    })?;

    let store = Arc::new(MemoryChangeStore::new());
    let engine = Engine {
        registry,
        templates: TemplateHandle::new(set.resolve_all()),
        fetcher: Arc::new(SequenceFetcher::new(
            "demo",
            vec![Ok(PAGE_V1.to_string()), Ok(PAGE_V2.to_string())],
        )),
        store: store.clone(),
        clock: Arc::new(SystemClock),
    };

    for _ in 0..2 {
        let outcome = engine.run_check(monitor_id).await?;
        println!("check outcome: {outcome:?}");
    }

    let now = chrono::Utc::now();
    for change in store.list(Some(ChangeStatus::New), now, default_listing_window()) {
        println!(
            "change #{} on monitor {}: {}% difference",
            change.id, change.monitor_id, change.difference
        );
        println!("diff: {}", change.snapshot_diff.to_json());
    }

    println!("watch-demo done");
    Ok(())
}
