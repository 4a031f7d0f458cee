// src/lib.rs
// Public library surface for integration tests (and potential reuse).

pub mod change;
pub mod config;
pub mod diff;
pub mod error;
pub mod extractor;
pub mod filter;
pub mod monitor;
pub mod scheduler;
pub mod snapshot;
pub mod store;
pub mod template;

// ---- Re-exports for stable public API ----
pub use crate::change::{default_listing_window, ChangeStatus, ContentChange};
pub use crate::diff::{compare, FieldDelta, SnapshotDiff};
pub use crate::error::{CheckError, ConfigError, StoreError};
pub use crate::extractor::{FieldExtractor, MatchMode};
pub use crate::filter::{apply_chain, FieldFilter, FilterCfg};
pub use crate::monitor::{
    CheckClaim, ContentMonitor, ContentType, MonitorRegistry, MonitorState, SourceRef,
};
pub use crate::scheduler::{spawn_scheduler, CheckOutcome, Engine};
pub use crate::snapshot::{capture, ResultPolicy, Snapshot, SortOrder};
pub use crate::store::{
    ChangeStore, Clock, ContentFetcher, ManualClock, MemoryChangeStore, SequenceFetcher,
    SystemClock,
};
pub use crate::template::{
    resolve, ChannelConfig, FieldRule, ResolvedTemplates, TemplateHandle, TemplateSet,
};
