//! Engine error taxonomy.
//!
//! Three families with different recovery paths:
//! - [`ConfigError`] — raised at template load/compile time, aborts the
//!   offending template only (other templates keep loading).
//! - [`CheckError`] — fetch/extraction failure during a scheduled check;
//!   recovered by leaving the monitor's schedule unchanged so the same
//!   interval is retried.
//! - [`StoreError`] — persistence-level failures; a natural-key conflict is
//!   handled by the calling upsert logic, not treated as fatal.

use thiserror::Error;

use crate::change::ChangeStatus;

/// Load-time configuration failure. Never raised at extraction time.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("template `{template}`, field `{field}`: invalid expression: {source}")]
    BadExpression {
        template: String,
        field: String,
        #[source]
        source: regex::Error,
    },

    #[error("template `{template}`, field `{field}`: invalid filter pattern: {source}")]
    BadFilterPattern {
        template: String,
        field: String,
        #[source]
        source: regex::Error,
    },

    #[error("template `{template}`, field `{field}`: unknown match mode `{mode}` (expected `first` or `all`)")]
    BadMatchMode {
        template: String,
        field: String,
        mode: String,
    },

    #[error("template `{name}`: malformed document: {source}")]
    BadDocument {
        name: String,
        #[source]
        source: toml::de::Error,
    },
}

/// Runtime failure of a single scheduled check. Non-fatal: the monitor stays
/// due and is retried on the next tick.
#[derive(Debug, Error)]
pub enum CheckError {
    #[error("fetch of `{source_ref}` failed: {reason}")]
    Fetch { source_ref: String, reason: String },

    #[error("monitor {monitor_id}: no resolved template named `{template}`")]
    MissingTemplate { monitor_id: u64, template: String },

    #[error("monitor {monitor_id}: invalid source: {reason}")]
    BadSource { monitor_id: u64, reason: String },

    #[error("monitor {monitor_id}: failed to record change: {reason}")]
    Record { monitor_id: u64, reason: String },
}

/// Persistence-layer failure surfaced by monitor/change stores.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Uniqueness violation on a natural key. Callers upsert instead of
    /// failing.
    #[error("conflict on natural key: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid status transition {from:?} -> {to:?}")]
    InvalidTransition {
        from: ChangeStatus,
        to: ChangeStatus,
    },
}
