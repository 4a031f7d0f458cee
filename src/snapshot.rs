//! # Snapshot
//! The structured field-value result of extracting a source at one point in
//! time.
//!
//! Snapshots are order-independent maps keyed by field name, backed by a
//! `BTreeMap` so serialization is deterministic for comparison and storage.
//! [`capture`] applies every extractor in a resolved channel config and then
//! the field's filter chain; list-type (`match = "all"`) fields pass through
//! the monitor's sort and result-cap policy before being joined.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::extractor::MatchMode;
use crate::filter::apply_chain;
use crate::template::ChannelConfig;

/// Order in which candidate list results are evaluated before the cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    /// Keep document order.
    #[default]
    Document,
    Ascending,
    Descending,
}

/// Per-capture policy for list-type fields, taken from the owning monitor.
/// `max_results = 0` means unlimited.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResultPolicy {
    pub sort: SortOrder,
    pub max_results: usize,
}

/// Field name → extracted+filtered value. Empty values are omitted so that a
/// field which stops matching shows up as removed in the diff.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Snapshot {
    fields: BTreeMap<String, String>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<String>) {
        self.fields.insert(field.into(), value.into());
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.fields.get(field).map(String::as_str)
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Canonical serialized form. BTreeMap ordering makes this deterministic.
    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.fields).unwrap_or_else(|_| "{}".to_string())
    }

    /// Short content hash over the canonical form, for cheap no-change
    /// short-circuits and idempotent re-checks.
    pub fn content_hash(&self) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(self.to_json().as_bytes());
        let digest = hasher.finalize();
        let mut out = String::with_capacity(16);
        for b in digest.iter().take(8) {
            use std::fmt::Write as _;
            let _ = write!(&mut out, "{:02x}", b);
        }
        out
    }
}

/// Sort and cap list-type results per the monitor's policy.
fn apply_result_policy(mut values: Vec<String>, policy: &ResultPolicy) -> Vec<String> {
    match policy.sort {
        SortOrder::Document => {}
        SortOrder::Ascending => values.sort(),
        SortOrder::Descending => {
            values.sort();
            values.reverse();
        }
    }
    if policy.max_results > 0 && values.len() > policy.max_results {
        values.truncate(policy.max_results);
    }
    values
}

/// Apply a resolved channel configuration to raw fetched content.
pub fn capture(cfg: &ChannelConfig, raw: &str, policy: &ResultPolicy) -> Snapshot {
    let mut snap = Snapshot::new();

    for (name, rule) in &cfg.fields {
        let value = match rule.extractor.mode() {
            MatchMode::First => rule
                .extractor
                .extract(raw)
                .map(|v| apply_chain(&rule.filters, &v))
                .unwrap_or_default(),
            MatchMode::All => {
                let entries: Vec<String> = rule
                    .extractor
                    .extract_all(raw)
                    .into_iter()
                    .map(|v| apply_chain(&rule.filters, &v))
                    .filter(|v| !v.is_empty())
                    .collect();
                apply_result_policy(entries, policy).join("\n")
            }
        };

        if !value.is_empty() {
            snap.insert(name.clone(), value);
        }
    }

    snap
}
