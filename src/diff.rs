//! # Change Detector
//! Structural delta between two snapshots of the same source, plus a
//! normalized difference score.
//!
//! The diff never encodes information that is not re-derivable from the two
//! snapshots. The score is an integer percentage in 0..=100: per-field change
//! magnitudes (1.0 for added/removed fields, one minus the normalized
//! Levenshtein similarity for changed fields) averaged over the union of
//! field names. Deterministic, and monotonic: more or larger field changes
//! never produce a lower score.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::snapshot::Snapshot;

/// Per-field delta. Unchanged fields are not recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FieldDelta {
    Added { new: String },
    Removed { old: String },
    Changed { old: String, new: String },
}

/// Machine-comparable diff over two snapshots' field mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapshotDiff {
    fields: BTreeMap<String, FieldDelta>,
}

impl SnapshotDiff {
    pub fn get(&self, field: &str) -> Option<&FieldDelta> {
        self.fields.get(field)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldDelta)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Canonical serialized form (BTreeMap ordering).
    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.fields).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Change magnitude for one field, in 0.0..=1.0.
fn field_magnitude(delta: &FieldDelta) -> f64 {
    match delta {
        FieldDelta::Added { .. } | FieldDelta::Removed { .. } => 1.0,
        FieldDelta::Changed { old, new } => {
            (1.0 - strsim::normalized_levenshtein(old, new)).clamp(0.0, 1.0)
        }
    }
}

/// Compare two snapshots. Returns the structural diff and the difference
/// percentage; a percentage of 0 means no change worth recording.
pub fn compare(before: &Snapshot, after: &Snapshot) -> (SnapshotDiff, u8) {
    let mut fields = BTreeMap::new();

    let names: BTreeSet<&str> = before.field_names().chain(after.field_names()).collect();
    let universe = names.len();

    for &name in &names {
        let delta = match (before.get(name), after.get(name)) {
            (None, Some(new)) => Some(FieldDelta::Added {
                new: new.to_string(),
            }),
            (Some(old), None) => Some(FieldDelta::Removed {
                old: old.to_string(),
            }),
            (Some(old), Some(new)) if old != new => Some(FieldDelta::Changed {
                old: old.to_string(),
                new: new.to_string(),
            }),
            _ => None,
        };
        if let Some(delta) = delta {
            fields.insert(name.to_string(), delta);
        }
    }

    let diff = SnapshotDiff { fields };
    if diff.is_empty() || universe == 0 {
        return (diff, 0);
    }

    let sum: f64 = diff.fields.values().map(field_magnitude).sum();
    let pct = (sum / universe as f64 * 100.0).round() as u8;
    // Any detected change reports at least 1 so it is never silently dropped.
    (diff, pct.clamp(1, 100))
}
