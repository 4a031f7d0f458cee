//! # Field Filters
//! Ordered post-processing applied to an extracted field value.
//!
//! Filters are pure functions from body to body, applied in declaration
//! order; each filter feeds its output to the next and none is skipped.
//! An unknown filter kind is a configuration error at document-parse time
//! (serde rejects the tag), and a `replace` filter with a malformed pattern
//! fails at compile time like extractor expressions do.

use once_cell::sync::OnceCell;
use regex::Regex;
use serde::Deserialize;

use crate::error::ConfigError;

/// Raw filter declaration from a template document. The `kind` tag selects
/// the variant; extra parameters live alongside it.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FilterCfg {
    /// Cap the body at `max` characters.
    Truncate { max: usize },
    /// Regex substitution over the whole body.
    Replace { pattern: String, with: String },
    /// Remove HTML/XML tags.
    StripTags,
    /// Decode HTML entities (`&amp;` and friends).
    DecodeEntities,
    /// Trim leading/trailing whitespace.
    Trim,
    /// Collapse runs of whitespace into single spaces.
    CollapseWhitespace,
    Lowercase,
    Uppercase,
}

/// Compiled filter. Owned by the field rule that holds the ordered list.
#[derive(Debug, Clone)]
pub enum FieldFilter {
    Truncate(usize),
    Replace { re: Regex, with: String },
    StripTags,
    DecodeEntities,
    Trim,
    CollapseWhitespace,
    Lowercase,
    Uppercase,
}

fn tags_re() -> &'static Regex {
    static RE: OnceCell<Regex> = OnceCell::new();
    RE.get_or_init(|| Regex::new(r"(?is)</?[^>]+>").expect("tag-strip regex"))
}

fn ws_re() -> &'static Regex {
    static RE: OnceCell<Regex> = OnceCell::new();
    RE.get_or_init(|| Regex::new(r"\s+").expect("whitespace regex"))
}

impl FieldFilter {
    /// Compile a document fragment. `template`/`field` are error context only.
    pub fn compile(template: &str, field: &str, cfg: &FilterCfg) -> Result<Self, ConfigError> {
        Ok(match cfg {
            FilterCfg::Truncate { max } => Self::Truncate(*max),
            FilterCfg::Replace { pattern, with } => Self::Replace {
                re: Regex::new(pattern).map_err(|e| ConfigError::BadFilterPattern {
                    template: template.to_string(),
                    field: field.to_string(),
                    source: e,
                })?,
                with: with.clone(),
            },
            FilterCfg::StripTags => Self::StripTags,
            FilterCfg::DecodeEntities => Self::DecodeEntities,
            FilterCfg::Trim => Self::Trim,
            FilterCfg::CollapseWhitespace => Self::CollapseWhitespace,
            FilterCfg::Lowercase => Self::Lowercase,
            FilterCfg::Uppercase => Self::Uppercase,
        })
    }

    /// Apply to one body. Pure; no side effects.
    pub fn apply(&self, body: &str) -> String {
        match self {
            Self::Truncate(max) => {
                if body.chars().count() > *max {
                    body.chars().take(*max).collect()
                } else {
                    body.to_string()
                }
            }
            Self::Replace { re, with } => re.replace_all(body, with.as_str()).into_owned(),
            Self::StripTags => tags_re().replace_all(body, "").into_owned(),
            Self::DecodeEntities => html_escape::decode_html_entities(body).into_owned(),
            Self::Trim => body.trim().to_string(),
            Self::CollapseWhitespace => ws_re().replace_all(body, " ").into_owned(),
            Self::Lowercase => body.to_lowercase(),
            Self::Uppercase => body.to_uppercase(),
        }
    }
}

/// Run an ordered chain, feeding each filter's output to the next.
pub fn apply_chain(filters: &[FieldFilter], body: &str) -> String {
    let mut out = body.to_string();
    for f in filters {
        out = f.apply(&out);
    }
    out
}
