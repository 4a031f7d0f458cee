//! # Field Extractor
//! A single named regex rule producing one field's value from raw text.
//!
//! - Expressions compile with DOTALL semantics (`.` matches newlines) because
//!   extracted fields commonly span multiple lines of fetched markup.
//! - `format` is a capture-group substitution template; defaults to `$1`.
//! - `match = "first"` takes the first match, `match = "all"` collects every
//!   non-overlapping match in document order (the caller decides whether to
//!   join or keep the list).
//! - An extractor with an empty expression is inert: it matches nothing and
//!   contributes nothing, which is an explicit no-op rather than an error.
//!
//! Malformed expressions fail at compile time with [`ConfigError`], never
//! during extraction.

use regex::{Regex, RegexBuilder};
use serde::Deserialize;

use crate::error::ConfigError;

/// Output format used when a template declares an expression but no format.
pub const DEFAULT_FORMAT: &str = "$1";

/// How many matches an extractor consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatchMode {
    #[default]
    First,
    All,
}

impl MatchMode {
    /// Parse the document value (`first` / `all`, case-insensitive).
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "first" => Some(Self::First),
            "all" => Some(Self::All),
            _ => None,
        }
    }
}

/// Raw extractor fragment exactly as it appears in a template document:
/// `{ expr, format, match }`, all optional.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExtractorCfg {
    #[serde(default)]
    pub expr: Option<String>,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default, rename = "match")]
    pub match_mode: Option<String>,
}

/// Compiled, immutable extractor. Owned by the field rule that declared it.
#[derive(Debug, Clone)]
pub struct FieldExtractor {
    name: String,
    re: Option<Regex>,
    format: String,
    mode: MatchMode,
}

impl FieldExtractor {
    /// Compile a document fragment. `template` is only used for error context.
    pub fn compile(template: &str, name: &str, cfg: &ExtractorCfg) -> Result<Self, ConfigError> {
        let mode = match cfg.match_mode.as_deref() {
            None => MatchMode::default(),
            Some(raw) => MatchMode::parse(raw).ok_or_else(|| ConfigError::BadMatchMode {
                template: template.to_string(),
                field: name.to_string(),
                mode: raw.to_string(),
            })?,
        };

        let re = match cfg.expr.as_deref() {
            None | Some("") => None,
            Some(expr) => Some(
                RegexBuilder::new(expr)
                    .dot_matches_new_line(true)
                    .build()
                    .map_err(|e| ConfigError::BadExpression {
                        template: template.to_string(),
                        field: name.to_string(),
                        source: e,
                    })?,
            ),
        };

        Ok(Self {
            name: name.to_string(),
            re,
            format: cfg
                .format
                .clone()
                .unwrap_or_else(|| DEFAULT_FORMAT.to_string()),
            mode,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> MatchMode {
        self.mode
    }

    /// True when no expression was declared; an inert extractor never matches.
    pub fn is_inert(&self) -> bool {
        self.re.is_none()
    }

    /// Run the expression once; substitute captures into the format template.
    pub fn extract(&self, text: &str) -> Option<String> {
        let re = self.re.as_ref()?;
        let caps = re.captures(text)?;
        let mut out = String::new();
        caps.expand(&self.format, &mut out);
        Some(out)
    }

    /// Run over all non-overlapping matches, in document order.
    pub fn extract_all(&self, text: &str) -> Vec<String> {
        let Some(re) = self.re.as_ref() else {
            return Vec::new();
        };
        re.captures_iter(text)
            .map(|caps| {
                let mut out = String::new();
                caps.expand(&self.format, &mut out);
                out
            })
            .collect()
    }
}
