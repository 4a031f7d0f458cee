//! # Template Resolver
//! Provider → channel template inheritance.
//!
//! Template documents are nested key/value structures: a top-level `name`,
//! an optional `provider` reference, and a `fields` table mapping field name
//! to `{ expr, format, match, filters }`. Channels inherit every field they
//! do not declare from their provider; fields the channel declares explicitly
//! always win, and the channel's own filter chains survive the merge verbatim.
//!
//! Resolution is a pure function over immutable inputs ([`resolve`]), so the
//! merge order is testable in isolation. A [`TemplateHandle`] wraps the
//! resolved set for concurrent readers and supports whole-set replacement on
//! hot reload.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use serde::Deserialize;
use tracing::warn;

use crate::error::ConfigError;
use crate::extractor::{ExtractorCfg, FieldExtractor};
use crate::filter::{FieldFilter, FilterCfg};

/// One field declaration in a template document: an extractor fragment plus
/// an ordered filter list.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FieldDoc {
    #[serde(flatten)]
    pub extractor: ExtractorCfg,
    #[serde(default)]
    pub filters: Vec<FilterCfg>,
}

/// A provider or channel template document, as parsed from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct TemplateDoc {
    pub name: String,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub fields: BTreeMap<String, FieldDoc>,
}

/// Compiled extraction rule for one field.
#[derive(Debug, Clone)]
pub struct FieldRule {
    pub extractor: FieldExtractor,
    pub filters: Vec<FieldFilter>,
}

/// A compiled template: either a provider baseline or a channel instance.
/// After [`resolve`], a channel config is flattened: it carries the full,
/// provider-merged field set.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub name: String,
    pub provider: Option<String>,
    pub fields: BTreeMap<String, FieldRule>,
}

impl ChannelConfig {
    /// Compile a parsed document. Fails fast on any malformed expression,
    /// filter pattern, or match mode.
    pub fn compile(doc: &TemplateDoc) -> Result<Self, ConfigError> {
        let mut fields = BTreeMap::new();
        for (field_name, field_doc) in &doc.fields {
            let extractor = FieldExtractor::compile(&doc.name, field_name, &field_doc.extractor)?;
            let filters = field_doc
                .filters
                .iter()
                .map(|f| FieldFilter::compile(&doc.name, field_name, f))
                .collect::<Result<Vec<_>, _>>()?;
            fields.insert(field_name.clone(), FieldRule { extractor, filters });
        }
        Ok(Self {
            name: doc.name.clone(),
            provider: doc.provider.clone(),
            fields,
        })
    }

    /// Parse and compile a TOML document in one step.
    pub fn parse_toml(src: &str) -> Result<Self, ConfigError> {
        let doc: TemplateDoc = toml::from_str(src).map_err(|e| ConfigError::BadDocument {
            name: "<inline>".to_string(),
            source: e,
        })?;
        Self::compile(&doc)
    }
}

/// Merge a provider baseline into a channel draft, returning a new resolved
/// config. Precedence, in order:
///
/// 1. Every provider field the draft does not declare is inherited as-is.
/// 2. Every field the draft declares explicitly wins over the provider's.
/// 3. A draft field that declares only filters (inert extractor) inherits the
///    provider's extractor but keeps its own filter chain, exactly once.
/// 4. The draft's `name` is preserved.
///
/// With no provider, the draft is used as parsed (not an error).
pub fn resolve(provider: Option<&ChannelConfig>, draft: &ChannelConfig) -> ChannelConfig {
    let Some(provider) = provider else {
        return draft.clone();
    };

    let mut fields = provider.fields.clone();
    for (name, own) in &draft.fields {
        let merged = match fields.get(name) {
            Some(inherited)
                if own.extractor.is_inert() && !inherited.extractor.is_inert() =>
            {
                FieldRule {
                    extractor: inherited.extractor.clone(),
                    filters: own.filters.clone(),
                }
            }
            _ => own.clone(),
        };
        fields.insert(name.clone(), merged);
    }

    ChannelConfig {
        name: draft.name.clone(),
        provider: draft.provider.clone(),
        fields,
    }
}

/// All loaded template drafts, prior to resolution. Providers may themselves
/// reference other providers; chains are resolved recursively with a cycle
/// guard.
#[derive(Debug, Clone, Default)]
pub struct TemplateSet {
    providers: BTreeMap<String, ChannelConfig>,
    channels: BTreeMap<String, ChannelConfig>,
}

impl TemplateSet {
    pub fn add_provider(&mut self, cfg: ChannelConfig) {
        self.providers.insert(cfg.name.clone(), cfg);
    }

    pub fn add_channel(&mut self, cfg: ChannelConfig) {
        self.channels.insert(cfg.name.clone(), cfg);
    }

    pub fn provider_count(&self) -> usize {
        self.providers.len()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Fully resolve one provider, following its own provider chain.
    /// `visited` breaks reference cycles: on a cycle the draft is used as-is.
    fn resolve_provider(&self, name: &str, visited: &mut Vec<String>) -> Option<ChannelConfig> {
        let draft = self.providers.get(name)?;
        let Some(parent_name) = draft.provider.as_deref() else {
            return Some(draft.clone());
        };
        if visited.iter().any(|v| v == name) {
            warn!(provider = name, "provider reference cycle, using draft as-is");
            return Some(draft.clone());
        }
        visited.push(name.to_string());
        let parent = self.resolve_provider(parent_name, visited);
        if parent.is_none() {
            warn!(
                provider = name,
                parent = parent_name,
                "provider references unknown parent, using draft as-is"
            );
        }
        Some(resolve(parent.as_ref(), draft))
    }

    /// Resolve every channel against its provider chain.
    pub fn resolve_all(&self) -> ResolvedTemplates {
        let mut channels = BTreeMap::new();
        for (name, draft) in &self.channels {
            let provider = match draft.provider.as_deref() {
                None => None,
                Some(p) => {
                    let resolved = self.resolve_provider(p, &mut Vec::new());
                    if resolved.is_none() {
                        warn!(channel = name.as_str(), provider = p, "unknown provider, channel used as parsed");
                    }
                    resolved
                }
            };
            channels.insert(name.clone(), resolve(provider.as_ref(), draft));
        }
        ResolvedTemplates { channels }
    }
}

/// The flattened, per-channel configurations used for extraction.
#[derive(Debug, Clone, Default)]
pub struct ResolvedTemplates {
    channels: BTreeMap<String, ChannelConfig>,
}

impl ResolvedTemplates {
    pub fn channel(&self, name: &str) -> Option<&ChannelConfig> {
        self.channels.get(name)
    }

    pub fn channel_names(&self) -> Vec<String> {
        self.channels.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

/// Thread-safe handle over the resolved set. Resolution itself is stateless;
/// the handle only coordinates whole-set replacement on reload so concurrent
/// readers of different channels never block each other for long.
#[derive(Clone)]
pub struct TemplateHandle {
    inner: Arc<RwLock<ResolvedTemplates>>,
}

impl TemplateHandle {
    pub fn new(resolved: ResolvedTemplates) -> Self {
        Self {
            inner: Arc::new(RwLock::new(resolved)),
        }
    }

    /// Clone out one channel's resolved config.
    pub fn channel(&self, name: &str) -> Option<ChannelConfig> {
        self.inner
            .read()
            .ok()
            .and_then(|set| set.channel(name).cloned())
    }

    pub fn channel_names(&self) -> Vec<String> {
        self.inner
            .read()
            .map(|set| set.channel_names())
            .unwrap_or_default()
    }

    /// Swap in a freshly resolved set (hot reload / cache invalidation).
    pub fn replace(&self, resolved: ResolvedTemplates) {
        if let Ok(mut guard) = self.inner.write() {
            *guard = resolved;
        }
    }
}
