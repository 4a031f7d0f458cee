//! # Template Configuration Loading
//! Reads provider and channel template documents from a directory tree:
//!
//! ```text
//! <dir>/providers/*.toml
//! <dir>/channels/*.toml
//! ```
//!
//! A malformed document aborts loading of that template only; the rest of
//! the set still loads (fail fast per template, visible in the log). A
//! polling watcher re-resolves the whole set whenever any document changes,
//! in the same mtime-poll style as the rest of the service's reloadable
//! configs.

use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::template::{ChannelConfig, TemplateHandle, TemplateSet};

pub const ENV_TEMPLATE_DIR: &str = "PAGEWATCH_TEMPLATE_DIR";
pub const DEFAULT_TEMPLATE_DIR: &str = "config/templates";
pub const ENV_HOT_RELOAD: &str = "PAGEWATCH_HOT_RELOAD";

/// Resolve the template directory from env or default.
pub fn template_dir() -> PathBuf {
    std::env::var(ENV_TEMPLATE_DIR)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_TEMPLATE_DIR))
}

/// Load every template under `dir`. Per-document failures are logged and
/// skipped.
pub fn load_template_dir(dir: &Path) -> Result<TemplateSet> {
    let mut set = TemplateSet::default();
    for (sub, is_provider) in [("providers", true), ("channels", false)] {
        let path = dir.join(sub);
        if !path.exists() {
            continue;
        }
        let entries = fs::read_dir(&path)
            .with_context(|| format!("reading template dir {}", path.display()))?;
        for entry in entries.flatten() {
            let file = entry.path();
            if file.extension().and_then(|e| e.to_str()) != Some("toml") {
                continue;
            }
            match load_one(&file) {
                Ok(cfg) => {
                    if is_provider {
                        set.add_provider(cfg);
                    } else {
                        set.add_channel(cfg);
                    }
                }
                Err(e) => {
                    warn!(file = %file.display(), error = %e, "skipping malformed template");
                }
            }
        }
    }
    info!(
        providers = set.provider_count(),
        channels = set.channel_count(),
        "templates loaded"
    );
    Ok(set)
}

fn load_one(file: &Path) -> Result<ChannelConfig> {
    let content =
        fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
    let cfg = ChannelConfig::parse_toml(&content)
        .with_context(|| format!("compiling {}", file.display()))?;
    Ok(cfg)
}

/// Load from the env-or-default directory.
pub fn load_default() -> Result<TemplateSet> {
    load_template_dir(&template_dir())
}

/// Newest mtime across every file under `dir`, recursively.
fn latest_mtime(dir: &Path) -> Option<SystemTime> {
    let mut newest = None;
    let entries = fs::read_dir(dir).ok()?;
    for entry in entries.flatten() {
        let path = entry.path();
        let mtime = if path.is_dir() {
            latest_mtime(&path)
        } else {
            entry.metadata().and_then(|m| m.modified()).ok()
        };
        if let Some(m) = mtime {
            newest = Some(match newest {
                Some(prev) if prev >= m => prev,
                _ => m,
            });
        }
    }
    newest
}

fn hot_reload_enabled() -> bool {
    std::env::var(ENV_HOT_RELOAD).ok().as_deref() == Some("1")
}

/// Start a polling watcher on `dir` that reloads and re-resolves the whole
/// template set into `handle` when any document changes (2s poll). Enabled
/// with `PAGEWATCH_HOT_RELOAD=1`.
pub fn start_hot_reload_thread(handle: TemplateHandle, dir: PathBuf) {
    if !hot_reload_enabled() {
        return;
    }

    thread::spawn(move || {
        let poll = Duration::from_secs(2);
        let mut last_mtime: Option<SystemTime> = None;

        loop {
            match latest_mtime(&dir) {
                Some(mtime) => {
                    let changed = match last_mtime {
                        None => {
                            last_mtime = Some(mtime);
                            false
                        }
                        Some(prev) => mtime > prev,
                    };
                    if changed {
                        match load_template_dir(&dir) {
                            Ok(set) => {
                                handle.replace(set.resolve_all());
                                info!(dir = %dir.display(), "templates reloaded");
                            }
                            Err(e) => {
                                warn!(dir = %dir.display(), error = %e, "template reload failed")
                            }
                        }
                        last_mtime = Some(mtime);
                    }
                }
                None => {
                    // Directory missing or unreadable; keep trying.
                }
            }
            thread::sleep(poll);
        }
    });
}
