//! Debounced filesystem watchers.
//!
//! Observes a path with a glob pattern and invokes a callback with the
//! batch of matching paths once the debounce window closes.  Lifecycle
//! mirrors periodic tasks: the watcher runs until its handle is stopped
//! or dropped.

use std::path::{Path, PathBuf};
use std::time::Duration;

use globset::{Glob, GlobMatcher};
use notify_debouncer_mini::notify::{RecursiveMode, Watcher};
use notify_debouncer_mini::{new_debouncer, DebounceEventResult};
use tracing::{debug, warn};

use crate::errors::{FrameworkError, Result};

/// Default debounce window.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);

type WatchCallback = Box<dyn Fn(&[PathBuf]) + Send + 'static>;

/// Configuration for one watcher.
pub struct WatchSpec {
    pub name: String,
    pub path: PathBuf,
    pub pattern: String,
    pub debounce: Duration,
}

impl WatchSpec {
    pub fn new(name: &str, path: &Path, pattern: &str) -> Self {
        Self {
            name: name.to_string(),
            path: path.to_path_buf(),
            pattern: pattern.to_string(),
            debounce: DEFAULT_DEBOUNCE,
        }
    }
}

/// A running watcher; dropping it stops observation.
pub struct FileWatcher {
    name: String,
    // Held for its Drop side effect.
    _debouncer: notify_debouncer_mini::Debouncer<notify_debouncer_mini::notify::RecommendedWatcher>,
}

impl FileWatcher {
    /// Start watching `spec.path` recursively, invoking `callback` with
    /// the debounced batch of paths matching `spec.pattern`.
    pub fn start(spec: WatchSpec, callback: WatchCallback) -> Result<Self> {
        let matcher: GlobMatcher = Glob::new(&spec.pattern)
            .map_err(|e| {
                FrameworkError::Config(format!("bad watch pattern '{}': {e}", spec.pattern))
            })?
            .compile_matcher();

        let name = spec.name.clone();
        let event_name = name.clone();
        let mut debouncer = new_debouncer(spec.debounce, move |res: DebounceEventResult| {
            match res {
                Ok(events) => {
                    let paths: Vec<PathBuf> = events
                        .into_iter()
                        .map(|e| e.path)
                        .filter(|p| {
                            matcher.is_match(p)
                                || p.file_name()
                                    .map(|f| matcher.is_match(f))
                                    .unwrap_or(false)
                        })
                        .collect();
                    if !paths.is_empty() {
                        debug!(watcher = %event_name, changed = paths.len(), "debounced change batch");
                        callback(&paths);
                    }
                }
                Err(e) => warn!(watcher = %event_name, error = %e, "watch error"),
            }
        })
        .map_err(|e| FrameworkError::Config(format!("cannot create watcher: {e}")))?;

        debouncer
            .watcher()
            .watch(&spec.path, RecursiveMode::Recursive)
            .map_err(|e| {
                FrameworkError::Config(format!("cannot watch {}: {e}", spec.path.display()))
            })?;

        debug!(watcher = %name, path = %spec.path.display(), "watcher started");
        Ok(Self {
            name,
            _debouncer: debouncer,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}
