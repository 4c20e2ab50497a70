//! Watcher for the sites directory.
//!
//! Reports when entries directly under the sites path change, so the root
//! registry can pick up newly created site directories.

use std::path::{Path, PathBuf};
use std::time::Duration;

use notify_debouncer_mini::{DebounceEventResult, new_debouncer, notify::RecursiveMode};
use tokio::sync::mpsc;

use crate::error::{ServerError, ServerResult};

/// Debounce window for bursts of directory events.
const DEBOUNCE: Duration = Duration::from_millis(200);

/// Sites directory watcher handle.
pub struct SitesWatcher {
    /// Debouncer handle (kept alive to maintain watcher).
    _debouncer: notify_debouncer_mini::Debouncer<notify::RecommendedWatcher>,
    /// Receiver for changed entries.
    rx: mpsc::UnboundedReceiver<Vec<PathBuf>>,
}

impl SitesWatcher {
    /// Watch the immediate children of `sites_path`.
    pub fn new(sites_path: impl AsRef<Path>) -> ServerResult<Self> {
        let sites_path = sites_path.as_ref().to_path_buf();
        let (tx, rx) = mpsc::unbounded_channel();

        let mut debouncer = new_debouncer(DEBOUNCE, move |result: DebounceEventResult| {
            match result {
                Ok(events) if !events.is_empty() => {
                    let paths = events.into_iter().map(|event| event.path).collect();
                    let _ = tx.send(paths);
                }
                Ok(_) => {}
                Err(e) => tracing::warn!("Sites watcher error: {}", e),
            }
        })
        .map_err(|e| ServerError::Watch(e.to_string()))?;

        debouncer
            .watcher()
            .watch(&sites_path, RecursiveMode::NonRecursive)
            .map_err(|e| ServerError::Watch(e.to_string()))?;

        Ok(Self {
            _debouncer: debouncer,
            rx,
        })
    }

    /// Receive the next batch of changed paths.
    pub async fn recv(&mut self) -> Option<Vec<PathBuf>> {
        self.rx.recv().await
    }
}
