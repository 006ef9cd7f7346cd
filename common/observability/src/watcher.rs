//! Mount directory watcher for hot reload.

use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::snapshot::{is_hidden, load_source, ConfigSnapshot};

/// Watches a config mount and emits a fresh [`ConfigSnapshot`] for every
/// source touched by a filesystem event.
pub struct ConfigWatcher {
    mount: PathBuf,
    update_tx: mpsc::UnboundedSender<ConfigSnapshot>,
}

impl ConfigWatcher {
    /// Returns the watcher and a receiver for snapshot updates.
    pub fn new(mount: &Path) -> (Self, mpsc::UnboundedReceiver<ConfigSnapshot>) {
        let (update_tx, update_rx) = mpsc::unbounded_channel();
        (
            Self {
                mount: mount.to_path_buf(),
                update_tx,
            },
            update_rx,
        )
    }

    /// Start watching on notify's background thread. Watching stops when the
    /// returned watcher is dropped.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let tx = self.update_tx.clone();
        let mount = self.mount.clone();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    for source in affected_sources(&mount, &event) {
                        match load_source(&mount, &source) {
                            Ok(snapshot) => {
                                tracing::info!(
                                    source = %source,
                                    "config source change detected, reloading"
                                );
                                if tx.send(snapshot).is_err() {
                                    return;
                                }
                            }
                            Err(e) => {
                                tracing::error!(
                                    source = %source,
                                    error = %e,
                                    "failed to reload config source, keeping current settings"
                                );
                            }
                        }
                    }
                }
                Err(e) => tracing::error!(error = ?e, "config watch error"),
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;

        watcher.watch(&self.mount, RecursiveMode::Recursive)?;

        tracing::info!(mount = %self.mount.display(), "config watcher started");
        Ok(watcher)
    }
}

/// Source names (first path component below the mount) named by an event.
fn affected_sources(mount: &Path, event: &Event) -> BTreeSet<String> {
    if event.kind.is_access() {
        return BTreeSet::new();
    }
    event
        .paths
        .iter()
        .filter_map(|path| path.strip_prefix(mount).ok())
        .filter_map(|relative| match relative.components().next() {
            Some(Component::Normal(name)) => name.to_str().map(str::to_string),
            _ => None,
        })
        .filter(|name| !is_hidden(name))
        .collect()
}
