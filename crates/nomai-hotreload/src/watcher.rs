//! Filesystem watcher feeding a [`ChangeFeed`].
//!
//! Runs on notify's background thread. It never touches the registry or the
//! scene; it only maps changed paths to logical names.

use std::path::{Path, PathBuf};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};

use crate::orchestrator::ChangeFeed;
use crate::source::ComponentSources;
use crate::HotReloadError;

/// Watches component and auxiliary directories for source edits.
pub struct SourceWatcher {
    _watcher: RecommendedWatcher,
    watched: Vec<PathBuf>,
}

impl SourceWatcher {
    /// Start watching every directory of `sources`.
    ///
    /// # Errors
    ///
    /// [`HotReloadError::Watch`] if a directory cannot be watched.
    pub fn spawn(sources: &ComponentSources, feed: ChangeFeed) -> Result<Self, HotReloadError> {
        let mapper = sources.clone();
        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            match res {
                Ok(event) => {
                    for name in changed_names(&mapper, &event) {
                        feed.notify(name);
                    }
                }
                Err(e) => tracing::warn!(error = %e, "file watcher error"),
            }
        })?;

        let watched = sources.watch_dirs();
        for dir in &watched {
            watcher.watch(dir, RecursiveMode::NonRecursive)?;
            tracing::info!(dir = %dir.display(), "watching component sources");
        }

        Ok(Self {
            _watcher: watcher,
            watched,
        })
    }

    pub fn watched(&self) -> &[PathBuf] {
        &self.watched
    }
}

impl std::fmt::Debug for SourceWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceWatcher")
            .field("watched", &self.watched)
            .finish_non_exhaustive()
    }
}

/// Logical names touched by a create, modify, or remove event.
fn changed_names(sources: &ComponentSources, event: &Event) -> Vec<String> {
    match event.kind {
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_) => event
            .paths
            .iter()
            .filter_map(|p| name_for(sources, p))
            .collect(),
        _ => Vec::new(),
    }
}

fn name_for(sources: &ComponentSources, path: &Path) -> Option<String> {
    let name = sources.logical_name(path)?;
    // Editor swap files and dotfiles share the extension on some platforms.
    if name.starts_with('.') {
        return None;
    }
    Some(name)
}
