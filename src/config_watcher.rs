//! Hot-reload watcher for `fleet.toml`.
//!
//! [`ConfigWatcher`] uses the `notify` crate to watch the configuration
//! file and calls [`SettingsService::reload`] on every change. A reload
//! that fails to parse or validate keeps the previous configuration; the
//! control loop picks up a successful reload on its next tick.
//!
//! The callback runs on the `notify` thread, which is why the settings
//! snapshot sits behind a `std::sync::RwLock`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{info, warn};

use crate::settings::SettingsService;
use crate::{AppError, Result};

/// Returns `true` for file-system events on `path` that indicate it was
/// written or replaced.
fn is_config_change(event: &Event, path: &Path) -> bool {
    matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    ) && event
        .paths
        .iter()
        .any(|p| p.file_name() == path.file_name())
}

/// Keeps a `notify` watcher alive for its own lifetime.
///
/// Dropping a `ConfigWatcher` stops the OS watch.
pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
    path: PathBuf,
}

impl ConfigWatcher {
    /// Watch the file `settings` was loaded from.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the settings have no backing file or
    /// the watcher cannot be created.
    pub fn new(settings: Arc<SettingsService>) -> Result<Self> {
        let path = settings
            .path()
            .map(Path::to_path_buf)
            .ok_or_else(|| AppError::Config("settings have no backing file to watch".into()))?;
        let path_for_callback = path.clone();

        let mut watcher = notify::recommended_watcher(
            move |result: std::result::Result<Event, notify::Error>| match result {
                Ok(event) if is_config_change(&event, &path_for_callback) => {
                    // Failures are logged by reload and the old snapshot stays.
                    let _ = settings.reload();
                }
                Err(err) => {
                    warn!(%err, "config file watcher error");
                }
                _ => {}
            },
        )
        .map_err(|err| AppError::Config(format!("failed to create config file watcher: {err}")))?;

        // Watch the parent so rename-based saves are seen.
        let watch_target = path
            .parent()
            .filter(|p| p != &Path::new(""))
            .unwrap_or(&path)
            .to_path_buf();

        watcher
            .watch(&watch_target, RecursiveMode::NonRecursive)
            .map_err(|err| {
                AppError::Config(format!(
                    "failed to watch config path '{}': {err}",
                    watch_target.display()
                ))
            })?;

        info!(path = %path.display(), "config watcher started");
        Ok(Self {
            _watcher: watcher,
            path,
        })
    }

    /// File being watched.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}
