//! Shared, reloadable configuration snapshot.
//!
//! [`SettingsService`] replaces a process-wide settings global. Readers
//! take an `Arc<FleetConfig>` snapshot with [`SettingsService::current`];
//! [`SettingsService::reload`] re-reads the file and swaps the snapshot
//! only when the new file parses and validates.

use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{info, warn};

use crate::config::FleetConfig;
use crate::Result;

/// Holder of the active configuration.
pub struct SettingsService {
    path: Option<PathBuf>,
    current: RwLock<Arc<FleetConfig>>,
}

impl SettingsService {
    /// Load the configuration file and keep its path for reloads.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or is invalid.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let config = FleetConfig::load_from_path(&path)?;
        Ok(Self {
            path: Some(path),
            current: RwLock::new(Arc::new(config)),
        })
    }

    /// Wrap an in-memory configuration. [`SettingsService::reload`] is a
    /// no-op for services built this way.
    #[must_use]
    pub fn from_config(config: FleetConfig) -> Self {
        Self {
            path: None,
            current: RwLock::new(Arc::new(config)),
        }
    }

    /// Path the configuration was loaded from, if any.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Snapshot of the active configuration.
    #[must_use]
    pub fn current(&self) -> Arc<FleetConfig> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Replace the active configuration outright.
    pub fn replace(&self, config: FleetConfig) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(config);
    }

    /// Re-read the configuration file.
    ///
    /// On error the previous configuration stays active.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or is invalid.
    pub fn reload(&self) -> Result<Arc<FleetConfig>> {
        let Some(path) = &self.path else {
            return Ok(self.current());
        };
        match FleetConfig::load_from_path(path) {
            Ok(config) => {
                let config = Arc::new(config);
                *self.current.write().unwrap_or_else(PoisonError::into_inner) =
                    Arc::clone(&config);
                info!(path = %path.display(), "configuration reloaded");
                Ok(config)
            }
            Err(err) => {
                warn!(%err, path = %path.display(), "configuration reload failed; keeping previous values");
                Err(err)
            }
        }
    }
}
