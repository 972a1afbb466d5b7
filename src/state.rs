//! Per-component "configured" state.
//!
//! Each component (ssh, gpg, backup) runs its one-time setup at most once.
//! The record of that is a boolean flag per component name, persisted by the
//! file-backed store as a marker file under the state root: the file exists
//! if and only if the component is configured.
//!
//! [`MemoryStateStore`] backs tests that must not touch the filesystem.

use std::collections::HashSet;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing::{debug, info};

/// Boolean configured-flag per named component.
///
/// `mark_configured` is idempotent; `mark_unconfigured` is a no-op when the
/// component is already unconfigured.
pub trait StateStore {
    fn is_configured(&self, component: &str) -> bool;
    fn mark_configured(&self, component: &str) -> Result<()>;
    fn mark_unconfigured(&self, component: &str) -> Result<()>;
}

/// Marker-file store rooted at a fixed state directory.
pub struct FileStateStore {
    root: PathBuf,
}

impl FileStateStore {
    /// Open the store, creating the state root if it does not exist yet.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if !root.exists() {
            info!("creating state directory {}", root.display());
            fs::create_dir_all(&root)
                .with_context(|| format!("creating state directory {}", root.display()))?;
        }
        Ok(Self { root })
    }

    fn marker_path(&self, component: &str) -> PathBuf {
        self.root.join(component)
    }
}

impl StateStore for FileStateStore {
    fn is_configured(&self, component: &str) -> bool {
        let marker = self.marker_path(component);
        if marker.exists() {
            debug!("{} already configured, marker {} exists", component, marker.display());
            return true;
        }
        false
    }

    fn mark_configured(&self, component: &str) -> Result<()> {
        let marker = self.marker_path(component);
        fs::write(&marker, b"")
            .with_context(|| format!("writing state marker {}", marker.display()))?;
        Ok(())
    }

    fn mark_unconfigured(&self, component: &str) -> Result<()> {
        let marker = self.marker_path(component);
        match fs::remove_file(&marker) {
            Ok(()) => Ok(()),
            // Already unconfigured - rollback paths must not fail on this.
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => {
                Err(e).with_context(|| format!("removing state marker {}", marker.display()))
            }
        }
    }
}

/// In-memory store for tests.
#[derive(Default)]
pub struct MemoryStateStore {
    configured: Mutex<HashSet<String>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStateStore {
    fn is_configured(&self, component: &str) -> bool {
        self.configured.lock().unwrap().contains(component)
    }

    fn mark_configured(&self, component: &str) -> Result<()> {
        self.configured.lock().unwrap().insert(component.to_string());
        Ok(())
    }

    fn mark_unconfigured(&self, component: &str) -> Result<()> {
        self.configured.lock().unwrap().remove(component);
        Ok(())
    }
}
