//! Storage port for the task ledger
//!
//! The ledger is loaded once at start-up and written back after every
//! significant change. Backends only move bytes; upgrade of old layouts is
//! done by [`DoState::upgrade`] on whatever `load` returns.

use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::state::DoState;

/// Narrow load/save port; both operations may fail and may be retried
#[async_trait]
pub trait StatePersistence: Send + Sync {
    /// Raw persisted state, `None` when nothing has been saved yet
    async fn load(&self) -> StoreResult<Option<Value>>;

    /// Write the full state
    async fn save(&self, state: &DoState) -> StoreResult<()>;
}

/// JSON file backend
///
/// Writes go to a sibling temp file which is then renamed over the target,
/// so a crash mid-write leaves the previous state intact.
#[derive(Debug, Clone)]
pub struct FileStorage {
    path: PathBuf,
}

impl FileStorage {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "state.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl StatePersistence for FileStorage {
    async fn load(&self) -> StoreResult<Option<Value>> {
        debug!(path = %self.path.display(), "FileStorage::load: called");
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("FileStorage::load: no state file yet");
                return Ok(None);
            }
            Err(e) => return Err(StoreError::Io(e)),
        };
        if content.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(&content)?))
    }

    async fn save(&self, state: &DoState) -> StoreResult<()> {
        debug!(path = %self.path.display(), task_count = state.tasks.len(), "FileStorage::save: called");
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = serde_json::to_vec_pretty(state)?;
        let temp = self.temp_path();
        tokio::fs::write(&temp, content).await?;
        tokio::fs::rename(&temp, &self.path).await?;
        Ok(())
    }
}

/// In-memory backend
///
/// Keeps the last saved state as JSON. `fail_next_saves` makes the next N
/// saves fail, for exercising write-back retry.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    saved: Mutex<Option<Value>>,
    save_count: AtomicUsize,
    failures_remaining: AtomicUsize,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with a previously persisted state object
    pub fn with_state(value: Value) -> Self {
        Self {
            saved: Mutex::new(Some(value)),
            ..Self::default()
        }
    }

    pub fn fail_next_saves(&self, count: usize) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    /// Number of successful saves
    pub fn save_count(&self) -> usize {
        self.save_count.load(Ordering::SeqCst)
    }

    /// Last successfully saved state
    pub fn saved(&self) -> Option<Value> {
        self.saved.lock().ok().and_then(|guard| guard.clone())
    }
}

#[async_trait]
impl StatePersistence for MemoryStorage {
    async fn load(&self) -> StoreResult<Option<Value>> {
        Ok(self.saved())
    }

    async fn save(&self, state: &DoState) -> StoreResult<()> {
        let remaining = self.failures_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_remaining.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::Storage("injected save failure".to_string()));
        }
        let value = serde_json::to_value(state)?;
        let mut guard = self
            .saved
            .lock()
            .map_err(|_| StoreError::Storage("memory storage lock poisoned".to_string()))?;
        *guard = Some(value);
        self.save_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
