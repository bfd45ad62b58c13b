//! Persisted topology state
//!
//! A [`Snapshot`] holds node records and registry segments. It is written
//! after every committed change and read back on startup, so the registry
//! survives restarts without trusting provider state blindly.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::tables::STATE_VERSION;
use crate::types::{Node, Segment};

/// State persistence errors
#[derive(Debug, Error)]
pub enum StateError {
    #[error("State file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("State file {path} is not a valid snapshot: {message}")]
    Corrupt { path: PathBuf, message: String },

    #[error("Unsupported snapshot version {found} (expected {expected})")]
    Version { found: u32, expected: u32 },

    #[error("State store unavailable: {0}")]
    Unavailable(String),
}

/// Serialized topology
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,

    #[serde(default)]
    pub nodes: Vec<Node>,

    #[serde(default)]
    pub segments: Vec<Segment>,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            nodes: Vec::new(),
            segments: Vec::new(),
        }
    }
}

impl Snapshot {
    pub fn new(nodes: Vec<Node>, segments: Vec<Segment>) -> Self {
        Self {
            version: STATE_VERSION,
            nodes,
            segments,
        }
    }
}

/// Snapshot persistence
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Loads the last saved snapshot; an empty one if nothing was saved
    async fn load(&self) -> Result<Snapshot, StateError>;

    /// Replaces the saved snapshot
    async fn save(&self, snapshot: &Snapshot) -> Result<(), StateError>;
}

/// Pretty JSON file store
///
/// Writes go to a sibling temp file which is then renamed over the target.
#[derive(Debug, Clone)]
pub struct JsonStateStore {
    path: PathBuf,
}

impl JsonStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> StateError {
        StateError::Io {
            path: self.path.clone(),
            source,
        }
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl StateStore for JsonStateStore {
    async fn load(&self) -> Result<Snapshot, StateError> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No state file at {}, starting empty", self.path.display());
                return Ok(Snapshot::default());
            }
            Err(e) => return Err(self.io_error(e)),
        };
        if content.trim().is_empty() {
            return Ok(Snapshot::default());
        }

        let snapshot: Snapshot =
            serde_json::from_str(&content).map_err(|e| StateError::Corrupt {
                path: self.path.clone(),
                message: e.to_string(),
            })?;
        if snapshot.version != STATE_VERSION {
            return Err(StateError::Version {
                found: snapshot.version,
                expected: STATE_VERSION,
            });
        }

        debug!(
            "Loaded {} node(s) and {} segment(s) from {}",
            snapshot.nodes.len(),
            snapshot.segments.len(),
            self.path.display()
        );
        Ok(snapshot)
    }

    async fn save(&self, snapshot: &Snapshot) -> Result<(), StateError> {
        let content = serde_json::to_string_pretty(snapshot).map_err(|e| StateError::Corrupt {
            path: self.path.clone(),
            message: e.to_string(),
        })?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| self.io_error(e))?;
        }

        let tmp = self.temp_path();
        tokio::fs::write(&tmp, content)
            .await
            .map_err(|e| self.io_error(e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| self.io_error(e))?;

        debug!("Saved state to {}", self.path.display());
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MemoryInner {
    snapshot: Option<Snapshot>,
    saves: usize,
    fail_saves: bool,
}

/// In-memory store
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store preloaded with `snapshot`
    pub fn with_snapshot(snapshot: Snapshot) -> Self {
        let store = Self::default();
        store.inner.lock().snapshot = Some(snapshot);
        store
    }

    /// Last saved snapshot
    pub fn snapshot(&self) -> Option<Snapshot> {
        self.inner.lock().snapshot.clone()
    }

    /// Number of successful saves
    pub fn saves(&self) -> usize {
        self.inner.lock().saves
    }

    /// Makes every subsequent save fail
    pub fn set_fail_saves(&self, fail: bool) {
        self.inner.lock().fail_saves = fail;
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self) -> Result<Snapshot, StateError> {
        Ok(self.inner.lock().snapshot.clone().unwrap_or_default())
    }

    async fn save(&self, snapshot: &Snapshot) -> Result<(), StateError> {
        let mut inner = self.inner.lock();
        if inner.fail_saves {
            return Err(StateError::Unavailable("save rejected".to_string()));
        }
        inner.snapshot = Some(snapshot.clone());
        inner.saves += 1;
        Ok(())
    }
}
