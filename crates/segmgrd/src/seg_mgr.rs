//! Segment Manager - node records, segment registry and persistence
//!
//! [`SegMgr`] owns the in-memory topology and the collaborators every
//! request goes through. Interface changes live in `reconciler.rs`, route
//! changes in `routes.rs`, container lifecycle in `node.rs`.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock as GateLock};
use tracing::{info, instrument, warn};

use crate::address::Subnet;
use crate::config::SegMgrConfig;
use crate::error::{SegMgrError, SegMgrResult};
use crate::locks::KeyedLocks;
use crate::provider::NetworkProvider;
use crate::registry::{ConsistencyError, SegmentRegistry};
use crate::state::{Snapshot, StateError, StateStore};
use crate::tables::{DEFAULT_IMAGE_CONTEXT, DEFAULT_PROTECTED_SEGMENTS};
use crate::types::{Node, NodeKind, Segment};

/// Tunables taken from the daemon configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegMgrOptions {
    /// Segments never garbage-collected
    pub protected_segments: Vec<String>,

    /// Echo requests per ping
    pub ping_count: u32,

    /// Budget for a ping run
    pub ping_timeout: Duration,

    /// Parent of the per-kind image build contexts
    pub image_context: PathBuf,
}

impl Default for SegMgrOptions {
    fn default() -> Self {
        Self {
            protected_segments: DEFAULT_PROTECTED_SEGMENTS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            ping_count: 4,
            ping_timeout: Duration::from_secs(10),
            image_context: PathBuf::from(DEFAULT_IMAGE_CONTEXT),
        }
    }
}

impl SegMgrOptions {
    pub fn from_config(config: &SegMgrConfig) -> Self {
        Self {
            protected_segments: config.provider.protected_segments.clone(),
            ping_count: config.diagnostics.ping_count,
            ping_timeout: config.ping_timeout(),
            image_context: config.images.context_dir.clone(),
        }
    }
}

/// Outcome of a registry reconciliation
#[derive(Debug, Clone, Serialize)]
pub struct ReconcileReport {
    /// Segments known after reconciliation
    pub segments: usize,

    /// Disagreements found, already logged
    #[serde(serialize_with = "serialize_problems")]
    pub problems: Vec<ConsistencyError>,

    /// Set when the adopted registry could not be saved
    pub save_error: Option<String>,
}

fn serialize_problems<S: serde::Serializer>(
    problems: &[ConsistencyError],
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.collect_seq(problems.iter().map(ToString::to_string))
}

/// Segment Manager
pub struct SegMgr {
    pub(crate) provider: Arc<dyn NetworkProvider>,
    store: Arc<dyn StateStore>,

    /// Canonical subnet -> segment record
    pub(crate) registry: RwLock<SegmentRegistry>,

    /// Node id -> node record
    pub(crate) nodes: RwLock<BTreeMap<String, Node>>,

    /// Held for a whole request on one node
    pub(crate) node_locks: KeyedLocks<String>,

    /// Held while a segment is resolved, created or collected
    pub(crate) subnet_locks: KeyedLocks<Subnet>,

    /// Requests share it; reconciliation takes it exclusively
    pub(crate) gate: GateLock<()>,

    /// Serializes snapshot saves
    persist_lock: Mutex<()>,

    pub(crate) options: SegMgrOptions,
}

impl SegMgr {
    /// Creates a manager with an empty topology
    pub fn new(
        provider: Arc<dyn NetworkProvider>,
        store: Arc<dyn StateStore>,
        options: SegMgrOptions,
    ) -> Self {
        Self {
            provider,
            store,
            registry: RwLock::new(SegmentRegistry::new()),
            nodes: RwLock::new(BTreeMap::new()),
            node_locks: KeyedLocks::new(),
            subnet_locks: KeyedLocks::new(),
            gate: GateLock::new(()),
            persist_lock: Mutex::new(()),
            options,
        }
    }

    /// Creates a manager from the store's last snapshot
    pub async fn restore(
        provider: Arc<dyn NetworkProvider>,
        store: Arc<dyn StateStore>,
        options: SegMgrOptions,
    ) -> SegMgrResult<Self> {
        let snapshot = store.load().await?;
        info!(
            "Restored {} node(s) and {} segment(s)",
            snapshot.nodes.len(),
            snapshot.segments.len()
        );

        let mgr = Self::new(provider, store, options);
        *mgr.registry.write() = SegmentRegistry::from_snapshot(snapshot.segments);
        *mgr.nodes.write() = snapshot
            .nodes
            .into_iter()
            .map(|n| (n.id.clone(), n))
            .collect();
        Ok(mgr)
    }

    /// Copy of a node record
    pub fn node(&self, id: &str) -> Option<Node> {
        self.nodes.read().get(id).cloned()
    }

    /// All node records sorted by id
    pub fn nodes(&self) -> Vec<Node> {
        self.nodes.read().values().cloned().collect()
    }

    /// Registry contents sorted by subnet
    pub fn registry_snapshot(&self) -> Vec<Segment> {
        self.registry.read().snapshot()
    }

    /// Current topology as a persistable snapshot
    pub fn snapshot(&self) -> Snapshot {
        let nodes = self.nodes();
        let segments = self.registry_snapshot();
        Snapshot::new(nodes, segments)
    }

    /// Adds an empty record for `id` unless one exists; true if added
    pub fn ensure_node(&self, id: &str, kind: NodeKind) -> bool {
        let mut nodes = self.nodes.write();
        if nodes.contains_key(id) {
            return false;
        }
        nodes.insert(id.to_string(), Node::new(id, kind));
        true
    }

    /// Existing record of `id`, or a fresh one with the kind its id implies
    pub(crate) fn node_record(&self, id: &str) -> SegMgrResult<Node> {
        if let Some(node) = self.node(id) {
            return Ok(node);
        }
        Node::from_id(id).ok_or_else(|| SegMgrError::unknown_node(id))
    }

    /// Existing record of `id`
    pub(crate) fn existing_node(&self, id: &str) -> SegMgrResult<Node> {
        self.node(id).ok_or_else(|| SegMgrError::unknown_node(id))
    }

    pub(crate) fn store_node(&self, node: Node) {
        self.nodes.write().insert(node.id.clone(), node);
    }

    pub(crate) fn is_protected(&self, segment: &str) -> bool {
        self.options
            .protected_segments
            .iter()
            .any(|p| p == segment)
    }

    /// Saves the current topology
    pub async fn persist(&self) -> Result<(), StateError> {
        let _guard = self.persist_lock.lock().await;
        let snapshot = self.snapshot();
        self.store.save(&snapshot).await
    }

    /// Rebuilds the registry from the provider's view
    ///
    /// Waits for in-flight requests and blocks new ones meanwhile. A failed
    /// listing leaves the registry untouched.
    #[instrument(skip(self))]
    pub async fn reconcile_with_provider(&self) -> SegMgrResult<ReconcileReport> {
        let _gate = self.gate.write().await;

        let observation = SegmentRegistry::observe_provider(self.provider.as_ref())
            .await
            .map_err(|e| SegMgrError::provider("list segments", e))?;

        let (problems, segments) = {
            let mut registry = self.registry.write();
            let problems = registry.apply_observation(observation);
            (problems, registry.len())
        };
        info!(
            "Reconciled registry: {} segment(s), {} discrepancy(ies)",
            segments,
            problems.len()
        );

        let save_error = match self.persist().await {
            Ok(()) => None,
            Err(e) => {
                warn!("Failed to save reconciled state: {}", e);
                Some(e.to_string())
            }
        };

        Ok(ReconcileReport {
            segments,
            problems,
            save_error,
        })
    }
}
