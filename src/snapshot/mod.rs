//! Snapshot Manager (C3): prepares/commits runtime snapshots and
//! maintains the reference-count graph tying mount targets to snapshot
//! keys. The only component that persists no durable state of its own —
//! `reconcile` rebuilds the graph from the runtime and the kubelet's
//! pod-volume directory tree at startup.

pub mod client;
pub mod reconcile;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;

use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;

use client::RuntimeSnapshotClient;

/// The snapshot key plus the path C4 bind-mounts from.
#[derive(Debug, Clone)]
pub struct AcquiredSnapshot {
    pub key: String,
    pub root: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotMode {
    Ro,
    Rw,
}

#[derive(Debug, Clone)]
pub struct GraphEntry {
    pub image_ref: String,
    pub refcount: u32,
    pub mode: SnapshotMode,
    pub created_at: Instant,
    /// The bind-mount source, if known. Absent for entries restored by
    /// reconcile, where the mount is already live and no fresh bind is
    /// ever performed against this entry.
    pub root: Option<PathBuf>,
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("preparing snapshot: {0}")]
    PrepareFailed(#[from] client::SnapshotClientError),
}

/// Derives the shared read-only snapshot key for an image reference.
pub fn ro_key(image_ref: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(image_ref.as_bytes());
    format!("ro:{:x}", hasher.finalize())
}

/// Derives the read-write snapshot key for a volume id.
pub fn rw_key(volume_id: &str) -> String {
    format!("rw:{volume_id}")
}

/// Picks the bind-mount source from a runtime `Prepare` response: the
/// first mount entry's source. The runtime's contract guarantees at least
/// one mount describing the snapshot root.
fn mount_root(mounts: &[client::Mount]) -> PathBuf {
    mounts.first().map(|m| PathBuf::from(&m.source)).unwrap_or_default()
}

struct Inner {
    graph: StdMutex<HashMap<String, GraphEntry>>,
    key_locks: StdMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

pub struct SnapshotManager {
    runtime: Arc<dyn RuntimeSnapshotClient>,
    inner: Arc<Inner>,
}

impl SnapshotManager {
    pub fn new(runtime: Arc<dyn RuntimeSnapshotClient>) -> Self {
        Self {
            runtime,
            inner: Arc::new(Inner {
                graph: StdMutex::new(HashMap::new()),
                key_locks: StdMutex::new(HashMap::new()),
            }),
        }
    }

    fn key_lock(&self, key: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.inner.key_locks.lock().unwrap();
        locks.entry(key.to_string()).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
    }

    /// Idempotent: bumps refcount for the shared key if already present,
    /// else prepares a new one. If an existing entry has no known root
    /// (restored by reconcile, never freshly prepared), re-prepares to
    /// recover one rather than handing back a usable-looking path that
    /// doesn't exist.
    pub async fn acquire_ro(&self, image_ref: &str) -> Result<AcquiredSnapshot, SnapshotError> {
        let key = ro_key(image_ref);
        let lock = self.key_lock(&key);
        let _guard = lock.lock().await;

        {
            let mut graph = self.inner.graph.lock().unwrap();
            if let Some(entry) = graph.get_mut(&key) {
                if let Some(root) = &entry.root {
                    entry.refcount += 1;
                    return Ok(AcquiredSnapshot { key, root: root.clone() });
                }
            }
        }

        let mounts = self.runtime.prepare(&key, image_ref).await?;
        let root = mount_root(&mounts);

        let mut graph = self.inner.graph.lock().unwrap();
        let refcount = graph.get(&key).map(|e| e.refcount + 1).unwrap_or(1);
        graph.insert(
            key.clone(),
            GraphEntry {
                image_ref: image_ref.to_string(),
                refcount,
                mode: SnapshotMode::Ro,
                created_at: Instant::now(),
                root: Some(root.clone()),
            },
        );
        Ok(AcquiredSnapshot { key, root })
    }

    /// Always prepares a fresh snapshot keyed by `volume_id`.
    pub async fn acquire_rw(&self, volume_id: &str, image_ref: &str) -> Result<AcquiredSnapshot, SnapshotError> {
        let key = rw_key(volume_id);
        let lock = self.key_lock(&key);
        let _guard = lock.lock().await;

        let mounts = self.runtime.prepare(&key, image_ref).await?;
        let root = mount_root(&mounts);

        let mut graph = self.inner.graph.lock().unwrap();
        graph.insert(
            key.clone(),
            GraphEntry {
                image_ref: image_ref.to_string(),
                refcount: 1,
                mode: SnapshotMode::Rw,
                created_at: Instant::now(),
                root: Some(root.clone()),
            },
        );
        Ok(AcquiredSnapshot { key, root })
    }

    /// Decrements refcount; when it reaches zero, removes the snapshot
    /// from the runtime. Release failures are logged but the graph entry
    /// is still dropped — the next reconcile removes any residue.
    pub async fn release(&self, key: &str) {
        let lock = self.key_lock(key);
        let _guard = lock.lock().await;

        let should_remove = {
            let mut graph = self.inner.graph.lock().unwrap();
            match graph.get_mut(key) {
                Some(entry) => {
                    entry.refcount = entry.refcount.saturating_sub(1);
                    entry.refcount == 0
                }
                None => {
                    crate::log_warn!(target_path: key, "release of unknown snapshot key, ignoring");
                    return;
                }
            }
        };

        if should_remove {
            if let Err(err) = self.runtime.remove(key).await {
                crate::log_warn!(target_path: key, error = %err, "snapshot remove failed, relying on next reconcile");
            }
            let mut graph = self.inner.graph.lock().unwrap();
            graph.remove(key);
        }
    }

    pub fn refcount(&self, key: &str) -> Option<u32> {
        self.inner.graph.lock().unwrap().get(key).map(|e| e.refcount)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.graph.lock().unwrap().contains_key(key)
    }

    pub fn graph_len(&self) -> usize {
        self.inner.graph.lock().unwrap().len()
    }

    /// Installs a graph built by `reconcile::run` at startup. Used only
    /// once, before any RPC handler has started.
    pub(crate) fn install_graph(&self, entries: HashMap<String, GraphEntry>) {
        let mut graph = self.inner.graph.lock().unwrap();
        *graph = entries;
    }
}
