//! Rebuilds the snapshot reference-count graph at startup from two
//! independent sources of truth: the kubelet pod-volume directory tree
//! (which live mounts exist) and the runtime's own snapshot listing
//! (which snapshots exist). Anything the runtime holds with no
//! corresponding live mount is an orphan and gets removed; anything
//! mounted whose snapshot key the runtime has forgotten is logged and
//! left for a future `Acquire` to recreate — we never guess a snapshot
//! back into existence.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::Deserialize;

use super::client::{RuntimeSnapshotClient, SnapshotListedKind};
use super::{ro_key, rw_key, GraphEntry, SnapshotManager, SnapshotMode};

/// Mirrors the fields kubelet writes into `vol_data.json` next to each
/// CSI volume's mount directory. Unknown fields are ignored.
#[derive(Debug, Deserialize)]
struct VolData {
    #[serde(rename = "driverName")]
    driver_name: String,
    #[serde(rename = "volumeHandle")]
    volume_handle: String,
    #[serde(default)]
    #[serde(rename = "readOnly")]
    read_only: bool,
    #[serde(default)]
    attributes: HashMap<String, String>,
}

struct LiveMount {
    expected_key: String,
}

/// Scans `pod_volumes_root` (kubelet's `pods/<uid>/volumes/<driver>/<name>`
/// tree) for `vol_data.json` sidecar files belonging to `driver_name`,
/// keeping only entries whose mount point is currently live per
/// `mounts_path` (normally `/proc/mounts`, overridden in tests).
async fn scan_live_mounts(
    pod_volumes_root: &Path,
    driver_name: &str,
    mounts_path: &Path,
) -> anyhow::Result<Vec<LiveMount>> {
    let mounted = read_mounted_paths(mounts_path).await?;
    let mut live = Vec::new();
    let mut stack = vec![pod_volumes_root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(_) => continue,
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                stack.push(path);
                continue;
            }
            if path.file_name().and_then(|n| n.to_str()) != Some("vol_data.json") {
                continue;
            }
            let raw = match tokio::fs::read_to_string(&path).await {
                Ok(raw) => raw,
                Err(err) => {
                    crate::log_warn!(target_path: path.display(), error = %err, "failed to read vol_data.json during reconcile");
                    continue;
                }
            };
            let data: VolData = match serde_json::from_str(&raw) {
                Ok(data) => data,
                Err(err) => {
                    crate::log_warn!(target_path: path.display(), error = %err, "malformed vol_data.json, skipping");
                    continue;
                }
            };
            if data.driver_name != driver_name {
                continue;
            }

            let mount_dir = path.parent().map(|p| p.join("mount")).unwrap_or_default();
            let mount_dir_str = mount_dir.to_string_lossy().to_string();
            if !mounted.contains(&mount_dir_str) {
                crate::log_debug!(target_path: mount_dir.display(), "vol_data.json present but mount point not live, ignoring");
                continue;
            }

            let expected_key = expected_snapshot_key(&data);
            live.push(LiveMount { expected_key });
        }
    }

    Ok(live)
}

fn expected_snapshot_key(data: &VolData) -> String {
    if data.read_only {
        let image = data.attributes.get("image").cloned().unwrap_or_default();
        ro_key(&image)
    } else {
        rw_key(&data.volume_handle)
    }
}

async fn read_mounted_paths(mounts_path: &Path) -> anyhow::Result<std::collections::HashSet<String>> {
    let contents = match tokio::fs::read_to_string(mounts_path).await {
        Ok(contents) => contents,
        Err(_) => return Ok(std::collections::HashSet::new()),
    };
    Ok(contents
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(|s| s.to_string())
        .collect())
}

/// Rebuilds and installs the manager's graph. Call once at startup,
/// before the CSI server starts accepting requests.
pub async fn run(
    manager: &SnapshotManager,
    runtime: &dyn RuntimeSnapshotClient,
    pod_volumes_root: &Path,
    driver_name: &str,
) -> anyhow::Result<()> {
    run_with_mounts_path(manager, runtime, pod_volumes_root, driver_name, Path::new("/proc/mounts")).await
}

async fn run_with_mounts_path(
    manager: &SnapshotManager,
    runtime: &dyn RuntimeSnapshotClient,
    pod_volumes_root: &Path,
    driver_name: &str,
    mounts_path: &Path,
) -> anyhow::Result<()> {
    let live_mounts = scan_live_mounts(pod_volumes_root, driver_name, mounts_path).await?;

    let mut refcounts: HashMap<String, u32> = HashMap::new();
    for mount in &live_mounts {
        *refcounts.entry(mount.expected_key.clone()).or_insert(0) += 1;
    }

    let listed = runtime.list().await?;
    let mut graph = HashMap::new();

    for snapshot in &listed {
        let count = refcounts.get(&snapshot.key).copied();
        match count {
            Some(refcount) if refcount > 0 => {
                let mode = if snapshot.key.starts_with("ro:") { SnapshotMode::Ro } else { SnapshotMode::Rw };
                graph.insert(
                    snapshot.key.clone(),
                    GraphEntry {
                        image_ref: snapshot.parent.clone(),
                        refcount,
                        mode,
                        created_at: Instant::now(),
                        root: None,
                    },
                );
            }
            _ => {
                if matches!(snapshot.kind, SnapshotListedKind::Active | SnapshotListedKind::Committed) {
                    crate::log_info!(target_path: &snapshot.key, "orphaned snapshot with no live mount, removing");
                    if let Err(err) = runtime.remove(&snapshot.key).await {
                        crate::log_warn!(target_path: &snapshot.key, error = %err, "failed to remove orphaned snapshot during reconcile");
                    }
                }
            }
        }
    }

    for key in refcounts.keys() {
        if !graph.contains_key(key) {
            crate::log_warn!(target_path: key, "live mount references a snapshot the runtime no longer has, leaving ungraphed");
        }
    }

    let found = graph.len();
    manager.install_graph(graph);
    crate::log_info!("reconcile installed {found} snapshot graph entries from {} live mounts", live_mounts.len());
    Ok(())
}

/// Default pod-volumes root kubelet uses for CSI plugins, parameterized
/// by node root so tests can point this at a tempdir.
pub fn pod_volumes_root(kubelet_root: &Path) -> PathBuf {
    kubelet_root.join("pods")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::client::{ListedSnapshot, Mount, SnapshotClientError};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct FakeRuntime {
        snapshots: Vec<ListedSnapshot>,
        remove_calls: AtomicU32,
    }

    #[async_trait]
    impl RuntimeSnapshotClient for FakeRuntime {
        async fn prepare(&self, _key: &str, _parent: &str) -> Result<Vec<Mount>, SnapshotClientError> {
            unreachable!("reconcile never prepares")
        }

        async fn remove(&self, _key: &str) -> Result<(), SnapshotClientError> {
            self.remove_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn list(&self) -> Result<Vec<ListedSnapshot>, SnapshotClientError> {
            Ok(self.snapshots.clone())
        }
    }

    async fn write_vol_data(dir: &Path, driver: &str, read_only: bool, handle: &str, image: Option<&str>) {
        tokio::fs::create_dir_all(dir).await.unwrap();
        let mut attributes = serde_json::Map::new();
        if let Some(image) = image {
            attributes.insert("image".into(), serde_json::Value::String(image.to_string()));
        }
        let payload = serde_json::json!({
            "driverName": driver,
            "volumeHandle": handle,
            "readOnly": read_only,
            "attributes": attributes,
        });
        tokio::fs::write(dir.join("vol_data.json"), serde_json::to_vec(&payload).unwrap()).await.unwrap();
        tokio::fs::create_dir_all(dir.join("mount")).await.unwrap();
    }

    /// Writes a fake `/proc/mounts`-style file marking `mount_dirs` as live.
    async fn write_fake_mounts(tmp: &Path, mount_dirs: &[PathBuf]) -> PathBuf {
        let path = tmp.join("fake_mounts");
        let mut contents = String::new();
        for dir in mount_dirs {
            contents.push_str(&format!("tmpfs {} tmpfs rw 0 0\n", dir.display()));
        }
        tokio::fs::write(&path, contents).await.unwrap();
        path
    }

    #[tokio::test]
    async fn orphaned_snapshot_with_no_live_mount_is_removed() {
        let tmp = tempfile::tempdir().unwrap();
        let runtime = FakeRuntime {
            snapshots: vec![ListedSnapshot {
                key: "ro:deadbeef".into(),
                parent: "docker.io/library/nginx:1.25".into(),
                kind: SnapshotListedKind::Committed,
            }],
            remove_calls: AtomicU32::new(0),
        };
        let manager = SnapshotManager::new(Arc::new(FakeRuntime {
            snapshots: Vec::new(),
            remove_calls: AtomicU32::new(0),
        }));
        let mounts_path = write_fake_mounts(tmp.path(), &[]).await;

        run_with_mounts_path(&manager, &runtime, tmp.path(), "image-volume-driver", &mounts_path).await.unwrap();

        assert_eq!(runtime.remove_calls.load(Ordering::SeqCst), 1);
        assert_eq!(manager.graph_len(), 0);
    }

    #[tokio::test]
    async fn live_mount_with_matching_snapshot_is_restored_into_graph() {
        let tmp = tempfile::tempdir().unwrap();
        let vol_dir = tmp.path().join("pods/uid-1/volumes/image-volume-driver/vol-a");
        write_vol_data(&vol_dir, "image-volume-driver", true, "vol-a", Some("docker.io/library/nginx:1.25")).await;

        let key = ro_key("docker.io/library/nginx:1.25");
        let runtime = FakeRuntime {
            snapshots: vec![ListedSnapshot {
                key: key.clone(),
                parent: "docker.io/library/nginx:1.25".into(),
                kind: SnapshotListedKind::Committed,
            }],
            remove_calls: AtomicU32::new(0),
        };
        let manager = SnapshotManager::new(Arc::new(FakeRuntime {
            snapshots: Vec::new(),
            remove_calls: AtomicU32::new(0),
        }));
        let mounts_path = write_fake_mounts(tmp.path(), &[vol_dir.join("mount")]).await;

        run_with_mounts_path(&manager, &runtime, tmp.path(), "image-volume-driver", &mounts_path).await.unwrap();

        assert_eq!(runtime.remove_calls.load(Ordering::SeqCst), 0);
        assert_eq!(manager.refcount(&key), Some(1));
    }

    #[tokio::test]
    async fn live_mount_with_missing_snapshot_is_left_ungraphed() {
        let tmp = tempfile::tempdir().unwrap();
        let vol_dir = tmp.path().join("pods/uid-2/volumes/image-volume-driver/vol-b");
        write_vol_data(&vol_dir, "image-volume-driver", false, "vol-b", None).await;

        let runtime = FakeRuntime { snapshots: Vec::new(), remove_calls: AtomicU32::new(0) };
        let manager = SnapshotManager::new(Arc::new(FakeRuntime {
            snapshots: Vec::new(),
            remove_calls: AtomicU32::new(0),
        }));
        let mounts_path = write_fake_mounts(tmp.path(), &[vol_dir.join("mount")]).await;

        run_with_mounts_path(&manager, &runtime, tmp.path(), "image-volume-driver", &mounts_path).await.unwrap();

        assert_eq!(manager.graph_len(), 0);
        assert_eq!(manager.contains(&rw_key("vol-b")), false);
    }

    #[tokio::test]
    async fn vol_data_for_other_driver_is_ignored() {
        let tmp = tempfile::tempdir().unwrap();
        let vol_dir = tmp.path().join("pods/uid-3/volumes/other-driver/vol-c");
        write_vol_data(&vol_dir, "other-driver", false, "vol-c", None).await;

        let runtime = FakeRuntime { snapshots: Vec::new(), remove_calls: AtomicU32::new(0) };
        let manager = SnapshotManager::new(Arc::new(FakeRuntime {
            snapshots: Vec::new(),
            remove_calls: AtomicU32::new(0),
        }));

        run(&manager, &runtime, tmp.path(), "image-volume-driver").await.unwrap();
        assert_eq!(manager.graph_len(), 0);
    }
}
