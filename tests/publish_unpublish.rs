//! Integration-style tests driving the full Publish/Unpublish state
//! machine against an in-process fake runtime, covering the literal
//! scenarios the driver is designed against.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tempfile::tempdir;

use image_volume_driver::credentials::{CredentialCandidate, CredentialResolver, ResolverConfig};
use image_volume_driver::image::client::{RuntimeClientError, RuntimeImageClient, RuntimeImageInfo};
use image_volume_driver::image::ImageAcquirer;
use image_volume_driver::mount::bind::Binder;
use image_volume_driver::mount::{MountOrchestrator, PublishRequest};
use image_volume_driver::snapshot::client::{ListedSnapshot, Mount, RuntimeSnapshotClient, SnapshotClientError};
use image_volume_driver::snapshot::SnapshotManager;

/// A runtime fake implementing both service traits, shared by every
/// scenario below; prepares never fail here since these tests exercise
/// the orchestration logic, not runtime failure classification (see
/// `mount::tests` and `image::tests` for failure-injection coverage).
struct FakeRuntime {
    snapshot_source: PathBuf,
    pull_calls: AtomicU32,
    prepare_calls: AtomicU32,
    remove_calls: AtomicU32,
}

impl FakeRuntime {
    fn new(snapshot_source: PathBuf) -> Self {
        Self {
            snapshot_source,
            pull_calls: AtomicU32::new(0),
            prepare_calls: AtomicU32::new(0),
            remove_calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl RuntimeImageClient for FakeRuntime {
    async fn pull_image(
        &self,
        _image: &str,
        _auth: Option<&CredentialCandidate>,
    ) -> Result<String, RuntimeClientError> {
        self.pull_calls.fetch_add(1, Ordering::SeqCst);
        Ok("sha256:abc".into())
    }

    async fn image_status(&self, _image: &str) -> Result<Option<RuntimeImageInfo>, RuntimeClientError> {
        Ok(None)
    }

    async fn list_images(&self) -> Result<Vec<RuntimeImageInfo>, RuntimeClientError> {
        Ok(Vec::new())
    }
}

#[async_trait]
impl RuntimeSnapshotClient for FakeRuntime {
    async fn prepare(&self, _key: &str, _parent: &str) -> Result<Vec<Mount>, SnapshotClientError> {
        self.prepare_calls.fetch_add(1, Ordering::SeqCst);
        Ok(vec![Mount {
            kind: "bind".into(),
            source: self.snapshot_source.to_string_lossy().to_string(),
            target: String::new(),
            options: vec![],
        }])
    }

    async fn remove(&self, _key: &str) -> Result<(), SnapshotClientError> {
        self.remove_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ListedSnapshot>, SnapshotClientError> {
        Ok(Vec::new())
    }
}

/// Bind mounts/unmounts are no-ops here: these tests assert the snapshot
/// graph and mount record bookkeeping, not real filesystem effects,
/// which `mount::bind::tests` already covers in isolation.
#[derive(Default)]
struct NoopBinder;

#[async_trait]
impl Binder for NoopBinder {
    async fn bind_mount(&self, _source: PathBuf, _target: PathBuf) -> anyhow::Result<()> {
        Ok(())
    }
    async fn remount_readonly(&self, _target: PathBuf) -> anyhow::Result<()> {
        Ok(())
    }
    async fn unmount(&self, _target: PathBuf) -> anyhow::Result<()> {
        Ok(())
    }
    async fn is_mount_point(&self, _target: &std::path::Path) -> anyhow::Result<bool> {
        Ok(false)
    }
}

fn image_attrs(image: &str) -> HashMap<String, String> {
    let mut attrs = HashMap::new();
    attrs.insert("image".to_string(), image.to_string());
    attrs
}

fn build(runtime: Arc<FakeRuntime>) -> MountOrchestrator {
    let credentials = Arc::new(CredentialResolver::new(ResolverConfig::default()));
    let images = Arc::new(ImageAcquirer::new(runtime.clone(), None));
    let snapshots = Arc::new(SnapshotManager::new(runtime));
    MountOrchestrator::with_binder(credentials, images, snapshots, Arc::new(NoopBinder::default()))
}

/// Scenario 1: Shared RO — two targets publishing the same RO image
/// dedupe to one pull and one snapshot, and independently unpublish.
#[tokio::test]
async fn shared_ro_scenario() {
    let source = tempdir().unwrap();
    let runtime = Arc::new(FakeRuntime::new(source.path().to_path_buf()));
    let orchestrator = build(runtime.clone());

    let target_a = tempdir().unwrap();
    let target_b = tempdir().unwrap();
    let attrs = image_attrs("docker.io/library/nginx:1.25");

    orchestrator
        .publish(PublishRequest {
            volume_id: "vol-a".into(),
            target_path: target_a.path().to_path_buf(),
            read_only: true,
            volume_attributes: attrs.clone(),
            secret_data: None,
        })
        .await
        .unwrap();
    orchestrator
        .publish(PublishRequest {
            volume_id: "vol-b".into(),
            target_path: target_b.path().to_path_buf(),
            read_only: true,
            volume_attributes: attrs,
            secret_data: None,
        })
        .await
        .unwrap();

    assert_eq!(runtime.prepare_calls.load(Ordering::SeqCst), 1);
    assert_eq!(runtime.pull_calls.load(Ordering::SeqCst), 1);

    orchestrator.unpublish(target_a.path()).await.unwrap();
    assert_eq!(runtime.remove_calls.load(Ordering::SeqCst), 0);

    orchestrator.unpublish(target_b.path()).await.unwrap();
    assert_eq!(runtime.remove_calls.load(Ordering::SeqCst), 1);
}

/// Scenario 2: RW isolation — same image, two RW targets, two distinct
/// snapshots, each referenced once.
#[tokio::test]
async fn rw_isolation_scenario() {
    let source = tempdir().unwrap();
    let runtime = Arc::new(FakeRuntime::new(source.path().to_path_buf()));
    let orchestrator = build(runtime.clone());

    let target_a = tempdir().unwrap();
    let target_b = tempdir().unwrap();
    let attrs = image_attrs("X");

    orchestrator
        .publish(PublishRequest {
            volume_id: "vol-a".into(),
            target_path: target_a.path().to_path_buf(),
            read_only: false,
            volume_attributes: attrs.clone(),
            secret_data: None,
        })
        .await
        .unwrap();
    orchestrator
        .publish(PublishRequest {
            volume_id: "vol-b".into(),
            target_path: target_b.path().to_path_buf(),
            read_only: false,
            volume_attributes: attrs,
            secret_data: None,
        })
        .await
        .unwrap();

    assert_eq!(runtime.prepare_calls.load(Ordering::SeqCst), 2);

    orchestrator.unpublish(target_a.path()).await.unwrap();
    orchestrator.unpublish(target_b.path()).await.unwrap();
    assert_eq!(runtime.remove_calls.load(Ordering::SeqCst), 2);
}

/// Scenario 6: idempotent Publish — Publish x3, Unpublish leaves no
/// mount and no snapshot.
#[tokio::test]
async fn idempotent_publish_scenario() {
    let source = tempdir().unwrap();
    let runtime = Arc::new(FakeRuntime::new(source.path().to_path_buf()));
    let orchestrator = build(runtime.clone());

    let target = tempdir().unwrap();
    let attrs = image_attrs("X");

    for _ in 0..3 {
        orchestrator
            .publish(PublishRequest {
                volume_id: "vol-a".into(),
                target_path: target.path().to_path_buf(),
                read_only: true,
                volume_attributes: attrs.clone(),
                secret_data: None,
            })
            .await
            .unwrap();
    }

    assert_eq!(runtime.prepare_calls.load(Ordering::SeqCst), 1);

    orchestrator.unpublish(target.path()).await.unwrap();
    assert_eq!(runtime.remove_calls.load(Ordering::SeqCst), 1);

    // Second unpublish is idempotent: no record left, no stale mount.
    orchestrator.unpublish(target.path()).await.unwrap();
    assert_eq!(runtime.remove_calls.load(Ordering::SeqCst), 1);
}

/// Boundary: publishing the same target with a different image fails
/// with AlreadyExists rather than silently remounting.
#[tokio::test]
async fn publish_on_existing_target_with_different_image_fails() {
    let source = tempdir().unwrap();
    let runtime = Arc::new(FakeRuntime::new(source.path().to_path_buf()));
    let orchestrator = build(runtime.clone());
    let target = tempdir().unwrap();

    orchestrator
        .publish(PublishRequest {
            volume_id: "vol-a".into(),
            target_path: target.path().to_path_buf(),
            read_only: true,
            volume_attributes: image_attrs("X"),
            secret_data: None,
        })
        .await
        .unwrap();

    let err = orchestrator
        .publish(PublishRequest {
            volume_id: "vol-a".into(),
            target_path: target.path().to_path_buf(),
            read_only: true,
            volume_attributes: image_attrs("Y"),
            secret_data: None,
        })
        .await
        .unwrap_err();

    assert_eq!(err.kind, image_volume_driver::error::DriverErrorKind::AlreadyExists);
}

/// Boundary: unpublish of a target that was never published succeeds.
#[tokio::test]
async fn unpublish_of_unknown_target_succeeds() {
    let source = tempdir().unwrap();
    let runtime = Arc::new(FakeRuntime::new(source.path().to_path_buf()));
    let orchestrator = build(runtime);
    let target = tempdir().unwrap();

    orchestrator.unpublish(target.path()).await.unwrap();
}
