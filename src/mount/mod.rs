//! Mount Orchestrator (C4): the Publish/Unpublish state machine. Ties
//! together the credential resolver, image acquirer, and snapshot manager
//! and performs the actual bind mount.

pub mod bind;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;

use bind::Binder;
use crate::credentials::CredentialResolver;
use crate::error::{DriverError, Result};
use crate::image::{ImageAcquireError, ImageAcquirer};
use crate::reference::ImageReference;
use crate::snapshot::{SnapshotError, SnapshotManager};

#[derive(Debug, Clone)]
pub struct PublishRequest {
    pub volume_id: String,
    pub target_path: PathBuf,
    pub read_only: bool,
    pub volume_attributes: HashMap<String, String>,
    pub secret_data: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone)]
struct MountRecord {
    volume_id: String,
    image_ref: String,
    read_only: bool,
    snapshot_key: String,
}

struct Inner {
    records: StdMutex<HashMap<PathBuf, MountRecord>>,
    target_locks: StdMutex<HashMap<PathBuf, Arc<AsyncMutex<()>>>>,
}

pub struct MountOrchestrator {
    credentials: Arc<CredentialResolver>,
    images: Arc<ImageAcquirer>,
    snapshots: Arc<SnapshotManager>,
    binder: Arc<dyn Binder>,
    inner: Arc<Inner>,
}

impl MountOrchestrator {
    pub fn new(
        credentials: Arc<CredentialResolver>,
        images: Arc<ImageAcquirer>,
        snapshots: Arc<SnapshotManager>,
    ) -> Self {
        Self::with_binder(credentials, images, snapshots, Arc::new(bind::SyscallBinder))
    }

    pub fn with_binder(
        credentials: Arc<CredentialResolver>,
        images: Arc<ImageAcquirer>,
        snapshots: Arc<SnapshotManager>,
        binder: Arc<dyn Binder>,
    ) -> Self {
        Self {
            credentials,
            images,
            snapshots,
            binder,
            inner: Arc::new(Inner {
                records: StdMutex::new(HashMap::new()),
                target_locks: StdMutex::new(HashMap::new()),
            }),
        }
    }

    fn target_lock(&self, target: &Path) -> Arc<AsyncMutex<()>> {
        let mut locks = self.inner.target_locks.lock().unwrap();
        locks.entry(target.to_path_buf()).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
    }

    pub async fn publish(&self, req: PublishRequest) -> Result<()> {
        let lock = self.target_lock(&req.target_path);
        let _guard = lock.lock().await;

        if let Some(existing) = self.inner.records.lock().unwrap().get(&req.target_path).cloned() {
            let requested_image = req.volume_attributes.get("image").cloned().unwrap_or_default();
            if existing.volume_id == req.volume_id
                && existing.image_ref == requested_image
                && existing.read_only == req.read_only
            {
                crate::log_info!(target_path: req.target_path.display(), "publish is idempotent, target already mounted");
                return Ok(());
            }
            return Err(DriverError::already_exists(format!(
                "target path {} already published for a different volume/image/mode",
                req.target_path.display()
            )));
        }

        let raw_image = req
            .volume_attributes
            .get("image")
            .ok_or_else(|| DriverError::invalid_argument("volumeAttributes.image is required"))?;
        let image_ref = ImageReference::parse(raw_image)
            .map_err(|err| DriverError::invalid_argument(format!("invalid image reference: {err}")))?;

        let pull_always = req
            .volume_attributes
            .get("pullAlways")
            .map(|v| v == "true")
            .unwrap_or(false);

        let candidates = self.credentials.resolve(&image_ref, req.secret_data.as_ref()).await;

        self.acquire_image(&image_ref, &candidates, pull_always).await?;

        let snapshot = if req.read_only {
            self.snapshots.acquire_ro(image_ref.as_str()).await
        } else {
            self.snapshots.acquire_rw(&req.volume_id, image_ref.as_str()).await
        }
        .map_err(snapshot_error_to_driver_error)?;

        if let Err(err) = self.bind_and_maybe_remount(&snapshot.root, &req.target_path, req.read_only).await {
            self.snapshots.release(&snapshot.key).await;
            return Err(err);
        }

        self.inner.records.lock().unwrap().insert(
            req.target_path.clone(),
            MountRecord {
                volume_id: req.volume_id,
                image_ref: image_ref.as_str().to_string(),
                read_only: req.read_only,
                snapshot_key: snapshot.key,
            },
        );

        Ok(())
    }

    pub async fn unpublish(&self, target_path: &Path) -> Result<()> {
        let lock = self.target_lock(target_path);
        let _guard = lock.lock().await;

        let record = self.inner.records.lock().unwrap().remove(target_path);

        let Some(record) = record else {
            if self.binder.is_mount_point(target_path).await.map_err(DriverError::internal)? {
                crate::log_warn!(target_path: target_path.display(), "unpublish found a stale bind with no mount record, unmounting");
                self.binder.unmount(target_path.to_path_buf()).await.map_err(DriverError::internal)?;
            }
            return Ok(());
        };

        self.binder.unmount(target_path.to_path_buf()).await.map_err(DriverError::internal)?;
        self.snapshots.release(&record.snapshot_key).await;
        Ok(())
    }

    async fn acquire_image(
        &self,
        image_ref: &ImageReference,
        candidates: &[crate::credentials::CredentialCandidate],
        pull_always: bool,
    ) -> Result<()> {
        let pull = self.images.ensure_present(image_ref.as_str(), candidates, pull_always);
        let outcome = match self.images.async_pull_timeout() {
            Some(timeout) => match tokio::time::timeout(timeout, pull).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    return Err(DriverError::deadline_exceeded(format!(
                        "image pull for {image_ref} did not complete within {}",
                        humantime::format_duration(timeout)
                    )))
                }
            },
            None => pull.await,
        };
        outcome.map_err(|err| image_acquire_error_to_driver_error(image_ref, err))
    }

    async fn bind_and_maybe_remount(&self, source: &Path, target: &Path, read_only: bool) -> Result<()> {
        self.binder.bind_mount(source.to_path_buf(), target.to_path_buf()).await.map_err(DriverError::internal)?;
        if read_only {
            self.binder.remount_readonly(target.to_path_buf()).await.map_err(DriverError::internal)?;
        }
        Ok(())
    }
}

fn image_acquire_error_to_driver_error(image_ref: &ImageReference, err: ImageAcquireError) -> DriverError {
    use crate::error::DriverErrorKind;
    let kind = match &err {
        ImageAcquireError::CredentialsExhausted(_) => DriverErrorKind::Unavailable,
        ImageAcquireError::Timeout(_) => DriverErrorKind::DeadlineExceeded,
        ImageAcquireError::RuntimeUnavailable(_) => DriverErrorKind::Unavailable,
        ImageAcquireError::NotFound(_) => DriverErrorKind::NotFound,
        ImageAcquireError::TransportError(_) => DriverErrorKind::Unavailable,
        ImageAcquireError::Unavailable(_) => DriverErrorKind::Unavailable,
        ImageAcquireError::Unknown(_) => DriverErrorKind::Internal,
    };
    DriverError::new(kind, anyhow::anyhow!("failed to acquire image {image_ref}: {err}"))
}

fn snapshot_error_to_driver_error(err: SnapshotError) -> DriverError {
    DriverError::internal(err)
}

/// How long reconcile is allowed to run at startup before the driver gives
/// up and starts serving anyway; a wedged runtime should not block the
/// whole node plugin from coming up.
pub const RECONCILE_TIMEOUT: Duration = Duration::from_secs(30);
