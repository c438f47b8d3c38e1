//! Low-level bind-mount syscalls. Every call here is blocking and must run
//! on `spawn_blocking`, never directly on an async worker.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use nix::mount::{mount, umount2, MntFlags, MsFlags};

/// The mount-syscall boundary as a trait, so tests substitute an
/// in-process fake instead of requiring `CAP_SYS_ADMIN` in the test
/// environment — the same seam `RuntimeImageClient`/`RuntimeSnapshotClient`
/// use for their respective boundaries.
#[async_trait]
pub trait Binder: Send + Sync {
    async fn bind_mount(&self, source: PathBuf, target: PathBuf) -> Result<()>;
    async fn remount_readonly(&self, target: PathBuf) -> Result<()>;
    async fn unmount(&self, target: PathBuf) -> Result<()>;
    async fn is_mount_point(&self, target: &Path) -> Result<bool>;
}

pub struct SyscallBinder;

#[async_trait]
impl Binder for SyscallBinder {
    async fn bind_mount(&self, source: PathBuf, target: PathBuf) -> Result<()> {
        bind_mount(source, target).await
    }

    async fn remount_readonly(&self, target: PathBuf) -> Result<()> {
        remount_readonly(target).await
    }

    async fn unmount(&self, target: PathBuf) -> Result<()> {
        unmount(target).await
    }

    async fn is_mount_point(&self, target: &Path) -> Result<bool> {
        is_mount_point(target).await
    }
}

/// Bind-mounts `source` at `target`. `target` must already exist as a
/// directory; CSI guarantees the kubelet created it.
pub async fn bind_mount(source: PathBuf, target: PathBuf) -> Result<()> {
    tokio::task::spawn_blocking(move || {
        mount(Some(source.as_path()), target.as_path(), None::<&str>, MsFlags::MS_BIND, None::<&str>)
            .with_context(|| format!("bind mount {} -> {}", source.display(), target.display()))
    })
    .await
    .context("bind mount task panicked")?
}

/// Remounts an existing bind mount read-only. Must follow `bind_mount`
/// directly; the kernel does not honor `MS_RDONLY` on the initial bind.
pub async fn remount_readonly(target: PathBuf) -> Result<()> {
    tokio::task::spawn_blocking(move || {
        let flags = MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY;
        mount(None::<&str>, target.as_path(), None::<&str>, flags, None::<&str>)
            .with_context(|| format!("remount read-only {}", target.display()))
    })
    .await
    .context("remount task panicked")?
}

/// Unmounts `target`. Treats "not currently a mount point" as success,
/// matching the idempotent-unpublish requirement.
pub async fn unmount(target: PathBuf) -> Result<()> {
    tokio::task::spawn_blocking(move || match umount2(target.as_path(), MntFlags::empty()) {
        Ok(()) => Ok(()),
        Err(nix::errno::Errno::EINVAL) | Err(nix::errno::Errno::ENOENT) => Ok(()),
        Err(err) => Err(err).with_context(|| format!("unmount {}", target.display())),
    })
    .await
    .context("unmount task panicked")?
}

/// Checks `/proc/mounts` for a live mount at `target`. Used to detect a
/// stale bind left behind after a crash, when no in-memory record exists.
pub async fn is_mount_point(target: &Path) -> Result<bool> {
    let target = target.to_string_lossy().to_string();
    let contents = tokio::fs::read_to_string("/proc/mounts").await.context("reading /proc/mounts")?;
    Ok(contents.lines().filter_map(|line| line.split_whitespace().nth(1)).any(|mounted| mounted == target))
}
