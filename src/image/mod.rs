//! Image Acquirer (C2): pulls an image through the runtime, deduplicating
//! concurrent requests, trying credential candidates in order, and
//! optionally running the pull as a background session.

pub mod client;
mod session;

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::credentials::CredentialCandidate;
use client::{RuntimeClientError, RuntimeImageClient};
use session::{SessionHandle, SessionTable};

/// The failure taxonomy returned to the mount orchestrator. `Clone` so a
/// single session outcome can be replayed to every attached waiter.
#[derive(Debug, Clone, Error)]
pub enum ImageAcquireError {
    #[error("credentials exhausted: {0}")]
    CredentialsExhausted(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("runtime unavailable: {0}")]
    RuntimeUnavailable(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("transport error: {0}")]
    TransportError(String),
    #[error("unavailable: {0}")]
    Unavailable(String),
    #[error("unknown: {0}")]
    Unknown(String),
}

/// Minimum `asyncImagePullTimeout` for the async path to be enabled at
/// all; below this, `EnsurePresentAsync` falls back to `EnsurePresent`.
pub const MIN_ASYNC_PULL_TIMEOUT: Duration = Duration::from_secs(30);

pub struct ImageAcquirer {
    runtime: Arc<dyn RuntimeImageClient>,
    sessions: SessionTable,
    async_pull_timeout: Option<Duration>,
}

impl ImageAcquirer {
    pub fn new(runtime: Arc<dyn RuntimeImageClient>, async_pull_timeout: Option<Duration>) -> Self {
        let async_pull_timeout = async_pull_timeout.filter(|d| *d >= MIN_ASYNC_PULL_TIMEOUT);
        Self { runtime, sessions: SessionTable::new(session::DEFAULT_ADMISSION_CAPACITY), async_pull_timeout }
    }

    /// Blocks until the image exists in the runtime store or fails.
    pub async fn ensure_present(
        &self,
        image_ref: &str,
        candidates: &[CredentialCandidate],
        pull_always: bool,
    ) -> Result<(), ImageAcquireError> {
        let handle = self.start_session(image_ref, candidates.to_vec(), pull_always).await?;
        handle.wait().await
    }

    /// Returns immediately; the session completes in the background. If
    /// async pulling is not enabled (timeout unset or below the minimum),
    /// falls back to the synchronous path and returns an already-complete
    /// handle.
    pub async fn ensure_present_async(
        &self,
        image_ref: &str,
        candidates: &[CredentialCandidate],
        pull_always: bool,
    ) -> Result<SessionHandle, ImageAcquireError> {
        self.start_session(image_ref, candidates.to_vec(), pull_always).await
    }

    pub fn async_pull_timeout(&self) -> Option<Duration> {
        self.async_pull_timeout
    }

    async fn start_session(
        &self,
        image_ref: &str,
        candidates: Vec<CredentialCandidate>,
        pull_always: bool,
    ) -> Result<SessionHandle, ImageAcquireError> {
        let runtime = self.runtime.clone();
        let image_ref_owned = image_ref.to_string();
        self.sessions
            .get_or_start(image_ref, move || {
                run_pull(runtime, image_ref_owned, candidates, pull_always)
            })
            .await
    }
}

async fn run_pull(
    runtime: Arc<dyn RuntimeImageClient>,
    image_ref: String,
    candidates: Vec<CredentialCandidate>,
    pull_always: bool,
) -> Result<(), ImageAcquireError> {
    if !pull_always {
        match runtime.image_status(&image_ref).await {
            Ok(Some(_)) => {
                crate::log_debug!(image: &image_ref, "image already present, skipping pull");
                return Ok(());
            }
            Ok(None) => {}
            Err(err) => {
                crate::log_warn!(image: &image_ref, error = %err, "image status probe failed, attempting pull anyway");
            }
        }
    }

    let mut errors: Vec<RuntimeClientError> = Vec::new();

    for candidate in &candidates {
        match runtime.pull_image(&image_ref, Some(candidate)).await {
            Ok(_) => {
                report_size(&runtime, &image_ref).await;
                return Ok(());
            }
            Err(err) => {
                crate::log_warn!(image: &image_ref, registry = %candidate.server_address, error = %err, "pull attempt failed, trying next candidate");
                errors.push(err);
            }
        }
    }

    // Candidates empty, or all exhausted: one final anonymous attempt.
    match runtime.pull_image(&image_ref, None).await {
        Ok(_) => {
            report_size(&runtime, &image_ref).await;
            Ok(())
        }
        Err(err) => {
            errors.push(err);
            Err(classify(errors))
        }
    }
}

async fn report_size(runtime: &Arc<dyn RuntimeImageClient>, image_ref: &str) {
    match runtime.image_status(image_ref).await {
        Ok(Some(info)) => {
            crate::log_info!(image: image_ref, size_bytes = info.size_bytes, "image size probed after pull");
        }
        Ok(None) => {
            crate::log_warn!(image: image_ref, "image status probe found no image immediately after successful pull");
        }
        Err(err) => {
            crate::log_warn!(image: image_ref, error = %err, "image size probe failed after pull");
        }
    }
}

/// Aggregates the per-candidate errors into a single taxonomy kind. Any
/// authentication failure anywhere in the walk means credentials were the
/// problem; otherwise the first transport-level signal wins.
fn classify(errors: Vec<RuntimeClientError>) -> ImageAcquireError {
    let message = errors.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; ");

    if errors.iter().any(|e| matches!(e, RuntimeClientError::Unauthenticated(_))) {
        return ImageAcquireError::CredentialsExhausted(message);
    }
    if errors.iter().any(|e| matches!(e, RuntimeClientError::DeadlineExceeded)) {
        return ImageAcquireError::Timeout(message);
    }
    if errors.iter().any(|e| matches!(e, RuntimeClientError::Unavailable(_))) {
        return ImageAcquireError::RuntimeUnavailable(message);
    }
    if errors.iter().any(|e| matches!(e, RuntimeClientError::NotFound)) {
        return ImageAcquireError::NotFound(message);
    }
    if errors.iter().any(|e| matches!(e, RuntimeClientError::Transport(_))) {
        return ImageAcquireError::TransportError(message);
    }
    ImageAcquireError::Unknown(message)
}
