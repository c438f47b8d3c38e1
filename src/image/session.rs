//! The single-flight + background-pull session table: a shared map
//! `imageRef -> session`, where each session owns a completion signal and
//! a result slot. `EnsurePresent` is `getOrCreate(ref) then wait`;
//! `EnsurePresentAsync` is `getOrCreate(ref) then return handle`. The
//! bounded admission semaphore is the queue into the worker pool.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex, Semaphore};

use super::ImageAcquireError;

/// How long a completed session's outcome is retained so that late
/// waiters (attached just before completion) still observe it.
const COMPLETION_GRACE_PERIOD: Duration = Duration::from_secs(60);

pub const DEFAULT_ADMISSION_CAPACITY: usize = 100;

pub type SessionOutcome = Result<(), ImageAcquireError>;

struct Session {
    outcome: watch::Sender<Option<SessionOutcome>>,
}

/// A handle a caller can wait on with its own timeout, independent of the
/// session's own lifetime.
pub struct SessionHandle {
    receiver: watch::Receiver<Option<SessionOutcome>>,
}

impl SessionHandle {
    pub async fn wait(mut self) -> SessionOutcome {
        loop {
            if let Some(outcome) = self.receiver.borrow().clone() {
                return outcome;
            }
            if self.receiver.changed().await.is_err() {
                return Err(ImageAcquireError::Unknown("session dropped without completing".into()));
            }
        }
    }

    /// Non-blocking check used by the synchronous `EnsurePresent` path to
    /// notice the async fallback case: already complete.
    pub fn is_complete(&self) -> bool {
        self.receiver.borrow().is_some()
    }
}

pub struct SessionTable {
    sessions: Arc<Mutex<HashMap<String, Arc<Session>>>>,
    admission: Arc<Semaphore>,
}

impl SessionTable {
    pub fn new(admission_capacity: usize) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            admission: Arc::new(Semaphore::new(admission_capacity)),
        }
    }

    /// Attaches to the in-flight session for `image_ref`, or admits a new
    /// one. When a new session is admitted, `worker` is spawned to
    /// produce the eventual outcome; if the admission queue is full and
    /// no session is already in flight, fails fast with `Unavailable`.
    pub async fn get_or_start<F, Fut>(
        &self,
        image_ref: &str,
        worker: F,
    ) -> Result<SessionHandle, ImageAcquireError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = SessionOutcome> + Send + 'static,
    {
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get(image_ref) {
            return Ok(SessionHandle { receiver: session.outcome.subscribe() });
        }

        let permit = self.admission.clone().try_acquire_owned().map_err(|_| {
            ImageAcquireError::Unavailable("image pull session admission queue is full".into())
        })?;

        let (tx, rx) = watch::channel(None);
        let session = Arc::new(Session { outcome: tx });
        sessions.insert(image_ref.to_string(), session.clone());
        drop(sessions);

        let image_ref = image_ref.to_string();
        let table_sessions = self.sessions.clone();
        tokio::spawn(async move {
            let outcome = worker().await;
            let _ = session.outcome.send(Some(outcome));
            drop(permit);
            tokio::time::sleep(COMPLETION_GRACE_PERIOD).await;
            let mut sessions = table_sessions.lock().await;
            if let Some(current) = sessions.get(&image_ref) {
                if Arc::ptr_eq(current, &session) {
                    sessions.remove(&image_ref);
                }
            }
        });

        Ok(SessionHandle { receiver: rx })
    }
}
