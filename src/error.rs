//! Error handling for the image volume driver.
//!
//! Every external RPC is initiated by the kubelet calling the CSI Node
//! service, so failures surface in exactly two places: a gRPC status
//! returned to the kubelet, and the driver's own logs. Internal component
//! logic (C1-C3) propagates `anyhow::Error` with context attached at each
//! hop; the mount orchestrator (C4) is the only place an error is given a
//! [`DriverErrorKind`] and translated into a [`tonic::Status`].

use tonic::{Code, Status};

/// The internal error taxonomy shared by every component, per the driver's
/// error handling design: every failure that crosses a component boundary
/// is classified into exactly one of these kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverErrorKind {
    InvalidArgument,
    NotFound,
    Unavailable,
    DeadlineExceeded,
    Internal,
    Aborted,
    AlreadyExists,
}

impl DriverErrorKind {
    /// Maps the internal taxonomy onto the RPC surface's error codes
    /// one-to-one.
    pub fn to_code(self) -> Code {
        match self {
            DriverErrorKind::InvalidArgument => Code::InvalidArgument,
            DriverErrorKind::NotFound => Code::NotFound,
            DriverErrorKind::Unavailable => Code::Unavailable,
            DriverErrorKind::DeadlineExceeded => Code::DeadlineExceeded,
            DriverErrorKind::Internal => Code::Internal,
            DriverErrorKind::Aborted => Code::Aborted,
            DriverErrorKind::AlreadyExists => Code::AlreadyExists,
        }
    }
}

/// An error with a classification attached, produced at a component
/// boundary once a kind decision has to be made.
#[derive(thiserror::Error, Debug)]
#[error("{kind:?}: {source:#}")]
pub struct DriverError {
    pub kind: DriverErrorKind,
    #[source]
    pub source: anyhow::Error,
}

impl DriverError {
    pub fn new(kind: DriverErrorKind, source: impl Into<anyhow::Error>) -> Self {
        Self { kind, source: source.into() }
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::new(DriverErrorKind::InvalidArgument, anyhow::anyhow!(msg.into()))
    }

    pub fn already_exists(msg: impl Into<String>) -> Self {
        Self::new(DriverErrorKind::AlreadyExists, anyhow::anyhow!(msg.into()))
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(DriverErrorKind::NotFound, anyhow::anyhow!(msg.into()))
    }

    pub fn internal(source: impl Into<anyhow::Error>) -> Self {
        Self::new(DriverErrorKind::Internal, source)
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::new(DriverErrorKind::Unavailable, anyhow::anyhow!(msg.into()))
    }

    pub fn deadline_exceeded(msg: impl Into<String>) -> Self {
        Self::new(DriverErrorKind::DeadlineExceeded, anyhow::anyhow!(msg.into()))
    }
}

/// Translates a component-boundary error into the RPC-facing status, and
/// logs it exactly once at the point the disposition is decided. `target`
/// is a short, static string unique to the call site, matching the
/// logged-and-returned message correlation the driver relies on for
/// debugging from kubelet-side logs alone.
pub fn to_status(err: DriverError, target: &'static str) -> Status {
    tracing::error!(target: target, error = %err.source, kind = ?err.kind, "request failed");
    Status::new(err.kind.to_code(), format!("{target}: {}", err.source))
}

pub type Result<T> = std::result::Result<T, DriverError>;
