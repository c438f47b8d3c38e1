//! The node-local CSI image volume driver, as a library so integration
//! tests can drive the whole Publish/Unpublish state machine against an
//! in-process fake runtime instead of a real containerd/kubelet pair.

pub mod cli;
pub mod credentials;
pub mod csi;
pub mod error;
pub mod image;
pub mod logging;
pub mod mount;
pub mod proto;
pub mod reference;
pub mod snapshot;
