//! The CSI RPC surface: a thin translation layer between tonic's generated
//! service traits and the driver's internal components. No component logic
//! lives here — every handler validates request shape, delegates, and maps
//! the result through [`crate::error::to_status`].

pub mod identity;
pub mod node;

pub use identity::IdentityService;
pub use node::NodeService;
