//! Status Block: the owning server's lifecycle state and the cross-process
//! shutdown request, published in a segment named from the configuration
//! digest.

mod block;
mod lifecycle;

pub use block::{StatusBlock, StatusProbe, StatusSnapshot};
pub use lifecycle::{LifecycleState, ShutdownRequest};
