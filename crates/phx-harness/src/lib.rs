//! Ambient process-lifecycle primitives shared by every Phoenix service:
//! cooperative shutdown and graceful drain.
//!
//! Nothing here is control-plane specific — it is the same broadcast +
//! watch-channel coordinator used throughout this codebase's service
//! lineage, reused unchanged.

pub mod shutdown;

pub use shutdown::{DrainResult, ShutdownGuard, ShutdownSignal};
