//! viewmesh View - execution contexts and the session multiplexer
//!
//! - [`Context`] runs views, caches one session per resolved party, and turns
//!   view faults into [`viewmesh_core::ViewMeshError::ExecutionAborted`]
//! - [`ViewManager`] owns view factories and responders for one local party
//! - [`MemoryNetwork`] connects parties living in the same process

#![forbid(unsafe_code)]

/// Per-invocation contexts
pub mod context;

/// View registry and lifecycle
pub mod manager;

/// In-process sessions
pub mod memory;

pub use context::{Context, ContextDeps};
pub use manager::{ViewManager, ViewStatus};
pub use memory::{MemoryNetwork, MemoryNode, MemorySession, SessionAcceptor};
