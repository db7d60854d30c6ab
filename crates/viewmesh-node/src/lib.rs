//! viewmesh Node - a view manager and a transaction index behind one endpoint
//!
//! [`NodeCommandHandler`] answers `CallView`, `InitiateView` and `TrackView`
//! from a [`viewmesh_view::ViewManager`], and `IsTxFinal` / `IsHashFinal`
//! from a [`viewmesh_store::TxIdStore`]. [`NodeBuilder`] assembles both
//! behind a validating [`viewmesh_rpc::ViewServer`].

#![forbid(unsafe_code)]

/// Node settings
pub mod config;

/// Command handler
pub mod handler;

/// Node assembly
pub mod node;

pub use config::NodeConfig;
pub use handler::{NodeCommandHandler, TrackedView};
pub use node::{Node, NodeBuilder};
