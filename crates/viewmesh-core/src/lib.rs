//! viewmesh Core - identity, error, and capability contracts
//!
//! Every other viewmesh crate builds on the types defined here:
//!
//! - [`Identity`] and the [`Resolver`] that maps it to endpoints and keys
//! - [`Session`] and [`SessionFactory`], the peer-to-peer channel capability
//! - [`View`] and [`ViewContext`], the unit of multi-party logic and its handle
//! - [`SigningIdentity`] / [`Verifier`], the opaque sign/verify capability
//! - [`ValidationCode`], the finality status of a tracked transaction
//! - [`ViewMeshError`], the unified error type
//!
//! Collaborators are passed explicitly to the components that need them;
//! there is no process-wide service registry.

#![forbid(unsafe_code)]

/// Signing and verification capabilities
pub mod crypto;

/// Unified error handling
pub mod errors;

/// Finality status codes
pub mod finality;

/// Identities and resolution
pub mod identity;

/// Session contracts
pub mod session;

/// View contracts
pub mod view;

pub use crypto::{
    sha256, Ed25519SigningIdentity, Ed25519Verifier, Ed25519VerifierProvider, SigningIdentity,
    Verifier, VerifierProvider,
};
pub use errors::{Result, ViewMeshError};
pub use finality::ValidationCode;
pub use identity::{Identity, PortName, Resolution, Resolver};
pub use session::{Message, MessageStatus, Session, SessionFactory, SessionInfo};
pub use view::{ErrorCallback, View, ViewContext, ViewFactory, ViewOutput};
