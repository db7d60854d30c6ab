//! Views and the handle they run against
//!
//! A [`View`] is one unit of multi-party business logic. It runs against a
//! [`ViewContext`], which hands out sessions to other parties and can run
//! nested views.

use crate::{Identity, Result, Session};
use async_trait::async_trait;
use std::sync::Arc;

/// Bytes produced by a successful view
pub type ViewOutput = Vec<u8>;

/// Callback registered through [`ViewContext::on_error`]
pub type ErrorCallback = Box<dyn FnOnce() + Send>;

/// A unit of business-protocol logic
#[async_trait]
pub trait View: Send + Sync {
    /// Run the view against `ctx`
    async fn call(&self, ctx: &dyn ViewContext) -> Result<ViewOutput>;

    /// Protocol label used when this view opens sessions
    fn identifier(&self) -> String {
        std::any::type_name::<Self>().to_string()
    }
}

/// Builds views from serialized input
pub trait ViewFactory: Send + Sync {
    /// Create a view for `input`
    fn new_view(&self, input: &[u8]) -> Result<Arc<dyn View>>;
}

/// Execution environment handed to a running view
#[async_trait]
pub trait ViewContext: Send + Sync {
    /// Identifier of the invocation chain
    fn id(&self) -> &str;

    /// Local identity
    fn me(&self) -> &Identity;

    /// Party that invoked this chain, if any
    fn caller(&self) -> Option<&Identity>;

    /// View that started the chain, if any
    fn initiator(&self) -> Option<Arc<dyn View>>;

    /// Inbound session this chain was created to serve, if any
    fn session(&self) -> Option<Arc<dyn Session>>;

    /// Session to `party`, reusing the chain's open session when there is one
    async fn get_session(&self, caller: &dyn View, party: &Identity) -> Result<Arc<dyn Session>>;

    /// Session to `party` addressed by an explicit session id
    async fn get_session_by_id(&self, session_id: &str, party: &Identity)
        -> Result<Arc<dyn Session>>;

    /// Run `view` in a nested frame of this chain
    async fn run_view(&self, view: &dyn View) -> Result<ViewOutput>;

    /// Register a callback run if the current nested frame fails
    fn on_error(&self, callback: ErrorCallback) -> Result<()>;
}
