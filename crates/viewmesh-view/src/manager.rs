//! View manager: factories, responders, and live contexts of one party

use crate::context::{Context, ContextDeps};
use crate::memory::SessionAcceptor;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, warn};
use viewmesh_core::{
    Identity, Result, Session, View, ViewFactory, ViewMeshError, ViewOutput,
};

/// Outcome of a view started with [`ViewManager::initiate_view_async`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewStatus {
    /// Still running
    Running,
    /// Finished with output
    Succeeded(ViewOutput),
    /// Finished with an error message
    Failed(String),
}

struct ManagerInner {
    me: Identity,
    deps: ContextDeps,
    factories: RwLock<HashMap<String, Arc<dyn ViewFactory>>>,
    responders: RwLock<HashMap<String, Arc<dyn View>>>,
    contexts: RwLock<HashMap<String, Arc<Context>>>,
    tracked: RwLock<HashMap<String, ViewStatus>>,
}

/// Runs views on behalf of one local identity
#[derive(Clone)]
pub struct ViewManager {
    inner: Arc<ManagerInner>,
}

impl ViewManager {
    /// Create a manager for `me`
    pub fn new(me: Identity, deps: ContextDeps) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                me,
                deps,
                factories: RwLock::new(HashMap::new()),
                responders: RwLock::new(HashMap::new()),
                contexts: RwLock::new(HashMap::new()),
                tracked: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Local identity
    pub fn me(&self) -> &Identity {
        &self.inner.me
    }

    /// Register the factory building views named `fid`
    pub fn register_factory(&self, fid: impl Into<String>, factory: Arc<dyn ViewFactory>) -> Result<()> {
        let fid = fid.into();
        let mut factories = self.inner.factories.write();
        if factories.contains_key(&fid) {
            return Err(ViewMeshError::invalid(format!(
                "factory [{fid}] is already registered"
            )));
        }
        factories.insert(fid, factory);
        Ok(())
    }

    /// Build the view named `fid` from `input`
    pub fn new_view(&self, fid: &str, input: &[u8]) -> Result<Arc<dyn View>> {
        let factory = self
            .inner
            .factories
            .read()
            .get(fid)
            .cloned()
            .ok_or_else(|| ViewMeshError::not_found(format!("no factory found for [{fid}]")))?;
        factory
            .new_view(input)
            .map_err(|e| e.context(format!("create view [{fid}]")))
    }

    /// Serve sessions opened by views whose identifier is `initiated_by` with `responder`
    pub fn register_responder(&self, responder: Arc<dyn View>, initiated_by: impl Into<String>) {
        self.inner
            .responders
            .write()
            .insert(initiated_by.into(), responder);
    }

    /// Live context with the given id
    pub fn context(&self, id: &str) -> Result<Arc<Context>> {
        self.inner
            .contexts
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| ViewMeshError::not_found(format!("context [{id}] not found")))
    }

    /// Run `view` as the root of a new invocation chain and wait for its output
    pub async fn initiate_view(&self, view: Arc<dyn View>) -> Result<ViewOutput> {
        let ctx = Arc::new(Context::for_initiator(
            self.inner.me.clone(),
            view.clone(),
            self.inner.deps.clone(),
        ));
        self.run_tracked(ctx, view).await
    }

    /// Start `view` in the background and return the id of its context
    pub fn initiate_view_async(&self, view: Arc<dyn View>) -> String {
        let ctx = Arc::new(Context::for_initiator(
            self.inner.me.clone(),
            view.clone(),
            self.inner.deps.clone(),
        ));
        let cid = viewmesh_core::ViewContext::id(ctx.as_ref()).to_string();
        self.inner
            .tracked
            .write()
            .insert(cid.clone(), ViewStatus::Running);

        let manager = self.clone();
        let tracked_id = cid.clone();
        tokio::spawn(async move {
            let status = match manager.run_tracked(ctx, view).await {
                Ok(output) => ViewStatus::Succeeded(output),
                Err(err) => ViewStatus::Failed(err.to_string()),
            };
            manager.inner.tracked.write().insert(tracked_id, status);
        });
        cid
    }

    /// Status of a view started with [`ViewManager::initiate_view_async`]
    ///
    /// A final status is returned once; the entry is dropped by that read.
    pub fn track(&self, cid: &str) -> Result<ViewStatus> {
        let mut tracked = self.inner.tracked.write();
        if matches!(tracked.get(cid), Some(ViewStatus::Running)) {
            return Ok(ViewStatus::Running);
        }
        tracked
            .remove(cid)
            .ok_or_else(|| ViewMeshError::not_found(format!("no view tracked under [{cid}]")))
    }

    /// Build the view named `fid` and run it to completion
    pub async fn call_view(&self, fid: &str, input: &[u8]) -> Result<ViewOutput> {
        let view = self.new_view(fid, input)?;
        self.initiate_view(view).await
    }

    async fn run_tracked(&self, ctx: Arc<Context>, view: Arc<dyn View>) -> Result<ViewOutput> {
        let id = viewmesh_core::ViewContext::id(ctx.as_ref()).to_string();
        self.inner.contexts.write().insert(id.clone(), ctx.clone());
        let result = ctx.run_view(view.as_ref()).await;
        self.inner.contexts.write().remove(&id);
        result
    }
}

impl SessionAcceptor for ViewManager {
    fn accept(&self, protocol: &str, context_id: &str, session: Arc<dyn Session>, caller: Identity) {
        let responder = self.inner.responders.read().get(protocol).cloned();
        let Some(responder) = responder else {
            warn!(protocol = %protocol, caller = %caller, "no responder registered");
            let message = format!("no responder registered for [{protocol}]");
            tokio::spawn(async move {
                if let Err(err) = session.send_error(message.into_bytes()).await {
                    debug!(error = %err, "failed reporting missing responder");
                }
                session.close();
            });
            return;
        };

        let ctx = Arc::new(Context::for_responder(
            context_id,
            self.inner.me.clone(),
            session.clone(),
            caller,
            self.inner.deps.clone(),
        ));
        let manager = self.clone();
        tokio::spawn(async move {
            if let Err(err) = manager.run_tracked(ctx, responder).await {
                error!(error = %err, session_id = %session.info().id, "responder failed");
                if let Err(send_err) = session.send_error(err.to_string().into_bytes()).await {
                    debug!(error = %send_err, "failed reporting responder error");
                }
            }
        });
    }
}
