//! Execution context and session multiplexer
//!
//! One [`Context`] exists per invocation chain. It owns a session cache that
//! is mutated only under its own lock, so at most one session is ever built
//! per resolved remote party, even when several views in the chain race for
//! it. Each [`Context::run_view`] call runs the view inside a nested frame
//! that remembers which sessions it opened; if the view fails or panics,
//! exactly those sessions are closed and the failure is returned as an
//! ordinary error.

use futures::FutureExt;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;
use viewmesh_core::{
    ErrorCallback, Identity, PortName, Resolution, Resolver, Result, Session, SessionFactory,
    View, ViewContext, ViewMeshError, ViewOutput,
};

/// Collaborators a context needs to open sessions
#[derive(Clone)]
pub struct ContextDeps {
    /// Maps parties to endpoints and key material
    pub resolver: Arc<dyn Resolver>,
    /// Builds sessions to resolved endpoints
    pub session_factory: Arc<dyn SessionFactory>,
}

impl ContextDeps {
    /// Bundle a resolver and a session factory
    pub fn new(resolver: Arc<dyn Resolver>, session_factory: Arc<dyn SessionFactory>) -> Self {
        Self {
            resolver,
            session_factory,
        }
    }
}

/// Cache key; implicit and explicit sessions never collide
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum SessionKey {
    Party(String),
    Explicit { session_id: String, party: String },
}

/// How a requested session is addressed
enum Target<'a> {
    /// One session per party, labelled with the opening view's identifier
    Implicit { protocol: String },
    /// Caller-chosen session id
    Explicit { session_id: &'a str },
}

impl Target<'_> {
    fn key(&self, party_uid: String) -> SessionKey {
        match self {
            Target::Implicit { .. } => SessionKey::Party(party_uid),
            Target::Explicit { session_id } => SessionKey::Explicit {
                session_id: (*session_id).to_string(),
                party: party_uid,
            },
        }
    }
}

/// A session handed out by the cache and whether this call built it
struct Acquired {
    session: Arc<dyn Session>,
    created: bool,
}

/// Per-invocation-chain execution environment
pub struct Context {
    id: String,
    me: Identity,
    caller: Option<Identity>,
    initiator: Option<Arc<dyn View>>,
    session: Option<Arc<dyn Session>>,
    deps: ContextDeps,
    sessions: tokio::sync::Mutex<HashMap<SessionKey, Arc<dyn Session>>>,
}

impl Context {
    /// Create a context with an explicit id and no caller, initiator, or default session
    pub fn new(id: impl Into<String>, me: Identity, deps: ContextDeps) -> Self {
        Self {
            id: id.into(),
            me,
            caller: None,
            initiator: None,
            session: None,
            deps,
            sessions: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Create a context for a locally initiated chain started by `initiator`
    pub fn for_initiator(me: Identity, initiator: Arc<dyn View>, deps: ContextDeps) -> Self {
        let mut ctx = Self::new(Uuid::new_v4().to_string(), me, deps);
        ctx.initiator = Some(initiator);
        ctx
    }

    /// Create a context serving the inbound `session` opened by `caller`
    pub fn for_responder(
        id: impl Into<String>,
        me: Identity,
        session: Arc<dyn Session>,
        caller: Identity,
        deps: ContextDeps,
    ) -> Self {
        let mut ctx = Self::new(id, me, deps);
        ctx.session = Some(session);
        ctx.caller = Some(caller);
        ctx
    }

    /// Run `view` in a fresh nested frame of this context
    pub async fn run_view(&self, view: &dyn View) -> Result<ViewOutput> {
        self.run_in_frame(view, None).await
    }

    async fn run_in_frame(&self, view: &dyn View, parent: Option<&Frame<'_>>) -> Result<ViewOutput> {
        let frame = Frame::new(self);
        let outcome = AssertUnwindSafe(view.call(&frame)).catch_unwind().await;

        match outcome {
            Ok(Ok(output)) => {
                if let Some(parent) = parent {
                    parent.adopt(frame.take_opened());
                }
                Ok(output)
            }
            Ok(Err(err)) => {
                debug!(context_id = %self.id, view = %view.identifier(), error = %err, "view failed");
                frame.cleanup();
                Err(err)
            }
            Err(panic) => {
                let payload = panic_payload(panic);
                debug!(context_id = %self.id, view = %view.identifier(), payload = %payload, "caught panic while running view");
                frame.cleanup();
                Err(ViewMeshError::execution_aborted(payload))
            }
        }
    }

    /// Look up or create a session under the cache lock
    async fn acquire(&self, target: Target<'_>, party: &Identity) -> Result<Acquired> {
        let mut sessions = self.sessions.lock().await;

        let direct = target.key(party.unique_id());
        let mut resolution: Option<Resolution> = None;
        let mut cached = sessions.get(&direct).cloned().map(|s| (direct, s));

        if cached.is_none() {
            let resolved = self.resolve(party).await?;
            let canonical = target.key(resolved.identity.unique_id());
            cached = sessions.get(&canonical).cloned().map(|s| (canonical, s));
            resolution = Some(resolved);
        }

        if let Some((key, session)) = cached {
            if !session.info().closed {
                debug!(context_id = %self.id, me = %self.me, party = %party, "reusing session");
                return Ok(Acquired {
                    session,
                    created: false,
                });
            }
            debug!(context_id = %self.id, party = %party, "evicting closed session");
            sessions.remove(&key);
        }

        let resolution = match resolution {
            Some(resolution) => resolution,
            None => self.resolve(party).await?,
        };
        let endpoint = resolution.endpoint(PortName::P2P)?;
        let factory = &self.deps.session_factory;

        let session = match &target {
            Target::Implicit { protocol } => {
                debug!(context_id = %self.id, me = %self.me, party = %party, "creating new session");
                factory
                    .new_session(protocol, &self.id, endpoint, &resolution.public_key)
                    .await
            }
            Target::Explicit { session_id } => {
                debug!(context_id = %self.id, me = %self.me, session_id = %session_id, party = %party, "creating new session with given id");
                factory
                    .new_session_with_id(
                        session_id,
                        &self.id,
                        endpoint,
                        &resolution.public_key,
                        None,
                        None,
                    )
                    .await
            }
        }
        .map_err(|e| e.context(format!("open session to [{party}] at [{endpoint}]")))?;

        sessions.insert(target.key(resolution.identity.unique_id()), session.clone());
        Ok(Acquired {
            session,
            created: true,
        })
    }

    async fn resolve(&self, party: &Identity) -> Result<Resolution> {
        self.deps
            .resolver
            .resolve(party)
            .await
            .map_err(|e| e.context(format!("resolve party [{party}]")))
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id)
            .field("me", &self.me)
            .field("caller", &self.caller)
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl ViewContext for Context {
    fn id(&self) -> &str {
        &self.id
    }

    fn me(&self) -> &Identity {
        &self.me
    }

    fn caller(&self) -> Option<&Identity> {
        self.caller.as_ref()
    }

    fn initiator(&self) -> Option<Arc<dyn View>> {
        self.initiator.clone()
    }

    fn session(&self) -> Option<Arc<dyn Session>> {
        if self.session.is_none() {
            debug!(context_id = %self.id, "no default session");
        }
        self.session.clone()
    }

    async fn get_session(&self, caller: &dyn View, party: &Identity) -> Result<Arc<dyn Session>> {
        let target = Target::Implicit {
            protocol: caller.identifier(),
        };
        Ok(self.acquire(target, party).await?.session)
    }

    async fn get_session_by_id(
        &self,
        session_id: &str,
        party: &Identity,
    ) -> Result<Arc<dyn Session>> {
        Ok(self
            .acquire(Target::Explicit { session_id }, party)
            .await?
            .session)
    }

    async fn run_view(&self, view: &dyn View) -> Result<ViewOutput> {
        Context::run_view(self, view).await
    }

    fn on_error(&self, _callback: ErrorCallback) -> Result<()> {
        Err(ViewMeshError::invalid(
            "on_error is only available inside a running view",
        ))
    }
}

/// Nested execution frame created by one `run_view` call
struct Frame<'a> {
    ctx: &'a Context,
    opened: Mutex<Vec<Arc<dyn Session>>>,
    callbacks: Mutex<Vec<ErrorCallback>>,
}

impl<'a> Frame<'a> {
    fn new(ctx: &'a Context) -> Self {
        Self {
            ctx,
            opened: Mutex::new(Vec::new()),
            callbacks: Mutex::new(Vec::new()),
        }
    }

    fn track(&self, acquired: Acquired) -> Arc<dyn Session> {
        if acquired.created {
            self.opened.lock().push(acquired.session.clone());
        }
        acquired.session
    }

    fn take_opened(&self) -> Vec<Arc<dyn Session>> {
        std::mem::take(&mut *self.opened.lock())
    }

    /// Sessions opened by a nested frame that succeeded now belong to this frame
    fn adopt(&self, sessions: Vec<Arc<dyn Session>>) {
        self.opened.lock().extend(sessions);
    }

    /// Run error callbacks and close the sessions this frame opened
    fn cleanup(&self) {
        let callbacks = std::mem::take(&mut *self.callbacks.lock());
        for callback in callbacks {
            callback();
        }
        for session in self.take_opened() {
            let info = session.info();
            if !info.closed {
                warn!(context_id = %self.ctx.id, session_id = %info.id, "closing session opened by failed view");
                session.close();
            }
        }
    }
}

#[async_trait::async_trait]
impl ViewContext for Frame<'_> {
    fn id(&self) -> &str {
        &self.ctx.id
    }

    fn me(&self) -> &Identity {
        &self.ctx.me
    }

    fn caller(&self) -> Option<&Identity> {
        self.ctx.caller.as_ref()
    }

    fn initiator(&self) -> Option<Arc<dyn View>> {
        self.ctx.initiator.clone()
    }

    fn session(&self) -> Option<Arc<dyn Session>> {
        ViewContext::session(self.ctx)
    }

    async fn get_session(&self, caller: &dyn View, party: &Identity) -> Result<Arc<dyn Session>> {
        let target = Target::Implicit {
            protocol: caller.identifier(),
        };
        Ok(self.track(self.ctx.acquire(target, party).await?))
    }

    async fn get_session_by_id(
        &self,
        session_id: &str,
        party: &Identity,
    ) -> Result<Arc<dyn Session>> {
        let acquired = self
            .ctx
            .acquire(Target::Explicit { session_id }, party)
            .await?;
        Ok(self.track(acquired))
    }

    async fn run_view(&self, view: &dyn View) -> Result<ViewOutput> {
        self.ctx.run_in_frame(view, Some(self)).await
    }

    fn on_error(&self, callback: ErrorCallback) -> Result<()> {
        self.callbacks.lock().push(callback);
        Ok(())
    }
}

/// Render a captured panic payload
fn panic_payload(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else if let Some(err) = panic.downcast_ref::<ViewMeshError>() {
        format!("caught panic: {err}")
    } else {
        "caught panic [non-string payload]".to_string()
    }
}
