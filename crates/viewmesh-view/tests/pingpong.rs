//! Ping-Pong Tests
//!
//! Two in-process parties run an initiator view against a registered
//! responder through their view managers.

use assert_matches::assert_matches;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use viewmesh_core::{
    Identity, Result, View, ViewContext, ViewFactory, ViewMeshError, ViewOutput,
};
use viewmesh_view::{ContextDeps, MemoryNetwork, ViewManager, ViewStatus};

const TIMEOUT: Duration = Duration::from_secs(60);

struct Initiator {
    responder: Identity,
}

#[async_trait]
impl View for Initiator {
    async fn call(&self, ctx: &dyn ViewContext) -> Result<ViewOutput> {
        let session = ctx.get_session(self, &self.responder).await?;
        session.send(b"ping".to_vec()).await?;
        let answer = session.receive_timeout(TIMEOUT).await?;
        if answer != b"pong" {
            return Err(ViewMeshError::protocol(format!(
                "expected pong, got {}",
                String::from_utf8_lossy(&answer)
            )));
        }
        Ok(answer)
    }
}

struct Responder;

#[async_trait]
impl View for Responder {
    async fn call(&self, ctx: &dyn ViewContext) -> Result<ViewOutput> {
        let session = ctx
            .session()
            .ok_or_else(|| ViewMeshError::session("responder has no inbound session"))?;
        let request = session.receive_timeout(TIMEOUT).await?;
        if request != b"ping" {
            session.send_error(b"expected ping".to_vec()).await?;
            return Err(ViewMeshError::protocol("expected ping"));
        }
        session.send(b"pong".to_vec()).await?;
        Ok(Vec::new())
    }
}

struct InitiatorFactory;

impl ViewFactory for InitiatorFactory {
    fn new_view(&self, input: &[u8]) -> Result<Arc<dyn View>> {
        if input.is_empty() {
            return Err(ViewMeshError::invalid("missing responder identity"));
        }
        Ok(Arc::new(Initiator {
            responder: Identity::from(input),
        }))
    }
}

fn party(network: &MemoryNetwork, name: &str) -> ViewManager {
    let node = Arc::new(network.register(Identity::from(name), None));
    let manager = ViewManager::new(
        Identity::from(name),
        ContextDeps::new(node.clone(), node),
    );
    network
        .set_acceptor(&Identity::from(name), Arc::new(manager.clone()))
        .unwrap();
    manager
}

fn protocol() -> String {
    Initiator {
        responder: Identity::default(),
    }
    .identifier()
}

#[tokio::test]
async fn initiator_receives_pong() {
    let network = MemoryNetwork::new();
    let alice = party(&network, "alice");
    let bob = party(&network, "bob");
    bob.register_responder(Arc::new(Responder), protocol());

    let output = alice
        .initiate_view(Arc::new(Initiator {
            responder: Identity::from("bob"),
        }))
        .await
        .unwrap();
    assert_eq!(output, b"pong");
}

#[tokio::test]
async fn missing_responder_is_reported_to_initiator() {
    let network = MemoryNetwork::new();
    let alice = party(&network, "alice");
    let _carol = party(&network, "carol");

    let err = alice
        .initiate_view(Arc::new(Initiator {
            responder: Identity::from("carol"),
        }))
        .await
        .unwrap_err();
    // Either the error report or the close reaches alice first
    assert!(matches!(err, ViewMeshError::Session { .. }));
}

#[tokio::test]
async fn call_view_uses_registered_factory() {
    let network = MemoryNetwork::new();
    let alice = party(&network, "alice");
    let bob = party(&network, "bob");
    bob.register_responder(Arc::new(Responder), protocol());
    alice
        .register_factory("ping", Arc::new(InitiatorFactory))
        .unwrap();

    assert_eq!(alice.call_view("ping", b"bob").await.unwrap(), b"pong");
    assert!(alice
        .register_factory("ping", Arc::new(InitiatorFactory))
        .is_err());
    assert!(matches!(
        alice.call_view("pong", b"bob").await,
        Err(ViewMeshError::NotFound { .. })
    ));
    assert!(matches!(
        alice.call_view("ping", b"").await,
        Err(ViewMeshError::Invalid { .. })
    ));
}

#[tokio::test]
async fn async_initiation_is_trackable() {
    let network = MemoryNetwork::new();
    let alice = party(&network, "alice");
    let bob = party(&network, "bob");
    bob.register_responder(Arc::new(Responder), protocol());

    let cid = alice.initiate_view_async(Arc::new(Initiator {
        responder: Identity::from("bob"),
    }));

    let mut status = alice.track(&cid).unwrap();
    for _ in 0..200 {
        if status != ViewStatus::Running {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        status = alice.track(&cid).unwrap();
    }
    assert_eq!(status, ViewStatus::Succeeded(b"pong".to_vec()));
    // A final status is handed out once
    assert_matches!(alice.track(&cid), Err(ViewMeshError::NotFound { .. }));
    assert!(alice.track("unknown").is_err());
    assert!(alice.context(&cid).is_err());
}

#[tokio::test]
async fn unknown_party_fails_initiator() {
    let network = MemoryNetwork::new();
    let alice = party(&network, "alice");

    let err = alice
        .initiate_view(Arc::new(Initiator {
            responder: Identity::from("mallory"),
        }))
        .await
        .unwrap_err();
    assert!(matches!(err, ViewMeshError::Resolution { .. }));
}
