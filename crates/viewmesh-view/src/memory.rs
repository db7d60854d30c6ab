//! In-process session network
//!
//! [`MemoryNetwork`] connects parties living in the same process. Each party
//! gets a [`MemoryNode`] acting as both its [`Resolver`] and its
//! [`SessionFactory`]. Sessions are pairs of [`MemorySession`] ends sharing
//! one id; messages are delivered in send order and closing either end closes
//! both.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, watch};
use tracing::debug;
use uuid::Uuid;
use viewmesh_core::{
    Identity, Message, MessageStatus, PortName, Resolution, Resolver, Result, Session,
    SessionFactory, SessionInfo, ViewMeshError,
};

/// Receives sessions opened towards a party
pub trait SessionAcceptor: Send + Sync {
    /// Serve `session`, opened by `caller` running `protocol` in context `context_id`
    fn accept(&self, protocol: &str, context_id: &str, session: Arc<dyn Session>, caller: Identity);
}

struct Party {
    identity: Identity,
    endpoint: String,
    acceptor: Option<Arc<dyn SessionAcceptor>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RendezvousKey {
    session_id: String,
    from: String,
    to: String,
}

/// Waiting end left in the rendezvous table by the side that opened first
struct Parked {
    network: Weak<RwLock<NetworkState>>,
    key: RendezvousKey,
}

impl Parked {
    /// Drop the waiting end if it still belongs to the session closing now
    fn release(&self, closed: &Arc<watch::Sender<bool>>) {
        let Some(network) = self.network.upgrade() else {
            return;
        };
        let mut state = network.write();
        let ours = state
            .rendezvous
            .get(&self.key)
            .is_some_and(|end| Arc::ptr_eq(&end.closed, closed));
        if ours {
            state.rendezvous.remove(&self.key);
            debug!(session_id = %self.key.session_id, "dropped unjoined memory session");
        }
    }
}

#[derive(Default)]
struct NetworkState {
    parties: HashMap<String, Party>,
    aliases: HashMap<String, Identity>,
    endpoints: HashMap<String, String>,
    rendezvous: HashMap<RendezvousKey, Arc<MemorySession>>,
}

/// Registry of in-process parties
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<RwLock<NetworkState>>,
}

impl MemoryNetwork {
    /// Create an empty network
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `identity`; sessions opened towards it are handed to `acceptor`
    pub fn register(&self, identity: Identity, acceptor: Option<Arc<dyn SessionAcceptor>>) -> MemoryNode {
        let uid = identity.unique_id();
        let endpoint = format!("mem://{uid}");
        let mut state = self.state.write();
        state.endpoints.insert(endpoint.clone(), uid.clone());
        state.parties.insert(
            uid,
            Party {
                identity: identity.clone(),
                endpoint,
                acceptor,
            },
        );
        MemoryNode {
            network: self.clone(),
            me: identity,
        }
    }

    /// Replace the acceptor of an already registered party
    pub fn set_acceptor(&self, identity: &Identity, acceptor: Arc<dyn SessionAcceptor>) -> Result<()> {
        let mut state = self.state.write();
        let party = state
            .parties
            .get_mut(&identity.unique_id())
            .ok_or_else(|| ViewMeshError::not_found(format!("party [{identity}] is not registered")))?;
        party.acceptor = Some(acceptor);
        Ok(())
    }

    /// Make `alias` resolve to `canonical`
    pub fn alias(&self, alias: Identity, canonical: Identity) {
        self.state.write().aliases.insert(alias.unique_id(), canonical);
    }

    fn resolve(&self, party: &Identity) -> Result<Resolution> {
        let state = self.state.read();
        let canonical = state
            .aliases
            .get(&party.unique_id())
            .cloned()
            .unwrap_or_else(|| party.clone());
        let entry = state
            .parties
            .get(&canonical.unique_id())
            .ok_or_else(|| ViewMeshError::resolution(format!("party [{party}] is not known")))?;
        Ok(Resolution {
            identity: entry.identity.clone(),
            endpoints: HashMap::from([
                (PortName::P2P, entry.endpoint.clone()),
                (PortName::Listen, entry.endpoint.clone()),
            ]),
            public_key: entry.identity.as_bytes().to_vec(),
        })
    }

    fn party_at(&self, endpoint: &str) -> Result<(Identity, Option<Arc<dyn SessionAcceptor>>)> {
        let state = self.state.read();
        state
            .endpoints
            .get(endpoint)
            .and_then(|uid| state.parties.get(uid))
            .map(|p| (p.identity.clone(), p.acceptor.clone()))
            .ok_or_else(|| ViewMeshError::session(format!("no party listening at [{endpoint}]")))
    }
}

/// One party's view of the network: resolver plus session factory
#[derive(Clone)]
pub struct MemoryNode {
    network: MemoryNetwork,
    me: Identity,
}

impl MemoryNode {
    /// Identity this node was registered with
    pub fn identity(&self) -> &Identity {
        &self.me
    }
}

#[async_trait]
impl Resolver for MemoryNode {
    async fn resolve(&self, party: &Identity) -> Result<Resolution> {
        self.network.resolve(party)
    }
}

#[async_trait]
impl SessionFactory for MemoryNode {
    async fn new_session(
        &self,
        protocol: &str,
        context_id: &str,
        endpoint: &str,
        _public_key: &[u8],
    ) -> Result<Arc<dyn Session>> {
        let (remote, acceptor) = self.network.party_at(endpoint)?;
        let acceptor = acceptor.ok_or_else(|| {
            ViewMeshError::session(format!("party [{remote}] does not accept sessions"))
        })?;

        let (local_end, remote_end) = MemorySession::pair(
            Uuid::new_v4().to_string(),
            context_id,
            &self.me,
            &remote,
            endpoint,
            None,
        );
        debug!(session_id = %local_end.id, protocol = %protocol, to = %remote, "opened memory session");
        acceptor.accept(protocol, context_id, remote_end, self.me.clone());
        Ok(local_end)
    }

    async fn new_session_with_id(
        &self,
        session_id: &str,
        context_id: &str,
        endpoint: &str,
        _public_key: &[u8],
        _caller: Option<&Identity>,
        _first_message: Option<&Message>,
    ) -> Result<Arc<dyn Session>> {
        let (remote, _) = self.network.party_at(endpoint)?;
        let me = self.me.unique_id();
        let them = remote.unique_id();

        let mut state = self.network.state.write();
        let waiting = RendezvousKey {
            session_id: session_id.to_string(),
            from: them.clone(),
            to: me.clone(),
        };
        if let Some(end) = state.rendezvous.remove(&waiting) {
            debug!(session_id = %session_id, with = %remote, "joined memory session");
            return Ok(end);
        }

        let key = RendezvousKey {
            session_id: session_id.to_string(),
            from: me,
            to: them,
        };
        let parked = Parked {
            network: Arc::downgrade(&self.network.state),
            key: key.clone(),
        };
        let (local_end, remote_end) = MemorySession::pair(
            session_id.to_string(),
            context_id,
            &self.me,
            &remote,
            endpoint,
            Some(parked),
        );
        state.rendezvous.insert(key, remote_end);
        debug!(session_id = %session_id, with = %remote, "waiting for peer to join memory session");
        Ok(local_end)
    }
}

/// One end of an in-process session
pub struct MemorySession {
    id: String,
    context_id: String,
    me: Identity,
    remote: Identity,
    endpoint: String,
    outbox: mpsc::UnboundedSender<Message>,
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<Message>>,
    closed: Arc<watch::Sender<bool>>,
    parked: Option<Parked>,
}

impl MemorySession {
    /// Build two connected ends; the first belongs to `me`
    fn pair(
        id: String,
        context_id: &str,
        me: &Identity,
        remote: &Identity,
        endpoint: &str,
        parked: Option<Parked>,
    ) -> (Arc<Self>, Arc<Self>) {
        let (to_remote, remote_inbox) = mpsc::unbounded_channel();
        let (to_local, local_inbox) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);
        let closed = Arc::new(closed);

        let local = Arc::new(Self {
            id: id.clone(),
            context_id: context_id.to_string(),
            me: me.clone(),
            remote: remote.clone(),
            endpoint: endpoint.to_string(),
            outbox: to_remote,
            inbox: tokio::sync::Mutex::new(local_inbox),
            closed: closed.clone(),
            parked,
        });
        let remote_end = Arc::new(Self {
            id,
            context_id: context_id.to_string(),
            me: remote.clone(),
            remote: me.clone(),
            endpoint: format!("mem://{}", me.unique_id()),
            outbox: to_local,
            inbox: tokio::sync::Mutex::new(remote_inbox),
            closed,
            parked: None,
        });
        (local, remote_end)
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn deliver(&self, status: MessageStatus, payload: Vec<u8>) -> Result<()> {
        if self.is_closed() {
            return Err(ViewMeshError::session(format!("session [{}] is closed", self.id)));
        }
        self.outbox
            .send(Message {
                context_id: self.context_id.clone(),
                session_id: self.id.clone(),
                caller: self.me.clone(),
                status,
                payload,
            })
            .map_err(|_| ViewMeshError::session(format!("session [{}] peer is gone", self.id)))
    }
}

#[async_trait]
impl Session for MemorySession {
    fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            caller: self.remote.clone(),
            endpoint: self.endpoint.clone(),
            closed: self.is_closed(),
        }
    }

    async fn send(&self, payload: Vec<u8>) -> Result<()> {
        self.deliver(MessageStatus::Ok, payload)
    }

    async fn send_error(&self, payload: Vec<u8>) -> Result<()> {
        self.deliver(MessageStatus::Error, payload)
    }

    async fn receive(&self) -> Option<Message> {
        let mut inbox = self.inbox.lock().await;
        let mut closed = self.closed.subscribe();
        loop {
            if let Ok(msg) = inbox.try_recv() {
                return Some(msg);
            }
            if *closed.borrow_and_update() {
                return None;
            }
            tokio::select! {
                msg = inbox.recv() => return msg,
                changed = closed.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
            }
        }
    }

    fn close(&self) {
        if !self.closed.send_replace(true) {
            debug!(session_id = %self.id, "closed memory session");
            if let Some(parked) = &self.parked {
                parked.release(&self.closed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Inbox {
        accepted: Mutex<Vec<(String, Arc<dyn Session>)>>,
    }

    impl SessionAcceptor for Inbox {
        fn accept(&self, protocol: &str, _context_id: &str, session: Arc<dyn Session>, _caller: Identity) {
            self.accepted.lock().push((protocol.to_string(), session));
        }
    }

    #[tokio::test]
    async fn test_messages_flow_in_order_and_close_is_shared() {
        let network = MemoryNetwork::new();
        let alice = network.register(Identity::from("alice"), None);
        let inbox = Arc::new(Inbox::default());
        network.register(Identity::from("bob"), Some(inbox.clone()));

        let bob = alice.resolve(&Identity::from("bob")).await.unwrap();
        let session = alice
            .new_session("ping", "ctx", bob.endpoint(PortName::P2P).unwrap(), &[])
            .await
            .unwrap();

        let (protocol, remote) = inbox.accepted.lock().pop().unwrap();
        assert_eq!(protocol, "ping");
        assert_eq!(remote.info().id, session.info().id);

        session.send(b"one".to_vec()).await.unwrap();
        session.send(b"two".to_vec()).await.unwrap();
        assert_eq!(remote.receive_timeout(Duration::from_secs(1)).await.unwrap(), b"one");
        assert_eq!(remote.receive_timeout(Duration::from_secs(1)).await.unwrap(), b"two");

        remote.close();
        assert!(session.info().closed);
        assert!(session.send(b"three".to_vec()).await.is_err());
        assert!(session.receive().await.is_none());
    }

    #[tokio::test]
    async fn test_error_status_surfaces_as_session_error() {
        let network = MemoryNetwork::new();
        let alice = network.register(Identity::from("alice"), None);
        let inbox = Arc::new(Inbox::default());
        network.register(Identity::from("bob"), Some(inbox.clone()));

        let session = alice
            .new_session("ping", "ctx", &format!("mem://{}", Identity::from("bob").unique_id()), &[])
            .await
            .unwrap();
        let (_, remote) = inbox.accepted.lock().pop().unwrap();

        remote.send_error(b"no pong today".to_vec()).await.unwrap();
        let err = session.receive_timeout(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, ViewMeshError::Session { .. }));
        assert!(err.to_string().contains("no pong today"));
    }

    #[tokio::test]
    async fn test_explicit_ids_rendezvous() {
        let network = MemoryNetwork::new();
        let alice = network.register(Identity::from("alice"), None);
        let bob = network.register(Identity::from("bob"), None);
        let alice_ep = format!("mem://{}", Identity::from("alice").unique_id());
        let bob_ep = format!("mem://{}", Identity::from("bob").unique_id());

        let a = alice
            .new_session_with_id("round-1", "ctx", &bob_ep, &[], None, None)
            .await
            .unwrap();
        a.send(b"hello".to_vec()).await.unwrap();
        let b = bob
            .new_session_with_id("round-1", "ctx", &alice_ep, &[], None, None)
            .await
            .unwrap();

        assert_eq!(b.receive_timeout(Duration::from_secs(1)).await.unwrap(), b"hello");
        assert_eq!(a.info().caller, Identity::from("bob"));
        assert_eq!(b.info().caller, Identity::from("alice"));
    }

    #[tokio::test]
    async fn test_closing_unjoined_session_frees_rendezvous() {
        let network = MemoryNetwork::new();
        let alice = network.register(Identity::from("alice"), None);
        let bob = network.register(Identity::from("bob"), None);
        let alice_ep = format!("mem://{}", Identity::from("alice").unique_id());
        let bob_ep = format!("mem://{}", Identity::from("bob").unique_id());

        let a = alice
            .new_session_with_id("round-2", "ctx", &bob_ep, &[], None, None)
            .await
            .unwrap();
        assert_eq!(network.state.read().rendezvous.len(), 1);
        a.close();
        assert!(network.state.read().rendezvous.is_empty());

        // A late peer parks a fresh end instead of joining the closed one
        let b = bob
            .new_session_with_id("round-2", "ctx", &alice_ep, &[], None, None)
            .await
            .unwrap();
        assert!(!b.info().closed);
        b.close();
        assert!(network.state.read().rendezvous.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_party_and_alias_resolution() {
        let network = MemoryNetwork::new();
        let alice = network.register(Identity::from("alice"), None);
        network.register(Identity::from("bob"), None);
        network.alias(Identity::from("robert"), Identity::from("bob"));

        let resolved = alice.resolve(&Identity::from("robert")).await.unwrap();
        assert_eq!(resolved.identity, Identity::from("bob"));
        assert!(matches!(
            alice.resolve(&Identity::from("carol")).await,
            Err(ViewMeshError::Resolution { .. })
        ));
    }
}
