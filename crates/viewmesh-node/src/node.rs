//! Node assembly

use crate::config::NodeConfig;
use crate::handler::NodeCommandHandler;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use viewmesh_core::{Ed25519VerifierProvider, Result, SigningIdentity, VerifierProvider, ViewMeshError};
use viewmesh_rpc::{serve_tcp, ViewServer};
use viewmesh_store::{FilePersistence, MemoryPersistence, Persistence, TxIdStore};
use viewmesh_view::ViewManager;

/// Builder for a [`Node`]
pub struct NodeBuilder {
    config: NodeConfig,
    manager: Option<ViewManager>,
    store: Option<Arc<TxIdStore>>,
    verifiers: Arc<dyn VerifierProvider>,
    signer: Option<Arc<dyn SigningIdentity>>,
}

impl Default for NodeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeBuilder {
    /// Start from the default configuration and Ed25519 verification
    pub fn new() -> Self {
        Self {
            config: NodeConfig::default(),
            manager: None,
            store: None,
            verifiers: Arc::new(Ed25519VerifierProvider),
            signer: None,
        }
    }

    /// Set the configuration
    pub fn with_config(mut self, config: NodeConfig) -> Self {
        self.config = config;
        self
    }

    /// Serve views from `manager`
    pub fn with_manager(mut self, manager: ViewManager) -> Self {
        self.manager = Some(manager);
        self
    }

    /// Use an already opened transaction index instead of `store_path`
    pub fn with_store(mut self, store: Arc<TxIdStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Verify command creators with `verifiers`
    pub fn with_verifiers(mut self, verifiers: Arc<dyn VerifierProvider>) -> Self {
        self.verifiers = verifiers;
        self
    }

    /// Sign responses with `signer`
    pub fn with_signer(mut self, signer: Arc<dyn SigningIdentity>) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Validate the configuration and assemble the node
    pub fn build(self) -> Result<Node> {
        self.config.validate()?;
        let manager = self
            .manager
            .ok_or_else(|| ViewMeshError::invalid("view manager required"))?;
        let store = match self.store {
            Some(store) => store,
            None => Arc::new(TxIdStore::new(open_persistence(&self.config)?)?),
        };

        let handler = NodeCommandHandler::new(manager.clone(), store.clone(), self.config.clone());
        let mut server = ViewServer::new(
            self.config.server.clone(),
            self.verifiers,
            Arc::new(handler),
        );
        if let Some(signer) = self.signer {
            server = server.with_signer(signer);
        }

        Ok(Node {
            config: self.config,
            manager,
            store,
            server: Arc::new(server),
        })
    }
}

fn open_persistence(config: &NodeConfig) -> Result<Arc<dyn Persistence>> {
    Ok(match &config.store_path {
        Some(path) => {
            info!(path = %path.display(), "opening transaction index");
            Arc::new(FilePersistence::open(path)?)
        }
        None => Arc::new(MemoryPersistence::new()),
    })
}

/// A view manager and a transaction index served behind one command endpoint
pub struct Node {
    config: NodeConfig,
    manager: ViewManager,
    store: Arc<TxIdStore>,
    server: Arc<ViewServer>,
}

impl Node {
    /// Active configuration
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// View manager of the local party
    pub fn manager(&self) -> &ViewManager {
        &self.manager
    }

    /// Transaction index answering finality queries
    pub fn store(&self) -> &Arc<TxIdStore> {
        &self.store
    }

    /// Command server, for in-process clients
    pub fn server(&self) -> Arc<ViewServer> {
        self.server.clone()
    }

    /// Bind `listen_address` and serve until `shutdown` resolves
    pub async fn serve(&self, shutdown: impl Future<Output = ()> + Send) -> Result<()> {
        let listener = TcpListener::bind(&self.config.listen_address)
            .await
            .map_err(|e| {
                ViewMeshError::network(format!(
                    "bind [{}]: {e}",
                    self.config.listen_address
                ))
            })?;
        self.serve_on(listener, shutdown).await
    }

    /// Serve on an already bound listener until `shutdown` resolves
    pub async fn serve_on(
        &self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()> + Send,
    ) -> Result<()> {
        info!(party = %self.manager.me(), "node serving commands");
        serve_tcp(listener, self.server.clone(), shutdown).await
    }
}
