//! Running a node

use anyhow::Result;
use std::sync::Arc;
use tracing::info;
use viewmesh_core::Ed25519SigningIdentity;
use viewmesh_node::{NodeBuilder, NodeConfig};
use viewmesh_view::{ContextDeps, MemoryNetwork, ViewManager};

/// Serve the command endpoint until Ctrl+C
///
/// Peers are reachable through an in-process network only; views are
/// registered by embedding applications, so a bare node answers finality
/// queries and reports unknown factories.
pub async fn run(config: NodeConfig, signer: Ed25519SigningIdentity) -> Result<()> {
    let me = signer.identity();
    let network = MemoryNetwork::new();
    let endpoint = Arc::new(network.register(me.clone(), None));
    let manager = ViewManager::new(me.clone(), ContextDeps::new(endpoint.clone(), endpoint));
    network.set_acceptor(&me, Arc::new(manager.clone()))?;

    let node = NodeBuilder::new()
        .with_config(config)
        .with_manager(manager)
        .with_signer(Arc::new(signer))
        .build()?;

    info!(party = %me, address = %node.config().listen_address, "starting node");
    node.serve(async {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received");
        }
    })
    .await?;
    Ok(())
}
