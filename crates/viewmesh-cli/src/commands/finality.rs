//! Finality queries

use anyhow::{Context, Result};
use viewmesh_rpc::ViewClient;

/// Ask whether `txid` is final; fails with the node's reason when it is not
pub async fn tx(client: &ViewClient, txid: &str) -> Result<()> {
    client
        .is_tx_final(txid)
        .await
        .with_context(|| format!("transaction [{txid}]"))?;
    println!("final");
    Ok(())
}

/// Follow the finality stream of a transaction digest until it ends
pub async fn hash(client: &ViewClient, hash_hex: &str) -> Result<()> {
    let hash = hex::decode(hash_hex).context("hash must be hex encoded")?;
    let mut frames = client.is_hash_final(&hash).await?;
    let mut settled = false;
    while let Some(frame) = frames.recv().await {
        println!("belief={} final={}", frame.belief, frame.is_final);
        settled |= frame.is_final;
    }
    if !settled {
        anyhow::bail!("stream for [{hash_hex}] ended before finality");
    }
    Ok(())
}
