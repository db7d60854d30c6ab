//! View invocation commands

use anyhow::Result;
use viewmesh_node::TrackedView;
use viewmesh_rpc::ViewClient;

/// Run a view to completion and print its output
pub async fn call(client: &ViewClient, fid: &str, input: &str) -> Result<()> {
    let output = client.call_view(fid, input.as_bytes()).await?;
    println!("{}", String::from_utf8_lossy(&output));
    Ok(())
}

/// Start a view and print its context id
pub async fn initiate(client: &ViewClient, fid: &str, input: &str) -> Result<()> {
    let cid = client.initiate_view(fid, input.as_bytes()).await?;
    println!("{cid}");
    Ok(())
}

/// Print the status of a started view
pub async fn track(client: &ViewClient, cid: &str) -> Result<()> {
    let payload = client.track_view(cid).await?;
    match TrackedView::from_payload(&payload)? {
        TrackedView::Running => println!("running"),
        TrackedView::Succeeded(output) => {
            println!("succeeded: {}", String::from_utf8_lossy(&output));
        }
        TrackedView::Failed(message) => println!("failed: {message}"),
    }
    Ok(())
}
