//! Command Protocol over TCP
//!
//! A real listener on a loopback port, a signing client, and a handler that
//! answers every command kind. Covers unary calls, tunneled handler errors,
//! the finality stream, and clean shutdown.

use assert_matches::assert_matches;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use viewmesh_core::{Ed25519SigningIdentity, Ed25519VerifierProvider, Result, ViewMeshError};
use viewmesh_rpc::{
    serve_tcp, ClientConfig, CommandHandler, HashFinality, ServerConfig, TcpViewServiceClient,
    TransportConfig, ViewClient, ViewServer,
};

// ============================================================================
// Fixtures
// ============================================================================

struct Ledger;

#[async_trait]
impl CommandHandler for Ledger {
    async fn initiate_view(&self, fid: &str, _input: &[u8]) -> Result<String> {
        Ok(format!("cid-{fid}"))
    }

    async fn track_view(&self, cid: &str) -> Result<Vec<u8>> {
        Ok(format!("{cid}: running").into_bytes())
    }

    async fn call_view(&self, fid: &str, input: &[u8]) -> Result<Vec<u8>> {
        match fid {
            "upper" => Ok(input.to_ascii_uppercase()),
            _ => Err(ViewMeshError::not_found(format!("no factory found for [{fid}]"))),
        }
    }

    async fn is_tx_final(&self, txid: &str) -> Result<Vec<u8>> {
        Ok(match txid {
            "tx-valid" => Vec::new(),
            _ => format!("transaction [{txid}] is not valid").into_bytes(),
        })
    }

    async fn is_hash_final(&self, hash: &[u8], frames: mpsc::Sender<HashFinality>) -> Result<()> {
        if hash.is_empty() {
            return Err(ViewMeshError::invalid("empty hash"));
        }
        for _ in 0..3 {
            let pending = HashFinality {
                belief: false,
                is_final: false,
            };
            if frames.send(pending).await.is_err() {
                return Ok(());
            }
        }
        let _ = frames
            .send(HashFinality {
                belief: true,
                is_final: true,
            })
            .await;
        Ok(())
    }
}

struct Harness {
    client: ViewClient,
    shutdown: Option<oneshot::Sender<()>>,
    served: JoinHandle<Result<()>>,
}

impl Harness {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let server = Arc::new(ViewServer::new(
            ServerConfig::default(),
            Arc::new(Ed25519VerifierProvider),
            Arc::new(Ledger),
        ));
        let (shutdown, stop) = oneshot::channel::<()>();
        let served = tokio::spawn(serve_tcp(listener, server, async move {
            let _ = stop.await;
        }));

        let config = ClientConfig {
            address,
            ..ClientConfig::default()
        };
        let client =
            ViewClient::from_config(&config, Arc::new(Ed25519SigningIdentity::generate())).unwrap();
        Self {
            client,
            shutdown: Some(shutdown),
            served,
        }
    }

    async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        self.served.await.unwrap().unwrap();
    }
}

async fn collect(mut rx: mpsc::Receiver<HashFinality>) -> Vec<HashFinality> {
    let mut frames = Vec::new();
    while let Some(frame) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
    {
        frames.push(frame);
    }
    frames
}

// ============================================================================
// Unary Calls
// ============================================================================

#[tokio::test]
async fn call_view_roundtrips_over_tcp() {
    let harness = Harness::start().await;
    assert_eq!(
        harness.client.call_view("upper", b"ping").await.unwrap(),
        b"PING"
    );
    harness.stop().await;
}

#[tokio::test]
async fn handler_error_is_tunneled_to_caller() {
    let harness = Harness::start().await;
    let err = harness.client.call_view("nope", b"").await.unwrap_err();
    assert_matches!(err, ViewMeshError::Protocol { .. });
    assert!(err.to_string().contains("no factory found for [nope]"));
    harness.stop().await;
}

#[tokio::test]
async fn initiate_then_track() {
    let harness = Harness::start().await;
    let cid = harness.client.initiate_view("pingpong", b"").await.unwrap();
    assert_eq!(cid, "cid-pingpong");
    assert_eq!(
        harness.client.track_view(&cid).await.unwrap(),
        b"cid-pingpong: running"
    );
    harness.stop().await;
}

#[tokio::test]
async fn tx_finality_maps_payload_to_result() {
    let harness = Harness::start().await;
    harness.client.is_tx_final("tx-valid").await.unwrap();

    let err = harness.client.is_tx_final("tx-bad").await.unwrap_err();
    assert_matches!(err, ViewMeshError::Invalid { .. });
    assert_eq!(err.message(), "transaction [tx-bad] is not valid");
    harness.stop().await;
}

// ============================================================================
// Streaming
// ============================================================================

#[tokio::test]
async fn hash_finality_streams_until_final() {
    let harness = Harness::start().await;
    let frames = collect(harness.client.is_hash_final(&[7; 32]).await.unwrap()).await;
    assert_eq!(frames.len(), 4);
    assert!(frames[..3].iter().all(|f| !f.is_final));
    assert!(frames[3].is_final && frames[3].belief);
    harness.stop().await;
}

#[tokio::test]
async fn failing_stream_closes_queue_without_frames() {
    let harness = Harness::start().await;
    let frames = collect(harness.client.is_hash_final(&[]).await.unwrap()).await;
    assert!(frames.is_empty());
    harness.stop().await;
}

// ============================================================================
// Connection Failures
// ============================================================================

#[tokio::test]
async fn unreachable_server_fails_the_call() {
    // Bind then drop to get a port nobody listens on
    let address = TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap()
        .local_addr()
        .unwrap()
        .to_string();
    let service = TcpViewServiceClient::new(address.clone(), TransportConfig::default());
    let client = ViewClient::new(
        address,
        Arc::new(service),
        Arc::new(Ed25519SigningIdentity::generate()),
    );

    let err = client.call_view("upper", b"x").await.unwrap_err();
    assert!(err.to_string().contains("failed creating view client"));
}
