//! Command server: validates signed commands and dispatches them
//!
//! Every command goes through the same checks before a handler sees it:
//! it must decode, carry a full-length nonce and a creator, be fresh with
//! respect to `max_clock_skew_secs`, match the TLS certificate reported by
//! the transport, verify against its creator, and not replay a recent
//! nonce. Failures never escape as transport errors; they are answered with
//! [`CommandResponse::Err`].

use crate::config::ServerConfig;
use crate::protocol::{
    CallKind, Command, CommandEnvelope, CommandResponse, HashFinality, RequestFrame,
    SignedCommand, SignedCommandResponse, NONCE_LEN,
};
use crate::signing::{now_ms, open_signed_command};
use crate::transport::{read_frame, write_frame};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use viewmesh_core::{Result, SigningIdentity, VerifierProvider, ViewMeshError};

const STREAM_CHANNEL_CAPACITY: usize = 16;

fn unsupported(command: &str) -> ViewMeshError {
    ViewMeshError::invalid(format!("unsupported command {command}"))
}

/// Executes validated commands
///
/// Every method defaults to an "unsupported command" error so handlers only
/// implement what they serve.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Start view `fid` in the background and return its context id
    async fn initiate_view(&self, _fid: &str, _input: &[u8]) -> Result<String> {
        Err(unsupported("InitiateView"))
    }

    /// Status payload of a view started earlier
    async fn track_view(&self, _cid: &str) -> Result<Vec<u8>> {
        Err(unsupported("TrackView"))
    }

    /// Run view `fid` to completion
    async fn call_view(&self, _fid: &str, _input: &[u8]) -> Result<Vec<u8>> {
        Err(unsupported("CallView"))
    }

    /// Empty payload when `txid` is final, otherwise the reason it is not
    async fn is_tx_final(&self, _txid: &str) -> Result<Vec<u8>> {
        Err(unsupported("IsTxFinal"))
    }

    /// Push finality frames for the transaction with digest `hash`
    ///
    /// The stream ends when this returns.
    async fn is_hash_final(&self, _hash: &[u8], _frames: mpsc::Sender<HashFinality>) -> Result<()> {
        Err(unsupported("IsHashFinal"))
    }
}

/// Nonces seen within the clock-skew window, bounded in size
struct NonceCache {
    seen: HashSet<Vec<u8>>,
    order: VecDeque<(u64, Vec<u8>)>,
    capacity: usize,
    window_ms: u64,
}

impl NonceCache {
    fn new(capacity: usize, window_ms: u64) -> Self {
        Self {
            seen: HashSet::new(),
            order: VecDeque::new(),
            capacity,
            window_ms,
        }
    }

    fn insert(&mut self, nonce: &[u8], now: u64) -> Result<()> {
        while let Some((at, _)) = self.order.front() {
            if at.saturating_add(self.window_ms) >= now && self.order.len() < self.capacity {
                break;
            }
            if let Some((_, old)) = self.order.pop_front() {
                self.seen.remove(&old);
            }
        }
        if !self.seen.insert(nonce.to_vec()) {
            return Err(ViewMeshError::invalid("replayed command nonce"));
        }
        self.order.push_back((now, nonce.to_vec()));
        Ok(())
    }
}

/// Validating front end in front of a [`CommandHandler`]
pub struct ViewServer {
    config: ServerConfig,
    verifiers: Arc<dyn VerifierProvider>,
    handler: Arc<dyn CommandHandler>,
    signer: Option<Arc<dyn SigningIdentity>>,
    nonces: Mutex<NonceCache>,
}

impl ViewServer {
    /// Create a server that does not sign its responses
    pub fn new(
        config: ServerConfig,
        verifiers: Arc<dyn VerifierProvider>,
        handler: Arc<dyn CommandHandler>,
    ) -> Self {
        let nonces = NonceCache::new(
            config.nonce_cache_capacity,
            config.max_clock_skew_secs.saturating_mul(2_000),
        );
        Self {
            config,
            verifiers,
            handler,
            signer: None,
            nonces: Mutex::new(nonces),
        }
    }

    /// Sign every response with `signer`
    pub fn with_signer(mut self, signer: Arc<dyn SigningIdentity>) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Active configuration
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Run every check on `signed` and return the decoded envelope
    pub fn validate(
        &self,
        signed: &SignedCommand,
        tls_cert_hash: Option<&[u8]>,
    ) -> Result<CommandEnvelope> {
        let envelope = CommandEnvelope::from_bytes(&signed.command)?;
        let header = &envelope.header;

        if header.nonce.len() != NONCE_LEN {
            return Err(ViewMeshError::invalid(format!(
                "nonce must be {NONCE_LEN} bytes, got {}",
                header.nonce.len()
            )));
        }
        if header.creator.is_empty() {
            return Err(ViewMeshError::invalid("command creator is empty"));
        }

        let now = now_ms();
        let skew_ms = self.config.max_clock_skew_secs.saturating_mul(1_000);
        if header.timestamp_ms.abs_diff(now) > skew_ms {
            return Err(ViewMeshError::invalid(format!(
                "command timestamp {} is outside the allowed skew of {}s",
                header.timestamp_ms, self.config.max_clock_skew_secs
            )));
        }

        if let Some(expected) = tls_cert_hash {
            if header.tls_cert_hash.as_deref() != Some(expected) {
                return Err(ViewMeshError::invalid(
                    "tls certificate hash does not match the connection",
                ));
            }
        }

        let envelope = open_signed_command(signed, self.verifiers.as_ref())?;
        self.nonces.lock().insert(&envelope.header.nonce, now)?;
        Ok(envelope)
    }

    /// Answer a unary call; handler and validation errors become `Err` responses
    pub async fn process_command(
        &self,
        signed: &SignedCommand,
        tls_cert_hash: Option<&[u8]>,
    ) -> Result<SignedCommandResponse> {
        let response = match self.validate(signed, tls_cert_hash) {
            Ok(envelope) => {
                let name = envelope.command.name();
                debug!(command = name, "processing command");
                self.dispatch(envelope.command).await.unwrap_or_else(|err| {
                    error!(command = name, error = %err, "command failed");
                    CommandResponse::error(&err)
                })
            }
            Err(err) => {
                warn!(error = %err, "rejected command");
                CommandResponse::error(&err)
            }
        };
        self.seal(&response)
    }

    /// Answer a streaming call by pushing frames into `out` until done
    pub async fn stream_command(
        &self,
        signed: &SignedCommand,
        tls_cert_hash: Option<&[u8]>,
        out: mpsc::Sender<SignedCommandResponse>,
    ) -> Result<()> {
        let envelope = match self.validate(signed, tls_cert_hash) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(error = %err, "rejected stream command");
                return self.push(&out, &CommandResponse::error(&err)).await;
            }
        };

        let hash = match envelope.command {
            Command::IsHashFinal { hash } => hash,
            other => {
                let response = self
                    .dispatch(other)
                    .await
                    .unwrap_or_else(|err| CommandResponse::error(&err));
                return self.push(&out, &response).await;
            }
        };

        let (frames_tx, mut frames_rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let produce = self.handler.is_hash_final(&hash, frames_tx);
        let hash_hex = hex::encode(&hash);
        let (sink, label) = (&out, &hash_hex);
        // Owns the receiver so the producer's sends fail once the consumer leaves
        let forward = async move {
            while let Some(frame) = frames_rx.recv().await {
                if self
                    .push(sink, &CommandResponse::IsHashFinal(frame))
                    .await
                    .is_err()
                {
                    debug!(hash = %label, "stream consumer went away");
                    break;
                }
            }
        };
        let (produced, ()) = tokio::join!(produce, forward);

        if let Err(err) = produced {
            error!(hash = %hash_hex, error = %err, "hash finality stream failed");
            let _ = self.push(&out, &CommandResponse::error(&err)).await;
        }
        Ok(())
    }

    async fn dispatch(&self, command: Command) -> Result<CommandResponse> {
        let handler = &self.handler;
        Ok(match command {
            Command::InitiateView { fid, input } => CommandResponse::InitiateView {
                cid: handler.initiate_view(&fid, &input).await?,
            },
            Command::TrackView { cid } => CommandResponse::TrackView {
                payload: handler.track_view(&cid).await?,
            },
            Command::CallView { fid, input } => CommandResponse::CallView {
                result: handler.call_view(&fid, &input).await?,
            },
            Command::IsTxFinal { txid } => CommandResponse::IsTxFinal {
                payload: handler.is_tx_final(&txid).await?,
            },
            Command::IsHashFinal { .. } => {
                return Err(ViewMeshError::invalid(
                    "IsHashFinal is only served as a stream",
                ))
            }
        })
    }

    async fn push(
        &self,
        out: &mpsc::Sender<SignedCommandResponse>,
        response: &CommandResponse,
    ) -> Result<()> {
        let sealed = self.seal(response)?;
        out.send(sealed)
            .await
            .map_err(|_| ViewMeshError::network("stream receiver closed"))
    }

    fn seal(&self, response: &CommandResponse) -> Result<SignedCommandResponse> {
        let response = bincode::serialize(response)?;
        let signature = match &self.signer {
            Some(signer) => signer.sign(&response)?,
            None => Vec::new(),
        };
        Ok(SignedCommandResponse {
            response,
            signature,
        })
    }
}

/// Accept framed connections on `listener` until `shutdown` resolves
pub async fn serve_tcp(
    listener: TcpListener,
    server: Arc<ViewServer>,
    shutdown: impl Future<Output = ()> + Send,
) -> Result<()> {
    let local = listener.local_addr()?;
    info!(address = %local, "command server listening");
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            () = &mut shutdown => {
                info!(address = %local, "command server shutting down");
                return Ok(());
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let server = server.clone();
                    tokio::spawn(async move {
                        if let Err(err) = handle_connection(stream, server).await {
                            warn!(peer = %peer, error = %err, "connection failed");
                        }
                    });
                }
                Err(err) => warn!(error = %err, "accept failed"),
            },
        }
    }
}

async fn handle_connection(mut stream: TcpStream, server: Arc<ViewServer>) -> Result<()> {
    stream.set_nodelay(true)?;
    let transport = server.config().transport.clone();

    let Some(bytes) = read_frame(&mut stream, &transport, Some(transport.read_timeout())).await?
    else {
        return Ok(());
    };
    let frame: RequestFrame = match bincode::deserialize(&bytes) {
        Ok(frame) => frame,
        Err(err) => {
            let err = ViewMeshError::protocol(format!("malformed request frame: {err}"));
            let reply = server.seal(&CommandResponse::error(&err))?;
            write_frame(&mut stream, &bincode::serialize(&reply)?, &transport).await?;
            return Err(err);
        }
    };

    match frame.kind {
        CallKind::Unary => {
            let reply = server.process_command(&frame.command, None).await?;
            write_frame(&mut stream, &bincode::serialize(&reply)?, &transport).await?;
        }
        CallKind::Stream => {
            let (tx, mut rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
            let producer = server.clone();
            let command = frame.command;
            tokio::spawn(async move {
                if let Err(err) = producer.stream_command(&command, None, tx).await {
                    debug!(error = %err, "stream producer stopped");
                }
            });
            while let Some(reply) = rx.recv().await {
                write_frame(&mut stream, &bincode::serialize(&reply)?, &transport).await?;
            }
        }
    }
    stream.shutdown().await?;
    Ok(())
}
