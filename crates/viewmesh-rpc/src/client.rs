//! RPC client of a node's command endpoint

use crate::config::{ClientConfig, DEFAULT_STREAM_BUFFER};
use crate::protocol::{Command, CommandResponse, HashFinality, SignedCommand};
use crate::signing::create_signed_command;
use crate::transport::{TcpViewServiceClient, ViewServiceClient};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};
use viewmesh_core::{sha256, Result, SigningIdentity, ViewMeshError};

/// Signs commands and sends them to one node
///
/// Every call builds a fresh signed command and opens a fresh connection.
#[derive(Clone)]
pub struct ViewClient {
    address: String,
    service: Arc<dyn ViewServiceClient>,
    signer: Arc<dyn SigningIdentity>,
    stream_buffer: usize,
}

impl ViewClient {
    /// Client over an arbitrary transport; `address` is only used in messages
    pub fn new(
        address: impl Into<String>,
        service: Arc<dyn ViewServiceClient>,
        signer: Arc<dyn SigningIdentity>,
    ) -> Self {
        Self {
            address: address.into(),
            service,
            signer,
            stream_buffer: DEFAULT_STREAM_BUFFER,
        }
    }

    /// Framed TCP client built from `config`
    pub fn from_config(config: &ClientConfig, signer: Arc<dyn SigningIdentity>) -> Result<Self> {
        config.validate()?;
        let mut service = TcpViewServiceClient::new(config.address.clone(), config.transport());
        if let Some(certificate) = config.load_certificate()? {
            service = service.with_certificate(certificate);
        }
        Ok(Self::new(config.address.clone(), Arc::new(service), signer)
            .with_stream_buffer(config.stream_buffer))
    }

    /// Capacity of the queue returned by [`ViewClient::is_hash_final`]
    pub fn with_stream_buffer(mut self, capacity: usize) -> Self {
        self.stream_buffer = capacity.max(1);
        self
    }

    /// Sign `command` with a fresh header
    pub fn create_signed_command(&self, command: Command) -> Result<SignedCommand> {
        let tls_cert_hash = self.service.certificate().map(sha256);
        create_signed_command(command, self.signer.as_ref(), tls_cert_hash)
    }

    /// Run view `fid` on the node and return its output
    pub async fn call_view(&self, fid: &str, input: &[u8]) -> Result<Vec<u8>> {
        debug!(fid = %fid, address = %self.address, "calling view");
        let what = format!("[{fid},{}]", String::from_utf8_lossy(input));
        let signed = self
            .create_signed_command(Command::CallView {
                fid: fid.to_string(),
                input: input.to_vec(),
            })
            .map_err(|e| e.context(format!("failed creating signed command for {what}")))?;
        match self
            .process_command(signed)
            .await
            .map_err(|e| e.context(format!("failed process command for {what}")))?
        {
            CommandResponse::CallView { result } => Ok(result),
            other => Err(unexpected("CallView", &other)),
        }
    }

    /// Start view `fid` on the node and return the context id to track it by
    pub async fn initiate_view(&self, fid: &str, input: &[u8]) -> Result<String> {
        let signed = self.create_signed_command(Command::InitiateView {
            fid: fid.to_string(),
            input: input.to_vec(),
        })?;
        match self
            .process_command(signed)
            .await
            .map_err(|e| e.context(format!("failed initiating view [{fid}]")))?
        {
            CommandResponse::InitiateView { cid } => Ok(cid),
            other => Err(unexpected("InitiateView", &other)),
        }
    }

    /// Status payload of a view started with [`ViewClient::initiate_view`]
    pub async fn track_view(&self, cid: &str) -> Result<Vec<u8>> {
        let signed = self.create_signed_command(Command::TrackView {
            cid: cid.to_string(),
        })?;
        match self
            .process_command(signed)
            .await
            .map_err(|e| e.context(format!("failed tracking view [{cid}]")))?
        {
            CommandResponse::TrackView { payload } => Ok(payload),
            other => Err(unexpected("TrackView", &other)),
        }
    }

    /// Succeeds when the node reports `txid` final; otherwise fails with its reason
    pub async fn is_tx_final(&self, txid: &str) -> Result<()> {
        debug!(txid = %txid, address = %self.address, "asking for transaction finality");
        let what = format!("tx [{txid}] at [{}]", self.address);
        let signed = self
            .create_signed_command(Command::IsTxFinal {
                txid: txid.to_string(),
            })
            .map_err(|e| {
                e.context(format!(
                    "failed creating signed command to ask for finality of {what}"
                ))
            })?;
        let response = self.process_command(signed).await.map_err(|e| {
            error!(txid = %txid, error = %e, "finality query failed");
            e.context(format!("failed process command to ask for finality of {what}"))
        })?;

        let CommandResponse::IsTxFinal { payload } = response else {
            return Err(unexpected("IsTxFinal", &response));
        };
        debug!(txid = %txid, payload = %String::from_utf8_lossy(&payload), "finality answer");
        if payload.is_empty() {
            Ok(())
        } else {
            Err(ViewMeshError::invalid(String::from_utf8_lossy(&payload)))
        }
    }

    /// Subscribe to finality of the transaction whose digest is `hash`
    ///
    /// Frames are delivered through a bounded queue. A slow consumer stalls
    /// the stream instead of growing memory. The queue closes once, when
    /// the server ends the stream or a frame cannot be read.
    pub async fn is_hash_final(&self, hash: &[u8]) -> Result<mpsc::Receiver<HashFinality>> {
        let hash_hex = hex::encode(hash);
        let what = format!("hash [{hash_hex}] at [{}]", self.address);
        let signed = self
            .create_signed_command(Command::IsHashFinal {
                hash: hash.to_vec(),
            })
            .map_err(|e| {
                e.context(format!(
                    "failed creating signed command to ask for finality of {what}"
                ))
            })?;

        let mut stream = self
            .service
            .connect()
            .await
            .map_err(|e| e.context("[stream] failed creating view client"))?
            .stream_command(signed)
            .await
            .map_err(|e| e.context(format!("failed stream command to ask for finality of {what}")))?;

        let (tx, rx) = mpsc::channel(self.stream_buffer);
        tokio::spawn(async move {
            loop {
                let frame = match stream.recv().await {
                    Ok(Some(frame)) => frame,
                    Ok(None) => {
                        warn!(hash = %hash_hex, "is hash final, stream EOF");
                        break;
                    }
                    Err(err) => {
                        error!(hash = %hash_hex, error = %err, "is hash final, stream failed");
                        break;
                    }
                };
                match frame.decode() {
                    Ok(CommandResponse::IsHashFinal(finality)) => {
                        debug!(hash = %hash_hex, belief = finality.belief, is_final = finality.is_final, "is hash final, got frame");
                        if tx.send(finality).await.is_err() {
                            debug!(hash = %hash_hex, "is hash final, receiver dropped");
                            break;
                        }
                    }
                    Ok(CommandResponse::Err { message }) => {
                        error!(hash = %hash_hex, "is hash final, error from view during process command [{message}]");
                        break;
                    }
                    Ok(other) => {
                        error!(hash = %hash_hex, response = other.name(), "is hash final, unexpected response");
                        break;
                    }
                    Err(err) => {
                        error!(hash = %hash_hex, error = %err, "is hash final, bad frame");
                        break;
                    }
                }
            }
        });
        Ok(rx)
    }

    async fn process_command(&self, signed: SignedCommand) -> Result<CommandResponse> {
        let connection = self.service.connect().await.map_err(|e| {
            error!(address = %self.address, error = %e, "failed creating view client");
            e.context("failed creating view client")
        })?;
        let response = connection
            .process_command(signed)
            .await
            .map_err(|e| e.context("failed view client process command"))?
            .decode()?;
        if let CommandResponse::Err { message } = &response {
            error!(address = %self.address, "error from view during process command: {message}");
            return Err(ViewMeshError::protocol(format!(
                "error from view during process command: {message}"
            )));
        }
        Ok(response)
    }
}

fn unexpected(expected: &str, got: &CommandResponse) -> ViewMeshError {
    ViewMeshError::protocol(format!(
        "expected {expected} response, got {}",
        got.name()
    ))
}
