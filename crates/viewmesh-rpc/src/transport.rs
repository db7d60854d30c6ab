//! Connections between a client and a command server
//!
//! [`ViewServiceClient`] opens one [`ViewConnection`] per call. The TCP
//! implementation writes u32 big-endian length-prefixed bincode frames: the
//! client sends one [`RequestFrame`], then reads either one response (unary)
//! or responses until the server closes the connection (stream).
//! [`LocalViewServiceClient`] skips the socket and calls a [`ViewServer`]
//! in-process.

use crate::config::TransportConfig;
use crate::protocol::{CallKind, RequestFrame, SignedCommand, SignedCommandResponse};
use crate::server::ViewServer;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::debug;
use viewmesh_core::{sha256, Result, ViewMeshError};

/// Opens connections to one command server
#[async_trait]
pub trait ViewServiceClient: Send + Sync {
    /// Open a fresh connection
    async fn connect(&self) -> Result<Box<dyn ViewConnection>>;

    /// DER client certificate presented on connections, if any
    fn certificate(&self) -> Option<&[u8]>;
}

/// A connection good for exactly one call
#[async_trait]
pub trait ViewConnection: Send {
    /// Send `command` and wait for its single response
    async fn process_command(self: Box<Self>, command: SignedCommand)
        -> Result<SignedCommandResponse>;

    /// Send `command` and return the stream of responses
    async fn stream_command(self: Box<Self>, command: SignedCommand)
        -> Result<Box<dyn CommandStream>>;
}

/// Server-pushed responses of a streaming call
#[async_trait]
pub trait CommandStream: Send {
    /// Next response, or `None` once the server ended the stream
    async fn recv(&mut self) -> Result<Option<SignedCommandResponse>>;
}

/// Write one length-prefixed frame
pub async fn write_frame<W>(writer: &mut W, body: &[u8], config: &TransportConfig) -> Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    if body.len() > config.max_frame_size {
        return Err(ViewMeshError::protocol(format!(
            "frame too large: {} > {}",
            body.len(),
            config.max_frame_size
        )));
    }
    let len = u32::try_from(body.len())
        .map_err(|_| ViewMeshError::protocol("frame length exceeds u32"))?;

    let write = async {
        writer.write_all(&len.to_be_bytes()).await?;
        writer.write_all(body).await?;
        writer.flush().await
    };
    timeout(config.write_timeout(), write)
        .await
        .map_err(|_| ViewMeshError::timeout("frame write timed out"))??;
    Ok(())
}

/// Read one length-prefixed frame; `None` on a clean close between frames
pub async fn read_frame<R>(
    reader: &mut R,
    config: &TransportConfig,
    deadline: Option<Duration>,
) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin + Send,
{
    let read = read_frame_body(reader, config.max_frame_size);
    match deadline {
        Some(deadline) => timeout(deadline, read)
            .await
            .map_err(|_| ViewMeshError::timeout("frame read timed out"))?,
        None => read.await,
    }
}

async fn read_frame_body<R>(reader: &mut R, max_frame_size: usize) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin + Send,
{
    let mut len_bytes = [0u8; 4];
    let mut filled = 0;
    while filled < len_bytes.len() {
        let n = reader.read(&mut len_bytes[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(ViewMeshError::network("connection closed inside frame header"));
        }
        filled += n;
    }

    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > max_frame_size {
        return Err(ViewMeshError::protocol(format!(
            "frame too large: {len} > {max_frame_size}"
        )));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(body))
}

fn decode_response(bytes: &[u8]) -> Result<SignedCommandResponse> {
    bincode::deserialize(bytes)
        .map_err(|e| ViewMeshError::protocol(format!("malformed response frame: {e}")))
}

/// Framed TCP client of a command server
#[derive(Debug, Clone)]
pub struct TcpViewServiceClient {
    address: String,
    config: TransportConfig,
    certificate: Option<Vec<u8>>,
}

impl TcpViewServiceClient {
    /// Client for the server at `address`
    pub fn new(address: impl Into<String>, config: TransportConfig) -> Self {
        Self {
            address: address.into(),
            config,
            certificate: None,
        }
    }

    /// Present `certificate` and bind its hash into commands
    pub fn with_certificate(mut self, certificate: Vec<u8>) -> Self {
        self.certificate = Some(certificate);
        self
    }
}

#[async_trait]
impl ViewServiceClient for TcpViewServiceClient {
    async fn connect(&self) -> Result<Box<dyn ViewConnection>> {
        debug!(address = %self.address, "opening connection");
        let stream = timeout(self.config.connect_timeout(), TcpStream::connect(&self.address))
            .await
            .map_err(|_| ViewMeshError::timeout(format!("connect to [{}] timed out", self.address)))?
            .map_err(|e| ViewMeshError::network(format!("failed creating connection to [{}]: {e}", self.address)))?;
        stream.set_nodelay(true)?;
        Ok(Box::new(TcpViewConnection {
            stream,
            config: self.config.clone(),
        }))
    }

    fn certificate(&self) -> Option<&[u8]> {
        self.certificate.as_deref()
    }
}

struct TcpViewConnection {
    stream: TcpStream,
    config: TransportConfig,
}

impl TcpViewConnection {
    async fn send_request(&mut self, kind: CallKind, command: SignedCommand) -> Result<()> {
        let frame = bincode::serialize(&RequestFrame { kind, command })?;
        write_frame(&mut self.stream, &frame, &self.config).await
    }
}

#[async_trait]
impl ViewConnection for TcpViewConnection {
    async fn process_command(
        self: Box<Self>,
        command: SignedCommand,
    ) -> Result<SignedCommandResponse> {
        let mut conn = *self;
        conn.send_request(CallKind::Unary, command).await?;
        let deadline = Some(conn.config.read_timeout());
        let bytes = read_frame(&mut conn.stream, &conn.config, deadline)
            .await?
            .ok_or_else(|| ViewMeshError::network("connection closed before response"))?;
        decode_response(&bytes)
    }

    async fn stream_command(
        self: Box<Self>,
        command: SignedCommand,
    ) -> Result<Box<dyn CommandStream>> {
        let mut conn = *self;
        conn.send_request(CallKind::Stream, command).await?;
        Ok(Box::new(TcpCommandStream {
            stream: conn.stream,
            config: conn.config,
        }))
    }
}

/// Stream reads wait as long as the server keeps the connection open
struct TcpCommandStream {
    stream: TcpStream,
    config: TransportConfig,
}

#[async_trait]
impl CommandStream for TcpCommandStream {
    async fn recv(&mut self) -> Result<Option<SignedCommandResponse>> {
        match read_frame(&mut self.stream, &self.config, None).await? {
            Some(bytes) => decode_response(&bytes).map(Some),
            None => Ok(None),
        }
    }
}

/// In-process client calling a [`ViewServer`] directly
///
/// When a certificate is configured its hash is reported to the server as
/// the connection's TLS identity.
#[derive(Clone)]
pub struct LocalViewServiceClient {
    server: Arc<ViewServer>,
    certificate: Option<Vec<u8>>,
}

impl LocalViewServiceClient {
    /// Client of `server`
    pub fn new(server: Arc<ViewServer>) -> Self {
        Self {
            server,
            certificate: None,
        }
    }

    /// Present `certificate` on every connection
    pub fn with_certificate(mut self, certificate: Vec<u8>) -> Self {
        self.certificate = Some(certificate);
        self
    }
}

#[async_trait]
impl ViewServiceClient for LocalViewServiceClient {
    async fn connect(&self) -> Result<Box<dyn ViewConnection>> {
        Ok(Box::new(LocalConnection {
            server: self.server.clone(),
            tls_cert_hash: self.certificate.as_deref().map(sha256),
        }))
    }

    fn certificate(&self) -> Option<&[u8]> {
        self.certificate.as_deref()
    }
}

struct LocalConnection {
    server: Arc<ViewServer>,
    tls_cert_hash: Option<Vec<u8>>,
}

#[async_trait]
impl ViewConnection for LocalConnection {
    async fn process_command(
        self: Box<Self>,
        command: SignedCommand,
    ) -> Result<SignedCommandResponse> {
        self.server
            .process_command(&command, self.tls_cert_hash.as_deref())
            .await
    }

    async fn stream_command(
        self: Box<Self>,
        command: SignedCommand,
    ) -> Result<Box<dyn CommandStream>> {
        let (tx, rx) = mpsc::channel(1);
        let LocalConnection {
            server,
            tls_cert_hash,
        } = *self;
        tokio::spawn(async move {
            if let Err(err) = server
                .stream_command(&command, tls_cert_hash.as_deref(), tx)
                .await
            {
                debug!(error = %err, "local stream producer stopped");
            }
        });
        Ok(Box::new(LocalCommandStream { rx }))
    }
}

struct LocalCommandStream {
    rx: mpsc::Receiver<SignedCommandResponse>,
}

#[async_trait]
impl CommandStream for LocalCommandStream {
    async fn recv(&mut self) -> Result<Option<SignedCommandResponse>> {
        Ok(self.rx.recv().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_roundtrip_and_clean_close() {
        let config = TransportConfig::default();
        let (mut client, mut server) = tokio::io::duplex(1024);

        write_frame(&mut client, b"first", &config).await.unwrap();
        write_frame(&mut client, b"", &config).await.unwrap();
        drop(client);

        assert_eq!(read_frame(&mut server, &config, None).await.unwrap().unwrap(), b"first");
        assert_eq!(read_frame(&mut server, &config, None).await.unwrap().unwrap(), b"");
        assert!(read_frame(&mut server, &config, None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_and_truncated_frames_fail() {
        let config = TransportConfig {
            max_frame_size: 4,
            ..TransportConfig::default()
        };
        let (mut client, mut server) = tokio::io::duplex(1024);
        assert!(write_frame(&mut client, b"too long", &config).await.is_err());

        client.write_all(&100u32.to_be_bytes()).await.unwrap();
        assert!(matches!(
            read_frame(&mut server, &config, None).await,
            Err(ViewMeshError::Protocol { .. })
        ));

        let (mut client, mut server) = tokio::io::duplex(1024);
        client.write_all(&[0, 0]).await.unwrap();
        drop(client);
        assert!(matches!(
            read_frame(&mut server, &config, None).await,
            Err(ViewMeshError::Network { .. })
        ));
    }

    #[tokio::test]
    async fn test_read_deadline_is_enforced() {
        let config = TransportConfig::default();
        let (_client, mut server) = tokio::io::duplex(64);
        let err = read_frame(&mut server, &config, Some(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert!(matches!(err, ViewMeshError::Timeout { .. }));
    }
}
