//! viewmesh RPC - signed commands between clients and nodes
//!
//! A client wraps each [`Command`] in a header (timestamp, nonce, creator,
//! optional TLS certificate hash), signs it, and sends it over a
//! [`ViewServiceClient`]. The [`ViewServer`] validates the envelope and hands
//! the command to a [`CommandHandler`]. `IsHashFinal` is answered as a
//! stream of [`HashFinality`] frames; every other command is unary.

#![forbid(unsafe_code)]

/// RPC client
pub mod client;

/// Client, transport, and server settings
pub mod config;

/// Wire types
pub mod protocol;

/// Command validation and dispatch
pub mod server;

/// Command signing and verification
pub mod signing;

/// Framed TCP and in-process transports
pub mod transport;

pub use client::ViewClient;
pub use config::{load_config, ClientConfig, ServerConfig, TransportConfig, DEFAULT_STREAM_BUFFER};
pub use protocol::{
    CallKind, Command, CommandEnvelope, CommandResponse, HashFinality, Header, RequestFrame,
    SignedCommand, SignedCommandResponse, NONCE_LEN,
};
pub use server::{serve_tcp, CommandHandler, ViewServer};
pub use signing::{create_signed_command, now_ms, open_signed_command};
pub use transport::{
    read_frame, write_frame, CommandStream, LocalViewServiceClient, TcpViewServiceClient,
    ViewConnection, ViewServiceClient,
};
