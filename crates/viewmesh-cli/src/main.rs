//! viewmesh operator CLI
//!
//! Signs commands with a local Ed25519 key and sends them to a node's
//! command endpoint; `viewmesh node` runs the endpoint itself.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

mod commands;
mod config;

use commands::{finality, keygen, node, view};
use config::CliConfig;

#[derive(Parser)]
#[command(name = "viewmesh")]
#[command(about = "viewmesh - run views and query transaction finality on a node", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file path
    #[arg(short, long, global = true, default_value = ".viewmesh/config.toml")]
    config: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate an Ed25519 signing key
    Keygen {
        /// Where to write the hex-encoded secret key
        #[arg(short, long, default_value = ".viewmesh/signing.key")]
        out: PathBuf,

        /// Overwrite an existing key
        #[arg(long)]
        force: bool,
    },

    /// Run a view to completion
    CallView {
        /// Factory id
        fid: String,

        /// View input
        #[arg(short, long, default_value = "")]
        input: String,
    },

    /// Start a view in the background and print its context id
    InitiateView {
        /// Factory id
        fid: String,

        /// View input
        #[arg(short, long, default_value = "")]
        input: String,
    },

    /// Show the status of a started view
    TrackView {
        /// Context id printed by `initiate-view`
        cid: String,
    },

    /// Check whether a transaction is final
    IsTxFinal {
        /// Transaction id
        txid: String,
    },

    /// Follow finality of the transaction with the given SHA-256 digest
    IsHashFinal {
        /// Hex-encoded digest
        hash: String,
    },

    /// Serve the command endpoint until interrupted
    Node,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    dispatch(cli.command, &cli.config).await
}

/// Run `command`; only commands that talk to a node read the config file
async fn dispatch(command: Commands, config_path: &Path) -> Result<()> {
    let config = || CliConfig::load(config_path);
    match command {
        Commands::Keygen { out, force } => keygen::run(&out, force),
        Commands::CallView { fid, input } => view::call(&config()?.client()?, &fid, &input).await,
        Commands::InitiateView { fid, input } => {
            view::initiate(&config()?.client()?, &fid, &input).await
        }
        Commands::TrackView { cid } => view::track(&config()?.client()?, &cid).await,
        Commands::IsTxFinal { txid } => finality::tx(&config()?.client()?, &txid).await,
        Commands::IsHashFinal { hash } => finality::hash(&config()?.client()?, &hash).await,
        Commands::Node => {
            let config = config()?;
            config.node.validate()?;
            let signer = config.signer()?;
            node::run(config.node, signer).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_keygen_does_not_read_config() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("config.toml");
        std::fs::write(&config, "client = 7").unwrap();
        let out = dir.path().join("signing.key");

        dispatch(
            Commands::Keygen {
                out: out.clone(),
                force: false,
            },
            &config,
        )
        .await
        .unwrap();
        assert!(out.exists());

        let err = dispatch(Commands::TrackView { cid: "c1".into() }, &config)
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("config.toml"));
    }
}
