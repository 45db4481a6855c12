//! Command-line interface definitions and parsing

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    pub config: Option<String>,

    /// Peer address (aa:bb:cc:dd:ee:ff)
    #[arg(short, long)]
    pub peer: Option<String>,

    /// Peer advertised name
    #[arg(short, long)]
    pub name: Option<String>,

    /// Management protocol (nmp or omp)
    #[arg(long)]
    pub proto: Option<String>,

    /// Number of connection attempts
    #[arg(long)]
    pub conn_tries: Option<u32>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Open a session, report the link parameters and close it
    Probe,
    /// Send one raw management request and print the response
    Send {
        /// Request bytes (hex format)
        request: String,
        /// Response timeout in milliseconds
        #[arg(short, long)]
        timeout_ms: Option<u64>,
        /// Attempts before giving up on timeouts
        #[arg(long)]
        tries: Option<u32>,
    },
    /// Print the effective configuration as TOML
    Config,
}
