//! Command-line configuration surface (ambient, component H).

use clap::Parser;

pub const DEFAULT_VIDA_ID: u64 = 73_746_238;
pub const DEFAULT_RPC_URL: &str = "https://pwrrpc.pwrlabs.io/";
pub const DEFAULT_START_BLOCK: u64 = 1;
pub const DEFAULT_PORT: u16 = 8080;

/// PWR VIDA transaction synchronizer.
#[derive(Debug, Parser)]
#[command(name = "merkle-ledger-sync", about = "Merkle-backed ledger sync node")]
pub struct Config {
    /// Peers to cross-check root hashes with, as `host:port`. Defaults
    /// to this node's own address when none are given.
    #[arg(default_values_t = [format!("localhost:{DEFAULT_PORT}")])]
    pub peers: Vec<String>,

    /// Port the root-hash HTTP server listens on.
    #[arg(long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// RPC endpoint of the chain node supplying the transaction feed.
    #[arg(long, default_value = DEFAULT_RPC_URL)]
    pub rpc_url: String,

    /// VIDA id to subscribe to.
    #[arg(long, default_value_t = DEFAULT_VIDA_ID)]
    pub vida_id: u64,

    /// Block to start synchronizing from when no checkpoint exists yet.
    #[arg(long, default_value_t = DEFAULT_START_BLOCK)]
    pub start_block: u64,
}
