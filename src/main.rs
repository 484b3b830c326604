use std::sync::Arc;

use clap::Parser;
use num_bigint::BigUint;
use tokio::sync::Mutex;

use merkle_ledger_sync::config::Config;
use merkle_ledger_sync::feed::NullFeedHandle;
use merkle_ledger_sync::http::{self, AppState};
use merkle_ledger_sync::ledger::Ledger;
use merkle_ledger_sync::merkle::MerkleStore;
use merkle_ledger_sync::consensus;

/// Fixture balances seeded into a fresh store, mirroring the reference
/// deployment's four-address genesis allocation.
const INITIAL_BALANCES: &[(&str, u64)] = &[
    ("c767ea1d613eefe0ce1610b18cb047881bafb829", 1_000_000_000_000),
    ("3b4412f57828d1ceb0dbf0d460f7eb1f21fed8b4", 1_000_000_000_000),
    ("9282d39ca205806473f4fde5bac48ca6dfb9d300", 1_000_000_000_000),
    ("e68191b7913e72e6f1759531fbfaa089ff02308a", 1_000_000_000_000),
];

fn init_initial_balances(ledger: &mut Ledger) -> anyhow::Result<()> {
    if ledger.get_last_checked_block()? != 0 {
        return Ok(());
    }
    tracing::info!("setting up initial balances for fresh database");
    for (address_hex, balance) in INITIAL_BALANCES {
        let address = hex::decode(address_hex)?;
        ledger.set_balance(&address, &BigUint::from(*balance))?;
        tracing::info!(address = address_hex, balance, "set initial balance");
    }
    ledger.flush()?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Config::parse();
    tracing::info!(peers = ?config.peers, "starting PWR VIDA transaction synchronizer");

    let store = MerkleStore::open("database")?;
    let ledger = Arc::new(Mutex::new(Ledger::new(store)));

    {
        let mut ledger = ledger.lock().await;
        init_initial_balances(&mut ledger)?;
    }

    let app_state = AppState {
        ledger: ledger.clone(),
    };
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    tracing::info!(port = config.port, "root-hash HTTP server listening");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, http::router(app_state)).await {
            tracing::error!(%e, "http server error");
        }
    });

    let from_block = {
        let ledger = ledger.lock().await;
        let last_checked = ledger.get_last_checked_block()?;
        last_checked.max(config.start_block)
    };
    tracing::info!(from_block, "starting synchronization");

    let client = reqwest::Client::new();
    let peers = config.peers.clone();
    let mut feed = NullFeedHandle::new(from_block);

    tokio::select! {
        _ = consensus::monitor_blocks(&ledger, &client, &peers, &mut feed) => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    let mut ledger = ledger.lock().await;
    ledger.flush()?;
    Ok(())
}
