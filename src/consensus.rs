//! Peer root-hash consensus driver (component F).
//!
//! Each peer response is classified Valid / AliveNull / Dead: only Dead
//! (unreachable, timed out, or an unparseable/empty body) shrinks the
//! live peer set and therefore the quorum threshold for the rest of the
//! pass. A peer that answers 200 with a well-formed but disagreeing
//! hash is Valid — it contributes no match but does not shrink quorum
//! either, same as a non-200 (AliveNull) response.

use std::time::Duration;

use reqwest::header::ACCEPT;
use tokio::sync::Mutex;

use crate::hasher::Hash;
use crate::ledger::Ledger;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const POLL_INTERVAL: Duration = Duration::from_secs(5);
const ERROR_BACKOFF: Duration = Duration::from_secs(10);

enum PeerStatus {
    Valid(Hash),
    AliveNull,
    Dead,
}

async fn fetch_peer_root_hash(client: &reqwest::Client, peer: &str, block_number: u64) -> PeerStatus {
    let url = format!("http://{peer}/rootHash?blockNumber={block_number}");

    let response = match client
        .get(&url)
        .timeout(REQUEST_TIMEOUT)
        .header(ACCEPT, "text/plain")
        .send()
        .await
    {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!(peer, block_number, %e, "failed to fetch root hash from peer");
            return PeerStatus::Dead;
        }
    };

    if response.status() != reqwest::StatusCode::OK {
        tracing::warn!(
            peer,
            block_number,
            status = %response.status(),
            "peer returned non-200 for root hash"
        );
        return PeerStatus::AliveNull;
    }

    let text = match response.text().await {
        Ok(t) => t,
        Err(e) => {
            tracing::warn!(peer, block_number, %e, "failed to read peer response body");
            return PeerStatus::Dead;
        }
    };
    let trimmed = text.trim();
    if trimmed.is_empty() {
        tracing::warn!(peer, block_number, "peer returned empty root hash");
        return PeerStatus::Dead;
    }

    match hex::decode(trimmed) {
        Ok(bytes) => match <Hash>::try_from(bytes.as_slice()) {
            Ok(hash) => {
                tracing::debug!(peer, block_number, "fetched root hash from peer");
                PeerStatus::Valid(hash)
            }
            Err(_) => {
                tracing::warn!(peer, block_number, "invalid hash length from peer");
                PeerStatus::Dead
            }
        },
        Err(_) => {
            tracing::warn!(peer, block_number, "invalid hex response from peer");
            PeerStatus::Dead
        }
    }
}

/// Validates the ledger's current root against `peers` for
/// `block_number`, persisting it once a quorum agrees; reverts the
/// unsaved changes for this block otherwise. Returns whether the round
/// committed.
///
/// Takes the lock only twice, never across peer I/O: once to read the
/// local root, once more to commit or revert once the round is decided.
/// This keeps the HTTP server (component G), which locks the same
/// mutex per request, from blocking for the duration of a consensus
/// round.
pub async fn check_root_hash_validity_and_save(
    ledger: &Mutex<Ledger>,
    client: &reqwest::Client,
    block_number: u64,
    peers: &[String],
) -> bool {
    let local_root = {
        let guard = ledger.lock().await;
        match guard.root_hash() {
            Some(h) => h,
            None => {
                tracing::warn!(block_number, "no local root hash available");
                return false;
            }
        }
    };

    let mut active = peers.len() as i64;
    let mut quorum = (active * 2) / 3 + 1;
    let mut matches = 0i64;

    for peer in peers {
        match fetch_peer_root_hash(client, peer, block_number).await {
            PeerStatus::Valid(root) => {
                if root == local_root {
                    matches += 1;
                }
            }
            PeerStatus::AliveNull => {}
            PeerStatus::Dead => {
                if active > 0 {
                    active -= 1;
                    quorum = (active * 2) / 3 + 1;
                }
            }
        }

        if matches >= quorum {
            let mut guard = ledger.lock().await;
            if let Err(e) = guard.set_block_root_hash(block_number) {
                tracing::warn!(block_number, %e, "failed to save validated root hash");
                return false;
            }
            if let Err(e) = guard.flush() {
                tracing::warn!(block_number, %e, "failed to flush validated root hash");
            } else {
                tracing::info!(block_number, "root hash validated and saved");
            }
            return true;
        }
    }

    tracing::warn!(
        block_number,
        matches,
        total = peers.len(),
        "root hash mismatch: quorum not reached"
    );
    let mut guard = ledger.lock().await;
    if let Err(e) = guard.revert_unsaved() {
        tracing::warn!(block_number, %e, "failed to revert unsaved changes");
    }
    false
}

/// Updates the checkpoint and runs consensus for a newly-observed
/// block. On a failed round, rewinds the feed's watermark back to the
/// last committed checkpoint so the feed replays from there. Returns
/// whether the round committed.
pub async fn on_chain_progress(
    ledger: &Mutex<Ledger>,
    client: &reqwest::Client,
    block_number: u64,
    peers: &[String],
    feed: &mut dyn crate::feed::FeedHandle,
) -> bool {
    {
        let mut guard = ledger.lock().await;
        if let Err(e) = guard.set_last_checked_block(block_number) {
            tracing::warn!(block_number, %e, "failed to update checkpoint");
            return false;
        }
    }
    let committed = check_root_hash_validity_and_save(ledger, client, block_number, peers).await;
    if !committed {
        let rewind_to = {
            let guard = ledger.lock().await;
            guard.get_last_checked_block().unwrap_or(block_number)
        };
        feed.set_latest_checked_block(rewind_to);
    }
    tracing::info!(block_number, committed, "checkpoint updated");
    committed
}

/// Polls the feed's watermark every [`POLL_INTERVAL`], driving
/// [`on_chain_progress`] whenever it advances. Backs off to
/// [`ERROR_BACKOFF`] after a failed round, mirroring the reference
/// monitor loop. Locks `ledger` only per critical section (per drained
/// transaction, and inside [`on_chain_progress`]/
/// [`check_root_hash_validity_and_save`]) so the lock is never held
/// across the poll sleep or peer I/O.
pub async fn monitor_blocks(
    ledger: &Mutex<Ledger>,
    client: &reqwest::Client,
    peers: &[String],
    feed: &mut dyn crate::feed::FeedHandle,
) {
    let mut last_checked = {
        let guard = ledger.lock().await;
        guard.get_last_checked_block().unwrap_or(0)
    };
    loop {
        for txn in feed.drain_transactions() {
            let mut guard = ledger.lock().await;
            crate::tx::process_transaction(&mut guard, &txn.data, &txn.sender);
        }

        let current_block = feed.latest_checked_block();
        let next_sleep = if current_block > last_checked {
            let committed = on_chain_progress(ledger, client, current_block, peers, feed).await;
            last_checked = current_block;
            if committed { POLL_INTERVAL } else { ERROR_BACKOFF }
        } else {
            POLL_INTERVAL
        };
        tokio::time::sleep(next_sleep).await;
    }
}
