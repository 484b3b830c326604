//! Transaction decoding and the transfer action handler (component E).
//!
//! Every transaction payload arrives as a hex string. Decoding,
//! UTF-8 validation, JSON parsing and action dispatch all fail closed:
//! any malformed input is logged and dropped rather than propagated,
//! since a single bad transaction must never take down the sync loop.

use num_bigint::BigUint;
use serde_json::Value;

use crate::ledger::Ledger;

fn strip_0x(s: &str) -> &str {
    s.strip_prefix("0x").unwrap_or(s)
}

/// Applies a `transfer` action described by `json` to `ledger`, moving
/// funds from `sender_hex` to whatever `receiver` the payload names.
fn handle_transfer(ledger: &mut Ledger, json: &Value, sender_hex: &str) {
    let amount = json
        .get("amount")
        .and_then(|v| {
            if let Some(n) = v.as_u64() {
                Some(BigUint::from(n))
            } else {
                v.as_str().and_then(|s| s.parse::<BigUint>().ok())
            }
        })
        .unwrap_or_else(|| BigUint::from(0u32));
    let receiver_hex = json.get("receiver").and_then(|v| v.as_str()).unwrap_or("");

    if amount == BigUint::from(0u32) || receiver_hex.is_empty() {
        tracing::warn!(?json, "invalid transfer data");
        return;
    }

    let sender_address = match hex::decode(strip_0x(sender_hex)) {
        Ok(b) => b,
        Err(e) => {
            tracing::warn!(sender_hex, %e, "error handling transfer");
            return;
        }
    };
    let receiver_address = match hex::decode(strip_0x(receiver_hex)) {
        Ok(b) => b,
        Err(e) => {
            tracing::warn!(receiver_hex, %e, "error handling transfer");
            return;
        }
    };

    match ledger.transfer(&sender_address, &receiver_address, &amount) {
        Ok(true) => tracing::info!(
            amount = %amount,
            from = sender_hex,
            to = receiver_hex,
            "transfer succeeded"
        ),
        Ok(false) => tracing::info!(
            amount = %amount,
            from = sender_hex,
            to = receiver_hex,
            "transfer failed: insufficient funds"
        ),
        Err(e) => tracing::warn!(%e, "error handling transfer"),
    }
}

/// Decodes and dispatches a single VIDA transaction. `data_hex` is the
/// raw hex-encoded payload; `sender_hex` is the transaction's sender
/// address, already hex-formatted by the feed client.
pub fn process_transaction(ledger: &mut Ledger, data_hex: &str, sender_hex: &str) {
    tracing::debug!(data_hex, "transaction received");

    let data_bytes = match hex::decode(data_hex) {
        Ok(b) => b,
        Err(e) => {
            tracing::warn!(%e, "error processing transaction");
            return;
        }
    };
    let data_str = match std::str::from_utf8(&data_bytes) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(%e, "error processing transaction");
            return;
        }
    };
    let json: Value = match serde_json::from_str(data_str) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(%e, "error processing transaction");
            return;
        }
    };

    let action = json.get("action").and_then(|v| v.as_str()).unwrap_or("");
    if action.eq_ignore_ascii_case("transfer") {
        handle_transfer(ledger, &json, sender_hex);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tempfile::TempDir;

    fn unique_name() -> String {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        format!("tx-test-{}", COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    fn open_ledger() -> (Ledger, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = crate::merkle::MerkleStore::open_in(dir.path(), &unique_name()).unwrap();
        (Ledger::new(store), dir)
    }

    fn hex_payload(json: &str) -> String {
        hex::encode(json.as_bytes())
    }

    #[test]
    fn valid_transfer_moves_funds() {
        let (mut ledger, _dir) = open_ledger();
        let sender = "c767ea1d613eefe0ce1610b18cb047881bafb829";
        let receiver = "3b4412f57828d1ceb0dbf0d460f7eb1f21fed8b4";
        ledger
            .set_balance(&hex::decode(sender).unwrap(), &BigUint::from(100u32))
            .unwrap();

        let payload = hex_payload(&format!(
            r#"{{"action":"Transfer","amount":40,"receiver":"0x{receiver}"}}"#
        ));
        process_transaction(&mut ledger, &payload, sender);

        assert_eq!(
            ledger.get_balance(&hex::decode(sender).unwrap()).unwrap(),
            BigUint::from(60u32)
        );
        assert_eq!(
            ledger.get_balance(&hex::decode(receiver).unwrap()).unwrap(),
            BigUint::from(40u32)
        );
    }

    #[test]
    fn unknown_action_is_ignored() {
        let (mut ledger, _dir) = open_ledger();
        let payload = hex_payload(r#"{"action":"mint","amount":5,"receiver":"ab"}"#);
        process_transaction(&mut ledger, &payload, "00");
        assert_eq!(ledger.get_balance(b"\xab").unwrap(), BigUint::from(0u32));
    }

    #[test]
    fn malformed_hex_is_dropped_not_panicking() {
        let (mut ledger, _dir) = open_ledger();
        process_transaction(&mut ledger, "not-hex", "00");
    }

    #[test]
    fn invalid_utf8_is_dropped() {
        let (mut ledger, _dir) = open_ledger();
        process_transaction(&mut ledger, "ff", "00");
    }

    #[test]
    fn invalid_json_is_dropped() {
        let (mut ledger, _dir) = open_ledger();
        let payload = hex::encode(b"not json");
        process_transaction(&mut ledger, &payload, "00");
    }

    #[test]
    fn zero_amount_is_rejected() {
        let (mut ledger, _dir) = open_ledger();
        let sender = "c767ea1d613eefe0ce1610b18cb047881bafb829";
        ledger
            .set_balance(&hex::decode(sender).unwrap(), &BigUint::from(100u32))
            .unwrap();
        let payload = hex_payload(r#"{"action":"transfer","amount":0,"receiver":"ab"}"#);
        process_transaction(&mut ledger, &payload, sender);
        assert_eq!(
            ledger.get_balance(&hex::decode(sender).unwrap()).unwrap(),
            BigUint::from(100u32)
        );
    }
}
