//! The balance ledger built atop the Merkle store (component D).
//!
//! Balances are arbitrary-precision unsigned integers, stored as their
//! minimal big-endian encoding (zero is a single `0x00` byte) under the
//! address as key. `transfer` deliberately performs two independent
//! read-modify-write passes rather than computing both new balances up
//! front, so a transfer to oneself nets to a no-op value-wise while
//! still reporting success.

use num_bigint::BigUint;

use crate::error::LedgerError;
use crate::merkle::MerkleStore;

const LAST_CHECKED_BLOCK_KEY: &[u8] = b"lastCheckedBlock";
const BLOCK_ROOT_HASH_PREFIX: &str = "blockRootHash_";

/// Encodes a balance as its minimal big-endian representation.
fn encode_balance(value: &BigUint) -> Vec<u8> {
    if value == &BigUint::from(0u32) {
        vec![0u8]
    } else {
        value.to_bytes_be()
    }
}

fn decode_balance(bytes: &[u8]) -> BigUint {
    BigUint::from_bytes_be(bytes)
}

/// Wraps a [`MerkleStore`] with ledger-specific key conventions.
pub struct Ledger {
    store: MerkleStore,
}

impl Ledger {
    pub fn new(store: MerkleStore) -> Self {
        Self { store }
    }

    pub fn into_store(self) -> MerkleStore {
        self.store
    }

    pub fn store(&self) -> &MerkleStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut MerkleStore {
        &mut self.store
    }

    /// Zero if `address` has never been credited.
    pub fn get_balance(&self, address: &[u8]) -> Result<BigUint, LedgerError> {
        match self.store.get(address)? {
            Some(bytes) => Ok(decode_balance(&bytes)),
            None => Ok(BigUint::from(0u32)),
        }
    }

    pub fn set_balance(&mut self, address: &[u8], value: &BigUint) -> Result<(), LedgerError> {
        self.store.put(address, &encode_balance(value))?;
        Ok(())
    }

    /// Moves `amount` from `from` to `to`. Reads and writes `from` first,
    /// then independently reads and writes `to` — a transfer to oneself
    /// is therefore a value no-op, matching the reference ledger.
    pub fn transfer(&mut self, from: &[u8], to: &[u8], amount: &BigUint) -> Result<bool, LedgerError> {
        let from_balance = self.get_balance(from)?;
        if from_balance < *amount {
            return Ok(false);
        }
        self.set_balance(from, &(from_balance - amount))?;

        let to_balance = self.get_balance(to)?;
        self.set_balance(to, &(to_balance + amount))?;

        Ok(true)
    }

    pub fn get_last_checked_block(&self) -> Result<u64, LedgerError> {
        match self.store.get(LAST_CHECKED_BLOCK_KEY)? {
            Some(bytes) if bytes.len() == 8 => Ok(u64::from_be_bytes(bytes.try_into().unwrap())),
            _ => Ok(0),
        }
    }

    pub fn set_last_checked_block(&mut self, block: u64) -> Result<(), LedgerError> {
        self.store
            .put(LAST_CHECKED_BLOCK_KEY, &block.to_be_bytes())?;
        Ok(())
    }

    fn block_root_hash_key(block: u64) -> Vec<u8> {
        format!("{BLOCK_ROOT_HASH_PREFIX}{block}").into_bytes()
    }

    pub fn get_block_root_hash(&self, block: u64) -> Result<Option<Vec<u8>>, LedgerError> {
        Ok(self.store.get(&Self::block_root_hash_key(block))?)
    }

    /// Records the tree's current root hash against `block`.
    pub fn set_block_root_hash(&mut self, block: u64) -> Result<(), LedgerError> {
        let root = self.store.root().map(|h| h.to_vec()).unwrap_or_default();
        self.store.put(&Self::block_root_hash_key(block), &root)?;
        Ok(())
    }

    pub fn root_hash(&self) -> Option<[u8; 32]> {
        self.store.root()
    }

    pub fn flush(&mut self) -> Result<(), LedgerError> {
        self.store.flush()?;
        Ok(())
    }

    pub fn revert_unsaved(&mut self) -> Result<(), LedgerError> {
        self.store.revert()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tempfile::TempDir;

    fn unique_name() -> String {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        format!("ledger-test-{}", COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    fn open_ledger() -> (Ledger, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = MerkleStore::open_in(dir.path(), &unique_name()).unwrap();
        (Ledger::new(store), dir)
    }

    #[test]
    fn unset_balance_is_zero() {
        let (ledger, _dir) = open_ledger();
        assert_eq!(ledger.get_balance(b"alice").unwrap(), BigUint::from(0u32));
    }

    #[test]
    fn set_then_get_roundtrips() {
        let (mut ledger, _dir) = open_ledger();
        ledger.set_balance(b"alice", &BigUint::from(1_000_000_000_000u64)).unwrap();
        assert_eq!(
            ledger.get_balance(b"alice").unwrap(),
            BigUint::from(1_000_000_000_000u64)
        );
    }

    #[test]
    fn transfer_moves_value_between_accounts() {
        let (mut ledger, _dir) = open_ledger();
        ledger.set_balance(b"alice", &BigUint::from(100u32)).unwrap();
        ledger.set_balance(b"bob", &BigUint::from(0u32)).unwrap();

        let ok = ledger.transfer(b"alice", b"bob", &BigUint::from(30u32)).unwrap();
        assert!(ok);
        assert_eq!(ledger.get_balance(b"alice").unwrap(), BigUint::from(70u32));
        assert_eq!(ledger.get_balance(b"bob").unwrap(), BigUint::from(30u32));
    }

    #[test]
    fn transfer_with_insufficient_balance_fails_and_is_noop() {
        let (mut ledger, _dir) = open_ledger();
        ledger.set_balance(b"alice", &BigUint::from(10u32)).unwrap();

        let ok = ledger.transfer(b"alice", b"bob", &BigUint::from(50u32)).unwrap();
        assert!(!ok);
        assert_eq!(ledger.get_balance(b"alice").unwrap(), BigUint::from(10u32));
        assert_eq!(ledger.get_balance(b"bob").unwrap(), BigUint::from(0u32));
    }

    #[test]
    fn self_transfer_is_value_noop_but_reports_success() {
        let (mut ledger, _dir) = open_ledger();
        ledger.set_balance(b"alice", &BigUint::from(100u32)).unwrap();

        let ok = ledger.transfer(b"alice", b"alice", &BigUint::from(40u32)).unwrap();
        assert!(ok);
        assert_eq!(ledger.get_balance(b"alice").unwrap(), BigUint::from(100u32));
    }

    #[test]
    fn last_checked_block_defaults_to_zero_and_roundtrips() {
        let (mut ledger, _dir) = open_ledger();
        assert_eq!(ledger.get_last_checked_block().unwrap(), 0);
        ledger.set_last_checked_block(42).unwrap();
        assert_eq!(ledger.get_last_checked_block().unwrap(), 42);
    }

    #[test]
    fn block_root_hash_roundtrips_per_block() {
        let (mut ledger, _dir) = open_ledger();
        ledger.set_balance(b"alice", &BigUint::from(1u32)).unwrap();
        let root_before = ledger.root_hash().unwrap();
        ledger.set_block_root_hash(7).unwrap();

        let stored = ledger.get_block_root_hash(7).unwrap().unwrap();
        assert_eq!(stored, root_before.to_vec());
        assert_eq!(ledger.get_block_root_hash(8).unwrap(), None);
    }

    #[test]
    fn zero_balance_encodes_as_single_zero_byte() {
        assert_eq!(encode_balance(&BigUint::from(0u32)), vec![0u8]);
    }
}
