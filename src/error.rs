use thiserror::Error;

/// Errors surfaced by the LMDB-backed key-value layer (component B).
#[derive(Debug, Error)]
pub enum KvError {
    #[error("lmdb error: {0}")]
    Lmdb(#[from] lmdb::Error),
    #[error("serialization error: {0}")]
    Encoding(#[from] bincode::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by the Merkle store (component C).
#[derive(Debug, Error)]
pub enum MerkleError {
    #[error("key and value must be non-empty")]
    BadArgument,
    #[error("store is closed")]
    Closed,
    #[error("tree '{0}' is already open")]
    AlreadyOpen(String),
    #[error(transparent)]
    Database(#[from] KvError),
    #[error("corrupt tree state: {0}")]
    Corrupt(String),
}

/// Errors surfaced by the ledger service (component D).
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error(transparent)]
    Database(#[from] MerkleError),
}
