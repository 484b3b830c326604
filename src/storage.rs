//! LMDB-backed key-value layer (component B).
//!
//! Three logical namespaces share one LMDB environment: `metadata`
//! (tree bookkeeping), `nodes` (hash-keyed Merkle node records) and
//! `keydata` (the user key -> value mapping). Every `get`/`put`/`delete`
//! is its own atomic LMDB transaction; batching across calls is the
//! Merkle store's responsibility.

use lmdb::{Cursor, Database, DatabaseFlags, Environment, EnvironmentFlags, Transaction, WriteFlags};
use std::path::Path;

use crate::error::KvError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
    Metadata,
    Nodes,
    Keydata,
}

#[derive(Debug)]
pub struct LmdbKv {
    env: Environment,
    metadata_db: Database,
    nodes_db: Database,
    keydata_db: Database,
}

impl LmdbKv {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, KvError> {
        std::fs::create_dir_all(path.as_ref())?;

        let env = Environment::new()
            .set_flags(EnvironmentFlags::empty())
            .set_max_dbs(3)
            .set_map_size(1024 * 1024 * 1024)
            .open(path.as_ref())?;

        let metadata_db = env.create_db(Some("metadata"), DatabaseFlags::empty())?;
        let nodes_db = env.create_db(Some("nodes"), DatabaseFlags::empty())?;
        let keydata_db = env.create_db(Some("keydata"), DatabaseFlags::empty())?;

        Ok(Self {
            env,
            metadata_db,
            nodes_db,
            keydata_db,
        })
    }

    fn db(&self, ns: Namespace) -> Database {
        match ns {
            Namespace::Metadata => self.metadata_db,
            Namespace::Nodes => self.nodes_db,
            Namespace::Keydata => self.keydata_db,
        }
    }

    pub fn get(&self, ns: Namespace, key: &[u8]) -> Result<Option<Vec<u8>>, KvError> {
        let txn = self.env.begin_ro_txn()?;
        match txn.get(self.db(ns), &key) {
            Ok(data) => Ok(Some(data.to_vec())),
            Err(lmdb::Error::NotFound) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn put(&self, ns: Namespace, key: &[u8], value: &[u8]) -> Result<(), KvError> {
        let mut txn = self.env.begin_rw_txn()?;
        txn.put(self.db(ns), &key, &value, WriteFlags::empty())?;
        txn.commit()?;
        Ok(())
    }

    pub fn delete(&self, ns: Namespace, key: &[u8]) -> Result<(), KvError> {
        let mut txn = self.env.begin_rw_txn()?;
        match txn.del(self.db(ns), &key, None) {
            Ok(()) | Err(lmdb::Error::NotFound) => {}
            Err(e) => return Err(e.into()),
        }
        txn.commit()?;
        Ok(())
    }

    pub fn iter_keys(&self, ns: Namespace) -> Result<Vec<Vec<u8>>, KvError> {
        let txn = self.env.begin_ro_txn()?;
        let mut cursor = txn.open_ro_cursor(self.db(ns))?;
        Ok(cursor.iter().map(|(k, _)| k.to_vec()).collect())
    }

    pub fn clear_all(&self) -> Result<(), KvError> {
        let mut txn = self.env.begin_rw_txn()?;
        txn.clear_db(self.metadata_db)?;
        txn.clear_db(self.nodes_db)?;
        txn.clear_db(self.keydata_db)?;
        txn.commit()?;
        Ok(())
    }
}
