//! The incrementally-maintained Merkle tree (component C).
//!
//! Mirrors the hanging-node algorithm of the Python `MerkleTree`
//! reference this crate is derived from: leaves and internal nodes are
//! kept in a hash-keyed cache, dirty until `flush`, with a per-level
//! "hanging node" map tracking whichever node at that level is still
//! waiting for a sibling.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

use serde::{Deserialize, Serialize};

use crate::error::{KvError, MerkleError};
use crate::hasher::{self, Hash};
use crate::storage::{LmdbKv, Namespace};

const KEY_ROOT_HASH: &[u8] = b"rootHash";
const KEY_NUM_LEAVES: &[u8] = b"numLeaves";
const KEY_DEPTH: &[u8] = b"depth";
const KEY_HANGING_NODE_PREFIX: &str = "hangingNode";

fn registry() -> &'static Mutex<HashSet<String>> {
    static REGISTRY: OnceLock<Mutex<HashSet<String>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashSet::new()))
}

/// A single node in the tree, identified by its own hash (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub hash: Hash,
    pub left: Option<Hash>,
    pub right: Option<Hash>,
    pub parent: Option<Hash>,
    pub stale_hash: Option<Hash>,
}

impl Node {
    fn new_leaf(hash: Hash) -> Self {
        Self {
            hash,
            left: None,
            right: None,
            parent: None,
            stale_hash: None,
        }
    }

    /// Builds an internal node from its children, auto-computing its hash.
    /// At least one side must be present.
    fn new_internal(left: Option<Hash>, right: Option<Hash>) -> Result<Self, MerkleError> {
        let hash = Self::calculate_hash(left, right)?;
        Ok(Self {
            hash,
            left,
            right,
            parent: None,
            stale_hash: None,
        })
    }

    fn calculate_hash(left: Option<Hash>, right: Option<Hash>) -> Result<Hash, MerkleError> {
        match (left, right) {
            (None, None) => Err(MerkleError::Corrupt(
                "cannot calculate hash with no children".into(),
            )),
            (Some(l), Some(r)) => Ok(hasher::hash2(&l, &r)),
            (Some(s), None) | (None, Some(s)) => Ok(hasher::hash2(&s, &s)),
        }
    }

    fn recomputed_hash(&self) -> Result<Hash, MerkleError> {
        Self::calculate_hash(self.left, self.right)
    }

    fn is_leaf(&self) -> bool {
        self.left.is_none() && self.right.is_none()
    }

    fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// Fills the first vacant side with `child`.
    fn add_child(&mut self, child: Hash) -> Result<(), MerkleError> {
        if self.left.is_none() {
            self.left = Some(child);
        } else if self.right.is_none() {
            self.right = Some(child);
        } else {
            return Err(MerkleError::Corrupt(
                "node already has both children".into(),
            ));
        }
        Ok(())
    }

    /// Replaces whichever side currently equals `old` with `new`.
    fn replace_child(&mut self, old: Hash, new: Hash) -> Result<(), MerkleError> {
        if self.left == Some(old) {
            self.left = Some(new);
        } else if self.right == Some(old) {
            self.right = Some(new);
        } else {
            return Err(MerkleError::Corrupt(
                "old hash not found among node's children".into(),
            ));
        }
        Ok(())
    }
}

/// The incrementally-maintained Merkle tree and its durable store.
#[derive(Debug)]
pub struct MerkleStore {
    name: String,
    kv: LmdbKv,
    closed: bool,
    has_unsaved_changes: bool,
    num_leaves: i32,
    depth: i32,
    root_hash: Option<Hash>,
    hanging_nodes: HashMap<i32, Hash>,
    nodes_cache: HashMap<Hash, Node>,
    key_data_cache: HashMap<Vec<u8>, Vec<u8>>,
}

impl MerkleStore {
    /// Opens (creating if absent) the tree named `name` under `merkleTree/`.
    pub fn open(name: &str) -> Result<Self, MerkleError> {
        Self::open_in(Path::new("merkleTree"), name)
    }

    /// Opens the tree named `name` under an arbitrary base directory.
    /// Used directly by tests so each test gets its own isolated root.
    pub fn open_in(base_dir: &Path, name: &str) -> Result<Self, MerkleError> {
        let path = base_dir.join(name);
        let registry_key = path.to_string_lossy().into_owned();

        {
            let mut reg = registry().lock().unwrap();
            if reg.contains(&registry_key) {
                return Err(MerkleError::AlreadyOpen(name.to_string()));
            }
            reg.insert(registry_key.clone());
        }

        match Self::open_inner(name, &path, registry_key.clone()) {
            Ok(store) => Ok(store),
            Err(e) => {
                registry().lock().unwrap().remove(&registry_key);
                Err(e)
            }
        }
    }

    fn open_inner(name: &str, path: &PathBuf, registry_key: String) -> Result<Self, MerkleError> {
        let kv = LmdbKv::open(path)?;
        let mut store = Self {
            name: registry_key,
            kv,
            closed: false,
            has_unsaved_changes: false,
            num_leaves: 0,
            depth: 0,
            root_hash: None,
            hanging_nodes: HashMap::new(),
            nodes_cache: HashMap::new(),
            key_data_cache: HashMap::new(),
        };
        let _ = name;
        store.load_metadata()?;
        Ok(store)
    }

    fn load_metadata(&mut self) -> Result<(), MerkleError> {
        self.root_hash = self
            .kv
            .get(Namespace::Metadata, KEY_ROOT_HASH)?
            .map(|v| to_hash(&v))
            .transpose()?;

        self.num_leaves = match self.kv.get(Namespace::Metadata, KEY_NUM_LEAVES)? {
            Some(v) if v.len() == 4 => i32::from_le_bytes(v.try_into().unwrap()),
            _ => 0,
        };

        self.depth = match self.kv.get(Namespace::Metadata, KEY_DEPTH)? {
            Some(v) if v.len() == 4 => i32::from_le_bytes(v.try_into().unwrap()),
            _ => 0,
        };

        self.hanging_nodes.clear();
        for level in 0..=self.depth {
            let key = format!("{KEY_HANGING_NODE_PREFIX}{level}");
            if let Some(v) = self.kv.get(Namespace::Metadata, key.as_bytes())? {
                self.hanging_nodes.insert(level, to_hash(&v)?);
            }
        }
        Ok(())
    }

    fn error_if_closed(&self) -> Result<(), MerkleError> {
        if self.closed {
            Err(MerkleError::Closed)
        } else {
            Ok(())
        }
    }

    /// Reads `K`'s current value, checking the dirty cache first.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, MerkleError> {
        self.error_if_closed()?;
        if let Some(v) = self.key_data_cache.get(key) {
            return Ok(Some(v.clone()));
        }
        Ok(self.kv.get(Namespace::Keydata, key)?)
    }

    /// True iff `K` has durable keydata, bypassing the dirty cache
    /// (preserved from the source even though it means an unflushed
    /// `put` is not yet visible here).
    pub fn contains(&self, key: &[u8]) -> Result<bool, MerkleError> {
        self.error_if_closed()?;
        Ok(self.kv.get(Namespace::Keydata, key)?.is_some())
    }

    /// Inserts or updates `K` -> `V`. No-op if the leaf hash is unchanged.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), MerkleError> {
        self.error_if_closed()?;
        if key.is_empty() || value.is_empty() {
            return Err(MerkleError::BadArgument);
        }

        let existing = self.get(key)?;
        let old_leaf_hash = existing.map(|v| hasher::leaf_hash(key, &v));
        let new_leaf_hash = hasher::leaf_hash(key, value);

        if old_leaf_hash == Some(new_leaf_hash) {
            return Ok(());
        }

        self.key_data_cache.insert(key.to_vec(), value.to_vec());
        self.has_unsaved_changes = true;

        match old_leaf_hash {
            None => self.add_leaf(new_leaf_hash)?,
            Some(old) => self.update_leaf(old, new_leaf_hash)?,
        }
        Ok(())
    }

    pub fn root(&self) -> Option<Hash> {
        self.root_hash
    }

    pub fn root_on_disk(&self) -> Result<Option<Hash>, MerkleError> {
        self.error_if_closed()?;
        self.kv
            .get(Namespace::Metadata, KEY_ROOT_HASH)?
            .map(|v| to_hash(&v))
            .transpose()
    }

    pub fn num_leaves(&self) -> u64 {
        self.num_leaves.max(0) as u64
    }

    pub fn depth(&self) -> u64 {
        self.depth.max(0) as u64
    }

    fn cache_node(&mut self, node: Node) {
        self.nodes_cache.insert(node.hash, node);
    }

    fn get_node(&mut self, hash: Hash) -> Result<Option<Node>, MerkleError> {
        if let Some(n) = self.nodes_cache.get(&hash) {
            return Ok(Some(n.clone()));
        }
        match self.kv.get(Namespace::Nodes, &hash)? {
            Some(bytes) => {
                let node: Node = bincode::deserialize(&bytes).map_err(KvError::from)?;
                self.nodes_cache.insert(hash, node.clone());
                Ok(Some(node))
            }
            None => Ok(None),
        }
    }

    fn require_node(&mut self, hash: Hash) -> Result<Node, MerkleError> {
        self.get_node(hash)?
            .ok_or_else(|| MerkleError::Corrupt(format!("node not found: {}", hex::encode(hash))))
    }

    /// §4.3.1 — insert a brand-new leaf hash.
    fn add_leaf(&mut self, leaf_hash: Hash) -> Result<(), MerkleError> {
        let mut leaf_node = Node::new_leaf(leaf_hash);

        if self.num_leaves == 0 {
            self.hanging_nodes.insert(0, leaf_hash);
            self.root_hash = Some(leaf_hash);
            self.num_leaves += 1;
            self.cache_node(leaf_node);
            return Ok(());
        }

        match self.hanging_nodes.get(&0).copied() {
            Some(hanging_hash) => {
                self.hanging_nodes.remove(&0);
                let mut hanging_leaf = self.require_node(hanging_hash)?;

                if let Some(parent_hash) = hanging_leaf.parent {
                    let mut parent = self.require_node(parent_hash)?;
                    parent.add_child(leaf_hash)?;
                    leaf_node.parent = Some(parent_hash);
                    self.cache_node(leaf_node.clone());
                    let new_hash = parent.recomputed_hash()?;
                    self.update_node_hash(parent, new_hash)?;
                } else {
                    let parent = Node::new_internal(Some(hanging_hash), Some(leaf_hash))?;
                    hanging_leaf.parent = Some(parent.hash);
                    self.cache_node(hanging_leaf);
                    leaf_node.parent = Some(parent.hash);
                    self.cache_node(leaf_node.clone());
                    self.add_node(1, parent)?;
                }
            }
            None => {
                self.hanging_nodes.insert(0, leaf_hash);
                let parent = Node::new_internal(Some(leaf_hash), None)?;
                leaf_node.parent = Some(parent.hash);
                self.cache_node(leaf_node.clone());
                self.add_node(1, parent)?;
            }
        }

        self.num_leaves += 1;
        self.cache_node(leaf_node);
        Ok(())
    }

    /// §4.3.2 — insert an internal node at `level`, recursing upward.
    fn add_node(&mut self, level: i32, mut node: Node) -> Result<(), MerkleError> {
        if level > self.depth {
            self.depth = level;
        }

        match self.hanging_nodes.get(&level).copied() {
            Some(hanging_hash) => {
                self.hanging_nodes.remove(&level);
                let mut hanging_node = self.require_node(hanging_hash)?;

                if let Some(parent_hash) = hanging_node.parent {
                    let mut parent_node = self.require_node(parent_hash)?;
                    parent_node.add_child(node.hash)?;
                    node.parent = Some(parent_hash);
                    self.cache_node(node.clone());
                    let new_hash = parent_node.recomputed_hash()?;
                    self.update_node_hash(parent_node, new_hash)?;
                } else {
                    let parent = Node::new_internal(Some(hanging_hash), Some(node.hash))?;
                    hanging_node.parent = Some(parent.hash);
                    self.cache_node(hanging_node);
                    node.parent = Some(parent.hash);
                    self.cache_node(node.clone());
                    self.add_node(level + 1, parent)?;
                }
            }
            None => {
                self.hanging_nodes.insert(level, node.hash);
                if level >= self.depth {
                    self.root_hash = Some(node.hash);
                } else {
                    let parent = Node::new_internal(Some(node.hash), None)?;
                    node.parent = Some(parent.hash);
                    self.cache_node(node.clone());
                    self.add_node(level + 1, parent)?;
                }
            }
        }

        self.cache_node(node);
        Ok(())
    }

    fn update_leaf(&mut self, old_leaf_hash: Hash, new_leaf_hash: Hash) -> Result<(), MerkleError> {
        if old_leaf_hash == new_leaf_hash {
            return Err(MerkleError::Corrupt(
                "old and new leaf hashes cannot be the same".into(),
            ));
        }
        let leaf = self.require_node(old_leaf_hash)?;
        self.update_node_hash(leaf, new_leaf_hash)
    }

    /// §4.3.3 — re-key a node under a new hash and propagate the change
    /// up to the root, rewriting every downward `parent` pointer along
    /// the way.
    fn update_node_hash(&mut self, mut node: Node, new_hash: Hash) -> Result<(), MerkleError> {
        if node.stale_hash.is_none() {
            node.stale_hash = Some(node.hash);
        }
        let old_hash = node.hash;
        node.hash = new_hash;

        for (_, hash_value) in self.hanging_nodes.iter_mut() {
            if *hash_value == old_hash {
                *hash_value = new_hash;
                break;
            }
        }

        self.nodes_cache.remove(&old_hash);

        let is_leaf = node.is_leaf();
        let is_root = node.is_root();

        if is_root {
            self.root_hash = Some(new_hash);
            self.repoint_children(&node, new_hash)?;
        }

        if is_leaf && !is_root {
            let parent_hash = node.parent.unwrap();
            self.cache_node(node);
            if let Some(mut parent_node) = self.get_node(parent_hash)? {
                parent_node.replace_child(old_hash, new_hash)?;
                let new_parent_hash = parent_node.recomputed_hash()?;
                self.update_node_hash(parent_node, new_parent_hash)?;
            }
        } else if !is_leaf && !is_root {
            self.repoint_children(&node, new_hash)?;
            let parent_hash = node.parent;
            self.cache_node(node);
            if let Some(parent_hash) = parent_hash
                && let Some(mut parent_node) = self.get_node(parent_hash)?
            {
                parent_node.replace_child(old_hash, new_hash)?;
                let new_parent_hash = parent_node.recomputed_hash()?;
                self.update_node_hash(parent_node, new_parent_hash)?;
            }
        } else {
            self.cache_node(node);
        }

        Ok(())
    }

    fn repoint_children(&mut self, node: &Node, new_parent_hash: Hash) -> Result<(), MerkleError> {
        for child_hash in [node.left, node.right].into_iter().flatten() {
            if let Some(mut child) = self.get_node(child_hash)? {
                child.parent = Some(new_parent_hash);
                self.cache_node(child);
            }
        }
        Ok(())
    }

    /// §4.3.4 — atomically writes all dirty state.
    pub fn flush(&mut self) -> Result<(), MerkleError> {
        if !self.has_unsaved_changes {
            return Ok(());
        }
        self.error_if_closed()?;

        match self.root_hash {
            Some(h) => self.kv.put(Namespace::Metadata, KEY_ROOT_HASH, &h)?,
            None => self.kv.delete(Namespace::Metadata, KEY_ROOT_HASH)?,
        }
        self.kv
            .put(Namespace::Metadata, KEY_NUM_LEAVES, &self.num_leaves.to_le_bytes())?;
        self.kv
            .put(Namespace::Metadata, KEY_DEPTH, &self.depth.to_le_bytes())?;

        for (level, hash) in &self.hanging_nodes {
            let key = format!("{KEY_HANGING_NODE_PREFIX}{level}");
            self.kv.put(Namespace::Metadata, key.as_bytes(), hash)?;
        }

        for node in self.nodes_cache.values() {
            let encoded = bincode::serialize(node).map_err(KvError::from)?;
            self.kv.put(Namespace::Nodes, &node.hash, &encoded)?;
            if let Some(stale) = node.stale_hash {
                self.kv.delete(Namespace::Nodes, &stale)?;
            }
        }

        for (k, v) in &self.key_data_cache {
            self.kv.put(Namespace::Keydata, k, v)?;
        }

        self.nodes_cache.clear();
        self.key_data_cache.clear();
        self.has_unsaved_changes = false;
        Ok(())
    }

    /// §4.3.5 — discard caches and reload metadata.
    pub fn revert(&mut self) -> Result<(), MerkleError> {
        if !self.has_unsaved_changes {
            return Ok(());
        }
        self.error_if_closed()?;

        self.nodes_cache.clear();
        self.hanging_nodes.clear();
        self.key_data_cache.clear();
        self.load_metadata()?;
        self.has_unsaved_changes = false;
        Ok(())
    }

    /// Flushes then releases this tree's name.
    pub fn close(&mut self) -> Result<(), MerkleError> {
        if self.closed {
            return Ok(());
        }
        self.flush()?;
        registry().lock().unwrap().remove(&self.name);
        self.closed = true;
        Ok(())
    }

    /// Removes all durable state and resets in-memory state to empty.
    pub fn clear(&mut self) -> Result<(), MerkleError> {
        self.error_if_closed()?;
        self.kv.clear_all()?;
        self.nodes_cache.clear();
        self.key_data_cache.clear();
        self.hanging_nodes.clear();
        self.root_hash = None;
        self.num_leaves = 0;
        self.depth = 0;
        self.has_unsaved_changes = false;
        Ok(())
    }
}

impl Drop for MerkleStore {
    fn drop(&mut self) {
        if !self.closed {
            registry().lock().unwrap().remove(&self.name);
        }
    }
}

fn to_hash(bytes: &[u8]) -> Result<Hash, MerkleError> {
    bytes
        .try_into()
        .map_err(|_| MerkleError::Corrupt(format!("expected {}-byte hash, got {}", hasher::HASH_LENGTH, bytes.len())))
}
