use std::collections::BTreeMap;

use thiserror::Error;

use evchain_types::proof::{empty_hash, leaf_hash, node_hash, ProofError, ProofNode};
pub use evchain_types::proof::{
    verify_membership, verify_non_membership, AbsenceProof, ExistenceProof, TreeProof,
};

use crate::storage::{LedgerDb, StorageError};

const SNAPSHOT_PREFIX: &[u8] = b"snapshot/";
const LATEST_KEY: &[u8] = b"latest_version";

#[derive(Debug, Error)]
pub enum TreeError {
    #[error("tree has never been written")]
    Uninitialized,
    #[error("unknown version {0}")]
    UnknownVersion(u64),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("snapshot encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("corrupt snapshot: {0}")]
    CorruptSnapshot(&'static str),
    #[error(transparent)]
    Proof(#[from] ProofError),
}

/// Versioned sorted key/value store with a Merkle root over the working set.
///
/// The working set lives in memory; `save` persists a numbered snapshot into
/// the backing column family and advances the version. `rollback` discards
/// uncommitted writes by reloading the last saved version.
pub struct VersionedTree {
    db: LedgerDb,
    cf: &'static str,
    working: BTreeMap<Vec<u8>, Vec<u8>>,
    version: u64,
}

impl VersionedTree {
    /// Opens the tree and loads the latest saved version, if any.
    pub fn load_latest(db: LedgerDb, cf: &'static str) -> Result<Self, TreeError> {
        let mut tree = VersionedTree {
            db,
            cf,
            working: BTreeMap::new(),
            version: 0,
        };
        if let Some(raw) = tree.db.get(cf, LATEST_KEY)? {
            let version = decode_version(&raw)?;
            tree.load(version)?;
        }
        Ok(tree)
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn len(&self) -> u64 {
        self.working.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.working.is_empty()
    }

    pub fn set(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.working.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        self.working.get(key).map(Vec::as_slice)
    }

    pub fn has(&self, key: &[u8]) -> bool {
        self.working.contains_key(key)
    }

    /// Returns the value (when present) together with the key's position in
    /// sorted order. For absent keys the index is where the key would sit.
    pub fn get_with_index(&self, key: &[u8]) -> (Option<&[u8]>, i64) {
        let index = self.working.range(..key).count() as i64;
        (self.get(key), index)
    }

    /// Merkle root of the working set.
    pub fn hash(&self) -> [u8; 32] {
        let leaves = self.leaf_hashes();
        subtree_hash(&leaves)
    }

    /// Persists the working set as the next version. Returns the new root
    /// hash and version number.
    pub fn save(&mut self) -> Result<([u8; 32], u64), TreeError> {
        let version = self.version + 1;
        let snapshot: Vec<(String, String)> = self
            .working
            .iter()
            .map(|(key, value)| (hex::encode(key), hex::encode(value)))
            .collect();
        let encoded = serde_json::to_vec(&snapshot)?;

        self.db.put(self.cf, &snapshot_key(version), &encoded)?;
        self.db.put(self.cf, LATEST_KEY, &version.to_le_bytes())?;
        self.version = version;
        Ok((self.hash(), version))
    }

    /// Replaces the working set with the snapshot saved at `version`.
    pub fn load(&mut self, version: u64) -> Result<(), TreeError> {
        let raw = self
            .db
            .get(self.cf, &snapshot_key(version))?
            .ok_or(TreeError::UnknownVersion(version))?;
        let snapshot: Vec<(String, String)> = serde_json::from_slice(&raw)?;

        let mut working = BTreeMap::new();
        for (key, value) in snapshot {
            let key = hex::decode(&key).map_err(|_| TreeError::CorruptSnapshot("key"))?;
            let value = hex::decode(&value).map_err(|_| TreeError::CorruptSnapshot("value"))?;
            working.insert(key, value);
        }

        self.working = working;
        self.version = version;
        Ok(())
    }

    /// Discards uncommitted writes by reloading the last saved version.
    pub fn rollback(&mut self) -> Result<(), TreeError> {
        if self.version == 0 {
            self.working.clear();
            Ok(())
        } else {
            self.load(self.version)
        }
    }

    /// Produces an inclusion proof for a present key, or an absence proof
    /// bounding an absent key by its sorted neighbours.
    pub fn proof_for(&self, key: &[u8]) -> Result<TreeProof, TreeError> {
        if self.version == 0 && self.working.is_empty() {
            return Err(TreeError::Uninitialized);
        }

        let entries: Vec<(&Vec<u8>, &Vec<u8>)> = self.working.iter().collect();
        let leaves = self.leaf_hashes();
        let total = entries.len() as u64;

        match entries.binary_search_by(|(entry_key, _)| entry_key.as_slice().cmp(key)) {
            Ok(index) => Ok(TreeProof::Existence(existence_proof(
                &entries, &leaves, index,
            ))),
            Err(insert_at) => {
                let left = insert_at
                    .checked_sub(1)
                    .map(|index| existence_proof(&entries, &leaves, index));
                let right = (insert_at < entries.len())
                    .then(|| existence_proof(&entries, &leaves, insert_at));
                Ok(TreeProof::Absence(AbsenceProof {
                    key: key.to_vec(),
                    total,
                    left,
                    right,
                }))
            }
        }
    }

    fn leaf_hashes(&self) -> Vec<[u8; 32]> {
        self.working
            .iter()
            .map(|(key, value)| leaf_hash(key, value))
            .collect()
    }
}

fn existence_proof(
    entries: &[(&Vec<u8>, &Vec<u8>)],
    leaves: &[[u8; 32]],
    index: usize,
) -> ExistenceProof {
    let (key, value) = entries[index];
    ExistenceProof {
        key: key.clone(),
        value: value.clone(),
        index: index as u64,
        total: entries.len() as u64,
        path: audit_path(leaves, index),
    }
}

fn snapshot_key(version: u64) -> Vec<u8> {
    let mut key = SNAPSHOT_PREFIX.to_vec();
    key.extend_from_slice(&version.to_le_bytes());
    key
}

fn decode_version(raw: &[u8]) -> Result<u64, TreeError> {
    let bytes: [u8; 8] = raw
        .try_into()
        .map_err(|_| TreeError::CorruptSnapshot("version encoding"))?;
    Ok(u64::from_le_bytes(bytes))
}

/// Largest power of two strictly less than `n` (for `n >= 2`).
fn split_point(n: usize) -> usize {
    let mut k = 1;
    while k * 2 < n {
        k *= 2;
    }
    k
}

fn subtree_hash(leaves: &[[u8; 32]]) -> [u8; 32] {
    match leaves.len() {
        0 => empty_hash(),
        1 => leaves[0],
        n => {
            let k = split_point(n);
            node_hash(&subtree_hash(&leaves[..k]), &subtree_hash(&leaves[k..]))
        }
    }
}

fn audit_path(leaves: &[[u8; 32]], index: usize) -> Vec<ProofNode> {
    match leaves.len() {
        0 | 1 => Vec::new(),
        n => {
            let k = split_point(n);
            if index < k {
                let mut path = audit_path(&leaves[..k], index);
                path.push(ProofNode {
                    hash: subtree_hash(&leaves[k..]),
                    left: false,
                });
                path
            } else {
                let mut path = audit_path(&leaves[k..], index - k);
                path.push(ProofNode {
                    hash: subtree_hash(&leaves[..k]),
                    left: true,
                });
                path
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::CF_IDENTITY;
    use tempfile::tempdir;

    fn open_tree(dir: &tempfile::TempDir) -> VersionedTree {
        let db = LedgerDb::open(dir.path().join("ledger")).expect("open ledger");
        VersionedTree::load_latest(db, CF_IDENTITY).expect("load tree")
    }

    #[test]
    fn save_and_reload_round_trip() {
        let dir = tempdir().unwrap();
        let db = LedgerDb::open(dir.path().join("ledger")).unwrap();

        let (root, version) = {
            let mut tree = VersionedTree::load_latest(db.clone(), CF_IDENTITY).unwrap();
            tree.set(b"b".to_vec(), b"2".to_vec());
            tree.set(b"a".to_vec(), b"1".to_vec());
            tree.save().unwrap()
        };
        assert_eq!(version, 1);

        let reloaded = VersionedTree::load_latest(db, CF_IDENTITY).unwrap();
        assert_eq!(reloaded.version(), 1);
        assert_eq!(reloaded.get(b"a"), Some(b"1".as_slice()));
        assert_eq!(reloaded.hash(), root);
    }

    #[test]
    fn rollback_discards_staged_writes() {
        let dir = tempdir().unwrap();
        let mut tree = open_tree(&dir);
        tree.set(b"a".to_vec(), b"1".to_vec());
        tree.save().unwrap();

        tree.set(b"b".to_vec(), b"2".to_vec());
        assert!(tree.has(b"b"));
        tree.rollback().unwrap();
        assert!(!tree.has(b"b"));
        assert!(tree.has(b"a"));
    }

    #[test]
    fn loading_an_old_version_restores_its_content() {
        let dir = tempdir().unwrap();
        let mut tree = open_tree(&dir);
        tree.set(b"a".to_vec(), b"1".to_vec());
        tree.save().unwrap();
        tree.set(b"b".to_vec(), b"2".to_vec());
        tree.save().unwrap();

        tree.load(1).unwrap();
        assert!(tree.has(b"a"));
        assert!(!tree.has(b"b"));
    }

    #[test]
    fn root_changes_with_content() {
        let dir = tempdir().unwrap();
        let mut tree = open_tree(&dir);
        tree.set(b"a".to_vec(), b"1".to_vec());
        let first = tree.hash();
        tree.set(b"a".to_vec(), b"2".to_vec());
        assert_ne!(first, tree.hash());
    }

    #[test]
    fn get_with_index_orders_keys() {
        let dir = tempdir().unwrap();
        let mut tree = open_tree(&dir);
        tree.set(b"a".to_vec(), b"1".to_vec());
        tree.set(b"c".to_vec(), b"3".to_vec());

        let (value, index) = tree.get_with_index(b"c");
        assert_eq!(value, Some(b"3".as_slice()));
        assert_eq!(index, 1);

        let (value, index) = tree.get_with_index(b"b");
        assert_eq!(value, None);
        assert_eq!(index, 1);
    }

    #[test]
    fn inclusion_proofs_verify_for_every_key() {
        let dir = tempdir().unwrap();
        let mut tree = open_tree(&dir);
        for i in 0u8..9 {
            tree.set(vec![i], vec![i, i]);
        }
        let root = tree.hash();

        for i in 0u8..9 {
            let proof = tree.proof_for(&[i]).unwrap();
            let value = proof.verify(&root, &[i]).unwrap();
            assert_eq!(value, Some(vec![i, i]));
        }
    }

    #[test]
    fn absence_proofs_verify_at_every_gap() {
        let dir = tempdir().unwrap();
        let mut tree = open_tree(&dir);
        for i in [1u8, 3, 5, 7] {
            tree.set(vec![i], vec![i]);
        }
        let root = tree.hash();

        for missing in [0u8, 2, 4, 6, 8] {
            let proof = tree.proof_for(&[missing]).unwrap();
            assert!(matches!(proof, TreeProof::Absence(_)));
            assert_eq!(proof.verify(&root, &[missing]).unwrap(), None);
        }
    }

    #[test]
    fn tampered_proof_is_rejected() {
        let dir = tempdir().unwrap();
        let mut tree = open_tree(&dir);
        tree.set(b"a".to_vec(), b"1".to_vec());
        tree.set(b"b".to_vec(), b"2".to_vec());
        let root = tree.hash();

        let TreeProof::Existence(mut proof) = tree.proof_for(b"a").unwrap() else {
            panic!("expected existence proof");
        };
        proof.value = b"3".to_vec();
        assert!(verify_membership(&root, &proof).is_err());
    }

    #[test]
    fn proving_against_unwritten_tree_fails() {
        let dir = tempdir().unwrap();
        let tree = open_tree(&dir);
        assert!(matches!(
            tree.proof_for(b"a"),
            Err(TreeError::Uninitialized)
        ));
    }
}
