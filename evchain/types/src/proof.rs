use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

const LEAF_DOMAIN: u8 = 0x00;
const NODE_DOMAIN: u8 = 0x01;
const EMPTY_DOMAIN: u8 = 0x02;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProofError {
    #[error("invalid proof: {0}")]
    Invalid(&'static str),
}

pub fn leaf_hash(key: &[u8], value: &[u8]) -> [u8; 32] {
    let mut digest = Sha256::new();
    digest.update([LEAF_DOMAIN]);
    digest.update((key.len() as u64).to_le_bytes());
    digest.update(key);
    digest.update(value);
    digest.finalize().into()
}

pub fn node_hash(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let mut digest = Sha256::new();
    digest.update([NODE_DOMAIN]);
    digest.update(left);
    digest.update(right);
    digest.finalize().into()
}

pub fn empty_hash() -> [u8; 32] {
    Sha256::digest([EMPTY_DOMAIN]).into()
}

/// One sibling on an audit path. `left` marks the sibling as the left child.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofNode {
    #[serde(with = "hex")]
    pub hash: [u8; 32],
    pub left: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExistenceProof {
    #[serde(with = "hex")]
    pub key: Vec<u8>,
    #[serde(with = "hex")]
    pub value: Vec<u8>,
    pub index: u64,
    pub total: u64,
    pub path: Vec<ProofNode>,
}

impl ExistenceProof {
    /// Folds the audit path up from the leaf to the root this proof
    /// commits to.
    pub fn compute_root(&self) -> [u8; 32] {
        let mut hash = leaf_hash(&self.key, &self.value);
        for node in &self.path {
            hash = if node.left {
                node_hash(&node.hash, &hash)
            } else {
                node_hash(&hash, &node.hash)
            };
        }
        hash
    }
}

/// Proof that a key is absent: the existence proofs of its sorted
/// neighbours. A missing side means the key sorts before the first or after
/// the last entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbsenceProof {
    #[serde(with = "hex")]
    pub key: Vec<u8>,
    pub total: u64,
    pub left: Option<ExistenceProof>,
    pub right: Option<ExistenceProof>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TreeProof {
    Existence(ExistenceProof),
    Absence(AbsenceProof),
}

impl TreeProof {
    /// Verifies the proof against a root for the given key. Returns the
    /// proven value for inclusion proofs, `None` for absence proofs.
    pub fn verify(&self, root: &[u8; 32], key: &[u8]) -> Result<Option<Vec<u8>>, ProofError> {
        match self {
            TreeProof::Existence(proof) => {
                if proof.key != key {
                    return Err(ProofError::Invalid("key mismatch"));
                }
                verify_membership(root, proof)?;
                Ok(Some(proof.value.clone()))
            }
            TreeProof::Absence(proof) => {
                if proof.key != key {
                    return Err(ProofError::Invalid("key mismatch"));
                }
                verify_non_membership(root, key, proof)?;
                Ok(None)
            }
        }
    }
}

pub fn verify_membership(root: &[u8; 32], proof: &ExistenceProof) -> Result<(), ProofError> {
    let mut hash = leaf_hash(&proof.key, &proof.value);
    for node in &proof.path {
        hash = if node.left {
            node_hash(&node.hash, &hash)
        } else {
            node_hash(&hash, &node.hash)
        };
    }
    if &hash != root {
        return Err(ProofError::Invalid("root mismatch"));
    }
    Ok(())
}

pub fn verify_non_membership(
    root: &[u8; 32],
    key: &[u8],
    proof: &AbsenceProof,
) -> Result<(), ProofError> {
    if proof.total == 0 {
        if &empty_hash() != root {
            return Err(ProofError::Invalid("root mismatch for empty tree"));
        }
        if proof.left.is_some() || proof.right.is_some() {
            return Err(ProofError::Invalid("neighbours in empty tree"));
        }
        return Ok(());
    }

    match (&proof.left, &proof.right) {
        (None, None) => Err(ProofError::Invalid("no bounding neighbours")),
        (Some(left), None) => {
            verify_membership(root, left)?;
            if left.key.as_slice() >= key {
                return Err(ProofError::Invalid("left neighbour out of order"));
            }
            if left.index != proof.total - 1 {
                return Err(ProofError::Invalid("left neighbour is not the last entry"));
            }
            Ok(())
        }
        (None, Some(right)) => {
            verify_membership(root, right)?;
            if right.key.as_slice() <= key {
                return Err(ProofError::Invalid("right neighbour out of order"));
            }
            if right.index != 0 {
                return Err(ProofError::Invalid("right neighbour is not the first entry"));
            }
            Ok(())
        }
        (Some(left), Some(right)) => {
            verify_membership(root, left)?;
            verify_membership(root, right)?;
            if left.key.as_slice() >= key || right.key.as_slice() <= key {
                return Err(ProofError::Invalid("neighbours out of order"));
            }
            if left.index + 1 != right.index {
                return Err(ProofError::Invalid("neighbours are not adjacent"));
            }
            Ok(())
        }
    }
}
