//! Binary Merkle trees over Keccak-256.
//!
//! Trees are perfect binary trees with a power-of-two number of leaves.
//! Leaves carry raw 32-byte-aligned payloads; a leaf digest is the Keccak
//! digest of its payload, an inner digest is the Keccak digest of the
//! concatenation of its two children's digests.

use serde_json::Value;

use crate::crypto::{keccak, keccak_pair, Digest};

/// Immutable Merkle tree with eagerly computed digest levels.
///
/// `levels[0]` holds the leaf digests in left-to-right order and every
/// following level halves in size until the root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleTree {
    leaves: Vec<Vec<u8>>,
    levels: Vec<Vec<Digest>>,
}

impl MerkleTree {
    /// Builds a tree from raw leaf payloads.
    ///
    /// The number of leaves must be a power of two >= 2 and every payload
    /// length a multiple of 32.
    pub fn from_leaves(leaves: Vec<Vec<u8>>) -> Result<Self, String> {
        if leaves.len() < 2 || !leaves.len().is_power_of_two() {
            return Err(format!(
                "leaf count must be a power of 2 >= 2, got {}",
                leaves.len()
            ));
        }
        for (index, leaf) in leaves.iter().enumerate() {
            if leaf.len() % 32 != 0 {
                return Err(format!(
                    "leaf {index} length must be a multiple of 32, got {}",
                    leaf.len()
                ));
            }
        }

        let mut levels = Vec::new();
        let mut level: Vec<Digest> = leaves.iter().map(|leaf| keccak(leaf)).collect();
        levels.push(level.clone());
        while level.len() > 1 {
            level = level
                .chunks(2)
                .map(|pair| keccak_pair(&pair[0], &pair[1]))
                .collect();
            levels.push(level.clone());
        }

        Ok(Self { leaves, levels })
    }

    /// Partitions `data` into `slice_count` equal slices and builds a tree
    /// with one slice per leaf.
    pub fn from_bytes(data: &[u8], slice_count: usize) -> Result<Self, String> {
        if slice_count < 2 || !slice_count.is_power_of_two() {
            return Err(format!(
                "slice_count must be a power of 2 >= 2, got {slice_count}"
            ));
        }
        if data.len() % slice_count != 0 {
            return Err(format!(
                "data length {} is not divisible into {slice_count} slices",
                data.len()
            ));
        }
        let slice_length = data.len() / slice_count;
        if slice_length == 0 || slice_length % 32 != 0 {
            return Err(format!(
                "slice length must be a non-zero multiple of 32, got {slice_length}"
            ));
        }
        Self::from_leaves(data.chunks(slice_length).map(<[u8]>::to_vec).collect())
    }

    /// Root digest of the tree.
    pub fn digest(&self) -> Digest {
        self.levels[self.levels.len() - 1][0]
    }

    /// Number of leaves.
    pub fn leaf_count(&self) -> usize {
        self.leaves.len()
    }

    /// Number of levels including the leaf level.
    pub fn depth(&self) -> usize {
        self.levels.len()
    }

    /// Raw payload of the leaf at `index`.
    pub fn leaf_data(&self, index: usize) -> &[u8] {
        &self.leaves[index]
    }

    /// All leaf payloads in left-to-right order.
    pub fn leaves(&self) -> &[Vec<u8>] {
        &self.leaves
    }

    /// Digest of the leaf at `index`.
    pub fn leaf_digest(&self, index: usize) -> Digest {
        self.levels[0][index]
    }

    /// Splits the payload of leaf `index` into 32-byte blocks.
    pub fn leaf_data_blocks(&self, index: usize) -> Vec<Digest> {
        self.leaves[index]
            .chunks(32)
            .map(|chunk| {
                let mut block = [0u8; 32];
                block.copy_from_slice(chunk);
                block
            })
            .collect()
    }

    /// Inner-node digests in level-descending order: the level just above
    /// the leaves first, the root digest last.
    pub fn digests_pack(&self) -> Vec<Digest> {
        self.levels[1..].iter().flatten().copied().collect()
    }

    /// Sibling digests along the path from the root to leaf `index`,
    /// root-side first.
    pub fn proof(&self, index: usize) -> Result<Vec<Digest>, String> {
        if index >= self.leaves.len() {
            return Err(format!(
                "leaf index {index} out of range for {} leaves",
                self.leaves.len()
            ));
        }
        let height = self.levels.len() - 1;
        let mut proof = Vec::with_capacity(height);
        for level in (0..height).rev() {
            let sibling = (index >> level) ^ 1;
            proof.push(self.levels[level][sibling]);
        }
        Ok(proof)
    }

    /// Checks a proof produced by [`MerkleTree::proof`] against a root
    /// digest, a leaf digest and the leaf's index.
    pub fn validate_proof(
        root_digest: &Digest,
        leaf_digest: &Digest,
        index: usize,
        proof: &[Digest],
    ) -> bool {
        let mut digest = *leaf_digest;
        for step in 0..proof.len() {
            let sibling = &proof[proof.len() - step - 1];
            if (index >> step) & 1 == 1 {
                digest = keccak_pair(sibling, &digest);
            } else {
                digest = keccak_pair(&digest, sibling);
            }
        }
        digest == *root_digest
    }
}

/// Renders a tree as a nested JSON array with each leaf payload passed
/// through `encode`.
pub fn mt2obj<F>(tree: &MerkleTree, encode: F) -> Value
where
    F: Fn(&[u8]) -> Value,
{
    fn build<F: Fn(&[u8]) -> Value>(
        tree: &MerkleTree,
        encode: &F,
        level: usize,
        index: usize,
    ) -> Value {
        if level == 0 {
            encode(tree.leaf_data(index))
        } else {
            Value::Array(vec![
                build(tree, encode, level - 1, index * 2),
                build(tree, encode, level - 1, index * 2 + 1),
            ])
        }
    }
    build(tree, &encode, tree.depth() - 1, 0)
}

/// Rebuilds a tree from a nested JSON array, decoding each leaf payload
/// with `decode`. Inverse of [`mt2obj`] for matching encode/decode pairs.
pub fn obj2mt<F>(value: &Value, decode: F) -> Result<MerkleTree, String>
where
    F: Fn(&Value) -> Result<Vec<u8>, String>,
{
    fn collect<F: Fn(&Value) -> Result<Vec<u8>, String>>(
        value: &Value,
        decode: &F,
        leaves: &mut Vec<Vec<u8>>,
    ) -> Result<(), String> {
        match value {
            Value::Array(children) => {
                if children.len() != 2 {
                    return Err(format!(
                        "inner node must have exactly 2 children, got {}",
                        children.len()
                    ));
                }
                collect(&children[0], decode, leaves)?;
                collect(&children[1], decode, leaves)
            }
            other => {
                leaves.push(decode(other)?);
                Ok(())
            }
        }
    }

    let mut leaves = Vec::new();
    collect(value, &decode, &mut leaves)?;
    MerkleTree::from_leaves(leaves)
}

/// Renders a tree as nested JSON arrays of hex-encoded leaf payloads.
pub fn mt2obj_hex(tree: &MerkleTree) -> Value {
    mt2obj(tree, |data| Value::String(hex::encode(data)))
}

/// Rebuilds a tree from nested JSON arrays of hex-encoded leaf payloads.
pub fn obj2mt_hex(value: &Value) -> Result<MerkleTree, String> {
    obj2mt(value, |leaf| {
        let text = leaf
            .as_str()
            .ok_or_else(|| format!("expected hex string leaf, got {leaf}"))?;
        hex::decode(text).map_err(|err| format!("invalid hex leaf: {err}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keccak;

    fn leaf(fill: u8, len: usize) -> Vec<u8> {
        vec![fill; len]
    }

    #[test]
    fn rejects_bad_shapes() {
        assert!(MerkleTree::from_leaves(vec![leaf(0, 32)]).is_err());
        assert!(MerkleTree::from_leaves(vec![leaf(0, 32); 3]).is_err());
        assert!(MerkleTree::from_leaves(vec![leaf(0, 31), leaf(1, 31)]).is_err());
        assert!(MerkleTree::from_bytes(&[0u8; 128], 3).is_err());
        assert!(MerkleTree::from_bytes(&[0u8; 24], 2).is_err());
    }

    #[test]
    fn root_matches_manual_fold() {
        let tree =
            MerkleTree::from_leaves(vec![leaf(1, 32), leaf(2, 32), leaf(3, 32), leaf(4, 32)])
                .unwrap();
        let l: Vec<_> = (1u8..=4).map(|f| keccak(&[f; 32])).collect();
        let n0 = keccak_pair(&l[0], &l[1]);
        let n1 = keccak_pair(&l[2], &l[3]);
        assert_eq!(tree.digest(), keccak_pair(&n0, &n1));
        assert_eq!(tree.digests_pack(), vec![n0, n1, tree.digest()]);
    }

    #[test]
    fn proofs_validate_for_all_leaves() {
        for exponent in 1..=4u32 {
            let count = 2usize.pow(exponent);
            let leaves: Vec<_> = (0..count).map(|i| leaf(i as u8, 32)).collect();
            let tree = MerkleTree::from_leaves(leaves).unwrap();
            for index in 0..count {
                let proof = tree.proof(index).unwrap();
                assert_eq!(proof.len(), exponent as usize);
                assert!(MerkleTree::validate_proof(
                    &tree.digest(),
                    &tree.leaf_digest(index),
                    index,
                    &proof
                ));
                // A proof for one leaf must not validate another position.
                let other = (index + 1) % count;
                assert!(!MerkleTree::validate_proof(
                    &tree.digest(),
                    &tree.leaf_digest(other),
                    other,
                    &proof
                ));
            }
        }
    }

    #[test]
    fn serialization_roundtrip() {
        let data: Vec<u8> = (0..=255u8).cycle().take(512).collect();
        let tree = MerkleTree::from_bytes(&data, 8).unwrap();
        let object = mt2obj_hex(&tree);
        let rebuilt = obj2mt_hex(&object).unwrap();
        assert_eq!(rebuilt, tree);
        assert_eq!(rebuilt.digest(), tree.digest());
    }

    #[test]
    fn obj2mt_rejects_malformed_shapes() {
        let three = serde_json::json!(["00", "11", "22"]);
        assert!(obj2mt_hex(&three).is_err());
        let lopsided = serde_json::json!([["00", "11"], "22"]);
        assert!(obj2mt_hex(&lopsided).is_err());
    }
}
