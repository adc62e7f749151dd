//! Fairswap verifiable encoding of Merkle trees.
//!
//! For a source tree with `n` leaves and symmetric key `K`, the encoded tree
//! has `2n` leaves: the XOR-masked source leaves, the masked inner-node
//! digests in level-descending order, and a trailing 32-zero-byte sentinel
//! marking the tree as encoded. The root digest of the encoded tree commits
//! to the ciphertext and, through the digest pack, to the plain structure.
//!
//! Decoding rebuilds the plain tree and cross-checks every folding step
//! against the committed digest pack, accumulating mismatches that the buyer
//! turns into on-chain complaints.

use std::{error::Error, fmt};

use crate::crypto::{crypt, keccak, Digest, B032};
use crate::merkle::MerkleTree;

/// Classification of a digest mismatch found during decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MismatchKind {
    /// The inconsistency is between a leaf pair and its committed digest.
    Leaf,
    /// The inconsistency is between two pack digests and their parent.
    Node,
}

/// A single inconsistency between the recomputed and the committed digest
/// at one folding step of [`decode`].
///
/// Indices refer to leaves of the *encoded* tree: `index_in` is the left
/// input of the folding step, `index_out` the leaf carrying the committed
/// digest. The buyer derives complaint payloads (leaf data and proofs) from
/// the encoded tree using these indices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestMismatch {
    /// Whether the mismatch is at the leaf level or an inner level.
    pub kind: MismatchKind,
    /// Encoded-tree index of the left input leaf of the folding step.
    pub index_in: usize,
    /// Encoded-tree index of the leaf holding the committed digest.
    pub index_out: usize,
    /// Committed digest after unmasking (may be over-long for malformed
    /// input trees).
    pub expected: Vec<u8>,
    /// Digest recomputed from the unmasked inputs.
    pub actual: Digest,
}

/// Errors raised before decoding can start.
#[derive(Debug, Clone)]
pub enum DecodingError {
    /// The encoded tree's leaf count is not a power of two.
    LeafCountNotPowerOfTwo(usize),
    /// The final leaf is not the 32-zero-byte encoding marker.
    MissingEncodingMarker,
    /// The decoded leaf half could not be assembled into a tree.
    MalformedTree(String),
}

impl fmt::Display for DecodingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LeafCountNotPowerOfTwo(count) => {
                write!(f, "encoded tree must have 2^x leaves, got {count}")
            }
            Self::MissingEncodingMarker => {
                write!(f, "tree does not carry the encoding marker leaf")
            }
            Self::MalformedTree(reason) => write!(f, "malformed encoded tree: {reason}"),
        }
    }
}

impl Error for DecodingError {}

/// Returns true if `tree` ends with the zero sentinel leaf.
///
/// The sentinel is a weak marker that anyone can spoof; it distinguishes
/// encoded from plain trees but carries no security weight.
pub fn is_encoded(tree: &MerkleTree) -> bool {
    tree.leaf_data(tree.leaf_count() - 1) == B032
}

fn assemble(leaves: Vec<Vec<u8>>) -> Result<MerkleTree, String> {
    MerkleTree::from_leaves(leaves)
}

/// Encodes `tree` under `key` as described in the module documentation.
pub fn encode(tree: &MerkleTree, key: &Digest) -> Result<MerkleTree, String> {
    let mut leaves: Vec<Vec<u8>> = tree
        .leaves()
        .iter()
        .enumerate()
        .map(|(index, leaf)| crypt(leaf, index, key))
        .collect();
    let offset = leaves.len();
    for (index, digest) in tree.digests_pack().into_iter().enumerate() {
        leaves.push(crypt(&digest, offset + index, key));
    }
    leaves.push(B032.to_vec());
    assemble(leaves)
}

/// Encodes `tree` with the first source leaf zeroed before masking.
///
/// The committed digest pack still describes the original data, so decoding
/// detects exactly one leaf-level mismatch.
pub fn encode_forge_first_leaf(tree: &MerkleTree, key: &Digest) -> Result<MerkleTree, String> {
    let mut plain: Vec<Vec<u8>> = tree.leaves().to_vec();
    plain[0] = vec![0u8; plain[0].len()];
    let mut leaves: Vec<Vec<u8>> = plain
        .iter()
        .enumerate()
        .map(|(index, leaf)| crypt(leaf, index, key))
        .collect();
    let offset = leaves.len();
    for (index, digest) in tree.digests_pack().into_iter().enumerate() {
        leaves.push(crypt(&digest, offset + index, key));
    }
    leaves.push(B032.to_vec());
    assemble(leaves)
}

/// Encodes `tree` with the first source leaf zeroed *and* the first pack
/// digest recomputed to match the forged leaf.
///
/// The leaf-level check then passes while the next level up no longer folds
/// to its committed parent, so decoding detects exactly one node-level
/// mismatch.
pub fn encode_forge_first_leaf_first_hash(
    tree: &MerkleTree,
    key: &Digest,
) -> Result<MerkleTree, String> {
    let mut plain: Vec<Vec<u8>> = tree.leaves().to_vec();
    plain[0] = vec![0u8; plain[0].len()];
    let mut pack = tree.digests_pack();
    let forged_left = keccak(&plain[0]);
    let forged_right = keccak(&plain[1]);
    pack[0] = crate::crypto::keccak_pair(&forged_left, &forged_right);

    let mut leaves: Vec<Vec<u8>> = plain
        .iter()
        .enumerate()
        .map(|(index, leaf)| crypt(leaf, index, key))
        .collect();
    let offset = leaves.len();
    for (index, digest) in pack.into_iter().enumerate() {
        leaves.push(crypt(&digest, offset + index, key));
    }
    leaves.push(B032.to_vec());
    assemble(leaves)
}

/// Decodes an encoded tree under `key`.
///
/// Returns the candidate plain tree together with every digest mismatch
/// found while folding bottom-up. A faithful encoding decodes with an empty
/// mismatch list; the buyer's complaint uses the *last* entry of the scan,
/// which pins the inconsistency closest to the committed root.
pub fn decode(
    tree: &MerkleTree,
    key: &Digest,
) -> Result<(MerkleTree, Vec<DigestMismatch>), DecodingError> {
    let leaf_count = tree.leaf_count();
    if !leaf_count.is_power_of_two() {
        return Err(DecodingError::LeafCountNotPowerOfTwo(leaf_count));
    }
    if !is_encoded(tree) {
        return Err(DecodingError::MissingEncodingMarker);
    }

    let digest_start = leaf_count / 2;
    let decoded: Vec<Vec<u8>> = (0..digest_start)
        .map(|index| crypt(tree.leaf_data(index), index, key))
        .collect();
    let candidate =
        MerkleTree::from_leaves(decoded).map_err(DecodingError::MalformedTree)?;

    let mut errors = Vec::new();
    let mut node_index = 0usize;
    let mut digest_index = digest_start;
    let mut level_width = digest_start;

    while level_width > 1 {
        for _ in 0..level_width / 2 {
            let expected = crypt(tree.leaf_data(digest_index), digest_index, key);

            let (kind, actual) = if node_index < digest_start {
                // Leaf level: fold the freshly decoded source leaves.
                (
                    MismatchKind::Leaf,
                    crate::crypto::keccak_pair(
                        &candidate.leaf_digest(node_index),
                        &candidate.leaf_digest(node_index + 1),
                    ),
                )
            } else {
                // Inner level: fold the unmasked pack digests themselves.
                let left = crypt(tree.leaf_data(node_index), node_index, key);
                let right = crypt(tree.leaf_data(node_index + 1), node_index + 1, key);
                let mut input = Vec::with_capacity(left.len() + right.len());
                input.extend_from_slice(&left);
                input.extend_from_slice(&right);
                (MismatchKind::Node, keccak(&input))
            };

            if expected != actual {
                errors.push(DigestMismatch {
                    kind,
                    index_in: node_index,
                    index_out: digest_index,
                    expected,
                    actual,
                });
            }

            node_index += 2;
            digest_index += 1;
        }
        level_width /= 2;
    }

    Ok((candidate, errors))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{crypt, keccak};
    use crate::merkle::MerkleTree;

    fn sample_tree(slice_count: usize) -> MerkleTree {
        let data: Vec<u8> = (0..=255u8).cycle().take(32 * slice_count).collect();
        MerkleTree::from_bytes(&data, slice_count).unwrap()
    }

    fn sample_key() -> Digest {
        keccak(b"encoding test key")
    }

    #[test]
    fn encode_shape_and_sentinel() {
        let tree = sample_tree(4);
        let encoded = encode(&tree, &sample_key()).unwrap();
        assert_eq!(encoded.leaf_count(), 8);
        assert!(is_encoded(&encoded));
        assert!(!is_encoded(&tree));
        // Source leaves are masked at their own index.
        let key = sample_key();
        assert_eq!(
            encoded.leaf_data(0),
            crypt(tree.leaf_data(0), 0, &key).as_slice()
        );
        // Pack digests are masked with the index offset.
        assert_eq!(
            encoded.leaf_data(6),
            crypt(&tree.digest(), 6, &key).as_slice()
        );
    }

    #[test]
    fn decode_roundtrip() {
        for slice_count in [2usize, 4, 8, 16] {
            let tree = sample_tree(slice_count);
            let key = sample_key();
            let encoded = encode(&tree, &key).unwrap();
            let (decoded, errors) = decode(&encoded, &key).unwrap();
            assert!(errors.is_empty(), "slice_count={slice_count}: {errors:?}");
            assert_eq!(decoded, tree);
        }
    }

    #[test]
    fn decode_rejects_unencoded_tree() {
        let tree = sample_tree(4);
        assert!(matches!(
            decode(&tree, &sample_key()),
            Err(DecodingError::MissingEncodingMarker)
        ));
    }

    #[test]
    fn forged_leaf_yields_single_leaf_mismatch() {
        let tree = sample_tree(4);
        let key = sample_key();
        let encoded = encode_forge_first_leaf(&tree, &key).unwrap();
        let (_, errors) = decode(&encoded, &key).unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, MismatchKind::Leaf);
        assert_eq!(errors[0].index_in, 0);
        assert_eq!(errors[0].index_out, 4);
    }

    #[test]
    fn forged_leaf_and_hash_yields_single_node_mismatch() {
        let tree = sample_tree(4);
        let key = sample_key();
        let encoded = encode_forge_first_leaf_first_hash(&tree, &key).unwrap();
        let (_, errors) = decode(&encoded, &key).unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, MismatchKind::Node);
        assert_eq!(errors[0].index_in, 4);
        assert_eq!(errors[0].index_out, 6);
    }

    #[test]
    fn wrong_key_ends_with_node_mismatch() {
        let tree = sample_tree(4);
        let encoded = encode(&tree, &sample_key()).unwrap();
        let wrong_key = keccak(b"a different key");
        let (_, errors) = decode(&encoded, &wrong_key).unwrap();
        assert!(!errors.is_empty());
        assert_eq!(errors.last().unwrap().kind, MismatchKind::Node);
    }

    proptest::proptest! {
        #[test]
        fn roundtrip_for_random_files(seed in proptest::collection::vec(0u8..=255, 256), key in proptest::array::uniform32(0u8..=255)) {
            let tree = MerkleTree::from_bytes(&seed, 8).unwrap();
            let encoded = encode(&tree, &key).unwrap();
            let (decoded, errors) = decode(&encoded, &key).unwrap();
            proptest::prop_assert!(errors.is_empty());
            proptest::prop_assert_eq!(decoded, tree);
        }
    }
}
