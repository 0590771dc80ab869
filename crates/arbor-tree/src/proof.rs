//! Membership and non-membership proofs.

use crate::hash::{branch_hash, empty_tree_hash, leaf_hash, Hash};
use crate::iterator::TreeIterator;
use crate::node::{NodePtr, NodeSource};
use arbor_common::{ArborError, Result};
use bytes::Bytes;

/// One inner node on the path from a leaf to the root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProofStep {
    pub height: u8,
    pub size: u32,
    pub version: u32,
    pub sibling_hash: Hash,
    /// True when the sibling is the left child, i.e. the proven leaf
    /// lies in the right subtree.
    pub sibling_on_left: bool,
}

/// Proof that a key/value pair is present under a root hash.
///
/// Steps are ordered leaf to root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipProof {
    pub leaf_version: u32,
    pub steps: Vec<ProofStep>,
}

impl MembershipProof {
    /// Recomputes the root hash this proof commits to for the given
    /// key/value pair.
    pub fn compute_root(&self, key: &[u8], value: &[u8]) -> Hash {
        let mut hash = leaf_hash(self.leaf_version, key, value);
        for step in &self.steps {
            hash = if step.sibling_on_left {
                branch_hash(step.height, step.size, step.version, &step.sibling_hash, &hash)
            } else {
                branch_hash(step.height, step.size, step.version, &hash, &step.sibling_hash)
            };
        }
        hash
    }

    /// Root-to-leaf turn directions; true means "went right".
    fn directions(&self) -> Vec<bool> {
        self.steps.iter().rev().map(|s| s.sibling_on_left).collect()
    }
}

/// Verifies that `key`/`value` is a member of the tree with the given
/// root hash.
pub fn verify_membership(
    proof: &MembershipProof,
    root_hash: &Hash,
    key: &[u8],
    value: &[u8],
) -> bool {
    proof.compute_root(key, value) == *root_hash
}

/// A bounding leaf inside a non-membership proof.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundEntry {
    pub key: Bytes,
    pub value: Bytes,
    pub proof: MembershipProof,
}

/// Proof that a key is absent: the adjacent leaves that would surround
/// it. A missing side means the key sorts before the first or after
/// the last leaf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NonMembershipProof {
    pub left: Option<BoundEntry>,
    pub right: Option<BoundEntry>,
}

/// Verifies that `key` is absent from the tree with the given root
/// hash.
pub fn verify_non_membership(proof: &NonMembershipProof, root_hash: &Hash, key: &[u8]) -> bool {
    match (&proof.left, &proof.right) {
        (None, None) => *root_hash == empty_tree_hash(),
        (Some(left), None) => {
            // Key sorts after every leaf: the bound must be the
            // rightmost leaf, whose path turns right at every level.
            verify_membership(&left.proof, root_hash, &left.key, &left.value)
                && &left.key[..] < key
                && left.proof.directions().iter().all(|&went_right| went_right)
        }
        (None, Some(right)) => {
            verify_membership(&right.proof, root_hash, &right.key, &right.value)
                && key < &right.key[..]
                && right.proof.directions().iter().all(|&went_right| !went_right)
        }
        (Some(left), Some(right)) => {
            if !verify_membership(&left.proof, root_hash, &left.key, &left.value)
                || !verify_membership(&right.proof, root_hash, &right.key, &right.value)
                || &left.key[..] >= key
                || key >= &right.key[..]
            {
                return false;
            }
            leaves_adjacent(&left.proof.directions(), &right.proof.directions())
        }
    }
}

/// Checks that two root-to-leaf paths belong to adjacent leaves: they
/// share a prefix up to their lowest common branch, where the left
/// path goes left and the right path goes right; below it the left
/// path is all-right and the right path is all-left.
fn leaves_adjacent(left_dirs: &[bool], right_dirs: &[bool]) -> bool {
    let common = left_dirs.len().min(right_dirs.len());
    let divergence = (0..common).find(|&i| left_dirs[i] != right_dirs[i]);
    let Some(split) = divergence else {
        return false;
    };
    if left_dirs[split] || !right_dirs[split] {
        return false;
    }
    left_dirs[split + 1..].iter().all(|&d| d)
        && right_dirs[split + 1..].iter().all(|&d| !d)
}

/// Builds a membership proof for `key` from the committed tree at
/// `root`.
pub fn membership_proof<S: NodeSource>(
    source: &S,
    root: &NodePtr,
    key: &[u8],
) -> Result<MembershipProof> {
    if root.is_empty() {
        return Err(ArborError::Structure(
            "cannot prove membership in an empty tree".to_string(),
        ));
    }
    let mut steps = Vec::new();
    let mut node = root.resolve(source)?;
    loop {
        if node.is_leaf() {
            if &node.key()[..] != key {
                return Err(ArborError::Structure(format!(
                    "key is not in the tree; found leaf {}",
                    node.id()
                )));
            }
            steps.reverse();
            return Ok(MembershipProof {
                leaf_version: node.version(),
                steps,
            });
        }
        let go_left = key < &node.key()[..];
        let sibling = node.child(!go_left);
        steps.push(ProofStep {
            height: node.height(),
            size: node.size(),
            version: node.version(),
            sibling_hash: sibling.hash(source)?,
            sibling_on_left: !go_left,
        });
        node = node.resolve_child(source, go_left)?;
    }
}

/// Builds a non-membership proof for `key` from the committed tree at
/// `root`.
pub fn non_membership_proof<S: NodeSource>(
    source: &S,
    root: &NodePtr,
    key: &[u8],
) -> Result<NonMembershipProof> {
    if root.is_empty() {
        return Ok(NonMembershipProof {
            left: None,
            right: None,
        });
    }
    let key_bytes = Bytes::copy_from_slice(key);

    // Successor: the first leaf at or above the key.
    let successor = TreeIterator::new(source, root.clone(), Some(key_bytes.clone()), None, true)
        .next()
        .transpose()?;
    if let Some((succ_key, _)) = &successor {
        if &succ_key[..] == key {
            return Err(ArborError::Structure(
                "key is a member of the tree".to_string(),
            ));
        }
    }
    // Predecessor: the last leaf strictly below the key.
    let predecessor = TreeIterator::new(source, root.clone(), None, Some(key_bytes), false)
        .next()
        .transpose()?;

    let bound = |pair: Option<(Bytes, Bytes)>| -> Result<Option<BoundEntry>> {
        match pair {
            Some((bound_key, value)) => {
                let proof = membership_proof(source, root, &bound_key)?;
                Ok(Some(BoundEntry {
                    key: bound_key,
                    value,
                    proof,
                }))
            }
            None => Ok(None),
        }
    };

    Ok(NonMembershipProof {
        left: bound(predecessor)?,
        right: bound(successor)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commit::{commit_traverse, CommitContext};
    use crate::node::DetachedSource;
    use crate::ops::{set_kv, MutationContext};

    fn build_committed(pairs: &[(&str, &str)]) -> (NodePtr, Hash) {
        let mut ctx = MutationContext::new(1);
        let mut root = NodePtr::Empty;
        for (k, v) in pairs {
            let (new_root, _) = set_kv(
                &root,
                &DetachedSource,
                &mut ctx,
                Bytes::copy_from_slice(k.as_bytes()),
                Bytes::copy_from_slice(v.as_bytes()),
            )
            .unwrap();
            root = new_root;
        }
        let mut cctx = CommitContext::new(1);
        let hash = commit_traverse(&DetachedSource, &root, &mut cctx).unwrap();
        (root, hash)
    }

    const PAIRS: &[(&str, &str)] = &[
        ("banana", "yellow"),
        ("apple", "red"),
        ("grape", "purple"),
        ("kiwi", "green"),
        ("mango", "orange"),
        ("cherry", "dark"),
        ("fig", "brown"),
    ];

    #[test]
    fn test_membership_all_keys() {
        let (root, hash) = build_committed(PAIRS);
        for (k, v) in PAIRS {
            let proof = membership_proof(&DetachedSource, &root, k.as_bytes()).unwrap();
            assert!(
                verify_membership(&proof, &hash, k.as_bytes(), v.as_bytes()),
                "membership failed for {k}"
            );
        }
    }

    #[test]
    fn test_membership_wrong_value_fails() {
        let (root, hash) = build_committed(PAIRS);
        let proof = membership_proof(&DetachedSource, &root, b"apple").unwrap();
        assert!(!verify_membership(&proof, &hash, b"apple", b"green"));
        assert!(!verify_membership(&proof, &hash, b"applf", b"red"));
    }

    #[test]
    fn test_membership_tampered_step_fails() {
        let (root, hash) = build_committed(PAIRS);
        let mut proof = membership_proof(&DetachedSource, &root, b"kiwi").unwrap();
        proof.steps[0].sibling_hash[3] ^= 0xFF;
        assert!(!verify_membership(&proof, &hash, b"kiwi", b"green"));

        let mut proof = membership_proof(&DetachedSource, &root, b"kiwi").unwrap();
        proof.steps[0].sibling_on_left = !proof.steps[0].sibling_on_left;
        assert!(!verify_membership(&proof, &hash, b"kiwi", b"green"));
    }

    #[test]
    fn test_membership_of_absent_key_errors() {
        let (root, _) = build_committed(PAIRS);
        assert!(membership_proof(&DetachedSource, &root, b"durian").is_err());
    }

    #[test]
    fn test_non_membership_between_keys() {
        let (root, hash) = build_committed(PAIRS);
        for key in [&b"ant"[..], b"blueberry", b"date", b"lemon", b"zebra"] {
            let proof = non_membership_proof(&DetachedSource, &root, key).unwrap();
            assert!(
                verify_non_membership(&proof, &hash, key),
                "non-membership failed for {:?}",
                std::str::from_utf8(key)
            );
        }
    }

    #[test]
    fn test_non_membership_outside_range() {
        let (root, hash) = build_committed(PAIRS);

        // Before the first key: only a right bound.
        let proof = non_membership_proof(&DetachedSource, &root, b"aaa").unwrap();
        assert!(proof.left.is_none());
        assert!(verify_non_membership(&proof, &hash, b"aaa"));

        // After the last key: only a left bound.
        let proof = non_membership_proof(&DetachedSource, &root, b"zzz").unwrap();
        assert!(proof.right.is_none());
        assert!(verify_non_membership(&proof, &hash, b"zzz"));
    }

    #[test]
    fn test_non_membership_of_member_errors() {
        let (root, _) = build_committed(PAIRS);
        assert!(non_membership_proof(&DetachedSource, &root, b"apple").is_err());
    }

    #[test]
    fn test_non_membership_wrong_key_fails() {
        let (root, hash) = build_committed(PAIRS);
        let proof = non_membership_proof(&DetachedSource, &root, b"date").unwrap();
        // The same proof must not verify for a key outside the gap.
        assert!(!verify_non_membership(&proof, &hash, b"lemon"));
        // Nor for a key that is a member.
        assert!(!verify_non_membership(&proof, &hash, b"cherry"));
    }

    #[test]
    fn test_non_membership_non_adjacent_bounds_fail() {
        let (root, hash) = build_committed(PAIRS);
        // Fabricate a proof from two bounds that are not adjacent:
        // apple and cherry surround banana, but banana is a member and
        // the bounds of a real gap must be adjacent leaves.
        let apple = membership_proof(&DetachedSource, &root, b"apple").unwrap();
        let grape = membership_proof(&DetachedSource, &root, b"grape").unwrap();
        let fake = NonMembershipProof {
            left: Some(BoundEntry {
                key: Bytes::from_static(b"apple"),
                value: Bytes::from_static(b"red"),
                proof: apple,
            }),
            right: Some(BoundEntry {
                key: Bytes::from_static(b"grape"),
                value: Bytes::from_static(b"purple"),
                proof: grape,
            }),
        };
        assert!(!verify_non_membership(&fake, &hash, b"banana"));
    }

    #[test]
    fn test_empty_tree_non_membership() {
        let proof = NonMembershipProof {
            left: None,
            right: None,
        };
        assert!(verify_non_membership(&proof, &empty_tree_hash(), b"any"));
        let (_, hash) = build_committed(PAIRS);
        assert!(!verify_non_membership(&proof, &hash, b"any"));
    }
}
