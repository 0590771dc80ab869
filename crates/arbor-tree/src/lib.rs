//! Immutable AVL+ tree algorithms for ArborDB.
//!
//! This crate provides:
//! - In-memory nodes and polymorphic node pointers
//! - Recursive get/set/remove with AVL rebalancing
//! - The commit traversal assigning ids and hashes
//! - Range iteration, proofs, and structural verification
//!
//! Persistence is resolved through the [`NodeSource`] trait,
//! implemented by the tree store.

pub mod commit;
pub mod hash;
pub mod iterator;
pub mod node;
pub mod ops;
pub mod proof;
pub mod verify;

pub use commit::{commit_traverse, CommitContext};
pub use hash::{branch_hash, empty_tree_hash, leaf_hash, Hash};
pub use iterator::TreeIterator;
pub use node::{DetachedSource, MemNode, NodePtr, NodeRef, NodeSource};
pub use ops::{get, remove, set, set_kv, MutationContext};
pub use proof::{
    membership_proof, non_membership_proof, verify_membership, verify_non_membership, BoundEntry,
    MembershipProof, NonMembershipProof, ProofStep,
};
pub use verify::verify_tree;
