//! Structural verification of a tree.

use crate::hash::{branch_hash, leaf_hash, Hash};
use crate::node::{NodePtr, NodeSource};
use arbor_common::{ArborError, Result};
use bytes::Bytes;

struct Summary {
    min_key: Bytes,
    max_key: Bytes,
    height: u8,
    size: u32,
    hash: Hash,
}

/// Recursively checks the tree rooted at `root`: key ordering,
/// size/height arithmetic, AVL balance, and hash recomputation against
/// any cached hashes. An empty root is valid.
pub fn verify_tree<S: NodeSource>(source: &S, root: &NodePtr) -> Result<()> {
    if root.is_empty() {
        return Ok(());
    }
    verify_node(source, root).map(|_| ())
}

fn verify_node<S: NodeSource>(source: &S, ptr: &NodePtr) -> Result<Summary> {
    let node = ptr.resolve(source)?;

    if node.is_leaf() {
        if node.height() != 0 || node.size() != 1 {
            return Err(ArborError::Structure(format!(
                "leaf {} has height {} size {}",
                node.id(),
                node.height(),
                node.size()
            )));
        }
        let hash = leaf_hash(
            node.version(),
            node.key(),
            node.value().expect("leaf has a value"),
        );
        check_cached_hash(&node, hash)?;
        return Ok(Summary {
            min_key: node.key().clone(),
            max_key: node.key().clone(),
            height: 0,
            size: 1,
            hash,
        });
    }

    let left = verify_node(source, &node.left())?;
    let right = verify_node(source, &node.right())?;

    if node.height() != 1 + left.height.max(right.height) {
        return Err(ArborError::Structure(format!(
            "branch {} height {} does not match children {}/{}",
            node.id(),
            node.height(),
            left.height,
            right.height
        )));
    }
    if node.size() != left.size + right.size {
        return Err(ArborError::Structure(format!(
            "branch {} size {} does not match children {}+{}",
            node.id(),
            node.size(),
            left.size,
            right.size
        )));
    }
    let balance = left.height as i32 - right.height as i32;
    if balance.abs() > 1 {
        return Err(ArborError::BadBalance {
            node_id: node.id().as_u64(),
            balance,
        });
    }
    // Left keys are strictly below the branch key; right keys start at
    // or above it.
    if left.max_key >= *node.key() || right.min_key < *node.key() {
        return Err(ArborError::Structure(format!(
            "branch {} violates key ordering",
            node.id()
        )));
    }

    let hash = branch_hash(
        node.height(),
        node.size(),
        node.version(),
        &left.hash,
        &right.hash,
    );
    check_cached_hash(&node, hash)?;

    Ok(Summary {
        min_key: left.min_key,
        max_key: right.max_key,
        height: node.height(),
        size: node.size(),
        hash,
    })
}

fn check_cached_hash(node: &crate::node::MemNode, computed: Hash) -> Result<()> {
    if let Some(stored) = node.hash() {
        if stored != computed {
            return Err(ArborError::HashMismatch {
                expected: hex_string(&stored),
                computed: hex_string(&computed),
            });
        }
    }
    Ok(())
}

fn hex_string(hash: &Hash) -> String {
    hash.iter().map(|b| format!("{b:02x}")).collect()
}
