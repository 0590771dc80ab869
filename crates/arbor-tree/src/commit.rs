//! Commit traversal: hash computation and node-id assignment.

use crate::hash::{branch_hash, leaf_hash, Hash};
use crate::node::{NodePtr, NodeSource};
use arbor_common::{NodeId, Result};

/// Counter state threaded through the commit traversal.
#[derive(Debug)]
pub struct CommitContext {
    version: u32,
    leaf_count: u32,
    branch_count: u32,
}

impl CommitContext {
    /// Creates a context for assigning ids at `version`.
    pub fn new(version: u32) -> Self {
        Self {
            version,
            leaf_count: 0,
            branch_count: 0,
        }
    }

    /// Number of leaves assigned so far.
    pub fn leaf_count(&self) -> u32 {
        self.leaf_count
    }

    /// Number of branches assigned so far.
    pub fn branch_count(&self) -> u32 {
        self.branch_count
    }
}

/// Walks the staged subtree in post-order, assigning ids (in-order for
/// leaves, post-order for branches) and computing hashes.
///
/// Nodes from other versions are left untouched; their hash is
/// authoritative. Re-running the pass over a staged tree re-assigns
/// every staged id (a later insert can shift in-order numbering) but
/// skips hash recomputation where a hash is already cached, since
/// hashes do not depend on ids.
pub fn commit_traverse<S: NodeSource>(
    source: &S,
    ptr: &NodePtr,
    ctx: &mut CommitContext,
) -> Result<Hash> {
    let node = ptr.resolve(source)?;

    if node.version() != ctx.version {
        return node.hash().ok_or_else(|| {
            arbor_common::ArborError::Structure(format!(
                "committed node {} has no hash",
                node.id()
            ))
        });
    }

    if node.is_leaf() {
        ctx.leaf_count += 1;
        node.set_id(NodeId::leaf(ctx.version, ctx.leaf_count));
        let hash = match node.hash() {
            Some(hash) => hash,
            None => {
                let hash = leaf_hash(
                    node.version(),
                    node.key(),
                    node.value().expect("leaf has a value"),
                );
                node.set_hash(hash);
                hash
            }
        };
        return Ok(hash);
    }

    let left_hash = commit_traverse(source, &node.left(), ctx)?;
    let right_hash = commit_traverse(source, &node.right(), ctx)?;
    ctx.branch_count += 1;
    node.set_id(NodeId::branch(ctx.version, ctx.branch_count));
    let hash = match node.hash() {
        Some(hash) => hash,
        None => {
            let hash = branch_hash(
                node.height(),
                node.size(),
                node.version(),
                &left_hash,
                &right_hash,
            );
            node.set_hash(hash);
            hash
        }
    };
    Ok(hash)
}
