//! Recursive tree mutation and lookup.
//!
//! All functions operate on node pointers and resolve persisted nodes
//! through a [`NodeSource`]. Mutations never edit reachable nodes in
//! place: every changed path allocates fresh nodes at the staged
//! version and records the replaced persisted nodes as orphans in the
//! [`MutationContext`].

use crate::node::{MemNode, NodePtr, NodeSource};
use arbor_common::{NodeId, Result};
use bytes::Bytes;
use std::sync::Arc;

/// Collects the side effects of mutations staged for one version.
#[derive(Debug)]
pub struct MutationContext {
    version: u32,
    orphans: Vec<NodeId>,
}

impl MutationContext {
    /// Creates a context staging mutations at `version`.
    pub fn new(version: u32) -> Self {
        Self {
            version,
            orphans: Vec::new(),
        }
    }

    /// The staged version new nodes are created at.
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Records `node` as orphaned if it belongs to a committed
    /// version. Nodes created at the staged version were never
    /// persisted, so replacing them is not an orphaning event.
    pub fn orphan(&mut self, node: &MemNode) {
        if node.version() < self.version {
            debug_assert!(
                !node.id().is_empty(),
                "committed node without an id: {:?}",
                node
            );
            self.orphans.push(node.id());
        }
    }

    /// Number of orphans recorded so far.
    pub fn orphan_count(&self) -> usize {
        self.orphans.len()
    }

    /// Drains the recorded orphans.
    pub fn take_orphans(&mut self) -> Vec<NodeId> {
        std::mem::take(&mut self.orphans)
    }
}

/// Looks up `key` starting from `ptr`.
pub fn get<S: NodeSource>(ptr: &NodePtr, source: &S, key: &[u8]) -> Result<Option<Bytes>> {
    if ptr.is_empty() {
        return Ok(None);
    }
    let mut node = ptr.resolve(source)?;
    loop {
        if node.is_leaf() {
            return Ok(if &node.key()[..] == key {
                node.value().cloned()
            } else {
                None
            });
        }
        // The branch key is the least key of the right subtree, so
        // equality descends right, matching leaf placement.
        let go_left = key < &node.key()[..];
        node = node.resolve_child(source, go_left)?;
    }
}

/// Inserts or updates the key carried by `leaf`, a fresh leaf at the
/// staged version. Returns the new root and whether an existing value
/// was replaced. The leaf `Arc` itself is linked into the tree, so a
/// caller may retain it (the WAL writer captures payload offsets onto
/// it).
pub fn set<S: NodeSource>(
    ptr: &NodePtr,
    source: &S,
    ctx: &mut MutationContext,
    leaf: Arc<MemNode>,
) -> Result<(NodePtr, bool)> {
    debug_assert!(leaf.is_leaf() && leaf.version() == ctx.version());
    if ptr.is_empty() {
        return Ok((NodePtr::Mem(leaf), false));
    }
    let node = ptr.resolve(source)?;

    if node.is_leaf() {
        if leaf.key() == node.key() {
            ctx.orphan(&node);
            return Ok((NodePtr::Mem(leaf), true));
        }
        // Split into a branch over the two leaves; the branch key is
        // the greater of the two, i.e. the right child's key.
        let old_leaf = NodePtr::Mem(node.clone());
        let (left, right, branch_key) = if leaf.key() < node.key() {
            (NodePtr::Mem(leaf), old_leaf, node.key().clone())
        } else {
            let key = leaf.key().clone();
            (old_leaf, NodePtr::Mem(leaf), key)
        };
        let branch = build_branch(source, ctx, branch_key, left, right)?;
        return Ok((NodePtr::Mem(branch), false));
    }

    ctx.orphan(&node);
    let go_left = leaf.key() < node.key();
    let child = node.child(go_left);
    let (new_child, updated) = set(&child, source, ctx, leaf)?;
    let (left, right) = if go_left {
        (new_child, node.right())
    } else {
        (node.left(), new_child)
    };
    let rebuilt = build_branch(source, ctx, node.key().clone(), left, right)?;
    let balanced = rebalance(source, ctx, rebuilt)?;
    Ok((NodePtr::Mem(balanced), updated))
}

/// Convenience wrapper building the staged leaf from a key/value pair.
pub fn set_kv<S: NodeSource>(
    ptr: &NodePtr,
    source: &S,
    ctx: &mut MutationContext,
    key: Bytes,
    value: Bytes,
) -> Result<(NodePtr, bool)> {
    let leaf = Arc::new(MemNode::leaf(key, value, ctx.version()));
    set(ptr, source, ctx, leaf)
}

/// Removes `key`. Returns the new root and the removed value, or the
/// original root unchanged when the key is absent.
pub fn remove<S: NodeSource>(
    ptr: &NodePtr,
    source: &S,
    ctx: &mut MutationContext,
    key: &[u8],
) -> Result<(NodePtr, Option<Bytes>)> {
    if ptr.is_empty() {
        return Ok((ptr.clone(), None));
    }
    let node = ptr.resolve(source)?;

    if node.is_leaf() {
        if key == &node.key()[..] {
            ctx.orphan(&node);
            return Ok((NodePtr::Empty, node.value().cloned()));
        }
        return Ok((ptr.clone(), None));
    }

    let go_left = key < &node.key()[..];
    let child = node.child(go_left);
    let (new_child, removed) = remove(&child, source, ctx, key)?;
    if removed.is_none() {
        return Ok((ptr.clone(), None));
    }
    ctx.orphan(&node);
    if new_child.is_empty() {
        // A subtree collapsed; promote the other side in place of this
        // branch.
        return Ok((node.child(!go_left), removed));
    }
    let (left, right) = if go_left {
        (new_child, node.right())
    } else {
        (node.left(), new_child)
    };
    let rebuilt = build_branch(source, ctx, node.key().clone(), left, right)?;
    let balanced = rebalance(source, ctx, rebuilt)?;
    Ok((NodePtr::Mem(balanced), removed))
}

/// Builds a fresh branch at the staged version, recomputing height and
/// size from the children.
fn build_branch<S: NodeSource>(
    source: &S,
    ctx: &MutationContext,
    key: Bytes,
    left: NodePtr,
    right: NodePtr,
) -> Result<Arc<MemNode>> {
    let l = left.resolve(source)?;
    let r = right.resolve(source)?;
    let height = 1 + l.height().max(r.height());
    let size = l.size() + r.size();
    Ok(Arc::new(MemNode::branch(
        key,
        ctx.version(),
        height,
        size,
        left,
        right,
    )))
}

fn balance_factor<S: NodeSource>(source: &S, node: &MemNode) -> Result<i32> {
    let l = node.resolve_child(source, true)?;
    let r = node.resolve_child(source, false)?;
    Ok(l.height() as i32 - r.height() as i32)
}

/// Restores the AVL invariant after a single insert or remove. A
/// single rotation is preferred whenever the inner child's balance
/// allows it.
fn rebalance<S: NodeSource>(
    source: &S,
    ctx: &mut MutationContext,
    node: Arc<MemNode>,
) -> Result<Arc<MemNode>> {
    let bf = balance_factor(source, &node)?;
    if bf > 1 {
        let left = node.resolve_child(source, true)?;
        if balance_factor(source, &left)? < 0 {
            // left-right: rotate the left child left, then this node
            // right. `node` is staged-fresh, so updating its child
            // slot before the second rotation is safe.
            let new_left = rotate_left(source, ctx, &left)?;
            node.set_child(true, NodePtr::Mem(new_left));
        }
        rotate_right(source, ctx, &node)
    } else if bf < -1 {
        let right = node.resolve_child(source, false)?;
        if balance_factor(source, &right)? > 0 {
            let new_right = rotate_right(source, ctx, &right)?;
            node.set_child(false, NodePtr::Mem(new_right));
        }
        rotate_left(source, ctx, &node)
    } else {
        Ok(node)
    }
}

/// Rotates `node` left; `node` and its right child are replaced by
/// fresh branches and orphaned if they were persisted.
fn rotate_left<S: NodeSource>(
    source: &S,
    ctx: &mut MutationContext,
    node: &Arc<MemNode>,
) -> Result<Arc<MemNode>> {
    ctx.orphan(node);
    let r = node.resolve_child(source, false)?;
    ctx.orphan(&r);
    let new_left = build_branch(source, ctx, node.key().clone(), node.left(), r.left())?;
    build_branch(
        source,
        ctx,
        r.key().clone(),
        NodePtr::Mem(new_left),
        r.right(),
    )
}

/// Rotates `node` right; the mirror of [`rotate_left`].
fn rotate_right<S: NodeSource>(
    source: &S,
    ctx: &mut MutationContext,
    node: &Arc<MemNode>,
) -> Result<Arc<MemNode>> {
    ctx.orphan(node);
    let l = node.resolve_child(source, true)?;
    ctx.orphan(&l);
    let new_right = build_branch(source, ctx, node.key().clone(), l.right(), node.right())?;
    build_branch(
        source,
        ctx,
        l.key().clone(),
        l.left(),
        NodePtr::Mem(new_right),
    )
}
