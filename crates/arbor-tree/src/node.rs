//! In-memory nodes and polymorphic node pointers.

use crate::hash::Hash;
use arbor_common::{ArborError, NodeId, Result};
use bytes::Bytes;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// Resolves persisted nodes by id.
///
/// Implemented by the tree store; `file_idx` is a 1-based position
/// hint into the node array of the changeset that referenced the node,
/// or 0 when unknown. Implementations must verify the hint against the
/// record id and fall back to an id search on mismatch (hints go stale
/// across compaction).
pub trait NodeSource {
    fn resolve_node(&self, id: NodeId, file_idx: u32) -> Result<Arc<MemNode>>;
}

/// A source with no backing store. Resolving any reference fails; used
/// for trees that live entirely in memory.
#[derive(Debug, Default, Clone, Copy)]
pub struct DetachedSource;

impl NodeSource for DetachedSource {
    fn resolve_node(&self, id: NodeId, _file_idx: u32) -> Result<Arc<MemNode>> {
        Err(ArborError::Structure(format!(
            "cannot resolve node {id} without a store"
        )))
    }
}

/// An unresolved reference to a persisted node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeRef {
    pub id: NodeId,
    /// 1-based index into the owning changeset's node array; 0 if
    /// unknown.
    pub file_idx: u32,
}

/// Handle to a tree position: empty, an in-memory node, or an
/// unresolved reference into a changeset.
#[derive(Debug, Clone, Default)]
pub enum NodePtr {
    #[default]
    Empty,
    Mem(Arc<MemNode>),
    Ref(NodeRef),
}

impl NodePtr {
    /// Wraps a freshly built node.
    pub fn mem(node: MemNode) -> Self {
        NodePtr::Mem(Arc::new(node))
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, NodePtr::Empty)
    }

    /// Returns the node id without resolving.
    pub fn id(&self) -> NodeId {
        match self {
            NodePtr::Empty => NodeId::EMPTY,
            NodePtr::Mem(node) => node.id(),
            NodePtr::Ref(r) => r.id,
        }
    }

    /// Resolves to an in-memory node, reading through the source for
    /// references.
    pub fn resolve<S: NodeSource>(&self, source: &S) -> Result<Arc<MemNode>> {
        match self {
            NodePtr::Empty => Err(ArborError::Structure(
                "cannot resolve an empty node pointer".to_string(),
            )),
            NodePtr::Mem(node) => Ok(node.clone()),
            NodePtr::Ref(r) => source.resolve_node(r.id, r.file_idx),
        }
    }

    /// AVL height of the referenced subtree.
    pub fn height<S: NodeSource>(&self, source: &S) -> Result<u8> {
        Ok(self.resolve(source)?.height())
    }

    /// Number of leaves in the referenced subtree.
    pub fn size<S: NodeSource>(&self, source: &S) -> Result<u32> {
        Ok(self.resolve(source)?.size())
    }

    /// Hash of the referenced node; an error if it has not been
    /// computed yet.
    pub fn hash<S: NodeSource>(&self, source: &S) -> Result<Hash> {
        let node = self.resolve(source)?;
        node.hash().ok_or_else(|| {
            ArborError::Structure(format!("node {} has no computed hash", node.id()))
        })
    }
}

/// In-memory representation of a tree node.
///
/// Leaves carry a value and no children; branches carry two children
/// and the smallest key of their right subtree. `id`, `hash`,
/// `file_idx`, and `kv_offset` are filled in after construction by the
/// commit pass, the serializer, and the WAL writer, so they use
/// interior mutability; the remaining fields are fixed at creation.
pub struct MemNode {
    height: u8,
    size: u32,
    version: u32,
    key: Bytes,
    value: Option<Bytes>,
    left: RwLock<NodePtr>,
    right: RwLock<NodePtr>,
    hash: RwLock<Option<Hash>>,
    id: AtomicU64,
    file_idx: AtomicU32,
    kv_offset: AtomicU32,
}

impl std::fmt::Debug for MemNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemNode")
            .field("id", &self.id())
            .field("version", &self.version)
            .field("height", &self.height)
            .field("size", &self.size)
            .field("key", &self.key)
            .field("leaf", &self.is_leaf())
            .finish()
    }
}

impl MemNode {
    /// Creates a fresh leaf at the given version.
    pub fn leaf(key: Bytes, value: Bytes, version: u32) -> Self {
        Self {
            height: 0,
            size: 1,
            version,
            key,
            value: Some(value),
            left: RwLock::new(NodePtr::Empty),
            right: RwLock::new(NodePtr::Empty),
            hash: RwLock::new(None),
            id: AtomicU64::new(0),
            file_idx: AtomicU32::new(0),
            kv_offset: AtomicU32::new(0),
        }
    }

    /// Creates a fresh branch at the given version.
    pub fn branch(
        key: Bytes,
        version: u32,
        height: u8,
        size: u32,
        left: NodePtr,
        right: NodePtr,
    ) -> Self {
        Self {
            height,
            size,
            version,
            key,
            value: None,
            left: RwLock::new(left),
            right: RwLock::new(right),
            hash: RwLock::new(None),
            id: AtomicU64::new(0),
            file_idx: AtomicU32::new(0),
            kv_offset: AtomicU32::new(0),
        }
    }

    /// Inflates a persisted leaf record.
    pub fn persisted_leaf(
        id: NodeId,
        key: Bytes,
        value: Bytes,
        hash: Hash,
        kv_offset: u32,
        file_idx: u32,
    ) -> Self {
        let node = Self::leaf(key, value, id.version());
        node.id.store(id.as_u64(), Ordering::SeqCst);
        *node.hash.write() = Some(hash);
        node.kv_offset.store(kv_offset, Ordering::SeqCst);
        node.file_idx.store(file_idx, Ordering::SeqCst);
        node
    }

    /// Inflates a persisted branch record.
    #[allow(clippy::too_many_arguments)]
    pub fn persisted_branch(
        id: NodeId,
        key: Bytes,
        height: u8,
        size: u32,
        hash: Hash,
        kv_offset: u32,
        left: NodeRef,
        right: NodeRef,
        file_idx: u32,
    ) -> Self {
        let node = Self::branch(
            key,
            id.version(),
            height,
            size,
            NodePtr::Ref(left),
            NodePtr::Ref(right),
        );
        node.id.store(id.as_u64(), Ordering::SeqCst);
        *node.hash.write() = Some(hash);
        node.kv_offset.store(kv_offset, Ordering::SeqCst);
        node.file_idx.store(file_idx, Ordering::SeqCst);
        node
    }

    pub fn is_leaf(&self) -> bool {
        self.value.is_some()
    }

    pub fn height(&self) -> u8 {
        self.height
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn key(&self) -> &Bytes {
        &self.key
    }

    /// The leaf value; `None` for branches.
    pub fn value(&self) -> Option<&Bytes> {
        self.value.as_ref()
    }

    pub fn id(&self) -> NodeId {
        NodeId::from_u64(self.id.load(Ordering::SeqCst))
    }

    pub fn set_id(&self, id: NodeId) {
        self.id.store(id.as_u64(), Ordering::SeqCst);
    }

    pub fn hash(&self) -> Option<Hash> {
        *self.hash.read()
    }

    pub fn set_hash(&self, hash: Hash) {
        *self.hash.write() = Some(hash);
    }

    /// 1-based index of this node's record within its changeset's node
    /// array; 0 before serialization.
    pub fn file_idx(&self) -> u32 {
        self.file_idx.load(Ordering::SeqCst)
    }

    pub fn set_file_idx(&self, idx: u32) {
        self.file_idx.store(idx, Ordering::SeqCst);
    }

    /// Offset of this node's key payload in its changeset's kv log;
    /// 0 before any payload write.
    pub fn kv_offset(&self) -> u32 {
        self.kv_offset.load(Ordering::SeqCst)
    }

    pub fn set_kv_offset(&self, offset: u32) {
        self.kv_offset.store(offset, Ordering::SeqCst);
    }

    /// Returns a clone of a child pointer. `left` selects the side.
    pub fn child(&self, left: bool) -> NodePtr {
        if left {
            self.left.read().clone()
        } else {
            self.right.read().clone()
        }
    }

    pub fn left(&self) -> NodePtr {
        self.child(true)
    }

    pub fn right(&self) -> NodePtr {
        self.child(false)
    }

    /// Replaces a child pointer; used by eviction to demote resolved
    /// subtrees back to references.
    pub fn set_child(&self, left: bool, ptr: NodePtr) {
        let slot = if left { &self.left } else { &self.right };
        *slot.write() = ptr;
    }

    /// Resolves a child, caching the resolved node in the child slot so
    /// repeated descents stay cheap.
    pub fn resolve_child<S: NodeSource>(&self, source: &S, left: bool) -> Result<Arc<MemNode>> {
        let slot = if left { &self.left } else { &self.right };
        let ptr = slot.read().clone();
        match ptr {
            NodePtr::Mem(node) => Ok(node),
            NodePtr::Ref(r) => {
                let node = source.resolve_node(r.id, r.file_idx)?;
                *slot.write() = NodePtr::Mem(node.clone());
                Ok(node)
            }
            NodePtr::Empty => Err(ArborError::Structure(format!(
                "branch {} has an empty child",
                self.id()
            ))),
        }
    }

    /// Approximate heap footprint of this node alone, used for
    /// eviction budgeting.
    pub fn footprint(&self) -> usize {
        std::mem::size_of::<MemNode>()
            + self.key.len()
            + self.value.as_ref().map(|v| v.len()).unwrap_or(0)
    }
}
