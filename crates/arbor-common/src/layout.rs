//! Fixed-size on-disk record layouts.
//!
//! Every record is packed little-endian at a fixed size so that a file
//! can be viewed as a plain array of records. Encoding goes through
//! `bytes` buffers; decoding reads from any `&[u8]` of at least
//! `SIZE` bytes.

use crate::node_id::NodeId;
use bytes::{Buf, BufMut, BytesMut};

/// A record with a fixed on-disk size.
pub trait FixedRecord: Sized {
    /// Encoded size in bytes.
    const SIZE: usize;

    /// Appends the encoded record to `buf`.
    fn encode(&self, buf: &mut BytesMut);

    /// Decodes a record from the first `SIZE` bytes of `buf`.
    fn decode(buf: &[u8]) -> Self;

    /// Convenience: encodes into a fresh buffer.
    fn to_bytes(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        self.encode(&mut buf);
        debug_assert_eq!(buf.len(), Self::SIZE);
        buf
    }
}

/// Persisted leaf node record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeafLayout {
    /// Node id (leaf flag set).
    pub id: NodeId,
    /// Node hash.
    pub hash: [u8; 32],
    /// Offset of the key/value payload in the changeset's kv log.
    pub key_offset: u32,
}

impl FixedRecord for LeafLayout {
    const SIZE: usize = 44;

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.id.as_u64());
        buf.put_slice(&self.hash);
        buf.put_u32_le(self.key_offset);
    }

    fn decode(mut buf: &[u8]) -> Self {
        let id = NodeId::from_u64(buf.get_u64_le());
        let mut hash = [0u8; 32];
        buf.copy_to_slice(&mut hash);
        let key_offset = buf.get_u32_le();
        Self {
            id,
            hash,
            key_offset,
        }
    }
}

/// Persisted branch node record.
///
/// `left_offset`/`right_offset` are 1-based indices into the node
/// arrays of the same changeset; 0 means the child lives in another
/// changeset and must be resolved by id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BranchLayout {
    pub id: NodeId,
    pub left_id: NodeId,
    pub right_id: NodeId,
    pub left_offset: u32,
    pub right_offset: u32,
    /// Offset of the branch key in the changeset's kv log.
    pub key_offset: u32,
    /// AVL height (leaves are 0).
    pub height: u8,
    /// Number of leaves in the subtree.
    pub size: u32,
    pub hash: [u8; 32],
}

impl FixedRecord for BranchLayout {
    const SIZE: usize = 76;

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.id.as_u64());
        buf.put_u64_le(self.left_id.as_u64());
        buf.put_u64_le(self.right_id.as_u64());
        buf.put_u32_le(self.left_offset);
        buf.put_u32_le(self.right_offset);
        buf.put_u32_le(self.key_offset);
        buf.put_u8(self.height);
        buf.put_u32_le(self.size);
        buf.put_slice(&self.hash);
        // trailing padding to the fixed record size
        buf.put_bytes(0, 3);
    }

    fn decode(mut buf: &[u8]) -> Self {
        let id = NodeId::from_u64(buf.get_u64_le());
        let left_id = NodeId::from_u64(buf.get_u64_le());
        let right_id = NodeId::from_u64(buf.get_u64_le());
        let left_offset = buf.get_u32_le();
        let right_offset = buf.get_u32_le();
        let key_offset = buf.get_u32_le();
        let height = buf.get_u8();
        let size = buf.get_u32_le();
        let mut hash = [0u8; 32];
        buf.copy_to_slice(&mut hash);
        Self {
            id,
            left_id,
            right_id,
            left_offset,
            right_offset,
            key_offset,
            height,
            size,
            hash,
        }
    }
}

/// Bounds of one version's nodes of one kind within a changeset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NodeSetInfo {
    /// 0-based offset into the node array where this version's nodes
    /// begin.
    pub start_offset: u32,
    /// Number of records belonging to this version.
    pub count: u32,
    /// Smallest id.index in the range.
    pub start_index: u32,
    /// Largest id.index in the range.
    pub end_index: u32,
}

impl NodeSetInfo {
    /// Encoded size in bytes.
    pub const SIZE: usize = 16;

    /// Returns true if the index range maps 1:1 onto the offset range,
    /// allowing direct offset computation.
    pub fn is_contiguous(&self) -> bool {
        self.count > 0 && self.end_index - self.start_index == self.count - 1
    }

    /// Returns true if `index` falls inside the recorded id range.
    pub fn contains_index(&self, index: u32) -> bool {
        self.count > 0 && index >= self.start_index && index <= self.end_index
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.start_offset);
        buf.put_u32_le(self.count);
        buf.put_u32_le(self.start_index);
        buf.put_u32_le(self.end_index);
    }

    fn decode(buf: &mut &[u8]) -> Self {
        Self {
            start_offset: buf.get_u32_le(),
            count: buf.get_u32_le(),
            start_index: buf.get_u32_le(),
            end_index: buf.get_u32_le(),
        }
    }
}

/// Per-version record in `versions.dat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VersionInfo {
    pub leaves: NodeSetInfo,
    pub branches: NodeSetInfo,
    /// Root node id of this version; empty for an empty tree.
    pub root_id: NodeId,
}

impl FixedRecord for VersionInfo {
    const SIZE: usize = 40;

    fn encode(&self, buf: &mut BytesMut) {
        self.leaves.encode(buf);
        self.branches.encode(buf);
        buf.put_u64_le(self.root_id.as_u64());
    }

    fn decode(mut buf: &[u8]) -> Self {
        let leaves = NodeSetInfo::decode(&mut buf);
        let branches = NodeSetInfo::decode(&mut buf);
        let root_id = NodeId::from_u64(buf.get_u64_le());
        Self {
            leaves,
            branches,
            root_id,
        }
    }
}

/// Summary record in `info.dat`, one per changeset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChangesetInfo {
    pub start_version: u32,
    pub end_version: u32,
    pub leaf_orphans: u32,
    pub branch_orphans: u32,
    /// Sum of the orphan versions of all leaf orphans; with the count
    /// this approximates the mean orphan age without scanning.
    pub leaf_orphan_version_total: u64,
    pub branch_orphan_version_total: u64,
}

impl ChangesetInfo {
    /// Number of versions the changeset covers.
    pub fn version_count(&self) -> u32 {
        self.end_version - self.start_version + 1
    }

    /// Returns true if `version` falls in `[start_version, end_version]`.
    pub fn contains_version(&self, version: u32) -> bool {
        version >= self.start_version && version <= self.end_version
    }
}

impl FixedRecord for ChangesetInfo {
    const SIZE: usize = 32;

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.start_version);
        buf.put_u32_le(self.end_version);
        buf.put_u32_le(self.leaf_orphans);
        buf.put_u32_le(self.branch_orphans);
        buf.put_u64_le(self.leaf_orphan_version_total);
        buf.put_u64_le(self.branch_orphan_version_total);
    }

    fn decode(mut buf: &[u8]) -> Self {
        Self {
            start_version: buf.get_u32_le(),
            end_version: buf.get_u32_le(),
            leaf_orphans: buf.get_u32_le(),
            branch_orphans: buf.get_u32_le(),
            leaf_orphan_version_total: buf.get_u64_le(),
            branch_orphan_version_total: buf.get_u64_le(),
        }
    }
}

/// Record in `orphans.dat`: a node that left the live tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrphanRecord {
    /// Version in which the node ceased to belong to the live tree.
    pub orphan_version: u32,
    pub node_id: NodeId,
}

impl FixedRecord for OrphanRecord {
    const SIZE: usize = 12;

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.orphan_version);
        buf.put_u64_le(self.node_id.as_u64());
    }

    fn decode(mut buf: &[u8]) -> Self {
        Self {
            orphan_version: buf.get_u32_le(),
            node_id: NodeId::from_u64(buf.get_u64_le()),
        }
    }
}
