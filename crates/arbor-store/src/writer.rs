//! Changeset writer: stages committed versions into a changeset.

use crate::changeset::{
    self, Changeset, BRANCHES_FILE, KV_LOG_FILE, LEAVES_FILE, ORPHANS_FILE, VERSIONS_FILE,
};
use arbor_common::{
    ArborError, BranchLayout, ChangesetInfo, FixedRecord, LeafLayout, NodeId, NodeSetInfo,
    Result, VersionInfo,
};
use arbor_kv::{KvLogWriter, KvUpdate};
use arbor_tree::{MemNode, NodePtr};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Appends committed versions to a changeset directory.
///
/// Nodes are serialized in post-order so that children's array offsets
/// are known when their parent record is written. The writer is
/// consumed by [`ChangesetWriter::seal`], which transfers the files to
/// a read-only [`Changeset`].
pub struct ChangesetWriter {
    dir: PathBuf,
    start_version: u32,
    next_version: u32,
    kv: KvLogWriter,
    leaves: ArrayWriter,
    branches: ArrayWriter,
    versions: ArrayWriter,
}

/// Buffered appender over one packed-record file.
pub(crate) struct ArrayWriter {
    path: PathBuf,
    out: BufWriter<File>,
    count: u32,
}

impl ArrayWriter {
    pub(crate) fn create(path: PathBuf) -> Result<Self> {
        let file = File::create(&path).map_err(|e| ArborError::io_at("create", path.clone(), e))?;
        Ok(Self {
            path,
            out: BufWriter::new(file),
            count: 0,
        })
    }

    pub(crate) fn append<T: FixedRecord>(&mut self, record: &T) -> Result<u32> {
        self.out
            .write_all(&record.to_bytes())
            .map_err(|e| ArborError::io_at("write", self.path.clone(), e))?;
        self.count += 1;
        Ok(self.count)
    }

    pub(crate) fn count(&self) -> u32 {
        self.count
    }

    pub(crate) fn flush(&mut self) -> Result<()> {
        self.out
            .flush()
            .map_err(|e| ArborError::io_at("flush", self.path.clone(), e))
    }

    pub(crate) fn sync(&mut self) -> Result<()> {
        self.flush()?;
        self.out
            .get_ref()
            .sync_data()
            .map_err(|e| ArborError::io_at("fsync", self.path.clone(), e))
    }
}

impl ChangesetWriter {
    /// Creates a fresh changeset directory under `tree_dir` starting
    /// at `start_version`.
    pub fn create(tree_dir: &Path, start_version: u32) -> Result<Self> {
        let dir = tree_dir.join(changeset::dir_name(start_version, 0));
        std::fs::create_dir_all(&dir).map_err(|e| ArborError::io_at("mkdir", dir.clone(), e))?;

        let kv_path = dir.join(KV_LOG_FILE);
        let kv_file =
            File::create(&kv_path).map_err(|e| ArborError::io_at("create", kv_path.clone(), e))?;
        // Created empty so the directory has its full complement of
        // files from the start.
        let orphans_path = dir.join(ORPHANS_FILE);
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&orphans_path)
            .map_err(|e| ArborError::io_at("create", orphans_path, e))?;

        Ok(Self {
            leaves: ArrayWriter::create(dir.join(LEAVES_FILE))?,
            branches: ArrayWriter::create(dir.join(BRANCHES_FILE))?,
            versions: ArrayWriter::create(dir.join(VERSIONS_FILE))?,
            kv: KvLogWriter::new(kv_file, kv_path, 0),
            dir,
            start_version,
            next_version: start_version,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn start_version(&self) -> u32 {
        self.start_version
    }

    /// The version the next `save_root` call must carry.
    pub fn next_version(&self) -> u32 {
        self.next_version
    }

    /// Number of versions saved into this changeset so far.
    pub fn version_count(&self) -> u32 {
        self.versions.count
    }

    /// Current size of the changeset in bytes, including buffered
    /// writes.
    pub fn size(&self) -> u64 {
        self.kv.size()
            + (self.leaves.count as u64) * LeafLayout::SIZE as u64
            + (self.branches.count as u64) * BranchLayout::SIZE as u64
            + (self.versions.count as u64) * VersionInfo::SIZE as u64
    }

    /// Appends a batch of WAL records, returning key offsets for the
    /// `Set` entries.
    pub fn write_wal_updates(&mut self, updates: &[KvUpdate]) -> Result<Vec<Option<u32>>> {
        self.kv.write_updates(updates)
    }

    /// Appends a WAL commit marker and flushes the log.
    pub fn write_wal_commit(&mut self, version: u32) -> Result<()> {
        self.kv.write_commit(version)?;
        self.kv.flush()
    }

    /// Serializes `root`'s staged nodes and appends the version record.
    ///
    /// `n_leaves`/`n_branches` are the counts assigned by the commit
    /// traversal; the serialized node counts must match them.
    pub fn save_root(
        &mut self,
        root: &NodePtr,
        version: u32,
        n_leaves: u32,
        n_branches: u32,
    ) -> Result<VersionInfo> {
        if version != self.next_version {
            return Err(ArborError::VersionMismatch {
                expected: self.next_version,
                actual: version,
            });
        }

        let leaf_start = self.leaves.count;
        let branch_start = self.branches.count;

        let root_id = if root.is_empty() {
            NodeId::EMPTY
        } else {
            let (id, _) = self.write_node(root, version)?;
            id
        };

        let leaves_written = self.leaves.count - leaf_start;
        let branches_written = self.branches.count - branch_start;
        if leaves_written != n_leaves || branches_written != n_branches {
            return Err(ArborError::Structure(format!(
                "version {version} serialized {leaves_written}/{branches_written} nodes, \
                 commit pass assigned {n_leaves}/{n_branches}"
            )));
        }

        let version_info = VersionInfo {
            leaves: NodeSetInfo {
                start_offset: leaf_start,
                count: n_leaves,
                start_index: if n_leaves > 0 { 1 } else { 0 },
                end_index: n_leaves,
            },
            branches: NodeSetInfo {
                start_offset: branch_start,
                count: n_branches,
                start_index: if n_branches > 0 { 1 } else { 0 },
                end_index: n_branches,
            },
            root_id,
        };
        self.versions.append(&version_info)?;
        self.next_version += 1;

        // Keep info.dat current after every completed save so a crash
        // never leaves a committed version in a non-ready directory.
        self.flush()?;
        changeset::write_info(&self.dir, &self.current_info())?;

        Ok(version_info)
    }

    /// Writes the staged nodes under `ptr` in post-order. Returns the
    /// node id and, when the node's record lives in this changeset,
    /// its 1-based array offset (0 otherwise).
    fn write_node(&mut self, ptr: &NodePtr, version: u32) -> Result<(NodeId, u32)> {
        let node: &Arc<MemNode> = match ptr {
            NodePtr::Empty => {
                return Err(ArborError::Structure(
                    "unexpected empty pointer during serialization".to_string(),
                ))
            }
            NodePtr::Ref(r) => {
                let hint = if r.id.version() >= self.start_version {
                    r.file_idx
                } else {
                    0
                };
                return Ok((r.id, hint));
            }
            NodePtr::Mem(node) => node,
        };

        if node.version() != version {
            // Already persisted by an earlier version; only report
            // where it lives.
            let id = node.id();
            let hint = if id.version() >= self.start_version {
                node.file_idx()
            } else {
                0
            };
            return Ok((id, hint));
        }

        let hash = node.hash().ok_or_else(|| {
            ArborError::Structure(format!("staged node {} has no hash", node.id()))
        })?;

        if node.is_leaf() {
            let key_offset = match node.kv_offset() {
                0 => {
                    let offset = self
                        .kv
                        .write_key_value(node.key(), node.value().expect("leaf has a value"))?;
                    node.set_kv_offset(offset);
                    offset
                }
                // The WAL writer already stored this leaf's payload.
                offset => offset,
            };
            let file_idx = self.leaves.append(&LeafLayout {
                id: node.id(),
                hash,
                key_offset,
            })?;
            node.set_file_idx(file_idx);
            return Ok((node.id(), file_idx));
        }

        let (left_id, left_offset) = self.write_node(&node.left(), version)?;
        let (right_id, right_offset) = self.write_node(&node.right(), version)?;
        let key_offset = self.kv.write_key(node.key())?;
        let file_idx = self.branches.append(&BranchLayout {
            id: node.id(),
            left_id,
            right_id,
            left_offset,
            right_offset,
            key_offset,
            height: node.height(),
            size: node.size(),
            hash,
        })?;
        node.set_file_idx(file_idx);
        Ok((node.id(), file_idx))
    }

    fn current_info(&self) -> ChangesetInfo {
        ChangesetInfo {
            start_version: self.start_version,
            end_version: self.next_version.saturating_sub(1),
            ..Default::default()
        }
    }

    fn flush(&mut self) -> Result<()> {
        self.kv.flush()?;
        self.leaves.flush()?;
        self.branches.flush()?;
        self.versions.flush()
    }

    /// Flushes and fsyncs all files (fsync loop, seal).
    pub fn sync(&mut self) -> Result<()> {
        self.kv.sync()?;
        self.leaves.sync()?;
        self.branches.sync()?;
        self.versions.sync()
    }

    /// Materializes a read-only view of the current state. The writer
    /// keeps appending afterward; the view is stable because records
    /// below its mapped length never move.
    pub fn create_shared_reader(&mut self) -> Result<Arc<Changeset>> {
        debug_assert!(self.next_version > self.start_version, "no saved versions");
        self.flush()?;
        Changeset::open_with_info(self.dir.clone(), self.current_info())
    }

    /// Finalizes the changeset and transfers ownership of its files to
    /// a read-only [`Changeset`]. The writer is consumed.
    pub fn seal(mut self) -> Result<Arc<Changeset>> {
        self.sync()?;
        changeset::write_info(&self.dir, &self.current_info())?;
        Changeset::open(self.dir)
    }

    /// Deletes the (empty) changeset directory instead of sealing it.
    /// Used on close when no version was ever saved.
    pub fn discard(self) -> Result<()> {
        let dir = self.dir.clone();
        drop(self);
        std::fs::remove_dir_all(&dir).map_err(|e| ArborError::io_at("remove_dir_all", dir, e))
    }
}
