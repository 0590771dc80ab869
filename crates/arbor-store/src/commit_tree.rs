//! Single-writer façade over one versioned tree.

use crate::evict::{self, Evictor};
use crate::store::TreeStore;
use arbor_common::{
    ArborError, NodeId, Result, TreeOptions, MAX_KEY_SIZE, MAX_VALUE_SIZE,
};
use arbor_kv::{KvUpdate, ReplayEntry};
use arbor_tree::{
    commit_traverse, empty_tree_hash, membership_proof, non_membership_proof, ops, verify_tree,
    CommitContext, Hash, MemNode, MembershipProof, MutationContext, NodePtr, NonMembershipProof,
    TreeIterator,
};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{info, warn};

/// Identifier of a committed version: its number and root hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitId {
    pub version: u32,
    pub hash: Hash,
}

/// Mutation state for the version currently being built.
struct WriteState {
    ctx: MutationContext,
    dirty: bool,
    staged_hash: Option<Hash>,
    n_leaves: u32,
    n_branches: u32,
}

impl WriteState {
    fn new(version: u32) -> Self {
        Self {
            ctx: MutationContext::new(version),
            dirty: false,
            staged_hash: None,
            n_leaves: 0,
            n_branches: 0,
        }
    }
}

enum WalMessage {
    Set { leaf: Arc<MemNode> },
    Delete { key: Bytes },
    /// Flush everything enqueued so far and acknowledge.
    Sync(mpsc::Sender<Result<()>>),
}

struct WalHandle {
    tx: mpsc::Sender<WalMessage>,
    thread: JoinHandle<()>,
}

struct MonitorHandle {
    shutdown: mpsc::Sender<()>,
    thread: JoinHandle<()>,
}

/// A versioned key/value tree with commit semantics.
///
/// One writer at a time may call `set`/`delete`/`commit`; any number
/// of readers may call `get`, iterate, or take immutable snapshots
/// concurrently.
pub struct CommitTree {
    store: Arc<TreeStore>,
    root: Arc<RwLock<NodePtr>>,
    write: Mutex<WriteState>,
    staged_version: AtomicU32,
    last_commit: RwLock<CommitId>,
    evictor: Arc<Evictor>,
    wal: Mutex<Option<WalHandle>>,
    monitor: Mutex<Option<MonitorHandle>>,
    closed: AtomicBool,
}

impl CommitTree {
    /// Opens the tree at `dir`, replaying any WAL tail past the last
    /// persisted version.
    pub fn open(dir: impl Into<std::path::PathBuf>, options: TreeOptions) -> Result<CommitTree> {
        let store = Arc::new(TreeStore::open(dir, options.clone())?);
        let root = store.latest_root()?;
        let saved = store.saved_version();
        let hash = if root.is_empty() {
            empty_tree_hash()
        } else {
            root.hash(&*store)?
        };

        let root = Arc::new(RwLock::new(root));
        let tree = CommitTree {
            evictor: Evictor::new(root.clone()),
            root,
            write: Mutex::new(WriteState::new(saved + 1)),
            staged_version: AtomicU32::new(saved + 1),
            last_commit: RwLock::new(CommitId {
                version: saved,
                hash,
            }),
            wal: Mutex::new(None),
            monitor: Mutex::new(None),
            store,
            closed: AtomicBool::new(false),
        };

        tree.replay_wal()?;

        if options.write_wal {
            let state = tree.store.state().clone();
            let (tx, rx) = mpsc::channel();
            let thread = std::thread::Builder::new()
                .name("arbor-wal".to_string())
                .spawn(move || wal_loop(state, rx))
                .map_err(|e| ArborError::io_at("spawn", "arbor-wal", e))?;
            *tree.wal.lock() = Some(WalHandle { tx, thread });
        }

        if options.evict_threshold_bytes > 0 {
            let (tx, rx) = mpsc::channel();
            let store = tree.store.clone();
            let depth = if options.evict_enabled() {
                options.evict_depth
            } else {
                0
            };
            let thread = evict::spawn_monitor(
                options.evict_threshold_bytes,
                depth,
                tree.evictor.clone(),
                Arc::new(move || store.readable_version()),
                rx,
            )
            .map_err(|e| ArborError::io_at("spawn", "arbor-evictor", e))?;
            *tree.monitor.lock() = Some(MonitorHandle {
                shutdown: tx,
                thread,
            });
        }

        Ok(tree)
    }

    pub fn store(&self) -> &Arc<TreeStore> {
        &self.store
    }

    /// The version currently being built.
    pub fn staged_version(&self) -> u32 {
        self.staged_version.load(Ordering::SeqCst)
    }

    /// Identifier of the most recent commit; version 0 with the empty
    /// hash before any commit.
    pub fn last_commit_id(&self) -> CommitId {
        *self.last_commit.read()
    }

    fn check_key(key: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(ArborError::EmptyKey);
        }
        if key.len() > MAX_KEY_SIZE {
            return Err(ArborError::KeyTooLarge {
                size: key.len(),
                max: MAX_KEY_SIZE,
            });
        }
        Ok(())
    }

    fn check_value(value: &[u8]) -> Result<()> {
        // An empty value is indistinguishable from absence; reject it
        // at the boundary.
        if value.is_empty() {
            return Err(ArborError::EmptyValue);
        }
        if value.len() > MAX_VALUE_SIZE {
            return Err(ArborError::ValueTooLarge {
                size: value.len(),
                max: MAX_VALUE_SIZE,
            });
        }
        Ok(())
    }

    /// Reads a key from the live (possibly uncommitted) tree.
    pub fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        Self::check_key(key)?;
        let root = self.root.read().clone();
        ops::get(&root, &*self.store, key)
    }

    pub fn has(&self, key: &[u8]) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Sets a key in the staged version. Returns true if an existing
    /// value was replaced.
    pub fn set(&self, key: impl Into<Bytes>, value: impl Into<Bytes>) -> Result<bool> {
        let (key, value) = (key.into(), value.into());
        Self::check_key(&key)?;
        Self::check_value(&value)?;
        self.apply_set(key, value, true)
    }

    fn apply_set(&self, key: Bytes, value: Bytes, wal: bool) -> Result<bool> {
        let mut state = self.write.lock();
        let leaf = Arc::new(MemNode::leaf(key, value, state.ctx.version()));
        if wal {
            if let Some(handle) = &*self.wal.lock() {
                let _ = handle.tx.send(WalMessage::Set { leaf: leaf.clone() });
            }
        }
        let current = self.root.read().clone();
        let (new_root, updated) = ops::set(&current, &*self.store, &mut state.ctx, leaf)?;
        *self.root.write() = new_root;
        state.dirty = true;
        Ok(updated)
    }

    /// Deletes a key from the staged version, returning the removed
    /// value if the key was present.
    pub fn delete(&self, key: &[u8]) -> Result<Option<Bytes>> {
        Self::check_key(key)?;
        self.apply_delete(key, true)
    }

    fn apply_delete(&self, key: &[u8], wal: bool) -> Result<Option<Bytes>> {
        let mut state = self.write.lock();
        if wal {
            if let Some(handle) = &*self.wal.lock() {
                let _ = handle.tx.send(WalMessage::Delete {
                    key: Bytes::copy_from_slice(key),
                });
            }
        }
        let current = self.root.read().clone();
        let (new_root, removed) = ops::remove(&current, &*self.store, &mut state.ctx, key)?;
        if removed.is_some() {
            *self.root.write() = new_root;
            state.dirty = true;
        }
        Ok(removed)
    }

    /// Hash of the staged tree, running the commit traversal on demand.
    pub fn working_hash(&self) -> Result<Hash> {
        let mut state = self.write.lock();
        self.compute_hash(&mut state)
    }

    fn compute_hash(&self, state: &mut WriteState) -> Result<Hash> {
        let root = self.root.read().clone();
        if root.is_empty() {
            state.dirty = false;
            state.staged_hash = Some(empty_tree_hash());
            state.n_leaves = 0;
            state.n_branches = 0;
            return Ok(empty_tree_hash());
        }
        if !state.dirty {
            if let Some(hash) = state.staged_hash {
                return Ok(hash);
            }
        }
        let mut cctx = CommitContext::new(state.ctx.version());
        let hash = commit_traverse(&*self.store, &root, &mut cctx)?;
        state.n_leaves = cctx.leaf_count();
        state.n_branches = cctx.branch_count();
        state.staged_hash = Some(hash);
        state.dirty = false;
        Ok(hash)
    }

    /// Commits the staged version: drains the WAL queue, writes the
    /// commit marker, saves the root, publishes orphans, and runs
    /// per-commit eviction.
    pub fn commit(&self) -> Result<CommitId> {
        let mut state = self.write.lock();
        let version = state.ctx.version();

        // The WAL writer consumes from its queue asynchronously; wait
        // for it to drain before the commit marker goes in.
        {
            let wal = self.wal.lock();
            if let Some(handle) = &*wal {
                let (ack_tx, ack_rx) = mpsc::channel();
                handle
                    .tx
                    .send(WalMessage::Sync(ack_tx))
                    .map_err(|_| ArborError::Closed)?;
                ack_rx.recv().map_err(|_| ArborError::Closed)??;

                let store_state = self.store.state();
                let mut writer = store_state.writer.lock();
                writer
                    .as_mut()
                    .ok_or(ArborError::Closed)?
                    .write_wal_commit(version)?;
            }
        }

        let hash = self.compute_hash(&mut state)?;
        let root = self.root.read().clone();
        self.store
            .save_root(&root, version, state.n_leaves, state.n_branches)?;

        let orphans: Vec<NodeId> = state.ctx.take_orphans();
        self.store.mark_orphans(version, orphans);

        let options = self.store.options();
        if options.evict_enabled() {
            self.evictor
                .evict_below_depth(options.evict_depth, self.store.readable_version());
        }

        self.staged_version.store(version + 1, Ordering::SeqCst);
        *state = WriteState::new(version + 1);
        let id = CommitId { version, hash };
        *self.last_commit.write() = id;
        Ok(id)
    }

    /// Ascending iterator over `[start, end)` on the live tree.
    pub fn iterator(
        &self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> TreeIterator<'_, TreeStore> {
        let root = self.root.read().clone();
        TreeIterator::new(
            &*self.store,
            root,
            start.map(Bytes::copy_from_slice),
            end.map(Bytes::copy_from_slice),
            true,
        )
    }

    /// Descending iterator over `[start, end)` on the live tree.
    pub fn reverse_iterator(
        &self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> TreeIterator<'_, TreeStore> {
        let root = self.root.read().clone();
        TreeIterator::new(
            &*self.store,
            root,
            start.map(Bytes::copy_from_slice),
            end.map(Bytes::copy_from_slice),
            false,
        )
    }

    /// Snapshot of a committed version.
    pub fn get_immutable(&self, version: u32) -> Result<ImmutableTree> {
        let root = self.store.resolve_root(version)?;
        Ok(ImmutableTree {
            store: self.store.clone(),
            root,
            version,
        })
    }

    /// Replays WAL groups past the last persisted version; anything
    /// after the final commit marker is discarded.
    fn replay_wal(&self) -> Result<()> {
        let Some(cs) = self.store.replay_source() else {
            return Ok(());
        };
        let saved = self.store.saved_version();

        let mut groups: Vec<(u32, Vec<ReplayEntry>)> = Vec::new();
        let mut current = Vec::new();
        for entry in cs.kv_reader().replay() {
            match entry? {
                ReplayEntry::Commit { version } => {
                    groups.push((version, std::mem::take(&mut current)));
                }
                entry => current.push(entry),
            }
        }

        for (version, entries) in groups {
            if version <= saved {
                continue;
            }
            let expected = self.staged_version();
            if version != expected {
                return Err(ArborError::VersionMismatch {
                    expected,
                    actual: version,
                });
            }
            info!(version, mutations = entries.len(), "replaying WAL group");
            for entry in entries {
                match entry {
                    ReplayEntry::Set { key, value } => {
                        self.apply_set(key, value, false)?;
                    }
                    ReplayEntry::Delete { key } => {
                        self.apply_delete(&key, false)?;
                    }
                    ReplayEntry::Commit { .. } => unreachable!("commits split groups"),
                }
            }
            self.commit()?;
        }
        Ok(())
    }

    /// Stops the WAL writer and memory monitor, then closes the store.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(handle) = self.wal.lock().take() {
            drop(handle.tx);
            let _ = handle.thread.join();
        }
        if let Some(handle) = self.monitor.lock().take() {
            let _ = handle.shutdown.send(());
            let _ = handle.thread.join();
        }
        self.store.close()
    }
}

impl Drop for CommitTree {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "error closing commit tree");
        }
    }
}

/// Read-only view of one committed version.
pub struct ImmutableTree {
    store: Arc<TreeStore>,
    root: NodePtr,
    version: u32,
}

impl ImmutableTree {
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Root hash of this version.
    pub fn root_hash(&self) -> Result<Hash> {
        if self.root.is_empty() {
            return Ok(empty_tree_hash());
        }
        self.root.hash(&*self.store)
    }

    /// Number of keys in this version.
    pub fn size(&self) -> Result<u32> {
        if self.root.is_empty() {
            return Ok(0);
        }
        self.root.size(&*self.store)
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        ops::get(&self.root, &*self.store, key)
    }

    pub fn has(&self, key: &[u8]) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    pub fn iterator(
        &self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> TreeIterator<'_, TreeStore> {
        TreeIterator::new(
            &*self.store,
            self.root.clone(),
            start.map(Bytes::copy_from_slice),
            end.map(Bytes::copy_from_slice),
            true,
        )
    }

    pub fn reverse_iterator(
        &self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> TreeIterator<'_, TreeStore> {
        TreeIterator::new(
            &*self.store,
            self.root.clone(),
            start.map(Bytes::copy_from_slice),
            end.map(Bytes::copy_from_slice),
            false,
        )
    }

    /// Proof that `key` is present in this version.
    pub fn get_membership_proof(&self, key: &[u8]) -> Result<MembershipProof> {
        membership_proof(&*self.store, &self.root, key)
    }

    /// Proof that `key` is absent from this version.
    pub fn get_non_membership_proof(&self, key: &[u8]) -> Result<NonMembershipProof> {
        non_membership_proof(&*self.store, &self.root, key)
    }

    /// Runs the structural verifier over the whole version.
    pub fn verify(&self) -> Result<()> {
        verify_tree(&*self.store, &self.root)
    }
}

/// Body of the WAL writer thread: drains the queue, appends records
/// through the store's writer, and captures key offsets onto staged
/// leaves.
fn wal_loop(state: Arc<crate::store::StoreState>, rx: mpsc::Receiver<WalMessage>) {
    let mut pending: Vec<(KvUpdate, Option<Arc<MemNode>>)> = Vec::new();
    loop {
        let first = match rx.recv() {
            Ok(message) => message,
            Err(_) => {
                if let Err(e) = flush_wal(&state, &mut pending) {
                    warn!(error = %e, "final WAL flush failed");
                }
                return;
            }
        };
        let mut batch = vec![first];
        while let Ok(message) = rx.try_recv() {
            batch.push(message);
        }
        for message in batch {
            match message {
                WalMessage::Set { leaf } => pending.push((
                    KvUpdate::Set {
                        key: leaf.key().clone(),
                        value: leaf.value().expect("WAL set carries a leaf").clone(),
                    },
                    Some(leaf),
                )),
                WalMessage::Delete { key } => pending.push((KvUpdate::Delete { key }, None)),
                WalMessage::Sync(ack) => {
                    let _ = ack.send(flush_wal(&state, &mut pending));
                }
            }
        }
        if let Err(e) = flush_wal(&state, &mut pending) {
            warn!(error = %e, "WAL flush failed");
        }
    }
}

fn flush_wal(
    state: &crate::store::StoreState,
    pending: &mut Vec<(KvUpdate, Option<Arc<MemNode>>)>,
) -> Result<()> {
    if pending.is_empty() {
        return Ok(());
    }
    let updates: Vec<KvUpdate> = pending.iter().map(|(u, _)| u.clone()).collect();
    let mut writer = state.writer.lock();
    let writer = writer.as_mut().ok_or(ArborError::Closed)?;
    let offsets = writer.write_wal_updates(&updates)?;
    for ((_, leaf), offset) in pending.iter().zip(offsets) {
        if let (Some(leaf), Some(offset)) = (leaf, offset) {
            leaf.set_kv_offset(offset);
        }
    }
    pending.clear();
    Ok(())
}
