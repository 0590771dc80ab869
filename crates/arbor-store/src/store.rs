//! The tree store: changeset registry, routing, and background work.

use crate::changeset::{self, Changeset};
use crate::cleanup::{self, CleanupShared, Disposal, OrphanBatch};
use crate::writer::ChangesetWriter;
use arbor_common::{ArborError, NodeId, Result, TreeOptions};
use arbor_tree::{MemNode, NodePtr, NodeRef, NodeSource};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Shared state reachable from both the public store handle and the
/// background loops.
pub(crate) struct StoreState {
    pub(crate) dir: PathBuf,
    pub(crate) options: TreeOptions,
    /// Changesets keyed by start version. A version `v` is resolvable
    /// iff some entry contains `v` and was installed via a
    /// shared-reader refresh or a seal.
    pub(crate) registry: RwLock<BTreeMap<u32, Arc<Changeset>>>,
    pub(crate) writer: Mutex<Option<ChangesetWriter>>,
    pub(crate) saved_version: AtomicU32,
    pub(crate) closed: AtomicBool,
    pub(crate) cleanup: CleanupShared,
}

impl StoreState {
    /// Returns the registered changeset whose range contains `version`.
    pub(crate) fn changeset_for(&self, version: u32) -> Result<Arc<Changeset>> {
        let registry = self.registry.read();
        let entry = registry
            .range(..=version)
            .next_back()
            .map(|(_, cs)| cs.clone())
            .ok_or(ArborError::NoChangeset(version))?;
        if entry.end_version() < version {
            return Err(ArborError::NoChangeset(version));
        }
        Ok(entry)
    }

    /// Marks a changeset stale and disposes it now or via the cleanup
    /// queue once the last reader unpins it.
    pub(crate) fn retire(&self, cs: Arc<Changeset>, delete_files: bool) {
        cs.mark_evicted();
        if cs.try_dispose() {
            if delete_files {
                if let Err(e) = cs.delete_files() {
                    warn!(dir = %cs.dir().display(), error = %e, "failed to delete changeset");
                }
            }
        } else {
            debug!(
                start = cs.start_version(),
                refs = cs.ref_count(),
                "changeset still pinned, queueing disposal"
            );
            self.cleanup.disposals.lock().push(Disposal { cs, delete_files });
        }
    }

    /// Start version of the changeset the writer is currently filling.
    pub(crate) fn active_start_version(&self) -> u32 {
        self.writer
            .lock()
            .as_ref()
            .map(|w| w.start_version())
            .unwrap_or(u32::MAX)
    }

    pub(crate) fn resolve_node(&self, id: NodeId, file_idx: u32) -> Result<Arc<MemNode>> {
        // A disposal may race the registry lookup; the successor
        // changeset answers on retry.
        for _ in 0..3 {
            let cs = self.changeset_for(id.version())?;
            match cs.resolve(id, file_idx) {
                Err(ArborError::Disposed) => continue,
                other => return other,
            }
        }
        Err(ArborError::Structure(format!(
            "node {id} unresolvable: changeset disposed on every retry"
        )))
    }
}

struct LoopHandle {
    shutdown: mpsc::Sender<()>,
    thread: JoinHandle<()>,
}

impl LoopHandle {
    fn stop(self) {
        let _ = self.shutdown.send(());
        let _ = self.thread.join();
    }
}

/// Registry of changesets for one tree, owner of the active writer and
/// the background cleanup/compaction and fsync loops.
pub struct TreeStore {
    state: Arc<StoreState>,
    cleanup_loop: Mutex<Option<LoopHandle>>,
    fsync_loop: Mutex<Option<LoopHandle>>,
}

impl TreeStore {
    /// Opens (or creates) the tree directory, loading every ready
    /// changeset and deleting superseded or torn ones.
    pub fn open(dir: impl Into<PathBuf>, options: TreeOptions) -> Result<TreeStore> {
        options.validate()?;
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| ArborError::io_at("mkdir", dir.clone(), e))?;

        let mut registry = BTreeMap::new();
        let mut saved_version = 0;
        for (start, path) in select_winners(&dir)? {
            match Changeset::open(path.clone()) {
                Ok(cs) => {
                    saved_version = saved_version.max(cs.end_version());
                    registry.insert(start, cs);
                }
                Err(e) => {
                    // Not ready: a torn seal or compaction output.
                    warn!(dir = %path.display(), error = %e, "deleting non-ready changeset");
                    let _ = std::fs::remove_dir_all(&path);
                }
            }
        }
        info!(
            dir = %dir.display(),
            changesets = registry.len(),
            saved_version,
            "tree store opened"
        );

        let writer = ChangesetWriter::create(&dir, saved_version + 1)?;
        let state = Arc::new(StoreState {
            dir,
            options: options.clone(),
            registry: RwLock::new(registry),
            writer: Mutex::new(Some(writer)),
            saved_version: AtomicU32::new(saved_version),
            closed: AtomicBool::new(false),
            cleanup: CleanupShared::default(),
        });

        let cleanup_loop = {
            let (tx, rx) = mpsc::channel();
            let state = state.clone();
            let thread = std::thread::Builder::new()
                .name("arbor-cleanup".to_string())
                .spawn(move || cleanup::run(state, rx))
                .map_err(|e| ArborError::io_at("spawn", "arbor-cleanup", e))?;
            LoopHandle {
                shutdown: tx,
                thread,
            }
        };

        let fsync_loop = if options.fsync_loop_enabled() {
            let (tx, rx) = mpsc::channel();
            let state = state.clone();
            let interval = Duration::from_millis(options.fsync_interval_ms as u64);
            let thread = std::thread::Builder::new()
                .name("arbor-fsync".to_string())
                .spawn(move || fsync_loop(state, rx, interval))
                .map_err(|e| ArborError::io_at("spawn", "arbor-fsync", e))?;
            Some(LoopHandle {
                shutdown: tx,
                thread,
            })
        } else {
            None
        };

        Ok(TreeStore {
            state,
            cleanup_loop: Mutex::new(Some(cleanup_loop)),
            fsync_loop: Mutex::new(fsync_loop),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.state.dir
    }

    pub fn options(&self) -> &TreeOptions {
        &self.state.options
    }

    /// The latest version saved through the writer.
    pub fn saved_version(&self) -> u32 {
        self.state.saved_version.load(Ordering::SeqCst)
    }

    /// The latest version resolvable through a published reader; lags
    /// `saved_version` by up to the reader update interval. Eviction
    /// must not demote nodes newer than this.
    pub fn readable_version(&self) -> u32 {
        self.state
            .registry
            .read()
            .values()
            .next_back()
            .map(|cs| cs.end_version())
            .unwrap_or(0)
    }

    /// Resolves the root pointer of the latest committed version;
    /// empty before the first commit.
    pub fn latest_root(&self) -> Result<NodePtr> {
        let version = self.saved_version();
        if version == 0 {
            return Ok(NodePtr::Empty);
        }
        self.resolve_root(version)
    }

    /// Resolves the root pointer of a specific committed version.
    pub fn resolve_root(&self, version: u32) -> Result<NodePtr> {
        if version == 0 {
            return Err(ArborError::NoChangeset(0));
        }
        let cs = self.state.changeset_for(version)?;
        let vi = cs.version_info(version)?;
        if vi.root_id.is_empty() {
            return Ok(NodePtr::Empty);
        }
        // The root is the last node of its kind written for the
        // version; offer that position as a hint.
        let set = if vi.root_id.is_leaf() {
            &vi.leaves
        } else {
            &vi.branches
        };
        Ok(NodePtr::Ref(NodeRef {
            id: vi.root_id,
            file_idx: set.start_offset + set.count,
        }))
    }

    /// Serializes a committed version and applies the seal/refresh
    /// policy.
    pub fn save_root(
        &self,
        root: &NodePtr,
        version: u32,
        n_leaves: u32,
        n_branches: u32,
    ) -> Result<()> {
        if self.state.closed.load(Ordering::SeqCst) {
            return Err(ArborError::Closed);
        }
        let state = &self.state;
        let mut writer_guard = state.writer.lock();
        let writer = writer_guard.as_mut().ok_or(ArborError::Closed)?;

        writer.save_root(root, version, n_leaves, n_branches)?;
        state.saved_version.store(version, Ordering::SeqCst);

        if writer.size() >= state.options.changeset_max_target {
            let writer = writer_guard.take().expect("writer present");
            let start = writer.start_version();
            let sealed = writer.seal()?;
            debug!(start, end = version, "sealed changeset");
            let old = state.registry.write().insert(start, sealed);
            if let Some(old) = old {
                state.retire(old, false);
            }
            *writer_guard = Some(ChangesetWriter::create(&state.dir, version + 1)?);
        } else if (version - writer.start_version()) % state.options.effective_reader_interval()
            == 0
        {
            let reader = writer.create_shared_reader()?;
            let start = writer.start_version();
            let old = state.registry.write().insert(start, reader);
            if let Some(old) = old {
                state.retire(old, false);
            }
        }
        Ok(())
    }

    /// Hands a committed version's orphan ids to the cleanup loop.
    pub fn mark_orphans(&self, version: u32, ids: Vec<NodeId>) {
        if ids.is_empty() {
            return;
        }
        self.state
            .cleanup
            .orphans
            .lock()
            .push(OrphanBatch { version, ids });
    }

    /// The kv log of the most recent changeset, for WAL replay.
    pub fn replay_source(&self) -> Option<Arc<Changeset>> {
        let registry = self.state.registry.read();
        registry.values().next_back().cloned()
    }

    /// Stops background loops, seals the active writer, and flushes
    /// pending orphans.
    pub fn close(&self) -> Result<()> {
        if self.state.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(handle) = self.fsync_loop.lock().take() {
            handle.stop();
        }

        // Seal the writer first so the final cleanup drain can flush
        // orphans owned by the now-sealed changeset.
        let writer = self.state.writer.lock().take();
        if let Some(writer) = writer {
            if writer.version_count() == 0 {
                writer.discard()?;
            } else {
                let start = writer.start_version();
                let sealed = writer.seal()?;
                let old = self.state.registry.write().insert(start, sealed);
                if let Some(old) = old {
                    self.state.retire(old, false);
                }
            }
        }

        if let Some(handle) = self.cleanup_loop.lock().take() {
            handle.stop();
        }
        info!(dir = %self.state.dir.display(), "tree store closed");
        Ok(())
    }

    pub(crate) fn state(&self) -> &Arc<StoreState> {
        &self.state
    }
}

impl NodeSource for TreeStore {
    fn resolve_node(&self, id: NodeId, file_idx: u32) -> Result<Arc<MemNode>> {
        self.state.resolve_node(id, file_idx)
    }
}

impl Drop for TreeStore {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "error closing tree store");
        }
    }
}

/// Scans the tree directory and keeps, per start version, the path
/// with the highest `compacted_at` suffix, deleting superseded copies.
fn select_winners(dir: &Path) -> Result<Vec<(u32, PathBuf)>> {
    let mut winners: BTreeMap<u32, (u32, PathBuf)> = BTreeMap::new();
    let entries =
        std::fs::read_dir(dir).map_err(|e| ArborError::io_at("read_dir", dir.to_path_buf(), e))?;
    for entry in entries {
        let entry = entry.map_err(|e| ArborError::io_at("read_dir", dir.to_path_buf(), e))?;
        if !entry.path().is_dir() {
            continue;
        }
        let name = entry.file_name();
        let Some((start, compacted_at)) = name.to_str().and_then(changeset::parse_dir_name)
        else {
            warn!(name = %name.to_string_lossy(), "ignoring unrecognized directory");
            continue;
        };
        match winners.get(&start) {
            Some((best, best_path)) => {
                if compacted_at > *best {
                    let superseded = best_path.clone();
                    debug!(dir = %superseded.display(), "deleting superseded changeset");
                    let _ = std::fs::remove_dir_all(&superseded);
                    winners.insert(start, (compacted_at, entry.path()));
                } else {
                    debug!(dir = %entry.path().display(), "deleting superseded changeset");
                    let _ = std::fs::remove_dir_all(entry.path());
                }
            }
            None => {
                winners.insert(start, (compacted_at, entry.path()));
            }
        }
    }
    Ok(winners
        .into_iter()
        .map(|(start, (_, path))| (start, path))
        .collect())
}

fn fsync_loop(state: Arc<StoreState>, shutdown: mpsc::Receiver<()>, interval: Duration) {
    loop {
        match shutdown.recv_timeout(interval) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => return,
            Err(mpsc::RecvTimeoutError::Timeout) => {}
        }
        let mut writer = state.writer.lock();
        if let Some(writer) = writer.as_mut() {
            if let Err(e) = writer.sync() {
                warn!(error = %e, "background fsync failed");
            }
        }
    }
}
