//! Background cleanup: orphan flushing, compaction, and disposal.
//!
//! A single cooperative loop owns all orphan writes and every
//! compaction. External threads only enqueue work through
//! [`CleanupShared`]; the loop drains it, decides which changesets to
//! rewrite or join, swaps the registry atomically, and retires the
//! replaced files.

use crate::changeset::{self, Changeset, KV_LOG_FILE, ORPHANS_FILE};
use crate::store::StoreState;
use crate::writer::ArrayWriter;
use arbor_common::{
    ArborError, BranchLayout, ChangesetInfo, FixedRecord, LeafLayout, NodeId, NodeSetInfo,
    Result, TreeOptions, VersionInfo,
};
use arbor_kv::KvLogWriter;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::File;
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// A committed version's orphaned node ids, as handed to the store.
pub(crate) struct OrphanBatch {
    pub version: u32,
    pub ids: Vec<NodeId>,
}

/// A retired changeset waiting for its last reader to unpin.
pub(crate) struct Disposal {
    pub cs: Arc<Changeset>,
    pub delete_files: bool,
}

/// Work queues shared between the store and the cleanup loop.
#[derive(Default)]
pub(crate) struct CleanupShared {
    pub orphans: Mutex<Vec<OrphanBatch>>,
    pub disposals: Mutex<Vec<Disposal>>,
}

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const MARK_RETRIES: usize = 3;
const DISPOSAL_QUEUE_WARN: usize = 100;

/// Body of the cleanup thread.
pub(crate) fn run(state: Arc<StoreState>, shutdown: mpsc::Receiver<()>) {
    let mut staged: Vec<OrphanBatch> = Vec::new();
    let mut last_cycle: Option<Instant> = None;
    let min_interval = Duration::from_secs(state.options.min_compaction_seconds);

    loop {
        match shutdown.recv_timeout(POLL_INTERVAL) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => {
                // Final drain: flush whatever orphans can be placed and
                // retry outstanding disposals once.
                drain_orphans(&state, &mut staged);
                process_disposals(&state);
                debug!("cleanup loop exiting");
                return;
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
        }

        if last_cycle.is_some_and(|t| t.elapsed() < min_interval) {
            continue;
        }
        last_cycle = Some(Instant::now());

        drain_orphans(&state, &mut staged);
        if !state.options.disable_compaction {
            if let Err(e) = run_compactions(&state) {
                warn!(error = %e, "compaction cycle failed; originals remain installed");
            }
        }
        process_disposals(&state);
    }
}

/// Flushes queued orphans into their owning changesets. Orphans whose
/// node still lives in the active writer's changeset are parked in
/// `staged` and re-checked next cycle.
fn drain_orphans(state: &Arc<StoreState>, staged: &mut Vec<OrphanBatch>) {
    let mut batches: Vec<OrphanBatch> = std::mem::take(staged);
    batches.append(&mut state.cleanup.orphans.lock());
    if batches.is_empty() {
        return;
    }

    let active_start = state.active_start_version();
    for batch in batches {
        let mut parked = Vec::new();
        for id in batch.ids {
            if id.version() >= active_start {
                parked.push(id);
                continue;
            }
            mark_one(state, batch.version, id, &mut parked);
        }
        if !parked.is_empty() {
            staged.push(OrphanBatch {
                version: batch.version,
                ids: parked,
            });
        }
    }
}

fn mark_one(state: &Arc<StoreState>, orphan_version: u32, id: NodeId, parked: &mut Vec<NodeId>) {
    for attempt in 0..MARK_RETRIES {
        let cs = match state.changeset_for(id.version()) {
            Ok(cs) => cs,
            Err(ArborError::NoChangeset(_)) => {
                // The owning changeset has no published reader yet.
                parked.push(id);
                return;
            }
            Err(e) => {
                warn!(node = %id, error = %e, "dropping unmarkable orphan");
                return;
            }
        };
        match cs.mark_orphan(orphan_version, id) {
            Ok(()) => return,
            Err(ArborError::Disposed) if attempt + 1 < MARK_RETRIES => continue,
            Err(e) => {
                warn!(node = %id, error = %e, "failed to mark orphan");
                return;
            }
        }
    }
}

fn process_disposals(state: &Arc<StoreState>) {
    let pending: Vec<Disposal> = std::mem::take(&mut *state.cleanup.disposals.lock());
    if pending.is_empty() {
        return;
    }
    let mut requeue = Vec::new();
    for disposal in pending {
        if disposal.cs.try_dispose() {
            if disposal.delete_files {
                if let Err(e) = disposal.cs.delete_files() {
                    warn!(dir = %disposal.cs.dir().display(), error = %e,
                        "failed to delete disposed changeset");
                }
            }
        } else {
            requeue.push(disposal);
        }
    }
    let mut queue = state.cleanup.disposals.lock();
    queue.extend(requeue);
    if queue.len() > DISPOSAL_QUEUE_WARN {
        warn!(len = queue.len(), "disposal queue is backing up");
    }
}

/// Scans sealed changesets in version order, compacting and joining
/// per the configured triggers.
fn run_compactions(state: &Arc<StoreState>) -> Result<()> {
    let active_start = state.active_start_version();
    let saved = state.saved_version.load(std::sync::atomic::Ordering::SeqCst);
    let opts = &state.options;

    let candidates: Vec<Arc<Changeset>> = {
        let registry = state.registry.read();
        registry
            .values()
            .filter(|cs| cs.start_version() != active_start && !cs.is_disposed())
            .cloned()
            .collect()
    };

    let mut compactor: Option<Compactor> = None;
    for (i, cs) in candidates.iter().enumerate() {
        // A changeset already compacted at the current saved version
        // would rewrite onto its own directory; leave it alone until
        // new commits move the suffix forward.
        if cs.compacted_at() >= saved {
            if let Some(active) = compactor.take() {
                seal_and_swap(state, active)?;
            }
            continue;
        }
        if let Some(mut active) = compactor.take() {
            if opts.compact_wal
                && active.estimated_size() + cs.size_bytes() <= opts.compaction_max_target
            {
                if let Err(e) = active.ingest(cs) {
                    active.abort();
                    return Err(e);
                }
                compactor = Some(active);
                continue;
            }
            seal_and_swap(state, active)?;
        }

        let wants_compaction =
            ready_to_compact(cs, saved, opts) || force_trigger(cs, saved, opts);
        let wants_join = opts.compact_wal
            && candidates.get(i + 1).is_some_and(|next| {
                cs.size_bytes() + next.size_bytes() <= opts.compaction_max_target
            });
        if !(wants_compaction || wants_join) {
            continue;
        }

        let retain_version = saved.saturating_sub(opts.retain_versions);
        let mut fresh = Compactor::create(
            state.dir.clone(),
            cs.start_version(),
            saved,
            retain_version,
            opts.compact_wal,
        )?;
        if let Err(e) = fresh.ingest(cs) {
            fresh.abort();
            return Err(e);
        }
        if opts.compact_wal {
            compactor = Some(fresh);
        } else {
            // Without kv rewriting there is no joining; seal at once.
            seal_and_swap(state, fresh)?;
        }
    }
    if let Some(active) = compactor {
        seal_and_swap(state, active)?;
    }
    Ok(())
}

fn ready_to_compact(cs: &Changeset, saved: u32, opts: &TreeOptions) -> bool {
    let info = cs.info();
    let age_target = saved
        .saturating_sub(opts.retain_versions)
        .saturating_sub(opts.compaction_orphan_age) as u64;

    let kind_ready = |orphans: u32, total: u64, version_total: u64| {
        orphans > 0
            && total > 0
            && (orphans as f64 / total as f64) >= opts.compaction_orphan_ratio
            && version_total / orphans as u64 <= age_target
    };

    kind_ready(
        info.leaf_orphans,
        cs.leaf_total(),
        info.leaf_orphan_version_total,
    ) || kind_ready(
        info.branch_orphans,
        cs.branch_total(),
        info.branch_orphan_version_total,
    )
}

fn force_trigger(cs: &Changeset, saved: u32, opts: &TreeOptions) -> bool {
    if opts.compact_after_versions == 0 {
        return false;
    }
    let info = cs.info();
    (info.leaf_orphans > 0 || info.branch_orphans > 0)
        && saved.saturating_sub(cs.compacted_at()) >= opts.compact_after_versions
}

fn seal_and_swap(state: &Arc<StoreState>, compactor: Compactor) -> Result<()> {
    let included = compactor.included.clone();
    let new_cs = compactor.seal()?;
    info!(
        start = new_cs.start_version(),
        end = new_cs.end_version(),
        joined = included.len(),
        "installed compacted changeset"
    );

    {
        let mut registry = state.registry.write();
        registry.insert(new_cs.start_version(), new_cs.clone());
        for old in &included {
            if old.start_version() != new_cs.start_version() {
                registry.remove(&old.start_version());
            }
        }
    }
    for old in included {
        state.retire(old, true);
    }
    Ok(())
}

/// Rewrites one or more adjacent changesets, dropping nodes orphaned
/// below the retention bottom.
struct Compactor {
    out_dir: PathBuf,
    start_version: u32,
    end_version: u32,
    retain_version: u32,
    compact_wal: bool,
    /// Present when `compact_wal`; otherwise the source kv log is
    /// copied verbatim.
    kv: Option<KvLogWriter>,
    copied_kv_bytes: u64,
    leaves: ArrayWriter,
    branches: ArrayWriter,
    versions: ArrayWriter,
    orphans: ArrayWriter,
    /// New 1-based array offsets for every retained node; children are
    /// always present before their parents.
    id_offsets: HashMap<NodeId, u32>,
    out_info: ChangesetInfo,
    included: Vec<Arc<Changeset>>,
}

impl Compactor {
    fn create(
        tree_dir: PathBuf,
        start_version: u32,
        compacted_at: u32,
        retain_version: u32,
        compact_wal: bool,
    ) -> Result<Self> {
        let out_dir = tree_dir.join(changeset::dir_name(start_version, compacted_at));
        std::fs::create_dir_all(&out_dir)
            .map_err(|e| ArborError::io_at("mkdir", out_dir.clone(), e))?;

        let kv = if compact_wal {
            let path = out_dir.join(KV_LOG_FILE);
            let file =
                File::create(&path).map_err(|e| ArborError::io_at("create", path.clone(), e))?;
            Some(KvLogWriter::new(file, path, 0))
        } else {
            None
        };

        Ok(Self {
            leaves: ArrayWriter::create(out_dir.join(changeset::LEAVES_FILE))?,
            branches: ArrayWriter::create(out_dir.join(changeset::BRANCHES_FILE))?,
            versions: ArrayWriter::create(out_dir.join(changeset::VERSIONS_FILE))?,
            orphans: ArrayWriter::create(out_dir.join(ORPHANS_FILE))?,
            kv,
            copied_kv_bytes: 0,
            out_dir,
            start_version,
            end_version: start_version,
            retain_version,
            compact_wal,
            id_offsets: HashMap::new(),
            out_info: ChangesetInfo {
                start_version,
                end_version: start_version,
                ..Default::default()
            },
            included: Vec::new(),
        })
    }

    fn estimated_size(&self) -> u64 {
        let kv_size = self
            .kv
            .as_ref()
            .map(|kv| kv.size())
            .unwrap_or(self.copied_kv_bytes);
        kv_size
            + (self.leaves.count() as u64) * LeafLayout::SIZE as u64
            + (self.branches.count() as u64) * BranchLayout::SIZE as u64
            + (self.versions.count() as u64) * VersionInfo::SIZE as u64
    }

    /// Folds one changeset into the output. Included changesets must
    /// be adjacent and ingested in version order.
    fn ingest(&mut self, cs: &Arc<Changeset>) -> Result<()> {
        debug_assert!(
            self.compact_wal || self.included.is_empty(),
            "joining requires kv rewriting"
        );
        let _pin = cs.pin()?;

        if !self.compact_wal {
            // Reuse the original payload log: offsets stay valid.
            let src = cs.dir().join(KV_LOG_FILE);
            let dst = self.out_dir.join(KV_LOG_FILE);
            self.copied_kv_bytes = std::fs::copy(&src, &dst)
                .map_err(|e| ArborError::io_at("copy", src.clone(), e))?;
        }

        let orphan_records = cs.read_orphans()?;
        let orphan_map: HashMap<NodeId, u32> = orphan_records
            .iter()
            .map(|r| (r.node_id, r.orphan_version))
            .collect();

        let info = cs.info();
        for version in info.start_version..=info.end_version {
            let vi = cs.version_info(version)?;
            let leaves = self.rewrite_leaves(cs, &vi.leaves, &orphan_map)?;
            let branches = self.rewrite_branches(cs, &vi.branches, &orphan_map)?;
            self.versions.append(&VersionInfo {
                leaves,
                branches,
                root_id: vi.root_id,
            })?;
        }

        // Orphans above the retention bottom still shadow retained
        // nodes; carry their records and counters forward.
        for record in orphan_records {
            if record.orphan_version < self.retain_version {
                continue;
            }
            self.orphans.append(&record)?;
            if record.node_id.is_leaf() {
                self.out_info.leaf_orphans += 1;
                self.out_info.leaf_orphan_version_total += record.orphan_version as u64;
            } else {
                self.out_info.branch_orphans += 1;
                self.out_info.branch_orphan_version_total += record.orphan_version as u64;
            }
        }

        self.end_version = info.end_version;
        self.included.push(cs.clone());
        Ok(())
    }

    fn retained(&self, id: NodeId, orphan_map: &HashMap<NodeId, u32>) -> bool {
        match orphan_map.get(&id) {
            None => true,
            Some(&orphan_version) => orphan_version >= self.retain_version,
        }
    }

    fn rewrite_leaves(
        &mut self,
        cs: &Changeset,
        set: &NodeSetInfo,
        orphan_map: &HashMap<NodeId, u32>,
    ) -> Result<NodeSetInfo> {
        let mut out = NodeSetInfo {
            start_offset: self.leaves.count(),
            ..Default::default()
        };
        for offset in set.start_offset..set.start_offset + set.count {
            let record = cs.leaf_record(offset).ok_or_else(|| {
                ArborError::Corrupt(format!("missing leaf record at offset {offset}"))
            })?;
            if !self.retained(record.id, orphan_map) {
                continue;
            }
            let key_offset = match &mut self.kv {
                Some(kv) => {
                    let (key, value) = cs.read_key_value(record.key_offset)?;
                    kv.write_key_value(&key, &value)?
                }
                None => record.key_offset,
            };
            let new_offset = self.leaves.append(&LeafLayout {
                id: record.id,
                hash: record.hash,
                key_offset,
            })?;
            self.id_offsets.insert(record.id, new_offset);
            track_index(&mut out, record.id.index());
        }
        Ok(out)
    }

    fn rewrite_branches(
        &mut self,
        cs: &Changeset,
        set: &NodeSetInfo,
        orphan_map: &HashMap<NodeId, u32>,
    ) -> Result<NodeSetInfo> {
        let mut out = NodeSetInfo {
            start_offset: self.branches.count(),
            ..Default::default()
        };
        for offset in set.start_offset..set.start_offset + set.count {
            let record = cs.branch_record(offset).ok_or_else(|| {
                ArborError::Corrupt(format!("missing branch record at offset {offset}"))
            })?;
            if !self.retained(record.id, orphan_map) {
                continue;
            }
            let key_offset = match &mut self.kv {
                Some(kv) => {
                    let key = cs.read_key(record.key_offset)?;
                    kv.write_key(&key)?
                }
                None => record.key_offset,
            };
            // Children were rewritten before this record (earlier
            // versions, same-version leaves, or earlier post-order
            // branches), so the offset table answers for any child
            // that survived into this output.
            let new_offset = self.branches.append(&BranchLayout {
                id: record.id,
                left_id: record.left_id,
                right_id: record.right_id,
                left_offset: self.id_offsets.get(&record.left_id).copied().unwrap_or(0),
                right_offset: self.id_offsets.get(&record.right_id).copied().unwrap_or(0),
                key_offset,
                height: record.height,
                size: record.size,
                hash: record.hash,
            })?;
            self.id_offsets.insert(record.id, new_offset);
            track_index(&mut out, record.id.index());
        }
        Ok(out)
    }

    /// Finalizes the output and opens it as a changeset. On any error
    /// the partial output is deleted and the originals stay untouched.
    fn seal(mut self) -> Result<Arc<Changeset>> {
        let result = (|| -> Result<Arc<Changeset>> {
            if let Some(kv) = &mut self.kv {
                kv.sync()?;
            }
            self.leaves.sync()?;
            self.branches.sync()?;
            self.versions.sync()?;
            self.orphans.sync()?;
            let info = ChangesetInfo {
                start_version: self.start_version,
                end_version: self.end_version,
                ..self.out_info
            };
            changeset::write_info(&self.out_dir, &info)?;
            Changeset::open(self.out_dir.clone())
        })();
        if result.is_err() {
            let _ = std::fs::remove_dir_all(&self.out_dir);
        }
        result
    }

    /// Deletes the partial output.
    fn abort(self) {
        let out_dir = self.out_dir.clone();
        drop(self);
        let _ = std::fs::remove_dir_all(out_dir);
    }
}

fn track_index(set: &mut NodeSetInfo, index: u32) {
    if set.count == 0 {
        set.start_index = index;
    }
    set.end_index = index;
    set.count += 1;
}
