//! Eviction of persisted in-memory nodes.
//!
//! Two paths share one traversal guard: a per-commit pass that demotes
//! everything strictly deeper than the configured depth, and a
//! budget-bounded pass driven by the memory monitor.

use arbor_tree::{MemNode, NodePtr, NodeRef};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use sysinfo::System;
use tracing::{debug, warn};

/// Demotes resolved subtrees of the live root back to references.
///
/// Only nodes persisted at or below the saved version are evictable;
/// their records answer future resolves. The `running` flag keeps the
/// commit-path and monitor-path traversals from overlapping.
pub struct Evictor {
    root: Arc<RwLock<NodePtr>>,
    running: AtomicBool,
}

impl Evictor {
    pub fn new(root: Arc<RwLock<NodePtr>>) -> Arc<Self> {
        Arc::new(Self {
            root,
            running: AtomicBool::new(false),
        })
    }

    fn begin(&self) -> bool {
        self.running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn end(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Per-commit eviction: unconditionally demotes every node
    /// strictly deeper than `depth`.
    pub fn evict_below_depth(&self, depth: u8, saved_version: u32) {
        if !self.begin() {
            return;
        }
        let mut unlimited = usize::MAX;
        if let NodePtr::Mem(node) = self.root.read().clone() {
            demote_deep(&node, 1, depth as u32, saved_version, &mut unlimited);
        }
        self.end();
    }

    /// Budget-bounded eviction: demotes subtrees below `depth` until
    /// roughly `budget` bytes of in-memory nodes have been released.
    /// Returns the bytes reclaimed.
    pub fn evict_budget(&self, budget: usize, depth: u8, saved_version: u32) -> usize {
        if !self.begin() {
            return 0;
        }
        let mut remaining = budget;
        if let NodePtr::Mem(node) = self.root.read().clone() {
            demote_deep(&node, 1, depth as u32, saved_version, &mut remaining);
        }
        self.end();
        budget - remaining
    }
}

fn evictable(node: &MemNode, saved_version: u32) -> bool {
    node.version() <= saved_version && !node.id().is_empty() && node.file_idx() > 0
}

/// Walks the in-memory tree; children at `child_depth > evict_depth`
/// are demoted when persisted, releasing their whole resolved subtree.
/// Budget is debited by the subtree footprint; traversal stops once it
/// runs out.
fn demote_deep(
    node: &Arc<MemNode>,
    child_depth: u32,
    evict_depth: u32,
    saved_version: u32,
    budget: &mut usize,
) {
    for left in [true, false] {
        if *budget == 0 {
            return;
        }
        let NodePtr::Mem(child) = node.child(left) else {
            continue;
        };
        if child_depth > evict_depth && evictable(&child, saved_version) {
            let freed = subtree_footprint(&child);
            node.set_child(
                left,
                NodePtr::Ref(NodeRef {
                    id: child.id(),
                    file_idx: child.file_idx(),
                }),
            );
            *budget = budget.saturating_sub(freed);
        } else {
            demote_deep(&child, child_depth + 1, evict_depth, saved_version, budget);
        }
    }
}

/// Approximate bytes held by the resolved nodes of a subtree.
fn subtree_footprint(node: &Arc<MemNode>) -> usize {
    let mut total = node.footprint();
    for left in [true, false] {
        if let NodePtr::Mem(child) = node.child(left) {
            total += subtree_footprint(&child);
        }
    }
    total
}

/// Polls OS memory availability and drives budget eviction when it
/// falls below the configured floor.
pub(crate) fn spawn_monitor(
    threshold_bytes: u64,
    evict_depth: u8,
    evictor: Arc<Evictor>,
    saved_version: Arc<dyn Fn() -> u32 + Send + Sync>,
    shutdown: mpsc::Receiver<()>,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("arbor-evictor".to_string())
        .spawn(move || {
            let mut sys = System::new();
            loop {
                match shutdown.recv_timeout(Duration::from_secs(1)) {
                    Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => return,
                    Err(mpsc::RecvTimeoutError::Timeout) => {}
                }
                sys.refresh_memory();
                let available = sys.available_memory();
                if available >= threshold_bytes {
                    continue;
                }
                let deficit = (threshold_bytes - available) as usize;
                let freed = evictor.evict_budget(deficit, evict_depth, saved_version());
                if freed > 0 {
                    debug!(deficit, freed, "memory pressure eviction");
                } else {
                    warn!(available, threshold_bytes, "memory pressure but nothing evictable");
                }
            }
        })
}
