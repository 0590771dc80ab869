//! Persistence and orchestration for ArborDB.
//!
//! This crate provides:
//! - Memory-mapped struct arrays with interpolated index lookup
//! - Changeset files, readers, and the changeset writer
//! - The tree store: registry, routing, seal/refresh policy
//! - The background cleanup/compactor and eviction
//! - The `CommitTree` façade and immutable version snapshots

mod changeset;
mod cleanup;
mod commit_tree;
mod evict;
mod mmap;
mod store;
mod writer;

pub use changeset::{dir_name, parse_dir_name, Changeset, PinGuard};
pub use commit_tree::{CommitId, CommitTree, ImmutableTree};
pub use evict::Evictor;
pub use mmap::{lookup_by_index, IndexedRecord, StructArray};
pub use store::TreeStore;
pub use writer::ChangesetWriter;
