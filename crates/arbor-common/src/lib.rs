//! ArborDB common types, errors, and configuration.
//!
//! This crate provides shared definitions used across all ArborDB
//! components: the error type, tree options, node identifiers, and the
//! fixed-size on-disk record layouts.

pub mod config;
pub mod error;
pub mod layout;
pub mod node_id;

pub use config::{TreeOptions, EVICT_DISABLED, MAX_KEY_SIZE, MAX_VALUE_SIZE};
pub use error::{ArborError, Result};
pub use layout::{
    BranchLayout, ChangesetInfo, FixedRecord, LeafLayout, NodeSetInfo, OrphanRecord, VersionInfo,
};
pub use node_id::NodeId;
