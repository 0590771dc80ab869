//! Append-only key/value log for ArborDB.
//!
//! Each changeset owns one `kv.log` holding keys, values, and WAL
//! entries. Node records reference payloads by absolute byte offset;
//! crash recovery replays the WAL records up to the last commit
//! marker.

pub mod reader;
pub mod record;
pub mod writer;

pub use reader::{KvLogReader, ReplayEntry, WalReplay};
pub use record::{KvRecordType, LEN_PREFIX_SIZE, MIN_CACHED_KEY_LEN};
pub use writer::{KvLogWriter, KvUpdate};
