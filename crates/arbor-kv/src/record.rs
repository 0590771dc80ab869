//! KV log record framing.
//!
//! The log is a flat sequence of records:
//!
//! ```text
//! 0x00 Set        : type(1) | klen(4) | key | vlen(4) | value
//! 0x01 Delete     : type(1) | klen(4) | key
//! 0x02 Commit     : type(1) | version(4)
//! 0x03 ExtraK     : type(1) | klen(4) | key
//! 0x04 ExtraKV    : type(1) | klen(4) | key | vlen(4) | value
//! ```
//!
//! All length fields are little-endian u32. The offset stored in node
//! layouts (and returned by the writer) is the byte offset of the
//! length prefix, i.e. the byte immediately after the type marker, so
//! the key portion of a `Set` record is readable as a plain blob.

use arbor_common::{ArborError, Result};

/// Types of records in the kv log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum KvRecordType {
    /// WAL: a key was set to a value.
    Set = 0x00,
    /// WAL: a key was deleted.
    Delete = 0x01,
    /// WAL: all preceding records belong to the given version.
    Commit = 0x02,
    /// Payload: key bytes referenced by a branch record.
    ExtraK = 0x03,
    /// Payload: key + value bytes referenced by a leaf record.
    ExtraKv = 0x04,
}

impl KvRecordType {
    /// Returns true for the record types that participate in WAL
    /// replay.
    pub fn is_wal(&self) -> bool {
        matches!(
            self,
            KvRecordType::Set | KvRecordType::Delete | KvRecordType::Commit
        )
    }
}

impl TryFrom<u8> for KvRecordType {
    type Error = ArborError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x00 => Ok(KvRecordType::Set),
            0x01 => Ok(KvRecordType::Delete),
            0x02 => Ok(KvRecordType::Commit),
            0x03 => Ok(KvRecordType::ExtraK),
            0x04 => Ok(KvRecordType::ExtraKv),
            _ => Err(ArborError::KvLogCorrupted {
                offset: 0,
                reason: format!("invalid record type: {:#04x}", value),
            }),
        }
    }
}

/// Size of a length prefix.
pub const LEN_PREFIX_SIZE: usize = 4;

/// Keys shorter than this are never cached by content; the cache entry
/// would cost more than the key bytes.
pub const MIN_CACHED_KEY_LEN: usize = 4;
