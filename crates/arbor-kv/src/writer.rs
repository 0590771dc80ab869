//! KV log writer.

use crate::record::{KvRecordType, MIN_CACHED_KEY_LEN};
use arbor_common::{ArborError, Result};
use bytes::Bytes;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

/// A single WAL mutation handed to [`KvLogWriter::write_updates`].
#[derive(Debug, Clone)]
pub enum KvUpdate {
    /// Set `key` to `value`.
    Set { key: Bytes, value: Bytes },
    /// Delete `key`.
    Delete { key: Bytes },
}

/// Buffered writer for a changeset's `kv.log`.
///
/// Appends payload blobs and WAL records; every payload write returns
/// the absolute byte offset of the record's length prefix, which is
/// what node layouts store. Keys of at least [`MIN_CACHED_KEY_LEN`]
/// bytes are deduplicated by content within the log.
pub struct KvLogWriter {
    path: PathBuf,
    out: BufWriter<File>,
    /// Logical size of the log, including buffered bytes.
    size: u64,
    /// Content-keyed offsets of previously written keys.
    key_cache: HashMap<Bytes, u32>,
}

impl KvLogWriter {
    /// Wraps an open log file positioned at its end.
    pub fn new(file: File, path: PathBuf, size: u64) -> Self {
        Self {
            path,
            out: BufWriter::new(file),
            size,
            key_cache: HashMap::new(),
        }
    }

    /// Returns the logical size of the log in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Returns the log file path.
    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Looks up a previously written key by content.
    pub fn cached_key_offset(&self, key: &[u8]) -> Option<u32> {
        if key.len() < MIN_CACHED_KEY_LEN {
            return None;
        }
        self.key_cache.get(key).copied()
    }

    /// Computes the offset the next record's length prefix will have
    /// and checks it fits the u32 offset space of the node layouts.
    fn next_payload_offset(&self) -> Result<u32> {
        let offset = self.size + 1;
        u32::try_from(offset).map_err(|_| ArborError::KvLogCorrupted {
            offset: self.size,
            reason: "kv log exceeds 4 GiB offset space".to_string(),
        })
    }

    fn put(&mut self, bytes: &[u8]) -> Result<()> {
        self.out
            .write_all(bytes)
            .map_err(|e| ArborError::io_at("write", self.path.clone(), e))?;
        self.size += bytes.len() as u64;
        Ok(())
    }

    fn put_len_prefixed(&mut self, payload: &[u8]) -> Result<()> {
        self.put(&(payload.len() as u32).to_le_bytes())?;
        self.put(payload)
    }

    fn cache_key(&mut self, key: &Bytes, offset: u32) {
        if key.len() >= MIN_CACHED_KEY_LEN {
            self.key_cache.insert(key.clone(), offset);
        }
    }

    /// Appends an `ExtraK` payload record, or returns a cached offset
    /// for the same key content.
    pub fn write_key(&mut self, key: &Bytes) -> Result<u32> {
        if let Some(offset) = self.cached_key_offset(key) {
            return Ok(offset);
        }
        let offset = self.next_payload_offset()?;
        self.put(&[KvRecordType::ExtraK as u8])?;
        self.put_len_prefixed(key)?;
        self.cache_key(key, offset);
        Ok(offset)
    }

    /// Appends an `ExtraKV` payload record and returns the offset of
    /// the key length prefix. The value is readable immediately after
    /// the key at the same offset.
    pub fn write_key_value(&mut self, key: &Bytes, value: &Bytes) -> Result<u32> {
        let offset = self.next_payload_offset()?;
        self.put(&[KvRecordType::ExtraKv as u8])?;
        self.put_len_prefixed(key)?;
        self.put_len_prefixed(value)?;
        self.cache_key(key, offset);
        Ok(offset)
    }

    /// Appends a batch of WAL `Set`/`Delete` records.
    ///
    /// Returns, for each update, the offset of the record's key length
    /// prefix for `Set` entries (`None` for deletes). A `Set` record's
    /// key and value are readable as blobs at that offset, so callers
    /// capture it for payload reuse.
    pub fn write_updates(&mut self, updates: &[KvUpdate]) -> Result<Vec<Option<u32>>> {
        let mut offsets = Vec::with_capacity(updates.len());
        for update in updates {
            match update {
                KvUpdate::Set { key, value } => {
                    let offset = self.next_payload_offset()?;
                    self.put(&[KvRecordType::Set as u8])?;
                    self.put_len_prefixed(key)?;
                    self.put_len_prefixed(value)?;
                    self.cache_key(key, offset);
                    offsets.push(Some(offset));
                }
                KvUpdate::Delete { key } => {
                    self.put(&[KvRecordType::Delete as u8])?;
                    self.put_len_prefixed(key)?;
                    offsets.push(None);
                }
            }
        }
        Ok(offsets)
    }

    /// Appends a `Commit` marker bearing the version.
    pub fn write_commit(&mut self, version: u32) -> Result<()> {
        self.put(&[KvRecordType::Commit as u8])?;
        self.put(&version.to_le_bytes())
    }

    /// Flushes buffered bytes to the OS.
    pub fn flush(&mut self) -> Result<()> {
        self.out
            .flush()
            .map_err(|e| ArborError::io_at("flush", self.path.clone(), e))
    }

    /// Flushes and fsyncs the log file.
    pub fn sync(&mut self) -> Result<()> {
        self.flush()?;
        self.out
            .get_ref()
            .sync_data()
            .map_err(|e| ArborError::io_at("fsync", self.path.clone(), e))
    }

    /// Flushes and returns the underlying file.
    pub fn into_file(mut self) -> Result<File> {
        self.flush()?;
        self.out
            .into_inner()
            .map_err(|e| ArborError::io_at("flush", self.path.clone(), e.into_error()))
    }
}
