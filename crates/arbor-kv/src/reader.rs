//! KV log reader.

use crate::record::{KvRecordType, LEN_PREFIX_SIZE};
use arbor_common::{ArborError, Result};
use bytes::Bytes;
use memmap2::Mmap;
use std::fs::File;
use std::path::PathBuf;

/// Read-only view of a changeset's `kv.log`.
///
/// The file is memory-mapped at open time; because the log is
/// append-only, records below the mapped length never move, so a
/// reader taken while the writer is still appending stays valid.
/// All reads copy payload bytes out of the map.
pub struct KvLogReader {
    path: PathBuf,
    /// None when the log was empty at open time.
    map: Option<Mmap>,
}

impl KvLogReader {
    /// Opens and maps the log at `path`.
    pub fn open(path: PathBuf) -> Result<Self> {
        let file = File::open(&path).map_err(|e| ArborError::io_at("open", path.clone(), e))?;
        let len = file
            .metadata()
            .map_err(|e| ArborError::io_at("stat", path.clone(), e))?
            .len();
        let map = if len == 0 {
            None
        } else {
            // Safety: the file is only ever appended to; mapped bytes
            // are never rewritten.
            Some(unsafe {
                Mmap::map(&file).map_err(|e| ArborError::io_at("mmap", path.clone(), e))?
            })
        };
        Ok(Self { path, map })
    }

    /// Returns the mapped length in bytes.
    pub fn len(&self) -> u64 {
        self.map.as_ref().map(|m| m.len() as u64).unwrap_or(0)
    }

    /// Returns true if the log was empty at open time.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn data(&self) -> &[u8] {
        self.map.as_deref().unwrap_or(&[])
    }

    fn corrupt(&self, offset: u64, reason: impl Into<String>) -> ArborError {
        ArborError::KvLogCorrupted {
            offset,
            reason: reason.into(),
        }
    }

    /// Reads the length-prefixed blob whose length prefix sits at
    /// `offset`. Returns the payload and the offset just past it.
    fn read_prefixed(&self, offset: usize) -> Result<(Bytes, usize)> {
        let data = self.data();
        let end = offset
            .checked_add(LEN_PREFIX_SIZE)
            .filter(|&e| e <= data.len())
            .ok_or_else(|| self.corrupt(offset as u64, "length prefix out of bounds"))?;
        let len = u32::from_le_bytes(data[offset..end].try_into().unwrap()) as usize;
        let payload_end = end
            .checked_add(len)
            .filter(|&e| e <= data.len())
            .ok_or_else(|| self.corrupt(offset as u64, "payload out of bounds"))?;
        Ok((Bytes::copy_from_slice(&data[end..payload_end]), payload_end))
    }

    /// Reads a single blob (key) at `offset`.
    pub fn read_blob(&self, offset: u32) -> Result<Bytes> {
        let (blob, _) = self.read_prefixed(offset as usize)?;
        Ok(blob)
    }

    /// Reads a key/value pair stored back to back at `offset`
    /// (the layout of `Set` and `ExtraKV` records).
    pub fn read_blob_pair(&self, offset: u32) -> Result<(Bytes, Bytes)> {
        let (key, next) = self.read_prefixed(offset as usize)?;
        let (value, _) = self.read_prefixed(next)?;
        Ok((key, value))
    }

    /// Returns an iterator over the WAL records in the log, in append
    /// order. Payload records are skipped. A truncated tail ends the
    /// iteration without error; the consumer discards everything after
    /// the last `Commit` marker anyway.
    pub fn replay(&self) -> WalReplay<'_> {
        WalReplay {
            reader: self,
            offset: 0,
            done: false,
        }
    }

    /// Returns the log file path.
    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

/// A WAL record produced by [`KvLogReader::replay`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayEntry {
    Set { key: Bytes, value: Bytes },
    Delete { key: Bytes },
    Commit { version: u32 },
}

/// Forward scan over WAL records.
pub struct WalReplay<'a> {
    reader: &'a KvLogReader,
    offset: usize,
    done: bool,
}

impl WalReplay<'_> {
    fn read_entry(&mut self) -> Result<Option<ReplayEntry>> {
        let data = self.reader.data();
        loop {
            if self.offset >= data.len() {
                return Ok(None);
            }
            let record_type = KvRecordType::try_from(data[self.offset]).map_err(|_| {
                self.reader
                    .corrupt(self.offset as u64, "invalid record type")
            })?;
            let body = self.offset + 1;
            match record_type {
                KvRecordType::Set => {
                    let (key, next) = match self.reader.read_prefixed(body) {
                        Ok(kv) => kv,
                        Err(_) => return Ok(None), // truncated tail
                    };
                    let (value, next) = match self.reader.read_prefixed(next) {
                        Ok(kv) => kv,
                        Err(_) => return Ok(None),
                    };
                    self.offset = next;
                    return Ok(Some(ReplayEntry::Set { key, value }));
                }
                KvRecordType::Delete => {
                    let (key, next) = match self.reader.read_prefixed(body) {
                        Ok(kv) => kv,
                        Err(_) => return Ok(None),
                    };
                    self.offset = next;
                    return Ok(Some(ReplayEntry::Delete { key }));
                }
                KvRecordType::Commit => {
                    if body + 4 > data.len() {
                        return Ok(None);
                    }
                    let version = u32::from_le_bytes(data[body..body + 4].try_into().unwrap());
                    self.offset = body + 4;
                    return Ok(Some(ReplayEntry::Commit { version }));
                }
                KvRecordType::ExtraK => {
                    let (_, next) = match self.reader.read_prefixed(body) {
                        Ok(kv) => kv,
                        Err(_) => return Ok(None),
                    };
                    self.offset = next;
                }
                KvRecordType::ExtraKv => {
                    let (_, next) = match self.reader.read_prefixed(body) {
                        Ok(kv) => kv,
                        Err(_) => return Ok(None),
                    };
                    let (_, next) = match self.reader.read_prefixed(next) {
                        Ok(kv) => kv,
                        Err(_) => return Ok(None),
                    };
                    self.offset = next;
                }
            }
        }
    }
}

impl Iterator for WalReplay<'_> {
    type Item = Result<ReplayEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_entry() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
