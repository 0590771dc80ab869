//! Memory-mapped arrays of fixed-size records.

use arbor_common::{ArborError, BranchLayout, FixedRecord, LeafLayout, NodeId, NodeSetInfo, Result};
use memmap2::Mmap;
use std::fs::File;
use std::marker::PhantomData;
use std::path::PathBuf;

/// A read-only file viewed as an array of fixed-size records.
///
/// The file is mapped once at open time; because node files are
/// append-only, a view taken while the writer is still appending stays
/// valid for every record below its mapped length. A trailing partial
/// record (a crash artifact) is ignored.
pub struct StructArray<T: FixedRecord> {
    path: PathBuf,
    map: Option<Mmap>,
    len: usize,
    _marker: PhantomData<T>,
}

impl<T: FixedRecord> StructArray<T> {
    /// Opens and maps the array at `path`.
    pub fn open(path: PathBuf) -> Result<Self> {
        let file = File::open(&path).map_err(|e| ArborError::io_at("open", path.clone(), e))?;
        let file_len = file
            .metadata()
            .map_err(|e| ArborError::io_at("stat", path.clone(), e))?
            .len() as usize;
        let map = if file_len == 0 {
            None
        } else {
            // Safety: records below the mapped length are never
            // rewritten; the file only grows.
            Some(unsafe {
                Mmap::map(&file).map_err(|e| ArborError::io_at("mmap", path.clone(), e))?
            })
        };
        Ok(Self {
            path,
            map,
            len: file_len / T::SIZE,
            _marker: PhantomData,
        })
    }

    /// Number of whole records in the array.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Decodes the record at `index`, or `None` out of bounds.
    pub fn get(&self, index: usize) -> Option<T> {
        if index >= self.len {
            return None;
        }
        let data = self.map.as_deref()?;
        Some(T::decode(&data[index * T::SIZE..]))
    }

    /// The backing file path.
    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

/// A record carrying a node id, searchable by intra-version index.
pub trait IndexedRecord: FixedRecord {
    fn node_id(&self) -> NodeId;
}

impl IndexedRecord for LeafLayout {
    fn node_id(&self) -> NodeId {
        self.id
    }
}

impl IndexedRecord for BranchLayout {
    fn node_id(&self) -> NodeId {
        self.id
    }
}

/// Finds the record with `id.index == target_index` inside the version
/// range described by `info`.
///
/// When the range is contiguous (indices map 1:1 onto offsets) the
/// offset is computed directly. Otherwise the strictly increasing
/// index sequence is searched by interpolation with a bisection
/// fallback: O(log log n) on the uniform gaps compaction produces,
/// O(log n) worst case.
///
/// Returns the record's 0-based array offset alongside the record.
pub fn lookup_by_index<T: IndexedRecord>(
    array: &StructArray<T>,
    info: &NodeSetInfo,
    target_index: u32,
) -> Result<Option<(u32, T)>> {
    if !info.contains_index(target_index) {
        return Ok(None);
    }

    let range_err = || {
        ArborError::Corrupt(format!(
            "node set info [{}, {}] exceeds array of {} records",
            info.start_offset,
            info.start_offset + info.count,
            array.len()
        ))
    };

    if info.is_contiguous() {
        let offset = info.start_offset + (target_index - info.start_index);
        let record = array.get(offset as usize).ok_or_else(range_err)?;
        if record.node_id().index() != target_index {
            return Err(ArborError::Corrupt(format!(
                "record at offset {offset} has index {}, expected {target_index}",
                record.node_id().index()
            )));
        }
        return Ok(Some((offset, record)));
    }

    let mut low_offset = info.start_offset;
    let mut high_offset = info.start_offset + info.count - 1;
    let mut low_index = info.start_index;
    let mut high_index = info.end_index;

    while low_offset <= high_offset {
        if target_index < low_index || target_index > high_index {
            return Ok(None);
        }
        let mid = if high_index == low_index {
            low_offset
        } else {
            let span = (high_offset - low_offset) as u64;
            let estimated = low_offset as u64
                + (target_index - low_index) as u64 * span / (high_index - low_index) as u64;
            (estimated as u32).clamp(low_offset, high_offset)
        };
        let record = array.get(mid as usize).ok_or_else(range_err)?;
        let found = record.node_id().index();
        if found == target_index {
            return Ok(Some((mid, record)));
        }
        if found < target_index {
            low_offset = mid + 1;
            low_index = found + 1;
        } else {
            if mid == 0 {
                return Ok(None);
            }
            high_offset = mid - 1;
            high_index = found - 1;
        }
        if low_offset > high_offset {
            return Ok(None);
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_common::FixedRecord;
    use bytes::BufMut;
    use std::io::Write;
    use tempfile::tempdir;

    fn write_leaves(dir: &std::path::Path, indices: &[u32]) -> StructArray<LeafLayout> {
        let path = dir.join("leaves.dat");
        let mut file = File::create(&path).unwrap();
        let mut buf = bytes::BytesMut::new();
        for &index in indices {
            LeafLayout {
                id: NodeId::leaf(1, index),
                hash: [0; 32],
                key_offset: index,
            }
            .encode(&mut buf);
        }
        file.write_all(&buf).unwrap();
        file.flush().unwrap();
        StructArray::open(path).unwrap()
    }

    #[test]
    fn test_open_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("leaves.dat");
        File::create(&path).unwrap();
        let array: StructArray<LeafLayout> = StructArray::open(path).unwrap();
        assert!(array.is_empty());
        assert!(array.get(0).is_none());
    }

    #[test]
    fn test_get_roundtrip() {
        let dir = tempdir().unwrap();
        let array = write_leaves(dir.path(), &[1, 2, 3]);
        assert_eq!(array.len(), 3);
        assert_eq!(array.get(1).unwrap().id, NodeId::leaf(1, 2));
        assert!(array.get(3).is_none());
    }

    #[test]
    fn test_partial_tail_record_ignored() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("leaves.dat");
        let mut file = File::create(&path).unwrap();
        let mut buf = bytes::BytesMut::new();
        LeafLayout {
            id: NodeId::leaf(1, 1),
            hash: [0; 32],
            key_offset: 9,
        }
        .encode(&mut buf);
        buf.put_slice(&[0xAA; 10]); // truncated second record
        file.write_all(&buf).unwrap();
        drop(file);

        let array: StructArray<LeafLayout> = StructArray::open(path).unwrap();
        assert_eq!(array.len(), 1);
    }

    #[test]
    fn test_lookup_contiguous_fast_path() {
        let dir = tempdir().unwrap();
        let array = write_leaves(dir.path(), &[1, 2, 3, 4, 5]);
        let info = NodeSetInfo {
            start_offset: 0,
            count: 5,
            start_index: 1,
            end_index: 5,
        };
        for target in 1..=5 {
            let (offset, record) = lookup_by_index(&array, &info, target).unwrap().unwrap();
            assert_eq!(offset, target - 1);
            assert_eq!(record.id.index(), target);
        }
        assert!(lookup_by_index(&array, &info, 6).unwrap().is_none());
        assert!(lookup_by_index(&array, &info, 0).unwrap().is_none());
    }

    #[test]
    fn test_lookup_sparse_range() {
        // Gaps as produced by compaction: indices 2, 5, 6, 9, 14.
        let dir = tempdir().unwrap();
        let array = write_leaves(dir.path(), &[2, 5, 6, 9, 14]);
        let info = NodeSetInfo {
            start_offset: 0,
            count: 5,
            start_index: 2,
            end_index: 14,
        };
        for (offset, target) in [(0u32, 2u32), (1, 5), (2, 6), (3, 9), (4, 14)] {
            let (found_offset, record) =
                lookup_by_index(&array, &info, target).unwrap().unwrap();
            assert_eq!(found_offset, offset, "target {target}");
            assert_eq!(record.id.index(), target);
        }
        for missing in [3, 4, 7, 8, 10, 13] {
            assert!(
                lookup_by_index(&array, &info, missing).unwrap().is_none(),
                "index {missing} should be absent"
            );
        }
    }

    #[test]
    fn test_lookup_subrange_of_array() {
        // The version's records sit in the middle of a larger array.
        let dir = tempdir().unwrap();
        let array = write_leaves(dir.path(), &[7, 8, 9, 1, 3, 8, 2, 4]);
        let info = NodeSetInfo {
            start_offset: 3,
            count: 3,
            start_index: 1,
            end_index: 8,
        };
        let (offset, _) = lookup_by_index(&array, &info, 3).unwrap().unwrap();
        assert_eq!(offset, 4);
        assert!(lookup_by_index(&array, &info, 5).unwrap().is_none());
    }

    #[test]
    fn test_lookup_empty_info() {
        let dir = tempdir().unwrap();
        let array = write_leaves(dir.path(), &[1]);
        let info = NodeSetInfo::default();
        assert!(lookup_by_index(&array, &info, 1).unwrap().is_none());
    }
}
