//! Node hash computation.
//!
//! Matches the legacy IAVL wire format bit for bit: heights, sizes,
//! and versions are signed zigzag varints, byte strings are prefixed
//! with an unsigned varint length, and the digest is SHA-256.
//!
//! ```text
//! leaf_bytes   = varint(0)        || varint(1)        || varint(version) ||
//!                uvarint(len(key))|| key              ||
//!                uvarint(32)      || SHA256(value)
//! branch_bytes = varint(height)   || varint(size)     || varint(version) ||
//!                uvarint(len(lh)) || left_hash        ||
//!                uvarint(len(rh)) || right_hash
//! ```

use sha2::{Digest, Sha256};

/// A 32-byte node hash.
pub type Hash = [u8; 32];

/// Appends an unsigned LEB128 varint.
pub fn write_uvarint(buf: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        buf.push((value as u8) | 0x80);
        value >>= 7;
    }
    buf.push(value as u8);
}

/// Appends a signed zigzag varint.
pub fn write_varint(buf: &mut Vec<u8>, value: i64) {
    write_uvarint(buf, (value.wrapping_shl(1) ^ (value >> 63)) as u64);
}

fn write_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    write_uvarint(buf, bytes.len() as u64);
    buf.extend_from_slice(bytes);
}

/// Computes the hash of a leaf node.
pub fn leaf_hash(version: u32, key: &[u8], value: &[u8]) -> Hash {
    let value_hash: Hash = Sha256::digest(value).into();
    let mut buf = Vec::with_capacity(16 + key.len() + 33);
    write_varint(&mut buf, 0); // height
    write_varint(&mut buf, 1); // size
    write_varint(&mut buf, version as i64);
    write_bytes(&mut buf, key);
    write_bytes(&mut buf, &value_hash);
    Sha256::digest(&buf).into()
}

/// Computes the hash of a branch node.
pub fn branch_hash(height: u8, size: u32, version: u32, left: &Hash, right: &Hash) -> Hash {
    let mut buf = Vec::with_capacity(16 + 66);
    write_varint(&mut buf, height as i64);
    write_varint(&mut buf, size as i64);
    write_varint(&mut buf, version as i64);
    write_bytes(&mut buf, left);
    write_bytes(&mut buf, right);
    Sha256::digest(&buf).into()
}

/// The hash of an empty tree: SHA-256 of the empty string.
pub fn empty_tree_hash() -> Hash {
    Sha256::digest([]).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uvarint(value: u64) -> Vec<u8> {
        let mut buf = Vec::new();
        write_uvarint(&mut buf, value);
        buf
    }

    fn varint(value: i64) -> Vec<u8> {
        let mut buf = Vec::new();
        write_varint(&mut buf, value);
        buf
    }

    #[test]
    fn test_uvarint_encoding() {
        assert_eq!(uvarint(0), vec![0x00]);
        assert_eq!(uvarint(1), vec![0x01]);
        assert_eq!(uvarint(127), vec![0x7F]);
        assert_eq!(uvarint(128), vec![0x80, 0x01]);
        assert_eq!(uvarint(300), vec![0xAC, 0x02]);
        assert_eq!(uvarint(32), vec![0x20]);
    }

    #[test]
    fn test_varint_zigzag_encoding() {
        // Matches Go's binary.PutVarint.
        assert_eq!(varint(0), vec![0x00]);
        assert_eq!(varint(-1), vec![0x01]);
        assert_eq!(varint(1), vec![0x02]);
        assert_eq!(varint(-2), vec![0x03]);
        assert_eq!(varint(2), vec![0x04]);
        assert_eq!(varint(63), vec![0x7E]);
        assert_eq!(varint(64), vec![0x80, 0x01]);
    }

    #[test]
    fn test_empty_tree_hash() {
        // SHA-256 of the empty string.
        assert_eq!(
            hex::encode(empty_tree_hash()),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_leaf_hash_deterministic() {
        let h1 = leaf_hash(1, b"key", b"value");
        let h2 = leaf_hash(1, b"key", b"value");
        assert_eq!(h1, h2);
    }

    #[test]
    fn test_leaf_hash_sensitive_to_fields() {
        let base = leaf_hash(1, b"key", b"value");
        assert_ne!(base, leaf_hash(2, b"key", b"value"));
        assert_ne!(base, leaf_hash(1, b"kex", b"value"));
        assert_ne!(base, leaf_hash(1, b"key", b"valuf"));
    }

    #[test]
    fn test_branch_hash_sensitive_to_fields() {
        let left = leaf_hash(1, b"a", b"1");
        let right = leaf_hash(1, b"b", b"2");
        let base = branch_hash(1, 2, 1, &left, &right);
        assert_ne!(base, branch_hash(2, 2, 1, &left, &right));
        assert_ne!(base, branch_hash(1, 3, 1, &left, &right));
        assert_ne!(base, branch_hash(1, 2, 2, &left, &right));
        assert_ne!(base, branch_hash(1, 2, 1, &right, &left));
    }

    #[test]
    fn test_leaf_hash_uses_value_digest() {
        // Two values with equal SHA-256 would collide by construction;
        // differing values must not.
        let h1 = leaf_hash(1, b"k", b"v1");
        let h2 = leaf_hash(1, b"k", b"v2");
        assert_ne!(h1, h2);
    }
}
