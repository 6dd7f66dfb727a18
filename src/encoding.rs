//! Canonical byte encoding used for hashing.
//!
//! Every hashed type writes its fields one by one, in a fixed order, through an
//! [`Encoder`]. The first byte of every preimage is [`ENCODING_VERSION`]; a change to
//! any field layout must bump it. Integers are little-endian, variable-length byte
//! strings carry a `u32` length prefix. Storage and wire formats do not go through
//! this module and are free to change without affecting hashes.

use crate::crypto::{sha256, Sha256Hash, ZERO_HASH};

/// Version tag prepended to every canonical preimage.
pub const ENCODING_VERSION: u8 = 1;

/// Append-only byte writer for canonical preimages.
#[derive(Debug, Clone)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self {
            buf: vec![ENCODING_VERSION],
        }
    }

    /// Starts a preimage with a domain tag so different types never share a digest.
    pub fn with_domain(domain: &[u8]) -> Self {
        let mut enc = Self::new();
        enc.put_bytes(domain);
        enc
    }

    pub fn put_u8(&mut self, value: u8) -> &mut Self {
        self.buf.push(value);
        self
    }

    pub fn put_u32(&mut self, value: u32) -> &mut Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn put_u64(&mut self, value: u64) -> &mut Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn put_i64(&mut self, value: i64) -> &mut Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    /// Fixed-width field (hashes, addresses); no length prefix.
    pub fn put_fixed(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(bytes);
        self
    }

    /// Variable-width field with a `u32` length prefix.
    pub fn put_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.put_u32(bytes.len() as u32);
        self.buf.extend_from_slice(bytes);
        self
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn digest(&self) -> Sha256Hash {
        sha256(&self.buf)
    }
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Explicit field-by-field serialization for hashed types.
pub trait CanonicalEncode {
    /// Writes this value's fields into `enc` in their canonical order.
    fn encode_canonical(&self, enc: &mut Encoder);

    fn canonical_bytes(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        self.encode_canonical(&mut enc);
        enc.into_bytes()
    }

    fn canonical_hash(&self) -> Sha256Hash {
        let mut enc = Encoder::new();
        self.encode_canonical(&mut enc);
        enc.digest()
    }
}

/// Binary merkle root; odd levels duplicate their last node. Empty input yields the zero hash.
pub fn merkle_root(leaves: &[Sha256Hash]) -> Sha256Hash {
    if leaves.is_empty() {
        return ZERO_HASH;
    }

    let mut level: Vec<Sha256Hash> = leaves.to_vec();
    while level.len() > 1 {
        if level.len() % 2 == 1 {
            if let Some(last) = level.last().copied() {
                level.push(last);
            }
        }
        level = level
            .chunks(2)
            .map(|pair| {
                let mut joined = [0u8; 64];
                joined[..32].copy_from_slice(&pair[0]);
                joined[32..].copy_from_slice(&pair[1]);
                sha256(&joined)
            })
            .collect();
    }
    level[0]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preimage_starts_with_version() {
        let mut enc = Encoder::new();
        enc.put_u64(7);
        assert_eq!(enc.as_bytes()[0], ENCODING_VERSION);
        assert_eq!(enc.as_bytes().len(), 9);
    }

    #[test]
    fn test_length_prefix_separates_fields() {
        let mut a = Encoder::new();
        a.put_bytes(b"ab").put_bytes(b"c");
        let mut b = Encoder::new();
        b.put_bytes(b"a").put_bytes(b"bc");
        assert_ne!(a.digest(), b.digest());
    }

    #[test]
    fn test_merkle_root_edges() {
        assert_eq!(merkle_root(&[]), ZERO_HASH);

        let leaf = sha256(b"leaf");
        assert_eq!(merkle_root(&[leaf]), leaf);

        let three = [sha256(b"a"), sha256(b"b"), sha256(b"c")];
        let four = [three[0], three[1], three[2], three[2]];
        assert_eq!(merkle_root(&three), merkle_root(&four));
    }

    #[test]
    fn test_merkle_root_is_order_sensitive() {
        let a = sha256(b"a");
        let b = sha256(b"b");
        assert_ne!(merkle_root(&[a, b]), merkle_root(&[b, a]));
    }
}
