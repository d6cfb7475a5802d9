//! SHA-1 object identity for the store.
//!
//! Every object is addressed by the SHA-1 of its Git envelope
//! `"<kind> <payload-length>\0" || payload`. Hashes travel as 40-char
//! lowercase hex on the wire and as raw 20-byte values inside packs,
//! pack indexes, and tablet hash columns.

use std::{fmt::Display, io, str::FromStr};

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::{errors::GitError, internal::object::types::ObjectType};

/// Length of a raw SHA-1 value in bytes.
pub const HASH_SIZE: usize = 20;
/// Length of a SHA-1 value in hex characters.
pub const HASH_HEX_LEN: usize = 40;
/// The all-zero hash used on the wire for ref creation and deletion.
pub const ZERO_HASH_HEX: &str = "0000000000000000000000000000000000000000";

/// Concrete object ID carrying the 20 raw SHA-1 bytes.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ObjectHash(pub [u8; HASH_SIZE]);

impl Display for ObjectHash {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl AsRef<[u8]> for ObjectHash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Parse 40 lowercase hex characters into an `ObjectHash`.
///
/// Uppercase hex is rejected: the wire protocols and the tablet hash
/// columns only ever carry lowercase, and accepting both would make
/// prefix resolution ambiguous.
impl FromStr for ObjectHash {
    type Err = GitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != HASH_HEX_LEN || !s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        {
            return Err(GitError::InvalidHashValue(s.to_string()));
        }
        let mut h = [0u8; HASH_SIZE];
        let bytes = hex::decode(s).map_err(|_| GitError::InvalidHashValue(s.to_string()))?;
        h.copy_from_slice(&bytes);
        Ok(ObjectHash(h))
    }
}

impl ObjectHash {
    /// The all-zero hash value.
    pub const fn zero() -> ObjectHash {
        ObjectHash([0u8; HASH_SIZE])
    }

    /// True when every byte is zero (wire sentinel for create/delete).
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// Compute the SHA-1 of raw data (no envelope).
    pub fn new(data: &[u8]) -> ObjectHash {
        let digest = Sha1::digest(data);
        let mut bytes = [0u8; HASH_SIZE];
        bytes.copy_from_slice(&digest);
        ObjectHash(bytes)
    }

    /// Compute the object ID of `(kind, payload)` over the Git envelope.
    pub fn from_type_and_data(object_type: ObjectType, data: &[u8]) -> ObjectHash {
        let mut hasher = Sha1::new();
        hasher.update(object_type.to_bytes());
        hasher.update(b" ");
        hasher.update(data.len().to_string().as_bytes());
        hasher.update(b"\x00");
        hasher.update(data);
        let mut bytes = [0u8; HASH_SIZE];
        bytes.copy_from_slice(&hasher.finalize());
        ObjectHash(bytes)
    }

    /// Create an `ObjectHash` from exactly 20 raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<ObjectHash, GitError> {
        if bytes.len() != HASH_SIZE {
            return Err(GitError::InvalidHashValue(hex::encode(bytes)));
        }
        let mut h = [0u8; HASH_SIZE];
        h.copy_from_slice(bytes);
        Ok(ObjectHash(h))
    }

    /// Read 20 raw hash bytes from a stream (pack trailers, ref-delta bases).
    pub fn from_stream(data: &mut impl io::Read) -> io::Result<ObjectHash> {
        let mut h = [0u8; HASH_SIZE];
        data.read_exact(&mut h)?;
        Ok(ObjectHash(h))
    }

    /// Return the raw bytes of the hash.
    pub fn to_data(self) -> Vec<u8> {
        self.0.to_vec()
    }

    /// Hex form; same as `Display` without the formatter machinery.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

/// Incremental SHA-1 used by pack and tablet writers for trailing checksums.
#[derive(Clone, Default)]
pub struct HashWriter {
    inner: Sha1,
}

impl HashWriter {
    pub fn new() -> Self {
        Self { inner: Sha1::new() }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    pub fn finalize(self) -> ObjectHash {
        let digest = self.inner.finalize();
        let mut bytes = [0u8; HASH_SIZE];
        bytes.copy_from_slice(&digest);
        ObjectHash(bytes)
    }
}

impl io::Write for HashWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    /// Hashing "Hello, world!" should match the known SHA-1 value.
    #[test]
    fn test_sha1_new() {
        let sha1 = ObjectHash::new("Hello, world!".as_bytes());
        assert_eq!(sha1.to_string(), "943a702d06f34599aee1f8da8ef9f7296031d699");
    }

    /// The empty blob envelope hashes to the canonical git value.
    #[test]
    fn test_empty_blob_envelope() {
        let h = ObjectHash::from_type_and_data(ObjectType::Blob, &[]);
        assert_eq!(h.to_string(), "e69de29bb2d1d6434b8b29ae775ad8c2e48c5391");
    }

    /// "hello\n" as a blob hashes to the canonical git value.
    #[test]
    fn test_hello_blob_envelope() {
        let h = ObjectHash::from_type_and_data(ObjectType::Blob, b"hello\n");
        assert_eq!(h.to_string(), "ce013625030ba8dba906f756967f9e9ca394464a");
    }

    /// Round-trip through hex string form.
    #[test]
    fn test_from_str_round_trip() {
        let hash_str = "8ab686eafeb1f44702738c8b0f24f2567c36da6d";
        let hash = ObjectHash::from_str(hash_str).unwrap();
        assert_eq!(hash.to_string(), hash_str);
    }

    /// Uppercase hex and wrong lengths are rejected.
    #[test]
    fn test_from_str_rejects_invalid() {
        assert!(ObjectHash::from_str("8AB686EAFEB1F44702738C8B0F24F2567C36DA6D").is_err());
        assert!(ObjectHash::from_str("abcd").is_err());
        assert!(ObjectHash::from_str("zz..").is_err());
    }

    /// Zero hash helpers agree with the wire constant.
    #[test]
    fn test_zero_hash() {
        assert!(ObjectHash::zero().is_zero());
        assert_eq!(ObjectHash::zero().to_string(), ZERO_HASH_HEX);
        assert!(!ObjectHash::new(b"x").is_zero());
    }

    /// Read hash bytes from a stream.
    #[test]
    fn test_from_stream() {
        let source = [
            0x8a, 0xb6, 0x86, 0xea, 0xfe, 0xb1, 0xf4, 0x47, 0x02, 0x73, 0x8c, 0x8b, 0x0f, 0x24,
            0xf2, 0x56, 0x7c, 0x36, 0xda, 0x6d,
        ];
        let mut reader = std::io::Cursor::new(source);
        let sha1 = ObjectHash::from_stream(&mut reader).unwrap();
        assert_eq!(sha1.to_string(), "8ab686eafeb1f44702738c8b0f24f2567c36da6d");
    }

    /// HashWriter matches one-shot hashing.
    #[test]
    fn test_hash_writer_incremental() {
        let mut w = HashWriter::new();
        w.update(b"Hello, ");
        w.update(b"world!");
        assert_eq!(
            w.finalize().to_string(),
            "943a702d06f34599aee1f8da8ef9f7296031d699"
        );
    }
}
