//! Pack index v2 (.idx): fanout table, sorted hashes, CRC32 column, 31-bit
//! offsets with a 64-bit overflow table, and pack + index trailer hashes.
//! Lookup is a pure function over the sorted data: fanout narrows to a
//! half-open range, binary search finds the hash.

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};

use crate::{
    errors::GitError,
    hash::{HASH_SIZE, HashWriter, ObjectHash},
};

/// Index magic `\377t0c`.
pub const INDEX_MAGIC: u32 = 0xff74_4f63;
pub const INDEX_VERSION: u32 = 2;

/// Offsets at or above this bit pattern overflow into the large table.
const LARGE_OFFSET_THRESHOLD: u64 = 0x7fff_ffff;

/// One object entry of a pack index.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexEntry {
    pub hash: ObjectHash,
    pub crc32: u32,
    pub offset: u64,
}

/// Build a v2 index for a pack whose trailer is `pack_hash`.
pub fn build_index(mut entries: Vec<IndexEntry>, pack_hash: ObjectHash) -> Vec<u8> {
    entries.sort_by(|a, b| a.hash.cmp(&b.hash));

    let mut out = Vec::new();
    out.write_u32::<BigEndian>(INDEX_MAGIC).unwrap();
    out.write_u32::<BigEndian>(INDEX_VERSION).unwrap();

    let mut fanout = [0u32; 256];
    for entry in &entries {
        fanout[entry.hash.0[0] as usize] += 1;
    }
    for i in 1..fanout.len() {
        fanout[i] += fanout[i - 1];
    }
    for count in fanout {
        out.write_u32::<BigEndian>(count).unwrap();
    }

    for entry in &entries {
        out.extend(entry.hash.as_ref());
    }
    for entry in &entries {
        out.write_u32::<BigEndian>(entry.crc32).unwrap();
    }

    let mut large: Vec<u64> = Vec::new();
    for entry in &entries {
        if entry.offset <= LARGE_OFFSET_THRESHOLD {
            out.write_u32::<BigEndian>(entry.offset as u32).unwrap();
        } else {
            out.write_u32::<BigEndian>(0x8000_0000 | large.len() as u32)
                .unwrap();
            large.push(entry.offset);
        }
    }
    for offset in large {
        out.write_u64::<BigEndian>(offset).unwrap();
    }

    out.extend(pack_hash.as_ref());
    let mut trailer = HashWriter::new();
    trailer.update(&out);
    let idx_hash = trailer.finalize();
    out.extend(idx_hash.as_ref());
    out
}

/// Layout cursor over a raw index. Validates magic/version and trailer
/// coverage once, then answers lookups without copying the columns.
pub struct PackIndex<'a> {
    buf: &'a [u8],
    count: usize,
    names_at: usize,
    crc_at: usize,
    offsets_at: usize,
    large_at: usize,
}

impl<'a> PackIndex<'a> {
    pub fn parse(buf: &'a [u8]) -> Result<PackIndex<'a>, GitError> {
        if buf.len() < 8 + 256 * 4 + 2 * HASH_SIZE {
            return Err(GitError::InvalidPackIndex("truncated index".to_string()));
        }
        if BigEndian::read_u32(&buf[0..4]) != INDEX_MAGIC {
            return Err(GitError::InvalidPackIndex("bad magic".to_string()));
        }
        if BigEndian::read_u32(&buf[4..8]) != INDEX_VERSION {
            return Err(GitError::InvalidPackIndex("unsupported version".to_string()));
        }
        let count = BigEndian::read_u32(&buf[8 + 255 * 4..8 + 256 * 4]) as usize;
        let names_at = 8 + 256 * 4;
        let crc_at = names_at + count * HASH_SIZE;
        let offsets_at = crc_at + count * 4;
        let large_at = offsets_at + count * 4;
        if large_at + 2 * HASH_SIZE > buf.len() {
            return Err(GitError::InvalidPackIndex(
                "columns overrun the file".to_string(),
            ));
        }
        Ok(PackIndex {
            buf,
            count,
            names_at,
            crc_at,
            offsets_at,
            large_at,
        })
    }

    pub fn object_count(&self) -> usize {
        self.count
    }

    /// Pack trailer hash recorded before the index's own trailer.
    pub fn pack_hash(&self) -> Result<ObjectHash, GitError> {
        let at = self.buf.len() - 2 * HASH_SIZE;
        ObjectHash::from_bytes(&self.buf[at..at + HASH_SIZE])
    }

    fn fanout_range(&self, first_byte: u8) -> (usize, usize) {
        let hi =
            BigEndian::read_u32(&self.buf[8 + first_byte as usize * 4..8 + (first_byte as usize + 1) * 4])
                as usize;
        let lo = if first_byte == 0 {
            0
        } else {
            BigEndian::read_u32(
                &self.buf[8 + (first_byte as usize - 1) * 4..8 + first_byte as usize * 4],
            ) as usize
        };
        (lo, hi)
    }

    fn name_at(&self, i: usize) -> &[u8] {
        &self.buf[self.names_at + i * HASH_SIZE..self.names_at + (i + 1) * HASH_SIZE]
    }

    /// Two-level lookup: fanout gives the half-open range, binary search
    /// within. Returns the full entry or `None`.
    pub fn lookup(&self, hash: &ObjectHash) -> Result<Option<IndexEntry>, GitError> {
        let (mut lo, mut hi) = self.fanout_range(hash.0[0]);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match self.name_at(mid).cmp(hash.as_ref()) {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
                std::cmp::Ordering::Equal => {
                    let crc32 =
                        BigEndian::read_u32(&self.buf[self.crc_at + mid * 4..self.crc_at + (mid + 1) * 4]);
                    let raw = BigEndian::read_u32(
                        &self.buf[self.offsets_at + mid * 4..self.offsets_at + (mid + 1) * 4],
                    );
                    let offset = if raw & 0x8000_0000 != 0 {
                        let slot = (raw & 0x7fff_ffff) as usize;
                        let at = self.large_at + slot * 8;
                        if at + 8 + 2 * HASH_SIZE > self.buf.len() {
                            return Err(GitError::InvalidPackIndex(
                                "large offset slot out of range".to_string(),
                            ));
                        }
                        BigEndian::read_u64(&self.buf[at..at + 8])
                    } else {
                        raw as u64
                    };
                    return Ok(Some(IndexEntry {
                        hash: *hash,
                        crc32,
                        offset,
                    }));
                }
            }
        }
        Ok(None)
    }
}
