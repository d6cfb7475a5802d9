//! Immutable columnar tablet files.
//!
//! A tablet holds one flushed batch of objects, hash-sorted, with fixed
//! width columns up front and variable payload/path heaps behind them, so a
//! point lookup can binary-search the hash column and touch only one row's
//! heap ranges. Layout:
//!
//! ```text
//! "TBLT" version(u32) row_count(u32)
//! hash column        20 * n
//! kind column         1 * n
//! mode column         1 * n
//! size column         8 * n
//! created column      8 * n
//! payload off/len    16 * n
//! path off/len       16 * n
//! payload heap
//! path heap
//! SHA-1 trailer over all preceding bytes
//! ```

use bytes::Bytes;
use byteorder::{BigEndian, ByteOrder, WriteBytesExt};

use crate::{
    errors::GitError,
    hash::{HASH_SIZE, HashWriter, ObjectHash},
    internal::object::types::ObjectType,
};

pub const TABLET_MAGIC: &[u8; 4] = b"TBLT";
pub const TABLET_VERSION: u32 = 1;

const HEADER_LEN: usize = 12;

/// Where a row's payload bytes live.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageMode {
    /// Payload bytes are in the tablet heap.
    Inline,
    /// Payload lives in the raw blob bucket under `path`.
    External,
    /// The object is an LFS pointer; the heap holds the pointer bytes and
    /// `path` names the payload's bucket key.
    Lfs,
}

impl StorageMode {
    pub fn as_u8(&self) -> u8 {
        match self {
            StorageMode::Inline => 0,
            StorageMode::External => 1,
            StorageMode::Lfs => 2,
        }
    }

    pub fn from_u8(v: u8) -> Result<Self, GitError> {
        match v {
            0 => Ok(StorageMode::Inline),
            1 => Ok(StorageMode::External),
            2 => Ok(StorageMode::Lfs),
            other => Err(GitError::Corruption(format!(
                "unknown storage mode {other} in tablet"
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StorageMode::Inline => "inline",
            StorageMode::External => "external",
            StorageMode::Lfs => "lfs",
        }
    }

    pub fn from_str_mode(s: &str) -> Result<Self, GitError> {
        match s {
            "inline" => Ok(StorageMode::Inline),
            "external" => Ok(StorageMode::External),
            "lfs" => Ok(StorageMode::Lfs),
            other => Err(GitError::Corruption(format!("unknown storage mode `{other}`"))),
        }
    }
}

/// One stored object row, as buffered in memory and as laid out in a tablet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TabletRow {
    pub hash: ObjectHash,
    pub kind: ObjectType,
    /// Logical object size (for external rows, the size of the bucket
    /// object; the heap payload may be empty).
    pub size: u64,
    pub mode: StorageMode,
    /// Inline object bytes, or LFS pointer bytes; empty for external rows.
    pub payload: Bytes,
    /// Bucket key for external/lfs rows.
    pub path: Option<String>,
    pub created_at: i64,
}

/// Deterministic tablet key: hex SHA-1 over the concatenated sorted row
/// hashes. Replaying the same batch after a crash produces the same key,
/// making the bucket put idempotent.
pub fn tablet_key(rows: &[TabletRow]) -> String {
    let mut hashes: Vec<&ObjectHash> = rows.iter().map(|r| &r.hash).collect();
    hashes.sort();
    hashes.dedup();
    let mut w = HashWriter::new();
    for h in hashes {
        w.update(h.as_ref());
    }
    w.finalize().to_hex()
}

/// Serialize rows into a tablet. Rows are sorted and deduplicated by hash.
/// Returns `(key, bytes)`.
pub fn build_tablet(mut rows: Vec<TabletRow>) -> (String, Vec<u8>) {
    rows.sort_by(|a, b| a.hash.cmp(&b.hash));
    rows.dedup_by(|a, b| a.hash == b.hash);
    let key = tablet_key(&rows);

    let n = rows.len();
    let mut out = Vec::new();
    out.extend_from_slice(TABLET_MAGIC);
    out.write_u32::<BigEndian>(TABLET_VERSION).unwrap();
    out.write_u32::<BigEndian>(n as u32).unwrap();

    for row in &rows {
        out.extend(row.hash.as_ref());
    }
    for row in &rows {
        out.push(row.kind.type_number());
    }
    for row in &rows {
        out.push(row.mode.as_u8());
    }
    for row in &rows {
        out.write_u64::<BigEndian>(row.size).unwrap();
    }
    for row in &rows {
        out.write_u64::<BigEndian>(row.created_at as u64).unwrap();
    }

    let mut payload_heap: Vec<u8> = Vec::new();
    for row in &rows {
        out.write_u64::<BigEndian>(payload_heap.len() as u64).unwrap();
        out.write_u64::<BigEndian>(row.payload.len() as u64).unwrap();
        payload_heap.extend_from_slice(&row.payload);
    }
    let mut path_heap: Vec<u8> = Vec::new();
    for row in &rows {
        let path = row.path.as_deref().unwrap_or("");
        out.write_u64::<BigEndian>(path_heap.len() as u64).unwrap();
        out.write_u64::<BigEndian>(path.len() as u64).unwrap();
        path_heap.extend_from_slice(path.as_bytes());
    }
    out.extend(payload_heap);
    out.extend(path_heap);

    let mut trailer = HashWriter::new();
    trailer.update(&out);
    let hash = trailer.finalize();
    out.extend(hash.as_ref());
    (key, out)
}

/// Column layout cursor over raw tablet bytes.
struct Layout<'a> {
    buf: &'a [u8],
    n: usize,
    kinds_at: usize,
    modes_at: usize,
    sizes_at: usize,
    created_at: usize,
    payload_meta_at: usize,
    path_meta_at: usize,
    payload_heap_at: usize,
    path_heap_at: usize,
}

impl<'a> Layout<'a> {
    fn parse(buf: &'a [u8]) -> Result<Layout<'a>, GitError> {
        if buf.len() < HEADER_LEN + HASH_SIZE {
            return Err(GitError::Corruption("tablet shorter than header".to_string()));
        }
        if &buf[0..4] != TABLET_MAGIC {
            return Err(GitError::Corruption("bad tablet magic".to_string()));
        }
        if BigEndian::read_u32(&buf[4..8]) != TABLET_VERSION {
            return Err(GitError::Corruption("unsupported tablet version".to_string()));
        }
        let n = BigEndian::read_u32(&buf[8..12]) as usize;

        let hashes_at = HEADER_LEN;
        let kinds_at = hashes_at + n * HASH_SIZE;
        let modes_at = kinds_at + n;
        let sizes_at = modes_at + n;
        let created_at = sizes_at + n * 8;
        let payload_meta_at = created_at + n * 8;
        let path_meta_at = payload_meta_at + n * 16;
        let payload_heap_at = path_meta_at + n * 16;
        if payload_heap_at + HASH_SIZE > buf.len() {
            return Err(GitError::Corruption("tablet columns overrun file".to_string()));
        }

        // Path heap starts after the payload heap; its start is derived
        // from the last payload range.
        let path_heap_at = if n == 0 {
            payload_heap_at
        } else {
            let last = payload_meta_at + (n - 1) * 16;
            let off = BigEndian::read_u64(&buf[last..last + 8]) as usize;
            let len = BigEndian::read_u64(&buf[last + 8..last + 16]) as usize;
            payload_heap_at + off + len
        };

        Ok(Layout {
            buf,
            n,
            kinds_at,
            modes_at,
            sizes_at,
            created_at,
            payload_meta_at,
            path_meta_at,
            payload_heap_at,
            path_heap_at,
        })
    }

    fn hash_at(&self, i: usize) -> &[u8] {
        &self.buf[HEADER_LEN + i * HASH_SIZE..HEADER_LEN + (i + 1) * HASH_SIZE]
    }

    fn row(&self, i: usize) -> Result<TabletRow, GitError> {
        let hash = ObjectHash::from_bytes(self.hash_at(i))?;
        let kind = ObjectType::from_type_number(self.buf[self.kinds_at + i]).map_err(|_| {
            GitError::Corruption(format!(
                "unknown object type {} in tablet",
                self.buf[self.kinds_at + i]
            ))
        })?;
        let mode = StorageMode::from_u8(self.buf[self.modes_at + i])?;
        let size = BigEndian::read_u64(&self.buf[self.sizes_at + i * 8..self.sizes_at + (i + 1) * 8]);
        let created =
            BigEndian::read_u64(&self.buf[self.created_at + i * 8..self.created_at + (i + 1) * 8])
                as i64;

        let pm = self.payload_meta_at + i * 16;
        let p_off = BigEndian::read_u64(&self.buf[pm..pm + 8]) as usize;
        let p_len = BigEndian::read_u64(&self.buf[pm + 8..pm + 16]) as usize;
        let p_start = self.payload_heap_at + p_off;
        if p_start + p_len > self.buf.len() - HASH_SIZE {
            return Err(GitError::Corruption("payload range overruns tablet".to_string()));
        }
        let payload = Bytes::copy_from_slice(&self.buf[p_start..p_start + p_len]);

        let nm = self.path_meta_at + i * 16;
        let n_off = BigEndian::read_u64(&self.buf[nm..nm + 8]) as usize;
        let n_len = BigEndian::read_u64(&self.buf[nm + 8..nm + 16]) as usize;
        let n_start = self.path_heap_at + n_off;
        if n_start + n_len > self.buf.len() - HASH_SIZE {
            return Err(GitError::Corruption("path range overruns tablet".to_string()));
        }
        let path = if n_len == 0 {
            None
        } else {
            Some(
                std::str::from_utf8(&self.buf[n_start..n_start + n_len])
                    .map_err(|e| GitError::Conversion(e.to_string()))?
                    .to_string(),
            )
        };

        Ok(TabletRow {
            hash,
            kind,
            size,
            mode,
            payload,
            path,
            created_at: created,
        })
    }
}

/// Validate the trailer of a tablet.
pub fn verify_tablet(buf: &[u8]) -> Result<(), GitError> {
    if buf.len() < HASH_SIZE {
        return Err(GitError::Corruption("tablet shorter than trailer".to_string()));
    }
    let declared = ObjectHash::from_bytes(&buf[buf.len() - HASH_SIZE..])?;
    let actual = ObjectHash::new(&buf[..buf.len() - HASH_SIZE]);
    if declared != actual {
        return Err(GitError::Corruption(format!(
            "tablet trailer mismatch: declared {declared}, computed {actual}"
        )));
    }
    Ok(())
}

/// Point lookup with predicate push-down: binary search over the sorted
/// hash column; only the matching row's heap ranges are materialized.
pub fn find_row(buf: &[u8], hash: &ObjectHash) -> Result<Option<TabletRow>, GitError> {
    let layout = Layout::parse(buf)?;
    let (mut lo, mut hi) = (0usize, layout.n);
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        match layout.hash_at(mid).cmp(hash.as_ref()) {
            std::cmp::Ordering::Less => lo = mid + 1,
            std::cmp::Ordering::Greater => hi = mid,
            std::cmp::Ordering::Equal => return layout.row(mid).map(Some),
        }
    }
    Ok(None)
}

/// Materialize every row (compaction and GC enumeration).
pub fn scan_rows(buf: &[u8]) -> Result<Vec<TabletRow>, GitError> {
    let layout = Layout::parse(buf)?;
    (0..layout.n).map(|i| layout.row(i)).collect()
}
