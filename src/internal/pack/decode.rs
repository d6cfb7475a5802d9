//! Pack decoder: parses the header, walks the concatenated entries with
//! consumed-byte accounting, validates the trailer, and resolves delta
//! chains with an explicit pending set and a fixed-point loop (no
//! recursion, bounded stack depth).

use std::collections::HashMap;

use byteorder::{BigEndian, ByteOrder};

use crate::{
    delta,
    errors::GitError,
    hash::{HASH_SIZE, ObjectHash},
    internal::{
        object::types::ObjectType,
        pack::{PACK_MAGIC, PACK_VERSION, PackEntryKind, entry::Entry, read_entry_header,
               read_ofs_offset},
        zlib::inflate_with_consumed,
    },
};

/// Pack stream header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PackHeader {
    pub version: u32,
    pub object_count: u32,
}

/// Base reference of a delta entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BaseRef {
    /// Pack-relative offset of the base entry (ofs-delta).
    Offset(u64),
    /// Hash of the base object (ref-delta); may live outside the pack.
    Hash(ObjectHash),
}

/// One decompressed pack entry before delta resolution.
#[derive(Clone, Debug)]
pub struct RawEntry {
    /// Offset of the entry header inside the pack.
    pub offset: u64,
    pub kind: PackEntryKind,
    pub declared_size: usize,
    /// Decompressed payload: object bytes, or the delta instruction stream.
    pub payload: Vec<u8>,
    pub base: Option<BaseRef>,
    /// CRC32 over the packed entry bytes (header + operands + zlib data).
    pub crc32: u32,
}

/// A parsed pack: all entries decompressed, trailer validated.
#[derive(Debug)]
pub struct ParsedPack {
    pub header: PackHeader,
    pub entries: Vec<RawEntry>,
    pub trailer: ObjectHash,
}

/// Parse and validate a complete pack byte sequence.
pub fn parse_pack(buf: &[u8]) -> Result<ParsedPack, GitError> {
    if buf.len() < 12 + HASH_SIZE {
        return Err(GitError::InvalidPackHeader(format!(
            "{} bytes is shorter than header plus trailer",
            buf.len()
        )));
    }
    if &buf[0..4] != PACK_MAGIC {
        return Err(GitError::InvalidPackHeader(hex::encode(&buf[0..4])));
    }
    let version = BigEndian::read_u32(&buf[4..8]);
    if version != PACK_VERSION {
        return Err(GitError::InvalidPackHeader(format!("version {version}")));
    }
    let object_count = BigEndian::read_u32(&buf[8..12]);

    // Trailer first: SHA-1 over everything before it.
    let body_end = buf.len() - HASH_SIZE;
    let declared = ObjectHash::from_bytes(&buf[body_end..])?;
    let actual = ObjectHash::new(&buf[..body_end]);
    if declared != actual {
        return Err(GitError::Corruption(format!(
            "pack trailer mismatch: declared {declared}, computed {actual}"
        )));
    }

    let mut entries = Vec::with_capacity(object_count as usize);
    let mut pos = 12usize;
    for _ in 0..object_count {
        if pos >= body_end {
            return Err(GitError::InvalidPackFile(
                "entry count overruns pack body".to_string(),
            ));
        }
        let offset = pos as u64;
        let (kind, declared_size, header_len) = read_entry_header(buf, pos)?;
        pos += header_len;

        let base = match kind {
            PackEntryKind::OfsDelta => {
                let (rel, consumed) = read_ofs_offset(buf, pos)?;
                pos += consumed;
                if rel > offset {
                    return Err(GitError::InvalidPackFile(format!(
                        "ofs-delta at {offset} points {rel} bytes back, before pack start"
                    )));
                }
                Some(BaseRef::Offset(offset - rel))
            }
            PackEntryKind::RefDelta => {
                if pos + HASH_SIZE > body_end {
                    return Err(GitError::InvalidPackFile(
                        "truncated ref-delta base hash".to_string(),
                    ));
                }
                let base = ObjectHash::from_bytes(&buf[pos..pos + HASH_SIZE])?;
                pos += HASH_SIZE;
                Some(BaseRef::Hash(base))
            }
            PackEntryKind::Base(_) => None,
        };

        let (payload, consumed) = inflate_with_consumed(buf, pos, declared_size)?;
        pos += consumed;

        let mut crc = crc32fast::Hasher::new();
        crc.update(&buf[offset as usize..pos]);
        entries.push(RawEntry {
            offset,
            kind,
            declared_size,
            payload,
            base,
            crc32: crc.finalize(),
        });
    }

    if pos != body_end {
        return Err(GitError::InvalidPackFile(format!(
            "{} trailing bytes after the last entry",
            body_end - pos
        )));
    }

    Ok(ParsedPack {
        header: PackHeader {
            version,
            object_count,
        },
        entries,
        trailer: declared,
    })
}

impl ParsedPack {
    /// Ref-delta base hashes that are not provided by this pack (thin pack).
    /// The caller is expected to fetch them from the object store before
    /// calling [`ParsedPack::resolve`].
    pub fn missing_bases(&self) -> Vec<ObjectHash> {
        let local: std::collections::HashSet<ObjectHash> = self
            .entries
            .iter()
            .filter_map(|e| match e.kind {
                PackEntryKind::Base(t) => {
                    Some(ObjectHash::from_type_and_data(t, &e.payload))
                }
                _ => None,
            })
            .collect();
        let mut missing = Vec::new();
        for entry in &self.entries {
            if let Some(BaseRef::Hash(h)) = entry.base {
                if !local.contains(&h) && !missing.contains(&h) {
                    missing.push(h);
                }
            }
        }
        missing
    }

    /// Resolve all delta chains into plain objects.
    ///
    /// First pass indexes non-delta entries by pack offset and by hash.
    /// Then pending deltas are swept repeatedly; each resolves once its base
    /// is available. A sweep with no progress and a non-empty pending set is
    /// fatal pack corruption. `external_bases` supplies thin-pack bases
    /// already present in the object store.
    pub fn resolve(
        self,
        external_bases: &HashMap<ObjectHash, (ObjectType, Vec<u8>)>,
    ) -> Result<Vec<Entry>, GitError> {
        let mut resolved: Vec<Entry> = Vec::with_capacity(self.entries.len());
        let mut by_offset: HashMap<u64, usize> = HashMap::new();
        let mut by_hash: HashMap<ObjectHash, usize> = HashMap::new();
        let mut pending: Vec<RawEntry> = Vec::new();

        for raw in self.entries {
            match raw.kind {
                PackEntryKind::Base(obj_type) => {
                    let entry = Entry::new(obj_type, raw.payload);
                    by_offset.insert(raw.offset, resolved.len());
                    by_hash.insert(entry.hash, resolved.len());
                    resolved.push(entry);
                }
                _ => pending.push(raw),
            }
        }

        while !pending.is_empty() {
            let mut progressed = false;
            let mut still_pending = Vec::with_capacity(pending.len());

            for raw in pending {
                let base = match raw.base {
                    Some(BaseRef::Offset(off)) => by_offset
                        .get(&off)
                        .map(|&i| (resolved[i].obj_type, resolved[i].data.clone())),
                    Some(BaseRef::Hash(h)) => by_hash
                        .get(&h)
                        .map(|&i| (resolved[i].obj_type, resolved[i].data.clone()))
                        .or_else(|| external_bases.get(&h).cloned()),
                    None => {
                        return Err(GitError::Fatal(
                            "delta entry without a base reference".to_string(),
                        ));
                    }
                };

                match base {
                    Some((base_type, base_data)) => {
                        let target = delta::apply(&base_data, &raw.payload)?;
                        let entry = Entry::new(base_type, target);
                        by_offset.insert(raw.offset, resolved.len());
                        by_hash.insert(entry.hash, resolved.len());
                        resolved.push(entry);
                        progressed = true;
                    }
                    None => still_pending.push(raw),
                }
            }

            if !progressed && !still_pending.is_empty() {
                return Err(GitError::Corruption(format!(
                    "{} delta entries have no reachable base",
                    still_pending.len()
                )));
            }
            pending = still_pending;
        }

        Ok(resolved)
    }
}

/// Parse and resolve in one step for packs known not to be thin.
pub fn unpack(buf: &[u8]) -> Result<Vec<Entry>, GitError> {
    parse_pack(buf)?.resolve(&HashMap::new())
}
