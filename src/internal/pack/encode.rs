//! In-memory pack emitter. Writes the `PACK` header, one zlib-compressed
//! non-delta entry per object, and the SHA-1 trailer. Delta compression is
//! intentionally absent: thin-pack handling lives in the decoder.

use byteorder::{BigEndian, WriteBytesExt};

use crate::{
    errors::GitError,
    hash::{HashWriter, ObjectHash},
    internal::{
        pack::{PACK_MAGIC, PACK_VERSION, PackEntryKind, entry::Entry, index::IndexEntry,
               write_entry_header},
        zlib::deflate,
    },
};

/// Encode `entries` into a complete pack byte vector.
pub fn encode_pack(entries: &[Entry]) -> Result<Vec<u8>, GitError> {
    Ok(encode_pack_with_index(entries)?.0)
}

/// Encode a pack and return the per-object index entries (hash, crc32,
/// offset) needed to build a v2 pack index for it.
pub fn encode_pack_with_index(
    entries: &[Entry],
) -> Result<(Vec<u8>, Vec<IndexEntry>), GitError> {
    let mut out = Vec::new();
    out.extend_from_slice(PACK_MAGIC);
    out.write_u32::<BigEndian>(PACK_VERSION)
        .expect("vec write cannot fail");
    out.write_u32::<BigEndian>(
        u32::try_from(entries.len())
            .map_err(|_| GitError::InvalidPackFile("too many objects for a pack".to_string()))?,
    )
    .expect("vec write cannot fail");

    let mut index = Vec::with_capacity(entries.len());
    for entry in entries {
        let offset = out.len();
        write_entry_header(&mut out, PackEntryKind::Base(entry.obj_type), entry.data.len());
        out.extend(deflate(&entry.data));

        let mut crc = crc32fast::Hasher::new();
        crc.update(&out[offset..]);
        index.push(IndexEntry {
            hash: entry.hash,
            crc32: crc.finalize(),
            offset: offset as u64,
        });
    }

    let mut trailer = HashWriter::new();
    trailer.update(&out);
    let pack_hash = trailer.finalize();
    out.extend(pack_hash.as_ref());
    Ok((out, index))
}

/// Trailer hash of an already encoded pack.
pub fn pack_trailer(pack: &[u8]) -> Result<ObjectHash, GitError> {
    if pack.len() < 20 {
        return Err(GitError::InvalidPackFile("shorter than a trailer".to_string()));
    }
    ObjectHash::from_bytes(&pack[pack.len() - 20..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::internal::object::{blob::Blob, types::ObjectType};

    /// An empty pack is header + trailer with object count 0.
    #[test]
    fn empty_pack_layout() {
        let pack = encode_pack(&[]).unwrap();
        assert_eq!(&pack[0..4], b"PACK");
        assert_eq!(&pack[4..8], &[0, 0, 0, 2]);
        assert_eq!(&pack[8..12], &[0, 0, 0, 0]);
        assert_eq!(pack.len(), 12 + 20);

        // trailer covers header bytes
        let expected = ObjectHash::new(&pack[..12]);
        assert_eq!(pack_trailer(&pack).unwrap(), expected);
    }

    /// Object count and index offsets reflect the entry sequence.
    #[test]
    fn object_count_and_offsets() {
        let entries: Vec<Entry> = ["one", "two", "three"]
            .iter()
            .map(|s| Blob::from_content(s).into())
            .collect();
        let (pack, index) = encode_pack_with_index(&entries).unwrap();
        assert_eq!(&pack[8..12], &[0, 0, 0, 3]);
        assert_eq!(index.len(), 3);
        assert_eq!(index[0].offset, 12);
        assert!(index[0].offset < index[1].offset && index[1].offset < index[2].offset);
        for (e, i) in entries.iter().zip(&index) {
            assert_eq!(e.hash, i.hash);
        }
    }

    /// Every index crc32 matches a recomputation over the packed bytes.
    #[test]
    fn crc_covers_packed_entry_bytes() {
        let entries: Vec<Entry> = vec![
            Entry::new(ObjectType::Blob, b"alpha".to_vec()),
            Entry::new(ObjectType::Blob, b"beta".to_vec()),
        ];
        let (pack, index) = encode_pack_with_index(&entries).unwrap();
        let trailer_start = pack.len() - 20;
        for (i, ie) in index.iter().enumerate() {
            let end = if i + 1 < index.len() {
                index[i + 1].offset as usize
            } else {
                trailer_start
            };
            let mut crc = crc32fast::Hasher::new();
            crc.update(&pack[ie.offset as usize..end]);
            assert_eq!(crc.finalize(), ie.crc32);
        }
    }
}
