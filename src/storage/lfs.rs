//! LFS pointer grammar and content-addressable key derivation for the raw
//! blob overflow and the LFS payload bucket.

use crate::hash::ObjectHash;

/// Version line every LFS pointer begins with.
pub const LFS_VERSION_LINE: &str = "version https://git-lfs.github.com/spec/v1";

/// A parsed LFS pointer file. The Git object stays this small pointer; the
/// payload lives in the bucket under the oid-derived key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LfsPointer {
    pub oid: String,
    pub size: u64,
}

impl LfsPointer {
    /// Strict parse of the pointer grammar:
    ///
    /// ```text
    /// version https://git-lfs.github.com/spec/v1\n
    /// oid sha256:<64 lowercase hex>\n
    /// size <decimal>\n
    /// ```
    ///
    /// Anything else (extra lines, uppercase hex, missing trailing
    /// newline) is not a pointer and is stored as a plain blob. A lax
    /// parser here would silently route corrupted pointers down the LFS
    /// path.
    pub fn parse(data: &[u8]) -> Option<LfsPointer> {
        let text = std::str::from_utf8(data).ok()?;
        let mut lines = text.split_inclusive('\n');

        let version = lines.next()?;
        if version.strip_suffix('\n')? != LFS_VERSION_LINE {
            return None;
        }

        let oid_line = lines.next()?.strip_suffix('\n')?;
        let oid = oid_line.strip_prefix("oid sha256:")?;
        if oid.len() != 64 || !oid.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        {
            return None;
        }

        let size_line = lines.next()?.strip_suffix('\n')?;
        let size = size_line.strip_prefix("size ")?.parse::<u64>().ok()?;

        if lines.next().is_some() {
            return None;
        }
        Some(LfsPointer {
            oid: oid.to_string(),
            size,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        format!("{LFS_VERSION_LINE}\noid sha256:{}\nsize {}\n", self.oid, self.size).into_bytes()
    }

    /// Bucket key of the LFS payload: `<prefix>/lfs/<oid[0..2]>/<oid[2..]>`.
    pub fn content_key(&self, prefix: &str) -> String {
        lfs_key(prefix, &self.oid)
    }
}

/// Bucket key for an LFS oid.
pub fn lfs_key(prefix: &str, oid: &str) -> String {
    format!("{prefix}/lfs/{}/{}", &oid[0..2], &oid[2..])
}

/// Bucket key of an external (oversized) Git object:
/// `<prefix>/raw/<h[0..2]>/<h[2..]>`.
pub fn raw_key(prefix: &str, hash: &ObjectHash) -> String {
    let hex = hash.to_hex();
    format!("{prefix}/raw/{}/{}", &hex[0..2], &hex[2..])
}

/// Bucket key of a tablet.
pub fn tablet_bucket_key(prefix: &str, tablet_key: &str) -> String {
    format!("{prefix}/objects/{tablet_key}.tbl")
}

/// Bucket key of a super-chunk.
pub fn chunk_bucket_key(prefix: &str, chunk_id: &str) -> String {
    format!("{prefix}/chunks/{chunk_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    const OID: &str = "6c17f2a25ea60d2e51b9a286b29b9a775ad8c2e48c5391e69de29bb2d1d64348";

    /// A canonical pointer parses and round-trips.
    #[test]
    fn parse_canonical_pointer() {
        let raw = format!("{LFS_VERSION_LINE}\noid sha256:{OID}\nsize 12345\n");
        let ptr = LfsPointer::parse(raw.as_bytes()).unwrap();
        assert_eq!(ptr.oid, OID);
        assert_eq!(ptr.size, 12345);
        assert_eq!(ptr.to_bytes(), raw.as_bytes());
    }

    /// Inputs that merely begin with the version line are not pointers.
    #[test]
    fn strict_rejections() {
        // missing trailing newline
        let no_newline = format!("{LFS_VERSION_LINE}\noid sha256:{OID}\nsize 1");
        assert!(LfsPointer::parse(no_newline.as_bytes()).is_none());
        // extra line
        let extra = format!("{LFS_VERSION_LINE}\noid sha256:{OID}\nsize 1\nx-custom 1\n");
        assert!(LfsPointer::parse(extra.as_bytes()).is_none());
        // short oid
        let short = format!("{LFS_VERSION_LINE}\noid sha256:abcd\nsize 1\n");
        assert!(LfsPointer::parse(short.as_bytes()).is_none());
        // wrong algorithm
        let sha1 = format!("{LFS_VERSION_LINE}\noid sha1:{}\nsize 1\n", &OID[..40]);
        assert!(LfsPointer::parse(sha1.as_bytes()).is_none());
        // not a pointer at all
        assert!(LfsPointer::parse(b"hello\n").is_none());
    }

    /// Key derivation fans out on the first two hex characters.
    #[test]
    fn key_layout() {
        let ptr = LfsPointer {
            oid: OID.to_string(),
            size: 1,
        };
        assert_eq!(
            ptr.content_key("acme/widgets"),
            format!("acme/widgets/lfs/6c/{}", &OID[2..])
        );
        let h: ObjectHash = "ce013625030ba8dba906f756967f9e9ca394464a".parse().unwrap();
        assert_eq!(
            raw_key("acme/widgets", &h),
            "acme/widgets/raw/ce/013625030ba8dba906f756967f9e9ca394464a"
        );
        assert_eq!(
            tablet_bucket_key("r", "deadbeef"),
            "r/objects/deadbeef.tbl"
        );
    }
}
