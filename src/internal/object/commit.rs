//! The Commit object: a tree snapshot, zero or more parents, author and
//! committer signatures, and a free-form message.

use std::fmt::Display;
use std::str::FromStr;

use bstr::ByteSlice;
use serde::{Deserialize, Serialize};

use crate::{
    errors::GitError,
    hash::ObjectHash,
    internal::object::{ObjectTrait, signature::Signature, types::ObjectType},
};

#[derive(Eq, Debug, Clone, Serialize, Deserialize)]
pub struct Commit {
    pub id: ObjectHash,
    pub tree_id: ObjectHash,
    pub parent_ids: Vec<ObjectHash>,
    pub author: Signature,
    pub committer: Signature,
    pub message: String,
}

impl PartialEq for Commit {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Display for Commit {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        writeln!(f, "tree: {}", self.tree_id)?;
        for parent in self.parent_ids.iter() {
            writeln!(f, "parent: {parent}")?;
        }
        writeln!(f, "author {}", self.author)?;
        writeln!(f, "committer {}", self.committer)?;
        writeln!(f, "{}", self.message)
    }
}

impl Commit {
    pub fn new(
        author: Signature,
        committer: Signature,
        tree_id: ObjectHash,
        parent_ids: Vec<ObjectHash>,
        message: &str,
    ) -> Commit {
        let mut commit = Commit {
            id: ObjectHash::default(),
            tree_id,
            parent_ids,
            author,
            committer,
            message: message.to_string(),
        };
        commit.id = ObjectHash::from_type_and_data(ObjectType::Commit, &commit.to_data().unwrap());
        commit
    }

    /// First meaningful subject line of the message, skipping an embedded
    /// PGP signature block if present.
    pub fn subject(&self) -> String {
        if let Some(pos) = self
            .message
            .lines()
            .position(|line| line.contains("-----END PGP SIGNATURE-----"))
        {
            return self
                .message
                .lines()
                .skip(pos + 1)
                .find(|line| !line.trim().is_empty())
                .map(|line| line.to_owned())
                .unwrap_or_else(|| self.message.clone());
        }
        self.message
            .lines()
            .find(|line| !line.trim().is_empty())
            .map(|line| line.to_owned())
            .unwrap_or_else(|| self.message.clone())
    }
}

impl ObjectTrait for Commit {
    fn from_bytes(data: &[u8], hash: ObjectHash) -> Result<Self, GitError> {
        let malformed = |msg: &str| GitError::InvalidObject {
            kind: "commit",
            msg: msg.to_string(),
        };

        let mut rest = data;
        let tree_end = rest.find_byte(0x0a).ok_or_else(|| malformed("no tree line"))?;
        if !rest.starts_with(b"tree ") {
            return Err(malformed("missing tree header"));
        }
        let tree_id = ObjectHash::from_str(
            std::str::from_utf8(&rest[5..tree_end])
                .map_err(|e| GitError::Conversion(e.to_string()))?,
        )?;
        rest = &rest[tree_end + 1..];

        let mut parent_ids = Vec::new();
        while rest.starts_with(b"parent ") {
            let end = rest.find_byte(0x0a).ok_or_else(|| malformed("unterminated parent"))?;
            parent_ids.push(ObjectHash::from_str(
                std::str::from_utf8(&rest[7..end])
                    .map_err(|e| GitError::Conversion(e.to_string()))?,
            )?);
            rest = &rest[end + 1..];
        }

        let author_end = rest.find_byte(0x0a).ok_or_else(|| malformed("no author line"))?;
        let author = Signature::from_data(&rest[..author_end])?;
        rest = &rest[author_end + 1..];

        let committer_end = rest.find_byte(0x0a).ok_or_else(|| malformed("no committer line"))?;
        let committer = Signature::from_data(&rest[..committer_end])?;
        rest = &rest[committer_end + 1..];

        // Everything after the committer line (including gpgsig headers and
        // the blank separator) is kept verbatim as the message so that
        // re-serialization is byte-identical and the id verifies.
        let message = rest.to_str_lossy().to_string();

        Ok(Commit {
            id: hash,
            tree_id,
            parent_ids,
            author,
            committer,
            message,
        })
    }

    fn object_type(&self) -> ObjectType {
        ObjectType::Commit
    }

    fn to_data(&self) -> Result<Vec<u8>, GitError> {
        let mut data = Vec::new();

        data.extend(b"tree ");
        data.extend(self.tree_id.to_string().as_bytes());
        data.push(0x0a);

        for parent in &self.parent_ids {
            data.extend(b"parent ");
            data.extend(parent.to_string().as_bytes());
            data.push(0x0a);
        }

        data.extend(self.author.to_data()?);
        data.push(0x0a);
        data.extend(self.committer.to_data()?);
        data.push(0x0a);
        data.extend(self.message.as_bytes());

        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::internal::object::signature::SignatureRole;

    fn sig(role: SignatureRole) -> Signature {
        Signature {
            role,
            name: "tester".to_string(),
            email: "tester@example.com".to_string(),
            timestamp: 1_700_000_000,
            timezone: "+0000".to_string(),
        }
    }

    /// A freshly built commit verifies against its own serialization.
    #[test]
    fn new_commit_id_verifies() {
        let tree_id = ObjectHash::new(b"tree");
        let commit = Commit::new(
            sig(SignatureRole::Author),
            sig(SignatureRole::Committer),
            tree_id,
            vec![],
            "\ninitial commit\n",
        );
        let recomputed =
            ObjectHash::from_type_and_data(ObjectType::Commit, &commit.to_data().unwrap());
        assert_eq!(commit.id, recomputed);
    }

    /// Parse reproduces tree, parents, and signatures; serialization is
    /// byte-identical.
    #[test]
    fn parse_round_trip_with_parents() {
        let tree_id = ObjectHash::new(b"t");
        let parent = Commit::new(
            sig(SignatureRole::Author),
            sig(SignatureRole::Committer),
            tree_id,
            vec![],
            "\nroot\n",
        );
        let child = Commit::new(
            sig(SignatureRole::Author),
            sig(SignatureRole::Committer),
            tree_id,
            vec![parent.id],
            "\nchild\n",
        );

        let data = child.to_data().unwrap();
        let parsed = Commit::from_bytes(&data, child.id).unwrap();
        assert_eq!(parsed.tree_id, tree_id);
        assert_eq!(parsed.parent_ids, vec![parent.id]);
        assert_eq!(parsed.author.name, "tester");
        assert_eq!(parsed.to_data().unwrap(), data);
    }

    /// subject() returns the first non-empty message line.
    #[test]
    fn subject_skips_blank_lines() {
        let commit = Commit::new(
            sig(SignatureRole::Author),
            sig(SignatureRole::Committer),
            ObjectHash::new(b"t"),
            vec![],
            "\nfix: handle empty packs\n\ndetails\n",
        );
        assert_eq!(commit.subject(), "fix: handle empty packs");
    }

    /// A payload without a tree header is rejected.
    #[test]
    fn reject_missing_tree() {
        let err = Commit::from_bytes(b"author x <x@y> 1 +0000\n", ObjectHash::default());
        assert!(err.is_err());
    }
}
